mod cli;
mod simulate;

use clap::Parser;
use cli::{Cli, Commands};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use simulate::{plan_memory, run_simulation};

fn main() {
    let cli = Cli::parse();

    TermLogger::init(
        cli.loglevel,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .expect("Failed to initialize logger");

    let result = match cli.command {
        Commands::Simulate(args) => run_simulation(args),
        Commands::PlanMemory(args) => plan_memory(args),
    };

    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
