use clap::{Args, Parser, Subcommand};
use mmdss_lib::{FileType, PeakGroupingScheme, Target, TransferMode};
use simplelog::LevelFilter;
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about, long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Log level for output (error, warn, info, debug, trace)
    #[arg(global = true, long, default_value = "info", value_enum)]
    pub loglevel: LevelFilter,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline on synthetic chirps of point targets
    Simulate(SimulateArgs),

    /// Print the buffer placement for a configuration
    PlanMemory(ChainArgs),
}

/// Processing chain parameters
#[derive(Args, Clone)]
pub struct ChainArgs {
    /// Number of transmit antennas (1 or 2)
    #[arg(long, default_value = "2")]
    pub num_tx: usize,

    /// Number of receive antennas (1 to 4)
    #[arg(long, default_value = "4")]
    pub num_rx: usize,

    /// ADC samples per chirp
    #[arg(long, default_value = "256")]
    pub adc_samples: usize,

    /// Range FFT size, at least the number of ADC samples
    #[arg(long)]
    pub range_bins: Option<usize>,

    #[arg(long, default_value = "16")]
    pub doppler_bins: usize,

    #[arg(long, default_value = "64")]
    pub angle_bins: usize,

    /// Range resolution in meters per bin
    #[arg(long, default_value = "0.044")]
    pub range_resolution: f32,

    /// Transmit with binary phase modulation instead of time multiplexing
    #[arg(long, default_value = "false")]
    pub bpm: bool,

    /// Resolve Doppler ambiguity from the transmit phase offset
    #[arg(long, default_value = "false")]
    pub extended_velocity: bool,

    /// Subtract the mean over chirps before the Doppler FFT
    #[arg(long, default_value = "false")]
    pub clutter_removal: bool,

    /// Peak grouping scheme, 'matrix' or 'list'
    #[arg(long, default_value = "matrix")]
    pub grouping: PeakGroupingScheme,

    /// Transfer completion mode, 'polling' or 'callback'
    #[arg(long, default_value = "polling")]
    pub transfer_mode: TransferMode,

    /// Restrict the angle estimation to azimuth even for a 2D array
    #[arg(long, default_value = "false")]
    pub azimuth_only: bool,
}

#[derive(Args)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub chain: ChainArgs,

    /// Target as 'range_bin:doppler_bin[:azimuth_deg[:elevation_deg]]'.
    /// May be repeated.
    #[arg(short, long = "target", value_parser = parse_target, required = true)]
    pub targets: Vec<Target>,

    /// Standard deviation of the receiver noise per I/Q component
    #[arg(long, default_value = "20.0")]
    pub noise: f64,

    #[arg(long, default_value = "0")]
    pub seed: u64,

    /// Number of frames to process. Runs until Ctrl-C if omitted.
    #[arg(long)]
    pub frames: Option<u64>,

    /// Output file for detected objects
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Specify output format, e.g., 'parquet'
    #[arg(long, default_value = "parquet")]
    pub format: FileType,

    /// Whether to print detected objects
    #[arg(long, default_value = "false")]
    pub print: bool,
}

fn parse_target(s: &str) -> Result<Target, String> {
    let fields = s
        .split(':')
        .map(|f| f.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("Invalid target '{}': {}", s, e))?;

    match fields[..] {
        [r, d] => Ok(Target::new(r, d)),
        [r, d, az] => Ok(Target::new(r, d).with_azimuth(az)),
        [r, d, az, el] => Ok(Target::new(r, d).with_azimuth(az).with_elevation(el)),
        _ => Err(format!(
            "Invalid target '{}': expected range:doppler[:azimuth[:elevation]]",
            s
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        let t = parse_target("20:-3:15.5").unwrap();
        assert_eq!((t.range_bin, t.doppler_bin, t.azimuth_deg, t.elevation_deg), (20.0, -3.0, 15.5, 0.0));
        assert!(parse_target("20").is_err());
        assert!(parse_target("20:x").is_err());
        assert!(parse_target("1:2:3:4:5").is_err());
    }

    #[test]
    fn test_cli_parses_simulate() {
        let cli = Cli::try_parse_from([
            "mmdss", "simulate", "--target", "20:3:10", "--target", "40:-2", "--frames", "5",
            "--num-tx", "1", "--grouping", "list",
        ])
        .unwrap();
        let Commands::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.targets.len(), 2);
        assert_eq!(args.frames, Some(5));
        assert_eq!(args.chain.num_tx, 1);
        assert_eq!(args.chain.grouping, PeakGroupingScheme::CandidateList);
    }
}
