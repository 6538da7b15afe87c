use mmdss_lib::{
    AngleMode, DataPath, DetectionFile, DssConfig, FrameRunner, MemoryLayout, ObjectSink, Scenario,
};

use std::error::Error;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::cli::{ChainArgs, SimulateArgs};

/// Builds the processing chain configuration from command line arguments.
fn build_config(args: &ChainArgs) -> DssConfig {
    let mut cfg = DssConfig::with_antennas(args.num_tx, args.num_rx);
    cfg.num_adc_samples = args.adc_samples;
    cfg.num_range_bins = args
        .range_bins
        .unwrap_or_else(|| args.adc_samples.next_power_of_two());
    cfg.num_doppler_bins = args.doppler_bins;
    cfg.num_angle_bins = args.angle_bins;
    cfg.range_resolution_m = args.range_resolution;
    cfg.bpm_enabled = args.bpm;
    cfg.extended_max_velocity = args.extended_velocity;
    cfg.clutter_removal = args.clutter_removal;
    cfg.peak_grouping.scheme = args.grouping;
    cfg.peak_grouping.max_range_idx = cfg
        .peak_grouping
        .max_range_idx
        .min(cfg.num_range_bins.saturating_sub(2));
    cfg.transfer_mode = args.transfer_mode;
    if args.azimuth_only {
        cfg.angle_mode = AngleMode::Azimuth;
    }
    cfg
}

pub fn run_simulation(args: SimulateArgs) -> Result<(), Box<dyn Error>> {
    let SimulateArgs {
        chain,
        targets,
        noise,
        seed,
        frames,
        out,
        format,
        print,
    } = args;

    let cfg = build_config(&chain);
    let datapath = DataPath::new(cfg.clone())?;
    let source = Scenario::new(&cfg, targets)
        .with_noise(noise, seed)
        .into_source(frames);

    // Set up the `running` flag for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);

    // Set up CTRL+C handler for graceful shutdown
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut runner = FrameRunner::new(datapath, source);
    if let Some(out_path) = out {
        runner.subscribe(ObjectSink::File(DetectionFile {
            file_path: out_path,
            file_type: format,
        }));
    }

    runner.start(print);

    // Wait for CTRL+C or the end of the scenario
    while running.load(Ordering::SeqCst) && runner.is_running() {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    if !running.load(Ordering::SeqCst) {
        println!("Shutting down gracefully...");
    }
    let summary = runner.stop();
    println!(
        "Processed {} frames, {} objects detected",
        summary.frames, summary.objects
    );

    match summary.error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

pub fn plan_memory(args: ChainArgs) -> Result<(), Box<dyn Error>> {
    let cfg = build_config(&args);
    cfg.validate()?;
    let layout = MemoryLayout::for_config(&cfg)?;

    println!("{:<18} {:<4} {:>10} {:>10} {:>8}", "buffer", "tier", "offset", "bytes", "count");
    for p in layout.placements() {
        println!(
            "{:<18} {:<4} {:>#10x} {:>10} {:>8}",
            format!("{:?}", p.id),
            format!("{:?}", p.tier),
            p.offset,
            p.len_bytes,
            p.count
        );
    }
    for u in layout.usage() {
        println!(
            "{:?}: {} of {} bytes used ({} free)",
            u.tier,
            u.used,
            u.capacity,
            u.capacity - u.used
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    use crate::cli::{Cli, Commands};

    fn chain(extra: &[&str]) -> ChainArgs {
        let mut argv = vec!["mmdss", "plan-memory"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::PlanMemory(args) => args,
            _ => panic!("expected plan-memory"),
        }
    }

    #[test]
    fn test_default_chain_is_valid() {
        let cfg = build_config(&chain(&[]));
        assert!(cfg.validate().is_ok());
        assert!(matches!(cfg.angle_mode, AngleMode::AzimuthElevation(_)));
    }

    #[test]
    fn test_small_range_fft_keeps_grouping_in_bounds() {
        let cfg = build_config(&chain(&["--adc-samples", "60", "--azimuth-only"]));
        assert_eq!(cfg.num_range_bins, 64);
        assert_eq!(cfg.peak_grouping.max_range_idx, 62);
        assert!(matches!(cfg.angle_mode, AngleMode::Azimuth));
        assert!(cfg.validate().is_ok());
    }
}
