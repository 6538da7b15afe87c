//! Error types used by this lib.
use thiserror::Error;

use crate::memory::Tier;
use crate::transfer::Channel;

/// Errors detected while validating a configuration.
///
/// All of these are fatal: a [`crate::DataPath`] is never constructed from a
/// configuration that produces one.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be a power of two (given: {value})")]
    NotPowerOfTwo { name: &'static str, value: usize },
    #[error("Unsupported antenna config: tx: {num_tx}, rx: {num_rx}")]
    InvalidAntennaConfig { num_tx: usize, num_rx: usize },
    #[error("Range FFT size {range_bins} is smaller than the number of ADC samples {adc_samples}")]
    RangeBinsBelowSamples {
        range_bins: usize,
        adc_samples: usize,
    },
    #[error("Number of ADC samples must be even (given: {value})")]
    OddSampleCount { value: usize },
    #[error("Feature '{first}' cannot be combined with '{second}'")]
    IncompatibleFeatures {
        first: &'static str,
        second: &'static str,
    },
    #[error("Feature '{feature}' requires two transmit antennas")]
    RequiresTwoTx { feature: &'static str },
    #[error("CFAR window of {required} cells does not fit an axis of {available} bins ({axis})")]
    CfarWindowTooLong {
        axis: &'static str,
        required: usize,
        available: usize,
    },
    #[error("Invalid range window: min {min}, max {max} (range bins: {num_range_bins})")]
    InvalidRangeWindow {
        min: usize,
        max: usize,
        num_range_bins: usize,
    },
    #[error("Invalid DC calibration band: {reason}")]
    InvalidDcCalibration { reason: &'static str },
    #[error("Bias table has {given} entries, expected one per virtual antenna ({expected})")]
    BiasTableLength { given: usize, expected: usize },
    #[error("Antenna layout places {given} antennas, expected {expected}")]
    LayoutMismatch { given: usize, expected: usize },
    #[error("Antenna layout cell ({row}, {col}) lies outside the {size}x{size} angle grid")]
    LayoutOutOfGrid { row: usize, col: usize, size: usize },
    #[error("Buffer alignment {align} is not a power of two")]
    InvalidAlignment { align: usize },
    #[error("Memory tier {tier:?} overcommitted: {required} bytes required, capacity {capacity}")]
    ArenaOverflow {
        tier: Tier,
        required: usize,
        capacity: usize,
    },
    #[error("{name} must not be zero")]
    Zero { name: &'static str },
    #[error("Transfer channel setup failed: {0}")]
    ChannelSetup(#[from] TransferError),
}

/// Errors raised by the transfer engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransferError {
    #[error("Transfer on channel {channel:?} faulted: {reason}")]
    Fault {
        channel: Channel,
        reason: &'static str,
    },
    #[error("Channel {channel:?} started while a transfer is still in flight")]
    ChannelBusy { channel: Channel },
    #[error("Channel {channel:?} was used before being configured")]
    Unconfigured { channel: Channel },
    #[error("Transfer on channel {channel:?} reaches element {end} of a region of {len}")]
    OutOfBounds {
        channel: Channel,
        end: usize,
        len: usize,
    },
    #[error("Channel {channel:?} connects regions of different element types")]
    TypeMismatch { channel: Channel },
    #[error("Transfer controller is no longer running")]
    ControllerStopped,
}

/// Fatal errors of the frame pipeline.
///
/// Once one of these has been returned the pipeline is halted and every
/// further call reports [`PipelineError::Halted`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Transfer failure: {0}")]
    Transfer(#[from] TransferError),
    #[error("Doppler line cursor ran past the last flagged line (cursor: {cursor}, bins: {num_bins})")]
    DopplerLineOverrun { cursor: usize, num_bins: usize },
    #[error("Chirp carries {given} samples, expected {expected}")]
    ChirpLength { given: usize, expected: usize },
    #[error("Frame processing started after {received} of {expected} chirps")]
    IncompleteFrame { received: usize, expected: usize },
    #[error("Shared memory region poisoned by a panicking thread")]
    RegionPoisoned,
    #[error("Pipeline is halted after a fatal error")]
    Halted,
    #[error("Object sink disconnected; frame {frame_index} was not delivered")]
    SinkClosed { frame_index: u64 },
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[cfg(feature = "parquet")]
    #[error("Error in writing parquet file: {0}")]
    Parquet(String),
    #[error("IO error in file persistence: {0}")]
    Io(#[from] std::io::Error),
}
