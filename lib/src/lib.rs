mod cfar;
mod compensation;
mod config;
mod datapath;
mod doa;
mod doppler_lines;
mod errors;
mod fixed;
mod grouping;
mod kernel;
mod memory;
mod metrics;
mod objects;
mod persistence;
mod scenario;
mod stream;
mod transfer;
mod window;

// Public re-export
pub use crate::config::{
    AngleMode, AntennaLayout, ArenaCapacities, CfarAveraging, CfarConfig, DcRangeSigConfig, DerivedConfig,
    DopplerSampling, DssConfig, MultiObjectConfig, NearFieldConfig, PeakGroupingConfig, PeakGroupingScheme,
    TransferMode, MAX_DETECTED_OBJECTS, MAX_RAW_CANDIDATES,
};
pub use crate::datapath::DataPath;
pub use crate::errors::{ConfigError, PersistenceError, PipelineError, TransferError};
pub use crate::fixed::{Cplx16, Cplx32};
pub use crate::kernel::{RustFftKernel, TransformKernel};
pub use crate::memory::{BufferId, MemoryLayout, Placement, Tier, TierUsage};
pub use crate::metrics::FrameMetrics;
pub use crate::objects::{CandidateObject, DetectedObject, DoaState, FrameOutput};
pub use crate::persistence::{DetectionFile, FileType, Writer};
pub use crate::scenario::{Scenario, ScenarioSource, Target};
pub use crate::stream::{ChirpSource, FrameRunner, FrontEndEvent, ObjectSink, RunSummary, SourcePoll};
pub use crate::transfer::{
    new_engine, CallbackDma, Channel, PollingDma, Region, SharedBuf, TransferEngine, TransferParams,
};
