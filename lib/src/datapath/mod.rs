//! Frame pipeline
//!
//! [`DataPath`] owns every working buffer and drives the four processing
//! stages:
//!  - range: windowed range FFT of each chirp, stored in the radar cube
//!  - Doppler: per range bin Doppler FFTs and the detection matrix
//!  - detection: range-direction CFAR and peak grouping
//!  - angle: direction of arrival of each detected object
//!
//! Data moves between the large memory regions and the small working slots
//! through the transfer engine, double buffered: while one slot is being
//! processed the transfer into the other slot is already in flight.
//!
//! Any error is fatal. The pipeline logs it and answers every later call
//! with [`PipelineError::Halted`].
use ndarray::Array2;
use std::sync::MutexGuard;

use crate::compensation::CompensationTables;
use crate::config::{DerivedConfig, DssConfig};
use crate::doppler_lines::DopplerLineMask;
use crate::errors::{ConfigError, PipelineError, TransferError};
use crate::fixed::{Cplx16, Cplx32};
use crate::kernel::{RustFftKernel, TransformKernel};
use crate::memory::{BufferId, MemoryLayout};
use crate::metrics::{FrameMetrics, StageTimer};
use crate::objects::{CandidateObject, DetectedObject, FrameOutput};
use crate::transfer::{new_engine, shared, Channel, Region, SharedBuf, TransferEngine, TransferParams};
use crate::window::{generate_window_q15, generate_window_q19, WindowKind};

mod angle;
mod detection;
mod doppler;
mod range;

/// Regions reachable by the transfer engine.
///
/// Ping/pong slots are separate regions so that compute can hold one slot
/// while the controller fills the other.
struct Regions {
    adc_data: SharedBuf<Cplx16>,
    adc_in: [SharedBuf<Cplx16>; 2],
    fft_out_1d: [SharedBuf<Cplx16>; 2],
    radar_cube: SharedBuf<Cplx16>,
    /// Doppler stage input, reused by the angle stage
    doppler_in: [SharedBuf<Cplx16>; 2],
    sum_abs: SharedBuf<u16>,
    det_matrix: SharedBuf<u16>,
    sum_abs_range: [SharedBuf<u16>; 2],
}

/// Splits a planned ping/pong buffer into its two halves.
fn ping_pong<T: Clone + Default>(layout: &MemoryLayout, id: BufferId) -> [SharedBuf<T>; 2] {
    let mut ping: Vec<T> = layout.alloc(id);
    let pong = ping.split_off(ping.len() / 2);
    [shared(ping), shared(pong)]
}

fn lock<T>(buf: &SharedBuf<T>) -> Result<MutexGuard<'_, Vec<T>>, PipelineError> {
    buf.lock().map_err(|_| PipelineError::RegionPoisoned)
}

/// Per-frame radar signal processing chain.
pub struct DataPath {
    cfg: DssConfig,
    derived: DerivedConfig,
    layout: MemoryLayout,
    engine: Box<dyn TransferEngine>,
    kernel: Box<dyn TransformKernel>,
    tables: CompensationTables,
    regions: Regions,

    window_1d: Vec<i16>,
    window_2d: Vec<i32>,
    range_scratch: Vec<Cplx16>,
    dc_bins: Vec<usize>,
    dc_range_sig_mean: Vec<Cplx32>,
    dc_calib_counter: usize,

    fft_out_2d: Vec<Cplx32>,
    windowing_buf_2d: Vec<Cplx32>,
    log2_abs: Vec<u16>,
    heatmap: Vec<Cplx16>,
    doppler_lines: DopplerLineMask,
    cfar_index_buf: Vec<usize>,
    candidates: Vec<CandidateObject>,

    azimuth_in: Vec<Cplx32>,
    azimuth_out: Vec<Cplx32>,
    azimuth_mag_sqr: Vec<f32>,
    doa_grid: Option<Array2<Cplx32>>,
    objects: Vec<DetectedObject>,

    chirp_count: usize,
    tx_count: usize,
    doppler_count: usize,
    frame_ready: bool,
    frame_index: u64,
    metrics: FrameMetrics,
    halted: bool,
}

impl DataPath {
    /// Validates `cfg`, plans the memory layout and programs the transfer
    /// channels. Uses the `rustfft` backed transform kernel.
    pub fn new(cfg: DssConfig) -> Result<Self, ConfigError> {
        Self::with_kernel(cfg, Box::new(RustFftKernel::new()))
    }

    pub fn with_kernel(cfg: DssConfig, kernel: Box<dyn TransformKernel>) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let layout = MemoryLayout::for_config(&cfg)?;
        layout.log_stats();
        let derived = DerivedConfig::new(&cfg);

        let regions = Regions {
            adc_data: shared(layout.alloc(BufferId::AdcData)),
            adc_in: ping_pong(&layout, BufferId::AdcIn),
            fft_out_1d: ping_pong(&layout, BufferId::FftOut1D),
            radar_cube: shared(layout.alloc(BufferId::RadarCube)),
            doppler_in: ping_pong(&layout, BufferId::DopplerIn),
            sum_abs: shared(layout.alloc(BufferId::SumAbs)),
            det_matrix: shared(layout.alloc(BufferId::DetMatrix)),
            sum_abs_range: ping_pong(&layout, BufferId::SumAbsRange),
        };

        let nr = cfg.num_range_bins;
        let dc = &cfg.dc_range_sig;
        let dc_bins = if dc.enabled {
            (0..=dc.positive_bin_idx)
                .chain(nr - dc.negative_bin_idx.unsigned_abs()..nr)
                .collect()
        } else {
            Vec::new()
        };

        let doa_grid = Array2::from_shape_vec(
            (cfg.num_angle_bins, cfg.num_angle_bins),
            layout.alloc(BufferId::DoaGrid),
        )
        .ok();

        let mut cfar_index_buf: Vec<usize> = Vec::new();
        cfar_index_buf.reserve_exact(layout.count(BufferId::CfarIndexBuf));

        let mut engine = new_engine(cfg.transfer_mode);
        program_channels(engine.as_mut(), &cfg, &regions)?;

        log::info!(
            "Data path ready: {} rx, {} tx, {} range bins, {} Doppler bins, {} angle bins",
            cfg.num_rx_antennas,
            cfg.num_tx_antennas,
            cfg.num_range_bins,
            cfg.num_doppler_bins,
            cfg.num_angle_bins
        );

        Ok(Self {
            window_1d: generate_window_q15(WindowKind::Blackman, cfg.num_adc_samples),
            window_2d: generate_window_q19(WindowKind::Hanning, cfg.num_doppler_bins),
            range_scratch: layout.alloc(BufferId::RangeFftIn),
            dc_bins,
            dc_range_sig_mean: layout.alloc(BufferId::DcRangeSigMean),
            dc_calib_counter: 0,
            fft_out_2d: layout.alloc(BufferId::FftOut2D),
            windowing_buf_2d: layout.alloc(BufferId::WindowingBuf2D),
            log2_abs: layout.alloc(BufferId::Log2Abs),
            heatmap: layout.alloc(BufferId::Heatmap),
            doppler_lines: DopplerLineMask::with_words(
                layout.alloc(BufferId::DopplerLineMask),
                cfg.num_doppler_bins,
            ),
            cfar_index_buf,
            candidates: Vec::with_capacity(layout.count(BufferId::Candidates)),
            azimuth_in: layout.alloc(BufferId::AzimuthIn),
            azimuth_out: layout.alloc(BufferId::AzimuthOut),
            azimuth_mag_sqr: layout.alloc(BufferId::AzimuthMagSqr),
            doa_grid,
            objects: Vec::with_capacity(layout.count(BufferId::DetectedObjects)),
            chirp_count: 0,
            tx_count: 0,
            doppler_count: 0,
            frame_ready: false,
            frame_index: 0,
            metrics: FrameMetrics::default(),
            halted: false,
            tables: CompensationTables::new(&cfg, layout.alloc(BufferId::DftTable)),
            engine,
            kernel,
            regions,
            layout,
            derived,
            cfg,
        })
    }

    pub fn config(&self) -> &DssConfig {
        &self.cfg
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// Zero-Doppler bin of every virtual antenna, `[range][antenna]`, from
    /// the last processed frame.
    pub fn heatmap(&self) -> &[Cplx16] {
        &self.heatmap
    }

    /// Copy of the `[range][Doppler]` detection matrix of the last frame.
    pub fn detection_matrix(&self) -> Result<Vec<u16>, PipelineError> {
        Ok(lock(&self.regions.det_matrix)?.clone())
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Processes one chirp: `num_rx_antennas` blocks of `num_adc_samples`
    /// samples each.
    pub fn process_chirp(&mut self, samples: &[Cplx16]) -> Result<(), PipelineError> {
        self.guarded(|dp| dp.chirp(samples))
    }

    /// Blocks until the range results of the last chirps reached the radar
    /// cube.
    pub fn wait_end_of_chirps(&mut self) -> Result<(), PipelineError> {
        self.guarded(|dp| dp.drain_range_out())
    }

    /// Runs the Doppler, detection and angle stages on the chirps of the
    /// current frame.
    pub fn process_frame(&mut self) -> Result<FrameOutput, PipelineError> {
        self.guarded(|dp| dp.frame())
    }

    fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, PipelineError>) -> Result<T, PipelineError> {
        if self.halted {
            return Err(PipelineError::Halted);
        }
        let out = f(self);
        if let Err(e) = &out {
            log::error!("Data path halted: {}", e);
            self.halted = true;
        }
        out
    }

    fn frame(&mut self) -> Result<FrameOutput, PipelineError> {
        if !self.frame_ready {
            return Err(PipelineError::IncompleteFrame {
                received: self.metrics.chirps,
                expected: self.derived.chirps_per_frame,
            });
        }
        self.drain_range_out()?;

        let mut timer = StageTimer::start();
        self.doppler_stage(&mut timer)?;
        self.detection_stage(&mut timer)?;
        self.angle_stage(&mut timer)?;
        let (processing, waiting) = timer.finish();

        self.metrics.inter_frame_processing = processing;
        self.metrics.inter_frame_wait = waiting;
        self.metrics.detected_objects = self.objects.len();
        self.frame_ready = false;

        let output = FrameOutput {
            frame_index: self.frame_index,
            objects: self.objects.clone(),
            metrics: self.metrics,
        };
        log::debug!(
            "Frame {}: {} Doppler lines, {} candidates, {} objects",
            self.frame_index,
            self.metrics.active_doppler_lines,
            self.metrics.raw_candidates,
            self.metrics.detected_objects
        );
        self.frame_index += 1;
        Ok(output)
    }

    /// Offset of `(tx slot, rx antenna, range bin)` in the radar cube of the
    /// first Doppler chirp. Consecutive chirps are `num_rx * num_range_bins`
    /// apart.
    fn cube_offset(&self, tx: usize, rx: usize, range: usize) -> usize {
        let nr = self.cfg.num_range_bins;
        let num_rx = self.cfg.num_rx_antennas;
        tx * self.cfg.num_doppler_bins * num_rx * nr + rx * nr + range
    }

    /// Splits virtual antenna `v` in processing order into `(tx, rx)`.
    ///
    /// With two transmitters the antennas of both slots alternate, so that
    /// ping always carries the first and pong the second slot.
    fn antenna_slot(&self, v: usize) -> (usize, usize) {
        let num_tx = self.cfg.num_tx_antennas;
        (v % num_tx, v / num_tx)
    }
}

/// Programs every channel once; stages only re-target offsets afterwards.
fn program_channels(
    engine: &mut dyn TransferEngine,
    cfg: &DssConfig,
    regions: &Regions,
) -> Result<(), TransferError> {
    let nr = cfg.num_range_bins;
    let nd = cfg.num_doppler_bins;
    let num_rx = cfg.num_rx_antennas;

    for pp in 0..2 {
        engine.configure(
            Channel::RANGE_IN[pp],
            TransferParams::contiguous(
                Region::Cplx16(regions.adc_data.clone()),
                0,
                Region::Cplx16(regions.adc_in[pp].clone()),
                0,
                cfg.num_adc_samples,
            ),
        )?;
        engine.configure(
            Channel::RANGE_OUT[pp],
            TransferParams::contiguous(
                Region::Cplx16(regions.fft_out_1d[pp].clone()),
                0,
                Region::Cplx16(regions.radar_cube.clone()),
                0,
                num_rx * nr,
            ),
        )?;

        let column = TransferParams {
            src: Region::Cplx16(regions.radar_cube.clone()),
            src_offset: 0,
            dst: Region::Cplx16(regions.doppler_in[pp].clone()),
            dst_offset: 0,
            elems_per_block: 1,
            num_blocks: nd,
            src_block_stride: num_rx * nr,
            dst_block_stride: 1,
        };
        engine.configure(Channel::DOPPLER_IN[pp], column.clone())?;
        engine.configure(Channel::ANGLE_IN[pp], column)?;

        engine.configure(
            Channel::DET_MATRIX_IN[pp],
            TransferParams {
                src: Region::Word(regions.det_matrix.clone()),
                src_offset: 0,
                dst: Region::Word(regions.sum_abs_range[pp].clone()),
                dst_offset: 0,
                elems_per_block: 1,
                num_blocks: nr,
                src_block_stride: nd,
                dst_block_stride: 1,
            },
        )?;
    }
    engine.configure(
        Channel::DetMatrixOut,
        TransferParams::contiguous(
            Region::Word(regions.sum_abs.clone()),
            0,
            Region::Word(regions.det_matrix.clone()),
            0,
            nd,
        ),
    )
}
