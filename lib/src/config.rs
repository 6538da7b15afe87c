//! Data path configuration
//!
//! Everything the frame pipeline needs to know about the chirp/frame setup,
//! the detection chain and the enabled calibration features. A configuration
//! is checked once by [`DssConfig::validate`]; every violation is fatal.
use num_complex::Complex;

use crate::errors::ConfigError;
use crate::fixed::Cplx16;

/// Hard cap on the number of objects reported per frame.
pub const MAX_DETECTED_OBJECTS: usize = 100;

/// Hard cap on the number of range-direction CFAR candidates per frame.
pub const MAX_RAW_CANDIDATES: usize = 900;

/// Maximum number of range bins (both sides of DC) covered by DC calibration.
pub const MAX_DC_CALIB_BINS: usize = 32;

/// Averaging mode of the range-direction CFAR detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfarAveraging {
    /// Sum of both noise windows
    CellAveraging,
    /// Smaller of the two noise windows
    SmallestOf,
    /// Greater of the two noise windows
    GreatestOf,
}

impl std::str::FromStr for CfarAveraging {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ca" => Ok(CfarAveraging::CellAveraging),
            "so" => Ok(CfarAveraging::SmallestOf),
            "go" => Ok(CfarAveraging::GreatestOf),
            _ => Err(format!("Invalid CFAR averaging mode: {}", s)),
        }
    }
}

/// Parameters of one CFAR detector.
///
/// Values live in the detection matrix domain, i.e. sums of Q8 log2
/// magnitudes over all virtual antennas. The threshold is additive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CfarConfig {
    pub averaging: CfarAveraging,
    pub threshold_scale: u16,
    pub noise_div_shift: u8,
    pub guard_len: usize,
    pub window_len: usize,
}

impl CfarConfig {
    /// Sets the threshold from a value in dB above the noise floor.
    ///
    /// One dB step corresponds to `256 / 6.02` accumulator units per
    /// virtual antenna.
    pub fn with_threshold_db(mut self, db: f32, num_virtual_antennas: usize) -> Self {
        let per_antenna = db / (20.0 * 2f32.log10()) * 256.0;
        let scale = per_antenna * num_virtual_antennas as f32;
        self.threshold_scale = scale.round().clamp(0.0, u16::MAX as f32) as u16;
        self
    }

    /// Number of cells touched on one side of the cell under test.
    pub fn one_sided_span(&self) -> usize {
        self.guard_len + self.window_len
    }
}

/// Selects which peak grouping algorithm runs after CFAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeakGroupingScheme {
    /// Neighbourhood read from the detection matrix
    DetectionMatrix,
    /// Neighbourhood rebuilt from the candidate list itself
    CandidateList,
}

impl std::str::FromStr for PeakGroupingScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "matrix" => Ok(PeakGroupingScheme::DetectionMatrix),
            "list" => Ok(PeakGroupingScheme::CandidateList),
            _ => Err(format!("Invalid peak grouping scheme: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakGroupingConfig {
    pub scheme: PeakGroupingScheme,
    pub in_range_direction: bool,
    pub in_doppler_direction: bool,
    /// Inclusive lower bound of reported range indices
    pub min_range_idx: usize,
    /// Inclusive upper bound of reported range indices
    pub max_range_idx: usize,
}

/// DC range signature calibration.
///
/// The mean of the first `num_avg_chirps` chirps (per transmit slot) is
/// removed from the bins `0..=positive_bin_idx` and
/// `num_range_bins + negative_bin_idx .. num_range_bins`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DcRangeSigConfig {
    pub enabled: bool,
    pub positive_bin_idx: usize,
    pub negative_bin_idx: isize,
    pub num_avg_chirps: usize,
}

impl DcRangeSigConfig {
    pub fn num_bins(&self) -> usize {
        self.positive_bin_idx + 1 + self.negative_bin_idx.unsigned_abs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearFieldConfig {
    pub enabled: bool,
    pub start_range_idx: usize,
    pub end_range_idx: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultiObjectConfig {
    pub enabled: bool,
    /// Fraction of the first peak the second peak has to exceed
    pub second_peak_threshold: f32,
}

/// Physical placement of the virtual antennas on the 2D angle grid.
///
/// Entry `v` is the `(row, column)` cell of virtual antenna `v`, where
/// virtual antennas are numbered `tx * num_rx + rx`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntennaLayout {
    pub cells: Vec<(usize, usize)>,
}

impl AntennaLayout {
    /// Two transmitters, four receivers; the second half of the receive
    /// array sits one and two rows above the baseline.
    pub fn ods() -> Self {
        Self {
            cells: vec![
                (2, 0),
                (2, 2),
                (1, 2),
                (0, 2),
                (2, 1),
                (2, 3),
                (1, 3),
                (0, 3),
            ],
        }
    }

    /// Number of grid rows that carry at least one antenna.
    pub fn num_rows(&self) -> usize {
        self.cells.iter().map(|(r, _)| r + 1).max().unwrap_or(0)
    }
}

/// How the angle stage resolves direction of arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AngleMode {
    /// Linear array, azimuth only
    Azimuth,
    /// Sparse 2D array, azimuth and elevation
    AzimuthElevation(AntennaLayout),
}

/// How the angle stage extracts one Doppler bin per virtual antenna.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DopplerSampling {
    SingleBinDft,
    FullFft,
}

/// Completion discipline of the transfer engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Polling,
    Callback,
}

impl std::str::FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "polling" => Ok(TransferMode::Polling),
            "callback" => Ok(TransferMode::Callback),
            _ => Err(format!("Invalid transfer mode: {}", s)),
        }
    }
}

/// Byte capacities of the three memory tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaCapacities {
    pub l1: usize,
    pub l2: usize,
    pub l3: usize,
}

impl Default for ArenaCapacities {
    fn default() -> Self {
        Self {
            l1: 16 * 1024,
            l2: 64 * 1024,
            l3: 640 * 1024,
        }
    }
}

/// Complete configuration of the frame pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct DssConfig {
    pub num_rx_antennas: usize,
    pub num_tx_antennas: usize,
    pub num_adc_samples: usize,
    pub num_range_bins: usize,
    /// Chirps per transmit slot per frame
    pub num_doppler_bins: usize,
    pub num_angle_bins: usize,
    pub range_resolution_m: f32,
    pub range_bias_m: f32,
    pub xyz_q_format: u8,

    pub cfar_doppler: CfarConfig,
    pub cfar_range: CfarConfig,
    pub peak_grouping: PeakGroupingConfig,

    pub dc_range_sig: DcRangeSigConfig,
    pub clutter_removal: bool,
    pub bpm_enabled: bool,
    pub extended_max_velocity: bool,
    pub near_field: NearFieldConfig,
    pub multi_object: MultiObjectConfig,
    pub measure_rx_channel_bias: bool,
    /// Q15 phase/gain correction per virtual antenna
    pub rx_channel_comp: Vec<Cplx16>,

    pub angle_mode: AngleMode,
    pub doppler_sampling: DopplerSampling,

    pub max_detected_objects: usize,
    pub max_raw_candidates: usize,
    pub arena: ArenaCapacities,
    pub transfer_mode: TransferMode,
}

impl Default for DssConfig {
    fn default() -> Self {
        Self::with_antennas(2, 4)
    }
}

impl DssConfig {
    /// Default configuration for the given antenna setup.
    ///
    /// The 2D angle mode is selected when the virtual array matches the
    /// default layout, otherwise azimuth only.
    pub fn with_antennas(num_tx: usize, num_rx: usize) -> Self {
        let num_virtual = num_tx * num_rx;
        let angle_mode = if num_virtual == AntennaLayout::ods().cells.len() {
            AngleMode::AzimuthElevation(AntennaLayout::ods())
        } else {
            AngleMode::Azimuth
        };

        Self {
            num_rx_antennas: num_rx,
            num_tx_antennas: num_tx,
            num_adc_samples: 256,
            num_range_bins: 256,
            num_doppler_bins: 16,
            num_angle_bins: 64,
            range_resolution_m: 0.044,
            range_bias_m: 0.0,
            xyz_q_format: 7,
            cfar_doppler: CfarConfig {
                averaging: CfarAveraging::CellAveraging,
                threshold_scale: 0,
                noise_div_shift: 3,
                guard_len: 2,
                window_len: 4,
            }
            .with_threshold_db(15.0, num_virtual),
            cfar_range: CfarConfig {
                averaging: CfarAveraging::CellAveraging,
                threshold_scale: 0,
                noise_div_shift: 4,
                guard_len: 4,
                window_len: 8,
            }
            .with_threshold_db(15.0, num_virtual),
            peak_grouping: PeakGroupingConfig {
                scheme: PeakGroupingScheme::DetectionMatrix,
                in_range_direction: true,
                in_doppler_direction: true,
                min_range_idx: 1,
                max_range_idx: 254,
            },
            dc_range_sig: DcRangeSigConfig {
                enabled: false,
                positive_bin_idx: 8,
                negative_bin_idx: -5,
                num_avg_chirps: 256,
            },
            clutter_removal: false,
            bpm_enabled: false,
            extended_max_velocity: false,
            near_field: NearFieldConfig {
                enabled: false,
                start_range_idx: 0,
                end_range_idx: 0,
            },
            multi_object: MultiObjectConfig {
                enabled: false,
                second_peak_threshold: 0.5,
            },
            measure_rx_channel_bias: false,
            rx_channel_comp: vec![Complex::new(i16::MAX, 0); num_virtual],
            angle_mode,
            doppler_sampling: DopplerSampling::SingleBinDft,
            max_detected_objects: MAX_DETECTED_OBJECTS,
            max_raw_candidates: MAX_RAW_CANDIDATES,
            arena: ArenaCapacities::default(),
            transfer_mode: TransferMode::Polling,
        }
    }

    pub fn num_virtual_antennas(&self) -> usize {
        self.num_rx_antennas * self.num_tx_antennas
    }

    /// Checks the configuration for values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=4).contains(&self.num_rx_antennas) || !(1..=2).contains(&self.num_tx_antennas) {
            return Err(ConfigError::InvalidAntennaConfig {
                num_tx: self.num_tx_antennas,
                num_rx: self.num_rx_antennas,
            });
        }
        if self.num_adc_samples == 0 {
            return Err(ConfigError::Zero {
                name: "num_adc_samples",
            });
        }
        if self.num_adc_samples % 2 != 0 {
            return Err(ConfigError::OddSampleCount {
                value: self.num_adc_samples,
            });
        }
        check_pow2("num_range_bins", self.num_range_bins)?;
        check_pow2("num_doppler_bins", self.num_doppler_bins)?;
        check_pow2("num_angle_bins", self.num_angle_bins)?;
        if self.num_range_bins < self.num_adc_samples {
            return Err(ConfigError::RangeBinsBelowSamples {
                range_bins: self.num_range_bins,
                adc_samples: self.num_adc_samples,
            });
        }
        if self.max_detected_objects == 0 {
            return Err(ConfigError::Zero {
                name: "max_detected_objects",
            });
        }
        if self.max_raw_candidates == 0 {
            return Err(ConfigError::Zero {
                name: "max_raw_candidates",
            });
        }

        self.check_features()?;
        self.check_cfar()?;
        self.check_dc_calibration()?;

        let pg = &self.peak_grouping;
        if pg.min_range_idx > pg.max_range_idx || pg.max_range_idx >= self.num_range_bins {
            return Err(ConfigError::InvalidRangeWindow {
                min: pg.min_range_idx,
                max: pg.max_range_idx,
                num_range_bins: self.num_range_bins,
            });
        }

        let num_virtual = self.num_virtual_antennas();
        if self.rx_channel_comp.len() != num_virtual {
            return Err(ConfigError::BiasTableLength {
                given: self.rx_channel_comp.len(),
                expected: num_virtual,
            });
        }
        if self.num_angle_bins < num_virtual {
            return Err(ConfigError::LayoutMismatch {
                given: num_virtual,
                expected: self.num_angle_bins,
            });
        }
        if let AngleMode::AzimuthElevation(layout) = &self.angle_mode {
            if layout.cells.len() != num_virtual {
                return Err(ConfigError::LayoutMismatch {
                    given: layout.cells.len(),
                    expected: num_virtual,
                });
            }
            if let Some(&(row, col)) = layout
                .cells
                .iter()
                .find(|(r, c)| *r >= self.num_angle_bins || *c >= self.num_angle_bins)
            {
                return Err(ConfigError::LayoutOutOfGrid {
                    row,
                    col,
                    size: self.num_angle_bins,
                });
            }
        }

        Ok(())
    }

    fn check_features(&self) -> Result<(), ConfigError> {
        if self.extended_max_velocity {
            if self.multi_object.enabled {
                return Err(ConfigError::IncompatibleFeatures {
                    first: "extended maximum velocity",
                    second: "multi object beamforming",
                });
            }
            if self.near_field.enabled {
                return Err(ConfigError::IncompatibleFeatures {
                    first: "extended maximum velocity",
                    second: "near field correction",
                });
            }
            if self.num_tx_antennas == 1 {
                return Err(ConfigError::RequiresTwoTx {
                    feature: "extended maximum velocity",
                });
            }
        }
        if self.bpm_enabled && self.num_tx_antennas != 2 {
            return Err(ConfigError::RequiresTwoTx { feature: "BPM" });
        }
        if self.near_field.enabled && self.num_tx_antennas != 2 {
            return Err(ConfigError::RequiresTwoTx {
                feature: "near field correction",
            });
        }
        Ok(())
    }

    fn check_cfar(&self) -> Result<(), ConfigError> {
        // The Doppler axis wraps, so both windows must stay clear of the cell
        // under test.
        let required = 2 * self.cfar_doppler.one_sided_span() + 1;
        if required > self.num_doppler_bins {
            return Err(ConfigError::CfarWindowTooLong {
                axis: "doppler",
                required,
                available: self.num_doppler_bins,
            });
        }
        let required = 2 * self.cfar_range.one_sided_span() + 1;
        if required > self.num_range_bins {
            return Err(ConfigError::CfarWindowTooLong {
                axis: "range",
                required,
                available: self.num_range_bins,
            });
        }
        if self.cfar_doppler.window_len == 0 || self.cfar_range.window_len == 0 {
            return Err(ConfigError::Zero {
                name: "cfar window_len",
            });
        }
        Ok(())
    }

    fn check_dc_calibration(&self) -> Result<(), ConfigError> {
        let dc = &self.dc_range_sig;
        if !dc.enabled {
            return Ok(());
        }
        check_pow2("dc num_avg_chirps", dc.num_avg_chirps)?;
        if dc.negative_bin_idx > 0 {
            return Err(ConfigError::InvalidDcCalibration {
                reason: "negative bin index must not be positive",
            });
        }
        if dc.positive_bin_idx >= self.num_range_bins / 2
            || dc.negative_bin_idx.unsigned_abs() > self.num_range_bins / 2
        {
            return Err(ConfigError::InvalidDcCalibration {
                reason: "band exceeds half of the range spectrum",
            });
        }
        if dc.num_bins() > MAX_DC_CALIB_BINS {
            return Err(ConfigError::InvalidDcCalibration {
                reason: "too many calibration bins",
            });
        }
        Ok(())
    }
}

fn check_pow2(name: &'static str, value: usize) -> Result<(), ConfigError> {
    if value.is_power_of_two() {
        Ok(())
    } else {
        Err(ConfigError::NotPowerOfTwo { name, value })
    }
}

/// Values derived once from a validated configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedConfig {
    pub num_virtual_antennas: usize,
    pub chirps_per_frame: usize,
    pub log2_doppler_bins: u32,
    pub log2_range_bins: u32,
    /// 2 when both BPM waveforms are kept side by side, 1 otherwise
    pub bpm_factor: usize,
    pub num_dc_calib_bins: usize,
}

impl DerivedConfig {
    pub fn new(cfg: &DssConfig) -> Self {
        Self {
            num_virtual_antennas: cfg.num_virtual_antennas(),
            chirps_per_frame: cfg.num_doppler_bins * cfg.num_tx_antennas,
            log2_doppler_bins: cfg.num_doppler_bins.trailing_zeros(),
            log2_range_bins: cfg.num_range_bins.trailing_zeros(),
            bpm_factor: if cfg.bpm_enabled { 2 } else { 1 },
            num_dc_calib_bins: if cfg.dc_range_sig.enabled {
                cfg.dc_range_sig.num_bins()
            } else {
                0
            },
        }
    }
}
