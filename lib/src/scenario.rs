//! Synthetic front end
//!
//! Generates the complex ADC samples a sensor would capture for a set of
//! point targets. Each target is described directly in processing units:
//! a (fractional) range bin, a signed Doppler bin and its direction.
//!
//! Chirps are produced in transmit order, i.e. for every Doppler chirp one
//! chirp per transmit slot. With TDM only the slot's own transmitter is
//! active; with BPM slot A radiates `TX1 + TX2` and slot B `TX1 - TX2`.
use num_complex::Complex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::collections::VecDeque;
use std::f64::consts::PI;

use crate::config::{AngleMode, DssConfig};
use crate::fixed::Cplx16;
use crate::stream::{ChirpSource, FrontEndEvent, SourcePoll};

/// Point target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
    pub range_bin: f64,
    /// Signed Doppler bin; values outside `[-N/2, N/2)` alias
    pub doppler_bin: f64,
    pub azimuth_deg: f64,
    pub elevation_deg: f64,
    /// Peak amplitude per ADC sample
    pub amplitude: f64,
}

impl Target {
    pub fn new(range_bin: f64, doppler_bin: f64) -> Self {
        Self {
            range_bin,
            doppler_bin,
            azimuth_deg: 0.0,
            elevation_deg: 0.0,
            amplitude: 1000.0,
        }
    }

    pub fn with_azimuth(mut self, deg: f64) -> Self {
        self.azimuth_deg = deg;
        self
    }

    pub fn with_elevation(mut self, deg: f64) -> Self {
        self.elevation_deg = deg;
        self
    }

    pub fn with_amplitude(mut self, amplitude: f64) -> Self {
        self.amplitude = amplitude;
        self
    }
}

/// Chirp generator for a fixed configuration and target set.
#[derive(Debug)]
pub struct Scenario {
    num_rx: usize,
    num_tx: usize,
    num_adc_samples: usize,
    num_range_bins: usize,
    num_doppler_bins: usize,
    bpm: bool,
    /// `(row, column)` of every virtual antenna in half wavelengths
    positions: Vec<(f64, f64)>,
    targets: Vec<Target>,
    noise: Option<Normal<f64>>,
    rng: StdRng,
}

impl Scenario {
    pub fn new(cfg: &DssConfig, targets: Vec<Target>) -> Self {
        let positions = match &cfg.angle_mode {
            AngleMode::AzimuthElevation(layout) => layout
                .cells
                .iter()
                .map(|&(row, col)| (row as f64, col as f64))
                .collect(),
            AngleMode::Azimuth => (0..cfg.num_virtual_antennas()).map(|v| (0.0, v as f64)).collect(),
        };
        Self {
            num_rx: cfg.num_rx_antennas,
            num_tx: cfg.num_tx_antennas,
            num_adc_samples: cfg.num_adc_samples,
            num_range_bins: cfg.num_range_bins,
            num_doppler_bins: cfg.num_doppler_bins,
            bpm: cfg.bpm_enabled,
            positions,
            targets,
            noise: None,
            rng: StdRng::seed_from_u64(0),
        }
    }

    /// Adds white Gaussian noise with standard deviation `std` per I and Q
    /// component, drawn from a generator seeded with `seed`.
    pub fn with_noise(mut self, std: f64, seed: u64) -> Self {
        self.noise = Normal::new(0.0, std).ok();
        if self.noise.is_none() {
            log::warn!("Invalid noise level {}, generating noiseless chirps", std);
        }
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Samples of Doppler chirp `doppler_chirp` in transmit slot `tx_slot`,
    /// `[rx][sample]`.
    pub fn chirp(&mut self, doppler_chirp: usize, tx_slot: usize) -> Vec<Cplx16> {
        let nadc = self.num_adc_samples;
        let mut out = Vec::with_capacity(self.num_rx * nadc);

        for rx in 0..self.num_rx {
            let spatial: Vec<Complex<f64>> = self
                .targets
                .iter()
                .map(|t| self.array_response(t, tx_slot, rx))
                .collect();
            for n in 0..nadc {
                let mut acc = Complex::new(0.0, 0.0);
                for (t, s) in self.targets.iter().zip(&spatial) {
                    let slow_time = doppler_chirp as f64 + tx_slot as f64 / self.num_tx as f64;
                    let phase = 2.0 * PI * t.doppler_bin * slow_time / self.num_doppler_bins as f64
                        + 2.0 * PI * t.range_bin * n as f64 / self.num_range_bins as f64;
                    acc += Complex::from_polar(t.amplitude, phase) * s;
                }
                if let Some(noise) = &self.noise {
                    acc += Complex::new(noise.sample(&mut self.rng), noise.sample(&mut self.rng));
                }
                out.push(Complex::new(to_adc(acc.re), to_adc(acc.im)));
            }
        }
        out
    }

    /// All chirps of one frame in transmit order.
    pub fn frame(&mut self) -> Vec<Vec<Cplx16>> {
        let mut chirps = Vec::with_capacity(self.num_doppler_bins * self.num_tx);
        for m in 0..self.num_doppler_bins {
            for t in 0..self.num_tx {
                chirps.push(self.chirp(m, t));
            }
        }
        chirps
    }

    /// Turns the scenario into a chirp source producing `frames` frames, or
    /// frames forever with `None`.
    pub fn into_source(self, frames: Option<u64>) -> ScenarioSource {
        ScenarioSource {
            scenario: self,
            remaining: frames,
            pending: VecDeque::new(),
        }
    }

    /// Sum of the transmitters active in `tx_slot`, seen by receive antenna
    /// `rx`.
    fn array_response(&self, target: &Target, tx_slot: usize, rx: usize) -> Complex<f64> {
        let az = target.azimuth_deg.to_radians();
        let el = target.elevation_deg.to_radians();
        let steer = |tx: usize| {
            let (row, col) = self.positions[tx * self.num_rx + rx];
            Complex::from_polar(1.0, PI * (az.sin() * el.cos() * col + el.sin() * row))
        };

        if self.bpm {
            let sign = if tx_slot == 0 { 1.0 } else { -1.0 };
            steer(0) + steer(1) * sign
        } else {
            steer(tx_slot)
        }
    }
}

/// [`ChirpSource`] generating frames from a [`Scenario`].
#[derive(Debug)]
pub struct ScenarioSource {
    scenario: Scenario,
    remaining: Option<u64>,
    pending: VecDeque<FrontEndEvent>,
}

impl ChirpSource for ScenarioSource {
    fn poll_event(&mut self) -> SourcePoll {
        if self.pending.is_empty() {
            match &mut self.remaining {
                Some(0) => return SourcePoll::Closed,
                Some(n) => *n -= 1,
                None => {}
            }
            self.pending
                .extend(self.scenario.frame().into_iter().map(FrontEndEvent::Chirp));
            self.pending.push_back(FrontEndEvent::FrameEnd);
        }
        match self.pending.pop_front() {
            Some(event) => SourcePoll::Ready(event),
            None => SourcePoll::Closed,
        }
    }
}

fn to_adc(v: f64) -> i16 {
    v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> DssConfig {
        let mut cfg = DssConfig::with_antennas(2, 4);
        cfg.angle_mode = AngleMode::Azimuth;
        cfg.num_adc_samples = 32;
        cfg.num_range_bins = 32;
        cfg.num_doppler_bins = 8;
        cfg
    }

    #[test]
    fn test_frame_shape() {
        let cfg = small_cfg();
        let mut scenario = Scenario::new(&cfg, vec![Target::new(4.0, 1.0)]);
        let frame = scenario.frame();
        assert_eq!(frame.len(), 16);
        assert!(frame.iter().all(|c| c.len() == 4 * 32));
    }

    #[test]
    fn test_tdm_slot_carries_doppler_offset() {
        let cfg = small_cfg();
        let mut scenario = Scenario::new(&cfg, vec![Target::new(0.0, 2.0)]);
        let a = scenario.chirp(0, 0)[0];
        let b = scenario.chirp(0, 1)[0];
        // Half a Doppler chirp later; at boresight the array adds no phase
        let expected = PI * 2.0 / 8.0;
        let got = (b.im as f64).atan2(b.re as f64) - (a.im as f64).atan2(a.re as f64);
        assert!((got - expected).abs() < 0.01, "phase step {}", got);
    }

    #[test]
    fn test_bpm_slots_sum_and_difference() {
        let mut cfg = small_cfg();
        cfg.bpm_enabled = true;
        let target = Target::new(0.0, 0.0).with_azimuth(30.0);
        let mut scenario = Scenario::new(&cfg, vec![target]);
        let a = scenario.chirp(0, 0);
        let b = scenario.chirp(0, 1);
        // Half sum recovers TX1 alone: unit phasor times the amplitude
        let tx1 = Complex::new((a[0].re + b[0].re) as f64 / 2.0, (a[0].im + b[0].im) as f64 / 2.0);
        assert!((tx1.norm() - 1000.0).abs() < 2.0);
    }

    #[test]
    fn test_source_ends_after_requested_frames() {
        let cfg = small_cfg();
        let mut source = Scenario::new(&cfg, vec![Target::new(4.0, 0.0)]).into_source(Some(2));
        let mut events = Vec::new();
        while let SourcePoll::Ready(e) = source.poll_event() {
            events.push(e);
        }
        assert_eq!(events.len(), 2 * 17);
        assert_eq!(events[16], FrontEndEvent::FrameEnd);
        assert_eq!(events[33], FrontEndEvent::FrameEnd);
    }

    #[test]
    fn test_noise_is_seeded() {
        let cfg = small_cfg();
        let mut a = Scenario::new(&cfg, vec![]).with_noise(10.0, 7);
        let mut b = Scenario::new(&cfg, vec![]).with_noise(10.0, 7);
        let ca = a.chirp(0, 0);
        assert_eq!(ca, b.chirp(0, 0));
        assert!(ca.iter().any(|c| c.re != 0));
    }
}
