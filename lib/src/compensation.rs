//! Phase and gain compensation of virtual antenna symbols.
//!
//! With TDM-MIMO the second transmit slot is sampled half a Doppler period
//! later than the first, so its symbols carry an extra phase of
//! `π d / N` for a target in signed Doppler bin `d`. The same table that
//! drives the single bin DFT provides that correction.
use num_complex::Complex;

use crate::config::DssConfig;
use crate::fixed::{cmul32_q15, cmul_q15, sat_i32, Cplx16, Cplx32};
use crate::window::dft_sin_cos_table;

/// Coefficient tables shared by the Doppler and angle stages.
#[derive(Debug, Clone)]
pub struct CompensationTables {
    /// `e^{-j2πk/N}` in Q15 for the Doppler FFT size
    pub dft_table: Vec<Cplx16>,
    /// `e^{-jπ/N}` in Q15
    pub half_bin: Cplx16,
    /// Per virtual antenna gain/phase correction
    pub rx_channel_comp: Vec<Cplx16>,
}

impl CompensationTables {
    /// Builds the tables in `dft_table`, which must hold one entry per
    /// Doppler bin.
    pub fn new(cfg: &DssConfig, mut dft_table: Vec<Cplx16>) -> Self {
        let half_bin = dft_sin_cos_table(&mut dft_table);
        Self {
            dft_table,
            half_bin,
            rx_channel_comp: cfg.rx_channel_comp.clone(),
        }
    }

    /// Correction `e^{-jπd/N}` for the signed Doppler bin `doppler`.
    pub fn doppler_coefficient(&self, doppler: i32) -> Cplx16 {
        doppler_compensation(doppler, &self.dft_table, self.half_bin)
    }
}

/// Computes `e^{-jπd/N}` from the table `e^{-j2πk/N}`.
///
/// The index is halved with floor division; odd indices get the extra
/// half-bin rotation.
pub fn doppler_compensation(doppler: i32, table: &[Cplx16], half_bin: Cplx16) -> Cplx16 {
    let n = table.len() as i32;
    // Floor, not truncation: -3 becomes table[-2] times the half bin, which
    // keeps the phase exactly -π·d/N for negative odd bins too.
    let coeff = table[doppler.div_euclid(2).rem_euclid(n) as usize];
    if doppler.rem_euclid(2) == 1 {
        cmul_q15(coeff, half_bin)
    } else {
        coeff
    }
}

/// Multiplies every sample by `coeff`.
pub fn rotate(data: &mut [Cplx32], coeff: Cplx16) {
    for x in data.iter_mut() {
        *x = cmul32_q15(*x, coeff);
    }
}

/// Element-wise antenna bias correction.
pub fn apply_bias(data: &mut [Cplx32], bias: &[Cplx16]) {
    for (x, c) in data.iter_mut().zip(bias) {
        *x = cmul32_q15(*x, *c);
    }
}

/// Separates the two BPM waveforms in place.
///
/// Slot A carries `TX1 + TX2` and slot B `TX1 - TX2`; afterwards A holds
/// TX1 and B holds TX2.
pub fn decode_bpm(a: &mut [Cplx32], b: &mut [Cplx32]) {
    for (x, y) in a.iter_mut().zip(b.iter_mut()) {
        let (xr, xi) = (x.re as i64, x.im as i64);
        let (yr, yi) = (y.re as i64, y.im as i64);
        *x = Complex::new(sat_i32((xr + yr) / 2), sat_i32((xi + yi) / 2));
        *y = Complex::new(sat_i32((xr - yr) / 2), sat_i32((xi - yi) / 2));
    }
}
