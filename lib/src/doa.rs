//! Direction of arrival estimation
//!
//! Turns the compensated virtual antenna symbols of a detected object into
//! `(x, y, z)` coordinates. Three estimators exist:
//!  - linear array (azimuth only), optionally resolving a second object in
//!    the same range/Doppler cell and disambiguating extended velocities
//!  - sparse 2D array (azimuth and elevation) on a zero padded grid
//!  - range only, for a single virtual antenna
use ndarray::Array2;
use num_complex::Complex;
use std::f64::consts::PI;

use crate::config::{AntennaLayout, DssConfig};
use crate::fixed::{quantize, Cplx32};
use crate::kernel::TransformKernel;
use crate::objects::{DetectedObject, DoaState};

/// Position reported for objects whose angle cannot be resolved.
pub const UNRESOLVABLE_POSITION_M: f32 = 1000.0;

/// Range of a bin in meters, bias compensated and clamped at zero.
pub fn object_range_m(range_idx: u16, cfg: &DssConfig) -> f32 {
    (range_idx as f32 * cfg.range_resolution_m - cfg.range_bias_m).max(0.0)
}

/// Single virtual antenna: the object is placed on the boresight axis.
pub fn estimate_range_only(obj: &mut DetectedObject, cfg: &DssConfig) {
    let range = object_range_m(obj.range_idx, cfg);
    obj.x = 0;
    obj.y = quantize(range, cfg.xyz_q_format);
    obj.z = 0;
    obj.doa_state = DoaState::Resolved;
}

/// Fills position and peak height of `obj` from the azimuth peak at bin
/// `azimuth_bin` with power `max_val`.
fn xy_from_peak(obj: &mut DetectedObject, azimuth_bin: usize, max_val: f32, cfg: &DssConfig) {
    let na = cfg.num_angle_bins;
    obj.azimuth_bin = azimuth_bin as u16;

    let scale = (cfg.num_range_bins * na * cfg.num_doppler_bins) as f32;
    obj.peak_val = (max_val / scale).sqrt() as u16;

    let range = object_range_m(obj.range_idx, cfg);
    let signed = if azimuth_bin > na / 2 - 1 {
        azimuth_bin as i32 - na as i32
    } else {
        azimuth_bin as i32
    };
    let wx = 2.0 * signed as f32 / na as f32;
    let x = range * wx;
    let y_sq = range * range - x * x;
    let y = if y_sq > 0.0 { y_sq.sqrt() } else { 0.0 };

    obj.x = quantize(x, cfg.xyz_q_format);
    obj.y = quantize(y, cfg.xyz_q_format);
    obj.z = 0;
    obj.doa_state = DoaState::Resolved;
}

/// Azimuth-only estimation for `objects[idx]` from the azimuth power
/// spectrum `mag_sqr`.
///
/// With extended velocity enabled `mag_sqr` covers both hypotheses
/// (`2 * num_angle_bins` bins); a peak in the second half means the
/// Doppler index aliased and is unwrapped by one period. With multi-object
/// beamforming a second peak outside the first peak's main lobe may append
/// a new object, up to `cfg.max_detected_objects`.
pub fn estimate_azimuth(
    objects: &mut Vec<DetectedObject>,
    idx: usize,
    mag_sqr: &[f32],
    cfg: &DssConfig,
) {
    let na = cfg.num_angle_bins;
    let extended = cfg.extended_max_velocity && cfg.num_tx_antennas > 1;
    let search = if extended { 2 * na } else { na };

    let mut peak = 0;
    let mut max_val = 0.0f32;
    for (i, &m) in mag_sqr.iter().take(search).enumerate() {
        if m > max_val {
            peak = i;
            max_val = m;
        }
    }

    if extended && peak >= na {
        peak -= na;
        let nd = cfg.num_doppler_bins as i16;
        let obj = &mut objects[idx];
        if obj.doppler_idx < 0 {
            obj.doppler_idx += nd;
        } else {
            obj.doppler_idx -= nd;
        }
        log::trace!("Object {} velocity unwrapped to bin {}", idx, obj.doppler_idx);
    }

    xy_from_peak(&mut objects[idx], peak, max_val, cfg);

    if !cfg.multi_object.enabled || cfg.extended_max_velocity {
        return;
    }

    let Some((second, max_val2)) = second_peak(&mag_sqr[..na], peak) else {
        return;
    };
    if max_val2 > max_val * cfg.multi_object.second_peak_threshold
        && objects.len() < cfg.max_detected_objects
    {
        let mut obj = DetectedObject {
            range_idx: objects[idx].range_idx,
            doppler_idx: objects[idx].doppler_idx,
            ..Default::default()
        };
        xy_from_peak(&mut obj, second, max_val2, cfg);
        log::trace!(
            "Second object at azimuth bin {} next to object {} (bin {})",
            second,
            idx,
            peak
        );
        objects.push(obj);
    }
}

/// Strongest bin outside the main lobe around `peak`.
///
/// The lobe extends on both sides while the spectrum keeps falling; the
/// search covers the remaining arc, both lobe boundaries included.
fn second_peak(mag_sqr: &[f32], peak: usize) -> Option<(usize, f32)> {
    let na = mag_sqr.len();
    if na == 0 {
        return None;
    }
    let mask = na - 1;

    let mut i = peak;
    let mut right = (i + 1) & mask;
    let mut steps = na;
    while mag_sqr[i] >= mag_sqr[right] && steps > 0 {
        i = (i + 1) & mask;
        right = (right + 1) & mask;
        steps -= 1;
    }

    let mut i = peak;
    let mut left = (i + mask) & mask;
    let mut steps = na;
    while mag_sqr[i] >= mag_sqr[left] && steps > 0 {
        i = (i + mask) & mask;
        left = (left + mask) & mask;
        steps -= 1;
    }

    let len = ((left + na - right) & mask) + 1;
    let mut best = right;
    let mut best_val = mag_sqr[right];
    for j in right..right + len {
        let j = j & mask;
        if mag_sqr[j] > best_val {
            best = j;
            best_val = mag_sqr[j];
        }
    }
    Some((best, best_val))
}

// Near-field geometry of the evaluation board, in mm
const LAMBDA_MM: f64 = 3.8961;
const NF_A: f64 = 0.0;
const NF_B: f64 = LAMBDA_MM;
const NF_C: f64 = 2.0 * LAMBDA_MM;
const NF_D: f64 = NF_C + 8.7;
const NF_E: f64 = NF_D + 1.5 * LAMBDA_MM;

/// Combines the azimuth spectra of both transmitters for a target too close
/// for the far-field assumption.
///
/// `out1` (second transmitter only) is rotated by the per-angle path
/// difference and added into `out0` (first transmitter only).
pub fn near_field_correction(out0: &mut [Cplx32], out1: &[Cplx32], range_idx: u16, cfg: &DssConfig) {
    let na = out0.len();
    let range = (range_idx as f64 * cfg.range_resolution_m as f64 - cfg.range_bias_m as f64) * 1000.0;
    let range_sq = range * range;
    let theta_inc = 2.0 / na as f64;
    let path = |offset: f64, theta: f64| {
        let d = offset - NF_B;
        (range_sq + d * d - range * theta * 2.0 * d).sqrt()
    };

    let mut corr = (1.0f64, 0.0f64);
    for (i, (o0, o1)) in out0.iter_mut().zip(out1).enumerate() {
        let theta = if i < na / 2 {
            i as f64 * theta_inc
        } else {
            (i as f64 - na as f64) * theta_inc
        };
        if range > 0.0 {
            let tx1 = path(NF_C, theta);
            let rx4 = path(NF_D, theta);
            let tx2 = path(NF_A, theta);
            let rx1 = path(NF_E, theta);
            let psi = 2.0 * PI / LAMBDA_MM * ((tx2 + rx1) - (rx4 + tx1)) - PI * theta;
            corr = (psi.cos(), (-psi).sin());
        }
        let (re1, im1) = (o1.re as f64, o1.im as f64);
        let re = (re1 * corr.0 - im1 * corr.1) as i32;
        let im = (im1 * corr.0 + re1 * corr.1) as i32;
        *o0 = Complex::new(o0.re.saturating_add(re), o0.im.saturating_add(im));
    }
}

/// Places the virtual antenna symbols on the angle grid. Unpopulated cells
/// are cleared.
pub fn fill_grid(symbols: &[Cplx32], layout: &AntennaLayout, grid: &mut Array2<Cplx32>) {
    grid.fill(Complex::new(0, 0));
    for (sym, &(row, col)) in symbols.iter().zip(&layout.cells) {
        grid[[row, col]] = *sym;
    }
}

/// 2D FFT of the angle grid: populated rows first, then every column.
pub fn transform_grid(kernel: &mut dyn TransformKernel, grid: &mut Array2<Cplx32>, num_rows: usize) {
    let (rows, cols) = grid.dim();
    let mut input = vec![Complex::new(0, 0); rows.max(cols)];
    let mut output = input.clone();

    for r in 0..num_rows.min(rows) {
        for (dst, src) in input.iter_mut().zip(grid.row(r)) {
            *dst = *src;
        }
        kernel.fft32(&input[..cols], &mut output[..cols]);
        for (dst, src) in grid.row_mut(r).iter_mut().zip(&output) {
            *dst = *src;
        }
    }
    for c in 0..cols {
        for (dst, src) in input.iter_mut().zip(grid.column(c)) {
            *dst = *src;
        }
        kernel.fft32(&input[..rows], &mut output[..rows]);
        for (dst, src) in grid.column_mut(c).iter_mut().zip(&output) {
            *dst = *src;
        }
    }
}

/// Azimuth and elevation from the transformed angle grid.
///
/// An out-of-domain azimuth marks the object [`DoaState::Unresolvable`] and
/// places it at [`UNRESOLVABLE_POSITION_M`] on every axis.
pub fn estimate_azimuth_elevation(obj: &mut DetectedObject, grid: &Array2<Cplx32>, cfg: &DssConfig) {
    let na = cfg.num_angle_bins as i32;
    let mut max_val = 0.0f64;
    let (mut peak_row, mut peak_col) = (0usize, 0usize);
    for ((r, c), x) in grid.indexed_iter() {
        let m = (x.re as f64).powi(2) + (x.im as f64).powi(2);
        if m > max_val {
            max_val = m;
            peak_row = r;
            peak_col = c;
        }
    }
    obj.azimuth_bin = peak_col as u16;

    let signed = |idx: usize| {
        let idx = idx as i32;
        if idx > na / 2 {
            idx - na
        } else {
            idx
        }
    };
    let az_freq = signed(peak_col) as f64 * 2.0 * PI / na as f64;
    let el_freq = signed(peak_row) as f64 * 2.0 * PI / na as f64;

    let phi = (el_freq / PI).asin();
    let q = cfg.xyz_q_format;
    if (az_freq / phi.cos()).abs() > PI {
        let sentinel = quantize(UNRESOLVABLE_POSITION_M, q);
        obj.x = sentinel;
        obj.y = sentinel;
        obj.z = sentinel;
        obj.doa_state = DoaState::Unresolvable;
        log::trace!(
            "Object at range bin {} has no valid azimuth (peak {}, {})",
            obj.range_idx,
            peak_row,
            peak_col
        );
        return;
    }
    let theta = (az_freq / (PI * phi.cos())).asin();

    let range = object_range_m(obj.range_idx, cfg) as f64;
    obj.x = quantize((range * theta.sin() * phi.cos()) as f32, q);
    obj.y = quantize((range * theta.cos() * phi.cos()) as f32, q);
    obj.z = quantize((range * phi.sin()) as f32, q);
    obj.doa_state = DoaState::Resolved;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AngleMode;
    use crate::kernel::{magnitude_squared, RustFftKernel};

    fn cfg_1d() -> DssConfig {
        let mut cfg = DssConfig::with_antennas(2, 4);
        cfg.angle_mode = AngleMode::Azimuth;
        cfg
    }

    fn obj(range_idx: u16, doppler_idx: i16) -> DetectedObject {
        DetectedObject {
            range_idx,
            doppler_idx,
            ..Default::default()
        }
    }

    /// Array response of a uniform linear array for the spatial frequency
    /// `2π * bin / na`, zero padded to `na`.
    fn steering(num_ant: usize, na: usize, bins: &[(f64, f64)]) -> Vec<Cplx32> {
        let mut out = vec![Complex::new(0, 0); na];
        for (v, o) in out.iter_mut().take(num_ant).enumerate() {
            let (mut re, mut im) = (0.0, 0.0);
            for &(bin, amp) in bins {
                let phase = 2.0 * PI * bin * v as f64 / na as f64;
                re += amp * phase.cos();
                im += amp * phase.sin();
            }
            *o = Complex::new(re as i32, im as i32);
        }
        out
    }

    fn spectrum(symbols: &[Cplx32]) -> Vec<f32> {
        let mut kernel = RustFftKernel::new();
        let mut out = vec![Complex::new(0, 0); symbols.len()];
        kernel.fft32(symbols, &mut out);
        let mut mag = vec![0.0; symbols.len()];
        magnitude_squared(&out, &mut mag);
        mag
    }

    #[test]
    fn test_azimuth_within_one_bin() {
        let cfg = cfg_1d();
        let na = cfg.num_angle_bins;
        for bin in [0.0, 5.0, 12.3, -9.0, -20.6] {
            let mag = spectrum(&steering(8, na, &[(bin, 1.0e6)]));
            let mut objects = vec![obj(100, 3)];
            estimate_azimuth(&mut objects, 0, &mag, &cfg);
            assert_eq!(objects.len(), 1);

            let found = objects[0].azimuth_bin as i32;
            let found = if found >= na as i32 / 2 { found - na as i32 } else { found };
            assert!((found as f64 - bin).abs() <= 1.0, "bin {} found {}", bin, found);
            assert_eq!(objects[0].doa_state, DoaState::Resolved);

            let range = object_range_m(100, &cfg);
            let x = objects[0].x as f32 / 128.0;
            let expected = range * 2.0 * found as f32 / na as f32;
            assert!((x - expected).abs() < 0.02);
        }
    }

    #[test]
    fn test_second_object_found() {
        let mut cfg = cfg_1d();
        cfg.multi_object.enabled = true;
        cfg.multi_object.second_peak_threshold = 0.5;
        let na = cfg.num_angle_bins;
        let mag = spectrum(&steering(8, na, &[(-16.0, 1.0e6), (16.0, 0.9e6)]));

        let mut objects = vec![obj(40, -2)];
        estimate_azimuth(&mut objects, 0, &mag, &cfg);
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].azimuth_bin, 48);
        assert_eq!(objects[1].azimuth_bin, 16);
        assert_eq!(objects[1].range_idx, 40);
        assert_eq!(objects[1].doppler_idx, -2);
        assert!(objects[0].x < 0 && objects[1].x > 0);

        // Below the threshold only one object remains
        cfg.multi_object.second_peak_threshold = 0.95;
        let mut objects = vec![obj(40, -2)];
        estimate_azimuth(&mut objects, 0, &mag, &cfg);
        assert_eq!(objects.len(), 1);

        // No room left
        cfg.multi_object.second_peak_threshold = 0.5;
        cfg.max_detected_objects = 1;
        let mut objects = vec![obj(40, -2)];
        estimate_azimuth(&mut objects, 0, &mag, &cfg);
        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn test_extended_velocity_unwraps_doppler() {
        let mut cfg = cfg_1d();
        cfg.extended_max_velocity = true;
        let na = cfg.num_angle_bins;
        let mut mag = vec![1.0f32; 2 * na];
        mag[na + 3] = 100.0;

        let mut objects = vec![obj(10, 5), obj(10, -5)];
        estimate_azimuth(&mut objects, 0, &mag, &cfg);
        estimate_azimuth(&mut objects, 1, &mag, &cfg);
        assert_eq!(objects[0].azimuth_bin, 3);
        assert_eq!(objects[0].doppler_idx, 5 - 16);
        assert_eq!(objects[1].doppler_idx, -5 + 16);

        mag[na + 3] = 1.0;
        mag[3] = 100.0;
        let mut objects = vec![obj(10, 5)];
        estimate_azimuth(&mut objects, 0, &mag, &cfg);
        assert_eq!(objects[0].doppler_idx, 5);
    }

    #[test]
    fn test_elevation_zero_for_baseline_target() {
        let cfg = DssConfig::default();
        let AngleMode::AzimuthElevation(layout) = &cfg.angle_mode else {
            panic!("default config should use the 2D layout");
        };
        let na = cfg.num_angle_bins;
        // Phase progresses along columns only
        let theta: f64 = 20f64.to_radians();
        let symbols: Vec<Cplx32> = layout
            .cells
            .iter()
            .map(|&(_, col)| {
                let phase = PI * theta.sin() * col as f64;
                Complex::new((1.0e5 * phase.cos()) as i32, (1.0e5 * phase.sin()) as i32)
            })
            .collect();

        let mut grid = Array2::from_elem((na, na), Complex::new(0, 0));
        fill_grid(&symbols, layout, &mut grid);
        let mut kernel = RustFftKernel::new();
        transform_grid(&mut kernel, &mut grid, layout.num_rows());

        let mut o = obj(100, 0);
        estimate_azimuth_elevation(&mut o, &grid, &cfg);
        assert_eq!(o.doa_state, DoaState::Resolved);
        assert_eq!(o.z, 0);

        let range = object_range_m(100, &cfg) as f64;
        let x = o.x as f64 / 128.0;
        // one angle bin of resolution at this range
        assert!((x - range * theta.sin()).abs() < range * 2.0 / na as f64);
        assert!(o.y > 0);
    }

    #[test]
    fn test_unresolvable_azimuth_gets_sentinel() {
        let cfg = DssConfig::default();
        let na = cfg.num_angle_bins;
        let mut grid = Array2::from_elem((na, na), Complex::new(1, 0));
        // el = π/2 rad/sample, az beyond what that elevation allows
        grid[[16, 30]] = Complex::new(1 << 20, 0);
        let mut o = obj(50, 1);
        estimate_azimuth_elevation(&mut o, &grid, &cfg);
        assert_eq!(o.doa_state, DoaState::Unresolvable);
        assert_eq!(o.x, i16::MAX);
        assert_eq!(o.y, i16::MAX);
        assert_eq!(o.z, i16::MAX);
    }

    #[test]
    fn test_range_only_and_bias_clamp() {
        let mut cfg = DssConfig::with_antennas(1, 1);
        cfg.range_bias_m = 0.5;
        let mut o = obj(100, 0);
        estimate_range_only(&mut o, &cfg);
        assert_eq!(o.x, 0);
        assert_eq!(o.z, 0);
        assert_eq!(o.y, quantize(100.0 * 0.044 - 0.5, 7));

        let mut o = obj(3, 0);
        estimate_range_only(&mut o, &cfg);
        assert_eq!(o.y, 0);
    }

    #[test]
    fn test_near_field_at_zero_range_adds_spectra() {
        let cfg = DssConfig::default();
        let mut out0 = vec![Complex::new(10, -4); 8];
        let out1 = vec![Complex::new(3, 2); 8];
        near_field_correction(&mut out0, &out1, 0, &cfg);
        assert!(out0.iter().all(|c| *c == Complex::new(13, -2)));
    }

    #[test]
    fn test_near_field_preserves_magnitude() {
        let cfg = DssConfig::default();
        let mut out0 = vec![Complex::new(0, 0); 64];
        let out1 = vec![Complex::new(30_000, 0); 64];
        near_field_correction(&mut out0, &out1, 20, &cfg);
        for c in &out0 {
            let mag = ((c.re as f64).powi(2) + (c.im as f64).powi(2)).sqrt();
            assert!((mag - 30_000.0).abs() < 2.0);
        }
    }
}
