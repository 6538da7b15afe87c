//! Window generation and windowing primitives.
//!
//! Windows are symmetric, so only the first half is stored. The range window
//! is Q15 (16-bit), the Doppler window Q19 (32-bit).
use num_complex::Complex;
use std::f64::consts::PI;

use crate::fixed::{sat_i16, sat_i32, to_q15, Cplx16, Cplx32, ONE_Q15, ONE_Q19};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Blackman,
    Hanning,
}

fn window_value(kind: WindowKind, idx: usize, len: usize) -> f64 {
    let phi = 2.0 * PI / (len as f64 - 1.0);
    let c1 = (phi * idx as f64).cos();
    let c2 = (2.0 * phi * idx as f64).cos();
    match kind {
        WindowKind::Blackman => 0.42 - 0.5 * c1 + 0.08 * c2,
        WindowKind::Hanning => 0.5 * (1.0 - c1),
    }
}

fn generate_half(kind: WindowKind, len: usize, one: i32) -> Vec<i32> {
    (0..len / 2)
        .map(|i| {
            let v = (one as f64 * window_value(kind, i, len) + 0.5) as i32;
            v.min(one - 1)
        })
        .collect()
}

/// First half of a Q15 window of nominal length `len`.
pub fn generate_window_q15(kind: WindowKind, len: usize) -> Vec<i16> {
    generate_half(kind, len, ONE_Q15)
        .into_iter()
        .map(|v| v as i16)
        .collect()
}

/// First half of a Q19 window of nominal length `len`.
pub fn generate_window_q19(kind: WindowKind, len: usize) -> Vec<i32> {
    generate_half(kind, len, ONE_Q19)
}

#[inline]
fn mirrored<T: Copy>(half: &[T], idx: usize, len: usize) -> T {
    if idx < half.len() {
        half[idx]
    } else {
        half[len - 1 - idx]
    }
}

/// Applies a symmetric Q15 window to a 16-bit vector of even length.
pub fn windowing16x16_even(input: &[Cplx16], window: &[i16], output: &mut [Cplx16]) {
    let len = input.len();
    for (i, (out, x)) in output.iter_mut().zip(input).enumerate() {
        let w = mirrored(window, i, len) as i32;
        *out = Complex::new(
            sat_i16((x.re as i32 * w + 0x4000) >> 15),
            sat_i16((x.im as i32 * w + 0x4000) >> 15),
        );
    }
}

/// Applies a symmetric Q19 window to a 16-bit vector, widening to 32 bits.
pub fn windowing16x32(input: &[Cplx16], window: &[i32], output: &mut [Cplx32]) {
    let len = input.len();
    for (i, (out, x)) in output.iter_mut().zip(input).enumerate() {
        let w = mirrored(window, i, len) as i64;
        *out = Complex::new(
            sat_i32((x.re as i64 * w + 0x4000) >> 15),
            sat_i32((x.im as i64 * w + 0x4000) >> 15),
        );
    }
}

/// Fills `table` with the twiddles `e^{-j2πk/N}`, `N = table.len()`, and
/// returns the half-bin coefficient `e^{-jπ/N}`, both Q15.
///
/// The same table drives the single bin DFT and the TDM Doppler
/// compensation.
pub fn dft_sin_cos_table(table: &mut [Cplx16]) -> Cplx16 {
    let len = table.len() as f64;
    for (k, t) in table.iter_mut().enumerate() {
        let phase = 2.0 * PI * k as f64 / len;
        *t = Complex::new(to_q15(phase.cos()), to_q15(-phase.sin()));
    }
    let half = PI / len;
    Complex::new(to_q15(half.cos()), to_q15(-half.sin()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hanning_q19_shape() {
        let win = generate_window_q19(WindowKind::Hanning, 16);
        assert_eq!(win.len(), 8);
        assert_eq!(win[0], 0);
        assert!(win.windows(2).all(|w| w[0] < w[1]));
        assert!(*win.last().unwrap_or(&0) < ONE_Q19);
    }

    #[test]
    fn test_blackman_clamped_below_one() {
        let win = generate_window_q15(WindowKind::Blackman, 256);
        assert_eq!(win.len(), 128);
        // a0 - a1 + a2 is zero up to float noise
        assert!(win[0].abs() <= 1);
        assert!(win.iter().all(|&w| (w as i32) < ONE_Q15));
    }

    #[test]
    fn test_windowing_is_symmetric() {
        let win = generate_window_q15(WindowKind::Hanning, 8);
        let input = vec![Complex::new(1000i16, -1000i16); 8];
        let mut out = vec![Complex::new(0i16, 0i16); 8];
        windowing16x16_even(&input, &win, &mut out);
        for i in 0..4 {
            assert_eq!(out[i], out[7 - i]);
        }
    }

    #[test]
    fn test_dft_table() {
        let mut table = vec![Complex::new(0, 0); 16];
        let half = dft_sin_cos_table(&mut table);
        assert_eq!(table[0], Complex::new(i16::MAX, 0));
        assert_eq!(table[4], Complex::new(0, i16::MIN));
        assert!(half.im < 0 && half.re > 32000);
    }
}
