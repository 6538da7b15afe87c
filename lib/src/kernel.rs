//! Transform kernel
//!
//! The FFTs and vector primitives the pipeline stages are built on. The
//! stages only rely on the numeric contract documented on
//! [`TransformKernel`]; [`RustFftKernel`] is the default implementation.
use num_complex::Complex;
use rustfft::{num_complex::Complex64, Fft, FftPlanner};
use std::collections::HashMap;
use std::sync::Arc;

use crate::fixed::{sat_i16, sat_i32, Cplx16, Cplx32};

/// Fixed-point transforms consumed by the pipeline.
///
/// All lengths are powers of two and equal to the slice lengths passed in.
pub trait TransformKernel: Send {
    /// 16-bit complex FFT.
    ///
    /// The output is the DFT scaled by `2^-floor(log2(N) / 2)`, rounded and
    /// saturated, which keeps a full-scale windowed chirp inside 16 bits.
    fn fft16(&mut self, input: &[Cplx16], output: &mut [Cplx16]);

    /// 32-bit complex FFT, unscaled, rounded and saturated.
    fn fft32(&mut self, input: &[Cplx32], output: &mut [Cplx32]);

    /// Windowed DFT evaluated at a single bin.
    ///
    /// `window` is the first half of a symmetric Q19 window, `table` holds
    /// `e^{-j2πk/N}` in Q15. The result matches bin `bin` of
    /// [`TransformKernel::fft32`] applied to
    /// [`crate::window::windowing16x32`] of the input, up to rounding.
    fn single_bin_dft(
        &self,
        input: &[Cplx16],
        window: &[i32],
        table: &[Cplx16],
        bin: usize,
    ) -> Cplx32 {
        let len = input.len();
        let half = window.len();
        let mut re: i64 = 0;
        let mut im: i64 = 0;
        for (n, x) in input.iter().enumerate() {
            let w = (if n < half { window[n] } else { window[len - 1 - n] }) as i64;
            let xr = (x.re as i64 * w + 0x4000) >> 15;
            let xi = (x.im as i64 * w + 0x4000) >> 15;
            let t = table[(bin * n) & (len - 1)];
            re += xr * t.re as i64 - xi * t.im as i64;
            im += xr * t.im as i64 + xi * t.re as i64;
        }
        Complex::new(sat_i32((re + 0x4000) >> 15), sat_i32((im + 0x4000) >> 15))
    }
}

/// [`TransformKernel`] backed by `rustfft`, with one cached plan per length.
pub struct RustFftKernel {
    planner: FftPlanner<f64>,
    plans: HashMap<usize, Arc<dyn Fft<f64>>>,
    buffer: Vec<Complex64>,
    scratch: Vec<Complex64>,
}

impl Default for RustFftKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl RustFftKernel {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
            plans: HashMap::new(),
            buffer: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Transforms the first `len` entries of the internal buffer in place.
    fn transform(&mut self, len: usize) {
        let planner = &mut self.planner;
        let fft = self
            .plans
            .entry(len)
            .or_insert_with(|| planner.plan_fft_forward(len))
            .clone();
        let scratch_len = fft.get_inplace_scratch_len();
        if self.scratch.len() < scratch_len {
            self.scratch.resize(scratch_len, Complex64::new(0.0, 0.0));
        }
        fft.process_with_scratch(&mut self.buffer[..len], &mut self.scratch[..scratch_len]);
    }

    fn load<I: Iterator<Item = Complex64>>(&mut self, samples: I) {
        self.buffer.clear();
        self.buffer.extend(samples);
    }
}

impl TransformKernel for RustFftKernel {
    fn fft16(&mut self, input: &[Cplx16], output: &mut [Cplx16]) {
        debug_assert_eq!(input.len(), output.len());
        let len = input.len();
        let scale = (1u32 << (len.trailing_zeros() / 2)) as f64;
        self.load(input.iter().map(|x| Complex64::new(x.re as f64, x.im as f64)));
        self.transform(len);
        for (out, x) in output.iter_mut().zip(&self.buffer) {
            *out = Complex::new(
                sat_i16((x.re / scale).round().clamp(i32::MIN as f64, i32::MAX as f64) as i32),
                sat_i16((x.im / scale).round().clamp(i32::MIN as f64, i32::MAX as f64) as i32),
            );
        }
    }

    fn fft32(&mut self, input: &[Cplx32], output: &mut [Cplx32]) {
        debug_assert_eq!(input.len(), output.len());
        let len = input.len();
        self.load(input.iter().map(|x| Complex64::new(x.re as f64, x.im as f64)));
        self.transform(len);
        for (out, x) in output.iter_mut().zip(&self.buffer) {
            *out = Complex::new(sat_f64_i32(x.re), sat_f64_i32(x.im));
        }
    }
}

fn sat_f64_i32(v: f64) -> i32 {
    v.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

/// Sum of a complex 16-bit vector with 32-bit accumulators.
pub fn vec_sum(input: &[Cplx16]) -> Cplx32 {
    input.iter().fold(Complex::new(0i32, 0i32), |acc, x| {
        Complex::new(acc.re + x.re as i32, acc.im + x.im as i32)
    })
}

/// Subtracts a constant from every sample, saturating.
pub fn vec_sub_const(data: &mut [Cplx16], value: Cplx16) {
    for x in data.iter_mut() {
        *x = Complex::new(x.re.saturating_sub(value.re), x.im.saturating_sub(value.im));
    }
}

/// Log2 magnitude in Q8, i.e. `256 * log2(|x|)`. Zero samples map to zero.
pub fn log2_abs32(input: &[Cplx32], output: &mut [u16]) {
    for (out, x) in output.iter_mut().zip(input) {
        let power = (x.re as f64).powi(2) + (x.im as f64).powi(2);
        *out = if power < 1.0 {
            0
        } else {
            (128.0 * power.log2()).round().min(u16::MAX as f64) as u16
        };
    }
}

/// Saturating element-wise accumulation `acc += input`.
pub fn accumulate(input: &[u16], acc: &mut [u16]) {
    for (a, x) in acc.iter_mut().zip(input) {
        *a = a.saturating_add(*x);
    }
}

/// Magnitude squared of a 32-bit complex vector.
pub fn magnitude_squared(input: &[Cplx32], output: &mut [f32]) {
    for (out, x) in output.iter_mut().zip(input) {
        *out = (x.re as f32) * (x.re as f32) + (x.im as f32) * (x.im as f32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::{dft_sin_cos_table, generate_window_q19, windowing16x32, WindowKind};
    use std::f64::consts::PI;

    fn tone16(len: usize, bin: usize, amplitude: f64) -> Vec<Cplx16> {
        (0..len)
            .map(|n| {
                let phase = 2.0 * PI * (bin * n) as f64 / len as f64;
                Complex::new(
                    (amplitude * phase.cos()).round() as i16,
                    (amplitude * phase.sin()).round() as i16,
                )
            })
            .collect()
    }

    #[test]
    fn test_fft16_tone_scaling() {
        let mut kernel = RustFftKernel::new();
        let input = tone16(256, 10, 1000.0);
        let mut output = vec![Complex::new(0, 0); 256];
        kernel.fft16(&input, &mut output);

        // 256 * 1000 / 16
        assert!((output[10].re as i32 - 16000).abs() <= 2);
        assert!(output[10].im.abs() <= 2);
        assert!(output[11].re.abs() <= 2);
    }

    #[test]
    fn test_fft32_unscaled() {
        let mut kernel = RustFftKernel::new();
        let input = vec![Complex::new(100, -50); 16];
        let mut output = vec![Complex::new(0, 0); 16];
        kernel.fft32(&input, &mut output);
        assert_eq!(output[0], Complex::new(1600, -800));
        assert!(output[1..].iter().all(|x| x.re == 0 && x.im == 0));
    }

    /// The single bin DFT must agree with windowing followed by a full FFT.
    #[test]
    fn test_single_bin_dft_matches_fft() {
        let mut kernel = RustFftKernel::new();
        let len = 32;
        let input = tone16(len, 5, 3000.0);
        let window = generate_window_q19(WindowKind::Hanning, len);
        let mut table = vec![Complex::new(0, 0); len];
        dft_sin_cos_table(&mut table);

        let mut windowed = vec![Complex::new(0, 0); len];
        windowing16x32(&input, &window, &mut windowed);
        let mut spectrum = vec![Complex::new(0, 0); len];
        kernel.fft32(&windowed, &mut spectrum);

        for bin in [0, 4, 5, 6, 20] {
            let single = kernel.single_bin_dft(&input, &window, &table, bin);
            assert!(
                (single.re - spectrum[bin].re).abs() <= 4 * len as i32,
                "bin {}: {} vs {}",
                bin,
                single,
                spectrum[bin]
            );
            assert!((single.im - spectrum[bin].im).abs() <= 4 * len as i32);
        }
    }

    #[test]
    fn test_log2_abs32() {
        let input = [
            Complex::new(0, 0),
            Complex::new(1, 0),
            Complex::new(256, 0),
            Complex::new(0, -1024),
        ];
        let mut output = [0u16; 4];
        log2_abs32(&input, &mut output);
        assert_eq!(output, [0, 0, 8 * 256, 10 * 256]);
    }

    #[test]
    fn test_accumulate_saturates() {
        let mut acc = [u16::MAX - 1, 10];
        accumulate(&[5, 5], &mut acc);
        assert_eq!(acc, [u16::MAX, 15]);
    }
}
