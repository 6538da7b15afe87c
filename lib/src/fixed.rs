//! Saturating fixed-point helpers.
//!
//! Samples travel through the pipeline as 16-bit complex values (ADC, range
//! spectra, radar cube) and 32-bit complex values (Doppler and angle
//! spectra). Coefficients (windows, twiddles, compensation factors) are Q15
//! unless stated otherwise.
use num_complex::Complex;

pub type Cplx16 = Complex<i16>;
pub type Cplx32 = Complex<i32>;

/// Largest positive Q15 value.
pub const ONE_Q15: i32 = 1 << 15;

/// Largest positive Q19 value, used for the Doppler window.
pub const ONE_Q19: i32 = 1 << 19;

#[inline]
pub fn sat_i16(v: i32) -> i16 {
    v.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

#[inline]
pub fn sat_i32(v: i64) -> i32 {
    v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Converts a real value into a Q15 coefficient, clamped below one.
pub fn to_q15(v: f64) -> i16 {
    let scaled = (v * ONE_Q15 as f64).round() as i64;
    scaled.clamp(-(ONE_Q15 as i64), ONE_Q15 as i64 - 1) as i16
}

/// Rounding Q15 multiply of two 16-bit complex values.
#[inline]
pub fn cmul_q15(a: Cplx16, b: Cplx16) -> Cplx16 {
    let (ar, ai) = (a.re as i32, a.im as i32);
    let (br, bi) = (b.re as i32, b.im as i32);
    let re = (ar as i64 * br as i64 - ai as i64 * bi as i64 + 0x4000) >> 15;
    let im = (ar as i64 * bi as i64 + ai as i64 * br as i64 + 0x4000) >> 15;
    Complex::new(sat_i16(sat_i32(re)), sat_i16(sat_i32(im)))
}

/// Rounding multiply of a 32-bit complex sample with a Q15 coefficient.
///
/// Each partial product is rounded separately and the final sum saturates,
/// the same way the multiply-and-round vector instructions do.
#[inline]
pub fn cmul32_q15(x: Cplx32, c: Cplx16) -> Cplx32 {
    let mul = |a: i32, b: i16| -> i64 { (a as i64 * b as i64 + 0x4000) >> 15 };
    let re = mul(x.re, c.re) - mul(x.im, c.im);
    let im = mul(x.re, c.im) + mul(x.im, c.re);
    Complex::new(sat_i32(re), sat_i32(im))
}

/// Saturating subtraction of a complex constant.
#[inline]
pub fn csub_sat16(a: Cplx16, b: Cplx16) -> Cplx16 {
    Complex::new(a.re.saturating_sub(b.re), a.im.saturating_sub(b.im))
}

/// Rounds a real value to the fixed-point format `Q<q_format>`.
///
/// Values beyond the i16 range saturate.
pub fn quantize(v: f32, q_format: u8) -> i16 {
    let scaled = (v as f64 * (1u32 << q_format) as f64).round();
    scaled.clamp(i16::MIN as f64, i16::MAX as f64) as i16
}
