//! Detection records produced by the frame pipeline.
use crate::metrics::FrameMetrics;

/// Range-direction CFAR detection, before peak grouping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateObject {
    pub range_idx: u16,
    /// Unsigned Doppler bin
    pub doppler_idx: u16,
    pub peak_val: u16,
}

/// Progress of direction-of-arrival estimation for one object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DoaState {
    #[default]
    Pending,
    /// Coordinates hold the estimated position
    Resolved,
    /// Angle could not be computed; coordinates hold the sentinel position
    Unresolvable,
}

impl DoaState {
    pub fn as_code(&self) -> u8 {
        match self {
            DoaState::Pending => 0,
            DoaState::Resolved => 1,
            DoaState::Unresolvable => 2,
        }
    }
}

/// Object reported for a frame.
///
/// `x`, `y`, `z` are meters in the configured Q format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectedObject {
    pub range_idx: u16,
    /// Signed Doppler bin, centered on zero velocity
    pub doppler_idx: i16,
    pub peak_val: u16,
    pub x: i16,
    pub y: i16,
    pub z: i16,
    /// Peak bin of the azimuth spectrum
    pub azimuth_bin: u16,
    pub doa_state: DoaState,
}

/// Converts an unsigned Doppler bin into a signed one in `[-N/2, N/2)`.
pub fn doppler_to_signed(idx: usize, num_doppler_bins: usize) -> i16 {
    if idx < num_doppler_bins / 2 {
        idx as i16
    } else {
        (idx as i32 - num_doppler_bins as i32) as i16
    }
}

/// Converts a signed Doppler bin back into `[0, N)`.
pub fn doppler_to_unsigned(idx: i16, num_doppler_bins: usize) -> usize {
    (idx as i32).rem_euclid(num_doppler_bins as i32) as usize
}

/// Everything the pipeline hands downstream for one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameOutput {
    pub frame_index: u64,
    pub objects: Vec<DetectedObject>,
    pub metrics: FrameMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doppler_sign_conversion() {
        assert_eq!(doppler_to_signed(0, 16), 0);
        assert_eq!(doppler_to_signed(7, 16), 7);
        assert_eq!(doppler_to_signed(8, 16), -8);
        assert_eq!(doppler_to_signed(15, 16), -1);
        for idx in 0..16 {
            assert_eq!(doppler_to_unsigned(doppler_to_signed(idx, 16), 16), idx);
        }
        // extended velocity can push indices beyond one period
        assert_eq!(doppler_to_unsigned(-17, 16), 15);
    }
}
