//! Peak grouping
//!
//! Reduces the CFAR candidates to local maxima. Each candidate is compared
//! against a 3x3 neighbourhood (range rows, Doppler columns):
//!
//! ```text
//!            d-1  d  d+1
//!   r-1       0   1   2
//!   r         3   4   5
//!   r+1       6   7   8
//! ```
//!
//! and survives if no compared cell exceeds the centre cell 4.
use crate::config::{PeakGroupingConfig, PeakGroupingScheme};
use crate::objects::{doppler_to_signed, CandidateObject, DetectedObject};

/// Kernel cells compared against the centre, or `None` when grouping is
/// disabled in both directions.
fn compared_cells(cfg: &PeakGroupingConfig) -> Option<&'static [usize]> {
    match (cfg.in_range_direction, cfg.in_doppler_direction) {
        (true, true) => Some(&[0, 1, 2, 3, 4, 5, 6, 7, 8]),
        (true, false) => Some(&[1, 4, 7]),
        (false, true) => Some(&[3, 4, 5]),
        (false, false) => None,
    }
}

fn in_window(c: &CandidateObject, cfg: &PeakGroupingConfig) -> bool {
    (cfg.min_range_idx..=cfg.max_range_idx).contains(&(c.range_idx as usize))
}

fn to_detected(c: &CandidateObject, num_doppler_bins: usize) -> DetectedObject {
    DetectedObject {
        range_idx: c.range_idx,
        doppler_idx: doppler_to_signed(c.doppler_idx as usize, num_doppler_bins),
        peak_val: c.peak_val,
        ..Default::default()
    }
}

/// Groups `candidates` with the configured policy and appends at most
/// `max_objects` objects to `out`.
///
/// `det_matrix` is the `[range][Doppler]` detection matrix; it is only read
/// by [`PeakGroupingScheme::DetectionMatrix`].
pub fn group_peaks(
    candidates: &[CandidateObject],
    det_matrix: &[u16],
    num_doppler_bins: usize,
    cfg: &PeakGroupingConfig,
    max_objects: usize,
    out: &mut Vec<DetectedObject>,
) {
    let Some(cells) = compared_cells(cfg) else {
        out.extend(
            candidates
                .iter()
                .take(max_objects)
                .filter(|c| in_window(c, cfg))
                .map(|c| to_detected(c, num_doppler_bins)),
        );
        return;
    };

    let start = out.len();
    for (i, cand) in candidates.iter().enumerate() {
        if in_window(cand, cfg) {
            let kernel = match cfg.scheme {
                PeakGroupingScheme::DetectionMatrix => {
                    matrix_kernel(cand, det_matrix, num_doppler_bins, cfg)
                }
                PeakGroupingScheme::CandidateList => list_kernel(candidates, i, num_doppler_bins),
            };
            if cells.iter().all(|&k| kernel[k] <= kernel[4]) {
                out.push(to_detected(cand, num_doppler_bins));
            }
        }
        if out.len() - start >= max_objects {
            break;
        }
    }
}

/// Reads the neighbourhood from the detection matrix.
///
/// Doppler wraps around; rows outside the range window stay zero.
fn matrix_kernel(
    cand: &CandidateObject,
    det_matrix: &[u16],
    num_doppler_bins: usize,
    cfg: &PeakGroupingConfig,
) -> [u16; 9] {
    let mut kernel = [0u16; 9];
    let r = cand.range_idx as usize;
    let d = cand.doppler_idx as usize;
    let mask = num_doppler_bins - 1;

    for row in 0..3 {
        let has_row = match row {
            0 => r > cfg.min_range_idx,
            2 => r < cfg.max_range_idx,
            _ => true,
        };
        if !has_row {
            continue;
        }
        let base = (r + row - 1) * num_doppler_bins;
        for col in 0..3 {
            let l = (d + num_doppler_bins + col - 1) & mask;
            kernel[row * 3 + col] = det_matrix[base + l];
        }
    }
    kernel
}

/// Rebuilds the neighbourhood from CFAR detections only.
///
/// Relies on the list being ordered by Doppler line, then range. Cells that
/// were not detected stay zero.
fn list_kernel(candidates: &[CandidateObject], i: usize, num_doppler_bins: usize) -> [u16; 9] {
    let n = candidates.len();
    let cand = &candidates[i];
    let r = cand.range_idx as i32;
    let d = cand.doppler_idx as usize;
    let wrap = |x: usize| x & (num_doppler_bins - 1);
    let d_minus_1 = wrap(d + num_doppler_bins - 1);
    let d_minus_2 = wrap(d + num_doppler_bins - 2);
    let d_plus_1 = wrap(d + 1);
    let d_plus_2 = wrap(d + 2);

    let mut kernel = [0u16; 9];
    kernel[4] = cand.peak_val;

    let same_line = |other: &CandidateObject, range: i32| {
        other.doppler_idx as usize == d && other.range_idx as i32 == range
    };
    if i > 0 && same_line(&candidates[i - 1], r - 1) {
        kernel[1] = candidates[i - 1].peak_val;
    }
    if i + 1 < n && same_line(&candidates[i + 1], r + 1) {
        kernel[7] = candidates[i + 1].peak_val;
    }

    // Left column, searching backwards with wrap-around
    let mut k = (i + n - 1) % n;
    for _ in 0..n {
        let other = &candidates[k];
        let od = other.doppler_idx as usize;
        if od == d_minus_2 {
            break;
        }
        if od == d_minus_1 {
            match other.range_idx as i32 - r {
                1 => kernel[6] = other.peak_val,
                0 => kernel[3] = other.peak_val,
                -1 => kernel[0] = other.peak_val,
                _ => {}
            }
        }
        k = (k + n - 1) % n;
    }

    // Right column, searching forwards with wrap-around
    let mut k = (i + 1) % n;
    for _ in 0..n {
        let other = &candidates[k];
        let od = other.doppler_idx as usize;
        if od == d_plus_2 {
            break;
        }
        if od == d_plus_1 {
            match other.range_idx as i32 - r {
                -1 => kernel[2] = other.peak_val,
                0 => kernel[5] = other.peak_val,
                1 => kernel[8] = other.peak_val,
                _ => {}
            }
        }
        k = (k + 1) % n;
    }

    kernel
}

#[cfg(test)]
mod tests {
    use super::*;

    const NR: usize = 32;
    const ND: usize = 16;

    fn grouping(scheme: PeakGroupingScheme, range: bool, doppler: bool) -> PeakGroupingConfig {
        PeakGroupingConfig {
            scheme,
            in_range_direction: range,
            in_doppler_direction: doppler,
            min_range_idx: 1,
            max_range_idx: NR - 2,
        }
    }

    /// Builds a detection matrix and the Doppler-major candidate list that
    /// CFAR would have produced for the given cells.
    fn scene(cells: &[(usize, usize, u16)]) -> (Vec<u16>, Vec<CandidateObject>) {
        let mut matrix = vec![100u16; NR * ND];
        let mut candidates: Vec<CandidateObject> = cells
            .iter()
            .map(|&(r, d, v)| {
                matrix[r * ND + d] = v;
                CandidateObject {
                    range_idx: r as u16,
                    doppler_idx: d as u16,
                    peak_val: v,
                }
            })
            .collect();
        candidates.sort_by_key(|c| (c.doppler_idx, c.range_idx));
        (matrix, candidates)
    }

    fn run(cfg: &PeakGroupingConfig, matrix: &[u16], candidates: &[CandidateObject], cap: usize) -> Vec<DetectedObject> {
        let mut out = Vec::new();
        group_peaks(candidates, matrix, ND, cfg, cap, &mut out);
        out
    }

    #[test]
    fn test_single_peak_survives_both_policies() {
        let (matrix, candidates) = scene(&[
            (10, 3, 900),
            (10, 4, 1000),
            (10, 5, 950),
            (9, 4, 800),
            (11, 4, 850),
            (11, 5, 700),
        ]);
        for scheme in [PeakGroupingScheme::DetectionMatrix, PeakGroupingScheme::CandidateList] {
            let out = run(&grouping(scheme, true, true), &matrix, &candidates, 100);
            assert_eq!(out.len(), 1, "{:?}", scheme);
            assert_eq!(out[0].range_idx, 10);
            assert_eq!(out[0].doppler_idx, 4);
            assert_eq!(out[0].peak_val, 1000);
        }
    }

    #[test]
    fn test_doppler_wraps_around() {
        // The stronger neighbour sits on the other side of the Doppler wrap
        let (matrix, candidates) = scene(&[(10, 0, 900), (10, 15, 1000)]);
        for scheme in [PeakGroupingScheme::DetectionMatrix, PeakGroupingScheme::CandidateList] {
            let out = run(&grouping(scheme, false, true), &matrix, &candidates, 100);
            assert_eq!(out.len(), 1, "{:?}", scheme);
            assert_eq!(out[0].doppler_idx, -1);
        }
    }

    #[test]
    fn test_direction_selects_kernel_cells() {
        // Diagonal neighbour only matters when grouping in both directions
        let (matrix, candidates) = scene(&[(10, 4, 900), (11, 5, 1000)]);
        for scheme in [PeakGroupingScheme::DetectionMatrix, PeakGroupingScheme::CandidateList] {
            assert_eq!(run(&grouping(scheme, true, true), &matrix, &candidates, 100).len(), 1);
            assert_eq!(run(&grouping(scheme, true, false), &matrix, &candidates, 100).len(), 2);
            assert_eq!(run(&grouping(scheme, false, true), &matrix, &candidates, 100).len(), 2);
        }
    }

    #[test]
    fn test_disabled_grouping_passes_window() {
        let (matrix, candidates) = scene(&[(0, 2, 500), (5, 2, 600), (6, 2, 700), (31, 9, 800)]);
        for scheme in [PeakGroupingScheme::DetectionMatrix, PeakGroupingScheme::CandidateList] {
            let out = run(&grouping(scheme, false, false), &matrix, &candidates, 100);
            let ranges: Vec<u16> = out.iter().map(|o| o.range_idx).collect();
            assert_eq!(ranges, vec![5, 6]);
        }
    }

    #[test]
    fn test_output_capped() {
        let cells: Vec<(usize, usize, u16)> = (0..6).map(|i| (4 + 4 * i, 2 * i, 1000)).collect();
        let (matrix, candidates) = scene(&cells);
        for scheme in [PeakGroupingScheme::DetectionMatrix, PeakGroupingScheme::CandidateList] {
            let out = run(&grouping(scheme, true, true), &matrix, &candidates, 4);
            assert_eq!(out.len(), 4);
        }
    }

    #[test]
    fn test_range_window_edges() {
        // Row 0 lies outside the window, so the larger value there is ignored
        let mut cfg = grouping(PeakGroupingScheme::DetectionMatrix, true, false);
        cfg.min_range_idx = 1;
        let (mut matrix, candidates) = scene(&[(1, 7, 900)]);
        matrix[7] = 5000;
        assert_eq!(run(&cfg, &matrix, &candidates, 100).len(), 1);
    }
}
