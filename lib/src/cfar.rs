//! CFAR detectors operating on log-magnitude sums.
//!
//! Inputs are in the log domain, so the noise estimate is an average of the
//! reference cells and the threshold is added rather than multiplied:
//! a cell is detected when `x > noise + threshold_scale`.
use crate::config::{CfarAveraging, CfarConfig};

fn window_sums(input: &[u16], idx: usize, cfg: &CfarConfig, wrap: bool) -> (Option<u32>, Option<u32>) {
    let len = input.len();
    let span = cfg.one_sided_span();
    let near = cfg.guard_len + 1;

    let left = if wrap || idx >= span {
        Some(
            (near..=span)
                .map(|k| input[(idx + len * span - k) % len] as u32)
                .sum(),
        )
    } else {
        None
    };
    let right = if wrap || idx + span < len {
        Some((near..=span).map(|k| input[(idx + k) % len] as u32).sum())
    } else {
        None
    };
    (left, right)
}

/// Cell-averaging CFAR over a circular axis (the Doppler direction).
///
/// Detected indices are appended to `detections` in ascending order.
pub fn cfar_ca_db_wrap(input: &[u16], cfg: &CfarConfig, detections: &mut Vec<usize>) {
    let threshold = cfg.threshold_scale as u32;
    for (idx, &x) in input.iter().enumerate() {
        if let (Some(left), Some(right)) = window_sums(input, idx, cfg, true) {
            let noise = (left + right) >> cfg.noise_div_shift;
            if x as u32 > noise + threshold {
                detections.push(idx);
            }
        }
    }
}

/// CFAR over a non-circular axis (the range direction) with selectable
/// averaging.
///
/// Away from the edges both reference windows are combined according to
/// [`CfarAveraging`]. Near an edge only the side that fits is used, scaled
/// as a single window.
pub fn cfar_ca_db_so_go(input: &[u16], cfg: &CfarConfig, detections: &mut Vec<usize>) {
    let threshold = cfg.threshold_scale as u32;
    let shift = cfg.noise_div_shift as u32;
    let one_side_shift = shift.saturating_sub(1);

    for (idx, &x) in input.iter().enumerate() {
        let noise = match window_sums(input, idx, cfg, false) {
            (Some(l), Some(r)) => match cfg.averaging {
                CfarAveraging::CellAveraging => (l + r) >> shift,
                CfarAveraging::SmallestOf => l.min(r) >> one_side_shift,
                CfarAveraging::GreatestOf => l.max(r) >> one_side_shift,
            },
            (None, Some(r)) => r >> one_side_shift,
            (Some(l), None) => l >> one_side_shift,
            (None, None) => continue,
        };
        if x as u32 > noise + threshold {
            detections.push(idx);
        }
    }
}
