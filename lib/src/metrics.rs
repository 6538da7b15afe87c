//! Per-frame timing and counters.
use std::time::{Duration, Instant};

/// Timing and counters of one frame.
///
/// Owned by the pipeline and reset when the first chirp of a frame arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameMetrics {
    pub inter_chirp_processing: Duration,
    pub inter_chirp_wait: Duration,
    pub inter_frame_processing: Duration,
    pub inter_frame_wait: Duration,
    pub chirps: usize,
    pub active_doppler_lines: usize,
    pub raw_candidates: usize,
    pub detected_objects: usize,
}

impl FrameMetrics {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Splits elapsed time into time spent waiting on transfers and the rest.
#[derive(Debug)]
pub(crate) struct StageTimer {
    start: Instant,
    waiting: Duration,
}

impl StageTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
            waiting: Duration::ZERO,
        }
    }

    /// Runs `f` and books its duration as waiting time.
    pub fn wait<T>(&mut self, f: impl FnOnce() -> T) -> T {
        let t = Instant::now();
        let out = f();
        self.waiting += t.elapsed();
        out
    }

    /// Returns `(processing, waiting)`.
    pub fn finish(self) -> (Duration, Duration) {
        let total = self.start.elapsed();
        (total.saturating_sub(self.waiting), self.waiting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_books_wait_separately() {
        let mut timer = StageTimer::start();
        timer.wait(|| std::thread::sleep(Duration::from_millis(5)));
        let (processing, waiting) = timer.finish();
        assert!(waiting >= Duration::from_millis(5));
        assert!(processing < waiting);
    }

    #[test]
    fn test_reset() {
        let mut m = FrameMetrics {
            chirps: 4,
            raw_candidates: 2,
            ..Default::default()
        };
        m.reset();
        assert_eq!(m, FrameMetrics::default());
    }
}
