//! Bitset of Doppler lines flagged by the Doppler-direction CFAR.
use crate::errors::PipelineError;

/// One bit per Doppler bin, drained in ascending order by a cursor.
#[derive(Debug, Clone)]
pub struct DopplerLineMask {
    words: Vec<u32>,
    num_bins: usize,
    cursor: usize,
    active: usize,
}

impl DopplerLineMask {
    pub fn new(num_bins: usize) -> Self {
        Self::with_words(vec![0; num_bins.div_ceil(32).max(1)], num_bins)
    }

    /// Mask over caller-provided storage, which must hold at least one bit
    /// per bin.
    pub fn with_words(mut words: Vec<u32>, num_bins: usize) -> Self {
        if words.len() * 32 < num_bins {
            words.resize(num_bins.div_ceil(32), 0);
        }
        words.fill(0);
        Self {
            words,
            num_bins,
            cursor: 0,
            active: 0,
        }
    }

    /// Clears every line and rewinds the cursor.
    pub fn reset(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
        self.cursor = 0;
        self.active = 0;
    }

    /// Flags a line. Returns whether the line was newly set.
    pub fn set(&mut self, idx: usize) -> bool {
        if self.is_set(idx) {
            return false;
        }
        self.words[idx >> 5] |= 1 << (idx & 31);
        self.active += 1;
        true
    }

    pub fn is_set(&self, idx: usize) -> bool {
        self.words[idx >> 5] & (1 << (idx & 31)) != 0
    }

    /// Number of distinct lines flagged since the last reset.
    pub fn num_active(&self) -> usize {
        self.active
    }

    /// Returns the next flagged line at or after the cursor and moves the
    /// cursor past it.
    ///
    /// Asking for more lines than were flagged is a consistency error.
    pub fn next_line(&mut self) -> Result<usize, PipelineError> {
        while self.cursor < self.num_bins {
            let idx = self.cursor;
            self.cursor += 1;
            if self.is_set(idx) {
                return Ok(idx);
            }
        }
        Err(PipelineError::DopplerLineOverrun {
            cursor: self.cursor,
            num_bins: self.num_bins,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_drained_once_in_ascending_order() {
        let mut mask = DopplerLineMask::new(64);
        for idx in [40, 3, 33, 3, 0, 63] {
            mask.set(idx);
        }
        assert_eq!(mask.num_active(), 5);

        let drained: Vec<usize> = (0..mask.num_active())
            .map(|_| mask.next_line().unwrap())
            .collect();
        assert_eq!(drained, vec![0, 3, 33, 40, 63]);
        assert!(mask.next_line().is_err());
    }

    /// Without any flagged line the cursor must stop with an error instead
    /// of scanning forever.
    #[test]
    fn test_empty_mask_overruns() {
        let mut mask = DopplerLineMask::new(16);
        mask.set(5);
        mask.reset();
        assert_eq!(
            mask.next_line(),
            Err(PipelineError::DopplerLineOverrun {
                cursor: 16,
                num_bins: 16
            })
        );
    }

    #[test]
    fn test_set_is_idempotent() {
        let mut mask = DopplerLineMask::new(16);
        assert!(mask.set(7));
        assert!(!mask.set(7));
        assert!(mask.is_set(7));
        assert!(!mask.is_set(6));
        assert_eq!(mask.num_active(), 1);
    }

    #[test]
    fn test_mask_over_provided_storage() {
        let mut mask = DopplerLineMask::with_words(vec![u32::MAX; 1], 16);
        assert_eq!(mask.num_active(), 0);
        assert!(!mask.is_set(3));
        assert!(mask.set(3));
        assert_eq!(mask.next_line().unwrap(), 3);

        let mask = DopplerLineMask::with_words(Vec::new(), 64);
        assert!(!mask.is_set(63));
    }
}
