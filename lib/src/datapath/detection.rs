//! Detection stage: range-direction CFAR along every flagged Doppler line,
//! then peak grouping.
use super::{lock, DataPath};
use crate::cfar::cfar_ca_db_so_go;
use crate::errors::PipelineError;
use crate::grouping::group_peaks;
use crate::metrics::StageTimer;
use crate::objects::CandidateObject;
use crate::transfer::Channel;

impl DataPath {
    pub(super) fn detection_stage(&mut self, timer: &mut StageTimer) -> Result<(), PipelineError> {
        let num_lines = self.doppler_lines.num_active();
        let max_raw = self.cfg.max_raw_candidates;
        let mut dropped = 0usize;
        self.candidates.clear();
        self.objects.clear();

        if num_lines > 0 {
            let mut line = self.doppler_lines.next_line()?;
            self.engine.set_source_offset(Channel::DET_MATRIX_IN[0], line)?;
            self.engine.start_transfer(Channel::DET_MATRIX_IN[0])?;

            for i in 0..num_lines {
                let pp = i & 1;
                timer.wait(|| self.engine.wait_transfer(Channel::DET_MATRIX_IN[pp]))?;
                let next = if i + 1 < num_lines {
                    let next = self.doppler_lines.next_line()?;
                    let channel = Channel::DET_MATRIX_IN[pp ^ 1];
                    self.engine.set_source_offset(channel, next)?;
                    self.engine.start_transfer(channel)?;
                    Some(next)
                } else {
                    None
                };

                let column = lock(&self.regions.sum_abs_range[pp])?;
                self.cfar_index_buf.clear();
                cfar_ca_db_so_go(&column, &self.cfg.cfar_range, &mut self.cfar_index_buf);
                for &range in &self.cfar_index_buf {
                    if self.candidates.len() < max_raw {
                        self.candidates.push(CandidateObject {
                            range_idx: range as u16,
                            doppler_idx: line as u16,
                            peak_val: column[range],
                        });
                    } else {
                        dropped += 1;
                    }
                }
                drop(column);

                if let Some(next) = next {
                    line = next;
                }
            }
        }
        if dropped > 0 {
            log::warn!("Candidate list full, dropped {} CFAR detections", dropped);
        }
        self.metrics.raw_candidates = self.candidates.len();

        let det_matrix = lock(&self.regions.det_matrix)?;
        group_peaks(
            &self.candidates,
            &det_matrix,
            self.cfg.num_doppler_bins,
            &self.cfg.peak_grouping,
            self.cfg.max_detected_objects,
            &mut self.objects,
        );
        Ok(())
    }
}
