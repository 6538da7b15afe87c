//! Doppler stage: Doppler FFT per range bin and virtual antenna, the
//! detection matrix and the Doppler-direction CFAR.
use num_complex::Complex;

use super::{lock, DataPath};
use crate::cfar::cfar_ca_db_wrap;
use crate::compensation::{decode_bpm, rotate};
use crate::errors::PipelineError;
use crate::fixed::{cmul32_q15, sat_i16, Cplx16};
use crate::kernel::{accumulate, log2_abs32, vec_sub_const, vec_sum};
use crate::metrics::StageTimer;
use crate::objects::doppler_to_signed;
use crate::transfer::Channel;
use crate::window::windowing16x32;

/// Removes the mean over the chirps of one range bin (static clutter).
pub(super) fn remove_clutter(column: &mut [Cplx16], log2_len: u32) {
    let sum = vec_sum(column);
    let round = 1 << log2_len >> 1;
    let mean = Complex::new(
        sat_i16((sum.re + round) >> log2_len),
        sat_i16((sum.im + round) >> log2_len),
    );
    vec_sub_const(column, mean);
}

impl DataPath {
    pub(super) fn doppler_stage(&mut self, timer: &mut StageTimer) -> Result<(), PipelineError> {
        let nr = self.cfg.num_range_bins;
        let nd = self.cfg.num_doppler_bins;
        let num_virt = self.derived.num_virtual_antennas;
        let total = nr * num_virt;

        self.doppler_lines.reset();
        self.start_column(Channel::DOPPLER_IN[0], 0)?;

        for range in 0..nr {
            for v in 0..num_virt {
                let col = range * num_virt + v;
                let pp = col & 1;
                timer.wait(|| self.engine.wait_transfer(Channel::DOPPLER_IN[pp]))?;
                if col + 1 < total {
                    self.start_column(Channel::DOPPLER_IN[pp ^ 1], col + 1)?;
                }

                let (tx, rx) = self.antenna_slot(v);
                let ant = tx * self.cfg.num_rx_antennas + rx;
                if self.cfg.bpm_enabled {
                    self.doppler_fft(pp, tx * nd)?;
                    if tx == 1 {
                        self.decode_bpm_pair();
                        self.finish_column(range, ant - self.cfg.num_rx_antennas, 0, v == 1, timer)?;
                        self.finish_column(range, ant, nd, false, timer)?;
                    }
                } else {
                    self.doppler_fft(pp, 0)?;
                    self.finish_column(range, ant, 0, v == 0, timer)?;
                }
            }

            {
                let sum_abs = lock(&self.regions.sum_abs)?;
                self.cfar_index_buf.clear();
                cfar_ca_db_wrap(&sum_abs, &self.cfg.cfar_doppler, &mut self.cfar_index_buf);
            }
            for &line in &self.cfar_index_buf {
                self.doppler_lines.set(line);
            }

            self.engine
                .set_destination_offset(Channel::DetMatrixOut, range * nd)?;
            self.engine.start_transfer(Channel::DetMatrixOut)?;
        }
        timer.wait(|| self.engine.wait_transfer(Channel::DetMatrixOut))?;

        self.metrics.active_doppler_lines = self.doppler_lines.num_active();
        log::trace!("{} Doppler lines flagged", self.metrics.active_doppler_lines);
        Ok(())
    }

    /// Kicks the transfer of Doppler column `col` (range-major, then
    /// virtual antenna in processing order) on `channel`.
    fn start_column(&mut self, channel: Channel, col: usize) -> Result<(), PipelineError> {
        let num_virt = self.derived.num_virtual_antennas;
        let (tx, rx) = self.antenna_slot(col % num_virt);
        let offset = self.cube_offset(tx, rx, col / num_virt);
        self.engine.set_source_offset(channel, offset)?;
        self.engine.start_transfer(channel)?;
        Ok(())
    }

    /// Doppler FFT of the column in slot `pp` into `fft_out_2d[out..]`.
    fn doppler_fft(&mut self, pp: usize, out: usize) -> Result<(), PipelineError> {
        let nd = self.cfg.num_doppler_bins;
        {
            let mut column = lock(&self.regions.doppler_in[pp])?;
            if self.cfg.clutter_removal {
                remove_clutter(&mut column, self.derived.log2_doppler_bins);
            }
            windowing16x32(&column, &self.window_2d, &mut self.windowing_buf_2d);
        }
        self.kernel
            .fft32(&self.windowing_buf_2d, &mut self.fft_out_2d[out..out + nd]);
        Ok(())
    }

    /// Separates the two BPM spectra held side by side in `fft_out_2d`.
    ///
    /// The second slot is Doppler compensated bin by bin first, since every
    /// bin stands for a different velocity hypothesis.
    fn decode_bpm_pair(&mut self) {
        let nd = self.cfg.num_doppler_bins;
        let (a, b) = self.fft_out_2d.split_at_mut(nd);
        for (k, x) in b.iter_mut().enumerate() {
            let coeff = self
                .tables
                .doppler_coefficient(doppler_to_signed(k, nd) as i32);
            *x = cmul32_q15(*x, coeff);
        }
        decode_bpm(a, b);
    }

    /// Bias correction, heatmap entry and detection matrix accumulation for
    /// the spectrum of antenna `ant` at `fft_out_2d[out..]`.
    ///
    /// The first antenna of a range bin overwrites the accumulator, which
    /// requires the previous row to have left for the detection matrix.
    fn finish_column(
        &mut self,
        range: usize,
        ant: usize,
        out: usize,
        first: bool,
        timer: &mut StageTimer,
    ) -> Result<(), PipelineError> {
        let nd = self.cfg.num_doppler_bins;
        let num_virt = self.derived.num_virtual_antennas;
        let spectrum = &mut self.fft_out_2d[out..out + nd];

        if !self.cfg.measure_rx_channel_bias {
            rotate(spectrum, self.tables.rx_channel_comp[ant]);
        }
        let shift = self.derived.log2_doppler_bins + 4;
        self.heatmap[range * num_virt + ant] = Complex::new(
            sat_i16(spectrum[0].re >> shift),
            sat_i16(spectrum[0].im >> shift),
        );
        log2_abs32(spectrum, &mut self.log2_abs);

        if first {
            if range > 0 {
                timer.wait(|| self.engine.wait_transfer(Channel::DetMatrixOut))?;
            }
            lock(&self.regions.sum_abs)?.copy_from_slice(&self.log2_abs);
        } else {
            accumulate(&self.log2_abs, &mut lock(&self.regions.sum_abs)?);
        }
        Ok(())
    }
}
