//! Range stage, run once per chirp.
use num_complex::Complex;

use super::{lock, DataPath};
use crate::errors::PipelineError;
use crate::fixed::{csub_sat16, sat_i16};
use crate::metrics::StageTimer;
use crate::transfer::Channel;
use crate::window::windowing16x16_even;

impl DataPath {
    pub(super) fn chirp(&mut self, samples: &[crate::fixed::Cplx16]) -> Result<(), PipelineError> {
        let expected = self.cfg.num_rx_antennas * self.cfg.num_adc_samples;
        if samples.len() != expected {
            return Err(PipelineError::ChirpLength {
                given: samples.len(),
                expected,
            });
        }
        if self.chirp_count == 0 {
            if self.frame_ready {
                log::warn!("Frame {} dropped before processing", self.frame_index);
                self.frame_ready = false;
                self.frame_index += 1;
            }
            self.metrics.reset();
        }

        let mut timer = StageTimer::start();
        lock(&self.regions.adc_data)?.copy_from_slice(samples);

        let pp = self.chirp_count & 1;
        // The slot written two chirps ago must have left before it is reused
        timer.wait(|| self.engine.wait_transfer(Channel::RANGE_OUT[pp]))?;

        self.range_fft(pp, &mut timer)?;
        if self.cfg.dc_range_sig.enabled {
            self.dc_range_signature(pp)?;
        }

        let num_rx = self.cfg.num_rx_antennas;
        let nr = self.cfg.num_range_bins;
        let chirp_idx = self.tx_count * self.cfg.num_doppler_bins + self.doppler_count;
        self.engine
            .set_destination_offset(Channel::RANGE_OUT[pp], chirp_idx * num_rx * nr)?;
        self.engine.start_transfer(Channel::RANGE_OUT[pp])?;

        self.chirp_count += 1;
        self.tx_count += 1;
        if self.tx_count == self.cfg.num_tx_antennas {
            self.tx_count = 0;
            self.doppler_count += 1;
            if self.doppler_count == self.cfg.num_doppler_bins {
                self.doppler_count = 0;
                self.chirp_count = 0;
                self.frame_ready = true;
            }
        }

        let (processing, waiting) = timer.finish();
        self.metrics.inter_chirp_processing += processing;
        self.metrics.inter_chirp_wait += waiting;
        self.metrics.chirps += 1;
        Ok(())
    }

    /// Windowed, zero padded range FFT of every receive antenna into
    /// `fft_out_1d[pp]`.
    fn range_fft(&mut self, pp: usize, timer: &mut StageTimer) -> Result<(), PipelineError> {
        let num_rx = self.cfg.num_rx_antennas;
        let nadc = self.cfg.num_adc_samples;
        let nr = self.cfg.num_range_bins;

        self.engine.set_source_offset(Channel::RANGE_IN[0], 0)?;
        self.engine.start_transfer(Channel::RANGE_IN[0])?;

        let mut fft_out = lock(&self.regions.fft_out_1d[pp])?;
        for ant in 0..num_rx {
            let slot = ant & 1;
            timer.wait(|| self.engine.wait_transfer(Channel::RANGE_IN[slot]))?;
            if ant + 1 < num_rx {
                let next = Channel::RANGE_IN[slot ^ 1];
                self.engine.set_source_offset(next, (ant + 1) * nadc)?;
                self.engine.start_transfer(next)?;
            }

            {
                let adc_in = lock(&self.regions.adc_in[slot])?;
                windowing16x16_even(&adc_in[..nadc], &self.window_1d, &mut self.range_scratch[..nadc]);
            }
            self.range_scratch[nadc..].fill(Complex::new(0, 0));
            self.kernel
                .fft16(&self.range_scratch, &mut fft_out[ant * nr..(ant + 1) * nr]);
        }
        Ok(())
    }

    /// Estimates the DC range signature over the first chirps of the session
    /// and removes it from every later chirp.
    ///
    /// The mean is kept per transmit slot and receive antenna.
    fn dc_range_signature(&mut self, pp: usize) -> Result<(), PipelineError> {
        let dc = self.cfg.dc_range_sig;
        let num_rx = self.cfg.num_rx_antennas;
        let nr = self.cfg.num_range_bins;
        let nb = self.dc_bins.len();
        let limit = dc.num_avg_chirps * self.cfg.num_tx_antennas;
        let tx = self.tx_count;

        if self.dc_calib_counter == 0 {
            self.dc_range_sig_mean.fill(Complex::new(0, 0));
        }

        let mut fft_out = lock(&self.regions.fft_out_1d[pp])?;
        if self.dc_calib_counter < limit {
            for rx in 0..num_rx {
                let mean = &mut self.dc_range_sig_mean[(tx * num_rx + rx) * nb..][..nb];
                for (m, &bin) in mean.iter_mut().zip(&self.dc_bins) {
                    let x = fft_out[rx * nr + bin];
                    m.re += x.re as i32;
                    m.im += x.im as i32;
                }
            }
            self.dc_calib_counter += 1;
            if self.dc_calib_counter == limit {
                let shift = dc.num_avg_chirps.trailing_zeros();
                for m in self.dc_range_sig_mean.iter_mut() {
                    m.re >>= shift;
                    m.im >>= shift;
                }
                log::info!("DC range signature estimated over {} chirps", limit);
            }
        } else {
            for rx in 0..num_rx {
                let mean = &self.dc_range_sig_mean[(tx * num_rx + rx) * nb..][..nb];
                for (m, &bin) in mean.iter().zip(&self.dc_bins) {
                    let x = &mut fft_out[rx * nr + bin];
                    *x = csub_sat16(*x, Complex::new(sat_i16(m.re), sat_i16(m.im)));
                }
            }
        }
        Ok(())
    }

    /// Waits for both range output channels.
    pub(super) fn drain_range_out(&mut self) -> Result<(), PipelineError> {
        let mut timer = StageTimer::start();
        for ch in Channel::RANGE_OUT {
            timer.wait(|| self.engine.wait_transfer(ch))?;
        }
        let (_, waiting) = timer.finish();
        self.metrics.inter_chirp_wait += waiting;
        Ok(())
    }
}
