//! Angle stage: gathers one compensated symbol per virtual antenna for
//! every detected object and estimates its position.
use num_complex::Complex;

use super::doppler::remove_clutter;
use super::{lock, DataPath};
use crate::compensation::{apply_bias, decode_bpm, rotate};
use crate::config::{AngleMode, DopplerSampling};
use crate::doa::{
    estimate_azimuth, estimate_azimuth_elevation, estimate_range_only, fill_grid, near_field_correction,
    transform_grid,
};
use crate::errors::PipelineError;
use crate::kernel::magnitude_squared;
use crate::metrics::StageTimer;
use crate::objects::doppler_to_unsigned;
use crate::transfer::Channel;
use crate::window::windowing16x32;

impl DataPath {
    pub(super) fn angle_stage(&mut self, timer: &mut StageTimer) -> Result<(), PipelineError> {
        let num_objects = self.objects.len();
        if self.derived.num_virtual_antennas == 1 {
            for obj in self.objects.iter_mut() {
                estimate_range_only(obj, &self.cfg);
            }
            return Ok(());
        }

        // Objects appended by multi-object beamforming are already resolved
        for idx in 0..num_objects {
            self.gather_symbols(idx, timer)?;
            if !self.grid_estimate(idx) {
                self.azimuth_spectrum(idx);
            }
        }
        Ok(())
    }

    /// Fills `azimuth_in[..num_virtual_antennas]` with the Doppler, BPM and
    /// bias compensated symbols of `objects[idx]`; the rest is zeroed.
    fn gather_symbols(&mut self, idx: usize, timer: &mut StageTimer) -> Result<(), PipelineError> {
        let obj = self.objects[idx];
        let range = obj.range_idx as usize;
        let nd = self.cfg.num_doppler_bins;
        let num_rx = self.cfg.num_rx_antennas;
        let num_virt = self.derived.num_virtual_antennas;
        let bin = doppler_to_unsigned(obj.doppler_idx, nd);

        self.azimuth_in.fill(Complex::new(0, 0));
        let offset = self.cube_offset(0, 0, range);
        self.engine.set_source_offset(Channel::ANGLE_IN[0], offset)?;
        self.engine.start_transfer(Channel::ANGLE_IN[0])?;

        for v in 0..num_virt {
            let pp = v & 1;
            timer.wait(|| self.engine.wait_transfer(Channel::ANGLE_IN[pp]))?;
            if v + 1 < num_virt {
                let (tx, rx) = self.antenna_slot(v + 1);
                let offset = self.cube_offset(tx, rx, range);
                self.engine.set_source_offset(Channel::ANGLE_IN[pp ^ 1], offset)?;
                self.engine.start_transfer(Channel::ANGLE_IN[pp ^ 1])?;
            }

            let (tx, rx) = self.antenna_slot(v);
            let mut column = lock(&self.regions.doppler_in[pp])?;
            if self.cfg.clutter_removal {
                remove_clutter(&mut column, self.derived.log2_doppler_bins);
            }
            self.azimuth_in[tx * num_rx + rx] = match self.cfg.doppler_sampling {
                DopplerSampling::SingleBinDft => {
                    self.kernel
                        .single_bin_dft(&column, &self.window_2d, &self.tables.dft_table, bin)
                }
                DopplerSampling::FullFft => {
                    windowing16x32(&column, &self.window_2d, &mut self.windowing_buf_2d);
                    self.kernel
                        .fft32(&self.windowing_buf_2d, &mut self.fft_out_2d[..nd]);
                    self.fft_out_2d[bin]
                }
            };
        }

        if self.cfg.num_tx_antennas > 1 {
            let coeff = self.tables.doppler_coefficient(obj.doppler_idx as i32);
            rotate(&mut self.azimuth_in[num_rx..num_virt], coeff);
            if self.cfg.bpm_enabled {
                let (a, b) = self.azimuth_in.split_at_mut(num_rx);
                decode_bpm(a, &mut b[..num_rx]);
            }
        }
        apply_bias(&mut self.azimuth_in[..num_virt], &self.tables.rx_channel_comp);
        Ok(())
    }

    /// 2D estimation on the angle grid. Returns `false` when the array is
    /// linear.
    fn grid_estimate(&mut self, idx: usize) -> bool {
        let (AngleMode::AzimuthElevation(layout), Some(grid)) = (&self.cfg.angle_mode, self.doa_grid.as_mut())
        else {
            return false;
        };
        let num_virt = self.derived.num_virtual_antennas;
        fill_grid(&self.azimuth_in[..num_virt], layout, grid);
        transform_grid(self.kernel.as_mut(), grid, layout.num_rows());
        estimate_azimuth_elevation(&mut self.objects[idx], grid, &self.cfg);
        true
    }

    /// Azimuth FFT of the gathered symbols and the linear array estimator.
    ///
    /// Extended velocity adds a second hypothesis with the second transmit
    /// slot negated; near field correction moves the second slot into its
    /// own FFT and recombines the spectra.
    fn azimuth_spectrum(&mut self, idx: usize) {
        let na = self.cfg.num_angle_bins;
        let num_rx = self.cfg.num_rx_antennas;
        let num_virt = self.derived.num_virtual_antennas;
        let range = self.objects[idx].range_idx;
        let extended = self.cfg.extended_max_velocity;
        let nf = self.cfg.near_field;
        let near = nf.enabled && (nf.start_range_idx..=nf.end_range_idx).contains(&(range as usize));

        let (first, second) = self.azimuth_in.split_at_mut(na);
        if extended {
            second[..num_virt].copy_from_slice(&first[..num_virt]);
            for x in &mut second[num_rx..num_virt] {
                *x = Complex::new(x.re.saturating_neg(), x.im.saturating_neg());
            }
        } else if near {
            second[..num_rx].copy_from_slice(&first[num_rx..2 * num_rx]);
            first[num_rx..2 * num_rx].fill(Complex::new(0, 0));
        }

        self.kernel
            .fft32(&self.azimuth_in[..na], &mut self.azimuth_out[..na]);
        if extended || near {
            self.kernel
                .fft32(&self.azimuth_in[na..], &mut self.azimuth_out[na..]);
        }
        if near {
            let (out0, out1) = self.azimuth_out.split_at_mut(na);
            near_field_correction(out0, out1, range, &self.cfg);
        }

        let len = if extended { 2 * na } else { na };
        magnitude_squared(&self.azimuth_out[..len], &mut self.azimuth_mag_sqr[..len]);
        estimate_azimuth(&mut self.objects, idx, &self.azimuth_mag_sqr[..len], &self.cfg);
    }
}
