// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Non-coherent spectrum analysis: averaged power in `bin_count` output
//! bins of `bin_bw` Hz each, centered on the channel frequency.
//!
//! Output is unwrapped: most-negative frequency at index 0, DC at
//! `bin_count / 2`, most-positive at `bin_count - 1`. A real frontend
//! whose requested span covers the whole DC..Nyquist band instead maps
//! the master bins linearly onto the output.

use crate::fft::{InputDomain, MasterBlock};

pub struct SpectrumAccumulator {
    bin_count: usize,
    bin_bw: f32,
    bin_data: Vec<f32>,
    blocks: u32,
}

impl SpectrumAccumulator {
    pub fn new(bin_count: usize, bin_bw: f32) -> Self {
        Self {
            bin_count: bin_count.max(1),
            bin_bw: bin_bw.max(1.0),
            bin_data: vec![0.0; bin_count.max(1)],
            blocks: 0,
        }
    }

    pub fn bin_count(&self) -> usize {
        self.bin_count
    }

    pub fn bin_bw(&self) -> f32 {
        self.bin_bw
    }

    /// Replace the analysis grid. The old accumulation is discarded; only
    /// the owning worker calls this, at a block boundary.
    pub fn reconfigure(&mut self, bin_count: usize, bin_bw: f32) {
        self.bin_count = bin_count.max(1);
        self.bin_bw = bin_bw.max(1.0);
        self.bin_data = vec![0.0; self.bin_count];
        self.blocks = 0;
    }

    /// Number of master bins the configured span covers.
    fn input_bins(&self, block: &MasterBlock, frontend_samprate: u32) -> usize {
        let span_hz = self.bin_count as f64 * self.bin_bw as f64;
        ((span_hz * block.n_fft as f64 / frontend_samprate as f64).round() as usize).max(1)
    }

    /// Accumulate squared magnitudes from one master block.
    pub fn accumulate(&mut self, block: &MasterBlock, frontend_samprate: u32, bin_shift: i64) {
        let input_bins = self.input_bins(block, frontend_samprate);
        let per_output = (input_bins as f64 / self.bin_count as f64).max(1.0);
        let n_bins = block.bins.len() as i64;

        let full_real_band = block.domain == InputDomain::Real
            && bin_shift.abs() - (input_bins as i64) / 2 <= 0
            && bin_shift.abs() + (input_bins as i64) / 2 >= n_bins - 1;

        if full_real_band {
            // Straight linear map of all master bins onto the output grid,
            // averaging contiguous input bins per output bin.
            let step = n_bins as f64 / self.bin_count as f64;
            for (k, slot) in self.bin_data.iter_mut().enumerate() {
                let lo = (k as f64 * step) as i64;
                let hi = (((k + 1) as f64 * step) as i64).max(lo + 1).min(n_bins);
                let mut acc = 0.0_f32;
                for m in lo..hi {
                    acc += block.bins[m as usize].norm_sqr();
                }
                *slot += acc / (hi - lo) as f32;
            }
        } else {
            // Output index k=0 is the most negative frequency, DC sits at
            // bin_count/2.
            let half_out = (self.bin_count / 2) as i64;
            for (k, slot) in self.bin_data.iter_mut().enumerate() {
                let offset = k as i64 - half_out;
                let lo = bin_shift + (offset as f64 * per_output) as i64;
                let hi = (lo + per_output.ceil() as i64).max(lo + 1);
                let mut acc = 0.0_f32;
                let mut used = 0u32;
                for m in lo..hi {
                    acc += fetch_power(block, m);
                    used += 1;
                }
                *slot += acc / used.max(1) as f32;
            }
        }
        self.blocks += 1;
    }

    /// Snapshot the averaged bins and reset the accumulation, as done on
    /// each status poll.
    pub fn poll(&mut self) -> Vec<f32> {
        let scale = if self.blocks > 0 {
            1.0 / self.blocks as f32
        } else {
            0.0
        };
        let out: Vec<f32> = self.bin_data.iter().map(|&p| p * scale).collect();
        self.bin_data.iter_mut().for_each(|p| *p = 0.0);
        self.blocks = 0;
        out
    }
}

fn fetch_power(block: &MasterBlock, bin: i64) -> f32 {
    match block.domain {
        InputDomain::Complex => {
            let idx = bin.rem_euclid(block.n_fft as i64) as usize;
            block.bins[idx].norm_sqr()
        }
        InputDomain::Real => {
            if bin < 0 || bin >= block.bins.len() as i64 {
                0.0
            } else {
                block.bins[bin as usize].norm_sqr()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fft::{MasterFft, MasterFftParams};
    use num_complex::Complex;
    use rustfft::FftPlanner;

    const SAMPRATE: u32 = 96_000;

    fn params(domain: InputDomain) -> MasterFftParams {
        MasterFftParams {
            block: 960,
            impulse_length: 481,
            domain,
            sample_rate: SAMPRATE,
        }
    }

    fn complex_tone_block(freq_hz: f64) -> MasterBlock {
        let p = params(InputDomain::Complex);
        let mut planner = FftPlanner::new();
        let mut fft = MasterFft::new(&mut planner, p);
        let n = p.n_fft();
        let window: Vec<Complex<f32>> = (0..n)
            .map(|i| {
                let phase = std::f64::consts::TAU * freq_hz * i as f64 / SAMPRATE as f64;
                Complex::from_polar(1.0, phase as f32)
            })
            .collect();
        fft.process_window(&window, 0)
    }

    #[test]
    fn test_tone_lands_in_expected_output_bin() {
        // 128 bins of 500 Hz centered on +20 kHz: span 64 kHz.
        let mut spectrum = SpectrumAccumulator::new(128, 500.0);
        let p = params(InputDomain::Complex);
        let bin_shift = (20_000.0 / p.bin_bw()).round() as i64;
        // Tone 4 kHz above center: output bin 64 + 8.
        let block = complex_tone_block(24_000.0);
        spectrum.accumulate(&block, SAMPRATE, bin_shift);
        let bins = spectrum.poll();
        let peak = bins
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 64 + 8, "4 kHz / 500 Hz = 8 bins above DC");
    }

    #[test]
    fn test_dc_sits_at_center_bin() {
        let mut spectrum = SpectrumAccumulator::new(64, 500.0);
        let p = params(InputDomain::Complex);
        let bin_shift = (20_000.0 / p.bin_bw()).round() as i64;
        let block = complex_tone_block(20_000.0);
        spectrum.accumulate(&block, SAMPRATE, bin_shift);
        let bins = spectrum.poll();
        let peak = bins
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 32);
    }

    #[test]
    fn test_poll_averages_and_resets() {
        let mut spectrum = SpectrumAccumulator::new(32, 1000.0);
        let p = params(InputDomain::Complex);
        let block = complex_tone_block(0.0);
        spectrum.accumulate(&block, SAMPRATE, 0);
        spectrum.accumulate(&block, SAMPRATE, 0);
        let first = spectrum.poll();
        assert_eq!(first.len(), 32);
        let total: f32 = first.iter().sum();
        assert!(total > 0.0);
        // After the poll the accumulator is clean.
        let empty = spectrum.poll();
        assert!(empty.iter().all(|&p| p == 0.0));
    }

    #[test]
    fn test_real_full_band_has_no_zero_edges() {
        let p = params(InputDomain::Real);
        let mut planner = FftPlanner::new();
        let mut fft = MasterFft::new(&mut planner, p);
        let n = p.n_fft();
        // Broadband real noise: every bin carries energy.
        let mut state = 0x1234_5678_u32;
        let window: Vec<Complex<f32>> = (0..n)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                Complex::new((state & 0xffff) as f32 / 32768.0 - 1.0, 0.0)
            })
            .collect();
        let block = fft.process_window(&window, 0);

        // Span the whole DC..Nyquist band: 96 bins of 500 Hz = 48 kHz.
        let mut spectrum = SpectrumAccumulator::new(96, 500.0);
        let n_bins = block.bins.len() as i64;
        let input_bins = spectrum.input_bins(&block, SAMPRATE) as i64;
        let bin_shift = n_bins / 2;
        assert!(bin_shift.abs() - input_bins / 2 <= 0);
        spectrum.accumulate(&block, SAMPRATE, bin_shift);
        let bins = spectrum.poll();
        assert!(
            bins.iter().all(|&p| p > 0.0),
            "full-band real capture must not zero-pad the edges"
        );
    }

    #[test]
    fn test_reconfigure_resizes_and_clears() {
        let mut spectrum = SpectrumAccumulator::new(128, 500.0);
        let block = complex_tone_block(0.0);
        spectrum.accumulate(&block, SAMPRATE, 0);
        spectrum.reconfigure(256, 250.0);
        assert_eq!(spectrum.bin_count(), 256);
        let bins = spectrum.poll();
        assert_eq!(bins.len(), 256);
        assert!(bins.iter().all(|&p| p == 0.0));
    }
}
