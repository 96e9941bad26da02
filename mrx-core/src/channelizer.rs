// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Per-channel frequency-domain channelizer.
//!
//! Each master block, a contiguous bin range centered on the channel's
//! integer bin shift is extracted, multiplied by the precomputed
//! Kaiser-windowed passband response, and inverse-transformed at the
//! channel's (much smaller) FFT size. Discarding the overlap yields one
//! channel block of complex baseband at the output rate; the fine mixer
//! then removes the sub-bin remainder and applies Doppler.

use std::sync::Arc;

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::fft::{InputDomain, MasterBlock, MasterFftParams};
use crate::filter;
use crate::osc::FineMixer;

/// Fetch one master bin by signed frequency index, honoring the domain
/// edge rules: complex blocks wrap spectrally; real blocks have no
/// information at negative or super-Nyquist bins.
fn fetch_bin(block: &MasterBlock, bin: i64) -> Complex<f32> {
    match block.domain {
        InputDomain::Complex => {
            let idx = bin.rem_euclid(block.n_fft as i64) as usize;
            block.bins[idx]
        }
        InputDomain::Real => {
            if bin < 0 || bin >= block.bins.len() as i64 {
                Complex::new(0.0, 0.0)
            } else {
                block.bins[bin as usize]
            }
        }
    }
}

/// True when a requested range `[start, end]` of a real-frontend block
/// covers the whole DC..Nyquist span, enabling the direct linear mapping
/// with no zero fill.
fn covers_full_real_band(block: &MasterBlock, start: i64, end: i64) -> bool {
    block.domain == InputDomain::Real && start <= 0 && end >= block.bins.len() as i64 - 1
}

pub struct Channelizer {
    master: MasterFftParams,
    output_samprate: u32,
    /// Channel IFFT size: bins spanned in the master block.
    w: usize,
    /// Complex baseband samples emitted per master block.
    output_block: usize,
    overlap: usize,
    bin_shift: i64,
    remainder: f64,
    response: Vec<Complex<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    buf: Vec<Complex<f32>>,
    mixer: FineMixer,
}

impl Channelizer {
    /// `center_offset_hz` is the channel center relative to the frontend
    /// LO. Passband edges are relative to the channel center (IF).
    pub fn new(
        planner: &mut FftPlanner<f32>,
        master: MasterFftParams,
        output_samprate: u32,
        center_offset_hz: f64,
        min_if: f32,
        max_if: f32,
        kaiser_beta: f32,
    ) -> Self {
        let n_fft = master.n_fft();
        let w = ((output_samprate as f64 * n_fft as f64 / master.sample_rate as f64).round()
            as usize)
            .clamp(2, n_fft);
        let output_block =
            (output_samprate as u64 * master.block as u64 / master.sample_rate as u64) as usize;
        let output_block = output_block.max(1).min(w - 1);
        let overlap = w - output_block;

        // Passband response at the channel rate, impulse length filling
        // the whole overlap, with the forward-transform normalization
        // folded in.
        let taps = overlap + 1;
        let mut response = filter::passband_response(
            planner,
            w,
            output_samprate as f64,
            min_if as f64,
            max_if as f64,
            kaiser_beta,
            taps,
        );
        let scale = 1.0 / n_fft as f32;
        for h in response.iter_mut() {
            *h *= scale;
        }

        let mut chan = Self {
            master,
            output_samprate,
            w,
            output_block,
            overlap,
            bin_shift: 0,
            remainder: 0.0,
            response,
            ifft: planner.plan_fft_inverse(w),
            buf: vec![Complex::new(0.0, 0.0); w],
            mixer: FineMixer::new(output_samprate as f64),
        };
        chan.set_center(center_offset_hz);
        chan
    }

    /// Retune without rebuilding the passband: recompute the integer bin
    /// shift, hand the sub-bin remainder to the fine mixer.
    pub fn set_center(&mut self, center_offset_hz: f64) {
        let bin_bw = self.master.bin_bw();
        self.bin_shift = (center_offset_hz / bin_bw).round() as i64;
        self.remainder = center_offset_hz - self.bin_shift as f64 * bin_bw;
        self.mixer.set_remainder(self.remainder);
    }

    pub fn set_doppler(&mut self, doppler_hz: f64, doppler_rate_hz_s: f64) {
        self.mixer.set_doppler(doppler_hz, doppler_rate_hz_s);
    }

    pub fn bin_shift(&self) -> i64 {
        self.bin_shift
    }

    pub fn remainder(&self) -> f64 {
        self.remainder
    }

    pub fn output_block(&self) -> usize {
        self.output_block
    }

    pub fn output_samprate(&self) -> u32 {
        self.output_samprate
    }

    /// Impulse length of the channel passband filter.
    pub fn impulse_length(&self) -> usize {
        self.overlap + 1
    }

    pub fn ifft_size(&self) -> usize {
        self.w
    }

    /// Extract, filter and inverse-transform one master block, producing
    /// `output_block()` complex baseband samples at the output rate.
    pub fn process(&mut self, block: &MasterBlock) -> &[Complex<f32>] {
        let w = self.w as i64;
        let half = w / 2;
        let start = self.bin_shift - half;
        let end = self.bin_shift + half;

        if covers_full_real_band(block, start, end) {
            // Real frontend capturing DC..Nyquist whole: straight linear
            // mapping, no zero fill at the edges.
            let n_bins = block.bins.len();
            for (k, slot) in self.buf.iter_mut().enumerate() {
                *slot = if k < n_bins {
                    block.bins[k] * self.response[k]
                } else {
                    Complex::new(0.0, 0.0)
                };
            }
        } else {
            // Output bin k covers signed frequency index f; positive
            // frequencies sit in the low half of the IFFT input, negative
            // in the high half.
            for (k, slot) in self.buf.iter_mut().enumerate() {
                let f = if (k as i64) < half {
                    k as i64
                } else {
                    k as i64 - w
                };
                *slot = fetch_bin(block, self.bin_shift + f) * self.response[k];
            }
        }

        self.ifft.process(&mut self.buf);
        let out = &mut self.buf[self.overlap..];
        self.mixer.mix(out);
        out
    }
}
