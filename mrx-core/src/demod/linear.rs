// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Linear demodulator: SSB/CW/AM/IQ.
//!
//! Two sub-modes: envelope (AM: magnitude minus DC) and coherent (real
//! part of the baseband, optionally derotated by a carrier-recovery PLL).
//! Sideband selection happens upstream in the channel passband, so USB
//! and LSB both reduce to "take the real part" here.

use num_complex::Complex;

use super::agc::BlockAgc;
use super::pll::Pll;

/// Smoothing constant for the envelope DC estimate.
const DC_ALPHA: f32 = 1e-3;

#[derive(Debug, Clone)]
pub struct LinearParams {
    pub sample_rate: f32,
    /// Envelope detection (AM) instead of coherent product detection.
    pub envelope: bool,
    /// Enable the carrier-recovery PLL.
    pub pll_enable: bool,
    /// Lock the PLL to 2f (DSB-SC / BPSK).
    pub pll_square: bool,
    pub pll_loop_bw: f32,
    /// Output channel count; 2 with envelope off emits raw I/Q stereo.
    pub channels: u32,
}

impl Default for LinearParams {
    fn default() -> Self {
        Self {
            sample_rate: 12_000.0,
            envelope: false,
            pll_enable: false,
            pll_square: false,
            pll_loop_bw: 100.0,
            channels: 1,
        }
    }
}

pub struct LinearDemod {
    params: LinearParams,
    pub pll: Pll,
    pub agc: BlockAgc,
    dc: f32,
    /// Linear SNR from the PLL arms, valid while the PLL is enabled.
    pll_snr: f32,
}

impl LinearDemod {
    pub fn new(params: LinearParams, block_rate: f32) -> Self {
        let pll = Pll::new(params.sample_rate as f64, params.pll_loop_bw);
        let mut demod = Self {
            params,
            pll,
            agc: BlockAgc::new(block_rate),
            dc: 0.0,
            pll_snr: 0.0,
        };
        demod.pll.set_square(demod.params.pll_square);
        demod
    }

    pub fn params(&self) -> &LinearParams {
        &self.params
    }

    pub fn set_envelope(&mut self, envelope: bool) {
        self.params.envelope = envelope;
    }

    pub fn set_pll(&mut self, enable: bool, square: bool, loop_bw: f32) {
        self.params.pll_enable = enable;
        self.params.pll_square = square;
        self.params.pll_loop_bw = loop_bw;
        self.pll.set_square(square);
        self.pll.set_loop_bw(loop_bw);
        if !enable {
            self.pll.reset();
        }
    }

    pub fn set_channels(&mut self, channels: u32) {
        self.params.channels = channels.clamp(1, 2);
    }

    pub fn pll_snr(&self) -> f32 {
        self.pll_snr
    }

    /// Demodulate one block into PCM (interleaved when stereo). The AGC
    /// gain for the block is applied before return.
    pub fn process(&mut self, baseband: &[Complex<f32>]) -> Vec<f32> {
        if baseband.is_empty() {
            return Vec::new();
        }

        let stereo_iq = self.params.channels == 2 && !self.params.envelope;
        let mut out = Vec::with_capacity(baseband.len() * if stereo_iq { 2 } else { 1 });
        let mut peak = 0.0_f32;

        for &raw in baseband {
            let sample = if self.params.pll_enable {
                self.pll.step(raw)
            } else {
                raw
            };

            if self.params.envelope {
                let magnitude = sample.norm();
                self.dc += DC_ALPHA * (magnitude - self.dc);
                let audio = magnitude - self.dc;
                peak = peak.max(audio.abs());
                out.push(audio);
            } else if stereo_iq {
                peak = peak.max(sample.re.abs()).max(sample.im.abs());
                out.push(sample.re);
                out.push(sample.im);
            } else {
                peak = peak.max(sample.re.abs());
                out.push(sample.re);
            }
        }

        if self.params.pll_enable {
            self.pll_snr = self.pll.block_snr();
        }

        let gain = self.agc.process_block(peak);
        for sample in out.iter_mut() {
            *sample *= gain;
        }
        out
    }
}
