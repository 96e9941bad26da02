// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Demodulator engines and their per-channel state.
//!
//! Each variant of [`Demod`] owns the state specific to that mode; the
//! channel worker dispatches by match, so there is no virtual dispatch on
//! the block path.

mod agc;
mod fm;
mod linear;
mod pll;
mod spectrum;
mod squelch;
mod wfm;

pub use agc::BlockAgc;
pub use fm::{FmDemod, FmParams};
pub use linear::{LinearDemod, LinearParams};
pub use pll::Pll;
pub use spectrum::SpectrumAccumulator;
pub use squelch::{Squelch, SquelchState};
pub use wfm::{WfmDemod, WFM_AUDIO_RATE};

/// Demodulator selector; the numeric values are the wire encoding of the
/// DEMOD_TYPE tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemodKind {
    Linear = 0,
    Fm = 1,
    Wfm = 2,
    Spect = 3,
}

impl DemodKind {
    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Linear),
            1 => Some(Self::Fm),
            2 => Some(Self::Wfm),
            3 => Some(Self::Spect),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }
}

/// Per-channel demodulator state, a tagged sum over the four engines.
pub enum Demod {
    Linear(LinearDemod),
    Fm(FmDemod),
    Wfm(WfmDemod),
    Spect(SpectrumAccumulator),
}

impl Demod {
    pub fn kind(&self) -> DemodKind {
        match self {
            Demod::Linear(_) => DemodKind::Linear,
            Demod::Fm(_) => DemodKind::Fm,
            Demod::Wfm(_) => DemodKind::Wfm,
            Demod::Spect(_) => DemodKind::Spect,
        }
    }
}

/// Single-pole deemphasis: y[n] = α·y[n-1] + (1-α)·x[n].
#[derive(Debug, Clone)]
pub struct Deemphasis {
    alpha: f32,
    gain: f32,
    y: f32,
}

impl Deemphasis {
    /// `tc_us` is the time constant in microseconds (750 for NBFM voice,
    /// 75/50 for broadcast FM).
    pub fn new(sample_rate: f32, tc_us: f32) -> Self {
        let alpha = (-1.0 / (sample_rate * tc_us * 1e-6)).exp();
        // Makeup gain: unity response at a 400 Hz voice reference, so the
        // rolloff shapes the spectrum without changing overall level.
        let w = std::f32::consts::TAU * 400.0 / sample_rate;
        let gain = (1.0 - 2.0 * alpha * w.cos() + alpha * alpha).sqrt() / (1.0 - alpha);
        Self { alpha, gain, y: 0.0 }
    }

    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        self.y = self.alpha * self.y + (1.0 - self.alpha) * x;
        self.y * self.gain
    }

    /// The `1 - α` update rate, reported in status as the deemphasis
    /// time constant.
    pub fn rate(&self) -> f32 {
        1.0 - self.alpha
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn reset(&mut self) {
        self.y = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demod_kind_wire_round_trip() {
        for kind in [
            DemodKind::Linear,
            DemodKind::Fm,
            DemodKind::Wfm,
            DemodKind::Spect,
        ] {
            assert_eq!(DemodKind::from_wire(kind.to_wire() as i64), Some(kind));
        }
        assert_eq!(DemodKind::from_wire(9), None);
    }

    #[test]
    fn test_deemphasis_attenuates_high_frequencies() {
        use std::f32::consts::TAU;
        let fs = 48_000.0;
        let mut deemph_low = Deemphasis::new(fs, 750.0);
        let mut deemph_high = Deemphasis::new(fs, 750.0);

        let mut power_low = 0.0;
        let mut power_high = 0.0;
        for n in 0..4800 {
            let t = n as f32 / fs;
            let low = deemph_low.process((TAU * 300.0 * t).sin());
            let high = deemph_high.process((TAU * 3000.0 * t).sin());
            if n >= 480 {
                power_low += low * low;
                power_high += high * high;
            }
        }
        assert!(
            power_high < power_low / 4.0,
            "3 kHz should be well below 300 Hz: {} vs {}",
            power_high,
            power_low
        );
    }
}
