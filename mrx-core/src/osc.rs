// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Fine mixer: removes the sub-bin remainder the integer bin shift could
//! not, and applies Doppler plus Doppler rate.

use num_complex::Complex;

/// Time-domain complex oscillator run after the channelizer IFFT.
///
/// Frequency is `-(remainder) + doppler` Hz and ramps by `doppler_rate`
/// Hz/s. Setting the remainder to NaN forces re-initialization on the
/// next block (retune without carrying a stale phase).
pub struct FineMixer {
    sample_rate: f64,
    /// Sub-bin remainder in Hz; NaN means "reinitialize".
    remainder: f64,
    doppler: f64,
    doppler_rate: f64,
    phase: f64,
    freq: f64,
    initialized: bool,
}

impl FineMixer {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            remainder: f64::NAN,
            doppler: 0.0,
            doppler_rate: 0.0,
            phase: 0.0,
            freq: 0.0,
            initialized: false,
        }
    }

    pub fn set_remainder(&mut self, remainder_hz: f64) {
        self.remainder = remainder_hz;
        self.initialized = false;
    }

    pub fn set_doppler(&mut self, doppler_hz: f64, doppler_rate_hz_s: f64) {
        self.doppler = doppler_hz;
        self.doppler_rate = doppler_rate_hz_s;
        self.initialized = false;
    }

    fn reinit(&mut self) {
        self.phase = 0.0;
        let remainder = if self.remainder.is_finite() {
            self.remainder
        } else {
            0.0
        };
        self.freq = -remainder + self.doppler;
        self.initialized = true;
    }

    /// Multiply the block by the oscillator in place.
    pub fn mix(&mut self, buf: &mut [Complex<f32>]) {
        if !self.initialized {
            self.reinit();
        }
        if self.freq == 0.0 && self.doppler_rate == 0.0 {
            return;
        }
        let rate_step = self.doppler_rate / self.sample_rate;
        for sample in buf.iter_mut() {
            let osc = Complex::from_polar(1.0_f32, self.phase as f32);
            *sample *= osc;
            self.phase += std::f64::consts::TAU * self.freq / self.sample_rate;
            self.freq += rate_step;
        }
        self.phase = self.phase.rem_euclid(std::f64::consts::TAU);
    }
}
