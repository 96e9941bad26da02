// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Per-channel signal quality estimators: baseband power, noise density
//! and SNR.
//!
//! Noise is estimated with minimum statistics on the channel baseband:
//! track the smallest smoothed block power seen recently and let the
//! estimate creep upward slowly so it can follow a rising noise floor.

/// Fractional upward creep of the noise floor per block.
const NOISE_RISE: f32 = 0.02;
/// Smoothing constant for block power.
const POWER_ALPHA: f32 = 0.25;

#[derive(Debug, Clone)]
pub struct SignalEstimators {
    /// Smoothed mean baseband power (linear, full scale = 1).
    pub bb_power: f32,
    /// Noise power density estimate, per Hz of channel bandwidth.
    pub n0: f32,
    /// Linear power SNR of the channel passband.
    pub snr: f32,
    /// Estimated carrier/frequency offset in Hz (set by the demodulator).
    pub foffset: f32,
    bandwidth_hz: f32,
    smoothed: f32,
    noise_floor: f32,
    primed: bool,
}

impl SignalEstimators {
    pub fn new(bandwidth_hz: f32) -> Self {
        Self {
            bb_power: 0.0,
            n0: 0.0,
            snr: 0.0,
            foffset: 0.0,
            bandwidth_hz: bandwidth_hz.max(1.0),
            smoothed: 0.0,
            noise_floor: 0.0,
            primed: false,
        }
    }

    pub fn set_bandwidth(&mut self, bandwidth_hz: f32) {
        self.bandwidth_hz = bandwidth_hz.max(1.0);
    }

    /// Update from one block of complex baseband.
    pub fn update(&mut self, baseband: &[num_complex::Complex<f32>]) {
        if baseband.is_empty() {
            return;
        }
        let power: f32 =
            baseband.iter().map(|x| x.norm_sqr()).sum::<f32>() / baseband.len() as f32;
        self.smoothed += POWER_ALPHA * (power - self.smoothed);
        self.bb_power = self.smoothed;

        if !self.primed {
            self.noise_floor = self.smoothed.max(1e-20);
            self.primed = true;
        } else if self.smoothed < self.noise_floor {
            self.noise_floor = self.smoothed.max(1e-20);
        } else {
            self.noise_floor *= 1.0 + NOISE_RISE;
        }

        self.n0 = self.noise_floor / self.bandwidth_hz;
        let noise_power = self.noise_floor.max(1e-20);
        self.snr = (self.bb_power / noise_power - 1.0).max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex;

    fn noise_block(len: usize, amplitude: f32, seed: &mut u32) -> Vec<Complex<f32>> {
        (0..len)
            .map(|_| {
                *seed ^= *seed << 13;
                *seed ^= *seed >> 17;
                *seed ^= *seed << 5;
                let re = ((*seed & 0xffff) as f32 / 32768.0 - 1.0) * amplitude;
                *seed = seed.wrapping_mul(0x9e3779b9).wrapping_add(1);
                let im = ((*seed & 0xffff) as f32 / 32768.0 - 1.0) * amplitude;
                Complex::new(re, im)
            })
            .collect()
    }

    #[test]
    fn test_snr_rises_with_signal() {
        let mut est = SignalEstimators::new(5000.0);
        let mut seed = 12345_u32;
        // Prime the noise floor with noise-only blocks.
        for _ in 0..50 {
            est.update(&noise_block(256, 0.01, &mut seed));
        }
        let quiet_snr = est.snr;
        // Add a strong tone on top of the noise.
        for block_idx in 0..10 {
            let mut block = noise_block(256, 0.01, &mut seed);
            for (i, sample) in block.iter_mut().enumerate() {
                let n = (block_idx * 256 + i) as f32;
                *sample += Complex::from_polar(0.5, 0.1 * n);
            }
            est.update(&block);
        }
        assert!(
            est.snr > quiet_snr + 10.0,
            "SNR should jump with signal: {} -> {}",
            quiet_snr,
            est.snr
        );
    }

    #[test]
    fn test_noise_floor_tracks_down() {
        let mut est = SignalEstimators::new(5000.0);
        let mut seed = 999_u32;
        for _ in 0..20 {
            est.update(&noise_block(256, 0.1, &mut seed));
        }
        let loud_n0 = est.n0;
        for _ in 0..100 {
            est.update(&noise_block(256, 0.01, &mut seed));
        }
        assert!(
            est.n0 < loud_n0 / 10.0,
            "noise floor should follow a quieter input: {} -> {}",
            loud_n0,
            est.n0
        );
    }

    #[test]
    fn test_empty_block_is_ignored() {
        let mut est = SignalEstimators::new(5000.0);
        est.update(&[]);
        assert_eq!(est.bb_power, 0.0);
    }
}
