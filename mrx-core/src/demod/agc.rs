// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Block AGC for the linear demodulator: attack-fast, release-slow, with
//! a hang interval after each attack during which gain is never raised.

use crate::units::db2voltage;

#[derive(Debug, Clone)]
pub struct BlockAgc {
    pub enabled: bool,
    /// Current gain, linear amplitude. When AGC is disabled this is the
    /// manual gain.
    gain: f32,
    /// Output ceiling, linear amplitude.
    headroom: f32,
    /// Target output amplitude the recovery converges toward.
    threshold: f32,
    /// Per-block gain multiplier while recovering.
    recovery_per_block: f32,
    hang_blocks: u32,
    hang_left: u32,
    max_gain: f32,
}

impl BlockAgc {
    pub fn new(block_rate: f32) -> Self {
        let mut agc = Self {
            enabled: true,
            gain: 1.0,
            headroom: db2voltage(-15.0),
            threshold: db2voltage(-15.0),
            recovery_per_block: 1.0,
            hang_blocks: 0,
            hang_left: 0,
            max_gain: db2voltage(120.0),
        };
        agc.set_recovery_rate(20.0, block_rate);
        agc.set_hangtime(1.1, block_rate);
        agc
    }

    /// `headroom` and `threshold` are linear amplitude ratios (already
    /// converted from dB at the control plane).
    pub fn set_levels(&mut self, headroom: f32, threshold: f32) {
        self.headroom = headroom.max(1e-6);
        self.threshold = threshold.max(1e-6);
    }

    pub fn set_recovery_rate(&mut self, db_per_sec: f32, block_rate: f32) {
        self.recovery_per_block = db2voltage(db_per_sec.abs() / block_rate.max(1.0));
    }

    pub fn set_hangtime(&mut self, seconds: f32, block_rate: f32) {
        self.hang_blocks = (seconds.abs() * block_rate).round() as u32;
    }

    pub fn set_manual_gain(&mut self, gain: f32) {
        self.enabled = false;
        self.gain = gain;
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn headroom(&self) -> f32 {
        self.headroom
    }

    pub fn hangtime_blocks(&self) -> u32 {
        self.hang_blocks
    }

    pub fn recovery_per_block(&self) -> f32 {
        self.recovery_per_block
    }

    /// Update gain from one block's peak amplitude and return the gain to
    /// apply to that block.
    pub fn process_block(&mut self, peak: f32) -> f32 {
        if !self.enabled {
            return self.gain;
        }
        if peak > 0.0 && peak * self.gain > self.headroom {
            // Attack: clamp immediately, then hold for the hang interval.
            self.gain = self.headroom / peak;
            self.hang_left = self.hang_blocks;
        } else if self.hang_left > 0 {
            self.hang_left -= 1;
        } else {
            let recovered = self.gain * self.recovery_per_block;
            // Recovery stops once the target amplitude is reached.
            self.gain = if peak > 0.0 && recovered * peak > self.threshold {
                self.gain.max(self.threshold / peak)
            } else {
                recovered
            };
        }
        self.gain = self.gain.min(self.max_gain);
        self.gain
    }
}
