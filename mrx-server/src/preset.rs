// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Named parameter bundles applied to a channel as a unit.
//!
//! A preset only carries the keys it names; applying one overwrites those
//! fields and nothing else. Later tags in the same command packet win
//! over the preset (the deferred-override rule lives in the control
//! plane, not here). The table is read-only at runtime.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use mrx_core::demod::DemodKind;
use mrx_core::units::{db2power, db2voltage};
use mrx_protocol::Encoding;

use crate::channel::{round_samprate, ChannelState};
use crate::frontend::Frontend;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Preset {
    /// "linear", "fm", "wfm" or "spectrum".
    pub demod: Option<String>,
    pub samprate: Option<u32>,
    /// Passband edges in Hz relative to the channel center.
    pub low: Option<f32>,
    pub high: Option<f32>,
    pub kaiser_beta: Option<f32>,
    /// Squelch thresholds in dB SNR.
    pub squelch_open: Option<f32>,
    pub squelch_close: Option<f32>,
    /// Deemphasis time constant, microseconds.
    pub deemph_tc: Option<f32>,
    /// CTCSS/PL tone in Hz.
    pub pl_tone: Option<f32>,
    pub threshold_extend: Option<bool>,
    pub peak_deviation: Option<f32>,
    pub channels: Option<u32>,
    pub envelope: Option<bool>,
    pub agc: Option<bool>,
    pub hangtime: Option<f32>,
    pub recovery_rate: Option<f32>,
    /// AGC target in dBFS (negative).
    pub threshold: Option<f32>,
    /// Output ceiling in dBFS (negative).
    pub headroom: Option<f32>,
    pub pll: Option<bool>,
    pub pll_square: Option<bool>,
    pub pll_bw: Option<f32>,
    pub shift: Option<f64>,
    /// "s16be", "s16le", "f32le", "opus", "none".
    pub encoding: Option<String>,
}

fn parse_demod(name: &str) -> Option<DemodKind> {
    match name.to_ascii_lowercase().as_str() {
        "linear" => Some(DemodKind::Linear),
        "fm" => Some(DemodKind::Fm),
        "wfm" => Some(DemodKind::Wfm),
        "spectrum" | "spect" => Some(DemodKind::Spect),
        _ => None,
    }
}

fn parse_encoding(name: &str) -> Option<Encoding> {
    match name.to_ascii_lowercase().as_str() {
        "none" => Some(Encoding::None),
        "s16be" => Some(Encoding::S16Be),
        "s16le" => Some(Encoding::S16Le),
        "f32le" | "f32" => Some(Encoding::F32Le),
        "opus" => Some(Encoding::Opus),
        _ => None,
    }
}

impl Preset {
    /// Overwrite the named fields of `state`. The caller compares the
    /// restart-relevant fields before and after to decide what to rebuild.
    pub fn apply(&self, state: &mut ChannelState, frontend: &Frontend, block_rate: f64) {
        if let Some(demod) = self.demod.as_deref().and_then(parse_demod) {
            state.demod_type = demod;
        }
        if let Some(samprate) = self.samprate {
            state.output.samprate = round_samprate(samprate, block_rate);
        }
        if let Some(low) = self.low {
            state.filter.min_if = low;
        }
        if let Some(high) = self.high {
            state.filter.max_if = high;
        }
        if let Some(beta) = self.kaiser_beta {
            state.filter.kaiser_beta = beta.abs();
        }
        if let Some(db) = self.squelch_open {
            state.squelch_open = db2power(db);
        }
        if let Some(db) = self.squelch_close {
            state.squelch_close = db2power(db);
        }
        if let Some(tc) = self.deemph_tc {
            state.fm.deemph_tc_us = tc;
        }
        if let Some(tone) = self.pl_tone {
            state.fm.tone_freq = tone;
        }
        if let Some(extend) = self.threshold_extend {
            state.fm.threshold_extend = extend;
        }
        if let Some(deviation) = self.peak_deviation {
            state.fm.peak_deviation = deviation;
        }
        if let Some(channels) = self.channels {
            state.output.channels = channels.clamp(1, 2);
            state.fm.stereo_enable = channels == 2;
        }
        if let Some(envelope) = self.envelope {
            state.linear.envelope = envelope;
        }
        if let Some(agc) = self.agc {
            state.linear.agc = agc;
        }
        if let Some(hang) = self.hangtime {
            state.linear.hangtime_s = hang.abs();
        }
        if let Some(rate) = self.recovery_rate {
            state.linear.recovery_rate_db_s = rate.abs();
        }
        if let Some(db) = self.threshold {
            state.linear.threshold = db2voltage(-db.abs());
        }
        if let Some(db) = self.headroom {
            state.output.headroom = db2voltage(-db.abs());
        }
        if let Some(enable) = self.pll {
            state.pll.enable = enable;
        }
        if let Some(square) = self.pll_square {
            state.pll.square = square;
        }
        if let Some(bw) = self.pll_bw {
            state.pll.loop_bw = bw.abs();
        }
        if let Some(shift) = self.shift {
            state.tune.shift = shift;
        }
        if let Some(encoding) = self.encoding.as_deref().and_then(parse_encoding) {
            state.output.encoding = encoding;
        }
        state.clamp_passband(frontend);
        state.clamp_squelch();
    }
}

#[derive(Debug)]
pub enum PresetError {
    Unknown(String),
}

impl std::fmt::Display for PresetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(name) => write!(f, "unknown preset '{}'", name),
        }
    }
}

impl std::error::Error for PresetError {}

pub struct PresetTable {
    map: HashMap<String, Preset>,
}

impl PresetTable {
    /// The stock presets every installation has; config entries with the
    /// same name replace them.
    pub fn builtin() -> Self {
        let mut map = HashMap::new();

        map.insert(
            "fm".to_string(),
            Preset {
                demod: Some("fm".into()),
                samprate: Some(24_000),
                low: Some(-8_000.0),
                high: Some(8_000.0),
                squelch_open: Some(8.0),
                squelch_close: Some(7.0),
                deemph_tc: Some(750.0),
                peak_deviation: Some(5_000.0),
                ..Preset::default()
            },
        );
        map.insert(
            "wfm".to_string(),
            Preset {
                demod: Some("wfm".into()),
                samprate: Some(48_000),
                low: Some(-100_000.0),
                high: Some(100_000.0),
                squelch_open: Some(8.0),
                squelch_close: Some(7.0),
                deemph_tc: Some(75.0),
                channels: Some(2),
                ..Preset::default()
            },
        );
        map.insert(
            "am".to_string(),
            Preset {
                demod: Some("linear".into()),
                samprate: Some(12_000),
                low: Some(-5_000.0),
                high: Some(5_000.0),
                envelope: Some(true),
                agc: Some(true),
                recovery_rate: Some(50.0),
                hangtime: Some(0.0),
                ..Preset::default()
            },
        );
        map.insert(
            "usb".to_string(),
            Preset {
                demod: Some("linear".into()),
                samprate: Some(12_000),
                low: Some(100.0),
                high: Some(3_000.0),
                envelope: Some(false),
                agc: Some(true),
                ..Preset::default()
            },
        );
        map.insert(
            "lsb".to_string(),
            Preset {
                demod: Some("linear".into()),
                samprate: Some(12_000),
                low: Some(-3_000.0),
                high: Some(-100.0),
                envelope: Some(false),
                agc: Some(true),
                ..Preset::default()
            },
        );
        map.insert(
            "cwu".to_string(),
            Preset {
                demod: Some("linear".into()),
                samprate: Some(12_000),
                low: Some(300.0),
                high: Some(1_100.0),
                shift: Some(700.0),
                agc: Some(true),
                hangtime: Some(0.2),
                ..Preset::default()
            },
        );
        map.insert(
            "iq".to_string(),
            Preset {
                demod: Some("linear".into()),
                samprate: Some(48_000),
                low: Some(-24_000.0),
                high: Some(24_000.0),
                channels: Some(2),
                agc: Some(false),
                encoding: Some("f32le".into()),
                ..Preset::default()
            },
        );
        map.insert(
            "ft8".to_string(),
            Preset {
                demod: Some("linear".into()),
                samprate: Some(12_000),
                low: Some(-3_000.0),
                high: Some(3_000.0),
                agc: Some(false),
                ..Preset::default()
            },
        );
        map.insert(
            "spectrum".to_string(),
            Preset {
                demod: Some("spectrum".into()),
                ..Preset::default()
            },
        );

        Self { map }
    }

    pub fn empty() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Layer config-file presets over the builtins.
    pub fn merge(&mut self, extra: HashMap<String, Preset>) {
        self.map.extend(extra);
    }

    pub fn get(&self, name: &str) -> Result<&Preset, PresetError> {
        self.map
            .get(name)
            .ok_or_else(|| PresetError::Unknown(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.map.keys().map(String::as_str).collect()
    }
}
