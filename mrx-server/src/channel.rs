// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! The channel entity: one logical receiver identified by its ssrc.
//!
//! Configuration and the counters read by the status path live behind the
//! channel mutex; the heavyweight DSP objects are owned by the worker
//! thread and rebuilt from a configuration snapshot after restarts.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use mrx_core::demod::DemodKind;
use mrx_core::fft::InputDomain;
use mrx_core::units::{db2power, db2voltage};
use mrx_protocol::Encoding;

use crate::frontend::Frontend;

/// Reserved ssrc: dynamic-channel template, never a live channel.
pub const SSRC_TEMPLATE: u32 = 0;
/// Reserved ssrc: "all channels" broadcast.
pub const SSRC_BROADCAST: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone)]
pub struct TuneState {
    /// Target RF frequency in Hz; 0 marks an idle/template channel.
    pub freq: f64,
    /// Display shift added to the tuned frequency (CW offset etc).
    pub shift: f64,
    pub doppler: f64,
    pub doppler_rate: f64,
}

#[derive(Debug, Clone)]
pub struct FilterState {
    pub min_if: f32,
    pub max_if: f32,
    pub kaiser_beta: f32,
    /// Master-block bin index of the passband center; worker-maintained.
    pub bin_shift: i64,
    /// Sub-bin tuning remainder in Hz; NaN forces oscillator re-init.
    pub remainder: f64,
    /// Master blocks this channel failed to keep up with.
    pub drops: u64,
}

#[derive(Debug, Clone)]
pub struct Filter2State {
    /// Blocking factor; 0 disables the second filter. Clamped to 10.
    pub blocking: u32,
    pub kaiser_beta: f32,
    /// Independent sideband: split into stereo upper/lower outputs.
    pub isb: bool,
    pub low: f32,
    pub high: f32,
}

#[derive(Debug, Clone)]
pub struct OutputState {
    pub samprate: u32,
    pub channels: u32,
    pub encoding: Encoding,
    pub dest: Option<SocketAddr>,
    pub status_dest: Option<SocketAddr>,
    /// Minimum blocks aggregated per output packet, 0..=4.
    pub minpacket: u32,
    /// Manual/linear output gain, voltage ratio.
    pub gain: f32,
    /// Output ceiling, voltage ratio.
    pub headroom: f32,
    pub ttl: u32,
    pub opus_bitrate: u32,
    pub rtp_type: u8,
    pub rtp_timestamp: u32,
    pub power: f32,
    pub samples: u64,
    pub packets: u64,
    pub errors: u64,
}

#[derive(Debug, Clone)]
pub struct FmState {
    pub deemph_tc_us: f32,
    pub tone_freq: f32,
    pub threshold_extend: bool,
    pub peak_deviation: f32,
    /// Stereo decoding for WFM (set via OUTPUT_CHANNELS = 2).
    pub stereo_enable: bool,
}

#[derive(Debug, Clone)]
pub struct LinearState {
    pub envelope: bool,
    pub agc: bool,
    pub hangtime_s: f32,
    /// dB/s on the wire, stored as is; converted per block rate on build.
    pub recovery_rate_db_s: f32,
    /// Target amplitude, voltage ratio.
    pub threshold: f32,
}

#[derive(Debug, Clone)]
pub struct PllState {
    pub enable: bool,
    pub square: bool,
    pub loop_bw: f32,
}

#[derive(Debug, Clone)]
pub struct SpectrumState {
    pub bin_count: usize,
    pub bin_bw: f32,
    /// Set by the control path; the worker reallocates at a safe point
    /// and clears it. Status skips the bin vector while this is pending.
    pub params_changed: bool,
}

/// Everything the control plane and status emitter share with the worker.
#[derive(Debug, Clone)]
pub struct ChannelState {
    pub tune: TuneState,
    pub filter: FilterState,
    pub filter2: Filter2State,
    pub output: OutputState,
    pub demod_type: DemodKind,
    pub fm: FmState,
    pub linear: LinearState,
    pub pll: PllState,
    pub spectrum: SpectrumState,
    /// Squelch thresholds, linear power ratios; 0.0 = always open.
    pub squelch_open: f32,
    pub squelch_close: f32,
    pub snr_squelch_enable: bool,
    pub preset: String,
    pub options: u64,

    /// Single-slot pending command; overwrites are refused.
    pub pending: Option<Vec<u8>>,
    pub command_tag: i32,
    /// Staggered broadcast countdown, in blocks; 0 = inactive.
    pub global_timer: u32,
    /// Unsolicited status interval in blocks; 0 = command-driven only.
    pub output_interval: u32,
    /// Idle-expire countdown in blocks; 0 = static channel, never expires.
    pub lifetime: u32,
    pub inuse: bool,
    /// Worker must tear down and rebuild its DSP at the next boundary.
    pub restart_pending: bool,
    /// Worker must rebuild the channel filter at the next boundary.
    pub filter_pending: bool,

    pub packets_in: u64,
    pub packets_out: u64,
    pub blocks_since_poll: u64,
}

impl ChannelState {
    /// Template state for a freshly created channel, before presets and
    /// the creating command are applied.
    pub fn template(frontend: &Frontend, block_rate: f64) -> Self {
        let samprate = round_samprate(24_000, block_rate);
        Self {
            tune: TuneState {
                freq: 0.0,
                shift: 0.0,
                doppler: 0.0,
                doppler_rate: 0.0,
            },
            filter: FilterState {
                min_if: -5_000.0,
                max_if: 5_000.0,
                kaiser_beta: 11.0,
                bin_shift: 0,
                remainder: f64::NAN,
                drops: 0,
            },
            filter2: Filter2State {
                blocking: 0,
                kaiser_beta: 11.0,
                isb: false,
                low: -3_000.0,
                high: 3_000.0,
            },
            output: OutputState {
                samprate,
                channels: 1,
                encoding: Encoding::S16Be,
                dest: None,
                status_dest: None,
                minpacket: 0,
                gain: 1.0,
                headroom: db2voltage(-15.0),
                ttl: 1,
                opus_bitrate: 32_000,
                rtp_type: 0,
                rtp_timestamp: 0,
                power: 0.0,
                samples: 0,
                packets: 0,
                errors: 0,
            },
            demod_type: DemodKind::Fm,
            fm: FmState {
                deemph_tc_us: 750.0,
                tone_freq: 0.0,
                threshold_extend: false,
                peak_deviation: 5_000.0,
                stereo_enable: false,
            },
            linear: LinearState {
                envelope: false,
                agc: true,
                hangtime_s: 1.1,
                recovery_rate_db_s: 20.0,
                threshold: db2voltage(-15.0),
            },
            pll: PllState {
                enable: false,
                square: false,
                loop_bw: 100.0,
            },
            spectrum: SpectrumState {
                bin_count: 64,
                bin_bw: 1_000.0,
                params_changed: false,
            },
            squelch_open: db2power(8.0),
            squelch_close: db2power(7.0),
            snr_squelch_enable: false,
            preset: String::new(),
            options: 0,
            pending: None,
            command_tag: 0,
            global_timer: 0,
            output_interval: 0,
            lifetime: 0,
            inuse: false,
            restart_pending: false,
            filter_pending: false,
            packets_in: 0,
            packets_out: 0,
            blocks_since_poll: 0,
        }
        .clamped(frontend)
    }

    /// Enforce the passband invariants against the frontend coverage:
    /// edges ordered, within ±samprate/2 (or DC..Nyquist for real), and
    /// no wider than the output rate.
    pub fn clamp_passband(&mut self, frontend: &Frontend) {
        let limit = frontend.samprate as f32 / 2.0;
        let floor = match frontend.domain {
            InputDomain::Real => 0.0,
            InputDomain::Complex => -limit,
        };
        self.filter.min_if = self.filter.min_if.clamp(floor, limit);
        self.filter.max_if = self.filter.max_if.clamp(floor, limit);
        if self.filter.min_if >= self.filter.max_if {
            self.filter.min_if = self.filter.max_if - 100.0;
        }
        let max_width = self.output.samprate as f32;
        if self.filter.max_if - self.filter.min_if > max_width {
            let center = (self.filter.max_if + self.filter.min_if) / 2.0;
            self.filter.min_if = center - max_width / 2.0;
            self.filter.max_if = center + max_width / 2.0;
        }
    }

    fn clamped(mut self, frontend: &Frontend) -> Self {
        self.clamp_passband(frontend);
        self
    }

    /// `squelch_open >= squelch_close` whenever both are active.
    pub fn clamp_squelch(&mut self) {
        if self.squelch_open > 0.0 && self.squelch_close > 0.0 {
            self.squelch_close = self.squelch_close.min(self.squelch_open);
        }
    }
}

/// Force an output sample rate onto a whole multiple of the block rate.
pub fn round_samprate(samprate: u32, block_rate: f64) -> u32 {
    let block_rate = block_rate.max(1.0);
    let multiple = (samprate as f64 / block_rate).round().max(1.0);
    (multiple * block_rate).round() as u32
}

pub struct Channel {
    pub ssrc: u32,
    pub frontend: Arc<Frontend>,
    state: Mutex<ChannelState>,
}

impl Channel {
    pub fn new(ssrc: u32, frontend: Arc<Frontend>, state: ChannelState) -> Self {
        Self {
            ssrc,
            frontend,
            state: Mutex::new(state),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ChannelState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Dynamic RTP payload type from the output parameters, stable across
/// both ends of the wire.
pub fn pt_from_info(samprate: u32, channels: u32, encoding: Encoding) -> u8 {
    let rate_idx = match samprate {
        8_000 => 0u8,
        12_000 => 1,
        16_000 => 2,
        24_000 => 3,
        44_100 => 4,
        48_000 => 5,
        _ => 6,
    };
    let enc_idx = encoding as u8;
    96 + ((enc_idx * 14 + rate_idx * 2 + (channels.saturating_sub(1) as u8)) % 32)
}
