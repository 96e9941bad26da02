// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Control-plane command decoding and the reader thread.
//!
//! Commands arrive as TLV datagrams. For an existing channel the packet
//! body is parked in the channel's single-slot pending buffer and applied
//! by its worker at the next block boundary; unknown ssrcs create a
//! channel on the spot (decoded in this thread) when a default data
//! destination is configured.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use mrx_core::demod::DemodKind;
use mrx_core::units::{db2power, db2voltage};
use mrx_protocol::decode::{
    decode_bool, decode_double, decode_float, decode_int, decode_int32, decode_socket,
    decode_string,
};
use mrx_protocol::{Encoding, PacketType, Tag, TlvScanner};

use crate::channel::{
    pt_from_info, round_samprate, Channel, ChannelState, SSRC_BROADCAST, SSRC_TEMPLATE,
};
use crate::config::Defaults;
use crate::frontend::Frontend;
use crate::preset::PresetTable;
use crate::{worker, ServerContext};

/// What the command scan decided the worker must do next.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandEffects {
    /// Tear down and rebuild the whole DSP chain.
    pub restart: bool,
    /// Rebuild the channel filter (and retune to keep the passband legal).
    pub new_filter: bool,
    /// Spectrum grid changed; skip the bin vector until reallocation.
    pub spectrum_changed: bool,
    /// Re-derive bin shift / remainder / mixer from the tune group.
    pub retune: bool,
}

/// Apply one command packet body (TLVs after the type byte) to a channel
/// state. Runs under the channel mutex, either in the worker (existing
/// channels) or the control thread (dynamic create).
pub fn apply_commands(
    state: &mut ChannelState,
    frontend: &Frontend,
    presets: &PresetTable,
    defaults: &Defaults,
    body: &[u8],
) -> CommandEffects {
    let mut effects = CommandEffects::default();

    // Idle channels (freq == 0) keep counting down: only creation and
    // retuning refresh the self-destruct timer.
    if state.lifetime != 0 {
        if state.tune.freq != 0.0 {
            state.lifetime = defaults.idle_timeout_blocks;
        } else {
            tracing::debug!(
                "command for idle channel: lifetime not refreshed ({} blocks left)",
                state.lifetime
            );
        }
    }
    state.packets_in += 1;

    // Saved so a PRESET later in the packet cannot clobber them.
    let mut override_low = f32::NAN;
    let mut override_high = f32::NAN;
    let mut override_bin_count: i64 = -1;
    let mut override_bin_bw = f32::NAN;

    let mut scanner = TlvScanner::new(body);
    while let Some(entry) = scanner.next() {
        let tag = match Tag::from_u8(entry.tag) {
            Some(tag) => tag,
            None => continue, // silently ignore unknown tags
        };
        let value = entry.value;
        match tag {
            Tag::Eol => break,
            Tag::CommandTag => state.command_tag = decode_int32(value),
            Tag::OutputSamprate => {
                let new_rate = round_samprate(decode_int(value).max(0) as u32, defaults.block_rate);
                if new_rate != state.output.samprate {
                    // Opus accepts only its native rates; ignore others.
                    if state.output.encoding.samprate_ok(new_rate) {
                        state.output.samprate = new_rate;
                        state.output.rtp_type = pt_from_info(
                            state.output.samprate,
                            state.output.channels,
                            state.output.encoding,
                        );
                        effects.restart = true;
                    }
                }
            }
            Tag::RadioFrequency => {
                let freq = decode_double(value).abs();
                if freq.is_finite() {
                    state.tune.freq = freq;
                    effects.retune = true;
                }
            }
            Tag::FirstLoFrequency => {
                let freq = decode_double(value).abs();
                if freq.is_finite() && freq != 0.0 {
                    frontend.request_tune(freq);
                }
            }
            Tag::ShiftFrequency => {
                let shift = decode_double(value);
                if shift.is_finite() {
                    state.tune.shift = shift;
                    effects.retune = true;
                }
            }
            Tag::DopplerFrequency => {
                let doppler = decode_double(value);
                if doppler.is_finite() {
                    state.tune.doppler = doppler;
                    effects.retune = true;
                }
            }
            Tag::DopplerFrequencyRate => {
                let rate = decode_double(value);
                if rate.is_finite() {
                    state.tune.doppler_rate = rate;
                    effects.retune = true;
                }
            }
            Tag::LowEdge => {
                let edge = decode_float(value);
                if edge.is_finite() {
                    override_low = edge;
                    if state.demod_type != DemodKind::Spect {
                        state.filter.min_if = edge;
                        effects.new_filter = true;
                    }
                }
            }
            Tag::HighEdge => {
                let edge = decode_float(value);
                if edge.is_finite() {
                    override_high = edge;
                    if state.demod_type != DemodKind::Spect {
                        state.filter.max_if = edge;
                        effects.new_filter = true;
                    }
                }
            }
            Tag::KaiserBeta => {
                let beta = decode_float(value).abs();
                if beta.is_finite() && beta != state.filter.kaiser_beta {
                    state.filter.kaiser_beta = beta;
                    effects.new_filter = true;
                }
            }
            Tag::Filter2KaiserBeta => {
                let beta = decode_float(value).abs();
                if beta.is_finite() && beta != state.filter2.kaiser_beta {
                    state.filter2.kaiser_beta = beta;
                    effects.new_filter = true;
                }
            }
            Tag::Preset => {
                let name = match decode_string(value) {
                    Some(name) => name,
                    None => continue,
                };
                let preset = match presets.get(&name) {
                    Ok(preset) => preset,
                    Err(err) => {
                        tracing::warn!("loadpreset failed: {}", err);
                        continue;
                    }
                };
                let old_type = state.demod_type;
                let old_samprate = state.output.samprate;
                let old_low = state.filter.min_if;
                let old_high = state.filter.max_if;
                let old_kaiser = state.filter.kaiser_beta;
                let old_shift = state.tune.shift;

                preset.apply(state, frontend, defaults.block_rate);
                state.preset = name;

                if old_shift != state.tune.shift && state.tune.freq != 0.0 {
                    // Keep the dial frequency while the shift moves.
                    state.tune.freq += state.tune.shift - old_shift;
                    effects.retune = true;
                }
                if state.filter.min_if != old_low
                    || state.filter.max_if != old_high
                    || state.filter.kaiser_beta != old_kaiser
                {
                    effects.new_filter = true;
                }
                if state.demod_type != old_type || state.output.samprate != old_samprate {
                    effects.restart = true;
                }
            }
            Tag::DemodType => {
                if let Some(kind) = DemodKind::from_wire(decode_int(value)) {
                    if kind != state.demod_type {
                        state.demod_type = kind;
                        effects.restart = true;
                    }
                }
            }
            Tag::IndependentSideband => {
                let isb = decode_bool(value);
                if isb != state.filter2.isb {
                    state.filter2.isb = isb;
                    effects.new_filter = true;
                }
            }
            Tag::ThreshExtend => state.fm.threshold_extend = decode_bool(value),
            Tag::Headroom => {
                let db = decode_float(value);
                if db.is_finite() {
                    state.output.headroom = db2voltage(-db.abs());
                }
            }
            Tag::AgcEnable => state.linear.agc = decode_bool(value),
            Tag::Gain => {
                let db = decode_float(value);
                if db.is_finite() {
                    state.output.gain = db2voltage(db);
                    // Manual gain and AGC make no sense together.
                    state.linear.agc = false;
                }
            }
            Tag::AgcHangtime => {
                let secs = decode_float(value);
                if secs.is_finite() {
                    state.linear.hangtime_s = secs.abs();
                }
            }
            Tag::AgcRecoveryRate => {
                let rate = decode_float(value);
                if rate.is_finite() {
                    state.linear.recovery_rate_db_s = rate.abs();
                }
            }
            Tag::AgcThreshold => {
                let db = decode_float(value);
                if db.is_finite() {
                    state.linear.threshold = db2voltage(-db.abs());
                }
            }
            Tag::PllEnable => state.pll.enable = decode_bool(value),
            Tag::PllBw => {
                let bw = decode_float(value);
                if bw.is_finite() {
                    state.pll.loop_bw = bw.abs();
                }
            }
            Tag::PllSquare => state.pll.square = decode_bool(value),
            Tag::Envelope => state.linear.envelope = decode_bool(value),
            Tag::SnrSquelch => state.snr_squelch_enable = decode_bool(value),
            Tag::OutputChannels => {
                let channels = decode_int(value);
                if channels != 1 && channels != 2 {
                    continue;
                }
                let channels = channels as u32;
                if state.demod_type == DemodKind::Wfm {
                    // Two channels enables FM stereo, one disables it.
                    state.fm.stereo_enable = channels == 2;
                } else if channels != state.output.channels {
                    state.output.channels = channels;
                    state.output.rtp_type = pt_from_info(
                        state.output.samprate,
                        state.output.channels,
                        state.output.encoding,
                    );
                    effects.restart = true;
                }
            }
            Tag::SquelchOpen => {
                let db = decode_float(value);
                if db.is_finite() {
                    // -999 dB or below is the "always open" sentinel.
                    state.squelch_open = if db <= -999.0 { 0.0 } else { db2power(db) };
                }
            }
            Tag::SquelchClose => {
                let db = decode_float(value);
                if db.is_finite() {
                    state.squelch_close = if db <= -999.0 { 0.0 } else { db2power(db) };
                }
            }
            Tag::NoncoherentBinBw => {
                let bw = decode_float(value);
                if bw.is_finite() {
                    override_bin_bw = bw;
                }
            }
            Tag::BinCount => {
                let count = decode_int(value);
                if count > 0 {
                    override_bin_count = count;
                }
            }
            Tag::StatusInterval => {
                let interval = decode_int(value);
                if interval >= 0 {
                    state.output_interval = interval as u32;
                }
            }
            Tag::OutputEncoding => {
                if let Some(encoding) = Encoding::from_wire(decode_int(value)) {
                    if encoding != state.output.encoding {
                        state.output.encoding = encoding;
                        if !encoding.samprate_ok(state.output.samprate) {
                            // Coerce to Opus's native rate and restart.
                            state.output.samprate = 48_000;
                            effects.restart = true;
                        }
                        state.output.rtp_type = pt_from_info(
                            state.output.samprate,
                            state.output.channels,
                            state.output.encoding,
                        );
                    }
                }
            }
            Tag::OpusBitRate => state.output.opus_bitrate = decode_int(value).unsigned_abs() as u32,
            Tag::Setopts => state.options |= decode_int(value) as u64,
            Tag::Clearopts => state.options &= !(decode_int(value) as u64),
            Tag::RfAtten | Tag::RfGain => {
                // The synthesized frontend has no gain hardware; a real
                // frontend driver would hook these.
                tracing::debug!("RF gain/attenuation not supported by this frontend");
            }
            Tag::Minpacket => {
                let minpacket = decode_int(value);
                if (0..=4).contains(&minpacket) {
                    state.output.minpacket = minpacket as u32;
                }
            }
            Tag::Filter2 => {
                let blocking = decode_int(value).clamp(0, 10) as u32;
                if blocking != state.filter2.blocking {
                    state.filter2.blocking = blocking;
                    effects.new_filter = true;
                }
            }
            Tag::OutputDataDestSocket => {
                if let Some(addr) = decode_socket(value) {
                    state.output.dest = Some(addr);
                    // Status follows the data destination, on the
                    // configured status port.
                    let status_port = defaults
                        .status_dest
                        .map(|d| d.port())
                        .unwrap_or(addr.port().saturating_add(1));
                    state.output.status_dest = Some(SocketAddr::new(addr.ip(), status_port));
                }
            }
            _ => {} // status-only tags in a command: ignore
        }
    }

    if scanner.truncated {
        // Length overflow: the rest of the packet is garbage.
        state.output.errors += 1;
    }

    // Deferred overrides: explicit edges and spectrum grid parameters win
    // over whatever a PRESET in the same packet set.
    if state.demod_type == DemodKind::Spect {
        // Edges are informational for spectrum channels; analysis uses
        // the bin grid.
        if override_bin_count > 0 && override_bin_count as usize != state.spectrum.bin_count {
            state.spectrum.bin_count = override_bin_count as usize;
            state.spectrum.params_changed = true;
            effects.spectrum_changed = true;
        }
        if override_bin_bw.is_finite() && override_bin_bw != state.spectrum.bin_bw {
            state.spectrum.bin_bw = override_bin_bw;
            state.spectrum.params_changed = true;
            effects.spectrum_changed = true;
        }
        // No presets in spectrum mode.
        state.preset.clear();
    } else {
        if override_low.is_finite() && state.filter.min_if != override_low {
            state.filter.min_if = override_low;
            effects.new_filter = true;
        }
        if override_high.is_finite() && state.filter.max_if != override_high {
            state.filter.max_if = override_high;
            effects.new_filter = true;
        }
    }

    state.clamp_passband(frontend);
    state.clamp_squelch();

    if effects.new_filter {
        // Force fine-oscillator re-init alongside the filter rebuild.
        state.filter.remainder = f64::NAN;
        state.filter_pending = true;
        effects.retune = true;
    }
    if effects.restart {
        state.restart_pending = true;
    }
    effects
}

/// Scan a packet body for OUTPUT_SSRC without applying anything.
pub fn peek_ssrc(body: &[u8]) -> Option<u32> {
    for entry in TlvScanner::new(body) {
        if entry.tag == Tag::OutputSsrc as u8 {
            return Some(decode_int(entry.value) as u32);
        }
    }
    None
}

/// Handle one received datagram. Split out of the socket loop so tests
/// can drive it directly.
pub fn handle_packet(ctx: &Arc<ServerContext>, packet: &[u8], sender: SocketAddr) {
    if packet.len() < 2 || PacketType::from_u8(packet[0]) != Some(PacketType::Cmd) {
        return; // short packet, or a status echo; ignore
    }
    let body = &packet[1..];

    let ssrc = match peek_ssrc(body) {
        Some(ssrc) => ssrc,
        None => return,
    };

    match ssrc {
        SSRC_TEMPLATE => {
            // Reserved for the dynamic-channel template.
        }
        SSRC_BROADCAST => {
            // Stagger status dumps two channels per block tick.
            for (i, chan) in ctx.registry.channels().iter().enumerate() {
                let mut state = chan.lock();
                if state.inuse {
                    state.global_timer = (i as u32 / 2) + 1;
                }
            }
        }
        _ => match ctx.registry.lookup(ssrc) {
            Some(chan) => {
                let mut state = chan.lock();
                if state.pending.is_some() {
                    // Single-slot queue: refuse the overwrite, drop ours.
                    state.output.errors += 1;
                    tracing::debug!("ssrc {}: command slot busy, dropping", ssrc);
                } else {
                    state.pending = Some(body.to_vec());
                }
            }
            None => create_channel(ctx, ssrc, body, sender),
        },
    }
}

/// Dynamic channel creation: build from the template, decode the creating
/// command right here, reply with status, then start the worker.
fn create_channel(ctx: &Arc<ServerContext>, ssrc: u32, body: &[u8], sender: SocketAddr) {
    let data_dest = match ctx.defaults.data_dest {
        Some(dest) => dest,
        None => {
            tracing::error!(
                "dynamic create of ssrc {} failed; no default data destination configured",
                ssrc
            );
            return;
        }
    };

    let mut state = ChannelState::template(&ctx.frontend, ctx.defaults.block_rate);
    state.output.dest = Some(data_dest);
    state.output.status_dest = ctx.defaults.status_dest;
    state.lifetime = ctx.defaults.idle_timeout_blocks;
    state.inuse = true;
    state.output.rtp_type = pt_from_info(
        state.output.samprate,
        state.output.channels,
        state.output.encoding,
    );

    let effects = apply_commands(
        &mut state,
        &ctx.frontend,
        &ctx.presets,
        &ctx.defaults,
        body,
    );
    // The worker builds its DSP from this state; nothing to restart yet.
    state.restart_pending = false;
    state.filter_pending = false;

    let chan = Arc::new(Channel::new(ssrc, ctx.frontend.clone(), state));
    if let Err(err) = ctx.registry.insert(chan.clone()) {
        tracing::warn!("dynamic create of ssrc {} failed: {}", ssrc, err);
        return;
    }

    {
        let mut state = chan.lock();
        state.packets_out += 1;
        let packet = crate::status::encode_status(
            &ctx.frontend,
            ssrc,
            &state,
            &crate::status::RuntimeStatus::default(),
            effects.spectrum_changed,
        );
        ctx.status.send(&packet, state.output.status_dest);
        state.global_timer = 0; // just sent one
        state.blocks_since_poll = 0;
    }

    worker::spawn(chan, ctx.clone());
    tracing::info!("dynamically started ssrc {} from {}", ssrc, sender);
}

/// Blocking reader on the control socket; exits when the stop flag rises.
pub fn control_loop(ctx: Arc<ServerContext>, socket: UdpSocket) {
    if let Err(err) = socket.set_read_timeout(Some(Duration::from_millis(100))) {
        tracing::error!("control socket timeout setup failed: {}", err);
        return;
    }
    let mut buf = [0u8; 65_536];
    while !ctx.stop.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((len, sender)) => handle_packet(&ctx, &buf[..len], sender),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => {
                tracing::warn!("control socket receive error: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrx_core::fft::InputDomain;
    use mrx_protocol::encode::*;

    fn frontend() -> Frontend {
        Frontend::new(
            "test".into(),
            1_920_000,
            InputDomain::Complex,
            16,
            0.0,
            100_000_000.0,
        )
    }

    fn defaults() -> Defaults {
        Defaults {
            data_dest: Some("239.2.1.1:5004".parse().unwrap()),
            status_dest: Some("239.2.1.2:5006".parse().unwrap()),
            idle_timeout_blocks: 100,
            block_rate: 50.0,
        }
    }

    fn fresh_state(fe: &Frontend) -> ChannelState {
        let mut state = ChannelState::template(fe, 50.0);
        state.inuse = true;
        state.lifetime = 100;
        state
    }

    #[test]
    fn test_freq_command_retunes_and_refreshes_lifetime() {
        let fe = frontend();
        let presets = PresetTable::builtin();
        let mut state = fresh_state(&fe);
        state.tune.freq = 100_100_000.0;
        state.lifetime = 3;

        let mut body = Vec::new();
        encode_double(&mut body, Tag::RadioFrequency, 100_200_000.0);
        encode_eol(&mut body);
        let effects = apply_commands(&mut state, &fe, &presets, &defaults(), &body);
        assert!(effects.retune);
        assert_eq!(state.tune.freq, 100_200_000.0);
        assert_eq!(state.lifetime, 100, "tuned channel refreshes lifetime");
    }

    #[test]
    fn test_idle_channel_lifetime_not_refreshed() {
        let fe = frontend();
        let presets = PresetTable::builtin();
        let mut state = fresh_state(&fe);
        state.tune.freq = 0.0;
        state.lifetime = 5;

        let mut body = Vec::new();
        encode_int32(&mut body, Tag::StatusInterval, 10);
        encode_eol(&mut body);
        apply_commands(&mut state, &fe, &presets, &defaults(), &body);
        assert_eq!(state.lifetime, 5, "idle channel must keep expiring");
    }

    #[test]
    fn test_samprate_change_requests_restart() {
        let fe = frontend();
        let presets = PresetTable::builtin();
        let mut state = fresh_state(&fe);

        let mut body = Vec::new();
        encode_int32(&mut body, Tag::OutputSamprate, 48_000);
        encode_eol(&mut body);
        let effects = apply_commands(&mut state, &fe, &presets, &defaults(), &body);
        assert!(effects.restart);
        assert!(state.restart_pending);
        assert_eq!(state.output.samprate, 48_000);
    }

    #[test]
    fn test_explicit_edges_override_later_preset() {
        let fe = frontend();
        let presets = PresetTable::builtin();
        let mut state = fresh_state(&fe);

        // LOW/HIGH first, then a preset that would set ±3000.
        let mut body = Vec::new();
        encode_float(&mut body, Tag::LowEdge, -1_500.0);
        encode_float(&mut body, Tag::HighEdge, 1_500.0);
        encode_string(&mut body, Tag::Preset, "ft8");
        encode_eol(&mut body);
        let effects = apply_commands(&mut state, &fe, &presets, &defaults(), &body);
        assert_eq!(state.filter.min_if, -1_500.0, "explicit low edge wins");
        assert_eq!(state.filter.max_if, 1_500.0, "explicit high edge wins");
        assert_eq!(state.preset, "ft8");
        assert!(effects.new_filter);
        assert!(state.filter.remainder.is_nan(), "oscillator re-init forced");
    }

    #[test]
    fn test_squelch_sentinel_conversion() {
        let fe = frontend();
        let presets = PresetTable::builtin();
        let mut state = fresh_state(&fe);

        let mut body = Vec::new();
        encode_float(&mut body, Tag::SquelchOpen, -999.0);
        encode_float(&mut body, Tag::SquelchClose, -1_000.0);
        encode_eol(&mut body);
        apply_commands(&mut state, &fe, &presets, &defaults(), &body);
        assert_eq!(state.squelch_open, 0.0);
        assert_eq!(state.squelch_close, 0.0);
    }

    #[test]
    fn test_gain_disables_agc() {
        let fe = frontend();
        let presets = PresetTable::builtin();
        let mut state = fresh_state(&fe);
        state.linear.agc = true;

        let mut body = Vec::new();
        encode_float(&mut body, Tag::Gain, 6.0);
        encode_eol(&mut body);
        apply_commands(&mut state, &fe, &presets, &defaults(), &body);
        assert!(!state.linear.agc);
        assert!((state.output.gain - db2voltage(6.0)).abs() < 1e-6);
    }

    #[test]
    fn test_spectrum_bin_change_defers_to_worker() {
        let fe = frontend();
        let presets = PresetTable::builtin();
        let mut state = fresh_state(&fe);
        state.demod_type = DemodKind::Spect;
        state.spectrum.bin_count = 128;

        let mut body = Vec::new();
        encode_int32(&mut body, Tag::BinCount, 256);
        encode_eol(&mut body);
        let effects = apply_commands(&mut state, &fe, &presets, &defaults(), &body);
        assert!(effects.spectrum_changed);
        assert!(state.spectrum.params_changed);
        assert_eq!(state.spectrum.bin_count, 256);
        assert!(!effects.restart, "spectrum reconfigure must not restart");
    }

    #[test]
    fn test_opus_coerces_unsupported_samprate() {
        let fe = frontend();
        let presets = PresetTable::builtin();
        let mut state = fresh_state(&fe);
        state.output.samprate = 44_100;

        let mut body = Vec::new();
        encode_int32(&mut body, Tag::OutputEncoding, Encoding::Opus as i32);
        encode_eol(&mut body);
        let effects = apply_commands(&mut state, &fe, &presets, &defaults(), &body);
        assert_eq!(state.output.samprate, 48_000);
        assert!(effects.restart);
    }

    #[test]
    fn test_malformed_tag_is_skipped() {
        let fe = frontend();
        let presets = PresetTable::builtin();
        let mut state = fresh_state(&fe);
        let before = state.clone();

        // A bogus one-byte RADIO_FREQUENCY (decodes to NaN) and an
        // unknown tag; neither may change tuning state.
        let mut body = vec![Tag::RadioFrequency as u8, 1, 0x42, 250, 1, 0x00];
        encode_eol(&mut body);
        apply_commands(&mut state, &fe, &presets, &defaults(), &body);
        assert_eq!(state.tune.freq, before.tune.freq);
    }

    #[test]
    fn test_truncated_packet_bumps_error_counter() {
        let fe = frontend();
        let presets = PresetTable::builtin();
        let mut state = fresh_state(&fe);

        // Extended length claiming 200 bytes with only one present.
        let body = vec![Tag::Preset as u8, 0x81, 200, b'x'];
        apply_commands(&mut state, &fe, &presets, &defaults(), &body);
        assert_eq!(state.output.errors, 1);
    }

    #[test]
    fn test_peek_ssrc() {
        let mut body = Vec::new();
        encode_int32(&mut body, Tag::CommandTag, 7);
        encode_int32(&mut body, Tag::OutputSsrc, 17);
        encode_eol(&mut body);
        assert_eq!(peek_ssrc(&body), Some(17));
        assert_eq!(peek_ssrc(&[0]), None);
    }
}
