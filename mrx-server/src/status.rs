// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Status packet assembly and transmission.
//!
//! A STATUS datagram mirrors the channel and frontend state in TLV form:
//! a common block, tuning, filter state, signal estimates, mode-specific
//! fields, then the output section. Status always travels on the
//! control/status socket, never the data socket.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;

use mrx_core::demod::DemodKind;
use mrx_core::units::{power2db, voltage2db};
use mrx_protocol::encode::*;
use mrx_protocol::{PacketType, Tag};

use crate::channel::ChannelState;
use crate::frontend::Frontend;

/// Live DSP readings the worker merges into each status packet. The
/// control thread uses the default (all zero) for the creation reply,
/// before any block has been processed.
#[derive(Debug, Clone, Default)]
pub struct RuntimeStatus {
    pub bb_power: f32,
    pub n0: f32,
    pub snr: f32,
    pub foffset: f32,
    pub filter_blocksize: u32,
    pub filter_fir_length: u32,
    pub filter2_blocksize: u32,
    pub filter2_fir_length: u32,
    pub fm_snr: f32,
    pub peak_deviation: f32,
    pub deemph_rate: f32,
    pub deemph_gain: f32,
    pub tone_freq: f32,
    pub tone_deviation: f32,
    pub pll_lock: bool,
    pub pll_phase: f32,
    pub pll_wraps: i64,
    pub pll_snr: f32,
    pub agc_gain: f32,
    /// Spectrum bins, present only when the grid is stable.
    pub bins: Option<Vec<f32>>,
}

fn gps_time_ns() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Encode one status packet. `skip_spectrum` suppresses the bin vector
/// while a grid reallocation is in flight.
pub fn encode_status(
    frontend: &Frontend,
    ssrc: u32,
    state: &ChannelState,
    runtime: &RuntimeStatus,
    skip_spectrum: bool,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(512);
    buf.push(PacketType::Status as u8);

    // Common block: identity first so packet dumps are readable.
    encode_int32(&mut buf, Tag::OutputSsrc, ssrc as i32);
    encode_int32(&mut buf, Tag::CommandTag, state.command_tag);
    encode_int64(&mut buf, Tag::CmdCnt, state.packets_in as i64);
    if !frontend.description.is_empty() {
        encode_string(&mut buf, Tag::Description, &frontend.description);
    }
    encode_int32(&mut buf, Tag::RtpTimesnap, state.output.rtp_timestamp as i32);
    if let Some(dest) = state.output.status_dest {
        encode_socket(&mut buf, Tag::StatusDestSocket, &dest);
    }
    encode_int64(&mut buf, Tag::GpsTime, gps_time_ns());
    encode_int64(
        &mut buf,
        Tag::InputSamples,
        frontend.samples.load(Ordering::Relaxed) as i64,
    );
    encode_int32(&mut buf, Tag::InputSamprate, frontend.samprate as i32);
    encode_bool(
        &mut buf,
        Tag::FeIsreal,
        frontend.domain == mrx_core::fft::InputDomain::Real,
    );
    encode_double(&mut buf, Tag::Calibrate, frontend.calibrate);
    encode_float(&mut buf, Tag::RfGain, frontend.rf_gain);
    encode_float(&mut buf, Tag::RfAtten, frontend.rf_atten);
    encode_float(&mut buf, Tag::RfLevelCal, frontend.rf_level_cal);
    encode_bool(&mut buf, Tag::RfAgc, frontend.rf_agc);
    encode_int32(&mut buf, Tag::LnaGain, frontend.lna_gain);
    encode_int32(&mut buf, Tag::MixerGain, frontend.mixer_gain);
    encode_int32(&mut buf, Tag::IfGain, frontend.if_gain);
    encode_float(&mut buf, Tag::FeLowEdge, frontend.min_if);
    encode_float(&mut buf, Tag::FeHighEdge, frontend.max_if);
    encode_int32(
        &mut buf,
        Tag::AdBitsPerSample,
        frontend.bits_per_sample as i32,
    );

    // Tuning.
    encode_double(&mut buf, Tag::RadioFrequency, state.tune.freq);
    encode_double(&mut buf, Tag::FirstLoFrequency, frontend.frequency());
    let second_lo = frontend.frequency() - state.tune.freq;
    encode_double(&mut buf, Tag::SecondLoFrequency, second_lo);

    // Filter state.
    encode_int32(
        &mut buf,
        Tag::FilterBlocksize,
        runtime.filter_blocksize as i32,
    );
    encode_int32(
        &mut buf,
        Tag::FilterFirLength,
        runtime.filter_fir_length as i32,
    );
    encode_int64(&mut buf, Tag::FilterDrops, state.filter.drops as i64);

    // Input levels, scaled to full scale by the frontend's own rule.
    let if_power = frontend.if_power() * (frontend.scale_ad_power)(frontend);
    encode_float(&mut buf, Tag::IfPower, power2db(if_power));
    encode_int64(
        &mut buf,
        Tag::AdOver,
        frontend.overranges.load(Ordering::Relaxed) as i64,
    );
    encode_int64(
        &mut buf,
        Tag::SamplesSinceOver,
        frontend.samp_since_over.load(Ordering::Relaxed) as i64,
    );
    encode_float(&mut buf, Tag::NoiseDensity, power2db(runtime.n0));

    // Modulation mode.
    encode_byte(&mut buf, Tag::DemodType, state.demod_type.to_wire());
    if !state.preset.is_empty() {
        encode_string(&mut buf, Tag::Preset, &state.preset);
    }

    match state.demod_type {
        DemodKind::Linear => {
            encode_bool(&mut buf, Tag::SnrSquelch, state.snr_squelch_enable);
            encode_bool(&mut buf, Tag::PllEnable, state.pll.enable);
            if state.pll.enable {
                encode_float(&mut buf, Tag::FreqOffset, runtime.foffset);
                encode_bool(&mut buf, Tag::PllLock, runtime.pll_lock);
                encode_bool(&mut buf, Tag::PllSquare, state.pll.square);
                encode_float(&mut buf, Tag::PllPhase, runtime.pll_phase);
                encode_float(&mut buf, Tag::PllBw, state.pll.loop_bw);
                encode_int64(&mut buf, Tag::PllWraps, runtime.pll_wraps);
                encode_float(&mut buf, Tag::PllSnr, power2db(runtime.pll_snr));
            }
            encode_float(&mut buf, Tag::SquelchOpen, power2db(state.squelch_open));
            encode_float(&mut buf, Tag::SquelchClose, power2db(state.squelch_close));
            encode_bool(&mut buf, Tag::Envelope, state.linear.envelope);
            encode_double(&mut buf, Tag::ShiftFrequency, state.tune.shift);
            encode_bool(&mut buf, Tag::AgcEnable, state.linear.agc);
            if state.linear.agc {
                encode_float(&mut buf, Tag::AgcHangtime, state.linear.hangtime_s);
                encode_float(
                    &mut buf,
                    Tag::AgcThreshold,
                    voltage2db(state.linear.threshold),
                );
                encode_float(
                    &mut buf,
                    Tag::AgcRecoveryRate,
                    state.linear.recovery_rate_db_s,
                );
            }
            encode_bool(&mut buf, Tag::IndependentSideband, state.filter2.isb);
        }
        DemodKind::Fm | DemodKind::Wfm => {
            encode_bool(&mut buf, Tag::SnrSquelch, state.snr_squelch_enable);
            if state.demod_type == DemodKind::Fm && state.fm.tone_freq != 0.0 {
                encode_float(&mut buf, Tag::PlTone, runtime.tone_freq);
                encode_float(&mut buf, Tag::PlDeviation, runtime.tone_deviation);
            }
            encode_float(&mut buf, Tag::FreqOffset, runtime.foffset);
            encode_float(&mut buf, Tag::SquelchOpen, power2db(state.squelch_open));
            encode_float(&mut buf, Tag::SquelchClose, power2db(state.squelch_close));
            encode_bool(&mut buf, Tag::ThreshExtend, state.fm.threshold_extend);
            encode_float(&mut buf, Tag::PeakDeviation, runtime.peak_deviation);
            // Recover the deemphasis time constant from the update rate.
            let audio_rate = if state.demod_type == DemodKind::Wfm {
                mrx_core::demod::WFM_AUDIO_RATE as f32
            } else {
                state.output.samprate as f32
            };
            let deemph_tc = if runtime.deemph_rate > 0.0 && runtime.deemph_rate < 1.0 {
                -1.0 / ((1.0 - runtime.deemph_rate).ln() * audio_rate)
            } else {
                0.0
            };
            encode_float(&mut buf, Tag::DeemphTc, deemph_tc);
            encode_float(&mut buf, Tag::DeemphGain, voltage2db(runtime.deemph_gain));
            encode_float(&mut buf, Tag::FmSnr, power2db(runtime.fm_snr));
        }
        DemodKind::Spect => {
            encode_float(&mut buf, Tag::NoncoherentBinBw, state.spectrum.bin_bw);
            encode_int32(&mut buf, Tag::BinCount, state.spectrum.bin_count as i32);
            if !skip_spectrum {
                if let Some(bins) = &runtime.bins {
                    encode_vector(&mut buf, Tag::BinData, bins);
                }
            }
        }
    }

    encode_float(&mut buf, Tag::LowEdge, state.filter.min_if);
    encode_float(&mut buf, Tag::HighEdge, state.filter.max_if);

    if state.demod_type != DemodKind::Spect {
        encode_int32(&mut buf, Tag::OutputSamprate, state.output.samprate as i32);
        encode_int64(
            &mut buf,
            Tag::OutputDataPackets,
            state.output.packets as i64,
        );
        encode_float(&mut buf, Tag::KaiserBeta, state.filter.kaiser_beta);
        encode_int32(&mut buf, Tag::Filter2, state.filter2.blocking as i32);
        if state.filter2.blocking != 0 {
            encode_int32(
                &mut buf,
                Tag::Filter2Blocksize,
                runtime.filter2_blocksize as i32,
            );
            encode_int32(
                &mut buf,
                Tag::Filter2FirLength,
                runtime.filter2_fir_length as i32,
            );
            encode_float(&mut buf, Tag::Filter2KaiserBeta, state.filter2.kaiser_beta);
        }
        encode_float(&mut buf, Tag::BasebandPower, power2db(runtime.bb_power));
        encode_float(&mut buf, Tag::OutputLevel, power2db(state.output.power));
        if state.demod_type == DemodKind::Linear {
            // Gain is not meaningful in the FM modes.
            let gain = if state.linear.agc {
                runtime.agc_gain
            } else {
                state.output.gain
            };
            encode_float(&mut buf, Tag::Gain, voltage2db(gain));
        }
        encode_int64(&mut buf, Tag::OutputSamples, state.output.samples as i64);
        encode_int32(&mut buf, Tag::OpusBitRate, state.output.opus_bitrate as i32);
        encode_float(&mut buf, Tag::Headroom, voltage2db(state.output.headroom));
        encode_double(&mut buf, Tag::DopplerFrequency, state.tune.doppler);
        encode_double(
            &mut buf,
            Tag::DopplerFrequencyRate,
            state.tune.doppler_rate,
        );
        encode_int32(&mut buf, Tag::OutputChannels, state.output.channels as i32);
        if let Some(dest) = state.output.dest {
            encode_socket(&mut buf, Tag::OutputDataDestSocket, &dest);
        }
        encode_int32(&mut buf, Tag::OutputTtl, state.output.ttl as i32);
        encode_int64(
            &mut buf,
            Tag::OutputMetadataPackets,
            state.packets_out as i64,
        );
        encode_byte(&mut buf, Tag::RtpPt, state.output.rtp_type);
        encode_int32(&mut buf, Tag::StatusInterval, state.output_interval as i32);
        encode_int32(&mut buf, Tag::OutputEncoding, state.output.encoding as i32);
        encode_int32(&mut buf, Tag::Minpacket, state.output.minpacket as i32);
    }

    encode_int64(
        &mut buf,
        Tag::BlocksSincePoll,
        state.blocks_since_poll as i64,
    );
    encode_int64(&mut buf, Tag::Setopts, state.options as i64);
    encode_int64(&mut buf, Tag::OutputErrors, state.output.errors as i64);
    encode_eol(&mut buf);
    buf
}

/// Sends status datagrams on the control/status socket.
pub struct StatusSender {
    socket: UdpSocket,
    default_dest: Option<SocketAddr>,
}

impl StatusSender {
    pub fn new(socket: UdpSocket, default_dest: Option<SocketAddr>) -> Self {
        Self {
            socket,
            default_dest,
        }
    }

    /// Send to the channel's status destination, or the process default.
    pub fn send(&self, packet: &[u8], dest: Option<SocketAddr>) {
        let dest = match dest.or(self.default_dest) {
            Some(dest) => dest,
            None => return,
        };
        if let Err(err) = self.socket.send_to(packet, dest) {
            tracing::debug!("status send to {} failed: {}", dest, err);
        }
    }
}
