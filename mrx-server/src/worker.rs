// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Per-channel worker thread.
//!
//! Each worker blocks on the master FFT sequence, ingests at most one
//! queued command per block, rebuilds its DSP when the control plane
//! demands a restart or filter change, then channelizes, demodulates and
//! emits PCM. Status packets go out on command replies, staggered
//! broadcast ticks and the per-channel interval. The channel mutex is
//! held only for the command/counter window, never while waiting on the
//! FFT condvar.

use std::sync::Arc;

use num_complex::Complex;
use rustfft::FftPlanner;

use mrx_core::channelizer::Channelizer;
use mrx_core::demod::{
    Demod, DemodKind, FmDemod, FmParams, LinearDemod, LinearParams, SpectrumAccumulator, Squelch,
    WfmDemod, WFM_AUDIO_RATE,
};
use mrx_core::estimators::SignalEstimators;
use mrx_core::fft::{MasterBlock, WaitOutcome};
use mrx_core::filter::SecondFilter;

use crate::channel::{Channel, ChannelState};
use crate::control;
use crate::output::OutputStream;
use crate::status::{encode_status, RuntimeStatus};
use crate::ServerContext;

/// Composite rate the WFM chain runs at; a multiple of both the 48 kHz
/// audio rate and any sane block rate.
const WFM_COMPOSITE_RATE: u32 = 192_000;
/// Squelch tail in blocks.
const SQUELCH_TAIL_BLOCKS: u32 = 2;

pub fn spawn(chan: Arc<Channel>, ctx: Arc<ServerContext>) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("chan-{}", chan.ssrc))
        .spawn(move || run(chan, ctx))
        .expect("failed to spawn channel worker")
}

/// The worker-owned DSP bundle, rebuilt wholesale on restart.
struct Dsp {
    /// Absent in spectrum mode, which reads master bins directly.
    channelizer: Option<Channelizer>,
    filter2: Option<SecondFilter>,
    /// Lower-sideband path for independent-sideband mode.
    filter2_lower: Option<SecondFilter>,
    demod: Demod,
    estimators: SignalEstimators,
    /// Channel center offset from the LO the channelizer was tuned to.
    center_offset: f64,
    doppler: (f64, f64),
    /// Master bin shift for the spectrum path.
    bin_shift: i64,
}

fn channel_rate(state: &ChannelState) -> u32 {
    match state.demod_type {
        DemodKind::Wfm => WFM_COMPOSITE_RATE,
        _ => state.output.samprate,
    }
}

/// Audio rate leaving the demodulator; WFM always decimates to 48 kHz.
fn audio_rate(state: &ChannelState) -> u32 {
    match state.demod_type {
        DemodKind::Wfm => WFM_AUDIO_RATE,
        _ => state.output.samprate,
    }
}

fn make_output(ssrc: u32, state: &ChannelState, block_rate: f64) -> OutputStream {
    let samprate = audio_rate(state);
    let block_frames = (samprate as f64 / block_rate.max(1.0)).round().max(1.0) as usize;
    OutputStream::new(
        ssrc,
        state.output.dest,
        state.output.encoding,
        samprate,
        state.output.channels,
        block_frames,
        state.output.minpacket,
    )
}

fn center_offset(state: &ChannelState, lo: f64) -> f64 {
    state.tune.freq + state.tune.shift - lo
}

fn build_dsp(
    planner: &mut FftPlanner<f32>,
    ctx: &ServerContext,
    state: &ChannelState,
) -> Dsp {
    let master = ctx.master_params;
    let offset = center_offset(state, ctx.frontend.frequency());
    let rate = channel_rate(state);
    let bandwidth = (state.filter.max_if - state.filter.min_if).max(1.0);
    let block_rate = ctx.defaults.block_rate as f32;

    let channelizer = if state.demod_type == DemodKind::Spect {
        None
    } else {
        let mut chanizer = Channelizer::new(
            planner,
            master,
            rate,
            offset,
            state.filter.min_if,
            state.filter.max_if,
            state.filter.kaiser_beta,
        );
        chanizer.set_doppler(state.tune.doppler, state.tune.doppler_rate);
        Some(chanizer)
    };

    let (filter2, filter2_lower) = if state.filter2.blocking > 0
        && state.demod_type != DemodKind::Spect
    {
        let output_block = channelizer.as_ref().map(|c| c.output_block()).unwrap_or(1);
        if state.filter2.isb {
            // Independent sideband: upper and lower passbands split into
            // the left/right legs.
            let upper = SecondFilter::new(
                planner,
                rate as f64,
                0.0,
                state.filter2.high.max(100.0) as f64,
                state.filter2.kaiser_beta,
                output_block,
                state.filter2.blocking,
            );
            let lower = SecondFilter::new(
                planner,
                rate as f64,
                state.filter2.low.min(-100.0) as f64,
                0.0,
                state.filter2.kaiser_beta,
                output_block,
                state.filter2.blocking,
            );
            (Some(upper), Some(lower))
        } else {
            let filter = SecondFilter::new(
                planner,
                rate as f64,
                state.filter2.low as f64,
                state.filter2.high as f64,
                state.filter2.kaiser_beta,
                output_block,
                state.filter2.blocking,
            );
            (Some(filter), None)
        }
    } else {
        (None, None)
    };

    let squelch = Squelch::new(state.squelch_open, state.squelch_close, SQUELCH_TAIL_BLOCKS);
    let demod = match state.demod_type {
        DemodKind::Fm => Demod::Fm(FmDemod::new(
            FmParams {
                sample_rate: rate as f32,
                peak_deviation: state.fm.peak_deviation,
                deemphasis_tc_us: state.fm.deemph_tc_us,
                tone_freq: state.fm.tone_freq,
                threshold_extend: state.fm.threshold_extend,
            },
            squelch,
        )),
        DemodKind::Wfm => Demod::Wfm(WfmDemod::new(
            rate as f32,
            if state.fm.stereo_enable { 2 } else { 1 },
            state.fm.deemph_tc_us,
            squelch,
        )),
        DemodKind::Linear => {
            let mut linear = LinearDemod::new(
                LinearParams {
                    sample_rate: rate as f32,
                    envelope: state.linear.envelope,
                    pll_enable: state.pll.enable,
                    pll_square: state.pll.square,
                    pll_loop_bw: state.pll.loop_bw,
                    channels: state.output.channels,
                },
                block_rate,
            );
            linear
                .agc
                .set_levels(state.output.headroom, state.linear.threshold);
            linear
                .agc
                .set_recovery_rate(state.linear.recovery_rate_db_s, block_rate);
            linear.agc.set_hangtime(state.linear.hangtime_s, block_rate);
            if !state.linear.agc {
                linear.agc.set_manual_gain(state.output.gain);
            }
            Demod::Linear(linear)
        }
        DemodKind::Spect => Demod::Spect(SpectrumAccumulator::new(
            state.spectrum.bin_count,
            state.spectrum.bin_bw,
        )),
    };

    let bin_shift = (offset / master.bin_bw()).round() as i64;

    Dsp {
        channelizer,
        filter2,
        filter2_lower,
        demod,
        estimators: SignalEstimators::new(bandwidth),
        center_offset: offset,
        doppler: (state.tune.doppler, state.tune.doppler_rate),
        bin_shift,
    }
}

fn gather_runtime(dsp: &Dsp, bins: Option<Vec<f32>>) -> RuntimeStatus {
    let mut runtime = RuntimeStatus {
        bb_power: dsp.estimators.bb_power,
        n0: dsp.estimators.n0,
        snr: dsp.estimators.snr,
        foffset: dsp.estimators.foffset,
        bins,
        ..RuntimeStatus::default()
    };
    if let Some(chanizer) = &dsp.channelizer {
        runtime.filter_blocksize = chanizer.ifft_size() as u32;
        runtime.filter_fir_length = chanizer.impulse_length() as u32;
    }
    if let Some(filter2) = &dsp.filter2 {
        runtime.filter2_blocksize = filter2.block_size() as u32;
        runtime.filter2_fir_length = filter2.impulse_length() as u32;
    }
    match &dsp.demod {
        Demod::Fm(fm) => {
            runtime.fm_snr = fm.snr();
            runtime.peak_deviation = fm.peak_deviation();
            runtime.foffset = fm.frequency_offset();
            runtime.deemph_rate = fm.deemphasis_rate();
            runtime.deemph_gain = fm.deemphasis_gain();
            runtime.tone_freq = fm.tone_freq();
            runtime.tone_deviation = fm.tone_deviation();
        }
        Demod::Wfm(wfm) => {
            runtime.fm_snr = wfm.snr();
            runtime.peak_deviation = wfm.peak_deviation();
            runtime.foffset = wfm.frequency_offset();
            runtime.deemph_rate = wfm.deemphasis_rate();
            runtime.deemph_gain = wfm.deemphasis_gain();
        }
        Demod::Linear(linear) => {
            runtime.pll_lock = linear.pll.locked();
            runtime.pll_phase = linear.pll.cphase();
            runtime.pll_wraps = linear.pll.rotations();
            runtime.pll_snr = linear.pll_snr();
            runtime.foffset = linear.pll.foffset_hz();
            runtime.agc_gain = linear.agc.gain();
        }
        Demod::Spect(_) => {}
    }
    runtime
}

/// One block of DSP: channelize, second-filter, demodulate. Returns PCM
/// (possibly empty while squelched).
fn process_block(dsp: &mut Dsp, block: &MasterBlock, state: &ChannelState) -> Vec<f32> {
    let chanizer = match dsp.channelizer.as_mut() {
        Some(chanizer) => chanizer,
        None => return Vec::new(),
    };
    let baseband: Vec<Complex<f32>> = chanizer.process(block).to_vec();
    dsp.estimators.update(&baseband);
    let snr = dsp.estimators.snr;

    match &mut dsp.demod {
        Demod::Fm(fm) => {
            let mut pcm = fm.process(&baseband, snr);
            let gain = state.output.gain;
            if gain != 1.0 {
                for sample in &mut pcm {
                    *sample *= gain;
                }
            }
            pcm
        }
        Demod::Wfm(wfm) => wfm.process(&baseband, snr),
        Demod::Linear(linear) => {
            if let (Some(upper), Some(lower)) = (&mut dsp.filter2, &mut dsp.filter2_lower) {
                // ISB: upper sideband left, lower sideband right.
                let mut up = Vec::new();
                let mut down = Vec::new();
                upper.filter_block_into(&baseband, &mut up);
                lower.filter_block_into(&baseband, &mut down);
                let mut pcm = Vec::with_capacity(up.len() * 2);
                for (u, d) in up.iter().zip(down.iter()) {
                    pcm.push(u.re * state.output.gain);
                    pcm.push(d.re * state.output.gain);
                }
                pcm
            } else if let Some(filter2) = &mut dsp.filter2 {
                let mut narrowed = Vec::new();
                filter2.filter_block_into(&baseband, &mut narrowed);
                linear.process(&narrowed)
            } else {
                linear.process(&baseband)
            }
        }
        Demod::Spect(_) => Vec::new(),
    }
}

fn run(chan: Arc<Channel>, ctx: Arc<ServerContext>) {
    let mut planner = FftPlanner::new();
    let master = ctx.master_params;

    let (mut dsp, mut output) = {
        let state = chan.lock();
        let dsp = build_dsp(&mut planner, &ctx, &state);
        let output = make_output(chan.ssrc, &state, ctx.defaults.block_rate);
        (dsp, output)
    };

    // Start from the newest block; anything older is history we missed.
    let mut last_seq = ctx.board.latest_seq();
    tracing::debug!("channel {} worker started", chan.ssrc);

    'blocks: loop {
        let (block, dropped) = match ctx.board.wait_newer(last_seq) {
            WaitOutcome::Block(block, dropped) => (block, dropped),
            WaitOutcome::Shutdown => break 'blocks,
        };
        last_seq = block.seq;

        // Command/timer window under the channel mutex.
        let mut send_status = false;
        let mut skip_spectrum = false;
        let mut expired = false;
        let snapshot = {
            let mut state = chan.lock();
            if dropped > 0 {
                state.filter.drops += dropped;
            }
            if let Some(cmd) = state.pending.take() {
                let effects = control::apply_commands(
                    &mut state,
                    &ctx.frontend,
                    &ctx.presets,
                    &ctx.defaults,
                    &cmd,
                );
                send_status = true;
                skip_spectrum = effects.spectrum_changed;
            }
            if state.lifetime > 0 {
                state.lifetime -= 1;
                if state.lifetime == 0 {
                    state.inuse = false;
                    expired = true;
                }
            }
            state.blocks_since_poll += 1;
            if state.global_timer > 0 {
                state.global_timer -= 1;
                if state.global_timer == 0 {
                    send_status = true;
                }
            }
            if state.output_interval > 0
                && state.blocks_since_poll >= state.output_interval as u64
            {
                send_status = true;
            }
            state.clone()
        };

        if expired {
            tracing::info!("channel {} lifetime expired", chan.ssrc);
            break 'blocks;
        }

        // Rebuilds requested by the control plane.
        if snapshot.restart_pending {
            output.flush();
            dsp = build_dsp(&mut planner, &ctx, &snapshot);
            output = make_output(chan.ssrc, &snapshot, ctx.defaults.block_rate);
            let mut state = chan.lock();
            state.restart_pending = false;
            state.filter_pending = false;
        } else if snapshot.filter_pending {
            // Filter-only change: rebuild the channelizer and second
            // filter, keep demodulator state.
            let offset = center_offset(&snapshot, ctx.frontend.frequency());
            if let Some(chanizer) = &mut dsp.channelizer {
                *chanizer = Channelizer::new(
                    &mut planner,
                    master,
                    channel_rate(&snapshot),
                    offset,
                    snapshot.filter.min_if,
                    snapshot.filter.max_if,
                    snapshot.filter.kaiser_beta,
                );
                chanizer.set_doppler(snapshot.tune.doppler, snapshot.tune.doppler_rate);
            }
            let rebuilt = build_dsp(&mut planner, &ctx, &snapshot);
            dsp.filter2 = rebuilt.filter2;
            dsp.filter2_lower = rebuilt.filter2_lower;
            dsp.center_offset = offset;
            dsp.estimators
                .set_bandwidth((snapshot.filter.max_if - snapshot.filter.min_if).max(1.0));
            let mut state = chan.lock();
            state.filter_pending = false;
        } else {
            // Plain retune: follow the tune group without a rebuild.
            let offset = center_offset(&snapshot, ctx.frontend.frequency());
            if offset != dsp.center_offset {
                dsp.center_offset = offset;
                if let Some(chanizer) = &mut dsp.channelizer {
                    chanizer.set_center(offset);
                }
                dsp.bin_shift = (offset / master.bin_bw()).round() as i64;
            }
            let doppler = (snapshot.tune.doppler, snapshot.tune.doppler_rate);
            if doppler != dsp.doppler {
                dsp.doppler = doppler;
                if let Some(chanizer) = &mut dsp.channelizer {
                    chanizer.set_doppler(doppler.0, doppler.1);
                }
            }
        }

        // Squelch thresholds follow the shared state without restarts.
        match &mut dsp.demod {
            Demod::Fm(fm) => {
                fm.squelch.open_threshold = snapshot.squelch_open;
                fm.squelch.close_threshold = snapshot.squelch_close;
                fm.set_threshold_extend(snapshot.fm.threshold_extend);
            }
            Demod::Wfm(wfm) => {
                wfm.squelch.open_threshold = snapshot.squelch_open;
                wfm.squelch.close_threshold = snapshot.squelch_close;
                wfm.set_stereo(snapshot.fm.stereo_enable);
            }
            Demod::Linear(linear) => {
                linear.set_envelope(snapshot.linear.envelope);
                linear.set_pll(
                    snapshot.pll.enable,
                    snapshot.pll.square,
                    snapshot.pll.loop_bw,
                );
                if !snapshot.linear.agc {
                    linear.agc.set_manual_gain(snapshot.output.gain);
                } else {
                    linear.agc.enabled = true;
                    linear
                        .agc
                        .set_levels(snapshot.output.headroom, snapshot.linear.threshold);
                }
            }
            Demod::Spect(spect) => {
                if snapshot.spectrum.params_changed {
                    // Safe point: the worker owns the bin buffer.
                    spect.reconfigure(snapshot.spectrum.bin_count, snapshot.spectrum.bin_bw);
                    let mut state = chan.lock();
                    state.spectrum.params_changed = false;
                }
            }
        }

        // The block itself.
        let mut spectrum_bins = None;
        if let Demod::Spect(spect) = &mut dsp.demod {
            spect.accumulate(&block, ctx.frontend.samprate, dsp.bin_shift);
            if send_status && !skip_spectrum {
                spectrum_bins = Some(spect.poll());
            }
        } else {
            let pcm = process_block(&mut dsp, &block, &snapshot);
            output.push(&pcm);
        }

        // Write back counters; emit status if due.
        {
            let mut state = chan.lock();
            if let Some(chanizer) = &dsp.channelizer {
                state.filter.bin_shift = chanizer.bin_shift();
                state.filter.remainder = chanizer.remainder();
            } else {
                state.filter.bin_shift = dsp.bin_shift;
            }
            state.output.power = output.mean_power();
            state.output.samples = output.samples;
            state.output.packets = output.packets;
            state.output.errors += output.errors;
            output.errors = 0;
            state.output.rtp_timestamp = output.timestamp();

            if send_status {
                state.packets_out += 1;
                let skip = skip_spectrum || state.spectrum.params_changed;
                let runtime = gather_runtime(&dsp, spectrum_bins.take());
                let packet = encode_status(&ctx.frontend, chan.ssrc, &state, &runtime, skip);
                ctx.status.send(&packet, state.output.status_dest);
                state.blocks_since_poll = 0;
                output.reset_power();
            }
        }
    }

    // Teardown: flush output, release the ssrc.
    output.flush();
    {
        let mut state = chan.lock();
        state.inuse = false;
    }
    ctx.registry.remove(chan.ssrc);
    tracing::info!("channel {} released", chan.ssrc);
}
