// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Wideband broadcast FM demodulator with pilot-PLL stereo decoding.
//!
//! The channel delivers composite baseband at a multiple of 48 kHz; the
//! discriminator output carries mono (L+R) at 0–15 kHz, the 19 kHz pilot,
//! and the DSB L−R subchannel at 23–53 kHz. The pilot PLL doubles its
//! recovered phase to demodulate L−R; the matrix then restores left and
//! right. Audio always leaves at 48 kHz.

use num_complex::Complex;

use super::squelch::Squelch;
use super::Deemphasis;

/// Fixed audio output rate of the WFM chain.
pub const WFM_AUDIO_RATE: u32 = 48_000;
/// Broadcast FM rated deviation.
const WFM_DEVIATION: f32 = 75_000.0;
/// Pilot tone frequency.
const PILOT_HZ: f32 = 19_000.0;
/// Mono / stereo-difference audio bandwidth.
const AUDIO_BW_HZ: f32 = 15_000.0;
/// Butterworth cascade Qs for the 4th-order audio low-pass.
const BW4_Q1: f32 = 0.5412;
const BW4_Q2: f32 = 1.3066;
/// Q of the pilot band-pass ahead of the PLL.
const PILOT_BPF_Q: f32 = 20.0;
/// Pilot PLL loop bandwidth, Hz.
const PILOT_LOOP_BW: f32 = 15.0;
/// Pilot amplitude (fraction of rated deviation) above which the pilot
/// is considered present; broadcast pilots run 8–10%.
const PILOT_DETECT_LEVEL: f32 = 0.04;

/// RBJ biquad low-pass section.
#[derive(Debug, Clone)]
struct BiquadLowPass {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl BiquadLowPass {
    fn new(sample_rate: f32, cutoff_hz: f32, q: f32) -> Self {
        let sr = sample_rate.max(1.0);
        let cutoff = cutoff_hz.clamp(10.0, sr * 0.45);
        let w0 = std::f32::consts::TAU * cutoff / sr;
        let alpha = w0.sin() / (2.0 * q.max(0.2));
        let cos_w0 = w0.cos();
        let a0 = 1.0 + alpha;
        let inv_a0 = 1.0 / a0;
        Self {
            b0: (1.0 - cos_w0) / 2.0 * inv_a0,
            b1: (1.0 - cos_w0) * inv_a0,
            b2: (1.0 - cos_w0) / 2.0 * inv_a0,
            a1: -2.0 * cos_w0 * inv_a0,
            a2: (1.0 - alpha) * inv_a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// RBJ biquad band-pass section (constant skirt gain).
#[derive(Debug, Clone)]
struct BiquadBandPass {
    b0: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl BiquadBandPass {
    fn new(sample_rate: f32, center_hz: f32, q: f32) -> Self {
        let sr = sample_rate.max(1.0);
        let center = center_hz.clamp(100.0, sr * 0.45);
        let w0 = std::f32::consts::TAU * center / sr;
        let alpha = w0.sin() / (2.0 * q.max(0.2));
        let cos_w0 = w0.cos();
        let a0 = 1.0 + alpha;
        let inv_a0 = 1.0 / a0;
        Self {
            b0: alpha * inv_a0,
            b2: -alpha * inv_a0,
            a1: -2.0 * cos_w0 * inv_a0,
            a2: (1.0 - alpha) * inv_a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b2 * self.x2 - self.a1 * self.y1 - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// PLL tracking the 19 kHz pilot on the real composite signal.
#[derive(Debug, Clone)]
struct PilotPll {
    phase: f32,
    phase_inc: f32,
    alpha: f32,
    beta: f32,
    /// Smoothed in-phase pilot amplitude (lock/level indicator).
    level: f32,
    smooth: f32,
}

impl PilotPll {
    fn new(sample_rate: f32) -> Self {
        let wn = std::f32::consts::TAU * PILOT_LOOP_BW / sample_rate;
        Self {
            phase: 0.0,
            phase_inc: std::f32::consts::TAU * PILOT_HZ / sample_rate,
            alpha: 2.0 * std::f32::consts::FRAC_1_SQRT_2 * wn,
            beta: wn * wn,
            level: 0.0,
            smooth: 1.0 - (-wn).exp(),
        }
    }

    /// Advance with one band-passed composite sample; returns the current
    /// pilot phase for subcarrier regeneration.
    #[inline]
    fn step(&mut self, pilot_sample: f32) -> f32 {
        let (sin, cos) = self.phase.sin_cos();
        // For a pilot a·cos(θ_in): mixing with -sin(θ) leaves an error
        // term proportional to sin(θ_in - θ).
        let err = pilot_sample * -sin * 2.0;
        let inphase = pilot_sample * cos * 2.0;
        self.level += self.smooth * (inphase - self.level);

        self.phase_inc += self.beta * err;
        self.phase += self.phase_inc + self.alpha * err;
        if self.phase >= std::f32::consts::TAU {
            self.phase -= std::f32::consts::TAU;
        }
        self.phase
    }

    fn locked(&self) -> bool {
        self.level > PILOT_DETECT_LEVEL
    }
}

pub struct WfmDemod {
    composite_rate: f32,
    decim: usize,
    decim_counter: usize,
    channels: u32,
    stereo_enable: bool,
    prev: Complex<f32>,
    pilot_bpf: BiquadBandPass,
    pilot: PilotPll,
    sum_lpf: [BiquadLowPass; 2],
    diff_lpf: [BiquadLowPass; 2],
    deemph_left: Deemphasis,
    deemph_right: Deemphasis,
    pub squelch: Squelch,
    foffset: f32,
    pdeviation: f32,
    snr: f32,
    deemph_tc_us: f32,
}

impl WfmDemod {
    /// `composite_rate` must be an integer multiple of 48 kHz; the worker
    /// picks the channel rate accordingly.
    pub fn new(
        composite_rate: f32,
        channels: u32,
        deemphasis_tc_us: f32,
        squelch: Squelch,
    ) -> Self {
        let decim = (composite_rate / WFM_AUDIO_RATE as f32).round().max(1.0) as usize;
        Self {
            composite_rate,
            decim,
            decim_counter: 0,
            channels: channels.clamp(1, 2),
            stereo_enable: channels == 2,
            prev: Complex::new(0.0, 0.0),
            pilot_bpf: BiquadBandPass::new(composite_rate, PILOT_HZ, PILOT_BPF_Q),
            pilot: PilotPll::new(composite_rate),
            sum_lpf: [
                BiquadLowPass::new(composite_rate, AUDIO_BW_HZ, BW4_Q1),
                BiquadLowPass::new(composite_rate, AUDIO_BW_HZ, BW4_Q2),
            ],
            diff_lpf: [
                BiquadLowPass::new(composite_rate, AUDIO_BW_HZ, BW4_Q1),
                BiquadLowPass::new(composite_rate, AUDIO_BW_HZ, BW4_Q2),
            ],
            deemph_left: Deemphasis::new(WFM_AUDIO_RATE as f32, deemphasis_tc_us),
            deemph_right: Deemphasis::new(WFM_AUDIO_RATE as f32, deemphasis_tc_us),
            squelch,
            foffset: 0.0,
            pdeviation: 0.0,
            snr: 0.0,
            deemph_tc_us: deemphasis_tc_us,
        }
    }

    pub fn composite_rate(&self) -> f32 {
        self.composite_rate
    }

    pub fn set_stereo(&mut self, enable: bool) {
        self.stereo_enable = enable;
        self.channels = if enable { 2 } else { 1 };
    }

    pub fn stereo_active(&self) -> bool {
        self.stereo_enable && self.pilot.locked()
    }

    pub fn pilot_locked(&self) -> bool {
        self.pilot.locked()
    }

    pub fn frequency_offset(&self) -> f32 {
        self.foffset
    }

    pub fn peak_deviation(&self) -> f32 {
        self.pdeviation
    }

    pub fn snr(&self) -> f32 {
        self.snr
    }

    pub fn deemphasis_rate(&self) -> f32 {
        self.deemph_left.rate()
    }

    pub fn deemphasis_gain(&self) -> f32 {
        self.deemph_left.gain()
    }

    pub fn deemphasis_tc_us(&self) -> f32 {
        self.deemph_tc_us
    }

    /// Demodulate one composite block into 48 kHz PCM, interleaved when
    /// stereo. `snr_metric` drives the squelch. Empty when squelched.
    pub fn process(&mut self, baseband: &[Complex<f32>], snr_metric: f32) -> Vec<f32> {
        if baseband.is_empty() {
            return Vec::new();
        }
        let fs = self.composite_rate;
        let scale = fs / (std::f32::consts::TAU * WFM_DEVIATION);
        let rad_to_hz = fs / std::f32::consts::TAU;

        self.snr = snr_metric;
        self.squelch.update(snr_metric);
        let audible = self.squelch.is_audible();

        let stereo_out = self.channels == 2;
        let mut out = Vec::with_capacity(
            baseband.len() / self.decim * if stereo_out { 2 } else { 1 } + 2,
        );
        let mut sum_hz = 0.0_f32;
        let mut peak = 0.0_f32;

        for &sample in baseband {
            let product = sample * self.prev.conj();
            self.prev = sample;
            let rad = product.arg();
            sum_hz += rad * rad_to_hz;
            peak = peak.max(rad.abs() * rad_to_hz);
            let composite = rad * scale;

            // Pilot recovery runs at the composite rate.
            let pilot_phase = self.pilot.step(self.pilot_bpf.process(composite));

            let sum = self
                .sum_lpf
                .iter_mut()
                .fold(composite, |acc, lpf| lpf.process(acc));
            // L-R rides on 38 kHz; regenerate it as cos(2θ) from the PLL.
            let subcarrier = (2.0 * pilot_phase).cos();
            let diff_raw = composite * subcarrier * 2.0;
            let diff = self
                .diff_lpf
                .iter_mut()
                .fold(diff_raw, |acc, lpf| lpf.process(acc));

            self.decim_counter += 1;
            if self.decim_counter < self.decim {
                continue;
            }
            self.decim_counter = 0;
            if !audible {
                continue;
            }

            if stereo_out {
                let (left, right) = if self.stereo_active() {
                    (0.5 * (sum + diff), 0.5 * (sum - diff))
                } else {
                    (sum, sum)
                };
                out.push(self.deemph_left.process(left));
                out.push(self.deemph_right.process(right));
            } else {
                out.push(self.deemph_left.process(sum));
            }
        }

        self.foffset = sum_hz / baseband.len() as f32;
        self.pdeviation = peak;
        out
    }
}
