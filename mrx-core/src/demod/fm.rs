// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Narrowband FM demodulator: quadrature discriminator, deemphasis,
//! CTCSS/PL tone detection and squelch.

use num_complex::Complex;

use super::squelch::Squelch;
use super::Deemphasis;

/// Default squelch tail, in blocks, riding out mobile flutter.
const DEFAULT_TAIL_BLOCKS: u32 = 2;
/// Tone detector loop bandwidth in Hz; sub-audible tones move slowly.
const TONE_LOOP_BW: f32 = 2.0;
/// Tone squelch opens above this detected deviation in Hz.
const TONE_DEVIATION_THRESHOLD: f32 = 250.0;
/// Amplitude scale for threshold-extension noise fill.
const EXTEND_NOISE_SCALE: f32 = 0.25;

#[derive(Debug, Clone)]
pub struct FmParams {
    pub sample_rate: f32,
    /// Rated peak deviation in Hz; full deviation maps to ±1.0 output.
    pub peak_deviation: f32,
    /// Deemphasis time constant, microseconds.
    pub deemphasis_tc_us: f32,
    /// CTCSS/PL tone frequency in Hz; 0 disables the detector.
    pub tone_freq: f32,
    pub threshold_extend: bool,
}

impl Default for FmParams {
    fn default() -> Self {
        Self {
            sample_rate: 24_000.0,
            peak_deviation: 5_000.0,
            deemphasis_tc_us: 750.0,
            tone_freq: 0.0,
            threshold_extend: false,
        }
    }
}

/// PLL-based detector for a sub-audible tone on the discriminator output.
#[derive(Debug, Clone)]
struct TonePll {
    freq: f32,
    phase: f32,
    phase_inc: f32,
    sample_rate: f32,
    alpha: f32,
    beta: f32,
    /// Smoothed in-phase and quadrature products.
    i_acc: f32,
    q_acc: f32,
    smooth: f32,
}

impl TonePll {
    fn new(sample_rate: f32, freq: f32) -> Self {
        let wn = std::f32::consts::TAU * TONE_LOOP_BW / sample_rate;
        Self {
            freq,
            phase: 0.0,
            phase_inc: std::f32::consts::TAU * freq / sample_rate,
            sample_rate,
            alpha: 2.0 * std::f32::consts::FRAC_1_SQRT_2 * wn,
            beta: wn * wn,
            i_acc: 0.0,
            q_acc: 0.0,
            smooth: 1.0 - (-std::f32::consts::TAU * TONE_LOOP_BW / sample_rate).exp(),
        }
    }

    /// Feed one audio sample (in Hz of deviation); returns nothing, the
    /// detected deviation is read out per block.
    fn step(&mut self, deviation_hz: f32) {
        let (sin, cos) = self.phase.sin_cos();
        self.i_acc += self.smooth * (deviation_hz * cos - self.i_acc);
        self.q_acc += self.smooth * (deviation_hz * -sin - self.q_acc);
        // Quadrature product steers the oscillator onto the tone.
        let err = self.q_acc * self.i_acc.signum() / self.sample_rate;
        self.phase_inc += self.beta * err;
        self.phase += self.phase_inc + self.alpha * err;
        if self.phase >= std::f32::consts::TAU {
            self.phase -= std::f32::consts::TAU;
        }
    }

    /// Detected tone deviation in Hz (amplitude of the locked component).
    fn deviation(&self) -> f32 {
        2.0 * (self.i_acc * self.i_acc + self.q_acc * self.q_acc).sqrt()
    }

    fn freq(&self) -> f32 {
        self.freq
    }
}

pub struct FmDemod {
    params: FmParams,
    prev: Complex<f32>,
    deemph: Deemphasis,
    tone: Option<TonePll>,
    pub squelch: Squelch,
    /// Measured peak deviation over the last block, Hz.
    pdeviation: f32,
    /// Mean discriminator output over the last block, Hz.
    foffset: f32,
    /// Channel SNR as of the last block processed.
    snr: f32,
    noise_state: u32,
    scratch: Vec<f32>,
}

impl FmDemod {
    pub fn new(params: FmParams, squelch: Squelch) -> Self {
        let deemph = Deemphasis::new(params.sample_rate, params.deemphasis_tc_us);
        let tone = if params.tone_freq > 0.0 {
            Some(TonePll::new(params.sample_rate, params.tone_freq))
        } else {
            None
        };
        Self {
            params,
            prev: Complex::new(0.0, 0.0),
            deemph,
            tone,
            squelch,
            pdeviation: 0.0,
            foffset: 0.0,
            snr: 0.0,
            noise_state: 0xace1_u32,
            scratch: Vec::new(),
        }
    }

    pub fn params(&self) -> &FmParams {
        &self.params
    }

    pub fn set_threshold_extend(&mut self, enable: bool) {
        self.params.threshold_extend = enable;
    }

    pub fn peak_deviation(&self) -> f32 {
        self.pdeviation
    }

    pub fn frequency_offset(&self) -> f32 {
        self.foffset
    }

    pub fn snr(&self) -> f32 {
        self.snr
    }

    pub fn tone_freq(&self) -> f32 {
        self.tone.as_ref().map(TonePll::freq).unwrap_or(0.0)
    }

    pub fn tone_deviation(&self) -> f32 {
        self.tone.as_ref().map(TonePll::deviation).unwrap_or(0.0)
    }

    pub fn deemphasis_rate(&self) -> f32 {
        self.deemph.rate()
    }

    pub fn deemphasis_gain(&self) -> f32 {
        self.deemph.gain()
    }

    fn noise_sample(&mut self) -> f32 {
        // Small xorshift; only feeds the threshold-extension fill.
        self.noise_state ^= self.noise_state << 13;
        self.noise_state ^= self.noise_state >> 17;
        self.noise_state ^= self.noise_state << 5;
        (self.noise_state & 0xffff) as f32 / 32768.0 - 1.0
    }

    /// Demodulate one block. `snr_metric` is the channel SNR estimate
    /// used as the squelch metric (linear power ratio). Returns mono PCM;
    /// empty when the squelch is closed.
    pub fn process(&mut self, baseband: &[Complex<f32>], snr_metric: f32) -> Vec<f32> {
        if baseband.is_empty() {
            return Vec::new();
        }
        let fs = self.params.sample_rate;
        let rad_to_hz = fs / std::f32::consts::TAU;
        let scale = fs / (std::f32::consts::TAU * self.params.peak_deviation);

        self.scratch.clear();
        self.scratch.reserve(baseband.len());
        let mut sum_hz = 0.0;
        for &sample in baseband {
            let product = sample * self.prev.conj();
            self.prev = sample;
            let rad = product.arg();
            sum_hz += rad * rad_to_hz;
            self.scratch.push(rad * scale);
        }
        let mean_hz = sum_hz / baseband.len() as f32;
        self.foffset = mean_hz;

        let mean_out = mean_hz / self.params.peak_deviation;
        let mut peak = 0.0_f32;
        for value in &self.scratch {
            peak = peak.max((value - mean_out).abs());
        }
        self.pdeviation = peak * self.params.peak_deviation;

        self.snr = snr_metric;

        if let Some(tone) = &mut self.tone {
            for &value in &self.scratch {
                tone.step(value * self.params.peak_deviation);
            }
        }

        // Squelch: tone detection gates independently when configured.
        let metric = snr_metric;
        self.squelch.update(metric);
        let tone_open = match &self.tone {
            Some(tone) => tone.deviation() >= TONE_DEVIATION_THRESHOLD,
            None => true,
        };
        if !self.squelch.is_audible() || !tone_open {
            return Vec::new();
        }

        let extend = self.params.threshold_extend && snr_metric < 1.0;
        let mut out = Vec::with_capacity(self.scratch.len());
        let scratch = std::mem::take(&mut self.scratch);
        for &value in &scratch {
            let sample = if extend && value.abs() > 1.0 {
                // Below FM threshold, impulse spikes dominate; substitute
                // quieter noise instead of the click.
                self.noise_sample() * EXTEND_NOISE_SCALE
            } else {
                value
            };
            out.push(self.deemph.process(sample));
        }
        self.scratch = scratch;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fm_tone(fs: f32, deviation: f32, mod_freq: f32, len: usize) -> Vec<Complex<f32>> {
        // FM-modulate a sine at mod_freq with the given peak deviation.
        let mut phase = 0.0_f64;
        (0..len)
            .map(|n| {
                let t = n as f32 / fs;
                let inst = deviation * (std::f32::consts::TAU * mod_freq * t).sin();
                phase += std::f64::consts::TAU * inst as f64 / fs as f64;
                Complex::from_polar(1.0, phase as f32)
            })
            .collect()
    }

    fn open_squelch() -> Squelch {
        Squelch::new(0.0, 0.0, DEFAULT_TAIL_BLOCKS)
    }

    #[test]
    fn test_recovers_modulation_amplitude() {
        let params = FmParams {
            sample_rate: 24_000.0,
            peak_deviation: 5_000.0,
            ..FmParams::default()
        };
        let mut demod = FmDemod::new(params, open_squelch());
        let input = fm_tone(24_000.0, 5_000.0, 400.0, 4800);
        let out = demod.process(&input, 100.0);
        assert_eq!(out.len(), 4800);
        // Peak of the deemphasized 400 Hz tone should be near full scale
        // (deemphasis barely touches 400 Hz at 750 µs).
        let peak = out[2400..].iter().fold(0.0_f32, |a, &b| a.max(b.abs()));
        assert!(
            peak > 0.5 && peak < 2.0,
            "recovered peak out of range: {}",
            peak
        );
    }

    #[test]
    fn test_measures_peak_deviation() {
        let params = FmParams {
            sample_rate: 24_000.0,
            peak_deviation: 5_000.0,
            ..FmParams::default()
        };
        let mut demod = FmDemod::new(params, open_squelch());
        let input = fm_tone(24_000.0, 3_000.0, 300.0, 4800);
        demod.process(&input, 100.0);
        assert!(
            (demod.peak_deviation() - 3_000.0).abs() < 300.0,
            "measured deviation {}",
            demod.peak_deviation()
        );
    }

    #[test]
    fn test_carrier_offset_appears_in_foffset() {
        let params = FmParams::default();
        let mut demod = FmDemod::new(params, open_squelch());
        // Unmodulated carrier 1 kHz off center.
        let input: Vec<Complex<f32>> = (0..4800)
            .map(|n| {
                let phase = std::f32::consts::TAU * 1_000.0 * n as f32 / 24_000.0;
                Complex::from_polar(1.0, phase)
            })
            .collect();
        demod.process(&input, 100.0);
        assert!(
            (demod.frequency_offset() - 1_000.0).abs() < 50.0,
            "foffset {}",
            demod.frequency_offset()
        );
    }

    #[test]
    fn test_closed_squelch_emits_nothing() {
        let params = FmParams::default();
        let squelch = Squelch::new(10.0, 5.0, 1);
        let mut demod = FmDemod::new(params, squelch);
        let input = fm_tone(24_000.0, 5_000.0, 400.0, 2400);
        let out = demod.process(&input, 0.1); // below open threshold
        assert!(out.is_empty());
    }

    #[test]
    fn test_sentinel_squelch_passes_noise() {
        let params = FmParams::default();
        let mut demod = FmDemod::new(params, open_squelch());
        let mut state = 77_u32;
        let input: Vec<Complex<f32>> = (0..2400)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                let re = (state & 0xffff) as f32 / 32768.0 - 1.0;
                state = state.wrapping_mul(0x9e3779b9).wrapping_add(7);
                let im = (state & 0xffff) as f32 / 32768.0 - 1.0;
                Complex::new(re, im)
            })
            .collect();
        let out = demod.process(&input, 0.0);
        let power: f32 = out.iter().map(|x| x * x).sum();
        assert!(
            !out.is_empty() && power > 0.0,
            "always-open squelch must pass audio"
        );
    }

    #[test]
    fn test_tone_detector_finds_ctcss() {
        let fs = 24_000.0;
        let params = FmParams {
            sample_rate: fs,
            peak_deviation: 5_000.0,
            tone_freq: 100.0,
            ..FmParams::default()
        };
        let mut demod = FmDemod::new(params, open_squelch());
        // FM carrier modulated only by a 100 Hz tone at 600 Hz deviation.
        let input = fm_tone(fs, 600.0, 100.0, 48_000);
        for chunk in input.chunks(2400) {
            demod.process(chunk, 100.0);
        }
        assert!(
            demod.tone_deviation() > TONE_DEVIATION_THRESHOLD,
            "tone deviation {} Hz",
            demod.tone_deviation()
        );
    }
}
