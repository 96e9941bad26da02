// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Frontend descriptor and the producer loop feeding the input ring.
//!
//! The descriptor is immutable after startup except for the handful of
//! fields the producer updates (LO frequency, sample counters, IF power),
//! which are atomics so channels can read them lock-free for status.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use num_complex::Complex;

use mrx_core::fft::InputDomain;
use mrx_core::input::InputRing;

use crate::DynResult;

/// f64 stored as bits in an AtomicU64.
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

/// Normalizes raw A/D power to full scale; the formula is frontend
/// specific, so it travels as a function pointer on the descriptor.
pub type ScaleAdPower = fn(&Frontend) -> f32;

fn default_scale_ad_power(frontend: &Frontend) -> f32 {
    // Full scale for an N-bit converter, +3 dB for real-only sampling.
    let bits = frontend.bits_per_sample.max(1);
    let fs = ((1u64 << (bits - 1)) as f32).powi(2);
    let real_corr = if frontend.domain == InputDomain::Real {
        2.0
    } else {
        1.0
    };
    real_corr / fs
}

/// Immutable-after-setup description of the sample source.
pub struct Frontend {
    pub description: String,
    pub samprate: u32,
    pub domain: InputDomain,
    pub bits_per_sample: u32,
    /// Fractional frequency calibration; applied multiplicatively to the
    /// LO at tune time and never again downstream.
    pub calibrate: f64,
    /// Frequency coverage relative to the LO.
    pub min_if: f32,
    pub max_if: f32,
    pub rf_gain: f32,
    pub rf_atten: f32,
    pub rf_level_cal: f32,
    pub rf_agc: bool,
    pub lna_gain: i32,
    pub mixer_gain: i32,
    pub if_gain: i32,
    pub scale_ad_power: ScaleAdPower,

    frequency: AtomicF64,
    if_power: AtomicF64,
    pub samples: AtomicU64,
    pub overranges: AtomicU64,
    pub samp_since_over: AtomicU64,
    /// Pending hardware retune, picked up by the producer loop.
    retune: Mutex<Option<f64>>,
}

impl Frontend {
    pub fn new(
        description: String,
        samprate: u32,
        domain: InputDomain,
        bits_per_sample: u32,
        calibrate: f64,
        frequency: f64,
    ) -> Self {
        let (min_if, max_if) = match domain {
            InputDomain::Real => (0.0, samprate as f32 / 2.0),
            InputDomain::Complex => (-(samprate as f32) / 2.0, samprate as f32 / 2.0),
        };
        Self {
            description,
            samprate,
            domain,
            bits_per_sample,
            calibrate,
            min_if,
            max_if,
            rf_gain: 0.0,
            rf_atten: 0.0,
            rf_level_cal: 0.0,
            rf_agc: false,
            lna_gain: 0,
            mixer_gain: 0,
            if_gain: 0,
            scale_ad_power: default_scale_ad_power,
            frequency: AtomicF64::new(frequency),
            if_power: AtomicF64::new(0.0),
            samples: AtomicU64::new(0),
            overranges: AtomicU64::new(0),
            samp_since_over: AtomicU64::new(0),
            retune: Mutex::new(None),
        }
    }

    /// Current LO frequency in Hz.
    pub fn frequency(&self) -> f64 {
        self.frequency.load()
    }

    /// Mean squared input level of recent blocks, raw A/D units.
    pub fn if_power(&self) -> f32 {
        self.if_power.load() as f32
    }

    /// Queue a hardware retune; the producer applies it before its next
    /// read and stores the calibrated result back.
    pub fn request_tune(&self, freq_hz: f64) {
        if let Ok(mut pending) = self.retune.lock() {
            *pending = Some(freq_hz);
        }
    }

    fn take_retune(&self) -> Option<f64> {
        self.retune.lock().ok().and_then(|mut pending| pending.take())
    }

    fn set_frequency(&self, freq_hz: f64) {
        self.frequency.store(freq_hz);
    }

    fn update_if_power(&self, power: f64) {
        // Single writer (the producer), so a plain smoothed store is fine.
        let old = self.if_power.load();
        self.if_power.store(old + 0.25 * (power - old));
    }
}

/// Any source of baseband samples: hardware, network, or a synthesized
/// test signal.
pub trait SampleSource: Send + 'static {
    /// One-time hardware initialization before streaming begins.
    fn setup(&mut self) -> DynResult<()> {
        Ok(())
    }

    /// Begin producing samples; called once by the producer loop.
    fn start(&mut self) -> DynResult<()> {
        Ok(())
    }

    /// Fill `buf` with the next samples; returns the count written.
    fn read_into(&mut self, buf: &mut [Complex<f32>]) -> Result<usize, String>;

    /// True when `read_into` blocks until samples are ready. Non-blocking
    /// sources are throttled to real time by the producer loop.
    fn is_blocking(&self) -> bool {
        false
    }

    /// Retune the LO. Returns the actual (calibrated) frequency.
    fn tune(&mut self, freq_hz: f64) -> DynResult<f64> {
        let _ = freq_hz;
        Err("tuning not supported".into())
    }
}

/// Synthesized source: a set of unmodulated carriers plus white noise.
/// Stands in for hardware in tests and on machines without an SDR.
pub struct SignalSource {
    samprate: u32,
    calibrate: f64,
    lo_freq: f64,
    /// (offset from LO in Hz, amplitude)
    tones: Vec<(f64, f32)>,
    noise: f32,
    phases: Vec<f64>,
    rng: u32,
}

impl SignalSource {
    pub fn new(samprate: u32, lo_freq: f64, calibrate: f64) -> Self {
        Self {
            samprate,
            calibrate,
            lo_freq,
            tones: Vec::new(),
            noise: 0.0,
            phases: Vec::new(),
            rng: 0x6d2b_79f5,
        }
    }

    pub fn with_tone(mut self, offset_hz: f64, amplitude: f32) -> Self {
        self.tones.push((offset_hz, amplitude));
        self.phases.push(0.0);
        self
    }

    pub fn with_noise(mut self, amplitude: f32) -> Self {
        self.noise = amplitude;
        self
    }

    fn noise_sample(&mut self) -> f32 {
        self.rng ^= self.rng << 13;
        self.rng ^= self.rng >> 17;
        self.rng ^= self.rng << 5;
        (self.rng & 0xffff) as f32 / 32768.0 - 1.0
    }
}

impl SampleSource for SignalSource {
    fn read_into(&mut self, buf: &mut [Complex<f32>]) -> Result<usize, String> {
        for slot in buf.iter_mut() {
            let mut sample = Complex::new(0.0_f32, 0.0);
            for (idx, &(offset, amplitude)) in self.tones.iter().enumerate() {
                sample += Complex::from_polar(amplitude, self.phases[idx] as f32);
                self.phases[idx] += std::f64::consts::TAU * offset / self.samprate as f64;
                if self.phases[idx] > std::f64::consts::TAU {
                    self.phases[idx] -= std::f64::consts::TAU;
                }
            }
            if self.noise > 0.0 {
                sample += Complex::new(
                    self.noise_sample() * self.noise,
                    self.noise_sample() * self.noise,
                );
            }
            *slot = sample;
        }
        Ok(buf.len())
    }

    fn tune(&mut self, freq_hz: f64) -> DynResult<f64> {
        self.lo_freq = freq_hz * (1.0 + self.calibrate);
        Ok(self.lo_freq)
    }
}

/// Producer loop: read blocks from the source into the input ring, keep
/// the frontend counters fresh, and back off on read errors. Exits when
/// `stop` is set; the ring is shut down on the way out.
pub fn source_loop(
    mut source: Box<dyn SampleSource>,
    frontend: Arc<Frontend>,
    ring: Arc<InputRing>,
    block: usize,
    stop: Arc<std::sync::atomic::AtomicBool>,
) {
    let mut buf = vec![Complex::new(0.0_f32, 0.0); block];
    let block_duration_ms = (block as f64 / frontend.samprate as f64 * 1000.0) as u64;
    let throttle = !source.is_blocking();
    let mut error_streak: u32 = 0;

    if let Err(err) = source.setup().and_then(|_| source.start()) {
        tracing::error!("sample source failed to start: {}", err);
        ring.shutdown();
        return;
    }

    while !stop.load(Ordering::Acquire) {
        if let Some(freq) = frontend.take_retune() {
            match source.tune(freq) {
                Ok(actual) => {
                    frontend.set_frequency(actual);
                    tracing::info!("frontend retuned to {:.0} Hz", actual);
                }
                Err(err) => {
                    tracing::warn!("frontend retune to {:.0} Hz failed: {}", freq, err);
                }
            }
        }

        let n = match source.read_into(&mut buf) {
            Ok(n) => {
                error_streak = 0;
                n
            }
            Err(err) => {
                error_streak = error_streak.saturating_add(1);
                tracing::warn!("sample source read error: {} (streak={})", err, error_streak);
                if error_streak >= 10 {
                    tracing::error!("sample source failed persistently, stopping producer");
                    break;
                }
                let sleep_ms =
                    (10u64 << error_streak.saturating_sub(1).min(4)).min(250);
                std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
                continue;
            }
        };
        if n == 0 {
            std::thread::sleep(std::time::Duration::from_millis(1));
            continue;
        }

        let samples = &buf[..n];
        let power: f64 = samples
            .iter()
            .map(|x| x.norm_sqr() as f64)
            .sum::<f64>()
            / n as f64;
        frontend.update_if_power(power);
        frontend.samples.fetch_add(n as u64, Ordering::Relaxed);
        frontend
            .samp_since_over
            .fetch_add(n as u64, Ordering::Relaxed);
        let clipped = samples
            .iter()
            .any(|x| x.re.abs() >= 1.0 || x.im.abs() >= 1.0);
        if clipped {
            frontend.overranges.fetch_add(1, Ordering::Relaxed);
            frontend.samp_since_over.store(0, Ordering::Relaxed);
        }

        ring.write(samples);

        if throttle {
            std::thread::sleep(std::time::Duration::from_millis(block_duration_ms.max(1)));
        }
    }
    ring.shutdown();
}
