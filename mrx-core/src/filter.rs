// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Filter design: Kaiser-windowed passband responses for the channelizer
//! and an optional secondary overlap-save filter at the channel rate.

use std::sync::Arc;

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Zeroth-order modified Bessel function of the first kind, by power
/// series. Converges quickly for the β range used in filter design.
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    let half_x2 = (x / 2.0) * (x / 2.0);
    for k in 1..32 {
        term *= half_x2 / ((k * k) as f64);
        sum += term;
        if term < 1e-12 * sum {
            break;
        }
    }
    sum
}

/// Kaiser window of the given length. β = 0 degenerates to rectangular.
pub fn kaiser_window(len: usize, beta: f32) -> Vec<f32> {
    if len == 0 {
        return Vec::new();
    }
    let denom = bessel_i0(beta as f64);
    let m = (len - 1) as f64;
    (0..len)
        .map(|i| {
            let t = 2.0 * i as f64 / m - 1.0;
            (bessel_i0(beta as f64 * (1.0 - t * t).max(0.0).sqrt()) / denom) as f32
        })
        .collect()
}

/// Complex band-pass impulse response covering `[low_hz, high_hz]` at
/// `sample_rate`, Kaiser-windowed with shape `beta`, unity passband gain.
///
/// The band edges may be asymmetric around DC (SSB passbands are), so the
/// taps are complex: a real low-pass prototype of half the passband width
/// heterodyned to the band center.
pub fn bandpass_taps(
    sample_rate: f64,
    low_hz: f64,
    high_hz: f64,
    beta: f32,
    len: usize,
) -> Vec<Complex<f32>> {
    assert!(high_hz > low_hz, "passband edges out of order");
    let window = kaiser_window(len, beta);
    let center = (high_hz + low_hz) / 2.0 / sample_rate;
    let half_bw = (high_hz - low_hz) / 2.0 / sample_rate;
    let mid = (len - 1) as f64 / 2.0;

    let mut taps: Vec<Complex<f32>> = (0..len)
        .map(|i| {
            let t = i as f64 - mid;
            let sinc = if t.abs() < 1e-9 {
                2.0 * half_bw
            } else {
                (std::f64::consts::TAU * half_bw * t).sin() / (std::f64::consts::PI * t)
            };
            let phase = std::f64::consts::TAU * center * t;
            Complex::from_polar(sinc as f32 * window[i], phase as f32)
        })
        .collect();

    // Normalize to unity gain at band center.
    let gain: Complex<f32> = taps
        .iter()
        .enumerate()
        .map(|(i, tap)| {
            let t = i as f64 - mid;
            tap * Complex::from_polar(1.0, -(std::f64::consts::TAU * center * t) as f32)
        })
        .sum();
    let norm = gain.norm();
    if norm > 1e-12 {
        let inv = 1.0 / norm;
        for tap in taps.iter_mut() {
            *tap *= inv;
        }
    }
    taps
}

/// Frequency-domain passband response for an overlap-save section of
/// size `fft_size`: FFT of the zero-padded Kaiser band-pass taps.
pub fn passband_response(
    planner: &mut FftPlanner<f32>,
    fft_size: usize,
    sample_rate: f64,
    low_hz: f64,
    high_hz: f64,
    beta: f32,
    taps: usize,
) -> Vec<Complex<f32>> {
    let taps = taps.min(fft_size).max(1);
    let mut buf = bandpass_taps(sample_rate, low_hz, high_hz, beta, taps);
    buf.resize(fft_size, Complex::new(0.0, 0.0));
    let plan = planner.plan_fft_forward(fft_size);
    plan.process(&mut buf);
    buf
}

/// Secondary overlap-save filter applied at the channel rate, narrowing
/// the passband without rebuilding the channelizer. `blocking` sets how
/// many channel blocks are aggregated per transform.
pub struct SecondFilter {
    h_freq: Vec<Complex<f32>>,
    overlap: Vec<Complex<f32>>,
    n_taps: usize,
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl SecondFilter {
    pub fn new(
        planner: &mut FftPlanner<f32>,
        sample_rate: f64,
        low_hz: f64,
        high_hz: f64,
        beta: f32,
        block_size: usize,
        blocking: u32,
    ) -> Self {
        let blocking = blocking.clamp(1, 10) as usize;
        // Impulse length grows with the blocking factor: more aggregation
        // buys a sharper filter at the same overlap fraction.
        let n_taps = (block_size * blocking / 2 + 1).max(3);
        let fft_size = (block_size + n_taps - 1).next_power_of_two();

        let fft = planner.plan_fft_forward(fft_size);
        let ifft = planner.plan_fft_inverse(fft_size);
        let h_freq = passband_response(
            planner, fft_size, sample_rate, low_hz, high_hz, beta, n_taps,
        );

        Self {
            h_freq,
            overlap: vec![Complex::new(0.0, 0.0); n_taps - 1],
            n_taps,
            fft_size,
            fft,
            ifft,
            scratch: vec![Complex::new(0.0, 0.0); fft_size],
        }
    }

    pub fn impulse_length(&self) -> usize {
        self.n_taps
    }

    pub fn block_size(&self) -> usize {
        self.fft_size
    }

    /// Filter one block of complex baseband, same length out as in.
    pub fn filter_block_into(&mut self, input: &[Complex<f32>], output: &mut Vec<Complex<f32>>) {
        let n_new = input.len();
        let n_overlap = self.n_taps - 1;

        let buf = &mut self.scratch;
        buf.clear();
        buf.extend_from_slice(&self.overlap);
        buf.extend_from_slice(input);
        buf.resize(self.fft_size, Complex::new(0.0, 0.0));

        self.fft.process(buf);
        let scale = 1.0 / self.fft_size as f32;
        for (x, &h) in buf.iter_mut().zip(self.h_freq.iter()) {
            *x = *x * h * scale;
        }
        self.ifft.process(buf);

        let end = (n_overlap + n_new).min(buf.len());
        output.clear();
        output.extend_from_slice(&buf[n_overlap..end]);

        if n_overlap > 0 {
            if n_new >= n_overlap {
                self.overlap.copy_from_slice(&input[n_new - n_overlap..]);
            } else {
                let keep_old = n_overlap - n_new;
                self.overlap.copy_within(n_new..n_overlap, 0);
                self.overlap[keep_old..].copy_from_slice(input);
            }
        }
    }
}
