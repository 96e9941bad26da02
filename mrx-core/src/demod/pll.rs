// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Second-order phase-locked loop for coherent carrier recovery.

use num_complex::Complex;

/// Loop damping; critically-damped-ish response.
const DAMPING: f64 = std::f64::consts::FRAC_1_SQRT_2;
/// Lock declared when the smoothed cosine of the phase error exceeds this
/// (equivalent to a phase-error variance threshold).
const LOCK_LEVEL: f32 = 0.5;
/// Smoothing constant for the lock metric.
const LOCK_ALPHA: f32 = 2e-3;

pub struct Pll {
    sample_rate: f64,
    loop_bw: f32,
    alpha: f64,
    beta: f64,
    /// VCO phase, radians, kept unwrapped modulo the rotation counter.
    phase: f64,
    /// VCO frequency, radians per sample.
    freq: f64,
    /// Lock to 2f for suppressed-carrier (DSB-SC / BPSK) signals.
    square: bool,
    lock_metric: f32,
    rotations: i64,
    /// Per-block energy in the locked (I) and quadrature (Q) arms.
    inphase_energy: f64,
    quadrature_energy: f64,
}

impl Pll {
    pub fn new(sample_rate: f64, loop_bw: f32) -> Self {
        let mut pll = Self {
            sample_rate,
            loop_bw: 0.0,
            alpha: 0.0,
            beta: 0.0,
            phase: 0.0,
            freq: 0.0,
            square: false,
            lock_metric: 0.0,
            rotations: 0,
            inphase_energy: 0.0,
            quadrature_energy: 0.0,
        };
        pll.set_loop_bw(loop_bw);
        pll
    }

    pub fn set_loop_bw(&mut self, loop_bw: f32) {
        self.loop_bw = loop_bw.abs();
        let wn = std::f64::consts::TAU * self.loop_bw as f64 / self.sample_rate;
        self.alpha = 2.0 * DAMPING * wn;
        self.beta = wn * wn;
    }

    pub fn set_square(&mut self, square: bool) {
        self.square = square;
    }

    pub fn loop_bw(&self) -> f32 {
        self.loop_bw
    }

    pub fn square(&self) -> bool {
        self.square
    }

    /// Derotate one sample by the recovered carrier and advance the loop.
    pub fn step(&mut self, x: Complex<f32>) -> Complex<f32> {
        let vco = Complex::from_polar(1.0_f32, -(self.phase as f32));
        let derotated = x * vco;

        let err = if self.square {
            // Squaring removes BPSK modulation; the loop sees 2f, so halve
            // the detected error.
            let sq = derotated * derotated;
            (sq.arg() as f64) / 2.0
        } else {
            derotated.arg() as f64
        };

        self.freq += self.beta * err;
        self.phase += self.freq + self.alpha * err;
        if self.phase >= std::f64::consts::TAU {
            self.phase -= std::f64::consts::TAU;
            self.rotations += 1;
        } else if self.phase < 0.0 {
            self.phase += std::f64::consts::TAU;
            self.rotations -= 1;
        }

        self.lock_metric += LOCK_ALPHA * ((err.cos() as f32) - self.lock_metric);
        self.inphase_energy += (derotated.re * derotated.re) as f64;
        self.quadrature_energy += (derotated.im * derotated.im) as f64;

        derotated
    }

    pub fn locked(&self) -> bool {
        self.lock_metric > LOCK_LEVEL
    }

    /// Carrier phase offset in radians.
    pub fn cphase(&self) -> f32 {
        self.phase as f32
    }

    /// Count of complete VCO rotations since start (unwrapped phase).
    pub fn rotations(&self) -> i64 {
        self.rotations
    }

    /// Recovered carrier offset in Hz.
    pub fn foffset_hz(&self) -> f32 {
        (self.freq * self.sample_rate / std::f64::consts::TAU) as f32
    }

    /// SNR estimate from the locked-arm vs quadrature-arm energy ratio,
    /// as a linear power ratio. Consumes the block accumulators.
    pub fn block_snr(&mut self) -> f32 {
        let i = self.inphase_energy;
        let q = self.quadrature_energy;
        self.inphase_energy = 0.0;
        self.quadrature_energy = 0.0;
        if q <= 0.0 {
            return 0.0;
        }
        // Noise splits evenly between arms; signal is all in I when locked.
        (((i - q) / (2.0 * q)).max(0.0)) as f32
    }

    pub fn reset(&mut self) {
        self.phase = 0.0;
        self.freq = 0.0;
        self.lock_metric = 0.0;
        self.rotations = 0;
        self.inphase_energy = 0.0;
        self.quadrature_energy = 0.0;
    }
}
