// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Master FFT stage: one overlap-save forward FFT shared by every channel.
//!
//! Each block of `block` new input samples is extended with the previous
//! `impulse_length - 1` samples (N_fft = block + impulse_length - 1) and
//! transformed once. Channels then pick their bins out of the published
//! frequency-domain block instead of filtering the wideband stream
//! themselves.

use std::sync::{Arc, Condvar, Mutex};

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Sequence value published to unblock every waiter during shutdown.
pub const POISON_SEQUENCE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDomain {
    /// Real frontend: only bins 0..=N_fft/2 carry information.
    Real,
    /// Complex (IQ) frontend: all N_fft bins carry information.
    Complex,
}

#[derive(Debug, Clone, Copy)]
pub struct MasterFftParams {
    /// New input samples consumed per block.
    pub block: usize,
    /// Impulse response length budgeted for the shared filter bank.
    pub impulse_length: usize,
    pub domain: InputDomain,
    pub sample_rate: u32,
}

impl MasterFftParams {
    pub fn n_fft(&self) -> usize {
        self.block + self.impulse_length - 1
    }

    /// Number of non-redundant frequency bins published per block.
    pub fn n_bins(&self) -> usize {
        match self.domain {
            InputDomain::Real => self.n_fft() / 2 + 1,
            InputDomain::Complex => self.n_fft(),
        }
    }

    /// Hz covered by one bin.
    pub fn bin_bw(&self) -> f64 {
        self.sample_rate as f64 / self.n_fft() as f64
    }

    /// Blocks per second; every channel output rate is a multiple of this.
    pub fn block_rate(&self) -> f64 {
        self.sample_rate as f64 / self.block as f64
    }
}

/// One published frequency-domain block. Immutable after publication.
pub struct MasterBlock {
    pub seq: u64,
    pub bins: Vec<Complex<f32>>,
    pub domain: InputDomain,
    pub n_fft: usize,
    /// Block start time, nanoseconds since the unix epoch.
    pub start_ns: i64,
}

struct BoardState {
    latest: Option<Arc<MasterBlock>>,
    seq: u64,
    poisoned: bool,
}

/// Publication point between the master FFT thread and channel workers.
///
/// Readers snapshot an `Arc` to the latest block; blocks are never
/// mutated after publication, so no tearing is possible. A reader that
/// fell behind observes a sequence jump and counts the gap as drops.
pub struct BlockBoard {
    state: Mutex<BoardState>,
    cond: Condvar,
}

pub enum WaitOutcome {
    /// Next block, plus how many blocks the reader missed since the
    /// sequence it last saw.
    Block(Arc<MasterBlock>, u64),
    Shutdown,
}

impl BlockBoard {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BoardState {
                latest: None,
                seq: 0,
                poisoned: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn publish(&self, block: MasterBlock) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.seq = block.seq;
        state.latest = Some(Arc::new(block));
        drop(state);
        self.cond.notify_all();
    }

    /// Wake every waiter with the poison sequence.
    pub fn poison(&self) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.poisoned = true;
        drop(state);
        self.cond.notify_all();
    }

    pub fn latest_seq(&self) -> u64 {
        match self.state.lock() {
            Ok(state) => state.seq,
            Err(poisoned) => poisoned.into_inner().seq,
        }
    }

    /// Block until a sequence newer than `last_seq` is published.
    pub fn wait_newer(&self, last_seq: u64) -> WaitOutcome {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if state.poisoned {
                return WaitOutcome::Shutdown;
            }
            if state.seq > last_seq {
                if let Some(block) = &state.latest {
                    let dropped = state.seq - last_seq - 1;
                    return WaitOutcome::Block(block.clone(), dropped);
                }
            }
            state = match self.cond.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

impl Default for BlockBoard {
    fn default() -> Self {
        Self::new()
    }
}

/// The forward transform itself. Owned by the single master FFT thread.
pub struct MasterFft {
    params: MasterFftParams,
    plan: Arc<dyn Fft<f32>>,
    buf: Vec<Complex<f32>>,
    seq: u64,
}

impl MasterFft {
    pub fn new(planner: &mut FftPlanner<f32>, params: MasterFftParams) -> Self {
        let n_fft = params.n_fft();
        Self {
            params,
            plan: planner.plan_fft_forward(n_fft),
            buf: vec![Complex::new(0.0, 0.0); n_fft],
            seq: 0,
        }
    }

    pub fn params(&self) -> MasterFftParams {
        self.params
    }

    /// Transform one overlap-save window (length N_fft) into a published
    /// block. Real frontends keep only the non-redundant half spectrum.
    pub fn process_window(&mut self, window: &[Complex<f32>], start_ns: i64) -> MasterBlock {
        assert_eq!(window.len(), self.params.n_fft(), "window length");
        self.buf.copy_from_slice(window);
        self.plan.process(&mut self.buf);
        self.seq += 1;

        let bins = match self.params.domain {
            InputDomain::Complex => self.buf.clone(),
            InputDomain::Real => self.buf[..self.params.n_bins()].to_vec(),
        };
        MasterBlock {
            seq: self.seq,
            bins,
            domain: self.params.domain,
            n_fft: self.params.n_fft(),
            start_ns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(domain: InputDomain) -> MasterFftParams {
        MasterFftParams {
            block: 64,
            impulse_length: 17,
            domain,
            sample_rate: 6400,
        }
    }

    #[test]
    fn test_n_fft_is_block_plus_impulse_minus_one() {
        let p = params(InputDomain::Complex);
        assert_eq!(p.n_fft(), 80);
        assert_eq!(p.n_bins(), 80);
        assert_eq!(params(InputDomain::Real).n_bins(), 41);
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let mut planner = FftPlanner::new();
        let mut fft = MasterFft::new(&mut planner, params(InputDomain::Complex));
        let window = vec![Complex::new(0.0, 0.0); 80];
        let a = fft.process_window(&window, 0);
        let b = fft.process_window(&window, 0);
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
    }

    #[test]
    fn test_tone_lands_in_expected_bin() {
        use std::f32::consts::TAU;
        let p = params(InputDomain::Complex);
        let mut planner = FftPlanner::new();
        let mut fft = MasterFft::new(&mut planner, p);
        let n = p.n_fft();
        // Complex exponential at bin 5 of the N_fft-point transform.
        let window: Vec<Complex<f32>> = (0..n)
            .map(|i| Complex::from_polar(1.0, TAU * 5.0 * i as f32 / n as f32))
            .collect();
        let block = fft.process_window(&window, 0);
        let peak = block
            .bins
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.norm().partial_cmp(&b.1.norm()).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 5);
    }

    #[test]
    fn test_board_reports_drops() {
        let board = BlockBoard::new();
        for seq in 1..=4 {
            board.publish(MasterBlock {
                seq,
                bins: Vec::new(),
                domain: InputDomain::Complex,
                n_fft: 0,
                start_ns: 0,
            });
        }
        match board.wait_newer(1) {
            WaitOutcome::Block(block, dropped) => {
                assert_eq!(block.seq, 4);
                assert_eq!(dropped, 2);
            }
            WaitOutcome::Shutdown => panic!("unexpected shutdown"),
        }
    }

    #[test]
    fn test_poison_wakes_waiter() {
        use std::sync::Arc;
        let board = Arc::new(BlockBoard::new());
        let waiter = board.clone();
        let handle =
            std::thread::spawn(move || matches!(waiter.wait_newer(0), WaitOutcome::Shutdown));
        std::thread::sleep(std::time::Duration::from_millis(20));
        board.poison();
        assert!(handle.join().unwrap());
    }
}
