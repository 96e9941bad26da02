// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Circular input buffer between the frontend producer and the master
//! FFT stage.
//!
//! The frontend writes blocks of samples and advances a monotonic write
//! counter; the master FFT stage sleeps until at least one new block is
//! available, then copies out an overlap-save window (the new block plus
//! the tail of the previous one). Real frontends store their samples in
//! the real part with the imaginary part zero.

use std::sync::{Condvar, Mutex};

use num_complex::Complex;

struct RingState {
    buf: Vec<Complex<f32>>,
    /// Total samples ever written.
    write_count: u64,
    /// Total samples ever consumed by the reader.
    read_count: u64,
    shutdown: bool,
}

pub struct InputRing {
    state: Mutex<RingState>,
    cond: Condvar,
    capacity: usize,
}

pub enum RingRead {
    /// A full overlap-save window was copied into the caller's buffer.
    Window,
    /// The producer has shut down; no more samples will arrive.
    Shutdown,
}

impl InputRing {
    /// `capacity` must be at least twice the overlap-save window so the
    /// producer never overwrites samples the reader still needs.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                buf: vec![Complex::new(0.0, 0.0); capacity],
                write_count: 0,
                read_count: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append samples and wake the reader. Called by the frontend producer.
    pub fn write(&self, samples: &[Complex<f32>]) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let cap = self.capacity as u64;
        for &sample in samples {
            let idx = (state.write_count % cap) as usize;
            state.buf[idx] = sample;
            state.write_count += 1;
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Convenience for real-sample frontends.
    pub fn write_real(&self, samples: &[f32]) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let cap = self.capacity as u64;
        for &sample in samples {
            let idx = (state.write_count % cap) as usize;
            state.buf[idx] = Complex::new(sample, 0.0);
            state.write_count += 1;
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Mark the stream finished and wake the reader.
    pub fn shutdown(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.shutdown = true;
        }
        self.cond.notify_all();
    }

    pub fn samples_written(&self) -> u64 {
        match self.state.lock() {
            Ok(state) => state.write_count,
            Err(poisoned) => poisoned.into_inner().write_count,
        }
    }

    /// Block until `block` new samples are available, then copy the
    /// overlap-save window (the previous `window.len() - block` samples
    /// followed by the new block) into `window` and advance the read
    /// counter by `block`.
    ///
    /// The first call starts reading at zero; the leading history is
    /// whatever the ring was initialized with (zeros).
    pub fn read_window(&self, window: &mut [Complex<f32>], block: usize) -> RingRead {
        assert!(window.len() >= block, "window shorter than block");
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if state.write_count >= state.read_count + block as u64 {
                break;
            }
            if state.shutdown {
                return RingRead::Shutdown;
            }
            state = match self.cond.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }

        let cap = self.capacity as u64;
        let end = state.read_count + block as u64;
        // Window ends at `end`; the start may reach before sample zero on
        // the very first blocks, where zero history stands in.
        let start = end as i64 - window.len() as i64;
        for (i, slot) in window.iter_mut().enumerate() {
            let pos = start + i as i64;
            *slot = if pos < 0 {
                Complex::new(0.0, 0.0)
            } else {
                state.buf[(pos as u64 % cap) as usize]
            };
        }
        state.read_count = end;
        RingRead::Window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_carries_history() {
        let ring = InputRing::new(64);
        let first: Vec<Complex<f32>> = (0..8).map(|i| Complex::new(i as f32, 0.0)).collect();
        let second: Vec<Complex<f32>> = (8..16).map(|i| Complex::new(i as f32, 0.0)).collect();
        ring.write(&first);
        ring.write(&second);

        let mut window = vec![Complex::new(-1.0, 0.0); 12];
        assert!(matches!(ring.read_window(&mut window, 8), RingRead::Window));
        // First read: 4 samples of zero history, then samples 0..8.
        for slot in &window[..4] {
            assert_eq!(slot.re, 0.0);
        }
        for (i, slot) in window[4..].iter().enumerate() {
            assert_eq!(slot.re, i as f32);
        }

        assert!(matches!(ring.read_window(&mut window, 8), RingRead::Window));
        // Second read: history is samples 4..8, new block is 8..16.
        for (i, slot) in window.iter().enumerate() {
            assert_eq!(slot.re, (i + 4) as f32);
        }
    }

    #[test]
    fn test_shutdown_unblocks_reader() {
        use std::sync::Arc;
        let ring = Arc::new(InputRing::new(32));
        let reader_ring = ring.clone();
        let handle = std::thread::spawn(move || {
            let mut window = vec![Complex::new(0.0, 0.0); 16];
            matches!(
                reader_ring.read_window(&mut window, 16),
                RingRead::Shutdown
            )
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        ring.shutdown();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_write_real_zeroes_imaginary() {
        let ring = InputRing::new(16);
        ring.write_real(&[1.0, 2.0, 3.0, 4.0]);
        let mut window = vec![Complex::new(9.0, 9.0); 4];
        assert!(matches!(ring.read_window(&mut window, 4), RingRead::Window));
        for (i, slot) in window.iter().enumerate() {
            assert_eq!(slot.re, (i + 1) as f32);
            assert_eq!(slot.im, 0.0);
        }
    }
}
