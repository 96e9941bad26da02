// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! DSP core for the mrx multichannel receiver daemon.
//!
//! Everything in this crate is pure signal processing: the input sample
//! ring, the shared master FFT stage, the per-channel frequency-domain
//! channelizer, the demodulators and their estimators. No sockets, no
//! logging, no configuration — those live in `mrx-server`.

pub mod channelizer;
pub mod demod;
pub mod estimators;
pub mod fft;
pub mod filter;
pub mod input;
pub mod osc;
pub mod units;

pub type DynResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub use fft::{BlockBoard, InputDomain, MasterBlock, MasterFft, MasterFftParams, WaitOutcome};
pub use input::InputRing;
