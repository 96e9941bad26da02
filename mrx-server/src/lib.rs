// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Daemon plumbing around the `mrx-core` DSP: frontend descriptor and
//! producer loop, channel registry, control-plane reader, per-channel
//! worker threads and the status emitter.

pub mod channel;
pub mod config;
pub mod control;
pub mod frontend;
pub mod logging;
pub mod output;
pub mod preset;
pub mod registry;
pub mod status;
pub mod worker;

pub type DynResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use mrx_core::fft::{BlockBoard, MasterFftParams};
use mrx_core::input::InputRing;

/// Immutable context handed to every thread: the shared DSP stages, the
/// channel registry, presets and process-wide defaults. There is no
/// process-global mutable state beyond what lives behind these handles.
pub struct ServerContext {
    pub frontend: Arc<frontend::Frontend>,
    pub master_params: MasterFftParams,
    pub ring: Arc<InputRing>,
    pub board: Arc<BlockBoard>,
    pub registry: Arc<registry::Registry>,
    pub presets: Arc<preset::PresetTable>,
    pub defaults: config::Defaults,
    pub status: Arc<status::StatusSender>,
    pub stop: Arc<AtomicBool>,
}
