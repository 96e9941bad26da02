// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Tracing setup for the daemon.
//!
//! Every real-time path runs on a named thread ("frontend", "master-fft",
//! "chan-<ssrc>", "control"), so thread names are part of each log line;
//! that is how a line is attributed to a channel.

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::config::LogLevel;

/// Bring up the global subscriber at the configured verbosity.
pub fn init_logging(level: LogLevel) {
    let max_level = match level {
        LogLevel::Trace => Level::TRACE,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Info => Level::INFO,
        LogLevel::Warn => Level::WARN,
        LogLevel::Error => Level::ERROR,
    };

    FmtSubscriber::builder()
        .with_thread_names(true)
        .with_max_level(max_level)
        .init();
}
