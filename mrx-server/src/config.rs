// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configuration file support for mrxd.
//!
//! Supports loading configuration from TOML files with the following
//! search order:
//! 1. Path specified via `--config` CLI argument
//! 2. `./mrxd.toml` (current directory)
//! 3. `~/.config/mrx/mrxd.toml` (XDG config)
//! 4. `/etc/mrx/mrxd.toml` (system-wide)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::preset::Preset;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Process-wide settings
    pub global: GlobalConfig,
    /// Sample source description
    pub frontend: FrontendConfig,
    /// Channels created at startup
    pub channels: Vec<ChannelConfig>,
    /// Presets layered over the builtins
    pub presets: HashMap<String, Preset>,
}

/// Log verbosity. Lowercase on disk: `log_level = "debug"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Log verbosity for the whole daemon
    pub log_level: LogLevel,
    /// UDP socket the control/status protocol listens on
    pub status_listen: SocketAddr,
    /// Status destination (multicast group or unicast receiver)
    pub status_dest: Option<SocketAddr>,
    /// Default data destination; required for dynamic channel creation
    pub data: Option<SocketAddr>,
    /// Idle channel expiration, in blocks
    pub idle_timeout_blocks: u32,
    /// Master block length in milliseconds
    pub blocktime_ms: u32,
    /// Shared filter impulse budget as a fraction of the block
    pub overlap: f32,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            status_listen: "0.0.0.0:5006".parse().expect("static addr"),
            status_dest: None,
            data: None,
            idle_timeout_blocks: 1_000,
            blocktime_ms: 20,
            overlap: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    pub description: String,
    /// Input sample rate in Hz
    pub samprate: u32,
    /// Real-sampled frontend (true) or complex IQ (false)
    pub isreal: bool,
    pub bits_per_sample: u32,
    /// Fractional frequency calibration (e.g. 1e-6 = +1 ppm)
    pub calibrate: f64,
    /// Initial LO frequency in Hz
    pub frequency: f64,
    /// Synthesized test carriers as [offset_hz, amplitude] pairs
    pub tones: Vec<[f64; 2]>,
    /// Synthesized noise amplitude
    pub noise: f32,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            description: "synthesized".to_string(),
            samprate: 1_920_000,
            isreal: false,
            bits_per_sample: 16,
            calibrate: 0.0,
            frequency: 100_000_000.0,
            tones: Vec::new(),
            noise: 0.0,
        }
    }
}

/// One statically configured channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub ssrc: u32,
    pub freq: f64,
    pub preset: Option<String>,
    /// Destination for PCM; falls back to the global default
    pub data: Option<SocketAddr>,
    pub samprate: Option<u32>,
    pub low: Option<f32>,
    pub high: Option<f32>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ssrc: 0,
            freq: 0.0,
            preset: None,
            data: None,
            samprate: None,
            low: None,
            high: None,
        }
    }
}

/// Immutable process defaults derived from config, handed to the control
/// plane and workers.
#[derive(Debug, Clone)]
pub struct Defaults {
    pub data_dest: Option<SocketAddr>,
    pub status_dest: Option<SocketAddr>,
    pub idle_timeout_blocks: u32,
    /// Blocks per second of the master FFT stage.
    pub block_rate: f64,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Invalid {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Search the standard locations; `None` means "run on defaults".
    pub fn find_config_file(cli_path: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = cli_path {
            return Some(path.to_path_buf());
        }
        let mut candidates = vec![PathBuf::from("./mrxd.toml")];
        if let Ok(home) = std::env::var("HOME") {
            candidates.push(PathBuf::from(home).join(".config/mrx/mrxd.toml"));
        }
        candidates.push(PathBuf::from("/etc/mrx/mrxd.toml"));
        candidates.into_iter().find(|p| p.exists())
    }

    /// An example configuration, printed by `--print-config`.
    pub fn example() -> String {
        let mut example = ServerConfig::default();
        example.global.data = Some("239.2.1.1:5004".parse().expect("static addr"));
        example.global.status_dest = Some("239.2.1.2:5006".parse().expect("static addr"));
        example.frontend.tones = vec![[200_000.0, 0.5]];
        example.channels.push(ChannelConfig {
            ssrc: 10,
            freq: 100_200_000.0,
            preset: Some("fm".to_string()),
            ..ChannelConfig::default()
        });
        toml::to_string_pretty(&example).unwrap_or_default()
    }

    pub fn defaults(&self) -> Defaults {
        Defaults {
            data_dest: self.global.data,
            status_dest: self.global.status_dest,
            idle_timeout_blocks: self.global.idle_timeout_blocks,
            block_rate: 1_000.0 / self.global.blocktime_ms.max(1) as f64,
        }
    }

    /// Master block length in samples.
    pub fn block_size(&self) -> usize {
        (self.frontend.samprate as u64 * self.global.blocktime_ms.max(1) as u64 / 1_000) as usize
    }

    /// Shared impulse-response budget in samples.
    pub fn impulse_length(&self) -> usize {
        (self.block_size() as f32 * self.global.overlap.clamp(0.1, 1.0)) as usize + 1
    }
}

/// Why a configuration file could not be used. The underlying I/O or
/// TOML error rides along so `source()` chains stay intact.
#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Invalid {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, .. } => write!(f, "config {}: unreadable", path.display()),
            Self::Invalid { path, .. } => {
                write!(
                    f,
                    "config {}: bad [global]/[frontend]/[[channels]]/[presets] data",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Invalid { source, .. } => Some(source),
        }
    }
}
