// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Library configuration from the environment, overridable via API.
//!
//! Everything here is optional: the library works without any environment
//! variables set and without a logging subscriber installed (callers who
//! already have a `tracing` subscriber keep using theirs).
//!
//! Recognized variables:
//!
//! - `LIDARSIM_LOG_STDOUT` - "1"/"true" to log to stdout (default on)
//! - `LIDARSIM_LOG_LEVEL` - trace|debug|info|warn|error|off (default info)
//! - `LIDARSIM_LOG_FILE` - append structured logs to this file
//! - `LIDARSIM_AUTO_TAPE_PATH` - base path for automatic call recording;
//!   the recorder itself lives outside this crate, the path is only
//!   surfaced to it through [`Config::auto_tape_path`]

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::{Layer as _, Registry};

use crate::error::{Error, Result};

/// Logging and tape configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Emit human-readable logs on stdout.
    pub log_to_stdout: bool,
    /// Maximum level to record.
    pub log_level: LevelFilter,
    /// Optional log file (appended).
    pub log_file: Option<PathBuf>,
    /// Base path for the external call recorder, if enabled.
    pub auto_tape_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_to_stdout: true,
            log_level: LevelFilter::INFO,
            log_file: None,
            auto_tape_path: None,
        }
    }
}

impl Config {
    /// Build a configuration from the `LIDARSIM_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("LIDARSIM_LOG_STDOUT") {
            cfg.log_to_stdout = matches!(v.as_str(), "1" | "true" | "TRUE" | "yes");
        }
        if let Ok(v) = std::env::var("LIDARSIM_LOG_LEVEL") {
            if let Ok(level) = v.parse::<LevelFilter>() {
                cfg.log_level = level;
            }
        }
        if let Ok(v) = std::env::var("LIDARSIM_LOG_FILE") {
            if !v.is_empty() {
                cfg.log_file = Some(PathBuf::from(v));
            }
        }
        if let Ok(v) = std::env::var("LIDARSIM_AUTO_TAPE_PATH") {
            if !v.is_empty() {
                cfg.auto_tape_path = Some(PathBuf::from(v));
            }
        }
        cfg
    }
}

/// Install the global `tracing` subscriber described by `cfg`.
///
/// Returns [`Error::AlreadyInitialized`] if a global subscriber is already
/// installed (by this function or by the embedding application).
pub fn init_logging(cfg: &Config) -> Result<()> {
    let stdout_layer = cfg.log_to_stdout.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_filter(cfg.log_level)
    });

    let file_layer = match &cfg.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    Error::InvalidArgument(format!("cannot open log file {:?}: {}", path, e))
                })?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(cfg.log_level),
            )
        }
        None => None,
    };

    let subscriber = Registry::default().with(stdout_layer).with(file_layer);
    tracing::subscriber::set_global_default(subscriber).map_err(|_| Error::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_stdout_info() {
        let cfg = Config::default();
        assert!(cfg.log_to_stdout);
        assert_eq!(cfg.log_level, LevelFilter::INFO);
        assert!(cfg.log_file.is_none());
        assert!(cfg.auto_tape_path.is_none());
    }
}
