// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logging Setup
//!
//! `LOG_LEVEL` accepts a plain level or full `RUST_LOG` directives; `RUST_LOG`
//! overrides it when set. The consumer writes plain-text lines
//! (`<timestamp> <LEVEL> <target>: <message>`) to its log file, other binaries
//! log to stdout.

use crate::{config::AppConfigs, errors::ConfigError};
use std::{
    env,
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Primary location of the consumer log file.
pub const DEFAULT_LOG_FILE: &str = "./logs/consumer.log";
/// Used when `./logs` is not available.
pub const FALLBACK_LOG_FILE: &str = "./consumer.log";

fn filter(cfg: &AppConfigs) -> EnvFilter {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        if let Ok(filter) = EnvFilter::try_new(rust_log) {
            return filter;
        }
    }

    let filter = EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    match "lapin=warn".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

/// Logs to stdout.
pub fn setup_logging(cfg: &AppConfigs) -> Result<(), ConfigError> {
    tracing_subscriber::registry()
        .with(filter(cfg))
        .with(fmt::layer().with_target(false))
        .try_init()
        .map_err(|err| ConfigError::LoggingError(err.to_string()))
}

/// Logs to the consumer log file and returns its path.
pub fn setup_file_logging(cfg: &AppConfigs) -> Result<PathBuf, ConfigError> {
    let (path, file) = open_log_file(cfg)?;

    tracing_subscriber::registry()
        .with(filter(cfg))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .map_err(|err| ConfigError::LoggingError(err.to_string()))?;

    Ok(path)
}

/// Opens `LOG_FILE` when configured, otherwise the default location with a
/// fallback to the working directory. Files are appended to.
pub fn open_log_file(cfg: &AppConfigs) -> Result<(PathBuf, File), ConfigError> {
    let candidates = match &cfg.log_file {
        Some(path) => vec![path.clone()],
        None => vec![PathBuf::from(DEFAULT_LOG_FILE), PathBuf::from(FALLBACK_LOG_FILE)],
    };

    let mut last_err = None;
    for path in candidates {
        match append(&path) {
            Ok(file) => return Ok((path, file)),
            Err(err) => {
                last_err = Some(ConfigError::LogFileError {
                    path: path.display().to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }

    Err(last_err.unwrap_or_else(|| ConfigError::LoggingError("no log file candidate".to_owned())))
}

fn append(path: &Path) -> std::io::Result<File> {
    // An explicit LOG_FILE may point into a directory that does not exist yet.
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() && path != Path::new(DEFAULT_LOG_FILE)
        {
            fs::create_dir_all(parent)?;
        }
    }

    OpenOptions::new().create(true).append(true).open(path)
}
