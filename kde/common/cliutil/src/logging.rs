// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::PathBuf;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::Layer;

/// Name of the environment variable overriding the console log filter.
/// Accepts the usual env-filter syntax (e.g. "kdebuild::updater=debug").
pub const LOG_ENV: &str = "KDEBUILD_LOG";

/// An environment variable choosing whether to log to the console.
/// If "0", don't log to the console. Otherwise, do log to the console.
pub const CONSOLE_LOG_ENV: &str = "KDEBUILD_LOG_CONSOLE";

/// Name of the environment variable containing a log file path. If not
/// provided, no logging to files is performed.
pub const LOG_FILE_ENV: &str = "KDEBUILD_LOG_FILE";

/// The configuration for the logger.
pub struct LoggingConfig {
    /// The path to dump the logs to, and a filter for which logs should be
    /// dumped there. If None, logs will not be written to a file.
    pub log_file: Option<(PathBuf, EnvFilter)>,
    /// A filter for which logs should be written to the console.
    /// If None, logs will not be written to the console.
    pub console_logger: Option<EnvFilter>,
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self> {
        let console_logger = if std::env::var(CONSOLE_LOG_ENV).as_deref() == Ok("0") {
            None
        } else {
            Some(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .with_env_var(LOG_ENV)
                    .from_env()?,
            )
        };

        let log_file = std::env::var_os(LOG_FILE_ENV)
            .map(|path| (PathBuf::from(path), EnvFilter::new("debug")));

        Ok(Self {
            log_file,
            console_logger,
        })
    }

    /// Routes a full-verbosity copy of the logs to the given file, normally
    /// a `build-log` inside the run's timestamped log directory.
    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some((path, EnvFilter::new("debug")));
        self
    }

    pub fn setup(self) -> Result<()> {
        let file_layer = match self.log_file {
            Some((path, filter)) => {
                let file = File::create(&path)
                    .with_context(|| format!("Failed to create log file {}", path.display()))?;
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file)
                        .with_ansi(false)
                        .with_filter(filter),
                )
            }
            None => None,
        };

        let console_layer = self.console_logger.map(|filter| {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time()
                .with_filter(filter)
        });

        tracing_subscriber::registry()
            .with(file_layer)
            .with(console_layer)
            .init();
        Ok(())
    }
}
