// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

/// The three failure kinds the orchestrator distinguishes.
///
/// `Config` failures are user-fixable (bad rc-file, unknown option) and are
/// fatal for the run. `Runtime` failures are environment-fixable or
/// transient (clone failed, build command failed) and are generally scoped
/// to one module. `Internal` indicates a bug in kdebuild itself.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Runtime(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// A rebase or merge is in progress in a module's checkout. Carried as
    /// its own variant so the update driver can map it to the dedicated IPC
    /// conflict status rather than a generic failure.
    #[error("source conflict: {0}")]
    Conflict(String),
}

impl BuildError {
    pub fn config(msg: impl Into<String>) -> Self {
        BuildError::Config(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        BuildError::Runtime(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        BuildError::Internal(msg.into())
    }

    pub fn is_config(&self) -> bool {
        matches!(self, BuildError::Config(_))
    }
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        BuildError::Runtime(err.to_string())
    }
}

impl From<anyhow::Error> for BuildError {
    fn from(err: anyhow::Error) -> Self {
        BuildError::Runtime(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
