// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Provides functions common to Rust-based CLI programs in this repository.

use itertools::Itertools;
use std::{ffi::OsStr, fmt::Debug, process::ExitCode};

mod logging;

pub use crate::logging::*;

/// Exit code for a run ended by a fatal signal (SIGINT and friends).
pub const EXIT_CODE_SIGNALLED: u8 = 5;

/// Logs the command line of the current process.
pub fn log_current_command_line() {
    let escaped_command = std::env::args()
        .map(|s| shell_escape::escape(s.into()))
        .join(" ");
    tracing::info!("COMMAND: {}", escaped_command);
}

/// Handles the top-level [`Result`] and returns the [`ExitCode`] to use.
///
/// Failures map to exit code 1; the distinguished signal exit code is
/// produced by the signal handlers, not here.
pub fn handle_top_level_result<E: Debug>(result: Result<ExitCode, E>) -> ExitCode {
    match result {
        Err(error) => {
            eprintln!("{}: error: {:?}", get_current_process_name(), error);
            ExitCode::FAILURE
        }
        Ok(code) => code,
    }
}

/// Returns the current process name, or `__unknown__` if it failed to get one.
fn get_current_process_name() -> String {
    let current_exe = std::env::current_exe().unwrap_or_default();
    current_exe
        .file_name()
        .unwrap_or(OsStr::new("__unknown__"))
        .to_string_lossy()
        .into_owned()
}
