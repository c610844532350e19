// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod application;
mod buildsystem;
mod cli;
mod context;
mod dependency;
mod error;
mod ipc;
mod launch;
mod metadata;
mod module;
mod moduleset;
mod options;
mod phase;
mod rcfile;
mod resolver;
mod state;
mod status;
mod taskmanager;
mod updater;

use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let args = cli::Args::parse();

    match cliutil::LoggingConfig::from_env().and_then(|config| config.setup()) {
        Ok(()) => {}
        Err(err) => {
            eprintln!("kdebuild: failed to set up logging: {err:?}");
            return ExitCode::FAILURE;
        }
    }
    cliutil::log_current_command_line();

    match application::run(args) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            tracing::error!("{err}");
            if std::env::var("RUST_BACKTRACE").is_err() {
                eprintln!("Hint: Set RUST_BACKTRACE=1 to print stack traces");
            }
            ExitCode::FAILURE
        }
    }
}
