// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{bail, Context, Result};
use nix::sys::signal::Signal;
use signal_hook::{
    consts::signal::{SIGCHLD, SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    os::unix::process::ExitStatusExt,
    process::{Command, ExitCode, ExitStatus, Stdio},
};
use tracing::instrument;

// run runs a child process, with some special signal handling:
//   - Forwards SIGTERM to the child process
//   - Ignores SIGINT while the process is running. SIGINT is normally
//     generated by the terminal when Ctrl+C is pressed, and is sent to all
//     processes in the foreground process group, so the child receives it by
//     default without our help. One exception is if the child puts itself
//     into a different process group, but we want to avoid that.
#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run(cmd: &mut Command) -> Result<ExitStatus> {
    // Register the signal handler before spawning the process to ensure we
    // don't drop any signals.
    let mut signals = Signals::new([SIGCHLD, SIGINT, SIGTERM])?;

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning {:?}", cmd.get_program()))?;

    for signal in signals.forever() {
        match signal {
            SIGCHLD => match &child.try_wait()? {
                Some(status) => return Ok(*status),
                None => continue,
            },
            SIGINT => {}
            SIGTERM => nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(child.id().try_into()?),
                Signal::SIGTERM,
            )?,
            _ => unreachable!(),
        }
    }
    unreachable!()
}

#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run_and_check(cmd: &mut Command) -> Result<()> {
    let status = run(cmd)?;
    if !status.success() {
        bail!("Command {:?} failed with {}", cmd.get_program(), status);
    }

    Ok(())
}

/// Runs a command with stdout captured and stderr suppressed, returning the
/// output lines on a zero exit. Used for quick query commands (git config,
/// git rev-parse and friends) whose output the caller needs to inspect.
pub fn capture_lines(cmd: &mut Command) -> Result<Vec<String>> {
    let output = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("running {:?}", cmd.get_program()))?;
    if !output.status.success() {
        bail!(
            "Command {:?} failed with {}",
            cmd.get_program(),
            output.status
        );
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text.lines().map(|line| line.to_string()).collect())
}

/// Like [`capture_lines`] but reports the exit status instead of failing,
/// for commands whose non-zero exits carry meaning (`git ls-remote
/// --exit-code` and similar).
pub fn capture_with_status(cmd: &mut Command) -> Result<(ExitStatus, Vec<String>)> {
    let output = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("running {:?}", cmd.get_program()))?;
    let text = String::from_utf8_lossy(&output.stdout);
    let lines = text.lines().map(|line| line.to_string()).collect();
    Ok((output.status, lines))
}

/// Converts [`ExitStatus`] to [`ExitCode`] following the POSIX shell
/// convention.
///
/// It panics if [`ExitStatus`] does not represent a status of an exiting
/// process (e.g. process being stopped or continued). This won't happen as
/// long as you get [`ExitStatus`] from [`std::process`] methods, such as
/// [`Command::status`], [`Command::output`],
/// [`Child::wait`](std::process::Child::wait).
pub fn status_to_exit_code(status: &ExitStatus) -> ExitCode {
    if let Some(code) = status.code() {
        ExitCode::from(code as u8)
    } else if let Some(signal) = status.signal() {
        ExitCode::from(128 + signal as u8)
    } else {
        panic!("ExitStatus does not represent process exit: {:?}", status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_process() -> Result<()> {
        run_and_check(&mut Command::new("true"))?;
        Ok(())
    }

    #[test]
    fn runs_failed_process() -> Result<()> {
        run(&mut Command::new("false"))?;
        assert!(run_and_check(&mut Command::new("false")).is_err());
        Ok(())
    }

    #[test]
    fn captures_output_lines() -> Result<()> {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo one; echo two"]);
        assert_eq!(capture_lines(&mut cmd)?, vec!["one", "two"]);
        Ok(())
    }

    #[test]
    fn captures_status_of_failing_command() -> Result<()> {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo partial; exit 2"]);
        let (status, lines) = capture_with_status(&mut cmd)?;
        assert_eq!(status.code(), Some(2));
        assert_eq!(lines, vec!["partial"]);
        Ok(())
    }
}
