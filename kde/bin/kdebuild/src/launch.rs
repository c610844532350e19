// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Logged subprocess execution: every build tool invocation is teed into a
//! per-module log file, optionally surfacing output lines to a callback so
//! the caller can parse progress.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::FromRawFd;
use std::path::Path;
use std::process::{Command, Stdio};

use itertools::Itertools;
use tracing::{debug, warn};

use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::module::Module;

fn escaped(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_escape::escape(arg.as_str().into()))
        .join(" ")
}

/// Runs a command for the given module, logging output to
/// `<logdir>/<module>/<logname>.log`. Returns the command's exit code (0
/// for success). In pretend mode nothing is run and 0 is returned.
pub fn run_logged(
    module: &Module,
    ctx: &mut BuildContext,
    logname: &str,
    dir: Option<&Path>,
    argv: &[String],
) -> Result<i32> {
    run_logged_with_callback(module, ctx, logname, dir, argv, None)
}

/// Like [`run_logged`], but each line of combined child output is also
/// handed to `callback` as it arrives. The child's stdout and stderr are
/// merged so compiler warnings and progress lines land in one stream.
pub fn run_logged_with_callback(
    module: &Module,
    ctx: &mut BuildContext,
    logname: &str,
    dir: Option<&Path>,
    argv: &[String],
    mut callback: Option<&mut dyn FnMut(&str)>,
) -> Result<i32> {
    if argv.is_empty() {
        return Err(BuildError::internal("Empty command line"));
    }
    if ctx.pretend {
        debug!("\tWould run: {}", escaped(argv));
        return Ok(0);
    }

    let log_path = module.log_path(ctx, &format!("{logname}.log"))?;
    let mut log_file = File::create(&log_path)
        .map_err(|err| BuildError::runtime(format!("{}: {err}", log_path.display())))?;
    writeln!(log_file, "# kdebuild running: '{}'", escaped(argv))?;
    if let Some(dir) = dir {
        writeln!(log_file, "# from directory: {}", dir.display())?;
    }

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.stdin(Stdio::null());
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    // The queued environment delta applies to the child only; our own
    // environment is never mutated.
    cmd.envs(ctx.environment());

    let status = if callback.is_some() {
        // Merge stdout and stderr through one pipe we read ourselves.
        let (read_fd, write_fd) = nix::unistd::pipe()
            .map_err(|err| BuildError::runtime(format!("pipe: {err}")))?;
        // Safety: freshly created fds, each wrapped exactly once.
        let write_end = unsafe { File::from_raw_fd(write_fd) };
        let read_end = unsafe { File::from_raw_fd(read_fd) };
        cmd.stdout(Stdio::from(write_end.try_clone()?));
        cmd.stderr(Stdio::from(write_end));

        let mut child = cmd
            .spawn()
            .map_err(|err| BuildError::runtime(format!("Unable to run {}: {err}", argv[0])))?;
        // Drop our copy of the write end so the read side sees EOF when the
        // child exits.
        drop(cmd);

        let reader = BufReader::new(read_end);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!("Error reading output of {}: {err}", argv[0]);
                    break;
                }
            };
            writeln!(log_file, "{line}")?;
            if let Some(cb) = callback.as_mut() {
                cb(&line);
            }
        }
        // Output fully drained; now it is safe to block on the child.
        child.wait()?
    } else {
        cmd.stdout(Stdio::from(log_file.try_clone()?));
        cmd.stderr(Stdio::from(log_file.try_clone()?));
        let mut child = cmd
            .spawn()
            .map_err(|err| BuildError::runtime(format!("Unable to run {}: {err}", argv[0])))?;
        drop(cmd);
        child.wait()?
    };

    let code = status.code().unwrap_or(-1);
    if code != 0 {
        writeln!(log_file, "# exited with status {code}")?;
    }
    Ok(code)
}

/// Locates an executable on PATH, returning its absolute path.
pub fn locate_exe(program: &str) -> Option<std::path::PathBuf> {
    if program.contains('/') {
        let path = std::path::PathBuf::from(program);
        return path.is_file().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Recursively empties a directory without removing the directory itself.
pub fn prune_under_directory(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionValue;
    use tempfile::tempdir;

    fn test_context(dir: &Path) -> BuildContext {
        let mut ctx = BuildContext::new();
        for key in ["source-dir", "build-dir", "log-dir"] {
            ctx.set_option(
                key,
                OptionValue::Str(dir.join(key).to_string_lossy().into_owned()),
            )
            .unwrap();
        }
        ctx
    }

    #[test]
    fn logs_output_and_reports_exit_code() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        let module = Module::new(&ctx, "testmod");

        let code = run_logged(
            &module,
            &mut ctx,
            "hello",
            None,
            &["sh".into(), "-c".into(), "echo hi there".into()],
        )
        .unwrap();
        assert_eq!(code, 0);

        let log_dir = ctx.log_dir_for(&dir.path().join("log-dir"), Some("testmod"));
        let text = std::fs::read_to_string(log_dir.join("hello.log")).unwrap();
        assert!(text.contains("hi there"));
    }

    #[test]
    fn callback_sees_merged_output() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        let module = Module::new(&ctx, "testmod");

        let mut seen = Vec::new();
        let mut callback = |line: &str| seen.push(line.to_string());
        let code = run_logged_with_callback(
            &module,
            &mut ctx,
            "build",
            None,
            &[
                "sh".into(),
                "-c".into(),
                "echo '[ 50%] Building'; echo 'warning: dubious' >&2; exit 3".into(),
            ],
            Some(&mut callback),
        )
        .unwrap();
        assert_eq!(code, 3);
        assert!(seen.contains(&"[ 50%] Building".to_string()));
        assert!(seen.contains(&"warning: dubious".to_string()));
    }

    #[test]
    fn pretend_runs_nothing() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        ctx.pretend = true;
        let module = Module::new(&ctx, "testmod");
        let code = run_logged(
            &module,
            &mut ctx,
            "noop",
            None,
            &["false".into()],
        )
        .unwrap();
        assert_eq!(code, 0);
        assert!(!dir.path().join("log-dir").exists());
    }

    #[test]
    fn locates_standard_tools() {
        assert!(locate_exe("sh").is_some());
        assert!(locate_exe("definitely-not-a-real-tool-xyz").is_none());
    }
}
