// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Orchestration of the update and build phases. When both phases are in
//! play and async mode is on, the work splits over three processes: the
//! main (build) process forks a monitor, which forks the updater. The
//! monitor buffers status messages so the updater can run from start to
//! finish without waiting on the busy builder.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use signal_hook::consts::signal::SIGHUP;
use tracing::{debug, error, info, warn};

use crate::buildsystem;
use crate::context::{remake_symlink, BuildContext};
use crate::error::{BuildError, Result};
use crate::ipc::pipe::PipeChannel;
use crate::ipc::{Ipc, IpcChannel, MsgType, NullChannel, UpdateStatus};
use crate::module::{DirType, Module};
use crate::phase::Phase;
use crate::state::GLOBAL;
use crate::status::prettify_seconds;
use crate::updater;

/// Set by SIGHUP: finish the current module, then stop gracefully.
static DO_STOP: AtomicBool = AtomicBool::new(false);

fn install_graceful_stop_handler() {
    // A failure to register just loses the graceful-stop nicety.
    unsafe {
        let _ = signal_hook::low_level::register(SIGHUP, || {
            DO_STOP.store(true, Ordering::Relaxed);
        });
    }
}

fn stop_requested() -> bool {
    DO_STOP.load(Ordering::Relaxed)
}

/// Checks the SIGHUP flag, forwarding the signal down the process chain
/// the first time it is seen (in case the user signalled only us and not
/// the process group).
fn check_stop_and_forward(forward_to: Option<Pid>, forwarded: &mut bool) -> bool {
    if !stop_requested() {
        return false;
    }
    if !*forwarded {
        if let Some(pid) = forward_to {
            let _ = kill(pid, Signal::SIGHUP);
        }
        *forwarded = true;
    }
    true
}

fn uses_concurrent_phases(modules: &[Module]) -> bool {
    // Concurrency pays off when there is an update phase and any other
    // phase to overlap it with.
    let mut has_update = false;
    let mut has_other = false;
    for module in modules {
        for phase in module.phases().phases() {
            match phase {
                Phase::Update => has_update = true,
                _ => has_other = true,
            }
        }
        if has_update && has_other {
            return true;
        }
    }
    false
}

/// Runs every module's update/build/install phases, concurrently when
/// possible. Returns a shell-style result code.
pub fn run_all_tasks(ctx: &mut BuildContext, modules: &mut Vec<Module>) -> Result<i32> {
    if uses_concurrent_phases(modules) && ctx.get_option_bool("async") && !ctx.pretend {
        return handle_async_build(ctx, modules);
    }

    debug!("Using no IPC mechanism");
    install_graceful_stop_handler();
    let mut ipc = Ipc::new(Box::<NullChannel>::default());

    info!("<<<  Update Process  >>>");
    let update_errors = handle_updates(&mut ipc, ctx, modules)?;

    info!("<<<  Build Process  >>>");
    let build_errors = handle_build(&mut ipc, ctx, modules)?;

    // Apply any trailing persistent-option messages the update loop queued
    // after the last built module.
    ipc.wait_for_end(&mut ctx.state)?;
    ipc.close();

    Ok(i32::from(update_errors || build_errors))
}

/// The updater side: walks every module with an update phase, reporting
/// per-module status over IPC. Every module in the update phase is
/// accounted for before this returns.
fn handle_updates(ipc: &mut Ipc, ctx: &mut BuildContext, modules: &mut [Module]) -> Result<bool> {
    let update_list: Vec<usize> = modules
        .iter()
        .enumerate()
        .filter(|(_, module)| module.phases().has(Phase::Update))
        .map(|(index, _)| index)
        .collect();

    if update_list.is_empty() {
        ipc.send(MsgType::AllUpdating, "update-list-empty")?;
        ipc.send(MsgType::AllDone, "update-list-empty")?;
        return Ok(false);
    }

    if !check_for_ssh_agent(ctx, modules)? {
        ipc.send(MsgType::AllFailure, "ssh-failure")?;
        return Ok(true);
    }

    let kdesrc = ctx.source_dir()?;
    if !kdesrc.exists() && !ctx.pretend {
        debug!("KDE source download directory doesn't exist, creating.");
        if let Err(err) = fs::create_dir_all(&kdesrc) {
            error!("Unable to make directory {}: {err}", kdesrc.display());
            ipc.send(MsgType::AllFailure, "no-source-dir")?;
            return Ok(true);
        }
    }

    // From here on out any errors are limited to a single module, so the
    // build side may start.
    ipc.send(MsgType::AllUpdating, "starting-updates")?;

    let mut had_error = false;
    for index in update_list {
        if stop_requested() {
            warn!(" * * * Early exit requested, aborting updates.");
            break;
        }
        let name = modules[index].name().to_string();
        ipc.set_logged_module(&name);

        let ok = updater::update_module(&mut modules[index], ctx, ipc);
        had_error = !ok || had_error;

        // Cache the source dir for --run and query use; the main process
        // owns the state file, so route it over IPC.
        if let Ok(path) = modules[index].fullpath(ctx, DirType::Source) {
            ipc.notify_persistent_option_change(
                &name,
                "source-dir",
                &path.to_string_lossy(),
            )?;
        }
    }

    ipc.send(MsgType::AllDone, &format!("had_errors: {had_error}"))?;
    Ok(had_error)
}

/// Builds one module, after waiting for its update status. Returns the
/// failed phase, or None on success.
fn build_single_module(
    ipc: &mut Ipc,
    ctx: &mut BuildContext,
    module: &mut Module,
) -> Result<Option<Phase>> {
    ctx.reset_environment();
    module.setup_environment(ctx);

    // Cache module directories, e.g. to be consumed by --run.
    let source_dir = module.fullpath(ctx, DirType::Source)?;
    let build_dir = module.fullpath(ctx, DirType::Build)?;
    let install_dir = module.installation_path(ctx);
    module.set_persistent_option(ctx, "source-dir", source_dir.to_string_lossy().into_owned());
    module.set_persistent_option(ctx, "build-dir", build_dir.to_string_lossy().into_owned());
    module.set_persistent_option(ctx, "install-dir", install_dir);

    let fail_count = ctx
        .state
        .get_u64(module.name(), "failure-count")
        .unwrap_or(0);

    let (status, message) = ipc.wait_for_module(module, &mut ctx.state)?;
    ipc.forget_module(module.name());

    match status {
        UpdateStatus::Failed => {
            error!("\tUnable to update {}, build canceled.", module.name());
            module.set_persistent_option(ctx, "failure-count", fail_count + 1);
            return Ok(Some(Phase::Update));
        }
        UpdateStatus::Success => {
            info!("\tSource update complete for {}: {message}", module.name());
            let why_refresh = ipc.refresh_reason_for(module.name());
            if !why_refresh.is_empty() {
                info!("\t  Rebuilding because {why_refresh}");
            }
        }
        UpdateStatus::Skipped => {
            // Skip the build if the user wants unchanged modules skipped,
            // unless the previous attempt failed.
            if !module.get_option_bool(ctx, "build-when-unchanged") && fail_count == 0 {
                info!("\tSkipping {} because its source code has not changed.", module.name());
                return Ok(None);
            }
            info!("\tNo changes to {} source code, but proceeding to build anyway.", module.name());
        }
    }

    // If the build gets interrupted, make sure the persisted state
    // reflects a failure; reset to zero on success below.
    module.set_persistent_option(ctx, "failure-count", fail_count + 1);

    if buildsystem::build_module(module, ctx)? {
        module.set_persistent_option(ctx, "failure-count", 0);
        Ok(None)
    } else {
        Ok(Some(Phase::Build))
    }
}

/// The build side: waits for the stream start, then walks the ordered
/// module list building each one as its update completes.
fn handle_build(ipc: &mut Ipc, ctx: &mut BuildContext, modules: &mut [Module]) -> Result<bool> {
    let build_list: Vec<usize> = modules
        .iter()
        .enumerate()
        .filter(|(_, module)| module.phases().has(Phase::Build))
        .map(|(index, _)| index)
        .collect();

    if build_list.is_empty() {
        return Ok(false);
    }

    ipc.wait_for_stream_start(&mut ctx.state)?;
    ctx.state.unset(GLOBAL, "resume-list");

    // The build-status file feeds --resume on the next run.
    let status_file_path: Option<PathBuf> = if ctx.pretend {
        None
    } else {
        let base = ctx.subdir_path("log-dir")?;
        let dir = ctx.log_dir_for(&base, None);
        fs::create_dir_all(&dir)?;
        Some(dir.join("build-status"))
    };
    let mut status_file = match &status_file_path {
        Some(path) => match fs::File::create(path) {
            Ok(file) => Some(file),
            Err(err) => {
                error!(
                    " * Unable to open output status file {}: {err}\n \
                     * You won't be able to use the --resume switch next run.",
                    path.display()
                );
                None
            }
        },
        None => None,
    };

    let mut build_done: Vec<String> = Vec::new();
    let mut had_error = false;
    let num_modules = build_list.len();

    for (position, index) in build_list.iter().enumerate() {
        if stop_requested() {
            warn!(" * * * Early exit requested, aborting build.");
            break;
        }

        let name = modules[*index].name().to_string();
        let from_set = modules[*index]
            .module_set()
            .map(|set| format!(" from {set}"))
            .unwrap_or_default();
        info!("Building {name}{from_set} ({}/{num_modules})", position + 1);

        let started = Instant::now();
        let failed_phase = build_single_module(ipc, ctx, &mut modules[*index])?;
        let elapsed = prettify_seconds(started.elapsed().as_secs());

        match failed_phase {
            Some(phase) => {
                ctx.mark_module_phase_failed(phase, &name);
                if let Some(file) = status_file.as_mut() {
                    let _ = writeln!(file, "{name}: Failed on {phase} after {elapsed}.");
                }

                if !had_error {
                    // First failure this run; mark the resume point.
                    let remaining: Vec<String> = std::iter::once(name.clone())
                        .chain(
                            build_list[position + 1..]
                                .iter()
                                .map(|i| modules[*i].name().to_string()),
                        )
                        .collect();
                    ctx.state.set(GLOBAL, "resume-list", remaining.join(", "));
                }
                had_error = true;

                if modules[*index].get_option_bool(ctx, "stop-on-failure") {
                    warn!("{name} didn't build, stopping here.");
                    return Ok(true);
                }
            }
            None => {
                if let Some(file) = status_file.as_mut() {
                    let _ = writeln!(file, "{name}: Succeeded after {elapsed}.");
                }
                build_done.push(name);
            }
        }
    }

    if let Some(path) = &status_file_path {
        drop(status_file);
        // Keep latest/build-status pointing at this run.
        let base = ctx.subdir_path("log-dir")?;
        let latest = base.join("latest");
        if fs::create_dir_all(&latest).is_ok() {
            let _ = remake_symlink(path, &latest.join("build-status"));
        }
    }

    if !build_done.is_empty() {
        info!("<<<  PACKAGES SUCCESSFULLY BUILT  >>>");
        if !ctx.pretend {
            let kdesrc = ctx.source_dir()?;
            if let Ok(mut file) = fs::File::create(kdesrc.join("successfully-built")) {
                for name in &build_done {
                    let _ = writeln!(file, "{name}");
                }
            }
        }
        if build_done.len() <= 10 {
            for name in &build_done {
                info!("{name}");
            }
        } else {
            info!("Built {} modules", build_done.len());
        }
    }

    Ok(had_error)
}

/// The three-process concurrent pipeline. Only one process of execution
/// returns from this function; the monitor and updater children exit.
fn handle_async_build(ctx: &mut BuildContext, modules: &mut [Module]) -> Result<i32> {
    // Pre-calculate where logs go so the children don't try to compute a
    // fresh timestamped directory independently.
    let module_names: Vec<String> = modules.iter().map(|m| m.name().to_string()).collect();
    for (module, name) in modules.iter().zip(&module_names) {
        if let Ok(base) = module.subdir_path(ctx, "log-dir") {
            let _ = ctx.log_dir_for(&base, Some(name));
        }
    }
    let base = ctx.subdir_path("log-dir")?;
    let _ = ctx.log_dir_for(&base, None);

    let mut main_channel = PipeChannel::new()?;

    match unsafe { fork() }.map_err(|err| BuildError::runtime(format!("fork: {err}")))? {
        ForkResult::Child => {
            // The monitor.
            let mut updater_channel = match PipeChannel::new() {
                Ok(channel) => channel,
                Err(_) => std::process::exit(1),
            };
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    // The updater.
                    install_graceful_stop_handler();
                    updater_channel.set_sender();
                    main_channel.close();
                    let mut ipc = Ipc::new(Box::new(updater_channel));
                    let code = match handle_updates(&mut ipc, ctx, modules) {
                        Ok(had_error) => i32::from(had_error),
                        Err(err) => {
                            let _ = ipc.send(MsgType::AllFailure, &err.to_string());
                            1
                        }
                    };
                    ipc.close();
                    std::process::exit(code);
                }
                Ok(ForkResult::Parent { child: updater_pid }) => {
                    install_graceful_stop_handler();
                    main_channel.set_sender();
                    updater_channel.set_receiver();

                    let code = handle_monitoring(
                        &mut main_channel,
                        &mut updater_channel,
                        updater_pid,
                    );
                    let _ = waitpid(updater_pid, None);
                    std::process::exit(code);
                }
                Err(_) => std::process::exit(1),
            }
        }
        ForkResult::Parent { child: monitor_pid } => {
            // Still the parent; do the build.
            install_graceful_stop_handler();
            main_channel.set_receiver();
            let mut ipc = Ipc::new(Box::new(main_channel));

            let mut forwarded = false;
            let build_result = (|| -> Result<bool> {
                // Forward an early SIGHUP before starting, then rely on
                // the per-module checks inside the loop.
                check_stop_and_forward(Some(monitor_pid), &mut forwarded);
                handle_build(&mut ipc, ctx, modules)
            })();

            let mut result = match build_result {
                Ok(had_error) => i32::from(had_error),
                Err(err) => {
                    error!("{err}");
                    1
                }
            };

            check_stop_and_forward(Some(monitor_pid), &mut forwarded);
            if let Err(err) = ipc.wait_for_end(&mut ctx.state) {
                error!("{err}");
                result = 1;
            }

            // Updated modules not listed because they were not built: can
            // happen when the build side ends early under stop-on-failure.
            let unseen = ipc.unacknowledged_modules();
            if !unseen.is_empty() {
                debug!("Some modules were updated but not built");
            }
            ipc.output_pending_logged_messages();
            ipc.close();

            // The build may have failed while git is still running; make
            // the monitor chain stop too.
            match waitpid(monitor_pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    let _ = kill(monitor_pid, Signal::SIGINT);
                    if let Ok(WaitStatus::Exited(_, code)) = waitpid(monitor_pid, None) {
                        if code != 0 {
                            result = 1;
                        }
                    }
                }
                Ok(WaitStatus::Exited(_, code)) if code != 0 => result = 1,
                _ => {}
            }

            Ok(result)
        }
    }
}

/// The monitor: reads whatever the updater has to say, queues it, and
/// forwards it whenever the builder can accept it. This lets the updater
/// run to completion without blocking on the busy builder.
fn handle_monitoring(
    to_build: &mut PipeChannel,
    from_updater: &mut PipeChannel,
    _updater_pid: Pid,
) -> i32 {
    let Some(recv_fd) = from_updater.reader_fd() else {
        error!("mon: missing pipe from updater");
        return 1;
    };
    let Some(send_fd) = to_build.writer_fd() else {
        error!("mon: missing pipe to build process");
        return 1;
    };

    let mut queue: VecDeque<Vec<u8>> = VecDeque::new();
    let mut updater_open = true;

    while updater_open {
        let mut fds = vec![PollFd::new(recv_fd, PollFlags::POLLIN)];
        // Only watch for writability while there is something to send,
        // otherwise a ready pipe would spin the loop.
        if !queue.is_empty() {
            fds.push(PollFd::new(send_fd, PollFlags::POLLOUT));
        }

        match poll(&mut fds, -1) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                error!("mon: poll failed: {err}");
                return 1;
            }
        }

        let readable = fds[0]
            .revents()
            .map(|ev| ev.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
            .unwrap_or(false);
        if readable {
            match from_updater.receive_record() {
                Ok(Some(record)) => queue.push_back(record),
                Ok(None) => updater_open = false,
                Err(err) => {
                    error!("mon: {err}");
                    updater_open = false;
                }
            }
        }

        let writable = fds
            .get(1)
            .and_then(|fd| fd.revents())
            .map(|ev| ev.contains(PollFlags::POLLOUT))
            .unwrap_or(false);
        if writable {
            while let Some(record) = queue.pop_front() {
                if to_build.send_record(&record).is_err() {
                    error!("mon: Build process stopped too soon!");
                    return 1;
                }
            }
        }
    }

    // Updater is done; finish forwarding the queue.
    for record in queue {
        if to_build.send_record(&record).is_err() {
            error!("mon: Build process stopped too soon!");
            return 1;
        }
    }
    to_build.close();
    0
}

/// When updates will go over SSH, make sure an agent with keys is around;
/// otherwise every module update would prompt for a passphrase.
fn check_for_ssh_agent(ctx: &BuildContext, modules: &[Module]) -> Result<bool> {
    if ctx.pretend || ctx.get_option_bool("disable-agent-check") {
        return Ok(true);
    }

    let uses_ssh = modules.iter().any(|module| {
        if !module.phases().has(Phase::Update) {
            return false;
        }
        let repo = module.get_option_str(ctx, "repository");
        repo.starts_with("git+ssh://")
            || repo.starts_with("ssh://")
            || repo.contains("git@git.kde.org")
    });
    if !uses_ssh {
        return Ok(true);
    }
    debug!("\tChecking for SSH Agent");

    let Ok(agent_pid) = std::env::var("SSH_AGENT_PID") else {
        return Ok(true);
    };

    // The agent is supposed to be running; this probe is linux-specific.
    if std::path::Path::new("/proc").is_dir()
        && !std::path::Path::new(&format!("/proc/{agent_pid}")).exists()
    {
        warn!(
            " * SSH Agent is enabled, but doesn't seem to be running.\n \
             * The agent is needed for modules fetched over SSH.\n \
             * Please check that the agent is running and its environment variables defined"
        );
        return Ok(false);
    }

    // The agent is running, but does it manage any keys?
    let status = std::process::Command::new("ssh-add")
        .arg("-l")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    if matches!(status, Ok(s) if s.success()) {
        return Ok(true);
    }

    info!(
        "SSH Agent does not appear to be managing any keys. Running ssh-add for you; \
         please type your passphrase at the prompt (or Ctrl-C to abort)."
    );
    let mut command = std::process::Command::new("ssh-add");
    let ident_file = ctx.get_option_str("ssh-identity-file");
    if !ident_file.is_empty() {
        command.arg(ident_file);
    }
    let added = command.status();
    if !matches!(added, Ok(s) if s.success()) {
        warn!(
            " * Unable to add SSH identity, aborting.\n \
             * If you don't want kdebuild to check in the future,\n \
             * set the disable-agent-check option to true in your configuration."
        );
        return Ok(false);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionValue;
    use tempfile::tempdir;

    fn test_context(dir: &std::path::Path) -> BuildContext {
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
    fn concurrency_requires_update_and_another_phase() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());

        let both = Module::new(&ctx, "both");
        assert!(uses_concurrent_phases(&[both]));

        let mut update_only = Module::new(&ctx, "update-only");
        update_only.set_option("src-only", "".into()).unwrap();
        assert!(!uses_concurrent_phases(&[update_only]));

        let mut build_only = Module::new(&ctx, "build-only");
        build_only.set_option("no-src", "".into()).unwrap();
        assert!(!uses_concurrent_phases(&[build_only]));
    }

    #[test]
    fn empty_update_list_short_circuits_stream() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        let mut ipc = Ipc::new(Box::<NullChannel>::default());

        let mut modules = vec![];
        let had_error = handle_updates(&mut ipc, &mut ctx, &mut modules).unwrap();
        assert!(!had_error);

        // The builder can start (stream start) and immediately finish.
        ipc.wait_for_stream_start(&mut ctx.state).unwrap();
        ipc.wait_for_end(&mut ctx.state).unwrap();
    }

    #[test]
    fn skipped_update_skips_build_by_default() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        ctx.set_option("build-when-unchanged", false.into()).unwrap();

        let mut ipc = Ipc::new(Box::<NullChannel>::default());
        ipc.send(MsgType::AllUpdating, "starting-updates").unwrap();
        ipc.send(MsgType::ModuleUptodate, "quiet,").unwrap();

        let mut module = Module::new(&ctx, "quiet");
        let failed = build_single_module(&mut ipc, &mut ctx, &mut module).unwrap();
        assert_eq!(failed, None);
        // Nothing was built, so no failure-count bump either.
        assert!(ctx.state.get("quiet", "failure-count").is_none());
    }

    #[test]
    fn failed_update_cancels_build_and_counts() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());

        let mut ipc = Ipc::new(Box::<NullChannel>::default());
        ipc.send(MsgType::AllUpdating, "starting-updates").unwrap();
        ipc.send(MsgType::ModuleFailure, "broken").unwrap();

        let mut module = Module::new(&ctx, "broken");
        let failed = build_single_module(&mut ipc, &mut ctx, &mut module).unwrap();
        assert_eq!(failed, Some(Phase::Update));
        assert_eq!(ctx.state.get_u64("broken", "failure-count").unwrap(), 1);
    }
}
