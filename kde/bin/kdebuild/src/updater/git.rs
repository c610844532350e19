// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The git update state machine: clone vs. update decision, remote
//! selection and reconciliation, branch/tag/detached checkout, and the
//! auto-stash discipline around destructive operations.

use std::fs;
use std::path::Path;
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::ipc::Ipc;
use crate::launch::run_logged;
use crate::module::{DirType, Module};
use crate::updater::kdeproject;

pub const DEFAULT_GIT_REMOTE: &str = "origin";

static REMOTE_HEAD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ref: *refs/remotes/[^/]+/([^/\n]+)").unwrap());
static GIT_USER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([^<]+) +<([^>]+)>$").unwrap());
static REMOTE_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w-]*$").unwrap());

/// How the preferred checkout source should be interpreted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckoutKind {
    /// A fixed ref (commit, revision or tag): detached HEAD checkout.
    Tag,
    /// A remote branch to track and fast-forward.
    Branch,
    /// Nothing selected; use the remote's default HEAD.
    None,
}

/// Goes through the various checkout selection options in priority order.
/// Returns the resulting symbolic ref (or SHA1) and how to treat it.
pub fn determine_preferred_checkout_source(
    module: &Module,
    ctx: &BuildContext,
) -> (String, CheckoutKind) {
    // (option name, kind, module-level only)
    // commit/rev/tag make no sense for git as globals.
    let priority_ordered_sources: &[(&str, CheckoutKind, bool)] = &[
        ("commit", CheckoutKind::Tag, true),
        ("revision", CheckoutKind::Tag, true),
        ("tag", CheckoutKind::Tag, true),
        ("branch", CheckoutKind::Branch, true),
        ("branch-group", CheckoutKind::Branch, true),
        ("branch", CheckoutKind::Branch, false),
        ("branch-group", CheckoutKind::Branch, false),
    ];

    let mut selected: Option<(&str, CheckoutKind, String)> = None;
    for (name, kind, module_level) in priority_ordered_sources {
        // branch-group only applies to project-database modules, so that
        // global/module branch selection still works for the rest.
        if *name == "branch-group" && !module.is_kde_project() {
            continue;
        }
        let value = if *module_level {
            module
                .get_option_module(name)
                .map(|v| v.as_str().into_owned())
                .unwrap_or_default()
        } else {
            module.get_option_str(ctx, name)
        };
        if !value.is_empty() {
            selected = Some((name, *kind, value));
            break;
        }
    }

    // No clear desire from the user, either for the module or globally.
    // Source modules disagree between master/main/other, so don't guess.
    let Some((name, kind, mut source)) = selected else {
        debug!("No branch specified for {}, will use whatever git gives us", module.name());
        return (String::new(), CheckoutKind::None);
    };

    if name == "branch-group" {
        match kdeproject::resolve_branch_group(module, ctx, &source) {
            Some(branch) => source = branch,
            None => {
                debug!("No specific branch set for {} and {source}, using master!", module.name());
                source = "master".to_string();
            }
        }
    }

    if name == "tag" && !source.starts_with("refs/tags/") {
        source = format!("refs/tags/{source}");
    }

    (source, kind)
}

/// Runs a git plumbing command in `dir` and returns its stdout lines on a
/// zero exit, or an empty list otherwise.
fn git_output(dir: &Path, args: &[&str]) -> Vec<String> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(dir);
    processes::capture_lines(&mut cmd).unwrap_or_default()
}

/// Splits the output of `git config --null` correctly: records end with
/// NUL, key and value are newline-separated within a record.
fn slurp_git_config_output(dir: &Path, args: &[&str]) -> Vec<String> {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .current_dir(dir)
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    let Ok(output) = cmd.output() else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }
    String::from_utf8_lossy(&output.stdout)
        .split('\0')
        .filter(|record| !record.is_empty())
        .map(|record| record.to_string())
        .collect()
}

/// The sha1 of the given git commit-ish in the module's checkout.
pub fn commit_id(module: &Module, ctx: &BuildContext, commit: &str) -> Result<String> {
    let gitdir = module.fullpath(ctx, DirType::Source)?.join(".git");
    let gitdir = gitdir.to_string_lossy();
    let mut cmd = Command::new("git");
    // The --git-dir must come before the git subcommand itself.
    cmd.args(["--git-dir", gitdir.as_ref(), "rev-parse", commit]);
    let lines = processes::capture_lines(&mut cmd)
        .map_err(|err| BuildError::runtime(format!("git rev-parse {commit}: {err}")))?;
    Ok(lines.first().cloned().unwrap_or_default())
}

/// The current HEAD revision, or None when there is no usable checkout
/// (fresh trees, pretend mode).
pub fn current_revision(module: &Module, ctx: &BuildContext) -> Result<Option<String>> {
    if ctx.pretend {
        return Ok(None);
    }
    let srcdir = module.fullpath(ctx, DirType::Source)?;
    if !srcdir.join(".git").exists() {
        return Ok(None);
    }
    Ok(commit_id(module, ctx, "HEAD").ok())
}

/// Verifies the preferred ref exists in the remote repository before a
/// clone. `git ls-remote --exit-code` returns 2 when the connection works
/// but the ref is absent.
fn verify_ref_present(module: &Module, ctx: &BuildContext, repo: &str) -> Result<bool> {
    let (reference, kind) = determine_preferred_checkout_source(module, ctx);
    if ctx.pretend {
        return Ok(true);
    }
    let reference = if kind == CheckoutKind::None {
        "HEAD".to_string()
    } else {
        reference
    };

    let mut cmd = Command::new("git");
    cmd.args(["ls-remote", "--exit-code", repo, reference.as_str()]);
    let (status, _) = processes::capture_with_status(&mut cmd)?;
    match status.code() {
        Some(0) => Ok(true),
        Some(2) => Ok(false),
        other => Err(BuildError::runtime(format!(
            "git had error exit {other:?} when verifying {reference} present in repository at {repo}"
        ))),
    }
}

/// Checks that the required source dir is either not present or empty, or
/// that the user allowed us to delete it.
fn verify_safe_to_clone_into_source_dir(
    module: &Module,
    ctx: &BuildContext,
    srcdir: &Path,
) -> Result<()> {
    let occupied = srcdir.exists()
        && fs::read_dir(srcdir).map(|mut d| d.next().is_some()).unwrap_or(false);
    if !occupied {
        return Ok(());
    }

    if module
        .get_option_module("#delete-my-patches")
        .map(|v| v.is_true())
        .unwrap_or(false)
        || module.get_option_bool(ctx, "delete-my-patches")
    {
        warn!("\tRemoving conflicting source directory as allowed by --delete-my-patches");
        warn!("\tRemoving {}", srcdir.display());
        fs::remove_dir_all(srcdir)
            .map_err(|err| BuildError::internal(format!("Unable to delete {}: {err}", srcdir.display())))?;
        return Ok(());
    }

    error!(
        "The source directory for {} already has a file or directory present at {}.\n\
         Please either remove the directory yourself and re-run, or pass the\n\
         --delete-my-patches option. DO NOT FORGET TO VERIFY THERE ARE NO UNCOMMITTED\n\
         CHANGES OR OTHER VALUABLE FILES IN THE DIRECTORY.",
        module.name(),
        srcdir.display()
    );
    Err(BuildError::runtime("Conflicting source-dir present"))
}

/// Performs the initial clone of a module.
fn clone_module(
    module: &Module,
    ctx: &mut BuildContext,
    ipc: &mut Ipc,
    git_repo: &str,
) -> Result<()> {
    let srcdir = module.fullpath(ctx, DirType::Source)?;
    let src_base = module.source_base_dir(ctx)?;

    warn!("Cloning {}", module.name());

    let (commit_ref, kind) = determine_preferred_checkout_source(module, ctx);
    let mut args: Vec<String> = vec!["git".into(), "clone".into(), "--recursive".into()];
    if kind != CheckoutKind::None {
        // git-clone -b doesn't like refs/tags/.
        let branch_arg = commit_ref.trim_start_matches("refs/tags/");
        args.push("-b".into());
        args.push(branch_arg.to_string());
    }
    args.push("--".into());
    args.push(git_repo.to_string());
    args.push(srcdir.to_string_lossy().into_owned());

    let exitcode = run_logged(module, ctx, "git-clone", Some(&src_base), &args)?;
    if exitcode != 0 {
        return Err(BuildError::runtime(format!(
            "Failed to make initial clone of {}",
            module.name()
        )));
    }

    ipc.notify_persistent_option_change(module.name(), "git-cloned-repository", git_repo)?;

    if ctx.pretend {
        return Ok(());
    }

    // Set up the git identity if the user asked for one.
    let git_user = module.get_option_str(ctx, "git-user");
    if !git_user.is_empty() {
        let caps = GIT_USER_RE.captures(&git_user).ok_or_else(|| {
            BuildError::runtime(format!(
                "Invalid username or email for git-user option: {git_user} \
                 (should be in format 'User Name <username@example.net>')"
            ))
        })?;
        debug!("\tAdding git identity {git_user} for new git module {}", module.name());
        let name_ok = Command::new("git")
            .args(["config", "--local", "user.name", caps[1].trim()])
            .current_dir(&srcdir)
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        let email_ok = Command::new("git")
            .args(["config", "--local", "user.email", &caps[2]])
            .current_dir(&srcdir)
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !name_ok || !email_ok {
            warn!("Unable to set user.name and user.email git config for {}!", module.name());
        }
    }
    Ok(())
}

/// Returns remote aliases whose fetch URL plausibly matches the
/// configured repository (the user may have aliased more than one).
fn best_remote_names(module: &Module, ctx: &BuildContext, srcdir: &Path) -> Vec<String> {
    let configured_url = module.get_option_str(ctx, "repository");
    let outputs = slurp_git_config_output(
        srcdir,
        &["config", "--null", "--get-regexp", r"remote\..*\.url", "."],
    );

    let mut results = Vec::new();
    for output in outputs {
        let Some((key, url)) = output.split_once('\n') else {
            continue;
        };
        let remote_name = key
            .trim_start_matches("remote.")
            .trim_end_matches(".url")
            .to_string();

        if !kdeproject::is_plausible_existing_remote(module, &remote_name, url, &configured_url) {
            continue;
        }
        // Avoid "weird" remote names.
        if !REMOTE_NAME_RE.is_match(&remote_name) {
            continue;
        }
        results.push(remote_name);
    }
    results
}

fn has_remote(srcdir: &Path, remote: &str) -> bool {
    git_output(srcdir, &["remote"])
        .iter()
        .any(|line| line == remote)
}

/// Ensures the given remote exists with the configured URL, either adding
/// it or updating its URL. KDE-style remotes also get any preconfigured
/// push URL removed so that git's pushInsteadOf rules govern pushes.
fn setup_remote(
    module: &Module,
    ctx: &mut BuildContext,
    srcdir: &Path,
    remote: &str,
) -> Result<()> {
    let repo = module.get_option_str(ctx, "repository");

    if has_remote(srcdir, remote) {
        debug!("\tUpdating the URL for git remote {remote} of {} ({repo})", module.name());
        let exitcode = run_logged(
            module,
            ctx,
            "git-fix-remote",
            Some(srcdir),
            &["git".into(), "remote".into(), "set-url".into(), remote.into(), repo.clone()],
        )?;
        if exitcode != 0 {
            return Err(BuildError::runtime(format!(
                "Unable to update the URL for git remote {remote} of {} ({repo})",
                module.name()
            )));
        }
    } else {
        debug!("\tAdding new git remote {remote} of {} ({repo})", module.name());
        let exitcode = run_logged(
            module,
            ctx,
            "git-add-remote",
            Some(srcdir),
            &["git".into(), "remote".into(), "add".into(), remote.into(), repo.clone()],
        )?;
        if exitcode != 0 {
            return Err(BuildError::runtime(format!(
                "Unable to add new git remote {remote} of {} ({repo})",
                module.name()
            )));
        }
    }

    if !kdeproject::is_push_url_managed(module) {
        return Ok(());
    }

    // pushInsteadOf does not work nicely with git remote set-url --push;
    // the kde: prefix mapping would be ignored. Remove any preconfigured
    // pushurl instead and let insteadOf rules take over.
    let existing_push_url = git_output(
        srcdir,
        &["config", "--get", &format!("remote.{remote}.pushurl")],
    )
    .first()
    .cloned()
    .unwrap_or_default();
    if existing_push_url.is_empty() {
        return Ok(());
    }

    info!(
        "\tRemoving preconfigured push URL for git remote {remote} of {}: {existing_push_url}",
        module.name()
    );
    let exitcode = run_logged(
        module,
        ctx,
        "git-fix-remote",
        Some(srcdir),
        &[
            "git".into(),
            "config".into(),
            "--unset".into(),
            format!("remote.{remote}.pushurl"),
        ],
    )?;
    if exitcode != 0 {
        return Err(BuildError::runtime(format!(
            "Unable to remove preconfigured push URL for {}!",
            module.name()
        )));
    }
    Ok(())
}

/// Selects the git remote to use for updates (preferring a matching
/// existing remote, `origin` otherwise) and makes sure it is configured.
fn setup_best_remote(
    module: &Module,
    ctx: &mut BuildContext,
    ipc: &mut Ipc,
    srcdir: &Path,
) -> Result<String> {
    let cur_repo = module.get_option_str(ctx, "repository");

    let remote_names = best_remote_names(module, ctx, srcdir);
    let chosen_remote = remote_names
        .first()
        .cloned()
        .unwrap_or_else(|| DEFAULT_GIT_REMOTE.to_string());

    setup_remote(module, ctx, srcdir, &chosen_remote)?;

    // Make a notice if the repository we're using has moved.
    let old_repo = module
        .get_persistent_option(ctx, "git-cloned-repository")
        .unwrap_or_default();
    if !old_repo.is_empty() && cur_repo != old_repo {
        warn!(" * {}'s selected repository has changed", module.name());
        warn!(" * from {old_repo}");
        warn!(" * to   {cur_repo}");
        warn!(" * The git remote named {DEFAULT_GIT_REMOTE} has been updated");
        ipc.notify_persistent_option_change(module.name(), "git-cloned-repository", &cur_repo)?;
    }
    Ok(chosen_remote)
}

/// Determines the best remote branch name to use as a default when the
/// user hasn't selected one, from the remote's symbolic HEAD ref. (`git
/// remote show` could tell us the same thing, far more slowly.)
fn detect_default_remote_head(srcdir: &Path, remote: &str) -> Result<String> {
    let head_file = srcdir.join(format!(".git/refs/remotes/{remote}/HEAD"));
    let data = fs::read_to_string(&head_file).unwrap_or_default();
    REMOTE_HEAD_RE
        .captures(&data)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| BuildError::runtime(format!("Can't find HEAD for remote {remote}")))
}

/// Finds an existing local branch tracking `remote/branch`, or an empty
/// string if there is none.
fn get_remote_branch_name(srcdir: &Path, remote_name: &str, branch_name: &str) -> String {
    let branches = slurp_git_config_output(
        srcdir,
        &["config", "--null", "--get-regexp", r"branch\..*\.remote", remote_name],
    );

    for git_branch in branches {
        // The key/value is newline-separated; we just want the key.
        let key = git_branch.split('\n').next().unwrap_or("");
        let Some(this_branch) = key
            .strip_prefix("branch.")
            .and_then(|rest| rest.strip_suffix(".remote"))
        else {
            continue;
        };

        // We have the local branch name; see if it points at the remote
        // branch we want.
        let merge_config = slurp_git_config_output(
            srcdir,
            &["config", "--null", &format!("branch.{this_branch}.merge")],
        );
        if merge_config.first().map(String::as_str) == Some(&format!("refs/heads/{branch_name}")) {
            return this_branch.to_string();
        }
    }
    String::new()
}

/// Generates a local branch name that doesn't exist yet for a new
/// remote-tracking branch. Only call once a suitable existing branch is
/// known to be missing.
fn make_branchname(module: &Module, srcdir: &Path, remote_name: &str, branch: &str) -> Result<String> {
    let remote_name = if remote_name.is_empty() {
        DEFAULT_GIT_REMOTE
    } else {
        remote_name
    };

    for candidate in [
        branch.to_string(),
        format!("{remote_name}-{branch}"),
        format!("ksdc-{remote_name}-{branch}"),
    ] {
        let refname = format!("refs/heads/{candidate}");
        let status = Command::new("git")
            .args(["show-ref", "--quiet", "--verify", "--", refname.as_str()])
            .current_dir(srcdir)
            .status();
        // Exit 1 means the ref does not exist, i.e. the name is free.
        if matches!(status, Ok(s) if s.code() == Some(1)) {
            return Ok(candidate);
        }
    }
    Err(BuildError::runtime(format!(
        "Unable to find good branch name for {} branch name {branch}",
        module.name()
    )))
}

fn count_stash(module: &Module, srcdir: &Path) -> u32 {
    if srcdir.join(".git/refs/stash").exists() {
        let count = git_output(srcdir, &["rev-list", "--walk-reflogs", "--count", "refs/stash"])
            .first()
            .and_then(|line| line.trim().parse().ok())
            .unwrap_or(0);
        debug!("\tNumber of stashes found for {} is: {count}", module.name());
        count
    } else {
        debug!("\tIt appears there is no stash for {}", module.name());
        0
    }
}

/// What the stash-and-update step should advance the checkout to.
enum UpdateTarget {
    RemoteHead { remote: String, branch: String },
    Detached { commit: String },
}

/// Returns true when a stash is active from a different branch than the
/// one we'd switch to; un-stashing after a branch switch could dump
/// conflicts into the repo, so the module is left alone.
fn warn_if_stashed_from_wrong_branch(
    module: &Module,
    ipc: &mut Ipc,
    srcdir: &Path,
    remote_name: &str,
    branch: &str,
    branch_name: &str,
) -> Result<bool> {
    let existing_branch = git_output(srcdir, &["branch", "--show-current"])
        .first()
        .cloned()
        .unwrap_or_default();

    let was_stashed = module
        .get_option_module("#git-was-stashed")
        .map(|v| v.is_true())
        .unwrap_or(false);

    // An empty current branch means detached HEAD, where we should also
    // clearly not switch branches if there are local changes.
    if was_stashed && (existing_branch.is_empty() || existing_branch != branch_name) {
        let existing_branch = if existing_branch.is_empty() {
            "Detached HEAD".to_string()
        } else {
            existing_branch
        };
        let branch_name = if branch_name.is_empty() {
            format!("New branch to point to {remote_name}/{branch}")
        } else {
            branch_name.to_string()
        };

        info!(
            " * The module {} had local changes from a different branch than expected:\n \
             *   Expected branch: {branch_name}\n \
             *   Actual branch:   {existing_branch}\n \
             * To avoid conflict with your local changes, {} will not be updated, and the\n \
             * branch will remain unchanged, so it may be out of date from upstream.",
            module.name(),
            module.name()
        );
        ipc.notify_post_build_message(
            module.name(),
            &format!(
                " * {} was not updated as it had local changes against an unexpected branch.",
                module.name()
            ),
        )?;
        return Ok(true);
    }
    Ok(false)
}

/// Updates the checkout to the given remote-tracking branch, reusing any
/// local branch with that upstream or creating one. After the checkout,
/// a hard reset advances to the remote head (we start from a clean tree,
/// so this is a fast-forward without the network I/O of a pull).
fn update_to_remote_head(
    module: &mut Module,
    ctx: &mut BuildContext,
    ipc: &mut Ipc,
    srcdir: &Path,
    remote_name: &str,
    branch: &str,
) -> Result<bool> {
    let branch_name = get_remote_branch_name(srcdir, remote_name, branch);

    if warn_if_stashed_from_wrong_branch(module, ipc, srcdir, remote_name, branch, &branch_name)? {
        return Ok(false);
    }

    if branch_name.is_empty() {
        let new_name = make_branchname(module, srcdir, remote_name, branch)?;
        debug!("\tUpdating {} with new remote-tracking branch {new_name}", module.name());
        let exitcode = run_logged(
            module,
            ctx,
            "git-checkout-branch",
            Some(srcdir),
            &[
                "git".into(),
                "checkout".into(),
                "-b".into(),
                new_name,
                format!("{remote_name}/{branch}"),
            ],
        )?;
        if exitcode != 0 {
            return Err(BuildError::runtime(format!(
                "Unable to perform a git checkout of {remote_name}/{branch} to a local branch"
            )));
        }
    } else {
        debug!("\tUpdating {} using existing branch {branch_name}", module.name());
        let exitcode = run_logged(
            module,
            ctx,
            "git-checkout-update",
            Some(srcdir),
            &["git".into(), "checkout".into(), branch_name.clone()],
        )?;
        if exitcode != 0 {
            return Err(BuildError::runtime(format!(
                "Unable to perform a git checkout to existing branch {branch_name}"
            )));
        }

        let exitcode = run_logged(
            module,
            ctx,
            "git-rebase",
            Some(srcdir),
            &[
                "git".into(),
                "reset".into(),
                "--hard".into(),
                format!("{remote_name}/{branch}"),
            ],
        )?;
        if exitcode != 0 {
            return Err(BuildError::runtime(format!(
                "{}: Unable to reset to remote development branch {branch}",
                module.name()
            )));
        }
    }
    Ok(true)
}

/// Checks out the given commit, leaving the checkout in a detached HEAD
/// state even if a local branch happens to point at it.
fn update_to_detached_head(
    module: &mut Module,
    ctx: &mut BuildContext,
    srcdir: &Path,
    commit: &str,
) -> Result<bool> {
    info!("\tDetaching head to {commit}");
    let exitcode = run_logged(
        module,
        ctx,
        "git-checkout-commit",
        Some(srcdir),
        &["git".into(), "checkout".into(), commit.to_string()],
    )?;
    Ok(exitcode == 0)
}

/// Stashes any local changes (including untracked but not ignored files),
/// runs the requested update, then pops the stash. A stash that cannot be
/// pushed or popped is surfaced as a post-build message rather than
/// silently losing work.
fn stash_and_update(
    module: &mut Module,
    ctx: &mut BuildContext,
    ipc: &mut Ipc,
    srcdir: &Path,
    target: UpdateTarget,
) -> Result<bool> {
    let date = chrono::Utc::now().format("%F-%R");
    let stash_name = format!("kde-builder auto-stash at {date}");

    // Log the git status prior to taking over the reins in the repo.
    run_logged(module, ctx, "git-status-before-update", Some(srcdir), &[
        "git".into(),
        "status".into(),
    ])?;

    let old_stash_count = count_stash(module, srcdir);

    // Also stash untracked files, in case upstream started to track them.
    // .gitignore'd files stay, as they may be needed for builds.
    debug!("\tStashing local changes if any...");
    let stash_result = if ctx.pretend {
        0
    } else {
        run_logged(
            module,
            ctx,
            "git-stash-push",
            Some(srcdir),
            &[
                "git".into(),
                "stash".into(),
                "push".into(),
                "-u".into(),
                "--quiet".into(),
                "--message".into(),
                stash_name.clone(),
            ],
        )?
    };

    if stash_result != 0 {
        // Might happen if the repo is already in merge conflict state.
        ipc.notify_post_build_message(
            module.name(),
            &format!(
                "{} may have local changes that we couldn't handle, so the module was left alone.",
                module.name()
            ),
        )?;
        run_logged(module, ctx, "git-status-after-error", Some(srcdir), &[
            "git".into(),
            "status".into(),
        ])?;
        return Err(BuildError::runtime(format!(
            "Unable to stash local changes (if any) for {}, aborting update.",
            module.name()
        )));
    }

    // Check if the stash was truly necessary: compare counts rather than
    // testing for any stash, since the user may have stashes of their own.
    let new_stash_count = count_stash(module, srcdir);
    if new_stash_count != old_stash_count {
        // Mark it so the update steps know not to switch branches over
        // local changes.
        module.set_option("#git-was-stashed", true.into())?;
    }

    let update_ok = match target {
        UpdateTarget::RemoteHead { remote, branch } => {
            update_to_remote_head(module, ctx, ipc, srcdir, &remote, &branch)?
        }
        UpdateTarget::Detached { commit } => {
            update_to_detached_head(module, ctx, srcdir, &commit)?
        }
    };

    if !update_ok {
        run_logged(module, ctx, "git-status-after-error", Some(srcdir), &[
            "git".into(),
            "status".into(),
        ])?;
        return Err(BuildError::runtime(format!(
            "Unable to update source code for {}",
            module.name()
        )));
    }

    if new_stash_count != old_stash_count {
        // Re-apply the stash so developers don't have to do it manually.
        let exitcode = run_logged(module, ctx, "git-stash-pop", Some(srcdir), &[
            "git".into(),
            "stash".into(),
            "pop".into(),
        ])?;
        if exitcode != 0 {
            let message = format!(
                " * Unable to restore local changes for {}! \
                 You should manually inspect the new stash: {stash_name}",
                module.name()
            );
            warn!("\t{message}");
            ipc.notify_post_build_message(module.name(), &message)?;
        } else {
            info!("\t * You had local changes to {}, which have been re-applied.", module.name());
        }
    }

    Ok(true)
}

/// Updates an already existing git checkout: chooses the remote, fetches,
/// and advances to the preferred checkout source. Returns the number of
/// affected commits.
fn update_existing_clone(
    module: &mut Module,
    ctx: &mut BuildContext,
    ipc: &mut Ipc,
) -> Result<usize> {
    let srcdir = module.fullpath(ctx, DirType::Source)?;
    let cur_repo = module.get_option_str(ctx, "repository");

    // Try to save the user if they are in the middle of a merge or rebase.
    if srcdir.join(".git/MERGE_HEAD").exists()
        || srcdir.join(".git/rebase-merge").exists()
        || srcdir.join(".git/rebase-apply").exists()
    {
        return Err(BuildError::Conflict(format!(
            "Aborting git update for {}, you appear to have a rebase or merge in progress!",
            module.name()
        )));
    }

    let remote_name = setup_best_remote(module, ctx, ipc, &srcdir)?;

    // Download updated objects (this also updates remote heads, so it must
    // happen before comparing branches).
    info!("Fetching remote changes to {}", module.name());
    let exitcode = run_logged(
        module,
        ctx,
        "git-fetch",
        Some(&srcdir),
        &["git".into(), "fetch".into(), "--tags".into(), remote_name.clone()],
    )?;
    if exitcode != 0 {
        return Err(BuildError::runtime(format!(
            "Unable to perform git fetch for {remote_name} ({cur_repo})"
        )));
    }

    // Now figure out if we should update a branch, or checkout a specific
    // tag/SHA1.
    let (mut commit_ref, mut kind) = determine_preferred_checkout_source(module, ctx);
    if kind == CheckoutKind::None {
        kind = CheckoutKind::Branch;
        commit_ref = detect_default_remote_head(&srcdir, &remote_name)?;
    }

    warn!(
        "Merging {} changes from {} {commit_ref}",
        module.name(),
        if kind == CheckoutKind::Branch { "branch" } else { "tag" },
    );
    let start_commit = commit_id(module, ctx, "HEAD").unwrap_or_default();

    let target = if kind == CheckoutKind::Branch {
        UpdateTarget::RemoteHead {
            remote: remote_name,
            branch: commit_ref,
        }
    } else {
        UpdateTarget::Detached { commit: commit_ref }
    };
    stash_and_update(module, ctx, ipc, &srcdir, target)?;

    if ctx.pretend || start_commit.is_empty() {
        return Ok(0);
    }
    let count = git_output(&srcdir, &["rev-list", &format!("{start_commit}..HEAD")]).len();
    Ok(count)
}

/// Either performs the initial checkout or updates the existing one, as
/// appropriate. Returns the number of affected commits (for a fresh clone,
/// the checked-out file count).
pub fn update_checkout(module: &mut Module, ctx: &mut BuildContext, ipc: &mut Ipc) -> Result<usize> {
    let srcdir = module.fullpath(ctx, DirType::Source)?;

    // .git is usually a directory, but a worktree checkout makes it a file.
    if srcdir.join(".git").exists() {
        return update_existing_clone(module, ctx, ipc);
    }

    verify_safe_to_clone_into_source_dir(module, ctx, &srcdir)?;

    let git_repo = module.get_option_str(ctx, "repository");
    if git_repo.is_empty() {
        return Err(BuildError::internal(format!(
            "Unable to checkout {}, you must specify a repository to use.",
            module.name()
        )));
    }

    if !verify_ref_present(module, ctx, &git_repo)? {
        return Err(if kdeproject::module_is_needed(module) {
            BuildError::runtime(format!(
                "{} build was requested, but it has no source code at the requested git branch",
                module.name()
            ))
        } else {
            BuildError::runtime("The required git branch does not exist at the source repository")
        });
    }

    clone_module(module, ctx, ipc, &git_repo)?;

    if ctx.pretend {
        return Ok(1);
    }
    let count = git_output(&srcdir, &["ls-files"]).len();
    Ok(count)
}

/// Checks whether the user's global git config carries the `kde:` URL
/// aliases, adding or correcting them as needed. Purely advisory; a
/// failure here never fails the run.
pub fn verify_git_config(ctx: &BuildContext) -> Result<bool> {
    let protocol = {
        let p = ctx.get_option_str("git-push-protocol");
        if p.is_empty() {
            "git".to_string()
        } else {
            p
        }
    };

    let (push_url_prefix, other_push_url_prefix) = match protocol.as_str() {
        "git" => ("ssh://git@invent.kde.org/", "https://invent.kde.org/"),
        "https" => ("https://invent.kde.org/", "ssh://git@invent.kde.org/"),
        other => {
            error!(" * Invalid git-push-protocol {other}");
            error!(" * Try setting this option to 'git' if you're not using a proxy");
            return Err(BuildError::runtime(format!(
                "Invalid git-push-protocol: {other}"
            )));
        }
    };

    let get_global = |key: &str, value: &str| -> Option<bool> {
        let output = Command::new("git")
            .args(["config", "--global", "--includes", "--get", key, value])
            .output()
            .ok()?;
        match output.status.code() {
            // 0: present; 1: no such section, which is fine.
            Some(0) => Some(!String::from_utf8_lossy(&output.stdout).trim().is_empty()),
            Some(1) => Some(false),
            _ => None,
        }
    };
    let run_global = |args: &[&str]| -> bool {
        Command::new("git")
            .args(["config", "--global"])
            .args(args)
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    };

    let Some(has_fetch_alias) = get_global("url.https://invent.kde.org/.insteadOf", "kde:") else {
        error!(" * Unable to run git config; is there a setup error?");
        return Ok(false);
    };
    if !has_fetch_alias {
        debug!("\tAdding git download kde: alias (fetch: https://invent.kde.org/)");
        if !run_global(&["--add", "url.https://invent.kde.org/.insteadOf", "kde:"]) {
            return Ok(false);
        }
    }

    let push_key = format!("url.{push_url_prefix}.pushInsteadOf");
    if get_global(&push_key, "kde:") != Some(true) {
        debug!("\tAdding git upload kde: alias (push: {push_url_prefix})");
        if !run_global(&["--add", &push_key, "kde:"]) {
            return Ok(false);
        }
    }

    // Remove obsolete aliases installed by older versions, and the push
    // alias for the protocol the user switched away from.
    let obsolete = [
        "url.git://anongit.kde.org/.insteadOf".to_string(),
        "url.https://anongit.kde.org/.insteadOf".to_string(),
        "url.git@git.kde.org:.pushInsteadOf".to_string(),
        format!("url.{other_push_url_prefix}.pushInsteadOf"),
    ];
    for key in obsolete {
        if get_global(&key, "kde:") == Some(true) {
            debug!("\tRemoving outdated kde: alias {key}");
            if !run_global(&["--unset-all", &key, "kde:"]) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx() -> BuildContext {
        BuildContext::new()
    }

    #[test]
    fn commit_beats_branch_everywhere() {
        let mut context = ctx();
        context.set_option("branch", "master".into()).unwrap();
        let mut module = Module::new(&context, "m");
        module.set_option("commit", "abcdef0".into()).unwrap();
        module.set_option("branch", "main".into()).unwrap();

        let (reference, kind) = determine_preferred_checkout_source(&module, &context);
        assert_eq!(reference, "abcdef0");
        assert_eq!(kind, CheckoutKind::Tag);
    }

    #[test]
    fn tag_is_normalized_to_full_ref() {
        let context = ctx();
        let mut module = Module::new(&context, "m");
        module.set_option("tag", "v1.2.3".into()).unwrap();

        let (reference, kind) = determine_preferred_checkout_source(&module, &context);
        assert_eq!(reference, "refs/tags/v1.2.3");
        assert_eq!(kind, CheckoutKind::Tag);

        let mut module2 = Module::new(&context, "m2");
        module2.set_option("tag", "refs/tags/v2".into()).unwrap();
        let (reference, _) = determine_preferred_checkout_source(&module2, &context);
        assert_eq!(reference, "refs/tags/v2");
    }

    #[test]
    fn module_branch_beats_global_branch() {
        let mut context = ctx();
        context.set_option("branch", "master".into()).unwrap();
        let mut module = Module::new(&context, "m");
        module.set_option("branch", "work/feature".into()).unwrap();

        let (reference, kind) = determine_preferred_checkout_source(&module, &context);
        assert_eq!(reference, "work/feature");
        assert_eq!(kind, CheckoutKind::Branch);
    }

    #[test]
    fn global_branch_applies_when_module_is_silent() {
        let mut context = ctx();
        context.set_option("branch", "kf6".into()).unwrap();
        let module = Module::new(&context, "m");

        let (reference, kind) = determine_preferred_checkout_source(&module, &context);
        assert_eq!(reference, "kf6");
        assert_eq!(kind, CheckoutKind::Branch);
    }

    #[test]
    fn nothing_selected_means_none() {
        let context = ctx();
        let module = Module::new(&context, "m");
        let (reference, kind) = determine_preferred_checkout_source(&module, &context);
        assert_eq!(reference, "");
        assert_eq!(kind, CheckoutKind::None);
    }

    #[test]
    fn branch_group_ignored_for_non_kde_modules() {
        let mut context = ctx();
        context.set_option("branch-group", "kf6-qt6".into()).unwrap();
        let module = Module::new(&context, "m");
        // Not a KDE-project module, so the branch-group is skipped and
        // nothing remains selected.
        let (_, kind) = determine_preferred_checkout_source(&module, &context);
        assert_eq!(kind, CheckoutKind::None);
    }

    #[test]
    fn branch_group_resolves_for_kde_modules() {
        use crate::metadata::branchgroup::BranchGroupResolver;
        use crate::module::ScmKind;

        let mut context = ctx();
        context.set_option("branch-group", "stable".into()).unwrap();
        context.set_branch_group_resolver(
            BranchGroupResolver::from_json(r#"{"groups": {"kdelibs/*": {"stable": "kf5"}}}"#)
                .unwrap(),
        );

        let mut module = Module::new(&context, "kjs");
        module.set_scm_kind(ScmKind::KdeProject);
        module
            .set_option("#kde-project-path", "kdelibs/kjs".into())
            .unwrap();
        let (reference, kind) = determine_preferred_checkout_source(&module, &context);
        assert_eq!(reference, "kf5");
        assert_eq!(kind, CheckoutKind::Branch);

        // No matching group: fall back to master.
        let mut other = Module::new(&context, "foo");
        other.set_scm_kind(ScmKind::KdeProject);
        other
            .set_option("#kde-project-path", "frameworks/foo".into())
            .unwrap();
        let (reference, _) = determine_preferred_checkout_source(&other, &context);
        assert_eq!(reference, "master");
    }

    #[test]
    fn remote_head_parsing() {
        let caps = REMOTE_HEAD_RE
            .captures("ref: refs/remotes/origin/master\n")
            .unwrap();
        assert_eq!(&caps[1], "master");
        assert!(REMOTE_HEAD_RE.captures("garbage").is_none());
    }

    #[test]
    fn git_user_format() {
        let caps = GIT_USER_RE.captures("Konqi Dragon <konqi@kde.org>").unwrap();
        assert_eq!(caps[1].trim(), "Konqi Dragon");
        assert_eq!(&caps[2], "konqi@kde.org");
        assert!(GIT_USER_RE.captures("no-email-here").is_none());
    }
}
