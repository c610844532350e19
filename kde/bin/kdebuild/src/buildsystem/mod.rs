// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Build-system detection and the shared build/install/uninstall driver.
//!
//! Each concrete adapter implements the [`BuildSystem`] trait; the driver
//! functions here hold the flow that is common to all of them (refresh
//! detection, clean-and-recreate, progress parsing, `-j` handling).

mod autotools;
mod cmakebootstrap;
mod kdecmake;
mod meson;
mod qmake;
mod qt;

pub use autotools::Autotools;
pub use cmakebootstrap::CMakeBootstrap;
pub use kdecmake::KdeCMake;
pub use meson::Meson;
pub use qmake::QMake;
pub use qt::Qt;

use std::fs;
use std::path::Path;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::launch::{locate_exe, prune_under_directory, run_logged_with_callback};
use crate::module::{DirType, Module, ScmKind};
use crate::status::{prettify_seconds, StatusView};
use crate::updater::git;

static PERCENT_PROGRESS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[\s*([0-9]+)%\]").unwrap());
static NINJA_PROGRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[([0-9]+)/([0-9]+)\] ").unwrap());

/// Options intended for unique/bespoke build systems, stripped from the
/// global scope before being applied to a module using a different one.
const GLOBAL_BUILD_SYSTEM_OPTIONS: &[&str] = &[
    "cmake-options",
    "cmake-generator",
    "configure-flags",
    "custom-build-command",
    "cxxflags",
    "make-options",
    "run-tests",
    "use-clean-install",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildSystemKind {
    Generic,
    KdeCMake,
    CMakeBootstrap,
    QMake,
    Autotools,
    Meson,
    Qt,
}

impl BuildSystemKind {
    pub fn name(self) -> &'static str {
        match self {
            BuildSystemKind::Generic => "generic",
            BuildSystemKind::KdeCMake => "KDE CMake",
            BuildSystemKind::CMakeBootstrap => "cmake-bootstrap",
            BuildSystemKind::QMake => "qmake",
            BuildSystemKind::Autotools => "autotools",
            BuildSystemKind::Meson => "meson",
            BuildSystemKind::Qt => "Qt5",
        }
    }

    pub fn from_name(name: &str) -> Result<BuildSystemKind> {
        Ok(match name.to_lowercase().as_str() {
            "generic" => BuildSystemKind::Generic,
            "kde" | "cmake" => BuildSystemKind::KdeCMake,
            "cmake-bootstrap" => BuildSystemKind::CMakeBootstrap,
            "qmake" | "qmake6" => BuildSystemKind::QMake,
            "autotools" => BuildSystemKind::Autotools,
            "meson" => BuildSystemKind::Meson,
            "qt" | "qt4" | "qt5" | "qt6" => BuildSystemKind::Qt,
            other => {
                return Err(BuildError::runtime(format!(
                    "Invalid build system {other} requested"
                )))
            }
        })
    }
}

/// Determines the build-system kind for a module, either from the
/// `override-build-system` option or by inspecting the source directory.
pub fn detect_kind(module: &Module, ctx: &BuildContext) -> BuildSystemKind {
    if module.scm_kind() == ScmKind::Qt {
        return BuildSystemKind::Qt;
    }
    let override_name = module.get_option_str(ctx, "override-build-system");
    if !override_name.is_empty() {
        if let Ok(kind) = BuildSystemKind::from_name(&override_name) {
            return kind;
        }
        warn!("Ignoring invalid override-build-system {override_name} for {}", module.name());
    }

    let source_dir = match module.fullpath(ctx, DirType::Source) {
        Ok(dir) => dir,
        Err(_) => return BuildSystemKind::Generic,
    };

    // This test must come before the KDE build system's, as cmake's own
    // bootstrap system also has a CMakeLists.txt.
    if source_dir.join("CMakeLists.txt").exists() && source_dir.join("bootstrap").exists() {
        return BuildSystemKind::CMakeBootstrap;
    }
    if source_dir.join("CMakeLists.txt").exists() || module.is_kde_project() {
        return BuildSystemKind::KdeCMake;
    }
    if has_file_with_extension(&source_dir, "pro") {
        return BuildSystemKind::QMake;
    }
    // 'configure' is a popular fall-back even for other build systems, so
    // check it before meson but after the specific ones above.
    if source_dir.join("configure").exists() || source_dir.join("autogen.sh").exists() {
        return BuildSystemKind::Autotools;
    }
    if source_dir.join("meson.build").exists() {
        return BuildSystemKind::Meson;
    }
    BuildSystemKind::Generic
}

fn has_file_with_extension(dir: &Path, ext: &str) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries
        .flatten()
        .any(|entry| entry.path().extension().map(|e| e == ext).unwrap_or(false))
}

pub fn for_kind(kind: BuildSystemKind) -> Box<dyn BuildSystem> {
    match kind {
        BuildSystemKind::Generic => Box::new(Generic),
        BuildSystemKind::KdeCMake => Box::new(KdeCMake),
        BuildSystemKind::CMakeBootstrap => Box::new(CMakeBootstrap),
        BuildSystemKind::QMake => Box::new(QMake),
        BuildSystemKind::Autotools => Box::new(Autotools),
        BuildSystemKind::Meson => Box::new(Meson),
        BuildSystemKind::Qt => Box::new(Qt),
    }
}

pub fn for_module(module: &Module, ctx: &BuildContext) -> Box<dyn BuildSystem> {
    for_kind(detect_kind(module, ctx))
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BuildResults {
    pub was_successful: bool,
    pub warnings: u64,
    pub work_done: bool,
}

pub trait BuildSystem {
    fn name(&self) -> &'static str;

    /// File that exists (relative to the build directory) once the module
    /// has been configured.
    fn configured_module_file_name(&self, _module: &Module, _ctx: &BuildContext) -> &'static str {
        "Makefile"
    }

    /// Executables that must be present to bother attempting this build
    /// system.
    fn required_programs(&self, _module: &Module, _ctx: &BuildContext) -> Vec<&'static str> {
        vec![]
    }

    /// Possible build commands, any of which is acceptable; the first one
    /// found on PATH wins.
    fn build_commands(&self, _module: &Module, _ctx: &BuildContext) -> Vec<&'static str> {
        // Non-Linux systems can sometimes fail to build when GNU Make would
        // work, so prefer GNU Make if present.
        vec!["gmake", "make"]
    }

    /// Option key whose value supplies extra build-command arguments.
    fn build_options_key(&self, _module: &Module, _ctx: &BuildContext) -> &'static str {
        "make-options"
    }

    fn install_target(&self, _module: &Module, _ctx: &BuildContext) -> String {
        "install".to_string()
    }

    /// Whether the build tool sets its own parallelism without an explicit
    /// `-j` (ninja does).
    fn supports_auto_parallelism(&self, _module: &Module, _ctx: &BuildContext) -> bool {
        false
    }

    /// Whether the build directory must mirror the source tree (symlinked
    /// copy); used by Qt-family modules.
    fn needs_builddir_hack(&self, _module: &Module, _ctx: &BuildContext) -> bool {
        false
    }

    /// When a custom toolchain is configured the environment is left
    /// entirely to the toolchain definitions.
    fn has_toolchain(&self, _module: &Module, _ctx: &BuildContext) -> bool {
        false
    }

    fn needs_installed(&self, _module: &Module, _ctx: &BuildContext) -> bool {
        true
    }

    /// Runs the configure step. Returns false on (logged) failure.
    fn configure(&self, module: &Module, ctx: &mut BuildContext) -> Result<bool>;

    /// Environment preparation before configure/build/install runs.
    fn prepare_module_build_environment(
        &self,
        _module: &Module,
        _ctx: &mut BuildContext,
        _prefix: &str,
    ) {
    }

    fn run_testsuite(&self, module: &Module, ctx: &mut BuildContext) -> Result<bool> {
        let _ = ctx;
        info!("\t{} does not support the run-tests option", module.name());
        Ok(false)
    }
}

/// The no-op adapter, valid only when `custom-build-command` is set.
pub struct Generic;

impl BuildSystem for Generic {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn configure(&self, _module: &Module, ctx: &mut BuildContext) -> Result<bool> {
        if ctx.pretend {
            return Ok(true);
        }
        Err(BuildError::internal(
            "Build system determination still pending when configure attempted.",
        ))
    }
}

/// Returns a non-empty reason when the build system must be recreated from
/// scratch.
pub fn needs_refreshed(
    build_system: &dyn BuildSystem,
    module: &Module,
    ctx: &BuildContext,
) -> Result<String> {
    let builddir = module.fullpath(ctx, DirType::Build)?;
    let conf_file = build_system.configured_module_file_name(module, ctx);

    if !builddir.exists() {
        return Ok("the build directory doesn't exist".to_string());
    }
    if builddir.join(".refresh-me").exists() {
        return Ok("the last configure failed".to_string());
    }
    if module.get_option_bool(ctx, "refresh-build") {
        return Ok("the option refresh-build was set".to_string());
    }
    if !builddir.join(conf_file).exists() {
        return Ok(format!("{}/{conf_file} is missing", builddir.display()));
    }
    Ok(String::new())
}

/// Recursively empties the build directory (unless it is the source
/// directory) and clears the last-build-rev marker.
pub fn clean_build_system(
    module: &Module,
    ctx: &mut BuildContext,
) -> Result<bool> {
    let srcdir = module.fullpath(ctx, DirType::Source)?;
    let builddir = module.fullpath(ctx, DirType::Build)?;

    if ctx.pretend {
        info!("\tWould have cleaned build system for {}", module.name());
        return Ok(true);
    }

    if builddir.exists() && builddir != srcdir {
        info!("\tRemoving files in build directory for {}", module.name());
        if let Err(err) = prune_under_directory(&builddir) {
            error!("\tFailed to clean build directory: {err}. Verify the permissions are correct.");
            return Ok(false);
        }
        module.unset_persistent_option(ctx, "last-build-rev");
        // keep last-install-rev since that tracks the install dir.
        info!("\tOld build system cleaned, starting new build system.");
    } else if let Err(err) = fs::create_dir_all(&builddir) {
        error!("\tUnable to create directory {}: {err}", builddir.display());
        return Ok(false);
    }
    Ok(true)
}

/// Creates the build directory, symlinking the source tree into it for
/// adapters that must build in-tree.
pub fn create_build_system(
    build_system: &dyn BuildSystem,
    module: &Module,
    ctx: &mut BuildContext,
) -> Result<bool> {
    let srcdir = module.fullpath(ctx, DirType::Source)?;
    let builddir = module.fullpath(ctx, DirType::Build)?;

    if ctx.pretend {
        return Ok(true);
    }

    if !builddir.exists() {
        if let Err(err) = fs::create_dir_all(&builddir) {
            error!("\tUnable to create build directory for {}: {err}", module.name());
            return Ok(false);
        }
    }

    if builddir != srcdir && build_system.needs_builddir_hack(module, ctx) {
        if let Err(err) = symlink_tree(&srcdir, &builddir) {
            error!(
                "\tUnable to set up symlinked build directory for {}: {err}",
                module.name()
            );
            return Ok(false);
        }
    }
    Ok(true)
}

/// Mirrors `srcdir` under `builddir` with symlinks for files and real
/// directories for directories.
fn symlink_tree(srcdir: &Path, builddir: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(srcdir).min_depth(1) {
        let entry = entry.map_err(|err| BuildError::runtime(err.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(srcdir)
            .map_err(|err| BuildError::internal(err.to_string()))?;
        let target = builddir.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if !target.exists() {
            std::os::unix::fs::symlink(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Resolves the `-j` count to inject, if any. `auto` on an adapter with
/// auto-parallelism means no flag; otherwise `auto` maps to the detected
/// CPU count and nonsense values fall back to 4.
fn compute_parallelism(
    build_system: &dyn BuildSystem,
    module: &Module,
    ctx: &BuildContext,
) -> Option<u32> {
    let cores = module.get_option_str(ctx, "num-cores");
    if cores.is_empty() {
        return None;
    }
    if build_system.supports_auto_parallelism(module, ctx) && cores == "auto" {
        return None;
    }
    let count = if cores == "auto" {
        num_cpus::get() as i64
    } else {
        cores.parse::<i64>().unwrap_or(0)
    };
    Some(if count <= 0 { 4 } else { count as u32 })
}

/// Removes a `-j` that is not followed by a count; an empty setting means
/// "no -j", not "-j with default".
fn strip_naked_j(module_name: &str, options: Vec<String>) -> Vec<String> {
    let mut result = Vec::with_capacity(options.len());
    let mut iter = options.into_iter().peekable();
    while let Some(token) = iter.next() {
        if token == "-j" {
            let followed_by_count = iter
                .peek()
                .map(|next| next.parse::<u32>().is_ok())
                .unwrap_or(false);
            if !followed_by_count {
                warn!("Removing empty -j setting during build for {module_name}");
                continue;
            }
        }
        result.push(token);
    }
    result
}

pub struct SafeMakeOptions {
    pub target: Option<String>,
    pub message: String,
    pub make_options: Vec<String>,
    pub prefix_options: Vec<String>,
    pub logbase: String,
}

/// Runs the build command with progress parsing. The command comes from
/// `custom-build-command` if set, otherwise the adapter's candidates.
pub fn safe_make(
    build_system: &dyn BuildSystem,
    module: &Module,
    ctx: &mut BuildContext,
    opts: SafeMakeOptions,
) -> Result<BuildResults> {
    let custom_command = module.get_option_str(ctx, "custom-build-command");
    let mut command_line: Vec<String> = Vec::new();

    let build_command = if !custom_command.is_empty() {
        let mut words = shell_words::split(&custom_command)
            .map_err(|err| BuildError::config(format!("custom-build-command: {err}")))?;
        if words.is_empty() {
            return Err(BuildError::config("custom-build-command is empty"));
        }
        let program = words.remove(0);
        command_line = words;
        locate_exe(&program).ok_or_else(|| {
            BuildError::runtime(format!("Unable to find the {program} executable!"))
        })?
    } else {
        let candidates = build_system.build_commands(module, ctx);
        candidates
            .iter()
            .find_map(|candidate| locate_exe(candidate))
            .ok_or_else(|| {
                BuildError::runtime(format!(
                    "Not found any of these executables: {}",
                    candidates.join(" ")
                ))
            })?
    };

    let mut prefix_options = opts.prefix_options;
    // If using sudo, ensure it reads the password from stdin rather than
    // waiting on a tty (stdin is redirected from /dev/null).
    if prefix_options.first().map(String::as_str) == Some("sudo")
        && !prefix_options.iter().any(|opt| opt == "-S")
    {
        prefix_options.insert(1, "-S".to_string());
    }

    let mut args: Vec<String> = prefix_options;
    args.push(build_command.to_string_lossy().into_owned());
    args.extend(command_line);
    if let Some(target) = &opts.target {
        args.push(target.clone());
    }
    args.extend(opts.make_options);

    let builddir = module.fullpath(ctx, DirType::Build)?;

    run_build_command(module, ctx, &opts.message, &opts.logbase, &builddir, &args)
}

/// Runs the assembled command, watching output lines for progress markers
/// and compiler warnings.
fn run_build_command(
    module: &Module,
    ctx: &mut BuildContext,
    message: &str,
    logname: &str,
    builddir: &Path,
    args: &[String],
) -> Result<BuildResults> {
    let started = Instant::now();
    let mut status_view = StatusView::new();
    status_view.set_status(&format!("\t{message}"));

    let mut warnings: u64 = 0;
    let exitcode = {
        let mut on_line = |line: &str| {
            if let Some(caps) = PERCENT_PROGRESS_RE.captures(line) {
                if let Ok(percent) = caps[1].parse::<u64>() {
                    status_view.set_progress(percent, 100);
                }
            } else if let Some(caps) = NINJA_PROGRESS_RE.captures(line) {
                if let (Ok(x), Ok(y)) = (caps[1].parse::<u64>(), caps[2].parse::<u64>()) {
                    status_view.set_progress(x, y);
                }
            }
            if line.contains("warning: ") {
                warnings += 1;
            }
        };
        run_logged_with_callback(module, ctx, logname, Some(builddir), args, Some(&mut on_line))?
    };

    let elapsed = prettify_seconds(started.elapsed().as_secs());
    let verdict = if exitcode == 0 { "succeeded" } else { "failed" };
    status_view.release_tty(&format!("\t{message} {verdict} (after {elapsed})"));

    if warnings > 0 {
        warn!("\tNote: {warnings} compile warnings for {}", module.name());
        module.set_persistent_option(ctx, "last-compile-warnings", warnings);
    }

    Ok(BuildResults {
        was_successful: exitcode == 0,
        warnings,
        work_done: true,
    })
}

/// The compile step: resolves `-j` handling and the adapter's option key,
/// then delegates to [`safe_make`].
pub fn build_internal(
    build_system: &dyn BuildSystem,
    module: &Module,
    ctx: &mut BuildContext,
) -> Result<BuildResults> {
    let options_key = build_system.build_options_key(module, ctx);
    let option_val = module.get_option_str(ctx, options_key);
    let make_options = shell_words::split(&option_val)
        .map_err(|err| BuildError::config(format!("{options_key}: {err}")))?;
    let mut make_options = strip_naked_j(module.name(), make_options);

    if let Some(cores) = compute_parallelism(build_system, module, ctx) {
        // Prepend so user settings can override.
        make_options.insert(0, cores.to_string());
        make_options.insert(0, "-j".to_string());
    }

    safe_make(
        build_system,
        module,
        ctx,
        SafeMakeOptions {
            target: None,
            message: "Compiling...".to_string(),
            make_options,
            prefix_options: vec![],
            logbase: "build".to_string(),
        },
    )
}

pub fn install_internal(
    build_system: &dyn BuildSystem,
    module: &Module,
    ctx: &mut BuildContext,
    prefix_options: Vec<String>,
) -> Result<bool> {
    let target = build_system.install_target(module, ctx);
    let results = safe_make(
        build_system,
        module,
        ctx,
        SafeMakeOptions {
            target: Some(target),
            message: format!("Installing {}", module.name()),
            make_options: vec![],
            prefix_options,
            logbase: "install".to_string(),
        },
    )?;
    Ok(results.was_successful)
}

pub fn uninstall_internal(
    build_system: &dyn BuildSystem,
    module: &Module,
    ctx: &mut BuildContext,
    prefix_options: Vec<String>,
) -> Result<bool> {
    module.unset_persistent_option(ctx, "last-install-rev");
    let results = safe_make(
        build_system,
        module,
        ctx,
        SafeMakeOptions {
            target: Some("uninstall".to_string()),
            message: format!("Uninstalling {}", module.name()),
            make_options: vec![],
            prefix_options,
            logbase: "uninstall".to_string(),
        },
    )?;
    Ok(results.was_successful)
}

/// Digest of an argument vector, used to skip reconfigure runs whose
/// arguments have not changed.
pub fn get_list_digest(args: &[String]) -> String {
    let mut hasher = Sha256::new();
    for arg in args {
        hasher.update(arg.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Runs a configure-style command, skipping it when the argument digest
/// matches the previous successful run, no `reconfigure` was requested,
/// and the configured-module marker is present.
pub fn configure_with_digest(
    module: &Module,
    ctx: &mut BuildContext,
    logname: &str,
    dir: &Path,
    commands: &[String],
    digest_key: &str,
    conf_file: &str,
) -> Result<bool> {
    let old = module
        .get_persistent_option(ctx, digest_key)
        .unwrap_or_default();
    let digest = get_list_digest(commands);
    let builddir = module.fullpath(ctx, DirType::Build)?;
    if old == digest
        && !module.get_option_bool(ctx, "reconfigure")
        && builddir.join(conf_file).exists()
    {
        return Ok(true);
    }
    module.set_persistent_option(ctx, digest_key, digest);
    Ok(crate::launch::run_logged(module, ctx, logname, Some(dir), commands)? == 0)
}

/// Strips global-scope build-system options from a module using a
/// different build system, so they aren't accidentally picked up.
pub fn mask_global_build_system_options(module: &mut Module, ctx: &BuildContext) {
    if detect_kind(module, ctx) == BuildSystemKind::KdeCMake {
        return;
    }
    for opt in GLOBAL_BUILD_SYSTEM_OPTIONS {
        let global_set = ctx
            .get_option(opt)
            .map(|value| value.is_true())
            .unwrap_or(false);
        if global_set && module.get_option_module(opt).is_none() {
            let _ = module.options.set(opt, "".into());
        }
    }
}

// The per-module drive: setup, build, install, uninstall.

/// Builds the given module: prepares the build system, compiles, and
/// (unless configured otherwise) installs. Returns false on failure.
pub fn build_module(module: &mut Module, ctx: &mut BuildContext) -> Result<bool> {
    mask_global_build_system_options(module, ctx);

    let build_system = for_module(module, ctx);
    if build_system.name() == "generic"
        && !ctx.pretend
        && module.get_option_str(ctx, "custom-build-command").is_empty()
    {
        error!("\t{} does not seem to have a build system to use.", module.name());
        return Ok(false);
    }

    let builddir = module.fullpath(ctx, DirType::Build)?;
    if !ctx.pretend {
        if let Some(parent) = builddir.parent() {
            fs::create_dir_all(parent)?;
        }
    }

    if !setup_build_system(build_system.as_ref(), module, ctx)? {
        return Ok(false);
    }
    if module.get_option_bool(ctx, "build-system-only") {
        return Ok(true);
    }

    let results = build_internal(build_system.as_ref(), module, ctx)?;
    if !results.was_successful {
        return Ok(false);
    }

    if let Some(revision) = git::current_revision(module, ctx)? {
        module.set_persistent_option(ctx, "last-build-rev", revision);
    }

    if module.get_option_bool(ctx, "run-tests") {
        build_system.run_testsuite(module, ctx)?;
    }

    if !results.work_done
        && !module.get_option_bool(ctx, "refresh-build")
        && module.get_persistent_option(ctx, "last-install-rev").is_some()
    {
        info!("\tNo changes from build, skipping install (--refresh-build this module to force install)");
        return Ok(true);
    }
    if !module.get_option_bool(ctx, "install-after-build") {
        info!("\tSkipping install due to install-after-build setting");
        return Ok(true);
    }

    install_module(module, ctx)
}

/// Sets up the build system in the build directory, handling refresh
/// detection, the clean/create cycle and the configure step.
pub fn setup_build_system(
    build_system: &dyn BuildSystem,
    module: &mut Module,
    ctx: &mut BuildContext,
) -> Result<bool> {
    if build_system.name() == "generic" {
        if !module.get_option_str(ctx, "custom-build-command").is_empty() {
            info!(
                " * No build system detected for {}, assuming custom build command will handle",
                module.name()
            );
            return Ok(true);
        }
        if !ctx.pretend {
            return Err(BuildError::internal(
                "Build system determination still pending when build attempted.",
            ));
        }
    }

    // A previous build may live in a different directory after renames or
    // layout-option changes; move it rather than rebuilding from scratch.
    let builddir = module.fullpath(ctx, DirType::Build)?;
    let old_build_dir = module
        .get_option_module("#last-build-dir")
        .map(|v| v.as_str().into_owned())
        .unwrap_or_default();
    if !ctx.pretend
        && !old_build_dir.is_empty()
        && builddir != Path::new(&old_build_dir)
        && Path::new(&old_build_dir).is_dir()
        && !builddir.exists()
    {
        info!(" * Build directory setting has changed to {}.", builddir.display());
        info!(" * Moving old build directory at {old_build_dir} to the new location.");
        if let Err(err) = fs::rename(&old_build_dir, &builddir) {
            warn!(" * Unable to move {old_build_dir}: {err}; will generate a new build dir.");
        }
    }

    let refresh_reason = needs_refreshed(build_system, module, ctx)?;
    if !refresh_reason.is_empty() {
        info!("\tPreparing build system for {}.", module.name());
        let cancel_clean = module
            .get_option_module("#cancel-clean")
            .map(|v| v.is_true())
            .unwrap_or(false);
        if !cancel_clean && !clean_build_system(module, ctx)? {
            warn!("\tUnable to clean {}!", module.name());
            return Ok(false);
        }
    }

    if !create_build_system(build_system, module, ctx)? {
        error!("\tError creating {}'s build system!", module.name());
        return Ok(false);
    }

    if !build_system.configure(module, ctx)? {
        error!(
            "\tUnable to configure {} with {}",
            module.name(),
            build_system.name()
        );
        // Flag for a refresh-build of this module on the next run.
        if !ctx.pretend {
            let _ = fs::write(
                builddir.join(".refresh-me"),
                "# Build directory will be re-generated next kdebuild run\n\
                 # due to failing to complete configuration on the last run\n",
            );
        }
        return Ok(false);
    }
    Ok(true)
}

/// Installs an already-built module.
pub fn install_module(module: &mut Module, ctx: &mut BuildContext) -> Result<bool> {
    let build_system = for_module(module, ctx);
    let builddir = module.fullpath(ctx, DirType::Build)?;
    let conf_file = build_system.configured_module_file_name(module, ctx);

    if !ctx.pretend && !builddir.join(conf_file).exists() {
        warn!("\tThe build system doesn't exist for {}; can't install it.", module.name());
        return Ok(false);
    }

    module.setup_environment(ctx);

    let prefix_raw = module.get_option_str(ctx, "make-install-prefix");
    let make_install_opts = shell_words::split(&prefix_raw)
        .map_err(|err| BuildError::config(format!("make-install-prefix: {err}")))?;

    // Optionally uninstall prior to installing, to weed out old files.
    if module.get_option_bool(ctx, "use-clean-install")
        && module.get_persistent_option(ctx, "last-install-rev").is_some()
    {
        if !uninstall_internal(build_system.as_ref(), module, ctx, make_install_opts.clone())? {
            warn!("\tUnable to uninstall {} before installing the new build.", module.name());
            warn!("\tContinuing anyways...");
        } else {
            module.unset_persistent_option(ctx, "last-install-rev");
        }
    }

    if !install_internal(build_system.as_ref(), module, ctx, make_install_opts)? {
        error!("\tUnable to install {}!", module.name());
        ctx.mark_module_phase_failed(crate::phase::Phase::Install, module.name());
        return Ok(false);
    }

    if ctx.pretend {
        info!("\tWould have installed {}", module.name());
        return Ok(true);
    }

    if let Some(revision) = git::current_revision(module, ctx)? {
        module.set_persistent_option(ctx, "last-install-rev", revision);
    }

    let remove_setting = module.get_option_str(ctx, "remove-after-install");
    if remove_setting == "all" {
        let srcdir = module.fullpath(ctx, DirType::Source)?;
        info!("\tRemoving {} source.", module.name());
        let _ = fs::remove_dir_all(srcdir);
    }
    if remove_setting == "builddir" || remove_setting == "all" {
        info!("\tRemoving {} build directory.", module.name());
        let _ = fs::remove_dir_all(&builddir);
    }
    Ok(true)
}

/// Uninstalls the module via the adapter's uninstall target.
pub fn uninstall_module(module: &mut Module, ctx: &mut BuildContext) -> Result<bool> {
    let build_system = for_module(module, ctx);
    let builddir = module.fullpath(ctx, DirType::Build)?;
    let conf_file = build_system.configured_module_file_name(module, ctx);

    if !ctx.pretend && !builddir.join(conf_file).exists() {
        warn!("\tThe build system doesn't exist for {}; can't uninstall it.", module.name());
        return Ok(false);
    }

    module.setup_environment(ctx);

    let prefix_raw = module.get_option_str(ctx, "make-install-prefix");
    let make_install_opts = shell_words::split(&prefix_raw)
        .map_err(|err| BuildError::config(format!("make-install-prefix: {err}")))?;

    if !uninstall_internal(build_system.as_ref(), module, ctx, make_install_opts)? {
        error!("\tUnable to uninstall {}!", module.name());
        ctx.mark_module_phase_failed(crate::phase::Phase::Install, module.name());
        return Ok(false);
    }

    if ctx.pretend {
        info!("\tWould have uninstalled {}", module.name());
        return Ok(true);
    }
    module.unset_persistent_option(ctx, "last-install-rev");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionValue;
    use pretty_assertions::assert_eq;
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
    fn strip_naked_j_cases() {
        let stripped = strip_naked_j(
            "m",
            vec!["-j".into(), "V=1".into(), "-j".into(), "8".into()],
        );
        assert_eq!(stripped, vec!["V=1".to_string(), "-j".to_string(), "8".to_string()]);

        let stripped = strip_naked_j("m", vec!["-j".into()]);
        assert!(stripped.is_empty());
    }

    #[test]
    fn parallelism_resolution() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        let mut module = Module::new(&ctx, "m");

        // Unset num-cores adds no flag.
        assert_eq!(compute_parallelism(&Generic, &module, &ctx), None);

        // Zero or negative maps to the failsafe of 4.
        module.set_option("num-cores", "0".into()).unwrap();
        assert_eq!(compute_parallelism(&Generic, &module, &ctx), Some(4));
        module.set_option("num-cores", "-3".into()).unwrap();
        assert_eq!(compute_parallelism(&Generic, &module, &ctx), Some(4));

        // auto maps to the detected count on non-auto adapters...
        module.set_option("num-cores", "auto".into()).unwrap();
        assert_eq!(
            compute_parallelism(&Generic, &module, &ctx),
            Some(num_cpus::get() as u32)
        );
        // ...and to nothing on adapters that parallelize themselves.
        assert_eq!(compute_parallelism(&Meson, &module, &ctx), None);

        module.set_option("num-cores", "6".into()).unwrap();
        assert_eq!(compute_parallelism(&Generic, &module, &ctx), Some(6));
    }

    #[test]
    fn detection_order() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        let module = Module::new(&ctx, "m");
        let srcdir = module.fullpath(&ctx, DirType::Source).unwrap();
        fs::create_dir_all(&srcdir).unwrap();

        assert_eq!(detect_kind(&module, &ctx), BuildSystemKind::Generic);

        fs::write(srcdir.join("meson.build"), "").unwrap();
        assert_eq!(detect_kind(&module, &ctx), BuildSystemKind::Meson);

        fs::write(srcdir.join("configure"), "").unwrap();
        assert_eq!(detect_kind(&module, &ctx), BuildSystemKind::Autotools);

        fs::write(srcdir.join("app.pro"), "").unwrap();
        assert_eq!(detect_kind(&module, &ctx), BuildSystemKind::QMake);

        fs::write(srcdir.join("CMakeLists.txt"), "").unwrap();
        assert_eq!(detect_kind(&module, &ctx), BuildSystemKind::KdeCMake);

        fs::write(srcdir.join("bootstrap"), "").unwrap();
        assert_eq!(detect_kind(&module, &ctx), BuildSystemKind::CMakeBootstrap);

        // Explicit override beats detection.
        let mut module = module;
        module.set_option("override-build-system", "meson".into()).unwrap();
        assert_eq!(detect_kind(&module, &ctx), BuildSystemKind::Meson);
    }

    #[test]
    fn kde_projects_default_to_cmake() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        let mut module = Module::new(&ctx, "m");
        module.set_scm_kind(ScmKind::KdeProject);
        assert_eq!(detect_kind(&module, &ctx), BuildSystemKind::KdeCMake);
    }

    #[test]
    fn refresh_reasons() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        let mut module = Module::new(&ctx, "m");
        let builddir = module.fullpath(&ctx, DirType::Build).unwrap();

        let reason = needs_refreshed(&Generic, &module, &ctx).unwrap();
        assert_eq!(reason, "the build directory doesn't exist");

        fs::create_dir_all(&builddir).unwrap();
        fs::write(builddir.join("Makefile"), "").unwrap();
        assert_eq!(needs_refreshed(&Generic, &module, &ctx).unwrap(), "");

        module.set_option("refresh-build", "true".into()).unwrap();
        assert_eq!(
            needs_refreshed(&Generic, &module, &ctx).unwrap(),
            "the option refresh-build was set"
        );
        module.options.remove("refresh-build");

        fs::write(builddir.join(".refresh-me"), "").unwrap();
        assert_eq!(
            needs_refreshed(&Generic, &module, &ctx).unwrap(),
            "the last configure failed"
        );
        fs::remove_file(builddir.join(".refresh-me")).unwrap();

        fs::remove_file(builddir.join("Makefile")).unwrap();
        assert!(needs_refreshed(&Generic, &module, &ctx)
            .unwrap()
            .ends_with("Makefile is missing"));
    }

    #[test]
    fn clean_build_system_empties_dir_and_clears_rev() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        let module = Module::new(&ctx, "m");
        let builddir = module.fullpath(&ctx, DirType::Build).unwrap();
        fs::create_dir_all(builddir.join("CMakeFiles")).unwrap();
        fs::write(builddir.join("Makefile"), "all:").unwrap();
        ctx.state.set("m", "last-build-rev", "abc");

        assert!(clean_build_system(&module, &mut ctx).unwrap());
        assert!(builddir.exists());
        assert_eq!(fs::read_dir(&builddir).unwrap().count(), 0);
        assert!(ctx.state.get("m", "last-build-rev").is_none());
    }

    #[test]
    fn digests_are_stable_and_injective() {
        let a = get_list_digest(&["cmake".into(), "-G".into(), "Ninja".into()]);
        let b = get_list_digest(&["cmake".into(), "-G".into(), "Ninja".into()]);
        let c = get_list_digest(&["cmake".into(), "-GNinja".into()]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
