// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A buildable unit: one source tree with its own options, phases, source
//! control kind and build system.

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::buildsystem;
use crate::context::{
    expand_subdir_path, home_dir, BuildContext, APPEND_OPTIONS, QT_COPY_OVERRIDES,
};
use crate::error::{BuildError, Result};
use crate::options::{OptionValue, OptionsMap};
use crate::phase::{Phase, PhaseList};

static MODULE_SUBST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\$\{MODULE\})|(\$MODULE\b)").unwrap());

/// Which updater drives this module's source tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScmKind {
    /// A plain git repository given by the `repository` option.
    Git,
    /// A repository from the KDE project database.
    KdeProject,
    /// The special metadata module holding the project database itself.
    KdeProjectMetadata,
    /// The synthetic qt-projects supermodule.
    Qt,
}

#[derive(Clone, Debug)]
pub struct Module {
    name: String,
    pub options: OptionsMap,
    phases: PhaseList,
    scm_kind: ScmKind,
    module_set: Option<String>,
    post_build_msgs: Vec<String>,
    create_id: u32,
}

/// Where a path points: the checkout or the build tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DirType {
    Source,
    Build,
}

impl Module {
    pub fn new(ctx: &BuildContext, name: &str) -> Self {
        let mut module = Module {
            name: name.to_string(),
            options: OptionsMap::new(),
            phases: ctx.phases.clone(),
            scm_kind: ScmKind::Git,
            module_set: None,
            post_build_msgs: Vec::new(),
            create_id: 0,
        };
        // Record what the last run considered the source/build dirs, before
        // they are potentially reset during this run.
        let last_src = ctx.state.get_str(name, "source-dir").unwrap_or_default();
        let last_build = ctx.state.get_str(name, "build-dir").unwrap_or_default();
        let _ = module.options.set("#last-source-dir", last_src.into());
        let _ = module.options.set("#last-build-dir", last_build.into());
        module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phases(&self) -> &PhaseList {
        &self.phases
    }

    pub fn phases_mut(&mut self) -> &mut PhaseList {
        &mut self.phases
    }

    pub fn scm_kind(&self) -> ScmKind {
        self.scm_kind
    }

    pub fn set_scm_kind(&mut self, kind: ScmKind) {
        self.scm_kind = kind;
    }

    pub fn is_kde_project(&self) -> bool {
        matches!(self.scm_kind, ScmKind::KdeProject | ScmKind::KdeProjectMetadata)
    }

    pub fn module_set(&self) -> Option<&str> {
        self.module_set.as_deref()
    }

    pub fn set_module_set(&mut self, name: &str) {
        self.module_set = Some(name.to_string());
    }

    pub fn create_id(&self) -> u32 {
        self.create_id
    }

    pub fn set_create_id(&mut self, id: u32) {
        self.create_id = id;
    }

    // Option handling.

    /// Sets an option, with module-specific handling: phase-changing
    /// convenience keys mutate the phase list instead of being stored, and
    /// module-set-only keys are rejected.
    pub fn set_option(&mut self, key: &str, value: OptionValue) -> Result<()> {
        if key == "use-modules" || key == "ignore-modules" {
            error!(
                "module {} should be declared as module-set to use {key}",
                self.name
            );
            return Err(BuildError::config(format!(
                "Option {key} can only be used in module-set"
            )));
        }

        match key {
            "filter-out-phases" => {
                for phase in value.as_str().split_whitespace() {
                    match phase.parse::<Phase>() {
                        Ok(phase) => self.phases.filter_out(phase),
                        Err(_) => warn!("Ignoring unknown phase {phase} in filter-out-phases"),
                    }
                }
                return Ok(());
            }
            "no-src" => {
                self.phases.filter_out(Phase::Update);
                return Ok(());
            }
            "no-install" => {
                self.phases.filter_out(Phase::Install);
                return Ok(());
            }
            "no-tests" => {
                self.phases.filter_out(Phase::Test);
                return Ok(());
            }
            "no-build" => {
                self.phases.filter_out(Phase::Build);
                return Ok(());
            }
            "src-only" => {
                self.phases.restrict_to(Phase::Update);
                return Ok(());
            }
            "uninstall" => {
                self.phases.restrict_to(Phase::Uninstall);
                return Ok(());
            }
            "build-only" => {
                self.phases.restrict_to(Phase::Build);
                return Ok(());
            }
            "install-only" => {
                self.phases.restrict_to(Phase::Install);
                return Ok(());
            }
            _ => {}
        }

        self.options.set(key, value)
    }

    pub fn merge_options_from(&mut self, other: &OptionsMap) -> Result<()> {
        for (key, value) in other.iter() {
            self.set_option(key, value.clone())?;
        }
        Ok(())
    }

    /// Reads an option with the full inheritance rules: the sticky form
    /// wins (module, then context), a few keys merge-append the context
    /// value with the module value, and Qt-buildsystem modules do not
    /// inherit a handful of keys at all.
    pub fn get_option(&self, ctx: &BuildContext, key: &str) -> OptionValue {
        if QT_COPY_OVERRIDES.contains(&key) && self.build_system_is_qt(ctx) {
            return self
                .options
                .get_exact(key)
                .cloned()
                .unwrap_or_else(|| OptionValue::Str(String::new()));
        }

        let sticky_key = format!("#{key}");
        if let Some(value) = self.options.get_exact(&sticky_key) {
            return value.clone();
        }
        if ctx.has_sticky_option(key) {
            if let Some(value) = ctx.get_option(key) {
                return value.clone();
            }
        }

        let ctx_value = ctx.get_option(key);

        if APPEND_OPTIONS.contains(&key) {
            let ctx_str = ctx_value.map(|v| v.as_str().into_owned()).unwrap_or_default();
            if !ctx_str.is_empty() {
                let module_str = self
                    .options
                    .get_exact(key)
                    .map(|v| v.as_str().into_owned())
                    .unwrap_or_default();
                return OptionValue::Str(format!("{ctx_str} {module_str}").trim().to_string());
            }
        }

        if let Some(value) = self.options.get_exact(key) {
            return value.clone();
        }
        ctx_value
            .cloned()
            .unwrap_or_else(|| OptionValue::Str(String::new()))
    }

    pub fn get_option_str(&self, ctx: &BuildContext, key: &str) -> String {
        self.get_option(ctx, key).as_str().into_owned()
    }

    pub fn get_option_bool(&self, ctx: &BuildContext, key: &str) -> bool {
        self.get_option(ctx, key).is_true()
    }

    /// Module-level-only lookup (no inheritance, no sticky override).
    pub fn get_option_module(&self, key: &str) -> Option<&OptionValue> {
        self.options.get_exact(key)
    }

    fn build_system_is_qt(&self, ctx: &BuildContext) -> bool {
        buildsystem::detect_kind(self, ctx).name().starts_with("Qt")
    }

    // Persistent options.

    pub fn get_persistent_option(&self, ctx: &BuildContext, key: &str) -> Option<String> {
        ctx.state.get_str(&self.name, key)
    }

    pub fn set_persistent_option(&self, ctx: &mut BuildContext, key: &str, value: impl Into<Value>) {
        ctx.state.set(&self.name, key, value);
    }

    pub fn unset_persistent_option(&self, ctx: &mut BuildContext, key: &str) {
        ctx.state.unset(&self.name, key);
    }

    // Paths.

    /// Retrieves a subdirectory path option with tilde expansion and
    /// relative-path handling (relative paths land under source-dir).
    pub fn subdir_path(&self, ctx: &BuildContext, option: &str) -> Result<PathBuf> {
        let directory = self.get_option_str(ctx, option);
        if directory.is_empty() {
            return Err(BuildError::config(format!(
                "Reading option for {option} gave empty directory!"
            )));
        }
        if let Some(rest) = directory.strip_prefix("~/") {
            return Ok(home_dir().join(rest));
        }
        if directory.starts_with('/') {
            return Ok(PathBuf::from(directory));
        }
        let source_dir = self.get_option_str(ctx, "source-dir");
        Ok(expand_subdir_path(&directory, &source_dir))
    }

    /// Base source directory (without the module's destination appended).
    pub fn source_base_dir(&self, ctx: &BuildContext) -> Result<PathBuf> {
        self.subdir_path(ctx, "source-dir")
    }

    /// The per-module destination directory, relative to the src/build
    /// base. Based on `dest-dir` with `${MODULE}` substitution; the
    /// substituted name depends on `directory-layout`.
    pub fn dest_dir(&self, ctx: &BuildContext) -> String {
        let layout = self.get_option_str(ctx, "directory-layout");
        let base_path = match layout.as_str() {
            "invent" => self
                .get_option_module("#kde-repo-path")
                .map(|v| v.as_str().into_owned())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| self.name.clone()),
            "metadata" => self
                .get_option_module("#kde-project-path")
                .map(|v| v.as_str().into_owned())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| self.name.clone()),
            "flat" => self.name.clone(),
            other => {
                warn!("Invalid directory-layout value: \"{other}\"; using flat for {}", self.name);
                self.name.clone()
            }
        };
        let dest_dir = self.get_option_str(ctx, "dest-dir");
        MODULE_SUBST_RE
            .replace_all(&dest_dir, base_path.as_str())
            .into_owned()
    }

    /// Full path to the source or build tree, including the destination
    /// directory.
    pub fn fullpath(&self, ctx: &BuildContext, dirtype: DirType) -> Result<PathBuf> {
        let base = match dirtype {
            DirType::Source => self.subdir_path(ctx, "source-dir")?,
            DirType::Build => self.subdir_path(ctx, "build-dir")?,
        };
        Ok(base.join(self.dest_dir(ctx)))
    }

    /// The installation prefix (the CMAKE_INSTALL_PREFIX value), with
    /// `${MODULE}` substitution applied.
    pub fn installation_path(&self, ctx: &BuildContext) -> String {
        let path = self.get_option_str(ctx, "install-dir");
        MODULE_SUBST_RE.replace_all(&path, self.name.as_str()).into_owned()
    }

    /// The full project path in the project database; modules outside that
    /// hierarchy just use their name.
    pub fn full_project_path(&self) -> String {
        self.get_option_module("#kde-project-path")
            .map(|v| v.as_str().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.name.clone())
    }

    /// Full path for a new log file for this module; remakes the `latest`
    /// symlinks as a side effect.
    pub fn log_path(&self, ctx: &mut BuildContext, file: &str) -> Result<PathBuf> {
        let base = self.subdir_path(ctx, "log-dir")?;
        ctx.log_path_for(&base, &self.name, file)
    }

    // Environment.

    /// Integrates the module's `set-env` options into the context's queued
    /// environment.
    pub fn apply_user_environment(&self, ctx: &mut BuildContext) {
        let env = match self.get_option_module("set-env").and_then(|v| v.as_map()) {
            Some(map) => map.clone(),
            None => return,
        };
        for (key, value) in env {
            ctx.queue_environment_variable(&key, &value);
        }
    }

    /// Establishes the build environment in the context. Run before
    /// forking off commands for updates, builds and installs.
    pub fn setup_environment(&self, ctx: &mut BuildContext) {
        let prefix = self.installation_path(ctx);

        // Global set-env entries first.
        if let Some(global_env) = ctx.get_option("set-env").and_then(|v| v.as_map()) {
            for (key, value) in global_env.clone() {
                ctx.queue_environment_variable(&key, &value);
            }
        }

        let build_system = buildsystem::for_module(self, ctx);

        // With a custom toolchain in play the toolchain definitions take
        // care of themselves.
        if build_system.has_toolchain(self, ctx) {
            info!("\tNot setting environment variables for {}: a custom toolchain is used", self.name);
        } else {
            let installdir = self.get_option_str(ctx, "install-dir");
            let qt_installdir = self.get_option_str(ctx, "qt-install-dir");
            let libname = self.get_option_str(ctx, "libname");

            // Ensure the platform libraries we're building can be found, as
            // long as they are not the system's own libraries.
            for platform_dir in [qt_installdir.as_str(), installdir.as_str()] {
                if platform_dir.is_empty() || platform_dir == "/usr" {
                    continue;
                }
                ctx.prepend_environment_value(
                    "PKG_CONFIG_PATH",
                    &format!("{platform_dir}/{libname}/pkgconfig"),
                );
                ctx.prepend_environment_value(
                    "LD_LIBRARY_PATH",
                    &format!("{platform_dir}/{libname}"),
                );
                ctx.prepend_environment_value("PATH", &format!("{platform_dir}/bin"));
            }

            let binpath = self.get_option_str(ctx, "binpath");
            let libpath = self.get_option_str(ctx, "libpath");
            if !binpath.is_empty() {
                ctx.prepend_environment_value("PATH", &binpath);
            }
            if !libpath.is_empty() {
                ctx.prepend_environment_value("LD_LIBRARY_PATH", &libpath);
            }
        }

        build_system.prepare_module_build_environment(self, ctx, &prefix);

        self.apply_user_environment(ctx);
    }

    // Post-build messages.

    pub fn add_post_build_message(&mut self, msg: String) {
        self.post_build_msgs.push(msg);
    }

    pub fn post_build_messages(&self) -> &[String] {
        &self.post_build_msgs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> BuildContext {
        BuildContext::new()
    }

    #[test]
    fn append_options_merge_context_and_module() {
        let ctx = ctx();
        let mut module = Module::new(&ctx, "juk");
        // cxxflags defaults to -pipe at the context level.
        module.set_option("cxxflags", "-g3".into()).unwrap();
        assert_eq!(module.get_option_str(&ctx, "cxxflags"), "-pipe -g3");

        module.set_option("branch", "work".into()).unwrap();
        assert_eq!(module.get_option_str(&ctx, "branch"), "work");
    }

    #[test]
    fn sticky_module_option_wins() {
        let ctx = ctx();
        let mut module = Module::new(&ctx, "juk");
        module.set_option("branch", "work".into()).unwrap();
        module.set_option("#branch", "frozen".into()).unwrap();
        assert_eq!(module.get_option_str(&ctx, "branch"), "frozen");
    }

    #[test]
    fn context_sticky_overrides_module_value() {
        let mut context = ctx();
        context.set_option("#branch", "everywhere".into()).unwrap();
        let mut module = Module::new(&context, "juk");
        module.set_option("branch", "mine".into()).unwrap();
        assert_eq!(module.get_option_str(&context, "branch"), "everywhere");
    }

    #[test]
    fn phase_changing_keys_mutate_phases() {
        let ctx = ctx();
        let mut module = Module::new(&ctx, "juk");
        module.set_option("no-src", "".into()).unwrap();
        assert!(!module.phases().has(Phase::Update));
        assert!(module.phases().has(Phase::Build));

        module.set_option("build-only", "".into()).unwrap();
        assert_eq!(module.phases().phases(), &[Phase::Build]);

        // Nothing was stored as a regular option.
        assert!(module.get_option_module("no-src").is_none());
    }

    #[test]
    fn module_set_only_options_are_config_errors() {
        let ctx = ctx();
        let mut module = Module::new(&ctx, "juk");
        let err = module.set_option("use-modules", "a b".into()).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn dest_dir_substitutes_module_name() {
        let ctx = ctx();
        let module = Module::new(&ctx, "juk");
        assert_eq!(module.dest_dir(&ctx), "juk");

        let mut module2 = Module::new(&ctx, "kcalc");
        module2.set_option("dest-dir", "stable-$MODULE".into()).unwrap();
        assert_eq!(module2.dest_dir(&ctx), "stable-kcalc");
    }

    #[test]
    fn invent_layout_uses_repo_path() {
        let mut context = ctx();
        context.set_option("directory-layout", "invent".into()).unwrap();
        let mut module = Module::new(&context, "juk");
        module
            .set_option("#kde-repo-path", "multimedia/juk".into())
            .unwrap();
        assert_eq!(module.dest_dir(&context), "multimedia/juk");
    }

    #[test]
    fn installation_path_substitutes() {
        let mut context = ctx();
        context
            .set_option("install-dir", "/opt/kde/$MODULE".into())
            .unwrap();
        let module = Module::new(&context, "juk");
        assert_eq!(module.installation_path(&context), "/opt/kde/juk");
    }
}
