// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The command-line surface. This is a thin shim: it maps flags onto
//! context options, phase-list edits and per-module overrides, leaving
//! the real work to the application driver.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Parser;

use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::options::OptionValue;
use crate::phase::Phase;

#[derive(Debug, Parser)]
#[command(
    name = "kdebuild",
    about = "Builds KDE and Qt software stacks from source, dependencies included",
    disable_version_flag = true
)]
pub struct Args {
    /// Modules, module-sets or project paths to operate on. A leading '+'
    /// forces interpretation as a KDE project path.
    pub selectors: Vec<String>,

    /// Alternate configuration file to use.
    #[arg(long, value_name = "PATH")]
    pub rc_file: Option<PathBuf>,

    // Phase selection.
    /// Skip the source update phase.
    #[arg(long, short = 'S')]
    pub no_src: bool,
    /// Skip the build phase (and anything after it).
    #[arg(long)]
    pub no_build: bool,
    /// Skip the install phase.
    #[arg(long)]
    pub no_install: bool,
    /// Skip the test phase.
    #[arg(long)]
    pub no_tests: bool,
    /// Only update the sources.
    #[arg(long, short = 's')]
    pub src_only: bool,
    /// Only build (no update, no install).
    #[arg(long)]
    pub build_only: bool,
    /// Only install what was previously built.
    #[arg(long)]
    pub install_only: bool,
    /// Uninstall the selected modules.
    #[arg(long)]
    pub uninstall: bool,

    // Resume handling.
    /// Resume the build from the resume list of the previous failed run
    /// (implies --no-src).
    #[arg(long)]
    pub resume: bool,
    /// Start the build from the given module in the build list.
    #[arg(long, visible_alias = "from", value_name = "MODULE")]
    pub resume_from: Option<String>,
    /// Start the build after the given module in the build list.
    #[arg(long, visible_alias = "after", value_name = "MODULE")]
    pub resume_after: Option<String>,
    /// Stop the build just before the given module.
    #[arg(long, visible_alias = "until", value_name = "MODULE")]
    pub stop_before: Option<String>,
    /// Stop the build just after the given module.
    #[arg(long, visible_alias = "to", value_name = "MODULE")]
    pub stop_after: Option<String>,
    /// Rebuild only the modules that failed last run.
    #[arg(long)]
    pub rebuild_failures: bool,

    // Modes.
    /// Don't actually take any major actions, just say what would be done.
    #[arg(long, short = 'p', visible_alias = "dry-run")]
    pub pretend: bool,
    /// Remove and recreate the build directories before building.
    #[arg(long, short = 'r')]
    pub refresh_build: bool,
    /// Rerun the configure step even if it seems unnecessary.
    #[arg(long)]
    pub reconfigure: bool,
    /// Only update the project metadata, then exit.
    #[arg(long)]
    pub metadata_only: bool,
    /// Skip the metadata update this run.
    #[arg(long, short = 'M')]
    pub no_metadata: bool,
    /// Build the dependencies of selected modules too.
    #[arg(long, short = 'd', overrides_with = "no_include_dependencies")]
    pub include_dependencies: bool,
    /// Only build exactly what was selected.
    #[arg(long, short = 'D')]
    pub no_include_dependencies: bool,
    /// Keep going past a failed module.
    #[arg(long, overrides_with = "stop_on_failure")]
    pub no_stop_on_failure: bool,
    /// Stop the whole run as soon as one module fails.
    #[arg(long)]
    pub stop_on_failure: bool,
    /// Disable the concurrent update/build pipeline.
    #[arg(long = "no-async")]
    pub no_async: bool,
    /// Allow deleting conflicting source directories.
    #[arg(long)]
    pub delete_my_patches: bool,
    /// Build modules even when their source didn't change.
    #[arg(long, visible_alias = "force-build", overrides_with = "no_build_when_unchanged")]
    pub build_when_unchanged: bool,
    #[arg(long, hide = true)]
    pub no_build_when_unchanged: bool,

    // Queries.
    /// Print a property per selected module (source-dir, build-dir,
    /// install-dir, project-path, branch, module-set, build-system, or
    /// any option name) and exit.
    #[arg(long, value_name = "PROPERTY")]
    pub query: Option<String>,
    /// List modules that have been installed by previous runs.
    #[arg(long)]
    pub list_installed: bool,
    /// Print the resolved dependency tree and exit.
    #[arg(long)]
    pub dependency_tree: bool,
    /// Like --dependency-tree, with full project paths.
    #[arg(long)]
    pub dependency_tree_fullpath: bool,

    // Overrides.
    /// Set an option for one module: MODULE,OPTION,VALUE (repeatable).
    #[arg(long, value_name = "MODULE,OPTION,VALUE")]
    pub set_module_option_value: Vec<String>,
    /// Modules to skip entirely.
    #[arg(long, num_args = 1.., value_name = "MODULE")]
    pub ignore_modules: Vec<String>,
    /// Value for the branch-group option.
    #[arg(long, value_name = "GROUP")]
    pub branch_group: Option<String>,
    /// Number of compile jobs (or 'auto').
    #[arg(long, value_name = "N")]
    pub num_cores: Option<String>,

    /// Run the given program with the kdebuild environment applied; all
    /// following arguments are passed to the program.
    #[arg(
        long,
        visible_alias = "start-program",
        num_args = 1..,
        allow_hyphen_values = true,
        value_name = "PROGRAM"
    )]
    pub run: Vec<String>,
}

/// What the rest of the program needs from the command line, after the
/// context has been adjusted.
#[derive(Debug, Default)]
pub struct CommandLine {
    pub selectors: Vec<String>,
    /// Options that override the rc-file's global section.
    pub global_options: Vec<(String, OptionValue)>,
    /// Per-entity option overrides, keyed by module name plus the special
    /// `global` key (the form the module resolver consumes).
    pub module_options: BTreeMap<String, Vec<(String, OptionValue)>>,
    pub ignore_selectors: Vec<String>,
    pub resume: bool,
    pub rebuild_failures: bool,
    pub resume_from: Option<String>,
    pub resume_after: Option<String>,
    pub stop_before: Option<String>,
    pub stop_after: Option<String>,
    pub metadata_only: bool,
    pub no_metadata: bool,
    pub query: Option<String>,
    pub list_installed: bool,
    pub dependency_tree: bool,
    pub dependency_tree_fullpath: bool,
    pub run_program: Vec<String>,
}

/// Applies the parsed arguments onto the context (phases, pretend flag,
/// rc-file override) and collects the option overrides.
pub fn process_args(ctx: &mut BuildContext, args: Args) -> Result<CommandLine> {
    let mut cmdline = CommandLine {
        selectors: args.selectors,
        resume: args.resume,
        rebuild_failures: args.rebuild_failures,
        resume_from: args.resume_from,
        resume_after: args.resume_after,
        stop_before: args.stop_before,
        stop_after: args.stop_after,
        metadata_only: args.metadata_only,
        no_metadata: args.no_metadata,
        query: args.query,
        list_installed: args.list_installed,
        dependency_tree: args.dependency_tree,
        dependency_tree_fullpath: args.dependency_tree_fullpath,
        run_program: args.run,
        ignore_selectors: args.ignore_modules.clone(),
        ..Default::default()
    };

    if let Some(path) = args.rc_file {
        ctx.set_rc_file(&path);
    }

    // Phase filters apply to the context's phase list; modules clone it
    // and are re-filtered against it after resolution.
    if args.no_src || args.resume {
        ctx.phases.filter_out(Phase::Update);
    }
    if args.no_install {
        ctx.phases.filter_out(Phase::Install);
    }
    if args.no_tests {
        ctx.phases.filter_out(Phase::Test);
    }
    if args.no_build {
        ctx.phases.filter_out(Phase::Build);
    }
    if args.src_only {
        ctx.phases.restrict_to(Phase::Update);
    }
    if args.build_only {
        ctx.phases.restrict_to(Phase::Build);
    }
    if args.install_only {
        ctx.phases.restrict_to(Phase::Install);
    }
    if args.uninstall {
        ctx.phases.reset_to(vec![Phase::Uninstall]);
    }

    let mut globals: Vec<(String, OptionValue)> = Vec::new();
    if args.pretend {
        ctx.pretend = true;
        globals.push(("pretend".into(), true.into()));
    }
    if args.refresh_build {
        globals.push(("refresh-build".into(), true.into()));
    }
    if args.reconfigure {
        globals.push(("reconfigure".into(), true.into()));
    }
    if args.include_dependencies {
        globals.push(("include-dependencies".into(), true.into()));
    }
    if args.no_include_dependencies {
        globals.push(("include-dependencies".into(), false.into()));
    }
    if args.stop_on_failure {
        globals.push(("stop-on-failure".into(), true.into()));
    }
    if args.no_stop_on_failure {
        globals.push(("stop-on-failure".into(), false.into()));
    }
    if args.no_async {
        globals.push(("async".into(), false.into()));
    }
    if args.delete_my_patches {
        globals.push(("delete-my-patches".into(), true.into()));
    }
    if args.build_when_unchanged {
        globals.push(("build-when-unchanged".into(), true.into()));
    }
    if args.no_build_when_unchanged {
        globals.push(("build-when-unchanged".into(), false.into()));
    }
    if let Some(group) = args.branch_group {
        globals.push(("branch-group".into(), group.into()));
    }
    if let Some(cores) = args.num_cores {
        globals.push(("num-cores".into(), cores.into()));
    }
    if !args.ignore_modules.is_empty() {
        globals.push((
            "ignore-modules".into(),
            args.ignore_modules.join(" ").into(),
        ));
    }

    // Apply immediately so the rc-file reader knows which keys to skip.
    for (key, value) in &globals {
        ctx.set_option(key, value.clone())?;
    }
    cmdline
        .module_options
        .insert("global".to_string(), globals.clone());
    cmdline.global_options = globals;

    for spec in &args.set_module_option_value {
        let mut parts = spec.splitn(3, ',');
        let (Some(module), Some(key), Some(value)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(BuildError::config(format!(
                "Invalid --set-module-option-value: {spec} (expected MODULE,OPTION,VALUE)"
            )));
        };
        let value = match value {
            "true" => OptionValue::Bool(true),
            "false" => OptionValue::Bool(false),
            other => OptionValue::Str(other.to_string()),
        };
        cmdline
            .module_options
            .entry(module.to_string())
            .or_default()
            .push((key.to_string(), value));
    }

    Ok(cmdline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("kdebuild").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn phase_flags_prune_context_phases() {
        let mut ctx = BuildContext::new();
        process_args(&mut ctx, parse(&["--no-src", "juk"])).unwrap();
        assert!(!ctx.phases.has(Phase::Update));
        assert!(ctx.phases.has(Phase::Build));

        let mut ctx = BuildContext::new();
        process_args(&mut ctx, parse(&["--src-only"])).unwrap();
        assert_eq!(ctx.phases.phases(), &[Phase::Update]);

        let mut ctx = BuildContext::new();
        process_args(&mut ctx, parse(&["--uninstall", "juk"])).unwrap();
        assert_eq!(ctx.phases.phases(), &[Phase::Uninstall]);
    }

    #[test]
    fn pretend_sets_context_flag() {
        let mut ctx = BuildContext::new();
        let cmdline = process_args(&mut ctx, parse(&["--pretend"])).unwrap();
        assert!(ctx.pretend);
        assert!(cmdline
            .global_options
            .iter()
            .any(|(key, value)| key == "pretend" && value.is_true()));
    }

    #[test]
    fn set_module_option_value_collects_per_module() {
        let mut ctx = BuildContext::new();
        let cmdline = process_args(
            &mut ctx,
            parse(&[
                "--set-module-option-value",
                "juk,cxxflags,-g3 -Og",
                "--set-module-option-value",
                "juk,run-tests,true",
            ]),
        )
        .unwrap();
        let juk = &cmdline.module_options["juk"];
        assert_eq!(
            juk[0],
            ("cxxflags".to_string(), OptionValue::Str("-g3 -Og".to_string()))
        );
        assert_eq!(juk[1], ("run-tests".to_string(), OptionValue::Bool(true)));
    }

    #[test]
    fn malformed_module_option_is_config_error() {
        let mut ctx = BuildContext::new();
        let err = process_args(
            &mut ctx,
            parse(&["--set-module-option-value", "justone"]),
        )
        .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn ignore_modules_consumes_names() {
        let mut ctx = BuildContext::new();
        let cmdline = process_args(
            &mut ctx,
            parse(&["--ignore-modules", "juk", "dragon", "--", "kcalc"]),
        )
        .unwrap();
        assert_eq!(cmdline.ignore_selectors, vec!["juk", "dragon"]);
        assert_eq!(cmdline.selectors, vec!["kcalc"]);
    }

    #[test]
    fn run_forwards_trailing_arguments() {
        let mut ctx = BuildContext::new();
        let cmdline = process_args(
            &mut ctx,
            parse(&["--run", "kate", "--new-window", "file.txt"]),
        )
        .unwrap();
        assert_eq!(cmdline.run_program, vec!["kate", "--new-window", "file.txt"]);
    }

    #[test]
    fn include_dependencies_negation_wins_last() {
        let mut ctx = BuildContext::new();
        let cmdline = process_args(
            &mut ctx,
            parse(&["--include-dependencies", "--no-include-dependencies"]),
        )
        .unwrap();
        assert!(cmdline
            .global_options
            .iter()
            .any(|(key, value)| key == "include-dependencies" && !value.is_true()));
    }
}
