// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end orchestration: configuration, metadata, module and
//! dependency resolution, the pipeline run, and the post-run report.

use std::collections::{BTreeMap, HashMap};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;

use tracing::{error, info, warn};

use crate::buildsystem;
use crate::cli::{self, CommandLine};
use crate::context::BuildContext;
use crate::dependency::{self, hints, DependencyResolver, ModuleGraph};
use crate::error::{BuildError, Result};
use crate::metadata::branchgroup::BranchGroupResolver;
use crate::metadata::projects::ProjectDatabase;
use crate::module::{DirType, Module, ScmKind};
use crate::phase::Phase;
use crate::rcfile::ConfigReader;
use crate::resolver::ModuleResolver;
use crate::state::GLOBAL;
use crate::ipc;
use crate::taskmanager;
use crate::updater::{git, kdeproject};

pub struct Application {
    ctx: BuildContext,
    cmdline: CommandLine,
    resolver: ModuleResolver,
    dep_resolver: DependencyResolver,
}

impl Application {
    /// Parses options, reads the configuration and loads persistent state.
    pub fn new(args: cli::Args) -> Result<Self> {
        let mut ctx = BuildContext::new();
        let cmdline = cli::process_args(&mut ctx, args)?;

        let rcfile = ctx.locate_rc_file()?;
        info!("Using configuration {}", rcfile.display());

        let mut reader = ConfigReader::new();
        let config = reader.read_configuration(&mut ctx, &rcfile, &cmdline.global_options)?;

        ctx.load_persistent_options()?;
        ctx.add_to_ignore_list(cmdline.ignore_selectors.clone());
        ctx.setup_operating_environment();

        let mut resolver = ModuleResolver::new();
        resolver.set_input(&config);
        resolver.set_cmdline_options(cmdline.module_options.clone());
        resolver.set_ignored_selectors(cmdline.ignore_selectors.clone());

        let mut app = Application {
            ctx,
            cmdline,
            resolver,
            dep_resolver: DependencyResolver::new(),
        };

        // Deferred blocks that target whole module-sets need the project
        // database; distribute them after metadata is available instead
        // when any are present.
        app.update_metadata(&config.deferred)?;
        Ok(app)
    }

    pub fn metadata_only(&self) -> bool {
        self.cmdline.metadata_only
    }

    /// Downloads/updates the repo-metadata module and loads the project
    /// database, branch groups and dependency data out of it. A download
    /// failure falls back to previously-downloaded metadata.
    fn update_metadata(&mut self, deferred: &[crate::rcfile::DeferredOptions]) -> Result<()> {
        let ctx = &mut self.ctx;

        let mut metadata = Module::new(ctx, "repo-metadata");
        metadata.set_scm_kind(ScmKind::KdeProjectMetadata);
        metadata.set_option("repository", "kde:sysadmin/repo-metadata.git".into())?;
        metadata.set_option("#kde-project-path", "repo-metadata".into())?;

        let srcdir = metadata.fullpath(ctx, DirType::Source)?;

        if !self.cmdline.no_metadata {
            // Make sure the kde: alias expansion works before we hit the
            // network; purely advisory.
            if !ctx.pretend {
                if let Err(err) = git::verify_git_config(ctx) {
                    warn!("{err}");
                }
            }

            // The metadata module downloads even under --pretend, since
            // everything else depends on its contents being current.
            let was_pretending = ctx.pretend;
            ctx.pretend = false;
            let mut null_ipc = ipc::Ipc::new(Box::<ipc::NullChannel>::default());
            let _ = null_ipc.send(ipc::MsgType::AllUpdating, "metadata");
            let update_result = git::update_checkout(&mut metadata, ctx, &mut null_ipc);
            // Apply the persist-option messages the updater queued.
            let _ = null_ipc.send(ipc::MsgType::AllDone, "metadata");
            let _ = null_ipc.wait_for_end(&mut ctx.state);
            ctx.pretend = was_pretending;

            match update_result {
                Ok(_) => {
                    ctx.state
                        .set(GLOBAL, "last-metadata-update", chrono::Utc::now().timestamp());
                }
                Err(err) if srcdir.join("projects").exists() => {
                    warn!("Unable to update the repo-metadata module: {err}");
                    warn!("Falling back to previously downloaded metadata.");
                }
                Err(err) => {
                    return Err(BuildError::runtime(format!(
                        "kde-projects repository information could not be downloaded: {err}"
                    )));
                }
            }
        }

        if srcdir.join("projects").exists() {
            ctx.set_project_database(ProjectDatabase::from_metadata_dir(&srcdir)?);

            let branch_group_file = srcdir.join("dependencies/logical-module-structure.json");
            if let Ok(json) = std::fs::read_to_string(&branch_group_file) {
                ctx.set_branch_group_resolver(BranchGroupResolver::from_json(&json)?);
            }

            kdeproject::read_ignored_projects(&metadata, ctx)?;
            self.load_dependency_data(&metadata)?;
        }

        self.resolver.set_deferred_options(&self.ctx, deferred)?;
        Ok(())
    }

    fn load_dependency_data(&mut self, metadata: &Module) -> Result<()> {
        let srcdir = metadata.fullpath(&self.ctx, DirType::Source)?;
        let branch_group = self.ctx.effective_branch_group();

        let legacy = srcdir.join(format!("dependencies/dependency-data-{branch_group}"));
        if let Ok(text) = std::fs::read_to_string(&legacy) {
            self.dep_resolver.read_dependency_data(&text)?;
            return Ok(());
        }

        let v2 = srcdir.join(format!("dependencies/dependencies_v2-{branch_group}.json"));
        if let Ok(json) = std::fs::read_to_string(&v2) {
            warn!(" *** Using v2 dependency metadata; the build order may be incomplete.");
            self.dep_resolver.read_dependency_data_v2(&json)?;
            return Ok(());
        }

        warn!("No dependency data found for branch group {branch_group}; building without dependency ordering.");
        Ok(())
    }

    /// Produces the final ordered module list (and the graph that backs
    /// it) from the selectors.
    pub fn generate_module_list(&mut self) -> Result<(Vec<Module>, ModuleGraph)> {
        let mut selectors = self.cmdline.selectors.clone();

        if self.cmdline.resume {
            let resume_list = self
                .ctx
                .state
                .get_str(GLOBAL, "resume-list")
                .unwrap_or_default();
            if resume_list.is_empty() {
                return Err(BuildError::config(
                    "--resume requested but no resume list found from a previous run",
                ));
            }
            selectors = resume_list
                .split(", ")
                .map(|name| name.to_string())
                .collect();
        } else if self.cmdline.rebuild_failures {
            let failed = self
                .ctx
                .state
                .get_str(GLOBAL, "last-failed-module-list")
                .unwrap_or_default();
            if failed.is_empty() {
                return Err(BuildError::config(
                    "--rebuild-failures requested but no failures from a previous run were found",
                ));
            }
            selectors = failed
                .split_whitespace()
                .map(|name| name.to_string())
                .collect();
        }

        let modules = if selectors.is_empty() {
            self.resolver.expand_all_declarations(&self.ctx)?
        } else {
            self.resolver
                .resolve_selectors_into_modules(&self.ctx, &selectors)?
        };

        // Honor the ignore filters (names, module-set names and project
        // paths).
        let modules: Vec<Module> = modules
            .into_iter()
            .filter(|module| {
                let ignored = self.ctx.is_ignored(&module.full_project_path())
                    || self.ctx.is_ignored(module.name())
                    || module
                        .module_set()
                        .map(|set| self.ctx.is_ignored(set))
                        .unwrap_or(false);
                if ignored {
                    info!("Skipping ignored module {}", module.name());
                }
                !ignored
            })
            .collect();

        let resolver = &mut self.resolver;
        let ctx = &mut self.ctx;
        let mut factory =
            |ctx: &mut BuildContext, name: &str| resolver.resolve_module_if_present(ctx, name);
        let result = self
            .dep_resolver
            .resolve_to_module_graph(ctx, &mut factory, modules);

        let Some(mut graph) = result.graph else {
            return Err(BuildError::runtime("Unable to resolve dependency graph"));
        };
        let mut modules = dependency::sort_modules_into_build_order(&mut graph);

        // Module phase lists must end up a subset of the context's phase
        // list after command-line filtering.
        for module in &mut modules {
            let allowed: Vec<Phase> = module
                .phases()
                .phases()
                .iter()
                .copied()
                .filter(|phase| self.ctx.phases.has(*phase))
                .collect();
            module.phases_mut().reset_to(allowed);
        }

        self.apply_resume_slicing(&mut modules)?;
        Ok((modules, graph))
    }

    fn apply_resume_slicing(&self, modules: &mut Vec<Module>) -> Result<()> {
        let find = |modules: &[Module], name: &str| -> Result<usize> {
            modules
                .iter()
                .position(|module| module.name() == name)
                .ok_or_else(|| {
                    BuildError::config(format!("Unknown module {name} in the resolved build list"))
                })
        };

        if let Some(name) = &self.cmdline.resume_from {
            let index = find(modules, name)?;
            modules.drain(..index);
        } else if let Some(name) = &self.cmdline.resume_after {
            let index = find(modules, name)?;
            modules.drain(..=index);
        }

        if let Some(name) = &self.cmdline.stop_before {
            let index = find(modules, name)?;
            modules.truncate(index);
        } else if let Some(name) = &self.cmdline.stop_after {
            let index = find(modules, name)?;
            modules.truncate(index + 1);
        }
        Ok(())
    }

    /// Handles the query modes (--query, --list-installed,
    /// --dependency-tree); returns true when one was handled and the run
    /// should end.
    pub fn handle_queries(&mut self, modules: &[Module], graph: &ModuleGraph) -> Result<bool> {
        if self.cmdline.dependency_tree || self.cmdline.dependency_tree_fullpath {
            let full_path = self.cmdline.dependency_tree_fullpath;
            let roots: Vec<String> = modules
                .iter()
                .map(|module| module.name().to_string())
                .collect();
            dependency::walk_module_dependency_trees(graph, &roots, &mut |node| {
                let indent = "  ".repeat(node.depth);
                let label = if full_path {
                    graph
                        .get(node.item)
                        .map(|n| n.path.clone())
                        .unwrap_or_else(|| node.item.to_string())
                } else {
                    node.item.to_string()
                };
                let branch = if node.branch.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", node.branch)
                };
                let marker = if node.build { "" } else { " (not built)" };
                println!("{indent}{label}{branch}{marker}");
            });
            return Ok(true);
        }

        if self.cmdline.list_installed {
            for module in modules {
                if module.get_persistent_option(&self.ctx, "last-install-rev").is_some() {
                    println!("{}", module.name());
                }
            }
            return Ok(true);
        }

        let Some(query) = self.cmdline.query.clone() else {
            return Ok(false);
        };
        for module in modules {
            let value = match query.as_str() {
                "source-dir" => module
                    .fullpath(&self.ctx, DirType::Source)?
                    .to_string_lossy()
                    .into_owned(),
                "build-dir" => module
                    .fullpath(&self.ctx, DirType::Build)?
                    .to_string_lossy()
                    .into_owned(),
                "install-dir" => module.installation_path(&self.ctx),
                "project-path" => module.full_project_path(),
                "branch" => {
                    let (reference, kind) =
                        git::determine_preferred_checkout_source(module, &self.ctx);
                    if kind == git::CheckoutKind::Branch {
                        reference
                    } else {
                        String::new()
                    }
                }
                "module-set" => module.module_set().unwrap_or("").to_string(),
                "build-system" => buildsystem::detect_kind(module, &self.ctx).name().to_string(),
                option => module.get_option_str(&self.ctx, option),
            };
            println!("{}: {value}", module.name());
        }
        Ok(true)
    }

    /// Runs a program with the kdebuild environment applied; only returns
    /// on exec failure.
    pub fn exec_program(&mut self) -> Result<i32> {
        let argv = self.cmdline.run_program.clone();
        if argv.is_empty() {
            return Err(BuildError::internal("exec_program without a program"));
        }
        let mut command = std::process::Command::new(&argv[0]);
        command.args(&argv[1..]);
        command.envs(self.ctx.environment());
        let err = command.exec();
        Err(BuildError::runtime(format!("Unable to run {}: {err}", argv[0])))
    }

    pub fn wants_program_run(&self) -> bool {
        !self.cmdline.run_program.is_empty()
    }

    /// Runs all module phases and reports the outcome. The main entry
    /// point once the module list exists.
    pub fn run_all_module_phases(&mut self, mut modules: Vec<Module>, graph: &ModuleGraph) -> Result<i32> {
        if !self.ctx.take_lock()? {
            return Ok(1);
        }
        if let Ok(lockfile) = self.ctx.lockfile_path() {
            install_fatal_signal_handlers(&lockfile);
        }

        let result = if self.ctx.phases.phases() == &[Phase::Uninstall] {
            self.handle_uninstall(&mut modules)
        } else if self.ctx.phases.phases() == &[Phase::Install] {
            self.handle_install(&mut modules)
        } else {
            taskmanager::run_all_tasks(&mut self.ctx, &mut modules)
        };

        self.report_module_messages(&modules);
        self.report_failures(&modules, graph);

        self.ctx.store_persistent_options()?;
        self.ctx.close_lock();
        result
    }

    /// Install-only mode: installs what was previously built.
    fn handle_install(&mut self, modules: &mut [Module]) -> Result<i32> {
        let mut failed = false;
        for module in modules.iter_mut() {
            if !module.phases().has(Phase::Install) {
                continue;
            }
            info!("Installing {}", module.name());
            if !buildsystem::install_module(module, &mut self.ctx)? {
                failed = true;
                if module.get_option_bool(&self.ctx, "stop-on-failure") {
                    break;
                }
            }
        }
        Ok(i32::from(failed))
    }

    fn handle_uninstall(&mut self, modules: &mut [Module]) -> Result<i32> {
        let mut failed = false;
        for module in modules.iter_mut() {
            if !module.phases().has(Phase::Uninstall) {
                continue;
            }
            info!("Uninstalling {}", module.name());
            if !buildsystem::uninstall_module(module, &mut self.ctx)? {
                failed = true;
                if module.get_option_bool(&self.ctx, "stop-on-failure") {
                    break;
                }
            }
        }
        Ok(i32::from(failed))
    }

    fn report_module_messages(&self, modules: &[Module]) {
        for module in modules {
            for message in module.post_build_messages() {
                warn!("{}: {message}", module.name());
            }
        }
    }

    /// The post-run failure summary: per-phase lists with log locations, a
    /// packaging hint for configure-type failures, and the ranked top-5.
    fn report_failures(&mut self, modules: &[Module], graph: &ModuleGraph) {
        let failed_names = self.ctx.failed_module_names();
        if failed_names.is_empty() {
            return;
        }

        self.ctx
            .state
            .set(GLOBAL, "last-failed-module-list", failed_names.join(" "));

        let mut by_phase: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in &failed_names {
            if let Some(phase) = self.ctx.failed_phase_for(name) {
                by_phase.entry(phase.to_string()).or_default().push(name.clone());
            }
        }
        for (phase, names) in &by_phase {
            error!("Modules that failed to {phase}:");
            for name in names {
                let log_hint = modules
                    .iter()
                    .find(|module| module.name() == name)
                    .and_then(|module| module.subdir_path(&self.ctx, "log-dir").ok())
                    .map(|base| format!(" (see {}/latest/{name})", base.display()))
                    .unwrap_or_default();
                error!("  {name}{log_hint}");
            }
        }

        if self.configure_failure_present(modules, &failed_names) {
            warn!(
                "A configure step failed for at least one module; this often means a missing \
                 build dependency. Consider installing your distribution's development packages \
                 for the failing module."
            );
        }

        // The most interesting failures, root causes first.
        let phases: HashMap<String, Phase> = failed_names
            .iter()
            .filter_map(|name| self.ctx.failed_phase_for(name).map(|p| (name.clone(), p)))
            .collect();
        let counts: HashMap<String, u64> = failed_names
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    self.ctx.state.get_u64(name, "failure-count").unwrap_or(0),
                )
            })
            .collect();
        let ranked = hints::sort_failures_in_debug_order(
            graph,
            hints::collect_failures(&failed_names, &phases, &counts),
        );
        error!("The most interesting failures, in order:");
        for failure in ranked.iter().take(5) {
            let phase = failure
                .phase
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            error!("  {} (failed during {phase})", failure.name);
        }
    }

    /// Whether any failing module left behind a configure-type log this
    /// run (cmake, configure, meson-setup), which suggests missing system
    /// build dependencies rather than broken code.
    fn configure_failure_present(&mut self, modules: &[Module], failed: &[String]) -> bool {
        for name in failed {
            let Some(module) = modules.iter().find(|module| module.name() == name) else {
                continue;
            };
            let Ok(base) = module.subdir_path(&self.ctx, "log-dir") else {
                continue;
            };
            let log_dir: PathBuf = self.ctx.log_dir_for(&base, Some(name));
            for log in ["cmake.log", "configure.log", "meson-setup.log"] {
                if log_dir.join(log).exists() {
                    return true;
                }
            }
        }
        false
    }
}

static LOCKFILE_FOR_SIGNALS: once_cell::sync::OnceCell<std::ffi::CString> =
    once_cell::sync::OnceCell::new();
static MAIN_PID: once_cell::sync::OnceCell<i32> = once_cell::sync::OnceCell::new();

/// On fatal signals the lock must be released before exiting with the
/// distinguished signal code. The handler only touches async-signal-safe
/// calls, and only the main process (not forked children inheriting the
/// handler) removes the lockfile.
fn install_fatal_signal_handlers(lockfile: &std::path::Path) {
    use signal_hook::consts::signal::{SIGABRT, SIGINT, SIGPIPE, SIGQUIT, SIGTERM};
    use std::os::unix::ffi::OsStrExt;

    let Ok(path) = std::ffi::CString::new(lockfile.as_os_str().as_bytes()) else {
        return;
    };
    let _ = LOCKFILE_FOR_SIGNALS.set(path);
    let _ = MAIN_PID.set(std::process::id() as i32);

    for signal in [SIGINT, SIGQUIT, SIGABRT, SIGTERM, SIGPIPE] {
        unsafe {
            let _ = signal_hook::low_level::register(signal, || {
                let is_main = MAIN_PID
                    .get()
                    .map(|pid| unsafe { libc::getpid() } == *pid)
                    .unwrap_or(false);
                if is_main {
                    if let Some(path) = LOCKFILE_FOR_SIGNALS.get() {
                        unsafe { libc::unlink(path.as_ptr()) };
                    }
                }
                unsafe { libc::_exit(i32::from(cliutil::EXIT_CODE_SIGNALLED)) }
            });
        }
    }
}

/// The program's top-level flow, returning the exit code.
pub fn run(args: cli::Args) -> Result<i32> {
    let mut app = Application::new(args)?;

    if app.metadata_only() {
        return Ok(0);
    }
    if app.wants_program_run() {
        return app.exec_program();
    }

    let (modules, graph) = app.generate_module_list()?;
    if modules.is_empty() {
        warn!("No modules to build.");
        return Ok(0);
    }

    if app.handle_queries(&modules, &graph)? {
        return Ok(0);
    }

    app.run_all_module_phases(modules, &graph)
}
