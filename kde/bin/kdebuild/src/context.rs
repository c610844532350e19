// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The build context: the `global` option scope, the queued environment
//! delta for child processes, the persistent state handle, run-wide log
//! directory management and the single-instance lock.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::os::unix::fs as unix_fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::error::{BuildError, Result};
use crate::metadata::branchgroup::BranchGroupResolver;
use crate::metadata::projects::ProjectDatabase;
use crate::options::{OptionValue, OptionsMap};
use crate::phase::{Phase, PhaseList};
use crate::state::PersistentState;

pub const LOCKFILE_NAME: &str = ".kdesrc-lock";
pub const PERSISTENT_FILE_NAME: &str = "kdesrc-build-data";
pub const RC_FILE_NAME: &str = "kdesrc-buildrc";

/// Option keys that merge-append the context value with the module value.
pub const APPEND_OPTIONS: &[&str] = &["cmake-options", "configure-flags", "cxxflags"];

/// Options that modules with a Qt build system do not inherit from the
/// context, since Qt's configure options rarely agree with the KDE ones.
pub const QT_COPY_OVERRIDES: &[&str] = &["branch", "configure-flags", "tag", "cxxflags"];

/// Keys that change a module's phase list instead of storing a value.
pub const PHASE_CHANGING_OPTIONS: &[&str] = &[
    "build-only",
    "install-only",
    "no-build",
    "no-install",
    "no-src",
    "no-tests",
    "src-only",
    "uninstall",
];

static DEFAULT_GLOBAL_OPTIONS: Lazy<Vec<(&'static str, OptionValue)>> = Lazy::new(|| {
    let home = home_dir();
    let home = home.to_string_lossy();
    let mut repo_bases = BTreeMap::new();
    repo_bases.insert(
        "qt6-copy".to_string(),
        "https://invent.kde.org/qt/qt/".to_string(),
    );
    vec![
        // Internal state, not exposed as cmdline options.
        ("filter-out-phases", "".into()),
        ("git-push-protocol", "git".into()),
        ("git-repository-base", OptionValue::Map(repo_bases)),
        ("module-definitions-dir", format!("{}/module-definitions", xdg_state_home().display()).into()),
        ("repository", "".into()),
        ("ssh-identity-file", "".into()),
        ("use-modules", "".into()),
        // Flags.
        ("async", true.into()),
        ("build-when-unchanged", true.into()),
        ("colorful-output", true.into()),
        ("compile-commands-export", true.into()),
        ("compile-commands-linking", false.into()),
        ("delete-my-patches", false.into()),
        ("disable-agent-check", false.into()),
        ("generate-vscode-project-config", false.into()),
        ("ignore-modules", "".into()),
        ("include-dependencies", true.into()),
        ("install-after-build", true.into()),
        ("niceness", "10".into()),
        ("pretend", "".into()),
        ("refresh-build", "".into()),
        ("run-tests", false.into()),
        ("stop-on-failure", true.into()),
        ("use-clean-install", false.into()),
        ("use-idle-io-priority", false.into()),
        ("use-inactive-modules", false.into()),
        // Options requiring a parameter.
        ("binpath", "".into()),
        ("branch", "".into()),
        ("branch-group", "".into()),
        ("build-dir", format!("{home}/kde/build").into()),
        ("cmake-generator", "".into()),
        ("cmake-options", "".into()),
        ("cmake-toolchain", "".into()),
        ("commit", "".into()),
        ("configure-flags", "".into()),
        ("custom-build-command", "".into()),
        ("cxxflags", "-pipe".into()),
        ("dest-dir", "${MODULE}".into()),
        ("directory-layout", "flat".into()),
        ("do-not-compile", "".into()),
        ("git-user", "".into()),
        ("http-proxy", "".into()),
        ("install-dir", format!("{home}/kde/usr").into()),
        ("libname", detect_libname().into()),
        ("libpath", "".into()),
        ("log-dir", format!("{home}/kde/log").into()),
        ("make-install-prefix", "".into()),
        ("make-options", "".into()),
        ("ninja-options", "".into()),
        ("num-cores", "".into()),
        ("num-cores-low-mem", "2".into()),
        ("override-build-system", "".into()),
        ("persistent-data-file", "".into()),
        ("qmake-options", "".into()),
        ("qt-install-dir", "".into()),
        ("remove-after-install", "none".into()),
        ("revision", "".into()),
        ("source-dir", format!("{home}/kde/src").into()),
        ("tag", "".into()),
        ("use-qt5-modules", "".into()),
        // Options without a parameter.
        ("build-system-only", "".into()),
        ("metadata-only", "".into()),
        ("reconfigure", "".into()),
    ]
});

pub fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/".to_string()))
}

pub fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

pub fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

// There doesn't seem to be a great way to get this from CMake easily, but
// if there's a real /usr/lib64 there will likely end up being an
// ${install-dir}/lib64 once installs are done.
fn detect_libname() -> &'static str {
    let lib64 = Path::new("/usr/lib64");
    if lib64.is_dir() && !lib64.is_symlink() {
        return "lib64";
    }
    if Path::new("/usr/lib/x86_64-linux-gnu").is_dir() {
        return "lib/x86_64-linux-gnu";
    }
    "lib"
}

/// Expands a leading tilde and resolves relative paths against the base.
pub fn expand_subdir_path(directory: &str, relative_base: &str) -> PathBuf {
    if let Some(rest) = directory.strip_prefix("~/") {
        return home_dir().join(rest);
    }
    if directory.starts_with('/') {
        return PathBuf::from(directory);
    }
    Path::new(relative_base).join(directory)
}

pub struct BuildContext {
    options: OptionsMap,
    pub phases: PhaseList,
    pub pretend: bool,
    pub state: PersistentState,

    env: BTreeMap<String, String>,
    rc_file: Option<PathBuf>,
    rc_file_override: Option<PathBuf>,
    /// Log path bases as expanded from `log-dir` mapped to the actual log
    /// dir used this run, with date and unique id added.
    log_paths: HashMap<PathBuf, PathBuf>,
    ignore_list: Vec<String>,
    /// Map from module names to the phase at which they failed.
    errors: HashMap<String, Phase>,
    projects_db: Option<ProjectDatabase>,
    branch_resolver: Option<BranchGroupResolver>,
}

impl Default for BuildContext {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildContext {
    pub fn new() -> Self {
        let mut options = OptionsMap::new();
        for (key, value) in DEFAULT_GLOBAL_OPTIONS.iter() {
            options.set(key, value.clone()).expect("default options are valid");
        }
        BuildContext {
            options,
            phases: PhaseList::default(),
            pretend: false,
            state: PersistentState::default(),
            env: BTreeMap::new(),
            rc_file: None,
            rc_file_override: None,
            log_paths: HashMap::new(),
            ignore_list: Vec::new(),
            errors: HashMap::new(),
            projects_db: None,
            branch_resolver: None,
        }
    }

    /// True for option keys a configuration file may set (the global table
    /// plus the phase-changing conveniences). Keys starting with `_` are
    /// user variables and always allowed.
    pub fn is_known_option(&self, key: &str) -> bool {
        key.starts_with('_')
            || self.options.has(key)
            || PHASE_CHANGING_OPTIONS.contains(&key)
            || key == "ignore-modules"
            || key == "use-modules"
    }

    pub fn options(&self) -> &OptionsMap {
        &self.options
    }

    pub fn get_option(&self, key: &str) -> Option<&OptionValue> {
        self.options.get(key)
    }

    pub fn get_option_str(&self, key: &str) -> String {
        self.options.get_str(key)
    }

    pub fn get_option_bool(&self, key: &str) -> bool {
        self.options.get_bool(key)
    }

    pub fn has_sticky_option(&self, key: &str) -> bool {
        self.options.has_sticky(key)
    }

    pub fn set_option(&mut self, key: &str, value: OptionValue) -> Result<()> {
        self.options.set(key, value)
    }

    pub fn merge_options_from(&mut self, other: &OptionsMap) -> Result<()> {
        self.options.merge_from(other)
    }

    // Environment handling.

    /// Clears the queued environment for the next subprocess batch.
    pub fn reset_environment(&mut self) {
        self.env.clear();
    }

    /// Queues an environment variable to apply for the next subprocess
    /// execution. The current process environment is never modified.
    pub fn queue_environment_variable(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            return;
        }
        debug!("\tQueueing {key} to be set to {value}");
        self.env.insert(key.to_string(), value.to_string());
    }

    /// Prepends to a path-style environment variable, starting from the
    /// queued value if one exists, otherwise the inherited one. Entries
    /// already present are not added again.
    pub fn prepend_environment_value(&mut self, name: &str, item: &str) {
        let current = self
            .env
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
            .unwrap_or_default();
        let mut parts: Vec<&str> = current.split(':').filter(|s| !s.is_empty()).collect();
        if parts.contains(&item) {
            debug!("\tNot prepending {item} to {name} as it is already present");
        } else {
            parts.insert(0, item);
        }
        let value = parts.join(":");
        self.queue_environment_variable(name, &value);
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    // Rc file handling.

    pub fn set_rc_file(&mut self, path: &Path) {
        self.rc_file_override = Some(path.to_path_buf());
    }

    pub fn rc_file(&self) -> Option<&Path> {
        self.rc_file.as_deref()
    }

    fn rc_search_paths(&self) -> Vec<PathBuf> {
        if let Some(path) = &self.rc_file_override {
            return vec![path.clone()];
        }
        vec![
            PathBuf::from(format!("./{RC_FILE_NAME}")),
            xdg_config_home().join(RC_FILE_NAME),
            home_dir().join(format!(".{RC_FILE_NAME}")),
        ]
    }

    /// Locates the rc-file per the search order and records it. Missing
    /// explicit `--rc-file` arguments are Config errors; a missing default
    /// configuration is a Runtime error with a pointer to the docs.
    pub fn locate_rc_file(&mut self) -> Result<PathBuf> {
        let candidates = self.rc_search_paths();
        for candidate in &candidates {
            if candidate.exists() {
                let absolute = candidate
                    .canonicalize()
                    .map_err(|err| BuildError::runtime(format!("{}: {err}", candidate.display())))?;
                self.rc_file = Some(absolute.clone());
                return Ok(absolute);
            }
        }
        if self.rc_file_override.is_some() {
            return Err(BuildError::config(format!(
                "Unable to open config file {}",
                candidates[0].display()
            )));
        }
        Err(BuildError::runtime(
            "No configuration file is present. kdebuild requires a configuration file to \
             select which modules to build; create a kdesrc-buildrc first.",
        ))
    }

    /// The directory holding the configuration file; used as the base for
    /// the lock file and (local-config) persistent data.
    pub fn base_config_directory(&self) -> Result<PathBuf> {
        let rc_file = self
            .rc_file
            .as_ref()
            .ok_or_else(|| BuildError::internal("base_config_directory before locate_rc_file"))?;
        Ok(rc_file
            .parent()
            .unwrap_or_else(|| Path::new("/"))
            .to_path_buf())
    }

    // Persistent state.

    pub fn persistent_option_file_name(&self) -> Result<PathBuf> {
        let configured = self.get_option_str("persistent-data-file");
        if !configured.is_empty() {
            let expanded = configured.replace('~', &home_dir().to_string_lossy());
            return Ok(PathBuf::from(expanded));
        }

        let config_dir = self.base_config_directory()?;
        let mut file = if config_dir == xdg_config_home() {
            xdg_state_home().join(PERSISTENT_FILE_NAME)
        } else {
            config_dir.join(format!(".{PERSISTENT_FILE_NAME}"))
        };

        // A custom --rc-file gets its own data file so that differently
        // configured runs don't stomp each other's state.
        if let Some(rc_path) = &self.rc_file_override {
            if let Some(name) = rc_path.file_name() {
                if name != RC_FILE_NAME {
                    file = PathBuf::from(format!(
                        "{}-{}",
                        file.display(),
                        name.to_string_lossy()
                    ));
                }
            }
        }

        let legacy = home_dir().join(format!(".{PERSISTENT_FILE_NAME}"));
        if !file.exists() && legacy.exists() {
            warn!(
                "The global data file is stored in the old location ({}); please move it to {}",
                legacy.display(),
                file.display()
            );
            return Ok(legacy);
        }
        Ok(file)
    }

    pub fn load_persistent_options(&mut self) -> Result<()> {
        let path = self.persistent_option_file_name()?;
        self.state = PersistentState::load(&path);
        Ok(())
    }

    pub fn store_persistent_options(&self) -> Result<()> {
        if self.pretend {
            return Ok(());
        }
        self.state.store()
    }

    // Paths.

    /// Retrieves a subdirectory path option (`build-dir`, `log-dir`, ...)
    /// with tilde expansion and relative-path handling against source-dir.
    pub fn subdir_path(&self, option: &str) -> Result<PathBuf> {
        let directory = self.get_option_str(option);
        if directory.is_empty() {
            return Err(BuildError::config(format!(
                "Reading option for {option} gave empty directory!"
            )));
        }
        if option == "source-dir" || directory.starts_with('/') || directory.starts_with('~') {
            if let Some(rest) = directory.strip_prefix("~/") {
                return Ok(home_dir().join(rest));
            }
            return Ok(PathBuf::from(directory));
        }
        let source_dir = self.get_option_str("source-dir");
        Ok(expand_subdir_path(&directory, &source_dir))
    }

    pub fn source_dir(&self) -> Result<PathBuf> {
        self.subdir_path("source-dir")
    }

    // Log directories.

    /// Returns (creating if needed) the timestamped log directory used this
    /// run for the given base log path. Modules append their name; global
    /// logs go to the base directly.
    pub fn log_dir_for(&mut self, base_log_path: &Path, module_name: Option<&str>) -> PathBuf {
        if !self.log_paths.contains_key(base_log_path) {
            let date = chrono::Local::now().format("%F").to_string();
            let mut id = 1u32;
            let mut candidate = base_log_path.join(format!("{date}-{id:02}"));
            while candidate.exists() {
                id += 1;
                candidate = base_log_path.join(format!("{date}-{id:02}"));
            }
            self.log_paths
                .insert(base_log_path.to_path_buf(), candidate);
        }
        let mut dir = self.log_paths[base_log_path].clone();
        if let Some(name) = module_name {
            dir.push(name);
        }
        dir
    }

    /// Full path for a new log file; also remakes the `latest` symlinks.
    /// Use when actually creating a log.
    pub fn log_path_for(
        &mut self,
        base_log_path: &Path,
        module_name: &str,
        file: &str,
    ) -> Result<PathBuf> {
        let log_dir = self.log_dir_for(base_log_path, Some(module_name));
        if !self.pretend {
            fs::create_dir_all(&log_dir)?;

            let latest_path = base_log_path.join("latest");
            fs::create_dir_all(&latest_path)?;
            remake_symlink(&log_dir, &latest_path.join(module_name))?;

            let by_phase = base_log_path.join("latest-by-phase").join(module_name);
            fs::create_dir_all(&by_phase)?;
            remake_symlink(&log_dir.join(file), &by_phase.join(file))?;
        }
        Ok(log_dir.join(file))
    }

    // Ignore list and failure accounting.

    pub fn add_to_ignore_list(&mut self, items: impl IntoIterator<Item = String>) {
        self.ignore_list.extend(items);
    }

    /// Whether a module's project path matches the ignore list. Partial
    /// paths match on path-component boundaries.
    pub fn is_ignored(&self, project_path: &str) -> bool {
        self.ignore_list.iter().any(|item| {
            let item = item.trim_matches('/');
            if item.is_empty() {
                return false;
            }
            project_path == item
                || project_path.ends_with(&format!("/{item}"))
                || project_path.starts_with(&format!("{item}/"))
                || project_path.contains(&format!("/{item}/"))
        })
    }

    pub fn mark_module_phase_failed(&mut self, phase: Phase, module_name: &str) {
        self.errors.insert(module_name.to_string(), phase);
    }

    pub fn failed_phase_for(&self, module_name: &str) -> Option<Phase> {
        self.errors.get(module_name).copied()
    }

    pub fn failed_module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.errors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_failures(&self) -> bool {
        !self.errors.is_empty()
    }

    // Metadata accessors.

    pub fn set_project_database(&mut self, db: ProjectDatabase) {
        self.projects_db = Some(db);
    }

    pub fn project_database(&self) -> Result<&ProjectDatabase> {
        self.projects_db.as_ref().ok_or_else(|| {
            BuildError::runtime("kde-projects repository information could not be downloaded")
        })
    }

    pub fn has_project_database(&self) -> bool {
        self.projects_db.is_some()
    }

    pub fn set_branch_group_resolver(&mut self, resolver: BranchGroupResolver) {
        self.branch_resolver = Some(resolver);
    }

    pub fn branch_group_resolver(&self) -> Result<&BranchGroupResolver> {
        self.branch_resolver.as_ref().ok_or_else(|| {
            BuildError::internal("Tried to use branch-group, but needed data wasn't loaded!")
        })
    }

    /// The effective branch group for modules; the historical default is
    /// used when the option is unset.
    pub fn effective_branch_group(&self) -> String {
        let group = self.get_option_str("branch-group");
        if group.is_empty() {
            "kf5-qt5".to_string()
        } else {
            group
        }
    }

    // Locking.

    pub fn lockfile_path(&self) -> Result<PathBuf> {
        Ok(self.base_config_directory()?.join(LOCKFILE_NAME))
    }

    /// Tries to take the per-configuration lock. Returns false only when
    /// another live instance holds it and the user declined to proceed.
    pub fn take_lock(&self) -> Result<bool> {
        let lockfile = self.lockfile_path()?;

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lockfile)
        {
            Ok(mut file) => {
                write!(file, "{}", std::process::id())?;
                return Ok(true);
            }
            Err(err) if err.kind() != std::io::ErrorKind::AlreadyExists => {
                warn!(
                    "Error while creating lock file {}: {err}; continuing",
                    lockfile.display()
                );
                return Ok(true);
            }
            Err(_) => {}
        }

        // Lockfile already exists; see if its owner is still alive.
        let pid_text = fs::read_to_string(&lockfile).unwrap_or_default();
        if let Ok(pid) = pid_text.trim().parse::<i32>() {
            let alive =
                nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
            if alive {
                eprint!("kdebuild appears to be running. (Q)uit, (P)roceed anyways?: ");
                let mut choice = String::new();
                std::io::stdin().read_line(&mut choice).ok();
                if !choice.trim().eq_ignore_ascii_case("p") {
                    eprintln!("kdebuild run canceled.");
                    return Ok(false);
                }
                warn!("kdebuild run in progress by user request.");
                return Ok(true);
            }
        }

        warn!("stale kdebuild lockfile found, deleting.");
        let _ = fs::remove_file(&lockfile);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lockfile)
        {
            Ok(mut file) => {
                write!(file, "{}", std::process::id())?;
            }
            Err(_) => warn!("Still unable to lock {}, proceeding anyways", lockfile.display()),
        }
        Ok(true)
    }

    pub fn close_lock(&self) {
        if let Ok(lockfile) = self.lockfile_path() {
            if let Err(err) = fs::remove_file(&lockfile) {
                warn!("Failed to close lock: {err}");
            }
        }
    }

    /// Process niceness and the http proxy pass-through, applied once at
    /// startup.
    pub fn setup_operating_environment(&mut self) {
        let niceness: i32 = self.get_option_str("niceness").parse().unwrap_or(0);
        if niceness != 0 {
            unsafe {
                libc::nice(niceness);
            }
        }
        if self.get_option_bool("use-idle-io-priority") {
            let pid = std::process::id().to_string();
            let status = std::process::Command::new("ionice")
                .args(["-c3", "-p", pid.as_str()])
                .status();
            if !matches!(status, Ok(s) if s.success()) {
                warn!("Unable to lower I/O priority, continuing...");
            }
        }
        let proxy = self.get_option_str("http-proxy");
        if !proxy.is_empty() && std::env::var("http_proxy").is_err() {
            self.queue_environment_variable("http_proxy", &proxy);
        }
    }
}

pub fn remake_symlink(target: &Path, link: &Path) -> Result<()> {
    if link.is_symlink() || link.exists() {
        let _ = fs::remove_file(link);
    }
    unix_fs::symlink(target, link)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_seeded() {
        let ctx = BuildContext::new();
        assert!(ctx.get_option_bool("include-dependencies"));
        assert!(ctx.get_option_bool("stop-on-failure"));
        assert_eq!(ctx.get_option_str("cxxflags"), "-pipe");
        assert_eq!(ctx.get_option_str("dest-dir"), "${MODULE}");
        let bases = ctx.get_option("git-repository-base").unwrap().as_map().unwrap();
        assert!(bases.contains_key("qt6-copy"));
    }

    #[test]
    fn unknown_options_are_rejected_known_are_not() {
        let ctx = BuildContext::new();
        assert!(ctx.is_known_option("cmake-options"));
        assert!(ctx.is_known_option("no-src"));
        assert!(ctx.is_known_option("_my-variable"));
        assert!(!ctx.is_known_option("cmake-optionz"));
    }

    #[test]
    fn prepend_environment_value_dedups() {
        let mut ctx = BuildContext::new();
        ctx.queue_environment_variable("CMAKE_PREFIX_PATH", "/opt/kde");
        ctx.prepend_environment_value("CMAKE_PREFIX_PATH", "/opt/qt");
        ctx.prepend_environment_value("CMAKE_PREFIX_PATH", "/opt/qt");
        assert_eq!(
            ctx.environment().get("CMAKE_PREFIX_PATH").unwrap(),
            "/opt/qt:/opt/kde"
        );
    }

    #[test]
    fn ignore_list_matches_path_components() {
        let mut ctx = BuildContext::new();
        ctx.add_to_ignore_list(["extragear/utils/kdesrc-build".to_string(), "juk".to_string()]);
        assert!(ctx.is_ignored("extragear/utils/kdesrc-build"));
        assert!(ctx.is_ignored("kde/kdemultimedia/juk"));
        assert!(!ctx.is_ignored("kde/kdemultimedia/jukebox"));
    }

    #[test]
    fn effective_branch_group_default() {
        let mut ctx = BuildContext::new();
        assert_eq!(ctx.effective_branch_group(), "kf5-qt5");
        ctx.set_option("branch-group", "kf6-qt6".into()).unwrap();
        assert_eq!(ctx.effective_branch_group(), "kf6-qt6");
    }
}
