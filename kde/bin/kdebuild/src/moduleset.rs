// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A declarative grouping of modules sharing common options and a common
//! repository. Plain module-sets map each `use-modules` entry onto a
//! repository base URL; `kde-projects` sets expand through the project
//! database; `qt-projects` sets produce the single synthetic Qt
//! supermodule.

use tracing::{error, warn};

use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::metadata::projects::{project_path_matches_wildcard_search, FoundBy};
use crate::module::{Module, ScmKind};
use crate::options::{OptionValue, OptionsMap};
use crate::phase::PhaseList;

pub const KDE_PROJECT_ID: &str = "kde-projects";
pub const QT_PROJECT_ID: &str = "qt-projects";

/// Which expansion strategy a set uses, decided by its `repository`
/// designator once the declaration has been fully parsed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModuleSetKind {
    Plain,
    KdeProjects,
    QtProjects,
}

#[derive(Clone, Debug)]
pub struct ModuleSet {
    name: String,
    pub options: OptionsMap,
    phases: PhaseList,
    module_search_decls: Vec<String>,
    module_ignore_decls: Vec<String>,
    kind: ModuleSetKind,
    create_id: u32,
}

impl ModuleSet {
    pub fn new(ctx: &BuildContext, name: &str) -> Self {
        ModuleSet {
            name: name.to_string(),
            options: OptionsMap::new(),
            phases: ctx.phases.clone(),
            module_search_decls: Vec::new(),
            module_ignore_decls: Vec::new(),
            kind: ModuleSetKind::Plain,
            create_id: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ModuleSetKind {
        self.kind
    }

    pub fn create_id(&self) -> u32 {
        self.create_id
    }

    pub fn set_create_id(&mut self, id: u32) {
        self.create_id = id;
    }

    pub fn modules_to_find(&self) -> &[String] {
        &self.module_search_decls
    }

    pub fn set_modules_to_find(&mut self, decls: Vec<String>) {
        self.module_search_decls = decls;
    }

    /// Same as [`modules_to_find`](Self::modules_to_find) but stripped to
    /// bare module names (no paths, no `.git`).
    pub fn module_names_to_find(&self) -> Vec<String> {
        self.module_search_decls
            .iter()
            .map(|decl| {
                let decl = decl.trim_end_matches(".git");
                decl.rsplit('/').next().unwrap_or(decl).to_string()
            })
            .collect()
    }

    /// Handles module-set specific options; everything else goes to the
    /// common option store.
    pub fn set_option(&mut self, key: &str, value: OptionValue) -> Result<()> {
        match key {
            "use-modules" => {
                let modules: Vec<String> = value
                    .as_str()
                    .split_whitespace()
                    .map(|s| s.to_string())
                    .collect();
                if modules.is_empty() {
                    error!("No modules were selected for module-set {} in the use-modules entry.", self.name);
                    return Err(BuildError::config("Invalid use-modules"));
                }
                self.module_search_decls = modules;
                Ok(())
            }
            "ignore-modules" => {
                let modules: Vec<String> = value
                    .as_str()
                    .split_whitespace()
                    .map(|s| s.to_string())
                    .collect();
                if modules.is_empty() {
                    error!("No modules were selected for module-set {} in the ignore-modules entry.", self.name);
                    return Err(BuildError::config("Invalid ignore-modules"));
                }
                self.module_ignore_decls.extend(modules);
                Ok(())
            }
            _ => self.options.set(key, value),
        }
    }

    /// Materializes the concrete module-set variant once the `repository`
    /// option is known.
    pub fn finalize(&mut self) {
        self.kind = match self.options.get_str("repository").as_str() {
            KDE_PROJECT_ID => ModuleSetKind::KdeProjects,
            QT_PROJECT_ID => ModuleSetKind::QtProjects,
            _ => ModuleSetKind::Plain,
        };
    }

    /// Checks the set has a usable repository designator.
    pub fn validate(&self, ctx: &BuildContext) -> Result<()> {
        let name = if self.name.is_empty() { "unnamed" } else { &self.name };
        let selected_repo = self.options.get_str("repository");
        if selected_repo.is_empty() {
            error!(
                "There was no repository selected for the {name} module-set; a repository is \
                 needed to determine where to download the source code from. Most will want to \
                 use the kde-projects repository."
            );
            return Err(BuildError::config("Missing repository option"));
        }
        if selected_repo == KDE_PROJECT_ID || selected_repo == QT_PROJECT_ID {
            return Ok(());
        }
        let repo_set = ctx
            .get_option("git-repository-base")
            .and_then(|v| v.as_map().cloned())
            .unwrap_or_default();
        if !repo_set.contains_key(&selected_repo) {
            error!(
                "There is no repository assigned to {selected_repo} when assigning a module-set \
                 ({name}). These repositories are defined by git-repository-base in the global \
                 section of your configuration."
            );
            return Err(BuildError::config("Unknown repository base"));
        }
        Ok(())
    }

    /// Sets up common state on a module created from this set.
    fn initialize_new_module(&self, module: &mut Module, position: usize) -> Result<()> {
        module.set_module_set(&self.name);
        module.set_scm_kind(ScmKind::Git);
        module.phases_mut().reset_to(self.phases.phases().to_vec());
        for (key, value) in self.options.iter() {
            // The set's repository designator is replaced per module below.
            if key == "repository" {
                continue;
            }
            module.set_option(key, value.clone())?;
        }

        // Dependency-order tiebreaker: fall back to the order the user
        // declared modules in use-modules. Indirect entries sort at the
        // end of the module-set's reserved range.
        module.set_create_id(self.create_id + 1 + position as u32);
        Ok(())
    }

    /// Converts the set to its component modules. Call after options are
    /// read and (for kde-projects sets) build metadata is available.
    /// Modules ignored by this set are excluded.
    pub fn convert_to_modules(&self, ctx: &BuildContext) -> Result<Vec<Module>> {
        match self.kind {
            ModuleSetKind::Plain => self.convert_plain(ctx),
            ModuleSetKind::KdeProjects => self.convert_kde_projects(ctx),
            ModuleSetKind::QtProjects => self.convert_qt(ctx),
        }
    }

    fn convert_plain(&self, ctx: &BuildContext) -> Result<Vec<Module>> {
        if self.module_search_decls.is_empty() {
            warn!(
                "No modules were defined for the module-set {}; use the use-modules option to \
                 make it useful.",
                self.name
            );
        }

        let repo_key = self.options.get_str("repository");
        let repo_set = ctx
            .get_option("git-repository-base")
            .and_then(|v| v.as_map().cloned())
            .unwrap_or_default();
        let base = repo_set.get(&repo_key).ok_or_else(|| {
            BuildError::config(format!("Unknown repository base {repo_key}"))
        })?;

        let mut modules = Vec::new();
        for (position, module_item) in self.module_search_decls.iter().enumerate() {
            let module_name = module_item.trim_end_matches(".git");
            let mut module = Module::new(ctx, module_name);
            self.initialize_new_module(&mut module, position)?;
            module.set_option("repository", format!("{base}{module_item}").into())?;
            modules.push(module);
        }
        Ok(modules)
    }

    fn convert_kde_projects(&self, ctx: &BuildContext) -> Result<Vec<Module>> {
        let db = ctx.project_database()?;
        let use_inactive = ctx.get_option_bool("use-inactive-modules");

        let mut modules: Vec<Module> = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        for (position, search_decl) in self.module_search_decls.iter().enumerate() {
            let entries = db.modules_for_project(search_decl);
            if entries.is_empty() {
                return Err(BuildError::runtime(format!(
                    "{search_decl} doesn't match any modules."
                )));
            }
            for entry in entries {
                if !seen.insert(entry.name.clone()) {
                    continue;
                }
                if !entry.active && !use_inactive {
                    warn!(
                        "Skipping inactive module {}; set use-inactive-modules to build it anyway.",
                        entry.name
                    );
                    continue;
                }
                if self
                    .module_ignore_decls
                    .iter()
                    .any(|ignored| project_path_matches_wildcard_search(&entry.full_name, ignored))
                {
                    continue;
                }

                let mut module = Module::new(ctx, &entry.name);
                self.initialize_new_module(&mut module, position)?;
                module.set_scm_kind(ScmKind::KdeProject);
                module.set_option("repository", entry.repo.clone().into())?;
                module.set_option("#kde-project-path", entry.full_name.clone().into())?;
                module.set_option("#kde-repo-path", entry.repo_path.clone().into())?;
                module.set_option(
                    "#found-by",
                    match entry.found_by {
                        FoundBy::Direct => "direct".into(),
                        FoundBy::Wildcard => "wildcard".into(),
                    },
                )?;
                modules.push(module);
            }
        }

        if modules.is_empty() {
            return Err(BuildError::runtime(format!(
                "{} expanded to an empty list of modules!",
                if self.name.is_empty() { "module-set" } else { &self.name }
            )));
        }
        Ok(modules)
    }

    /// Qt's source is handled as a single unit: one module whose updater
    /// drives init-repository over the selected submodules.
    fn convert_qt(&self, ctx: &BuildContext) -> Result<Vec<Module>> {
        let mut module = Module::new(ctx, "Qt5");
        self.initialize_new_module(&mut module, 0)?;
        module.set_option(
            "repository",
            "https://invent.kde.org/qt/qt/qt5.git".into(),
        )?;
        module.set_scm_kind(ScmKind::Qt);

        // Convert the use-modules/ignore-modules entries into a form
        // suitable for init-repository's module-subset option.
        let mut entries: Vec<String> = self.module_search_decls.clone();
        entries.extend(self.module_ignore_decls.iter().map(|name| format!("-{name}")));
        module.set_option("use-qt5-modules", entries.join(" ").into())?;

        Ok(vec![module])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::projects::{ProjectDatabase, ProjectEntry};
    use pretty_assertions::assert_eq;

    fn ctx_with_base() -> BuildContext {
        let mut ctx = BuildContext::new();
        ctx.set_option(
            "git-repository-base",
            "myrepo https://example.org/git/".into(),
        )
        .unwrap();
        ctx
    }

    #[test]
    fn plain_set_expands_one_module_per_selector() {
        let ctx = ctx_with_base();
        let mut set = ModuleSet::new(&ctx, "my-set");
        set.set_option("repository", "myrepo".into()).unwrap();
        set.set_option("use-modules", "libfoo barapp.git".into()).unwrap();
        set.set_option("cmake-options", "-DWITH_X=ON".into()).unwrap();
        set.set_create_id(10);
        set.finalize();
        assert_eq!(set.kind(), ModuleSetKind::Plain);

        let modules = set.convert_to_modules(&ctx).unwrap();
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].name(), "libfoo");
        assert_eq!(
            modules[0].get_option_module("repository").unwrap().as_str(),
            "https://example.org/git/libfoo"
        );
        assert_eq!(modules[1].name(), "barapp");
        assert_eq!(
            modules[1].get_option_module("repository").unwrap().as_str(),
            "https://example.org/git/barapp.git"
        );
        // Set options flow down; creation ids land in the reserved range.
        assert_eq!(
            modules[0].get_option_module("cmake-options").unwrap().as_str(),
            "-DWITH_X=ON"
        );
        assert_eq!(modules[0].create_id(), 11);
        assert_eq!(modules[1].create_id(), 12);
        assert_eq!(modules[0].module_set(), Some("my-set"));
    }

    #[test]
    fn validation_rejects_unknown_base() {
        let ctx = ctx_with_base();
        let mut set = ModuleSet::new(&ctx, "bad");
        set.set_option("repository", "nosuchbase".into()).unwrap();
        assert!(set.validate(&ctx).unwrap_err().is_config());

        let mut empty = ModuleSet::new(&ctx, "empty");
        assert!(empty.validate(&ctx).unwrap_err().is_config());
        empty.set_option("repository", KDE_PROJECT_ID.into()).unwrap();
        assert!(empty.validate(&ctx).is_ok());
    }

    #[test]
    fn kde_projects_set_expands_from_database() {
        let mut ctx = BuildContext::new();
        let mk = |name: &str, full: &str, active: bool| ProjectEntry {
            name: name.to_string(),
            full_name: full.to_string(),
            repo: format!("kde:{name}.git"),
            repo_path: name.to_string(),
            active,
            found_by: FoundBy::Direct,
        };
        ctx.set_project_database(ProjectDatabase::from_entries(vec![
            mk("juk", "kde/kdemultimedia/juk", true),
            mk("dragon", "kde/kdemultimedia/dragon", true),
            mk("oldplayer", "kde/kdemultimedia/oldplayer", false),
        ]));

        let mut set = ModuleSet::new(&ctx, "multimedia");
        set.set_option("repository", KDE_PROJECT_ID.into()).unwrap();
        set.set_option("use-modules", "kdemultimedia".into()).unwrap();
        set.set_option("ignore-modules", "dragon".into()).unwrap();
        set.finalize();
        assert_eq!(set.kind(), ModuleSetKind::KdeProjects);

        let modules = set.convert_to_modules(&ctx).unwrap();
        let names: Vec<&str> = modules.iter().map(|m| m.name()).collect();
        // dragon ignored, oldplayer inactive.
        assert_eq!(names, vec!["juk"]);
        assert_eq!(modules[0].scm_kind(), ScmKind::KdeProject);
        assert_eq!(
            modules[0]
                .get_option_module("#kde-project-path")
                .unwrap()
                .as_str(),
            "kde/kdemultimedia/juk"
        );
    }

    #[test]
    fn qt_set_expands_to_single_synthetic_module() {
        let ctx = BuildContext::new();
        let mut set = ModuleSet::new(&ctx, "qt");
        set.set_option("repository", QT_PROJECT_ID.into()).unwrap();
        set.set_option("use-modules", "qtbase qtdeclarative".into()).unwrap();
        set.set_option("ignore-modules", "qtwebengine".into()).unwrap();
        set.finalize();

        let modules = set.convert_to_modules(&ctx).unwrap();
        assert_eq!(modules.len(), 1);
        let qt = &modules[0];
        assert_eq!(qt.name(), "Qt5");
        assert_eq!(qt.scm_kind(), ScmKind::Qt);
        assert_eq!(
            qt.get_option_module("use-qt5-modules").unwrap().as_str(),
            "qtbase qtdeclarative -qtwebengine"
        );
    }
}
