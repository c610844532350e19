// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Resolution of user-supplied selectors into Modules, with module-set
//! expansion and layered option application (module declaration, deferred
//! options blocks, command-line overrides).
//!
//! Selectors fall into three cases: (1) directly named and defined
//! modules or module-sets, (2) names referenced in a use-modules entry of
//! a set but not yet expanded, and (3) indirect modules that only exist in
//! the project metadata and are found once sets are fully expanded.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::module::{Module, ScmKind};
use crate::moduleset::{ModuleSet, KDE_PROJECT_ID};
use crate::options::OptionValue;
use crate::rcfile::{ConfigReadResult, Declaration, DeferredOptions};

#[derive(Clone, Debug)]
enum DeclOrder {
    Module(String),
    Set(usize),
}

#[derive(Clone, Debug, Default)]
struct DeferredForModule {
    options: Vec<(String, OptionValue)>,
    entry_num: u32,
}

#[derive(Debug, Default)]
pub struct ModuleResolver {
    /// Pending command-line options: the `global` key plus per-module maps.
    cmdline_options: BTreeMap<String, Vec<(String, OptionValue)>>,
    /// Fully-distributed `options` blocks, keyed by module name.
    deferred_options: BTreeMap<String, DeferredForModule>,
    ignored_selectors: Vec<String>,

    /// Modules available by name: declared directly, or materialized out
    /// of a module-set.
    defined_modules: BTreeMap<String, Module>,
    module_sets: Vec<ModuleSet>,
    expanded_sets: BTreeSet<usize>,
    set_by_name: BTreeMap<String, usize>,
    /// use-modules mentions mapped to their origin set.
    referenced_modules: BTreeMap<String, usize>,
    declaration_order: Vec<DeclOrder>,
}

impl ModuleResolver {
    pub fn new() -> Self {
        ModuleResolver::default()
    }

    pub fn set_cmdline_options(
        &mut self,
        options: BTreeMap<String, Vec<(String, OptionValue)>>,
    ) {
        self.cmdline_options = options;
    }

    pub fn set_ignored_selectors(&mut self, selectors: Vec<String>) {
        self.ignored_selectors = selectors;
    }

    /// Declares the modules and module-sets known from the rc-file.
    pub fn set_input(&mut self, config: &ConfigReadResult) {
        for declaration in &config.declarations {
            match declaration {
                Declaration::Module(module) => {
                    self.declaration_order
                        .push(DeclOrder::Module(module.name().to_string()));
                    self.defined_modules
                        .insert(module.name().to_string(), module.clone());
                }
                Declaration::ModuleSet(set) => {
                    let index = self.module_sets.len();
                    self.module_sets.push(set.clone());
                    self.declaration_order.push(DeclOrder::Set(index));
                    self.set_by_name.insert(set.name().to_string(), index);
                    for name in set.module_names_to_find() {
                        self.referenced_modules.insert(name, index);
                    }
                }
            }
        }
    }

    /// Distributes the deferred `options` blocks onto module names. A
    /// block carrying both `repository kde-projects` and `use-modules` is
    /// a module-set-level override, distributed (through the project
    /// database) to each matching module first, so that single-module
    /// blocks can still override it.
    pub fn set_deferred_options(
        &mut self,
        ctx: &BuildContext,
        deferred: &[DeferredOptions],
    ) -> Result<()> {
        let mut final_opts: BTreeMap<String, DeferredForModule> = BTreeMap::new();

        let is_set_level = |entry: &DeferredOptions| {
            entry
                .options
                .iter()
                .any(|(key, value)| key == "repository" && value.as_str() == KDE_PROJECT_ID)
                && entry.options.iter().any(|(key, _)| key == "use-modules")
        };

        for entry in deferred.iter().filter(|entry| is_set_level(entry)) {
            let use_modules = entry
                .options
                .iter()
                .find(|(key, _)| key == "use-modules")
                .map(|(_, value)| value.as_str().into_owned())
                .unwrap_or_default();
            let filtered: Vec<(String, OptionValue)> = entry
                .options
                .iter()
                .filter(|(key, _)| key != "repository" && key != "use-modules")
                .cloned()
                .collect();

            let db = ctx.project_database()?;
            for selector in use_modules.split_whitespace() {
                for project in db.modules_for_project(selector) {
                    final_opts
                        .entry(project.name.clone())
                        .or_insert_with(|| DeferredForModule {
                            options: filtered.clone(),
                            entry_num: entry.entry_num,
                        });
                }
            }
        }

        // Second pass: single-module options blocks overlay on top.
        for entry in deferred.iter().filter(|entry| !is_set_level(entry)) {
            let slot = final_opts.entry(entry.name.clone()).or_default();
            for (key, value) in &entry.options {
                slot.options.retain(|(existing, _)| existing != key);
                slot.options.push((key.clone(), value.clone()));
            }
            slot.entry_num = entry.entry_num;
        }

        self.deferred_options = final_opts;
        Ok(())
    }

    /// Applies deferred and command-line options to a module, in layering
    /// order.
    fn apply_options_to_module(&self, module: &mut Module) -> Result<()> {
        if let Some(deferred) = self.deferred_options.get(module.name()) {
            let module_entry: u32 = module
                .get_option_module("#entry_num")
                .map(|v| v.as_str().parse().unwrap_or(0))
                .unwrap_or(0);
            for (key, value) in &deferred.options {
                // The module's own options were read in later, so they
                // should not be overridden by this block.
                if module_entry > deferred.entry_num && module.options.has(key) {
                    continue;
                }
                module.set_option(key, value.clone())?;
            }
        }

        let module_args: Vec<(String, OptionValue)> = self
            .cmdline_options
            .get("global")
            .into_iter()
            .flatten()
            .chain(self.cmdline_options.get(module.name()).into_iter().flatten())
            .cloned()
            .collect();
        for (key, value) in module_args {
            // Remove anything that would interfere with the command-line
            // argument (e.g. append semantics).
            module.options.remove(&key);
            module.set_option(&key, value)?;
        }
        Ok(())
    }

    fn apply_options_to_set(&self, set: &mut ModuleSet) -> Result<()> {
        if let Some(deferred) = self.deferred_options.get(set.name()) {
            for (key, value) in &deferred.options {
                set.set_option(key, value.clone())?;
            }
        }
        let set_args: Vec<(String, OptionValue)> = self
            .cmdline_options
            .get("global")
            .into_iter()
            .flatten()
            .chain(self.cmdline_options.get(set.name()).into_iter().flatten())
            .cloned()
            .collect();
        for (key, value) in set_args {
            set.options.remove(&key);
            set.set_option(&key, value)?;
        }
        Ok(())
    }

    /// Expands one module-set, registering the resulting Modules into the
    /// defined-modules table and dropping its use-modules references.
    fn expand_single_module_set(
        &mut self,
        ctx: &BuildContext,
        set_index: usize,
    ) -> Result<Vec<Module>> {
        let mut set = self.module_sets[set_index].clone();
        self.apply_options_to_set(&mut set)?;

        let mut modules = set.convert_to_modules(ctx)?;
        if modules.is_empty() {
            return Err(BuildError::runtime(format!(
                "{} expanded to an empty list of modules!",
                set.name()
            )));
        }
        let selected_reason = format!("partial-expansion:{}", set.name());
        for module in &mut modules {
            module.set_option("#selected-by", selected_reason.clone().into())?;
            self.apply_options_to_module(module)?;
        }

        for module in &modules {
            self.defined_modules
                .insert(module.name().to_string(), module.clone());
        }
        self.referenced_modules
            .retain(|_, origin| *origin != set_index);
        self.expanded_sets.insert(set_index);
        Ok(modules)
    }

    fn expand_all_unexpanded_module_sets(&mut self, ctx: &BuildContext) -> Result<()> {
        let mut unexpanded: Vec<usize> = self
            .referenced_modules
            .values()
            .copied()
            .collect::<BTreeSet<usize>>()
            .into_iter()
            .collect();
        unexpanded.retain(|index| !self.expanded_sets.contains(index));
        unexpanded.sort_by_key(|index| self.module_sets[*index].name().to_string());
        for index in unexpanded {
            self.expand_single_module_set(ctx, index)?;
        }
        Ok(())
    }

    /// Expands a one-off kde-projects set for a bare name (the `+selector`
    /// form and the best-guess fallback).
    fn expand_adhoc_kde_set(
        &mut self,
        ctx: &BuildContext,
        name: &str,
        set_name: &str,
        include_deps: bool,
    ) -> Result<Vec<Module>> {
        let mut set = ModuleSet::new(ctx, set_name);
        set.set_option("repository", KDE_PROJECT_ID.into())?;
        set.set_modules_to_find(vec![name.to_string()]);
        set.finalize();
        self.apply_options_to_set(&mut set)?;

        let mut modules = set.convert_to_modules(ctx)?;
        for module in &mut modules {
            module.set_option("#include-dependencies", include_deps.into())?;
            self.apply_options_to_module(module)?;
            self.defined_modules
                .insert(module.name().to_string(), module.clone());
        }
        Ok(modules)
    }

    fn cmdline_include_dependencies(&self, ctx: &BuildContext) -> bool {
        self.cmdline_options
            .get("global")
            .and_then(|options| {
                options
                    .iter()
                    .find(|(key, _)| key == "include-dependencies")
                    .map(|(_, value)| value.is_true())
            })
            .unwrap_or_else(|| ctx.get_option_bool("include-dependencies"))
    }

    /// Determines the most appropriate modules for one selector.
    fn resolve_single_selector(
        &mut self,
        ctx: &BuildContext,
        selector: &str,
    ) -> Result<Vec<Module>> {
        // A leading '+' forces treatment as a kde-projects module.
        let forced_to_kde_project = selector.starts_with('+');
        let selector_name = selector.trim_start_matches('+');
        let including_deps = self.cmdline_include_dependencies(ctx);

        // Case 2: referenced by a use-modules entry but not yet expanded.
        // Checked first since expansion updates the defined-modules table.
        if !self.defined_modules.contains_key(selector_name) {
            if let Some(set_index) = self.referenced_modules.get(selector_name).copied() {
                let mut expansion = self.expand_single_module_set(ctx, set_index)?;
                if !including_deps {
                    for module in &mut expansion {
                        module.set_option("include-dependencies", false.into())?;
                    }
                    for module in expansion.iter() {
                        self.defined_modules
                            .insert(module.name().to_string(), module.clone());
                    }
                }

                // If the selector doesn't match a name exactly it probably
                // matched a wildcard prefix (e.g. a project path
                // component); in that case the whole expansion is wanted.
                if let Some(module) = self.defined_modules.get_mut(selector_name) {
                    module.set_option("#selected-by", "name".into())?;
                    return Ok(vec![module.clone()]);
                }
                return Ok(expansion);
            }
        }

        // Case 1: directly defined module or module-set.
        if self.defined_modules.contains_key(selector_name) {
            let module = self.defined_modules.get_mut(selector_name).unwrap();
            module.set_option("#selected-by", "name".into())?;
            if !including_deps {
                // Modules were manually selected on the command line, so
                // ignore module-based include-dependencies unless it was
                // also set on the command line.
                module.set_option("#include-dependencies", false.into())?;
            }
            let mut module = module.clone();
            self.apply_options_to_module(&mut module)?;
            return Ok(vec![module]);
        }
        if let Some(set_index) = self.set_by_name.get(selector_name).copied() {
            return self.expand_single_module_set(ctx, set_index);
        }

        if forced_to_kde_project {
            // Just assume it's a kde-projects module and expand away.
            return self.expand_adhoc_kde_set(
                ctx,
                selector_name,
                "forced_to_kde_project",
                including_deps,
            );
        }

        // Case 3: no obvious source; guess a kde-projects module and
        // reconcile after full expansion.
        let mut module = Module::new(ctx, selector_name);
        module.set_scm_kind(ScmKind::KdeProject);
        module.set_option("#guessed-kde-project", true.into())?;
        module.set_option("#selected-by", "initial-guess".into())?;
        module.set_option("#include-dependencies", including_deps.into())?;
        self.apply_options_to_module(&mut module)?;
        Ok(vec![module])
    }

    /// Replaces guessed modules with real ones where the rc-file's
    /// module-sets (even implicitly) can source them; remaining guesses go
    /// through the project database.
    fn resolve_guessed_modules(
        &mut self,
        ctx: &BuildContext,
        modules: Vec<Module>,
    ) -> Result<Vec<Module>> {
        let any_guessed = modules.iter().any(|module| {
            module
                .get_option_module("#guessed-kde-project")
                .map(|v| v.is_true())
                .unwrap_or(false)
        });
        if !any_guessed {
            return Ok(modules);
        }

        self.expand_all_unexpanded_module_sets(ctx)?;

        let mut results = Vec::new();
        for module in modules {
            let guessed = module
                .get_option_module("#guessed-kde-project")
                .map(|v| v.is_true())
                .unwrap_or(false);
            if !guessed {
                results.push(module);
                continue;
            }

            if let Some(known) = self.defined_modules.get(module.name()) {
                debug!("Guessed module {} found in rc-file module-sets", module.name());
                results.push(known.clone());
                continue;
            }

            let include_deps = module
                .get_option_module("#include-dependencies")
                .map(|v| v.is_true())
                .unwrap_or(true);
            let name = module.name().to_string();
            let expansion =
                self.expand_adhoc_kde_set(ctx, &name, "guessed_from_cmdline", include_deps)?;
            if expansion.is_empty() {
                return Err(BuildError::runtime(format!(
                    "{name} doesn't match any modules."
                )));
            }
            results.extend(expansion);
        }
        Ok(results)
    }

    /// Resolves the given selectors into Modules with fully merged
    /// options, in approximately the input order (module-set expansions
    /// come out in expansion order).
    pub fn resolve_selectors_into_modules(
        &mut self,
        ctx: &BuildContext,
        selectors: &[String],
    ) -> Result<Vec<Module>> {
        let mut output = Vec::new();
        for selector in selectors {
            if self.ignored_selectors.contains(selector) {
                continue;
            }
            output.extend(self.resolve_single_selector(ctx, selector)?);
        }
        self.resolve_guessed_modules(ctx, output)
    }

    /// With no selectors, the build list is every module implied by the
    /// configuration, in declaration order.
    pub fn expand_all_declarations(&mut self, ctx: &BuildContext) -> Result<Vec<Module>> {
        let mut output = Vec::new();
        for decl in self.declaration_order.clone() {
            match decl {
                DeclOrder::Module(name) => {
                    let mut module = self.defined_modules[&name].clone();
                    self.apply_options_to_module(&mut module)?;
                    self.defined_modules.insert(name, module.clone());
                    output.push(module);
                }
                DeclOrder::Set(index) => {
                    if !self.expanded_sets.contains(&index) {
                        output.extend(self.expand_single_module_set(ctx, index)?);
                    }
                }
            }
        }
        Ok(output)
    }

    /// Returns the named module if it exists anywhere in the
    /// configuration or the project database, without guessing and
    /// without raising errors. Used as the module factory for dependency
    /// resolution.
    pub fn resolve_module_if_present(
        &mut self,
        ctx: &BuildContext,
        name: &str,
    ) -> Option<Module> {
        if !self.referenced_modules.is_empty() {
            let _ = self.expand_all_unexpanded_module_sets(ctx);
        }
        if !self.defined_modules.contains_key(name) {
            let including_deps = self.cmdline_include_dependencies(ctx);
            let _ = self.expand_adhoc_kde_set(ctx, name, "forced_to_kde_project", including_deps);
        }
        self.defined_modules.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::projects::{FoundBy, ProjectDatabase, ProjectEntry};
    use crate::rcfile::ConfigReader;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::tempdir;

    fn project(name: &str, full: &str) -> ProjectEntry {
        ProjectEntry {
            name: name.to_string(),
            full_name: full.to_string(),
            repo: format!("kde:{name}.git"),
            repo_path: name.to_string(),
            active: true,
            found_by: FoundBy::Direct,
        }
    }

    fn setup(content: &str) -> (BuildContext, ModuleResolver) {
        let dir = tempdir().unwrap();
        let rcfile = dir.path().join("kdesrc-buildrc");
        let mut file = std::fs::File::create(&rcfile).unwrap();
        file.write_all(content.as_bytes()).unwrap();

        let mut ctx = BuildContext::new();
        ctx.set_project_database(ProjectDatabase::from_entries(vec![
            project("juk", "kde/kdemultimedia/juk"),
            project("dragon", "kde/kdemultimedia/dragon"),
            project("kcalc", "kde/kdeutils/kcalc"),
        ]));
        let config = ConfigReader::new()
            .read_configuration(&mut ctx, &rcfile, &[])
            .unwrap();

        let mut resolver = ModuleResolver::new();
        resolver.set_input(&config);
        resolver.set_deferred_options(&ctx, &config.deferred).unwrap();
        (ctx, resolver)
    }

    const BASIC_RC: &str = "global\n\
        \tgit-repository-base extra https://example.org/\n\
        end global\n\
        module taglib\n\
        \trepository https://example.org/taglib.git\n\
        end module\n\
        module-set multimedia\n\
        \trepository kde-projects\n\
        \tuse-modules juk dragon\n\
        \tcmake-options -DSET=1\n\
        end module-set\n\
        options juk\n\
        \tcxxflags -g3 -Og\n\
        end options\n";

    #[test]
    fn empty_selector_list_resolves_to_nothing() {
        let (ctx, mut resolver) = setup(BASIC_RC);
        let modules = resolver.resolve_selectors_into_modules(&ctx, &[]).unwrap();
        assert!(modules.is_empty());
    }

    #[test]
    fn declared_module_resolves_by_name() {
        let (ctx, mut resolver) = setup(BASIC_RC);
        let modules = resolver
            .resolve_selectors_into_modules(&ctx, &["taglib".to_string()])
            .unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].name(), "taglib");
        assert_eq!(
            modules[0].get_option_module("#selected-by").unwrap().as_str(),
            "name"
        );
    }

    #[test]
    fn referenced_module_expands_its_set() {
        let (ctx, mut resolver) = setup(BASIC_RC);
        let modules = resolver
            .resolve_selectors_into_modules(&ctx, &["juk".to_string()])
            .unwrap();
        assert_eq!(modules.len(), 1);
        let juk = &modules[0];
        assert_eq!(juk.name(), "juk");
        // The set's options flowed in, and the deferred block overlays.
        assert_eq!(
            juk.get_option_module("cmake-options").unwrap().as_str(),
            "-DSET=1"
        );
        assert_eq!(juk.get_option_module("cxxflags").unwrap().as_str(), "-g3 -Og");
        assert_eq!(juk.module_set(), Some("multimedia"));
    }

    #[test]
    fn set_name_expands_all_members() {
        let (ctx, mut resolver) = setup(BASIC_RC);
        let modules = resolver
            .resolve_selectors_into_modules(&ctx, &["multimedia".to_string()])
            .unwrap();
        let mut names: Vec<&str> = modules.iter().map(|m| m.name()).collect();
        names.sort();
        assert_eq!(names, vec!["dragon", "juk"]);
    }

    #[test]
    fn guessed_module_resolves_from_project_database() {
        let (ctx, mut resolver) = setup(BASIC_RC);
        let modules = resolver
            .resolve_selectors_into_modules(&ctx, &["kcalc".to_string()])
            .unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].name(), "kcalc");
        assert_eq!(modules[0].scm_kind(), ScmKind::KdeProject);
    }

    #[test]
    fn unknown_selector_is_an_error() {
        let (ctx, mut resolver) = setup(BASIC_RC);
        let err = resolver
            .resolve_selectors_into_modules(&ctx, &["no-such-module".to_string()])
            .unwrap_err();
        assert!(matches!(err, BuildError::Runtime(_)));
    }

    #[test]
    fn ignored_selectors_are_skipped() {
        let (ctx, mut resolver) = setup(BASIC_RC);
        resolver.set_ignored_selectors(vec!["taglib".to_string()]);
        let modules = resolver
            .resolve_selectors_into_modules(&ctx, &["taglib".to_string()])
            .unwrap();
        assert!(modules.is_empty());
    }

    #[test]
    fn expand_all_preserves_declaration_order() {
        let (ctx, mut resolver) = setup(BASIC_RC);
        let modules = resolver.expand_all_declarations(&ctx).unwrap();
        let names: Vec<&str> = modules.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["taglib", "juk", "dragon"]);
    }

    #[test]
    fn cmdline_options_override_everything() {
        let (ctx, mut resolver) = setup(BASIC_RC);
        let mut cmdline = BTreeMap::new();
        cmdline.insert(
            "juk".to_string(),
            vec![("cxxflags".to_string(), OptionValue::Str("-O0".to_string()))],
        );
        resolver.set_cmdline_options(cmdline);
        let modules = resolver
            .resolve_selectors_into_modules(&ctx, &["juk".to_string()])
            .unwrap();
        assert_eq!(modules[0].get_option_module("cxxflags").unwrap().as_str(), "-O0");
    }

    #[test]
    fn factory_lookup_finds_set_members_without_guessing() {
        let (ctx, mut resolver) = setup(BASIC_RC);
        let module = resolver.resolve_module_if_present(&ctx, "dragon").unwrap();
        assert_eq!(module.name(), "dragon");
        assert!(resolver.resolve_module_if_present(&ctx, "not-a-module").is_none());
    }
}
