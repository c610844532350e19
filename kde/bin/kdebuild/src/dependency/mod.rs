// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Resolves dependencies between modules. Each "module" from this
//! resolver's perspective is a full project path as given by the project
//! database (e.g. `kde/kdemultimedia/juk`); the infrastructure guarantees
//! full paths map to unique short names.

pub mod hints;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::module::Module;
use crate::updater::git::{self, CheckoutKind};

static DEPENDENCY_ATOM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        ^\s*
        ([^\[:\s]+)            # (1) dependent item
        \s*
        (?:\[([^\]:\s]+)\])?   # (2) dependent branch
        \s*:\s*
        ([^\s\[]+)             # (3) source item
        (?:\s*\[([^\]\s]+)\])? # (4) source branch
        \s*$",
    )
    .unwrap()
});

#[derive(Debug, Default)]
struct DepEntry {
    /// Dependencies of item:branch.
    plus: Vec<String>,
    /// Explicit *non*-dependencies of item:branch.
    minus: Vec<String>,
}

/// A direct dependency as recorded in a graph node.
#[derive(Clone, Debug)]
pub struct DepItem {
    pub item: String,
    pub path: String,
    pub branch: Option<String>,
}

#[derive(Debug, Default)]
pub struct GraphNode {
    pub path: String,
    /// Whether this node is actually to be built in this run (false for
    /// transitive-only nodes when include-dependencies is off).
    pub build: bool,
    pub branch: Option<String>,
    /// Absent for virtual/undefined dependencies.
    pub module: Option<Module>,
    pub deps: BTreeMap<String, DepItem>,
    /// Transitive closure of deps, filled by the copy-up pass.
    pub all_deps: Option<BTreeSet<String>>,
    /// Names of nodes that transitively depend on this one. (Historically
    /// called "votes"; the set here reads the way the data actually flows.)
    pub dependents: BTreeSet<String>,
}

pub type ModuleGraph = BTreeMap<String, GraphNode>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResolutionErrors {
    pub branch_errors: u32,
    pub path_errors: u32,
    pub trivial_cycles: u32,
    pub syntax_errors: u32,
    pub cycles: u32,
}

#[derive(Debug)]
pub struct GraphResult {
    pub graph: Option<ModuleGraph>,
    pub errors: ResolutionErrors,
}

#[derive(Deserialize)]
struct DependenciesV2 {
    #[serde(default)]
    metadata_version: u32,
    #[serde(default)]
    module_dependencies: BTreeMap<String, Vec<String>>,
}

/// Factory producing a Module for a dependency name the user didn't select
/// directly, or None for virtual/undefined dependencies.
pub type ModuleFactory<'a> = dyn FnMut(&mut BuildContext, &str) -> Option<Module> + 'a;

#[derive(Debug, Default)]
pub struct DependencyResolver {
    /// Maps `name:branch` keys (`*` meaning any branch) to their declared
    /// dependencies and anti-dependencies.
    dependencies_of: HashMap<String, DepEntry>,
    /// Wildcarded dependent entries (`prefix*`), applied to every concrete
    /// KDE dependent whose path matches.
    catch_all_dependencies: BTreeMap<String, Vec<String>>,
}

/// The short name of a full project path: the rightmost path segment.
pub fn shorten_module_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

struct LookupResult {
    dependencies: BTreeMap<String, DepItem>,
    trivial_cycles: u32,
    syntax_errors: u32,
}

impl DependencyResolver {
    pub fn new() -> Self {
        DependencyResolver::default()
    }

    fn add_dependency(
        &mut self,
        dep_name: &str,
        dep_branch: &str,
        src_name: &str,
        src_branch: &str,
        negative: bool,
    ) {
        // There is always at least an entry for module:*, where '*' means
        // the branch is unspecified; it may only add dependencies, never
        // take them away.
        self.dependencies_of
            .entry(format!("{dep_name}:*"))
            .or_default();
        let entry = self
            .dependencies_of
            .entry(format!("{dep_name}:{dep_branch}"))
            .or_default();
        let list = if negative { &mut entry.minus } else { &mut entry.plus };
        list.push(format!("{src_name}:{src_branch}"));
    }

    /// Reads dependency data in the pseudo-Makefile format
    /// (`DEP[BRANCH]: SRC[BRANCH]`).
    pub fn read_dependency_data(&mut self, text: &str) -> Result<()> {
        for (lineno, raw_line) in text.lines().enumerate() {
            // Strip comments and skip empty lines.
            let line = raw_line.split('#').next().unwrap_or("");
            if line.trim().is_empty() {
                continue;
            }

            let caps = DEPENDENCY_ATOM_RE.captures(line).ok_or_else(|| {
                BuildError::internal(format!(
                    "Invalid line {} when reading dependency data (line {})",
                    line,
                    lineno + 1
                ))
            })?;

            let dependent_item = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let dependent_branch = caps.get(2).map(|m| m.as_str()).unwrap_or("*");
            let source_item = caps.get(3).map(|m| m.as_str()).unwrap_or("");
            let source_branch = caps.get(4).map(|m| m.as_str()).unwrap_or("*");

            // A wildcarded source grouping cannot be depended upon.
            if source_item.ends_with('*') {
                warn!(
                    "\tIgnoring dependency on wildcard module grouping on line {} of dependency data",
                    lineno + 1
                );
                continue;
            }

            // The negation marker must be checked before shortening.
            let negative = source_item.starts_with('-');
            let source_item = source_item.trim_start_matches('-');
            // A source can never be a catch-all, so shorten early; we must
            // anyway, to avoid a dependency on a long path.
            let source_item = shorten_module_name(source_item);

            if dependent_item.ends_with('*') {
                self.catch_all_dependencies
                    .entry(dependent_item.to_string())
                    .or_default()
                    .push(format!("{source_item}:{source_branch}"));
                continue;
            }

            let dependent_item = shorten_module_name(dependent_item);
            self.add_dependency(
                dependent_item,
                dependent_branch,
                source_item,
                source_branch,
                negative,
            );
        }

        self.canonicalize_dependencies();
        Ok(())
    }

    /// Reads the v2 JSON dependency format.
    pub fn read_dependency_data_v2(&mut self, json: &str) -> Result<()> {
        let data: DependenciesV2 = serde_json::from_str(json)
            .map_err(|err| BuildError::runtime(format!("Unable to decode V2 dependencies: {err}")))?;
        if data.metadata_version != 2 {
            return Err(BuildError::runtime("Unknown dependency version"));
        }
        if data.module_dependencies.is_empty() {
            return Err(BuildError::runtime("V2 dependencies contain no dependencies"));
        }
        for (dep_module, src_list) in &data.module_dependencies {
            let dep_name = shorten_module_name(dep_module);
            for src_module in src_list {
                let src_name = shorten_module_name(src_module);
                self.add_dependency(dep_name, "*", src_name, "*", false);
            }
        }
        self.canonicalize_dependencies();
        Ok(())
    }

    /// Sorts all stored dependency lists so ordering is reproducible given
    /// the same dependency items and selectors.
    fn canonicalize_dependencies(&mut self) {
        for entry in self.dependencies_of.values_mut() {
            entry.plus.sort();
            entry.minus.sort();
        }
        for deps in self.catch_all_dependencies.values_mut() {
            deps.sort();
        }
    }

    fn lookup_direct_dependencies(&self, path: &str, branch: Option<&str>) -> LookupResult {
        let item = shorten_module_name(path);
        let mut direct_deps: Vec<String> = Vec::new();
        let mut exclusions: Vec<String> = Vec::new();

        if let Some(entry) = self.dependencies_of.get(&format!("{item}:*")) {
            debug!("handling dependencies for: {item} without branch (*)");
            direct_deps.extend(entry.plus.iter().cloned());
            exclusions.extend(entry.minus.iter().cloned());
        }
        if let Some(branch) = branch.filter(|b| !b.is_empty() && *b != "*") {
            if let Some(entry) = self.dependencies_of.get(&format!("{item}:{branch}")) {
                debug!("handling dependencies for: {item} with branch ({branch})");
                direct_deps.extend(entry.plus.iter().cloned());
                exclusions.extend(entry.minus.iter().cloned());
            }
        }

        // Catch-all dependencies apply only to KDE modules, not third-party
        // ones (marked by the synthetic third-party/ path prefix).
        if !path.starts_with("third-party/") {
            for (catch_all, deps) in &self.catch_all_dependencies {
                let prefix = catch_all.trim_end_matches('*');
                if prefix.is_empty() || path.starts_with(prefix) {
                    direct_deps.extend(deps.iter().cloned());
                }
            }
        }

        // Exact-branch exclusions remove only exact matches; catch-all
        // exclusions remove catch-alls.
        for exclusion in &exclusions {
            direct_deps.retain(|dep| dep != exclusion);
        }

        let mut result = LookupResult {
            dependencies: BTreeMap::new(),
            trivial_cycles: 0,
            syntax_errors: 0,
        };

        for dep in direct_deps {
            let Some((dep_path, dep_branch)) = dep.split_once(':') else {
                error!("Invalid dependency declaration: {dep}");
                result.syntax_errors += 1;
                continue;
            };
            if dep_path.is_empty() {
                error!("Invalid dependency declaration: {dep}");
                result.syntax_errors += 1;
                continue;
            }
            let dep_item = shorten_module_name(dep_path);
            if dep_item == item {
                debug!("\tBreaking trivial cycle of {dep_item} -> {item}");
                result.trivial_cycles += 1;
                continue;
            }
            if result.dependencies.contains_key(dep_item) {
                debug!("\tSkipping duplicate direct dependency {dep_item} of {item}");
                continue;
            }
            // Wildcard branches are a don't-care, not an actual branch.
            let dep_branch = match dep_branch {
                "" | "*" => None,
                other => Some(other.to_string()),
            };
            result.dependencies.insert(
                dep_item.to_string(),
                DepItem {
                    item: dep_item.to_string(),
                    path: dep_path.to_string(),
                    branch: dep_branch,
                },
            );
        }
        result
    }

    /// Builds the full dependency graph for the given selected modules,
    /// using `factory` to construct Modules for dependency names pulled in
    /// along the way.
    pub fn resolve_to_module_graph(
        &self,
        ctx: &mut BuildContext,
        factory: &mut ModuleFactory<'_>,
        modules: Vec<Module>,
    ) -> GraphResult {
        let mut graph: ModuleGraph = BTreeMap::new();
        let mut errors = ResolutionErrors::default();

        for module in modules {
            let item = module.name().to_string();
            let branch = get_branch_of(&module, ctx);
            let path = dependency_path_of(Some(&module), &item, "");

            if path.is_empty() {
                error!("Unable to determine project/dependency path of module: {item}");
                errors.path_errors += 1;
                continue;
            }

            if let Some(node) = graph.get_mut(&item) {
                // Pulled in previously through (transitive) dependencies;
                // it is listed explicitly so mark it for building now.
                debug!("Module pulled in previously through dependencies: {item}");
                if let (Some(previous), Some(wanted)) = (node.branch.as_deref(), branch.as_deref())
                {
                    if previous != wanted {
                        error!(
                            "Found a dependency conflict in branches ('{previous}' is not \
                             '{wanted}') for {item}!"
                        );
                        errors.branch_errors += 1;
                    }
                } else if branch.is_some() {
                    node.branch = branch;
                }
                node.build = true;
                node.module = Some(module);
                continue;
            }

            let lookup = self.lookup_direct_dependencies(&path, branch.as_deref());
            errors.trivial_cycles += lookup.trivial_cycles;
            errors.syntax_errors += lookup.syntax_errors;

            let include_dependencies = module.get_option(ctx, "include-dependencies").is_true();
            graph.insert(
                item.clone(),
                GraphNode {
                    path,
                    build: true,
                    branch,
                    module: Some(module),
                    deps: lookup.dependencies,
                    all_deps: None,
                    dependents: BTreeSet::new(),
                },
            );

            self.resolve_dependencies_of(ctx, factory, &mut graph, &mut errors, &item, include_dependencies);
        }

        if errors.path_errors > 0 {
            error!(
                "Total of items which were not resolved due to path lookup failure: {}",
                errors.path_errors
            );
        }
        if errors.branch_errors > 0 {
            error!("Total of branch conflicts detected: {}", errors.branch_errors);
        }
        if errors.syntax_errors > 0 {
            error!("Total of encountered syntax errors: {}", errors.syntax_errors);
        }
        if errors.syntax_errors > 0 || errors.path_errors > 0 || errors.branch_errors > 0 {
            error!("Unable to resolve dependency graph");
            return GraphResult { graph: None, errors };
        }

        if errors.trivial_cycles > 0 {
            debug!(
                "Total of 'trivial' dependency cycles detected & eliminated: {}",
                errors.trivial_cycles
            );
        }

        let cycles = detect_cycles(&graph);
        if cycles > 0 {
            error!("Total of items with at least one circular dependency detected: {cycles}");
            error!("Unable to resolve dependency graph");
            errors.cycles = cycles;
            return GraphResult { graph: None, errors };
        }

        copy_up_dependencies(&mut graph);
        compute_dependents(&mut graph);
        GraphResult {
            graph: Some(graph),
            errors,
        }
    }

    /// Recursively resolves the dependencies of one graph node, creating
    /// nodes for newly-seen dependencies along the way.
    fn resolve_dependencies_of(
        &self,
        ctx: &mut BuildContext,
        factory: &mut ModuleFactory<'_>,
        graph: &mut ModuleGraph,
        errors: &mut ResolutionErrors,
        item: &str,
        include_dependencies: bool,
    ) {
        debug!("Resolving dependencies for module: {item}");
        let dep_infos: Vec<DepItem> = graph[item].deps.values().cloned().collect();

        for dep_info in dep_infos {
            let dep_item = dep_info.item.clone();
            let dep_branch = dep_info.branch.clone();
            let pretty_branch = dep_branch.as_deref().unwrap_or("*");
            debug!("\tdep-resolv: {item} depends on {dep_item}:{pretty_branch}");

            if let Some(dep_node) = graph.get_mut(&dep_item) {
                if let (Some(previous), Some(wanted)) =
                    (dep_node.branch.as_deref(), dep_branch.as_deref())
                {
                    if previous != wanted {
                        error!(
                            "Found a dependency conflict in branches ('{previous}' is not \
                             '{wanted}') for {dep_item}!"
                        );
                        errors.branch_errors += 1;
                        continue;
                    }
                }
                if dep_branch.is_some() && dep_node.branch.is_none() {
                    dep_node.branch = dep_branch;
                }
                continue;
            }

            // May not exist, e.g. misspellings or 'virtual' dependencies.
            let dep_module = factory(ctx, &dep_item);
            if dep_module.is_none() {
                debug!("\tdep-resolve: Will not build virtual or undefined module: {dep_item}");
            }
            let resolved_path =
                dependency_path_of(dep_module.as_ref(), &dep_item, &dep_info.path);

            let lookup = self.lookup_direct_dependencies(&resolved_path, dep_branch.as_deref());
            errors.trivial_cycles += lookup.trivial_cycles;
            errors.syntax_errors += lookup.syntax_errors;

            let build = dep_module.is_some() && include_dependencies;
            if !build {
                debug!(" * {item} depends on {dep_item}, but no module builds {dep_item} for this run.");
            }

            if let (Some(module), Some(wanted)) = (dep_module.as_ref(), dep_branch.as_deref()) {
                let actual = get_branch_of(module, ctx).unwrap_or_default();
                if actual != wanted {
                    let actual = if actual.is_empty() { "?" } else { &actual };
                    error!(" * {item} needs {dep_item}:{wanted}, not {dep_item}:{actual}");
                    errors.branch_errors += 1;
                }
            }

            graph.insert(
                dep_item.clone(),
                GraphNode {
                    path: resolved_path,
                    build,
                    branch: dep_branch,
                    module: dep_module,
                    deps: lookup.dependencies,
                    all_deps: None,
                    dependents: BTreeSet::new(),
                },
            );

            debug!("Resolving transitive dependencies for module: {item} (via: {dep_item})");
            self.resolve_dependencies_of(ctx, factory, graph, errors, &dep_item, include_dependencies);
        }
    }
}

/// The dependency path for a module: its full project path, with a
/// `third-party/` prefix for modules outside the KDE project hierarchy.
fn dependency_path_of(module: Option<&Module>, item: &str, default_path: &str) -> String {
    match module {
        Some(module) => {
            let project_path = module.full_project_path();
            let path = if module.is_kde_project() {
                project_path
            } else {
                format!("third-party/{project_path}")
            };
            debug!("\tUsing path: '{path}' for item: {item}");
            path
        }
        None => {
            debug!("\tGuessing path: '{default_path}' for item: {item}");
            default_path.to_string()
        }
    }
}

/// The branch a module would check out, when that is really a branch (a
/// detached commit/tag selection returns None).
fn get_branch_of(module: &Module, ctx: &BuildContext) -> Option<String> {
    let (reference, kind) = git::determine_preferred_checkout_source(module, ctx);
    (kind == CheckoutKind::Branch).then_some(reference)
}

/// Tri-color depth-first search for cycles. Returns the number of items
/// involved in at least one cycle.
fn detect_cycles(graph: &ModuleGraph) -> u32 {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit(
        graph: &ModuleGraph,
        colors: &mut HashMap<String, Color>,
        results: &mut HashMap<String, bool>,
        dep_item: &str,
        item: &str,
    ) -> bool {
        match colors.get(dep_item).copied().unwrap_or(Color::White) {
            Color::Black => return results.get(dep_item).copied().unwrap_or(false),
            Color::Gray => {
                error!("Found a dependency cycle at: {dep_item} while tracing {item}");
                results.insert(dep_item.to_string(), true);
            }
            Color::White => {
                colors.insert(dep_item.to_string(), Color::Gray);
                results.insert(dep_item.to_string(), false);
                let names: Vec<String> = graph
                    .get(dep_item)
                    .map(|node| node.deps.keys().cloned().collect())
                    .unwrap_or_default();
                for name in names {
                    if visit(graph, colors, results, &name, item) {
                        results.insert(dep_item.to_string(), true);
                    }
                }
            }
        }
        colors.insert(dep_item.to_string(), Color::Black);
        results.get(dep_item).copied().unwrap_or(false)
    }

    let mut colors = HashMap::new();
    let mut results = HashMap::new();
    let mut errors = 0;
    for item in graph.keys() {
        if visit(graph, &mut colors, &mut results, item, item) {
            error!("Somehow there is a circular dependency involving {item}! :(");
            error!("Please file a bug against the dependency metadata about this!");
            errors += 1;
        }
    }
    errors
}

/// Memoized computation of each node's transitive dependency closure.
fn copy_up_dependencies(graph: &mut ModuleGraph) {
    fn copy_up_for(graph: &mut ModuleGraph, item: &str) {
        if graph.get(item).map(|node| node.all_deps.is_some()).unwrap_or(true) {
            return;
        }
        let names: Vec<String> = graph[item].deps.keys().cloned().collect();
        let mut all = BTreeSet::new();
        for name in names {
            if !graph.contains_key(&name) {
                continue;
            }
            copy_up_for(graph, &name);
            if let Some(child_deps) = graph[&name].all_deps.clone() {
                all.extend(child_deps);
            }
            all.insert(name);
        }
        if let Some(node) = graph.get_mut(item) {
            node.all_deps = Some(all);
        }
    }

    let items: Vec<String> = graph.keys().cloned().collect();
    for item in items {
        copy_up_for(graph, &item);
    }
}

/// Fills in the reverse closure: which nodes transitively depend on each
/// node.
fn compute_dependents(graph: &mut ModuleGraph) {
    let edges: Vec<(String, Vec<String>)> = graph
        .iter()
        .map(|(item, node)| {
            (
                item.clone(),
                node.all_deps.iter().flatten().cloned().collect(),
            )
        })
        .collect();
    for (item, deps) in edges {
        for dep in deps {
            if let Some(node) = graph.get_mut(&dep) {
                node.dependents.insert(item.clone());
            }
        }
    }
}

/// Sorts the buildable modules out of the graph into build order and
/// returns them, transferring ownership of the Module objects.
pub fn sort_modules_into_build_order(graph: &mut ModuleGraph) -> Vec<Module> {
    let mut names: Vec<String> = graph
        .iter()
        .filter(|(_, node)| node.build && node.module.is_some())
        .map(|(name, _)| name.clone())
        .collect();

    names.sort_by(|a, b| compare_build_order(graph, a, b));

    names
        .into_iter()
        .filter_map(|name| graph.get_mut(&name).and_then(|node| node.module.take()))
        .collect()
}

fn compare_build_order(graph: &ModuleGraph, a: &str, b: &str) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    // Enforce a strict dependency ordering first. Both relations holding
    // would amount to a cycle, which detection has already ruled out.
    let b_depends_on_a = graph[a].dependents.contains(b);
    let a_depends_on_b = graph[b].dependents.contains(a);
    if b_depends_on_a {
        return Ordering::Less;
    }
    if a_depends_on_b {
        return Ordering::Greater;
    }

    // With no dependency relation, sort by popularity: the most
    // depended-on item goes first, to help maximise how long builds can
    // proceed in parallel with updates.
    let popularity = graph[b].dependents.len().cmp(&graph[a].dependents.len());
    if popularity != Ordering::Equal {
        return popularity;
    }

    // Then by the order in the configuration file, as set up while the
    // rc-file was read.
    let a_rc_order = graph[a].module.as_ref().map(|m| m.create_id()).unwrap_or(0);
    let b_rc_order = graph[b].module.as_ref().map(|m| m.create_id()).unwrap_or(0);
    let config_order = a_rc_order.cmp(&b_rc_order);
    if config_order != Ordering::Equal {
        return config_order;
    }

    // Finally by name, for a reproducible order not influenced by
    // runtime randomization.
    a.cmp(b)
}

/// Node details passed to the dependency-tree walk callback.
pub struct TreeNodeInfo<'a> {
    pub depth: usize,
    pub item: &'a str,
    pub build: bool,
    pub branch: &'a str,
}

/// Walks the dependency tree of each given root depth-first, invoking the
/// callback for every node visited (used by --dependency-tree).
pub fn walk_module_dependency_trees(
    graph: &ModuleGraph,
    roots: &[String],
    callback: &mut dyn FnMut(&TreeNodeInfo),
) {
    fn descend(
        graph: &ModuleGraph,
        callback: &mut dyn FnMut(&TreeNodeInfo),
        item: &str,
        depth: usize,
    ) {
        let Some(node) = graph.get(item) else {
            return;
        };
        callback(&TreeNodeInfo {
            depth,
            item,
            build: node.build,
            branch: node.branch.as_deref().unwrap_or(""),
        });
        for dep in node.deps.keys() {
            descend(graph, callback, dep, depth + 1);
        }
    }

    for root in roots {
        descend(graph, callback, root, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn make_module(ctx: &BuildContext, name: &str, create_id: u32) -> Module {
        let mut module = Module::new(ctx, name);
        module.set_create_id(create_id);
        module
    }

    fn resolve(
        resolver: &DependencyResolver,
        ctx: &mut BuildContext,
        modules: Vec<Module>,
    ) -> GraphResult {
        let mut factory =
            |ctx: &mut BuildContext, name: &str| Some(Module::new(ctx, name));
        resolver.resolve_to_module_graph(ctx, &mut factory, modules)
    }

    #[test]
    fn shortens_paths() {
        assert_eq!(shorten_module_name("kde/kdelibs/foo"), "foo");
        assert_eq!(shorten_module_name("juk"), "juk");
    }

    #[test]
    fn parses_legacy_format() {
        let mut resolver = DependencyResolver::new();
        resolver
            .read_dependency_data(
                "# comment\n\
                 kde/juk: kde/taglib\n\
                 kde/juk[stable]: kde/phonon [oldbranch]\n\
                 kde/* : frameworks/extra-cmake-modules\n\
                 kde/broken: sillywild* # ignored with a warning\n",
            )
            .unwrap();

        let entry = &resolver.dependencies_of["juk:*"];
        assert_eq!(entry.plus, vec!["taglib:*".to_string()]);
        let entry = &resolver.dependencies_of["juk:stable"];
        assert_eq!(entry.plus, vec!["phonon:oldbranch".to_string()]);
        assert_eq!(
            resolver.catch_all_dependencies["kde/*"],
            vec!["extra-cmake-modules:*".to_string()]
        );
    }

    #[test]
    fn parses_v2_format() {
        let mut resolver = DependencyResolver::new();
        resolver
            .read_dependency_data_v2(
                r#"{
                    "metadata_version": 2,
                    "module_dependencies": {
                        "multimedia/juk": ["libraries/taglib"]
                    }
                }"#,
            )
            .unwrap();
        assert_eq!(
            resolver.dependencies_of["juk:*"].plus,
            vec!["taglib:*".to_string()]
        );

        let mut bad = DependencyResolver::new();
        assert!(bad
            .read_dependency_data_v2(r#"{"metadata_version": 1, "module_dependencies": {"a": []}}"#)
            .is_err());
    }

    #[test]
    fn anti_dependencies_remove_edges() {
        let mut resolver = DependencyResolver::new();
        resolver
            .read_dependency_data(
                "juk: taglib\n\
                 juk: phonon\n\
                 juk: -taglib\n",
            )
            .unwrap();
        let lookup = resolver.lookup_direct_dependencies("kde/juk", None);
        let names: Vec<&String> = lookup.dependencies.keys().collect();
        assert_eq!(names, vec!["phonon"]);
    }

    #[test]
    fn trivial_cycle_is_eliminated() {
        let mut resolver = DependencyResolver::new();
        resolver.read_dependency_data("juk: juk\n").unwrap();

        let mut ctx = BuildContext::new();
        let modules = vec![make_module(&ctx, "juk", 1)];
        let result = resolve(&resolver, &mut ctx, modules);
        assert_eq!(result.errors.trivial_cycles, 1);

        let mut graph = result.graph.unwrap();
        assert!(graph["juk"].deps.is_empty());
        let order = sort_modules_into_build_order(&mut graph);
        assert_eq!(order.len(), 1);
        assert_eq!(order[0].name(), "juk");
    }

    #[test]
    fn catch_alls_skip_third_party_paths() {
        let mut resolver = DependencyResolver::new();
        resolver
            .read_dependency_data("kde/*: frameworks/extra-cmake-modules\n")
            .unwrap();

        let kde = resolver.lookup_direct_dependencies("kde/juk", None);
        assert!(kde.dependencies.contains_key("extra-cmake-modules"));

        let third_party = resolver.lookup_direct_dependencies("third-party/taglib", None);
        assert!(third_party.dependencies.is_empty());
    }

    #[test]
    fn cycles_abort_resolution() {
        let mut resolver = DependencyResolver::new();
        resolver
            .read_dependency_data("alpha: beta\nbeta: alpha\n")
            .unwrap();

        let mut ctx = BuildContext::new();
        let modules = vec![make_module(&ctx, "alpha", 1), make_module(&ctx, "beta", 2)];
        let result = resolve(&resolver, &mut ctx, modules);
        assert!(result.graph.is_none());
        assert!(result.errors.cycles > 0);
    }

    #[test]
    fn transitive_closure_and_dependents() {
        let mut resolver = DependencyResolver::new();
        resolver
            .read_dependency_data(
                "b-mod: c-mod\n\
                 d-mod: b-mod\n\
                 d-mod: c-mod\n\
                 a-mod: b-mod\n\
                 a-mod: e-mod\n",
            )
            .unwrap();

        let mut ctx = BuildContext::new();
        let modules = vec![
            make_module(&ctx, "e-mod", 1),
            make_module(&ctx, "c-mod", 2),
            make_module(&ctx, "b-mod", 3),
            make_module(&ctx, "d-mod", 4),
            make_module(&ctx, "a-mod", 5),
        ];
        let result = resolve(&resolver, &mut ctx, modules);
        let graph = result.graph.unwrap();

        // The closure of each node is the reflexive-transitive closure of
        // deps minus itself.
        let all_deps = |name: &str| -> Vec<String> {
            graph[name].all_deps.clone().unwrap().into_iter().collect()
        };
        assert_eq!(all_deps("a-mod"), vec!["b-mod", "c-mod", "e-mod"]);
        assert_eq!(all_deps("b-mod"), vec!["c-mod"]);
        assert_eq!(all_deps("d-mod"), vec!["b-mod", "c-mod"]);
        assert!(all_deps("c-mod").is_empty());

        // Every transitive edge shows up as a dependent entry.
        let dependents = |name: &str| -> Vec<String> {
            graph[name].dependents.iter().cloned().collect()
        };
        assert_eq!(dependents("c-mod"), vec!["a-mod", "b-mod", "d-mod"]);
        assert_eq!(dependents("b-mod"), vec!["a-mod", "d-mod"]);
        assert_eq!(dependents("e-mod"), vec!["a-mod"]);
        assert!(dependents("a-mod").is_empty());
    }

    #[test]
    fn build_order_respects_deps_popularity_and_config_order() {
        let mut resolver = DependencyResolver::new();
        resolver
            .read_dependency_data(
                "b-mod: c-mod\n\
                 d-mod: b-mod\n\
                 d-mod: c-mod\n\
                 a-mod: b-mod\n\
                 a-mod: e-mod\n",
            )
            .unwrap();

        let mut ctx = BuildContext::new();
        // Declaration order: E, C, B, D, A.
        let modules = vec![
            make_module(&ctx, "e-mod", 1),
            make_module(&ctx, "c-mod", 2),
            make_module(&ctx, "b-mod", 3),
            make_module(&ctx, "d-mod", 4),
            make_module(&ctx, "a-mod", 5),
        ];
        let result = resolve(&resolver, &mut ctx, modules);
        let mut graph = result.graph.unwrap();
        let order: Vec<String> = sort_modules_into_build_order(&mut graph)
            .iter()
            .map(|module| module.name().to_string())
            .collect();
        assert_eq!(order, vec!["c-mod", "b-mod", "e-mod", "d-mod", "a-mod"]);
    }

    #[test]
    fn build_order_never_violates_dependencies() {
        let mut resolver = DependencyResolver::new();
        resolver
            .read_dependency_data(
                "b-mod: c-mod\n\
                 d-mod: b-mod\n\
                 a-mod: b-mod\n",
            )
            .unwrap();

        let mut ctx = BuildContext::new();
        let modules = vec![
            make_module(&ctx, "a-mod", 1),
            make_module(&ctx, "b-mod", 2),
            make_module(&ctx, "c-mod", 3),
            make_module(&ctx, "d-mod", 4),
        ];
        let result = resolve(&resolver, &mut ctx, modules);
        let mut graph = result.graph.unwrap();
        let order: Vec<String> = sort_modules_into_build_order(&mut graph)
            .iter()
            .map(|module| module.name().to_string())
            .collect();

        // For any A before B in the order, A must not depend on B.
        for (i, early) in order.iter().enumerate() {
            for late in &order[i + 1..] {
                assert!(
                    !graph[late].dependents.contains(early),
                    "{early} ordered before its dependency {late}"
                );
            }
        }
    }

    #[test]
    fn virtual_dependencies_are_not_built() {
        let mut resolver = DependencyResolver::new();
        resolver.read_dependency_data("juk: kf5umbrella\n").unwrap();

        let mut ctx = BuildContext::new();
        let modules = vec![make_module(&ctx, "juk", 1)];
        // Factory that knows no modules at all.
        let mut factory = |_: &mut BuildContext, _: &str| -> Option<Module> { None };
        let result = resolver.resolve_to_module_graph(&mut ctx, &mut factory, modules);
        let graph = result.graph.unwrap();

        assert!(graph.contains_key("kf5umbrella"));
        assert!(!graph["kf5umbrella"].build);
        assert!(graph["kf5umbrella"].module.is_none());
    }

    #[test]
    fn include_dependencies_off_keeps_deps_unbuilt() {
        let mut resolver = DependencyResolver::new();
        resolver.read_dependency_data("juk: taglib\n").unwrap();

        let mut ctx = BuildContext::new();
        let mut module = make_module(&ctx, "juk", 1);
        module
            .set_option("#include-dependencies", false.into())
            .unwrap();
        let result = resolve(&resolver, &mut ctx, vec![module]);
        let graph = result.graph.unwrap();
        assert!(!graph["taglib"].build);
        // The module object still exists so queries work on it.
        assert!(graph["taglib"].module.is_some());
    }

    #[test]
    fn empty_selection_resolves_to_empty_graph() {
        let resolver = DependencyResolver::new();
        let mut ctx = BuildContext::new();
        let result = resolve(&resolver, &mut ctx, vec![]);
        let mut graph = result.graph.unwrap();
        assert!(graph.is_empty());
        assert!(sort_modules_into_build_order(&mut graph).is_empty());
    }

    #[test]
    fn dependency_tree_walk_visits_children() {
        let mut resolver = DependencyResolver::new();
        resolver
            .read_dependency_data("juk: taglib\ntaglib: zlib\n")
            .unwrap();
        let mut ctx = BuildContext::new();
        let modules = vec![make_module(&ctx, "juk", 1)];
        let result = resolve(&resolver, &mut ctx, modules);
        let graph = result.graph.unwrap();

        let mut seen = Vec::new();
        walk_module_dependency_trees(&graph, &["juk".to_string()], &mut |info| {
            seen.push((info.depth, info.item.to_string()));
        });
        assert_eq!(
            seen,
            vec![
                (0, "juk".to_string()),
                (1, "taglib".to_string()),
                (2, "zlib".to_string()),
            ]
        );
    }
}
