// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ranks build failures from most to least interesting, to point the user
//! at probable root causes first. A module that fails to build is likely
//! to knock out everything that depends on it, so the dependency comes
//! before its victims, new failures before chronic ones, and so on.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::dependency::ModuleGraph;
use crate::phase::Phase;

/// Per-failure inputs the comparator needs besides the graph.
pub struct FailureInfo {
    pub name: String,
    pub phase: Option<Phase>,
    /// The persistent failure-count before this run.
    pub failure_count: u64,
}

fn phase_score(phase: Option<Phase>) -> u32 {
    phase.map(Phase::failure_score).unwrap_or(0)
}

fn compare_debug_order(
    graph: &ModuleGraph,
    a: &FailureInfo,
    b: &FailureInfo,
) -> Ordering {
    let a_node = graph.get(&a.name);
    let b_node = graph.get(&b.name);

    // Strict dependency ordering first: if A is a transitive dependency of
    // B, a failure in A probably explains the failure in B. Both holding
    // at once would be a cycle, ruled out before this stage.
    let b_depends_on_a = a_node.map_or(false, |n| n.dependents.contains(&b.name));
    let a_depends_on_b = b_node.map_or(false, |n| n.dependents.contains(&a.name));
    if b_depends_on_a {
        return Ordering::Less;
    }
    if a_depends_on_b {
        return Ordering::Greater;
    }

    // Favour possible root causes: a module with no dependencies of its
    // own can't be blaming anything upstream.
    let a_is_root = a_node.map(|n| n.deps.is_empty()).unwrap_or(false);
    let b_is_root = b_node.map(|n| n.deps.is_empty()).unwrap_or(false);
    match (a_is_root, b_is_root) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }

    // Popularity: the most heavily depended-on module is worth fixing
    // before more exotic ones.
    let a_popularity = a_node.map_or(0, |n| n.dependents.len());
    let b_popularity = b_node.map_or(0, |n| n.dependents.len());
    let popularity = b_popularity.cmp(&a_popularity);
    if popularity != Ordering::Equal {
        return popularity;
    }

    // Phase interestingness: install failures should 'rarely' happen, so
    // when they do there are probably underlying system issues at work.
    let phase = phase_score(b.phase).cmp(&phase_score(a.phase));
    if phase != Ordering::Equal {
        return phase;
    }

    // Persistently failing modules do not prompt the user to act;
    // conversely *new* failures do.
    let fail_count = a.failure_count.cmp(&b.failure_count);
    if fail_count != Ordering::Equal {
        return fail_count;
    }

    a.name.cmp(&b.name)
}

/// Sorts the given failures into debug order, most interesting first.
pub fn sort_failures_in_debug_order(
    graph: &ModuleGraph,
    mut failures: Vec<FailureInfo>,
) -> Vec<FailureInfo> {
    failures.sort_by(|a, b| compare_debug_order(graph, a, b));
    failures
}

/// Convenience constructor for the failure list from the phase map and
/// failure counters.
pub fn collect_failures(
    names: &[String],
    phases: &HashMap<String, Phase>,
    failure_counts: &HashMap<String, u64>,
) -> Vec<FailureInfo> {
    names
        .iter()
        .map(|name| FailureInfo {
            name: name.clone(),
            phase: phases.get(name).copied(),
            failure_count: failure_counts.get(name).copied().unwrap_or(0),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BuildContext;
    use crate::dependency::DependencyResolver;
    use crate::module::Module;

    fn graph_for(dep_data: &str, names: &[&str]) -> ModuleGraph {
        let mut resolver = DependencyResolver::new();
        resolver.read_dependency_data(dep_data).unwrap();
        let mut ctx = BuildContext::new();
        let modules = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut module = Module::new(&ctx, name);
                module.set_create_id(i as u32 + 1);
                module
            })
            .collect();
        let mut factory =
            |ctx: &mut BuildContext, name: &str| Some(Module::new(ctx, name));
        resolver
            .resolve_to_module_graph(&mut ctx, &mut factory, modules)
            .graph
            .unwrap()
    }

    fn failure(name: &str, phase: Phase, count: u64) -> FailureInfo {
        FailureInfo {
            name: name.to_string(),
            phase: Some(phase),
            failure_count: count,
        }
    }

    #[test]
    fn root_cause_outranks_victims() {
        let graph = graph_for("app: libcore\n", &["libcore", "app"]);
        let sorted = sort_failures_in_debug_order(
            &graph,
            vec![
                failure("app", Phase::Build, 0),
                failure("libcore", Phase::Build, 0),
            ],
        );
        let names: Vec<&str> = sorted.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["libcore", "app"]);
    }

    #[test]
    fn install_failures_are_most_interesting() {
        let graph = graph_for("", &["one", "two"]);
        let sorted = sort_failures_in_debug_order(
            &graph,
            vec![
                failure("one", Phase::Update, 0),
                failure("two", Phase::Install, 0),
            ],
        );
        let names: Vec<&str> = sorted.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["two", "one"]);
    }

    #[test]
    fn new_failures_beat_chronic_ones() {
        let graph = graph_for("", &["chronic", "fresh"]);
        let sorted = sort_failures_in_debug_order(
            &graph,
            vec![
                failure("chronic", Phase::Build, 7),
                failure("fresh", Phase::Build, 0),
            ],
        );
        let names: Vec<&str> = sorted.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["fresh", "chronic"]);
    }

    #[test]
    fn name_breaks_remaining_ties() {
        let graph = graph_for("", &["zeta", "alpha"]);
        let sorted = sort_failures_in_debug_order(
            &graph,
            vec![
                failure("zeta", Phase::Build, 0),
                failure("alpha", Phase::Build, 0),
            ],
        );
        let names: Vec<&str> = sorted.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
