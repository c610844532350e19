// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Lookup of the git branch to use for a given project module and logical
//! branch group (e.g. `kf6-qt6`), from the metadata repository's JSON.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{BuildError, Result};

#[derive(Debug, Default, Deserialize)]
struct BranchGroupData {
    #[serde(default)]
    layers: Vec<String>,
    #[serde(default)]
    groups: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Default)]
pub struct BranchGroupResolver {
    layers: Vec<String>,
    groups: BTreeMap<String, BTreeMap<String, String>>,
    /// Keys of `groups` ending in `*`, mapped to their required prefix.
    wildcarded_groups: BTreeMap<String, String>,
}

impl BranchGroupResolver {
    pub fn from_json(json: &str) -> Result<Self> {
        let data: BranchGroupData = serde_json::from_str(json)
            .map_err(|err| BuildError::runtime(format!("Invalid branch group data: {err}")))?;

        // Keys beginning with '_' are defined by the metadata format to be
        // comments of some sort.
        let layers = data
            .layers
            .into_iter()
            .filter(|layer| !layer.starts_with('_'))
            .collect();
        let groups: BTreeMap<_, _> = data
            .groups
            .into_iter()
            .filter(|(key, _)| !key.starts_with('_'))
            .collect();

        let wildcarded_groups = groups
            .keys()
            .filter_map(|key| {
                key.strip_suffix('*')
                    .map(|prefix| (key.clone(), prefix.to_string()))
            })
            .collect();

        Ok(BranchGroupResolver {
            layers,
            groups,
            wildcarded_groups,
        })
    }

    pub fn layers(&self) -> &[String] {
        &self.layers
    }

    /// Returns the branch for the given module path and logical group, or
    /// `None` if unresolved. Lookup order: exact module path, longest
    /// matching wildcard prefix, then the catch-all `*` entry.
    pub fn find_module_branch(&self, module: &str, logical_group: &str) -> Option<String> {
        if let Some(group) = self.groups.get(module) {
            return group.get(logical_group).cloned();
        }

        // Longest required-prefix first; the first valid match is the right
        // match.
        let mut candidates: Vec<(&String, &String)> = self.wildcarded_groups.iter().collect();
        candidates.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
        for (key, prefix) in candidates {
            if module.starts_with(prefix.as_str()) {
                return self.groups[key].get(logical_group).cloned();
            }
        }

        if let Some(group) = self.groups.get("*") {
            return group.get(logical_group).cloned();
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_prefix_match() {
        let resolver = BranchGroupResolver::from_json(
            r#"{"groups": {"kdelibs/*": {"stable": "kf5"}}}"#,
        )
        .unwrap();
        assert_eq!(
            resolver.find_module_branch("kdelibs/kjs", "stable"),
            Some("kf5".to_string())
        );
        assert_eq!(resolver.find_module_branch("kdelibs/foo", "unknown"), None);
        assert_eq!(resolver.find_module_branch("frameworks/kjs", "stable"), None);
    }

    #[test]
    fn exact_beats_wildcard_and_longest_prefix_wins() {
        let resolver = BranchGroupResolver::from_json(
            r#"{
                "groups": {
                    "kde/kdelibs/nepomuk-core": {"stable": "exact"},
                    "kde/kdelibs/*": {"stable": "inner"},
                    "kde/*": {"stable": "outer"},
                    "*": {"stable": "fallback"}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(
            resolver.find_module_branch("kde/kdelibs/nepomuk-core", "stable"),
            Some("exact".to_string())
        );
        assert_eq!(
            resolver.find_module_branch("kde/kdelibs/kjs", "stable"),
            Some("inner".to_string())
        );
        assert_eq!(
            resolver.find_module_branch("kde/workspace", "stable"),
            Some("outer".to_string())
        );
        assert_eq!(
            resolver.find_module_branch("extragear/juk", "stable"),
            Some("fallback".to_string())
        );
    }

    #[test]
    fn comment_keys_are_ignored() {
        let resolver = BranchGroupResolver::from_json(
            r#"{
                "layers": ["_comment", "frameworks"],
                "groups": {"_comment": {"stable": "nope"}, "juk": {"stable": "master"}}
            }"#,
        )
        .unwrap();
        assert_eq!(resolver.layers(), &["frameworks".to_string()]);
        assert_eq!(resolver.find_module_branch("_comment", "stable"), None);
        assert_eq!(
            resolver.find_module_branch("juk", "stable"),
            Some("master".to_string())
        );
    }
}
