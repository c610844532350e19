// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Enumerates and provides basic metadata of KDE projects, based on the
//! YAML metadata included in the repo-metadata checkout.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{BuildError, Result};

/// How a repository was matched by a search: named directly, or swept up by
/// a wildcard / path-prefix expansion.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FoundBy {
    Direct,
    Wildcard,
}

#[derive(Clone, Debug)]
pub struct ProjectEntry {
    /// Short name (metadata `identifier`, falling back to the repo path).
    pub name: String,
    /// Full project path, e.g. `kde/kdemultimedia/juk`.
    pub full_name: String,
    /// Repository path on invent, e.g. `multimedia/juk`.
    pub repo_path: String,
    /// Clone URL (through the `kde:` alias).
    pub repo: String,
    pub active: bool,
    pub found_by: FoundBy,
}

#[derive(Debug, Deserialize)]
struct MetadataFile {
    #[serde(default)]
    identifier: String,
    repopath: String,
    projectpath: String,
    #[serde(default)]
    repoactive: bool,
}

/// Reader over the per-project `metadata.yaml` files under `projects/` in
/// the metadata module's source directory.
#[derive(Debug, Default)]
pub struct ProjectDatabase {
    repositories: BTreeMap<String, ProjectEntry>,
}

impl ProjectDatabase {
    pub fn from_metadata_dir(srcdir: &Path) -> Result<Self> {
        if !srcdir.is_dir() {
            return Err(BuildError::runtime(format!(
                "No such source directory {}!",
                srcdir.display()
            )));
        }

        let mut db = ProjectDatabase::default();
        let projects_root = srcdir.join("projects");
        for entry in WalkDir::new(&projects_root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Error scanning {}: {err}", projects_root.display());
                    continue;
                }
            };
            if entry.file_name() != "metadata.yaml" {
                continue;
            }
            if let Err(err) = db.read_yaml(entry.path()) {
                warn!("Skipping {}: {err}", entry.path().display());
            }
        }

        if db.repositories.is_empty() {
            return Err(BuildError::runtime(format!(
                "Failed to find KDE project entries from {}!",
                srcdir.display()
            )));
        }
        Ok(db)
    }

    /// Builds a database from already-parsed entries; used by tests and by
    /// the pretend path where no checkout exists.
    pub fn from_entries(entries: Vec<ProjectEntry>) -> Self {
        ProjectDatabase {
            repositories: entries
                .into_iter()
                .map(|entry| (entry.name.clone(), entry))
                .collect(),
        }
    }

    fn read_yaml(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        let data: MetadataFile = serde_yaml::from_str(&text)
            .map_err(|err| BuildError::runtime(format!("{}: {err}", path.display())))?;

        // This is already covered as a special metadata module, ignore.
        if data.projectpath == "repo-management" {
            return Ok(());
        }

        let name = if data.identifier.is_empty() {
            data.repopath.clone()
        } else {
            data.identifier.clone()
        };

        self.repositories.insert(
            name.clone(),
            ProjectEntry {
                name,
                full_name: data.projectpath,
                repo: format!("kde:{}.git", data.repopath),
                repo_path: data.repopath,
                active: data.repoactive,
                found_by: FoundBy::Direct,
            },
        );
        Ok(())
    }

    /// Returns all repositories matching the given project selector.
    ///
    /// A `/`-separated path is fine, in which case we look for the
    /// right-most part of the full path which matches all of the selector.
    /// E.g. `kde/kdebase/kde-runtime` is matched by either
    /// `kdebase/kde-runtime` or simply `kde-runtime`.
    pub fn modules_for_project(&self, proj: &str) -> Vec<ProjectEntry> {
        let mut results: BTreeMap<String, FoundBy> = BTreeMap::new();
        let mut proj = proj.to_string();

        let find_results = |proj: &str, results: &mut BTreeMap<String, FoundBy>| {
            let found_by = if proj.contains('*') {
                FoundBy::Wildcard
            } else {
                FoundBy::Direct
            };
            for (key, entry) in &self.repositories {
                if project_path_matches_wildcard_search(&entry.full_name, proj) {
                    results.entry(key.clone()).or_insert(found_by);
                }
            }
        };

        // Non-wildcard matches get an implicit "$proj/*" search as well,
        // for compatibility; selectors ending in .git are forced to be
        // non-wildcarded.
        if !proj.contains('*') && !proj.ends_with(".git") {
            // A plain search first, to account for over-specified module
            // names like phonon/phonon.
            find_results(&proj, &mut results);
            proj.push_str("/*");
        }

        let proj = proj.trim_end_matches(".git").to_string();

        if !proj.contains('*') && !proj.contains('/') {
            if self.repositories.contains_key(&proj) {
                let key = self.repositories.get_key_value(&proj).unwrap().0;
                results.entry(key.clone()).or_insert(FoundBy::Direct);
            }
        } else {
            find_results(&proj, &mut results);
        }

        results
            .into_iter()
            .map(|(key, found_by)| {
                let mut entry = self.repositories[&key].clone();
                // A direct hit from the plain search wins over the implicit
                // wildcard retry.
                entry.found_by = found_by;
                entry
            })
            .collect()
    }
}

/// Returns true if the given full project path (e.g.
/// `kde/kdelibs/nepomuk-core`) matches the search item.
///
/// The search item is based on path components: each component must match
/// the corresponding component of the project path, with `*` matching
/// anything. The search is pinned to a common suffix: `kdelibs` matches
/// `kde/kdelibs` but not `kde/kdelibs/nepomuk-core`, while `kdelibs/*`
/// matches the latter.
pub fn project_path_matches_wildcard_search(project_path: &str, search_item: &str) -> bool {
    let search_parts: Vec<&str> = search_item.split('/').collect();
    let name_stack: Vec<&str> = project_path.split('/').collect();

    if name_stack.len() < search_parts.len() {
        return false;
    }
    let size_difference = name_stack.len() - search_parts.len();

    // We might have to loop if we find the wrong start point for the
    // search, e.g. looking for a/b/* against a/a/b/c we need the second a.
    let mut i = 0;
    while i <= size_difference {
        while i <= size_difference && name_stack[i] != search_parts[0] && search_parts[0] != "*" {
            i += 1;
        }
        if i > size_difference {
            return false;
        }

        let mut found = true;
        for (j, part) in search_parts.iter().enumerate() {
            if *part == "*" {
                return true;
            }
            if *part != name_stack[i + j] {
                found = false;
                break;
            }
        }
        // A full (star-free) match must end at the end of the path.
        if found && i == size_difference {
            return true;
        }
        i += 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_db() -> ProjectDatabase {
        let mk = |name: &str, full: &str, repo_path: &str, active: bool| ProjectEntry {
            name: name.to_string(),
            full_name: full.to_string(),
            repo: format!("kde:{repo_path}.git"),
            repo_path: repo_path.to_string(),
            active,
            found_by: FoundBy::Direct,
        };
        ProjectDatabase::from_entries(vec![
            mk("juk", "kde/kdemultimedia/juk", "multimedia/juk", true),
            mk("kcalc", "kde/kdeutils/kcalc", "utilities/kcalc", true),
            mk("baloo", "kde/kdelibs/baloo", "frameworks/baloo", true),
            mk("kdelibs", "kde/kdelibs", "historical/kdelibs", false),
        ])
    }

    #[test]
    fn suffix_pinned_matching() {
        assert!(project_path_matches_wildcard_search("kde/kdelibs", "kdelibs"));
        assert!(!project_path_matches_wildcard_search(
            "kde/kdelibs/nepomuk-core",
            "kdelibs"
        ));
        assert!(project_path_matches_wildcard_search(
            "kde/kdelibs/nepomuk-core",
            "kdelibs/*"
        ));
        assert!(project_path_matches_wildcard_search("a/a/b/c", "a/b/*"));
        assert!(!project_path_matches_wildcard_search("a/a/b/c", "a/c/*"));
    }

    #[test]
    fn direct_name_lookup() {
        let db = sample_db();
        let results = db.modules_for_project("juk");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "juk");
        assert_eq!(results[0].found_by, FoundBy::Direct);
        assert_eq!(results[0].repo, "kde:multimedia/juk.git");
    }

    #[test]
    fn path_prefix_pulls_in_children() {
        let db = sample_db();
        let mut names: Vec<String> = db
            .modules_for_project("kdelibs")
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        names.sort();
        // Both the exact project and its children via the implicit /* sweep.
        assert_eq!(names, vec!["baloo".to_string(), "kdelibs".to_string()]);
    }

    #[test]
    fn explicit_wildcard_flags_found_by() {
        let db = sample_db();
        let results = db.modules_for_project("kdeutils/*");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "kcalc");
        assert_eq!(results[0].found_by, FoundBy::Wildcard);
    }

    #[test]
    fn no_match_is_empty() {
        let db = sample_db();
        assert!(db.modules_for_project("does-not-exist").is_empty());
    }
}
