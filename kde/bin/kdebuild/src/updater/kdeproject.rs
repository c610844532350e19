// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Policy overrides for modules that come from the KDE project database,
//! plus the special handling for the metadata module itself.

use std::fs;

use tracing::{debug, warn};

use crate::context::BuildContext;
use crate::error::Result;
use crate::module::{DirType, Module, ScmKind};

/// Whether a given preexisting remote plausibly matches the configured
/// repository URL. For project-database modules any `kde:`-prefixed URL is
/// plausible, since the alias expands to the configured host.
pub fn is_plausible_existing_remote(
    module: &Module,
    _name: &str,
    url: &str,
    configured_url: &str,
) -> bool {
    if url == configured_url {
        return true;
    }
    module.is_kde_project() && url.starts_with("kde:")
}

/// Whether the updater should assume control over the push URL for this
/// module's remotes.
pub fn is_push_url_managed(module: &Module) -> bool {
    module.is_kde_project()
}

/// Whether a missing upstream ref should fail the run. A module swept in
/// by wildcard expansion, and not named directly, was never explicitly
/// requested and can simply be skipped.
pub fn module_is_needed(module: &Module) -> bool {
    if !module.is_kde_project() {
        return true;
    }
    let selected_by = module
        .get_option_module("#selected-by")
        .map(|v| v.as_str().into_owned())
        .unwrap_or_default();
    let found_by = module
        .get_option_module("#found-by")
        .map(|v| v.as_str().into_owned())
        .unwrap_or_default();
    !(selected_by != "name" && found_by == "wildcard")
}

/// Resolves the requested branch-group to a concrete branch for this
/// module, or None if the metadata has no entry for it.
pub fn resolve_branch_group(module: &Module, ctx: &BuildContext, group: &str) -> Option<String> {
    let resolver = ctx.branch_group_resolver().ok()?;
    resolver.find_module_branch(&module.full_project_path(), group)
}

/// Reads the metadata module's list of project paths that should never be
/// built, feeding them into the context's ignore list.
pub fn read_ignored_projects(metadata_module: &Module, ctx: &mut BuildContext) -> Result<()> {
    debug_assert_eq!(metadata_module.scm_kind(), ScmKind::KdeProjectMetadata);
    let path = metadata_module
        .fullpath(ctx, DirType::Source)?
        .join("dependencies/build-script-ignore");

    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) => {
            warn!("Unable to read ignore data from {}: {err}", path.display());
            return Ok(());
        }
    };

    let ignored: Vec<String> = text
        .lines()
        .map(|line| {
            line.split('#').next().unwrap_or("").trim().to_string()
        })
        .filter(|line| !line.is_empty())
        .collect();
    debug!("Adding {} projects to the ignore list from metadata", ignored.len());
    ctx.add_to_ignore_list(ignored);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kde_remotes_accept_kde_alias() {
        let ctx = BuildContext::new();
        let mut module = Module::new(&ctx, "juk");
        module.set_scm_kind(ScmKind::KdeProject);
        assert!(is_plausible_existing_remote(
            &module,
            "origin",
            "kde:multimedia/juk.git",
            "https://invent.kde.org/multimedia/juk.git"
        ));

        let plain = Module::new(&ctx, "taglib");
        assert!(!is_plausible_existing_remote(
            &plain,
            "origin",
            "kde:multimedia/juk.git",
            "https://example.org/taglib.git"
        ));
        assert!(is_plausible_existing_remote(
            &plain,
            "origin",
            "https://example.org/taglib.git",
            "https://example.org/taglib.git"
        ));
    }

    #[test]
    fn wildcard_found_modules_are_not_needed() {
        let ctx = BuildContext::new();
        let mut module = Module::new(&ctx, "baloo");
        module.set_scm_kind(ScmKind::KdeProject);
        module.set_option("#found-by", "wildcard".into()).unwrap();
        module
            .set_option("#selected-by", "partial-expansion:frameworks".into())
            .unwrap();
        assert!(!module_is_needed(&module));

        // Named directly: needed even if also matched by a wildcard.
        module.set_option("#selected-by", "name".into()).unwrap();
        assert!(module_is_needed(&module));
    }
}
