// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::buildsystem::{configure_with_digest, BuildSystem};
use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::module::{DirType, Module};

/// Modules configured with Meson. Meson requires Ninja as its underlying
/// build tool, so Ninja support can be assumed. Flags for the setup step
/// come from `configure-flags`.
pub struct Meson;

impl BuildSystem for Meson {
    fn name(&self) -> &'static str {
        "meson"
    }

    fn configured_module_file_name(&self, _module: &Module, _ctx: &BuildContext) -> &'static str {
        "build.ninja"
    }

    fn required_programs(&self, _module: &Module, _ctx: &BuildContext) -> Vec<&'static str> {
        vec!["meson", "ninja"]
    }

    fn build_commands(&self, _module: &Module, _ctx: &BuildContext) -> Vec<&'static str> {
        vec!["ninja"]
    }

    fn build_options_key(&self, _module: &Module, _ctx: &BuildContext) -> &'static str {
        "ninja-options"
    }

    fn supports_auto_parallelism(&self, _module: &Module, _ctx: &BuildContext) -> bool {
        // meson requires ninja, so this is supported by default.
        true
    }

    fn configure(&self, module: &Module, ctx: &mut BuildContext) -> Result<bool> {
        let sourcedir = module.fullpath(ctx, DirType::Source)?;
        let builddir = module.fullpath(ctx, DirType::Build)?;
        let installdir = module.installation_path(ctx);

        let setup_options_raw = module
            .get_option_module("configure-flags")
            .map(|v| v.as_str().into_owned())
            .unwrap_or_default();
        let setup_options = shell_words::split(&setup_options_raw)
            .map_err(|err| BuildError::config(format!("configure-flags: {err}")))?;

        let mut commands = vec![
            "meson".to_string(),
            "setup".to_string(),
            builddir.to_string_lossy().into_owned(),
            "--prefix".to_string(),
            installdir,
        ];
        commands.extend(setup_options);

        configure_with_digest(
            module,
            ctx,
            "meson-setup",
            &sourcedir,
            &commands,
            "last-configure-flags",
            "build.ninja",
        )
    }
}
