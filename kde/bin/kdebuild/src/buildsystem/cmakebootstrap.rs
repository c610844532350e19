// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::buildsystem::BuildSystem;
use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::launch::run_logged;
use crate::module::{DirType, Module};

/// Does only one thing: bootstraps CMake onto a system that doesn't have
/// it, or has only an older version of it.
pub struct CMakeBootstrap;

impl BuildSystem for CMakeBootstrap {
    fn name(&self) -> &'static str {
        "cmake-bootstrap"
    }

    fn required_programs(&self, _module: &Module, _ctx: &BuildContext) -> Vec<&'static str> {
        vec!["c++", "make"]
    }

    fn configure(&self, module: &Module, ctx: &mut BuildContext) -> Result<bool> {
        let sourcedir = module.fullpath(ctx, DirType::Source)?;
        let builddir = module.fullpath(ctx, DirType::Build)?;
        let installdir = module.installation_path(ctx);

        let flags_raw = module
            .get_option_module("configure-flags")
            .map(|v| v.as_str().into_owned())
            .unwrap_or_default();
        let flags = shell_words::split(&flags_raw)
            .map_err(|err| BuildError::config(format!("configure-flags: {err}")))?;

        let mut commands = vec![
            sourcedir.join("bootstrap").to_string_lossy().into_owned(),
            format!("--prefix={installdir}"),
        ];
        commands.extend(flags);

        Ok(run_logged(module, ctx, "cmake-bootstrap", Some(&builddir), &commands)? == 0)
    }
}
