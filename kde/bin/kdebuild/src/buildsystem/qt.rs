// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use tracing::{error, info, warn};

use crate::buildsystem::{configure_with_digest, BuildSystem};
use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::module::{DirType, Module};

/// Build system for the Qt toolkit's own configure script.
pub struct Qt;

impl BuildSystem for Qt {
    fn name(&self) -> &'static str {
        "Qt5"
    }

    fn configure(&self, module: &Module, ctx: &mut BuildContext) -> Result<bool> {
        let srcdir = module.fullpath(ctx, DirType::Source)?;
        let builddir = module.fullpath(ctx, DirType::Build)?;
        let script = srcdir.join("configure");

        if !script.exists() && !ctx.pretend {
            error!("\tMissing configure script for {}", module.name());
            return Ok(false);
        }

        let flags_raw = module.get_option_str(ctx, "configure-flags");
        let mut commands = shell_words::split(&flags_raw)
            .map_err(|err| BuildError::config(format!("configure-flags: {err}")))?;
        commands.push("-confirm-license".to_string());
        commands.push("-opensource".to_string());
        commands.push("-nomake".to_string());
        commands.push("examples".to_string());
        commands.push("-nomake".to_string());
        commands.push("tests".to_string());

        let cxxflags = module.get_option_str(ctx, "cxxflags");
        ctx.queue_environment_variable("CXXFLAGS", &cxxflags);

        let installdir = module.get_option_str(ctx, "install-dir");
        let qt_installdir = module.get_option_str(ctx, "qt-install-dir");
        if !installdir.is_empty() && !qt_installdir.is_empty() && installdir != qt_installdir {
            warn!(
                " * Building Qt, but install-dir ({installdir}) is not the qt-install-dir \
                 ({qt_installdir}); try setting qt-install-dir to the Qt module's install-dir."
            );
        }
        let installdir = if installdir.is_empty() {
            qt_installdir
        } else {
            installdir
        };

        if commands.iter().any(|c| c == "-prefix" || c.starts_with("-prefix=")) {
            warn!(
                " * You have the -prefix option in your {} configure flags; kdebuild adds \
                 -prefix itself, so you do not need to.",
                module.name()
            );
        }
        commands.push("-prefix".to_string());
        commands.push(installdir);
        commands.insert(0, script.to_string_lossy().into_owned());

        info!("\tRunning configure...");
        configure_with_digest(
            module,
            ctx,
            "configure",
            &builddir,
            &commands,
            "last-configure-flags",
            "Makefile",
        )
    }
}
