// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Source updaters. Git is the only supported version control system;
//! KDE-project modules layer some policy on top of the plain git updater.

pub mod git;
pub mod kdeproject;

use std::fs;
use std::path::Path;

use tracing::{error, info, warn};

use crate::buildsystem;
use crate::context::BuildContext;
use crate::error::BuildError;
use crate::ipc::{Ipc, MsgType};
use crate::module::{DirType, Module};
use crate::phase::Phase;

/// Updates one module's sources, reporting the outcome over IPC. Returns
/// false when the update failed (the module is then excluded from the
/// build phase).
pub fn update_module(module: &mut Module, ctx: &mut BuildContext, ipc: &mut Ipc) -> bool {
    let name = module.name().to_string();

    // Announce on the TTY-owning side; per-module log messages always
    // precede the module's status message.
    let _ = ipc.send_log_message("updater", "INFO", &format!("Updating {name}"));

    // This module may use a separate source dir; ensure it exists.
    if let Ok(module_src_base) = module.source_base_dir(ctx) {
        if !ctx.pretend && !module_src_base.exists() {
            if let Err(err) = fs::create_dir_all(&module_src_base) {
                error!(
                    "Unable to create separate source directory for {name}: {}: {err}",
                    module_src_base.display()
                );
                let _ = ipc.send(MsgType::ModuleFailure, &name);
                return false;
            }
        }
    }

    // The path to the source dir may have changed due to layout options or
    // metadata updates; move an old checkout to the new location.
    if let Ok(fullpath) = module.fullpath(ctx, DirType::Source) {
        let old_source_dir = module
            .get_option_module("#last-source-dir")
            .map(|v| v.as_str().into_owned())
            .unwrap_or_default();
        if !ctx.pretend
            && !old_source_dir.is_empty()
            && fullpath != Path::new(&old_source_dir)
            && Path::new(&old_source_dir).is_dir()
            && !fullpath.exists()
        {
            info!(" * Source directory setting has changed to {}.", fullpath.display());
            info!(" * Moving old source directory at {old_source_dir} to the new location.");
            if let Err(err) = fs::rename(&old_source_dir, &fullpath) {
                warn!(" * Unable to move {old_source_dir}: {err}; will generate a new source dir.");
            }
        }
    }

    match git::update_checkout(module, ctx, ipc) {
        Ok(count) => {
            if count > 0 {
                let message = if count == 1 {
                    "1 commit affected.".to_string()
                } else {
                    format!("{count} commits affected.")
                };
                let _ = ipc.notify_update_success(&name, &message);
            } else {
                // The sources didn't change; the build may still be forced
                // by refresh conditions, so pass the reason along.
                let build_system = buildsystem::for_module(module, ctx);
                let refresh_reason =
                    buildsystem::needs_refreshed(build_system.as_ref(), module, ctx)
                        .unwrap_or_default();
                let _ = ipc.send(MsgType::ModuleUptodate, &format!("{name},{refresh_reason}"));
            }
            true
        }
        Err(BuildError::Conflict(msg)) => {
            error!("Error updating {name}: {msg}");
            let _ = ipc.send(MsgType::ModuleConflict, &name);
            module.phases_mut().filter_out(Phase::Build);
            false
        }
        Err(err) => {
            error!("Error updating {name}, removing from list of packages to build.");
            error!(" > {err}");
            ctx.mark_module_phase_failed(Phase::Build, &name);
            let _ = ipc.send(MsgType::ModuleFailure, &name);
            module.phases_mut().filter_out(Phase::Build);
            false
        }
    }
}
