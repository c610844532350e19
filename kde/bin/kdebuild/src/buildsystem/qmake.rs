// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use tracing::{error, info};

use crate::buildsystem::BuildSystem;
use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::launch::{locate_exe, run_logged};
use crate::module::{DirType, Module};

/// Modules built with qmake.
pub struct QMake;

impl QMake {
    /// The actual executable name may not be `qmake`, as some
    /// distributions rename it for co-installability.
    pub fn abs_path_to_qmake() -> Option<PathBuf> {
        ["qmake-qt5", "qmake5", "qmake-mac", "qmake", "qmake-qt4", "qmake4"]
            .iter()
            .find_map(|candidate| locate_exe(candidate))
    }

    fn project_files(module: &Module, ctx: &BuildContext) -> Result<Vec<PathBuf>> {
        let sourcedir = if QMake.needs_builddir_hack(module, ctx) {
            module.fullpath(ctx, DirType::Build)?
        } else {
            module.fullpath(ctx, DirType::Source)?
        };
        let mut files: Vec<PathBuf> = std::fs::read_dir(&sourcedir)
            .map(|entries| {
                entries
                    .flatten()
                    .map(|entry| entry.path())
                    .filter(|path| path.extension().map(|e| e == "pro").unwrap_or(false))
                    .collect()
            })
            .unwrap_or_default();
        files.sort();
        Ok(files)
    }
}

impl BuildSystem for QMake {
    fn name(&self) -> &'static str {
        "qmake"
    }

    fn required_programs(&self, _module: &Module, _ctx: &BuildContext) -> Vec<&'static str> {
        vec!["qmake"]
    }

    /// QMake-using modules generally build fine out-of-source, except the
    /// Qt5 modules past qtbase; assume code.qt.io modules all need the
    /// in-tree layout.
    fn needs_builddir_hack(&self, module: &Module, ctx: &BuildContext) -> bool {
        module.get_option_str(ctx, "repository").contains("qt.io")
    }

    fn configure(&self, module: &Module, ctx: &mut BuildContext) -> Result<bool> {
        let builddir = module.fullpath(ctx, DirType::Build)?;

        let qmake_opts_raw = module.get_option_str(ctx, "qmake-options");
        let qmake_opts = shell_words::split(&qmake_opts_raw)
            .map_err(|err| BuildError::config(format!("qmake-options: {err}")))?;

        let mut project_files = Self::project_files(module, ctx)?;
        if project_files.is_empty() && ctx.pretend {
            project_files.push(PathBuf::from(format!("{}.pro", module.name())));
        }

        if project_files.is_empty() {
            return Err(BuildError::internal(format!(
                "No *.pro files could be found for {}",
                module.name()
            )));
        }
        if project_files.len() > 1 {
            error!(" * Too many possible *.pro files for {}", module.name());
            return Ok(false);
        }

        let Some(qmake) = Self::abs_path_to_qmake() else {
            return Ok(false);
        };

        info!("\tRunning qmake...");
        let mut commands = vec![qmake.to_string_lossy().into_owned()];
        commands.extend(qmake_opts);
        commands.push(project_files[0].to_string_lossy().into_owned());

        Ok(run_logged(module, ctx, "qmake", Some(&builddir), &commands)? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionValue;
    use tempfile::tempdir;

    #[test]
    fn zero_pro_files_is_an_error() {
        let dir = tempdir().unwrap();
        let mut ctx = BuildContext::new();
        for key in ["source-dir", "build-dir", "log-dir"] {
            ctx.set_option(
                key,
                OptionValue::Str(dir.path().join(key).to_string_lossy().into_owned()),
            )
            .unwrap();
        }
        let module = Module::new(&ctx, "m");
        let srcdir = module.fullpath(&ctx, DirType::Source).unwrap();
        std::fs::create_dir_all(&srcdir).unwrap();

        assert!(QMake.configure(&module, &mut ctx).is_err());

        // Multiple .pro files: logged failure, not an internal error.
        std::fs::write(srcdir.join("one.pro"), "").unwrap();
        std::fs::write(srcdir.join("two.pro"), "").unwrap();
        assert!(!QMake.configure(&module, &mut ctx).unwrap());
    }
}
