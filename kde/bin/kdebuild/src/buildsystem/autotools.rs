// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use tracing::error;

use crate::buildsystem::BuildSystem;
use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::launch::run_logged;
use crate::module::{DirType, Module};

/// Modules configured with autotools (`configure` or `autogen.sh`).
pub struct Autotools;

impl Autotools {
    /// Finds the configure command to run, regenerating it with autogen.sh
    /// first when the tree ships only the autoconf inputs. A tree with
    /// autoconf inputs but no runner at all is a failure, not a panic.
    fn find_configure_command(module: &Module, ctx: &mut BuildContext) -> Result<String> {
        let sourcedir = module.fullpath(ctx, DirType::Source)?;

        let find_runner = |dir: &std::path::Path| {
            ["configure", "autogen.sh"]
                .iter()
                .find(|item| dir.join(item).exists())
                .copied()
        };
        let configure_command = find_runner(&sourcedir);
        let configure_in_file = ["configure.in", "configure.ac"]
            .iter()
            .find(|item| sourcedir.join(item).exists())
            .copied();

        if let Some(command) = configure_command {
            if command != "autogen.sh" && configure_in_file.is_some() {
                return Ok(command.to_string());
            }
        }

        // A configure.in/.ac with only autogen.sh as a runner means the
        // configure script is generated by autogen.sh, as usual in GNU
        // projects. Run it and recheck.
        if configure_in_file.is_some() && configure_command == Some("autogen.sh") {
            let exitcode = run_logged(
                module,
                ctx,
                "autogen",
                Some(&sourcedir),
                &[sourcedir.join("autogen.sh").to_string_lossy().into_owned()],
            )?;
            if exitcode != 0 {
                return Err(BuildError::runtime(format!(
                    "Autogen failed with exit code {exitcode}"
                )));
            }

            // Clean up any stray Makefile the autogen run may have produced.
            if sourcedir.join("Makefile").exists() {
                let exitcode = run_logged(
                    module,
                    ctx,
                    "distclean",
                    Some(&sourcedir),
                    &["make".to_string(), "distclean".to_string()],
                )?;
                if exitcode != 0 {
                    return Err(BuildError::runtime(format!(
                        "Failed to run make distclean, exit code {exitcode}"
                    )));
                }
            }

            if let Some(found) = find_runner(&sourcedir) {
                return Ok(found.to_string());
            }
        } else if let Some(command) = configure_command {
            // No autoconf inputs to regenerate from; use whatever runner
            // the tree ships directly.
            return Ok(command.to_string());
        }

        if ctx.pretend {
            return Ok("configure".to_string());
        }
        Err(BuildError::runtime("No configure command available"))
    }
}

impl BuildSystem for Autotools {
    fn name(&self) -> &'static str {
        "autotools"
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

        let configure_command = match Self::find_configure_command(module, ctx) {
            Ok(command) => command,
            Err(err) => {
                error!("\tError configuring {}: {err}", module.name());
                return Ok(false);
            }
        };

        let mut commands = vec![
            sourcedir.join(configure_command).to_string_lossy().into_owned(),
            format!("--prefix={installdir}"),
        ];
        commands.extend(flags);

        Ok(run_logged(module, ctx, "configure", Some(&builddir), &commands)? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionValue;
    use tempfile::tempdir;

    fn test_setup(dir: &std::path::Path) -> (BuildContext, Module) {
        let mut ctx = BuildContext::new();
        for key in ["source-dir", "build-dir", "log-dir"] {
            ctx.set_option(
                key,
                OptionValue::Str(dir.join(key).to_string_lossy().into_owned()),
            )
            .unwrap();
        }
        let module = Module::new(&ctx, "m");
        let srcdir = module.fullpath(&ctx, DirType::Source).unwrap();
        std::fs::create_dir_all(&srcdir).unwrap();
        (ctx, module)
    }

    #[test]
    fn prefers_existing_configure_script() {
        let dir = tempdir().unwrap();
        let (mut ctx, module) = test_setup(dir.path());
        let srcdir = module.fullpath(&ctx, DirType::Source).unwrap();
        std::fs::write(srcdir.join("configure"), "").unwrap();
        std::fs::write(srcdir.join("configure.ac"), "").unwrap();

        assert_eq!(
            Autotools::find_configure_command(&module, &mut ctx).unwrap(),
            "configure"
        );
    }

    #[test]
    fn bare_configure_script_is_used_directly() {
        let dir = tempdir().unwrap();
        let (mut ctx, module) = test_setup(dir.path());
        let srcdir = module.fullpath(&ctx, DirType::Source).unwrap();
        std::fs::write(srcdir.join("configure"), "").unwrap();

        assert_eq!(
            Autotools::find_configure_command(&module, &mut ctx).unwrap(),
            "configure"
        );
    }

    #[test]
    fn configure_inputs_without_runner_fail_cleanly() {
        let dir = tempdir().unwrap();
        let (mut ctx, module) = test_setup(dir.path());
        let srcdir = module.fullpath(&ctx, DirType::Source).unwrap();
        // Autoconf inputs only: no configure script, no autogen.sh.
        std::fs::write(srcdir.join("configure.ac"), "").unwrap();

        let err = Autotools::find_configure_command(&module, &mut ctx).unwrap_err();
        assert!(matches!(err, BuildError::Runtime(_)));

        // Pretend mode assumes configure would exist by now.
        ctx.pretend = true;
        assert_eq!(
            Autotools::find_configure_command(&module, &mut ctx).unwrap(),
            "configure"
        );
    }
}
