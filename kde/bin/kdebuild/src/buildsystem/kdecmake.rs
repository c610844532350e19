// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CMake-based modules, with the environment and option handling KDE
//! projects expect.

use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::buildsystem::{get_list_digest, BuildSystem};
use crate::context::{remake_symlink, BuildContext};
use crate::error::{BuildError, Result};
use crate::launch::run_logged_with_callback;
use crate::module::{DirType, Module};

static CXX_FLAGS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-DCMAKE_CXX_FLAGS(:\w+)?=").unwrap());
static BUILD_TESTING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*-DBUILD_TESTING(:BOOL)?=(ON|TRUE|1)\s*$").unwrap());
static TESTS_FAILED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([0-9]+) tests failed out of").unwrap());

// Bundled templates for the generated .vscode directory.
const VSCODE_C_CPP_PROPERTIES: &str = include_str!("../../data/vscode/c_cpp_properties.json.in");
const VSCODE_SETTINGS: &str = include_str!("../../data/vscode/settings.json.in");
const VSCODE_EXTENSIONS: &str = include_str!("../../data/vscode/extensions.json.in");
const VSCODE_LAUNCH: &str = include_str!("../../data/vscode/launch.json.in");

struct GeneratorInfo {
    options_name: &'static str,
    install_target: &'static str,
    required_programs: &'static [&'static str],
    build_commands: &'static [&'static str],
}

const NINJA_GENERATOR: GeneratorInfo = GeneratorInfo {
    options_name: "ninja-options",
    install_target: "install",
    required_programs: &["ninja", "cmake", "qmake"],
    build_commands: &["ninja"],
};

const MAKEFILES_GENERATOR: GeneratorInfo = GeneratorInfo {
    options_name: "make-options",
    install_target: "install/fast",
    required_programs: &["cmake", "qmake"],
    // Prefer GNU Make if present, otherwise try regular make.
    build_commands: &["gmake", "make"],
};

/// Whitelisted generators, including the extra-generator aliases that are
/// compatible with the base ones.
fn generator_info(generator: &str) -> Option<&'static GeneratorInfo> {
    let base = generator.rsplit(" - ").next().unwrap_or(generator);
    match base {
        "Ninja" => Some(&NINJA_GENERATOR),
        "Unix Makefiles" => Some(&MAKEFILES_GENERATOR),
        _ => None,
    }
}

fn is_whitelisted_generator(generator: &str) -> bool {
    if generator.is_empty() {
        return false;
    }
    match generator.split(" - ").collect::<Vec<_>>().as_slice() {
        [base] => matches!(*base, "Ninja" | "Unix Makefiles"),
        [extra, base] => {
            matches!(*base, "Ninja" | "Unix Makefiles")
                && matches!(
                    *extra,
                    "CodeBlocks" | "CodeLite" | "Sublime Text 2" | "Kate" | "Eclipse CDT4"
                )
        }
        _ => false,
    }
}

/// Removes any `-G GENERATOR` (attached or split) from the options.
fn strip_generator_from_cmake_options(args: &[String]) -> Vec<String> {
    let mut filtered = Vec::with_capacity(args.len());
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if let Some(generator) = arg.strip_prefix("-G") {
            if generator.is_empty() {
                skip_next = true;
            }
            continue;
        }
        filtered.push(arg.clone());
    }
    filtered
}

fn find_generator_in_cmake_options(args: &[String]) -> String {
    let mut take_next = false;
    for arg in args {
        if take_next {
            return arg.clone();
        }
        if let Some(generator) = arg.strip_prefix("-G") {
            if generator.is_empty() {
                take_next = true;
            } else {
                return generator.to_string();
            }
        }
    }
    String::new()
}

fn toolchain_is_ok(toolchain: &str) -> bool {
    !toolchain.is_empty() && Path::new(toolchain).is_file()
}

fn strip_toolchain_from_cmake_options(args: &[String]) -> Vec<String> {
    args.iter()
        .filter(|arg| !arg.starts_with("-DCMAKE_TOOLCHAIN_FILE="))
        .cloned()
        .collect()
}

fn find_toolchain_in_cmake_options(args: &[String]) -> String {
    for arg in args {
        if let Some(file) = arg.strip_prefix("-DCMAKE_TOOLCHAIN_FILE=") {
            if toolchain_is_ok(file) {
                return file.to_string();
            }
            break;
        }
    }
    String::new()
}

pub struct KdeCMake;

impl KdeCMake {
    fn split_cmake_options(module: &Module, ctx: &BuildContext) -> Result<Vec<String>> {
        let raw = module.get_option_str(ctx, "cmake-options");
        shell_words::split(&raw)
            .map_err(|err| BuildError::config(format!("cmake-options: {err}")))
    }

    fn determine_generator(module: &Module, ctx: &BuildContext) -> Result<String> {
        let options = Self::split_cmake_options(module, ctx)?;
        for candidate in [
            find_generator_in_cmake_options(&options),
            module.get_option_str(ctx, "cmake-generator"),
            "Unix Makefiles".to_string(),
        ] {
            if is_whitelisted_generator(&candidate) {
                return Ok(candidate);
            }
        }
        Err(BuildError::internal(format!(
            "Unable to determine CMake generator for: {}",
            module.name()
        )))
    }

    fn determine_toolchain(module: &Module, ctx: &BuildContext) -> String {
        let options = Self::split_cmake_options(module, ctx).unwrap_or_default();
        for candidate in [
            find_toolchain_in_cmake_options(&options),
            module.get_option_str(ctx, "cmake-toolchain"),
        ] {
            if toolchain_is_ok(&candidate) {
                return candidate;
            }
        }
        String::new()
    }

    fn generator_for(module: &Module, ctx: &BuildContext) -> &'static GeneratorInfo {
        Self::determine_generator(module, ctx)
            .ok()
            .and_then(|generator| generator_info(&generator))
            .unwrap_or(&MAKEFILES_GENERATOR)
    }

    /// Generates default config files for VSCode: the settings most KDE
    /// projects need for C++ support, the correct build directory, and
    /// LSP/IntelliSense. An existing `.vscode` entry is left untouched.
    fn generate_vscode_config(&self, module: &Module, ctx: &BuildContext) -> Result<bool> {
        if ctx.pretend {
            info!("\tWould have generated .vscode directory");
            return Ok(false);
        }

        let srcdir = module.fullpath(ctx, DirType::Source)?;
        let build_dir = module.fullpath(ctx, DirType::Build)?;
        let install_dir = module.installation_path(ctx);
        let lib_dir = module.get_option_str(ctx, "libname");
        let config_dir = srcdir.join(".vscode");

        if config_dir.exists() {
            if config_dir.is_dir() {
                debug!("\tGenerating .vscode directory - skipping as it already exists");
            } else {
                error!("\tGenerating .vscode directory - cannot proceed, file .vscode exists");
            }
            return Ok(false);
        }
        debug!(
            "\tGenerating .vscode directory for {}: {}",
            module.name(),
            config_dir.display()
        );
        fs::create_dir(&config_dir)?;

        // settings.json configures the paths for CMake, the install
        // prefix and the runtime environment.
        let settings = VSCODE_SETTINGS
            .replace("$buildDir", &build_dir.to_string_lossy())
            .replace("$installDir", &install_dir)
            .replace("$libDir", &lib_dir);

        let files = [
            // c_cpp_properties.json configures C++, CMake & IntelliSense.
            ("c_cpp_properties.json", VSCODE_C_CPP_PROPERTIES),
            ("settings.json", settings.as_str()),
            // extensions.json recommends extensions to install/enable.
            ("extensions.json", VSCODE_EXTENSIONS),
            // launch.json configures run-with-debugger support.
            ("launch.json", VSCODE_LAUNCH),
        ];
        for (name, content) in files {
            let path = config_dir.join(name);
            if let Err(err) = fs::write(&path, content) {
                warn!("\tCouldn't write to {}: {err}", path.display());
            }
        }
        Ok(true)
    }

    /// Runs cmake to create the build directory, unless the argument
    /// digest matches the last successful run and no reconfigure was
    /// requested.
    fn safe_run_cmake(&self, module: &Module, ctx: &mut BuildContext) -> Result<i32> {
        let generator = Self::determine_generator(module, ctx)?;
        let toolchain = Self::determine_toolchain(module, ctx);
        let srcdir = module.fullpath(ctx, DirType::Source)?;
        let builddir = module.fullpath(ctx, DirType::Build)?;

        let mut commands: Vec<String> = Self::split_cmake_options(module, ctx)?
            .into_iter()
            .filter(|command| !command.trim().is_empty())
            .collect();
        commands = strip_generator_from_cmake_options(&commands);
        commands = strip_toolchain_from_cmake_options(&commands);

        if !toolchain.is_empty() {
            commands.insert(0, format!("-DCMAKE_TOOLCHAIN_FILE={toolchain}"));
        }

        // Generate a compile_commands.json if requested, for clangd tooling.
        if module.get_option_bool(ctx, "compile-commands-export") {
            commands.insert(0, "-DCMAKE_EXPORT_COMPILE_COMMANDS:BOOL=ON".to_string());
        }

        // -DBUILD_foo=OFF for each directory in do-not-compile. Only works
        // if the CMakeLists.txt honors optional subdirectories.
        let masked = module.get_option_str(ctx, "do-not-compile");
        for directory in masked.split_whitespace() {
            commands.push(format!("-DBUILD_{directory}=OFF"));
        }

        // The user's CXXFLAGS, unless already given on the command line.
        let cxxflags = module.get_option_str(ctx, "cxxflags");
        if !cxxflags.is_empty() && !commands.iter().any(|c| CXX_FLAGS_RE.is_match(c)) {
            commands.push(format!("-DCMAKE_CXX_FLAGS:STRING={cxxflags}"));
        }

        let installdir = module.installation_path(ctx);
        commands.push(format!("-DCMAKE_INSTALL_PREFIX={installdir}"));

        // Point at a custom Qt, without overwriting a user-set prefix path.
        let qt_installdir = module.get_option_str(ctx, "qt-install-dir");
        if !qt_installdir.is_empty()
            && qt_installdir != installdir
            && !commands.iter().any(|c| c.trim_start().starts_with("-DCMAKE_PREFIX_PATH"))
        {
            commands.push(format!("-DCMAKE_PREFIX_PATH={qt_installdir}"));
        }

        let run_tests = module.get_option(ctx, "run-tests");
        if run_tests.is_true() && !commands.iter().any(|c| BUILD_TESTING_RE.is_match(c)) {
            debug!("Enabling tests");
            commands.push("-DBUILD_TESTING:BOOL=ON".to_string());
        }
        if run_tests.as_str() == "upload" {
            debug!("Enabling upload of test results");
            commands.push("-DBUILD_experimental:BOOL=ON".to_string());
        }

        for item in ["cmake", "-B", ".", "-S", &srcdir.to_string_lossy(), "-G", &generator]
            .iter()
            .rev()
        {
            commands.insert(0, item.to_string());
        }

        let old_options = module
            .get_persistent_option(ctx, "last-cmake-options")
            .unwrap_or_default();
        let digest = get_list_digest(&commands);

        // CMakeCache.txt should exist only after a successful cmake run.
        if old_options == digest
            && !module.get_option_bool(ctx, "reconfigure")
            && builddir.join("CMakeCache.txt").exists()
        {
            return Ok(0);
        }

        info!("\tRunning cmake targeting {generator}...");

        // Remove any stray CMakeCache.txt to avoid in-source contamination.
        for dir in [&srcdir, &builddir] {
            let stray = dir.join("CMakeCache.txt");
            if stray.exists() {
                let _ = fs::remove_file(stray);
            }
        }

        module.set_persistent_option(ctx, "last-cmake-options", digest);
        crate::launch::run_logged(module, ctx, "cmake", Some(&builddir), &commands)
    }
}

impl BuildSystem for KdeCMake {
    fn name(&self) -> &'static str {
        "KDE CMake"
    }

    fn configured_module_file_name(&self, _module: &Module, _ctx: &BuildContext) -> &'static str {
        "cmake_install.cmake"
    }

    fn required_programs(&self, module: &Module, ctx: &BuildContext) -> Vec<&'static str> {
        Self::generator_for(module, ctx).required_programs.to_vec()
    }

    fn build_commands(&self, module: &Module, ctx: &BuildContext) -> Vec<&'static str> {
        Self::generator_for(module, ctx).build_commands.to_vec()
    }

    fn build_options_key(&self, module: &Module, ctx: &BuildContext) -> &'static str {
        Self::generator_for(module, ctx).options_name
    }

    fn install_target(&self, module: &Module, ctx: &BuildContext) -> String {
        if !module.get_option_str(ctx, "custom-build-command").is_empty() {
            return "install".to_string();
        }
        Self::generator_for(module, ctx).install_target.to_string()
    }

    /// True when CMake drives ninja, which sets -j automatically.
    fn supports_auto_parallelism(&self, module: &Module, ctx: &BuildContext) -> bool {
        Self::generator_for(module, ctx).options_name == "ninja-options"
    }

    fn has_toolchain(&self, module: &Module, ctx: &BuildContext) -> bool {
        !Self::determine_toolchain(module, ctx).is_empty()
    }

    fn prepare_module_build_environment(
        &self,
        module: &Module,
        ctx: &mut BuildContext,
        prefix: &str,
    ) {
        // With a custom toolchain the toolchain definitions take care of
        // themselves.
        if self.has_toolchain(module, ctx) {
            return;
        }

        // Avoid moving /usr up in env vars.
        if prefix != "/usr" {
            // The normal CMake "config" mode files for find_package().
            ctx.prepend_environment_value("CMAKE_PREFIX_PATH", prefix);
            // Older "module" mode find_package() calls.
            ctx.prepend_environment_value(
                "CMAKE_MODULE_PATH",
                &format!("{prefix}/lib64/cmake:{prefix}/lib/cmake"),
            );
            // Plugin paths for configuration-time access, e.g. by ECM.
            ctx.prepend_environment_value(
                "QT_PLUGIN_PATH",
                &format!("{prefix}/lib64/plugins:{prefix}/lib/plugins"),
            );
            ctx.prepend_environment_value("XDG_DATA_DIRS", &format!("{prefix}/share"));
        }

        let qt_installdir = module.get_option_str(ctx, "qt-install-dir");
        if !qt_installdir.is_empty() && qt_installdir != prefix {
            // Ensure we can find Qt's own CMake modules.
            ctx.prepend_environment_value("CMAKE_PREFIX_PATH", &qt_installdir);
            ctx.prepend_environment_value(
                "CMAKE_MODULE_PATH",
                &format!("{qt_installdir}/lib/cmake"),
            );
        }
    }

    fn configure(&self, module: &Module, ctx: &mut BuildContext) -> Result<bool> {
        if module.get_option_bool(ctx, "generate-vscode-project-config") {
            self.generate_vscode_config(module, ctx)?;
        } else {
            debug!("\tGenerating .vscode directory - disabled for this module");
        }

        if self.safe_run_cmake(module, ctx)? != 0 {
            return Ok(false);
        }

        // Link compile_commands.json back into the source dir if wanted, so
        // tools like clangd work out of the box.
        if module.get_option_bool(ctx, "compile-commands-linking") {
            let builddir = module.fullpath(ctx, DirType::Build)?;
            let srcdir = module.fullpath(ctx, DirType::Source)?;
            let generated = builddir.join("compile_commands.json");
            if generated.exists() {
                remake_symlink(&generated, &srcdir.join("compile_commands.json"))?;
            }
        }
        Ok(true)
    }

    fn run_testsuite(&self, module: &Module, ctx: &mut BuildContext) -> Result<bool> {
        // The tests were already built when we ran CMake; just run them.
        let make_target = if module.get_option_str(ctx, "run-tests") == "upload" {
            "Experimental"
        } else {
            "test"
        };
        info!("\tRunning test suite...");

        let build_command = self
            .build_commands(module, ctx)
            .into_iter()
            .find_map(|candidate| crate::launch::locate_exe(candidate))
            .ok_or_else(|| BuildError::runtime("No build command available for tests"))?;

        let builddir = module.fullpath(ctx, DirType::Build)?;
        let mut num_tests = "Some".to_string();
        let mut on_line = |line: &str| {
            if let Some(caps) = TESTS_FAILED_RE.captures(line) {
                num_tests = caps[1].to_string();
            }
        };
        let exitcode = run_logged_with_callback(
            module,
            ctx,
            "test-results",
            Some(&builddir),
            &[
                build_command.to_string_lossy().into_owned(),
                make_target.to_string(),
            ],
            Some(&mut on_line),
        )?;

        if exitcode != 0 {
            warn!(
                "\t{num_tests} tests failed for {}, consult test-results.log for info",
                module.name()
            );
        } else {
            info!("\tAll tests ran successfully.");
        }
        Ok(exitcode == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionValue;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn generator_whitelist() {
        assert!(is_whitelisted_generator("Ninja"));
        assert!(is_whitelisted_generator("Unix Makefiles"));
        assert!(is_whitelisted_generator("Kate - Ninja"));
        assert!(is_whitelisted_generator("Eclipse CDT4 - Unix Makefiles"));
        assert!(!is_whitelisted_generator("Xcode"));
        assert!(!is_whitelisted_generator("Visual Studio 17"));
        assert!(!is_whitelisted_generator(""));
    }

    #[test]
    fn generator_stripping() {
        let args: Vec<String> = vec![
            "-DFOO=1".into(),
            "-G".into(),
            "Ninja".into(),
            "-GXcode".into(),
            "-DBAR=2".into(),
        ];
        assert_eq!(
            strip_generator_from_cmake_options(&args),
            vec!["-DFOO=1".to_string(), "-DBAR=2".to_string()]
        );
        assert_eq!(find_generator_in_cmake_options(&args), "Ninja");
    }

    #[test]
    fn toolchain_detection_requires_readable_file() {
        let dir = tempdir().unwrap();
        let toolchain = dir.path().join("cross.cmake");
        std::fs::write(&toolchain, "").unwrap();
        let args = vec![format!("-DCMAKE_TOOLCHAIN_FILE={}", toolchain.display())];
        assert_eq!(
            find_toolchain_in_cmake_options(&args),
            toolchain.to_string_lossy()
        );
        assert_eq!(strip_toolchain_from_cmake_options(&args), Vec::<String>::new());

        let missing = vec!["-DCMAKE_TOOLCHAIN_FILE=/no/such/file".to_string()];
        assert_eq!(find_toolchain_in_cmake_options(&missing), "");
    }

    fn test_context(dir: &Path) -> BuildContext {
        let mut ctx = BuildContext::new();
        for key in ["source-dir", "build-dir", "log-dir"] {
            ctx.set_option(
                key,
                OptionValue::Str(dir.join(key).to_string_lossy().into_owned()),
            )
            .unwrap();
        }
        ctx
    }

    #[test]
    fn cmake_argument_assembly() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        ctx.set_option("install-dir", "/opt/kde".into()).unwrap();
        ctx.pretend = true;

        let mut module = Module::new(&ctx, "juk");
        module
            .set_option("cmake-options", "-DFOO=1 -G Xcode".into())
            .unwrap();
        module.set_option("do-not-compile", "autotests docs".into()).unwrap();

        // Pretend mode: cmake isn't run but the digest bookkeeping is
        // exercised via safe_run_cmake's argument construction.
        let code = KdeCMake.safe_run_cmake(&module, &mut ctx).unwrap();
        assert_eq!(code, 0);
        let digest = ctx.state.get_str("juk", "last-cmake-options").unwrap();
        assert!(!digest.is_empty());
    }

    #[test]
    fn vscode_config_generation_substitutes_paths() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        ctx.set_option("install-dir", "/opt/kde".into()).unwrap();
        ctx.set_option("libname", "lib64".into()).unwrap();

        let module = Module::new(&ctx, "juk");
        let srcdir = module.fullpath(&ctx, DirType::Source).unwrap();
        std::fs::create_dir_all(&srcdir).unwrap();

        assert!(KdeCMake.generate_vscode_config(&module, &ctx).unwrap());

        let config_dir = srcdir.join(".vscode");
        for file in [
            "c_cpp_properties.json",
            "settings.json",
            "extensions.json",
            "launch.json",
        ] {
            assert!(config_dir.join(file).exists(), "{file} missing");
        }

        let settings = std::fs::read_to_string(config_dir.join("settings.json")).unwrap();
        let build_dir = module.fullpath(&ctx, DirType::Build).unwrap();
        assert!(settings.contains(&build_dir.to_string_lossy().into_owned()));
        assert!(settings.contains("/opt/kde/lib64"));
        assert!(!settings.contains("$buildDir"));
        assert!(!settings.contains("$installDir"));
        assert!(!settings.contains("$libDir"));
    }

    #[test]
    fn vscode_config_leaves_existing_directory_alone() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        let module = Module::new(&ctx, "juk");
        let srcdir = module.fullpath(&ctx, DirType::Source).unwrap();
        let config_dir = srcdir.join(".vscode");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("settings.json"), "{\"mine\": true}").unwrap();

        assert!(!KdeCMake.generate_vscode_config(&module, &ctx).unwrap());
        let settings = std::fs::read_to_string(config_dir.join("settings.json")).unwrap();
        assert_eq!(settings, "{\"mine\": true}");
    }

    #[test]
    fn vscode_config_skipped_when_pretending() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        ctx.pretend = true;
        let module = Module::new(&ctx, "juk");

        assert!(!KdeCMake.generate_vscode_config(&module, &ctx).unwrap());
        let srcdir = module.fullpath(&ctx, DirType::Source).unwrap();
        assert!(!srcdir.join(".vscode").exists());
    }
}
