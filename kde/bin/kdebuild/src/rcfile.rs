// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The rc-file reader: a line-oriented format of `global`, `module`,
//! `module-set` and `options` sections, with recursive `include` support
//! and `${option}` substitution.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::context::{home_dir, BuildContext};
use crate::error::{BuildError, Result};
use crate::module::Module;
use crate::moduleset::ModuleSet;
use crate::options::OptionValue;

static INCLUDE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*include\s+(.+?)\s*$").unwrap());
static OPTION_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([-\w]+)(?:\s+(.*))?$").unwrap());
static OPTION_REF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([a-zA-Z0-9_-]+)\}").unwrap());
static MODULE_OR_OPTIONS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(options|module)\s+([-/.\w]+)\s*$").unwrap());
static MODULE_SET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*module-set\s*([-/.\w]+)?\s*$").unwrap());
static END_SECTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*end[\w\s]*$").unwrap());
static TILDE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(^|:|=)~/").unwrap());

/// A top-level declaration from the rc-file, in declaration order.
#[derive(Clone, Debug)]
pub enum Declaration {
    Module(Module),
    ModuleSet(ModuleSet),
}

/// A free-standing `options NAME` block, applied over the matching module
/// after module-set expansion.
#[derive(Clone, Debug)]
pub struct DeferredOptions {
    pub name: String,
    pub options: Vec<(String, OptionValue)>,
    pub entry_num: u32,
}

#[derive(Debug, Default)]
pub struct ConfigReadResult {
    pub declarations: Vec<Declaration>,
    pub deferred: Vec<DeferredOptions>,
}

struct OpenFile {
    reader: BufReader<File>,
    path: PathBuf,
    lineno: u32,
}

/// Reads config lines across `include` boundaries: an included file is
/// read to completion before the including file resumes, recursively. A
/// base-path stack keeps relative includes anchored to the including
/// file's directory.
struct RecursiveReader {
    stack: Vec<OpenFile>,
    base_paths: Vec<PathBuf>,
}

impl RecursiveReader {
    fn new(rcfile: &Path) -> Result<Self> {
        let file = File::open(rcfile)
            .map_err(|err| BuildError::config(format!("{}: {err}", rcfile.display())))?;
        let base = rcfile.parent().unwrap_or_else(|| Path::new("/")).to_path_buf();
        Ok(RecursiveReader {
            stack: vec![OpenFile {
                reader: BufReader::new(file),
                path: rcfile.to_path_buf(),
                lineno: 0,
            }],
            base_paths: vec![base],
        })
    }

    fn current_location(&self) -> String {
        match self.stack.last() {
            Some(open) => format!("{}:{}", open.path.display(), open.lineno),
            None => "<eof>".to_string(),
        }
    }

    /// Reads the next raw line, transparently entering include files.
    fn read_line(&mut self, ctx: &BuildContext) -> Result<Option<String>> {
        loop {
            let Some(open) = self.stack.last_mut() else {
                return Ok(None);
            };

            let mut line = String::new();
            let read = open
                .reader
                .read_line(&mut line)
                .map_err(|err| BuildError::config(format!("{}: {err}", open.path.display())))?;
            if read == 0 {
                self.stack.pop();
                self.base_paths.pop();
                continue;
            }
            open.lineno += 1;

            if let Some(caps) = INCLUDE_RE.captures(line.trim_end_matches('\n')) {
                let mut filename = caps[1].to_string();

                // Substitute ${option} references against the global
                // options read so far.
                filename = substitute_options(ctx, &filename, &self.current_location());

                let filename = if let Some(rest) = filename.strip_prefix("~/") {
                    home_dir().join(rest)
                } else if filename.starts_with('/') {
                    PathBuf::from(filename)
                } else {
                    self.base_paths
                        .last()
                        .cloned()
                        .unwrap_or_default()
                        .join(filename)
                };

                let file = File::open(&filename).map_err(|err| {
                    BuildError::config(format!(
                        "Unable to open file '{}' which was included from {}: {err}",
                        filename.display(),
                        self.current_location()
                    ))
                })?;
                let base = filename.parent().unwrap_or_else(|| Path::new("/")).to_path_buf();
                self.stack.push(OpenFile {
                    reader: BufReader::new(file),
                    path: filename,
                    lineno: 0,
                });
                self.base_paths.push(base);
                continue;
            }

            return Ok(Some(line.trim_end_matches('\n').to_string()));
        }
    }

    /// Reads a logical line: stripped of comments and blank lines, with
    /// backslash-continued physical lines merged into one.
    fn read_logical_line(&mut self, ctx: &BuildContext) -> Result<Option<String>> {
        while let Some(mut line) = self.read_line(ctx)? {
            // Merge continuation lines before stripping comments.
            while let Some(stripped) = strip_continuation(&line) {
                line = stripped;
                match self.read_line(ctx)? {
                    Some(next) => line.push_str(&next),
                    None => break,
                }
            }

            if let Some(comment_start) = line.find('#') {
                line.truncate(comment_start);
            }
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(line));
        }
        Ok(None)
    }
}

fn strip_continuation(line: &str) -> Option<String> {
    let trimmed = line.trim_end();
    trimmed.strip_suffix('\\').map(|rest| rest.to_string())
}

/// Replaces `${option}` references with values from the global context,
/// warning about (and blanking) undefined ones.
fn substitute_options(ctx: &BuildContext, value: &str, location: &str) -> String {
    let mut result = value.to_string();
    while let Some(caps) = OPTION_REF_RE.captures(&result) {
        let name = caps[1].to_string();
        let replacement = match ctx.get_option(&name) {
            Some(value) => value.as_str().into_owned(),
            None => {
                warn!(" * WARNING: {name} is not set at {location}");
                String::new()
            }
        };
        debug!("Substituting ${name} with {replacement}");
        result = result.replacen(&format!("${{{name}}}"), &replacement, 1);
    }
    result
}

/// Extracts an option name and simplified value from a config line: the
/// value has whitespace collapsed, `${option}` references substituted,
/// tildes in path-like positions expanded, and the literals true/false
/// converted to booleans.
fn split_option_and_value(
    ctx: &BuildContext,
    line: &str,
    location: &str,
) -> Result<(String, OptionValue)> {
    let caps = OPTION_LINE_RE.captures(line).ok_or_else(|| {
        BuildError::config(format!("Invalid option line at {location}: {line}"))
    })?;
    let option = caps[1].to_string();
    let raw_value = caps.get(2).map(|m| m.as_str()).unwrap_or("").trim();

    // Simplify whitespace.
    let mut value = raw_value.split_whitespace().collect::<Vec<_>>().join(" ");
    value = substitute_options(ctx, &value, location);

    // Replace tildes with the home directory in path-like positions.
    let home = home_dir().to_string_lossy().into_owned();
    loop {
        let Some((start, len, anchor)) = TILDE_RE.find(&value).map(|found| {
            // The anchor is the ^, :, or = part of the match, if any.
            let anchor_len = found.len() - 2;
            (
                found.start(),
                found.len(),
                found.as_str()[..anchor_len].to_string(),
            )
        }) else {
            break;
        };
        let head = value[..start].to_string();
        let rest = value[start + len..].to_string();
        value = format!("{head}{anchor}{home}/{rest}");
    }

    let value = match value.as_str() {
        "true" => OptionValue::Bool(true),
        "false" => OptionValue::Bool(false),
        other => OptionValue::Str(other.to_string()),
    };
    Ok((option, value))
}

/// What kind of section an option block belongs to, for error reporting
/// and termination matching.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SectionKind {
    Global,
    Module,
    ModuleSet,
    Options,
}

impl SectionKind {
    fn end_word(self) -> &'static str {
        match self {
            SectionKind::Global => "global",
            SectionKind::Module => "module",
            SectionKind::ModuleSet => "module-set",
            SectionKind::Options => "options",
        }
    }
}

/// The rc-file parser. Produces a merged set of global options applied to
/// the context, the ordered module/module-set declarations, and the list
/// of deferred options blocks.
pub struct ConfigReader {
    /// Monotonic id per parsed block; used to decide whether a deferred
    /// options block was read after the module's own declaration.
    entry_num: u32,
    /// Creation order counter for build-order tiebreaks; module-sets
    /// reserve enough ids for their expanded children.
    creation_order: u32,
}

impl Default for ConfigReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigReader {
    pub fn new() -> Self {
        ConfigReader {
            entry_num: 0,
            creation_order: 0,
        }
    }

    /// Reads the configuration, applying global options to the context
    /// (command-line options win over rc-file globals).
    pub fn read_configuration(
        &mut self,
        ctx: &mut BuildContext,
        rcfile: &Path,
        cmdline_global_options: &[(String, OptionValue)],
    ) -> Result<ConfigReadResult> {
        let mut reader = RecursiveReader::new(rcfile)?;
        let mut result = ConfigReadResult::default();

        // The first section must be a global options declaration, even if
        // none are defined.
        let Some(first) = reader.read_logical_line(ctx)? else {
            warn!(" * There do not seem to be any modules to build in your configuration.");
            return Ok(result);
        };
        if first.trim() != "global" {
            return Err(BuildError::config(format!(
                "Invalid configuration file {}: expecting global settings section at {}",
                rcfile.display(),
                reader.current_location()
            )));
        }

        let global_options = self.parse_option_block(ctx, &mut reader, SectionKind::Global)?;
        let cmdline_keys: Vec<&String> =
            cmdline_global_options.iter().map(|(key, _)| key).collect();
        for (key, value) in global_options {
            // Options the user passed on the command line must not be
            // overwritten by the config file.
            if cmdline_keys.contains(&&key) {
                continue;
            }
            ctx.set_option(&key, value)?;
        }

        let mut seen_modules: Vec<String> = Vec::new();
        let mut seen_module_sets: Vec<String> = Vec::new();

        while let Some(line) = reader.read_logical_line(ctx)? {
            let location = reader.current_location();

            if let Some(caps) = MODULE_OR_OPTIONS_RE.captures(&line) {
                let section = caps[1].to_string();
                let module_name = caps[2].to_string();

                if section == "options" {
                    let options =
                        self.parse_option_block(ctx, &mut reader, SectionKind::Options)?;
                    // No duplicate checking here: common include files are
                    // legitimately read more than once.
                    result.deferred.push(DeferredOptions {
                        name: module_name,
                        options,
                        entry_num: self.entry_num,
                    });
                    continue;
                }

                if seen_modules.contains(&module_name) {
                    return Err(BuildError::config(format!(
                        "Duplicate module {module_name} declared at {location}"
                    )));
                }
                if seen_module_sets.contains(&module_name) {
                    return Err(BuildError::config(format!(
                        "Can't re-use name {module_name} for module defined at {location}"
                    )));
                }

                let mut module = Module::new(ctx, &module_name);
                let _ = module.set_option("#defined-at", location.clone().into());
                let options = self.parse_option_block(ctx, &mut reader, SectionKind::Module)?;
                for (key, value) in options {
                    module.set_option(&key, value).map_err(|err| {
                        augment_config_error(err, &location)
                    })?;
                }
                self.creation_order += 1;
                module.set_create_id(self.creation_order);
                let _ = module
                    .set_option("#entry_num", self.entry_num.to_string().into());
                seen_modules.push(module_name);
                result.declarations.push(Declaration::Module(module));
                continue;
            }

            if let Some(caps) = MODULE_SET_RE.captures(&line) {
                let set_name = caps
                    .get(1)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();

                if !set_name.is_empty() {
                    if seen_module_sets.contains(&set_name) {
                        return Err(BuildError::config(format!(
                            "Duplicate module-set {set_name} defined at {location}"
                        )));
                    }
                    if seen_modules.contains(&set_name) {
                        return Err(BuildError::config(format!(
                            "Can't re-use name {set_name} for module-set defined at {location}"
                        )));
                    }
                }

                let internal_name = if set_name.is_empty() {
                    format!("Unnamed module-set at {location}")
                } else {
                    set_name.clone()
                };
                let mut module_set = ModuleSet::new(ctx, &internal_name);
                let options =
                    self.parse_option_block(ctx, &mut reader, SectionKind::ModuleSet)?;
                for (key, value) in options {
                    module_set.set_option(&key, value).map_err(|err| {
                        augment_config_error(err, &location)
                    })?;
                }
                module_set.finalize();
                module_set.validate(ctx)?;

                self.creation_order += 1;
                module_set.set_create_id(self.creation_order);
                // Reserve creation ids for all named modules of the set.
                self.creation_order += module_set.modules_to_find().len() as u32;

                if !set_name.is_empty() {
                    seen_module_sets.push(set_name);
                }
                result.declarations.push(Declaration::ModuleSet(module_set));
                continue;
            }

            return Err(BuildError::config(format!(
                "Expecting a start of module section at {location}"
            )));
        }

        if result.declarations.is_empty() {
            warn!(" * There do not seem to be any modules to build in your configuration.");
        }
        Ok(result)
    }

    /// Reads option lines until the section terminator, validating keys
    /// and applying `_`-prefixed user variables to the context right away
    /// (so later substitutions can see them).
    fn parse_option_block(
        &mut self,
        ctx: &mut BuildContext,
        reader: &mut RecursiveReader,
        kind: SectionKind,
    ) -> Result<Vec<(String, OptionValue)>> {
        self.entry_num += 1;
        let mut options = Vec::new();

        loop {
            let location = reader.current_location();
            let Some(line) = reader.read_logical_line(ctx)? else {
                return Err(BuildError::config(format!(
                    "Missing 'end {}' for section started near {location}",
                    kind.end_word()
                )));
            };

            if END_SECTION_RE.is_match(&line) {
                return Ok(options);
            }

            // Sanity check: a new section opener means the previous one was
            // never terminated.
            if MODULE_OR_OPTIONS_RE.is_match(&line)
                || MODULE_SET_RE.is_match(&line)
                || line.trim() == "global"
            {
                return Err(BuildError::config(format!(
                    "Invalid configuration file at {location}: add an 'end {}' before \
                     starting a new module.",
                    kind.end_word()
                )));
            }

            let location = reader.current_location();
            let (option, value) = split_option_and_value(ctx, &line, &location)?;

            if option.starts_with('_') {
                // User variables merge into the context immediately so
                // that they are usable while still parsing.
                ctx.set_option(&option, value)?;
                continue;
            }

            if !ctx.is_known_option(&option) {
                return Err(BuildError::config(format!(
                    "Unrecognized option \"{option}\" found at {location}"
                )));
            }

            options.push((option, value));
        }
    }
}

fn augment_config_error(err: BuildError, location: &str) -> BuildError {
    match err {
        BuildError::Config(msg) => BuildError::Config(format!("{location}: {msg}")),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moduleset::ModuleSetKind;
    use crate::phase::Phase;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_rc(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    fn read(content: &str) -> (BuildContext, ConfigReadResult) {
        let dir = tempdir().unwrap();
        let rcfile = write_rc(dir.path(), "kdesrc-buildrc", content);
        let mut ctx = BuildContext::new();
        let result = ConfigReader::new()
            .read_configuration(&mut ctx, &rcfile, &[])
            .unwrap();
        (ctx, result)
    }

    #[test]
    fn parses_global_and_module_sections() {
        let (ctx, result) = read(
            "global\n\
             \tbranch-group kf6-qt6\n\
             \tinstall-dir ~/kde/usr  # prefix\n\
             end global\n\
             \n\
             module juk\n\
             \tbranch fancy\n\
             \tno-src\n\
             end module\n",
        );
        assert_eq!(ctx.get_option_str("branch-group"), "kf6-qt6");
        assert!(ctx.get_option_str("install-dir").ends_with("/kde/usr"));

        assert_eq!(result.declarations.len(), 1);
        let Declaration::Module(module) = &result.declarations[0] else {
            panic!("expected a module");
        };
        assert_eq!(module.name(), "juk");
        assert_eq!(module.get_option_module("branch").unwrap().as_str(), "fancy");
        assert!(!module.phases().has(Phase::Update));
        assert_eq!(module.create_id(), 1);
    }

    #[test]
    fn continuation_lines_merge() {
        let (_, result) = read(
            "global\n\
             end global\n\
             module app\n\
             \tcmake-options -DFOO=1 \\\n\
             \t\t-DBAR=2\n\
             end module\n",
        );
        let Declaration::Module(module) = &result.declarations[0] else {
            panic!("expected a module");
        };
        assert_eq!(
            module.get_option_module("cmake-options").unwrap().as_str(),
            "-DFOO=1 -DBAR=2"
        );
    }

    #[test]
    fn user_variables_substitute_immediately() {
        let (ctx, result) = read(
            "global\n\
             \t_ver 6\n\
             \tbranch kf${_ver}\n\
             end global\n\
             module app\n\
             \tbranch v${_ver}\n\
             end module\n",
        );
        assert_eq!(ctx.get_option_str("branch"), "kf6");
        let Declaration::Module(module) = &result.declarations[0] else {
            panic!("expected a module");
        };
        assert_eq!(module.get_option_module("branch").unwrap().as_str(), "v6");
    }

    #[test]
    fn literal_booleans_convert() {
        let (ctx, _) = read(
            "global\n\
             \tinclude-dependencies false\n\
             \tstop-on-failure true\n\
             end global\n",
        );
        assert!(!ctx.get_option_bool("include-dependencies"));
        assert!(ctx.get_option_bool("stop-on-failure"));
    }

    #[test]
    fn unknown_option_is_config_error() {
        let dir = tempdir().unwrap();
        let rcfile = write_rc(
            dir.path(),
            "kdesrc-buildrc",
            "global\n\tcmake-optionz oops\nend global\n",
        );
        let mut ctx = BuildContext::new();
        let err = ConfigReader::new()
            .read_configuration(&mut ctx, &rcfile, &[])
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn duplicate_module_is_config_error() {
        let dir = tempdir().unwrap();
        let rcfile = write_rc(
            dir.path(),
            "kdesrc-buildrc",
            "global\nend global\n\
             module juk\nend module\n\
             module juk\nend module\n",
        );
        let mut ctx = BuildContext::new();
        let err = ConfigReader::new()
            .read_configuration(&mut ctx, &rcfile, &[])
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn module_and_set_share_namespace() {
        let dir = tempdir().unwrap();
        let rcfile = write_rc(
            dir.path(),
            "kdesrc-buildrc",
            "global\nend global\n\
             module juk\nend module\n\
             module-set juk\n\trepository kde-projects\n\tuse-modules juk\nend module-set\n",
        );
        let mut ctx = BuildContext::new();
        let err = ConfigReader::new()
            .read_configuration(&mut ctx, &rcfile, &[])
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn missing_end_is_config_error() {
        let dir = tempdir().unwrap();
        let rcfile = write_rc(
            dir.path(),
            "kdesrc-buildrc",
            "global\nend global\nmodule juk\nmodule ark\nend module\n",
        );
        let mut ctx = BuildContext::new();
        let err = ConfigReader::new()
            .read_configuration(&mut ctx, &rcfile, &[])
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn includes_resolve_relative_to_including_file() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("conf.d");
        std::fs::create_dir(&sub).unwrap();
        write_rc(&sub, "extra.ksb", "module ark\n\ttag v1\nend module\n");
        let rcfile = write_rc(
            dir.path(),
            "kdesrc-buildrc",
            "global\nend global\ninclude conf.d/extra.ksb\nmodule juk\nend module\n",
        );
        let mut ctx = BuildContext::new();
        let result = ConfigReader::new()
            .read_configuration(&mut ctx, &rcfile, &[])
            .unwrap();
        let names: Vec<String> = result
            .declarations
            .iter()
            .map(|decl| match decl {
                Declaration::Module(m) => m.name().to_string(),
                Declaration::ModuleSet(s) => s.name().to_string(),
            })
            .collect();
        assert_eq!(names, vec!["ark".to_string(), "juk".to_string()]);
    }

    #[test]
    fn missing_include_is_config_error() {
        let dir = tempdir().unwrap();
        let rcfile = write_rc(
            dir.path(),
            "kdesrc-buildrc",
            "global\nend global\ninclude does-not-exist.ksb\n",
        );
        let mut ctx = BuildContext::new();
        let err = ConfigReader::new()
            .read_configuration(&mut ctx, &rcfile, &[])
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn options_blocks_defer() {
        let (_, result) = read(
            "global\nend global\n\
             module juk\nend module\n\
             options juk\n\tcxxflags -g3 -Og\nend options\n",
        );
        assert_eq!(result.deferred.len(), 1);
        assert_eq!(result.deferred[0].name, "juk");
        assert_eq!(
            result.deferred[0].options,
            vec![("cxxflags".to_string(), OptionValue::Str("-g3 -Og".to_string()))]
        );
    }

    #[test]
    fn module_sets_reserve_creation_ids() {
        let (_, result) = read(
            "global\nend global\n\
             module-set frameworks\n\
             \trepository kde-projects\n\
             \tuse-modules kcoreaddons kconfig ki18n\n\
             end module-set\n\
             module standalone\nend module\n",
        );
        let Declaration::ModuleSet(set) = &result.declarations[0] else {
            panic!("expected a module-set");
        };
        assert_eq!(set.kind(), ModuleSetKind::KdeProjects);
        assert_eq!(set.create_id(), 1);
        let Declaration::Module(module) = &result.declarations[1] else {
            panic!("expected a module");
        };
        // Three names reserved after the set's own id.
        assert_eq!(module.create_id(), 5);
    }

    #[test]
    fn cmdline_options_survive_config() {
        let dir = tempdir().unwrap();
        let rcfile = write_rc(
            dir.path(),
            "kdesrc-buildrc",
            "global\n\tnum-cores 99\nend global\n",
        );
        let mut ctx = BuildContext::new();
        ctx.set_option("num-cores", "4".into()).unwrap();
        ConfigReader::new()
            .read_configuration(
                &mut ctx,
                &rcfile,
                &[("num-cores".to_string(), OptionValue::Str("4".to_string()))],
            )
            .unwrap();
        assert_eq!(ctx.get_option_str("num-cores"), "4");
    }
}
