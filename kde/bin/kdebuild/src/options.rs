// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Generic option storage shared by the build context, modules and
//! module-sets.
//!
//! There is some internal trickery to let program code override
//! user-selected options in certain situations, which is why this isn't
//! simply a hash map. These are the so-called "sticky" options, stored
//! under a key starting with `#`; lookups consult the sticky form first.

use std::borrow::Cow;
use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{BuildError, Result};

static REPO_BASE_PAIR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([a-zA-Z0-9_-]+)\s+(.+)$").unwrap());

/// Option values are polymorphic: plain strings, booleans (the rc-file
/// literals `true`/`false`), or string maps (`set-env` and the
/// `git-repository-base` table).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OptionValue {
    Str(String),
    Bool(bool),
    Map(BTreeMap<String, String>),
}

impl OptionValue {
    pub fn as_str(&self) -> Cow<'_, str> {
        match self {
            OptionValue::Str(s) => Cow::Borrowed(s),
            OptionValue::Bool(true) => Cow::Borrowed("true"),
            OptionValue::Bool(false) => Cow::Borrowed(""),
            OptionValue::Map(_) => Cow::Borrowed(""),
        }
    }

    /// Truthiness as option lookups expect it: absent, empty, `0` and
    /// boolean false are all false.
    pub fn is_true(&self) -> bool {
        match self {
            OptionValue::Str(s) => !s.is_empty() && s != "0",
            OptionValue::Bool(b) => *b,
            OptionValue::Map(m) => !m.is_empty(),
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            OptionValue::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Str(value)
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

#[derive(Clone, Debug, Default)]
pub struct OptionsMap {
    options: BTreeMap<String, OptionValue>,
}

impl OptionsMap {
    pub fn new() -> Self {
        let mut options = BTreeMap::new();
        options.insert("set-env".to_string(), OptionValue::Map(BTreeMap::new()));
        OptionsMap { options }
    }

    pub fn has(&self, key: &str) -> bool {
        self.options.contains_key(key)
    }

    /// Returns true if the given option has been overridden by a "sticky"
    /// option.
    pub fn has_sticky(&self, key: &str) -> bool {
        let key = key.strip_prefix('#').unwrap_or(key);
        self.options.contains_key(&format!("#{key}"))
    }

    /// Returns the value of the given option. The sticky form is returned
    /// in preference to the plain form.
    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.options
            .get(&format!("#{key}"))
            .or_else(|| self.options.get(key))
    }

    /// String form of [`get`](Self::get), with absent options mapping to
    /// the empty string.
    pub fn get_str(&self, key: &str) -> String {
        self.get(key).map(|v| v.as_str().into_owned()).unwrap_or_default()
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).map(OptionValue::is_true).unwrap_or(false)
    }

    /// Module-level-only lookup, bypassing the sticky override. Mostly
    /// useful to read back exactly what a declaration set.
    pub fn get_exact(&self, key: &str) -> Option<&OptionValue> {
        self.options.get(key)
    }

    /// Sets the given option. For the vast majority of keys this replaces
    /// any previous value, but `set-env` merges into the existing env-var
    /// map, and `git-repository-base` accepts either a `NAME URL` pair
    /// (updating one table entry) or a ready-made map (merged wholesale).
    pub fn set(&mut self, key: &str, value: OptionValue) -> Result<()> {
        if key == "set-env" {
            return self.merge_set_env(value);
        }
        if key == "git-repository-base" {
            return self.merge_repository_base(value);
        }
        self.options.insert(key.to_string(), value);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<OptionValue> {
        self.options.remove(key)
    }

    /// Merges options from the given map, replacing options already present
    /// but keeping other existing options (`set-env` and the repository
    /// table keep their merge semantics).
    pub fn merge_from(&mut self, other: &OptionsMap) -> Result<()> {
        for (key, value) in &other.options {
            self.set(key, value.clone())?;
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OptionValue)> {
        self.options.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.options.keys()
    }

    fn merge_set_env(&mut self, value: OptionValue) -> Result<()> {
        let entry = self
            .options
            .entry("set-env".to_string())
            .or_insert_with(|| OptionValue::Map(BTreeMap::new()));
        let OptionValue::Map(map) = entry else {
            return Err(BuildError::internal("set-env holds a non-map value"));
        };
        match value {
            OptionValue::Map(additions) => {
                map.extend(additions);
            }
            OptionValue::Str(s) => {
                // First word is the variable, remainder its value.
                let (var, val) = s
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| {
                        BuildError::config(format!("Invalid set-env setting: {s}"))
                    })?;
                map.insert(var.to_string(), val.trim_start().to_string());
            }
            OptionValue::Bool(_) => {
                return Err(BuildError::config("Invalid set-env setting"));
            }
        }
        Ok(())
    }

    fn merge_repository_base(&mut self, value: OptionValue) -> Result<()> {
        let additions = match value {
            OptionValue::Map(map) => map,
            OptionValue::Str(s) => {
                let caps = REPO_BASE_PAIR_RE.captures(&s).ok_or_else(|| {
                    BuildError::config(format!("Invalid git-repository-base setting: {s}"))
                })?;
                let mut map = BTreeMap::new();
                map.insert(caps[1].to_string(), caps[2].to_string());
                map
            }
            OptionValue::Bool(_) => {
                return Err(BuildError::config("Invalid git-repository-base setting"));
            }
        };
        let entry = self
            .options
            .entry("git-repository-base".to_string())
            .or_insert_with(|| OptionValue::Map(BTreeMap::new()));
        let OptionValue::Map(map) = entry else {
            return Err(BuildError::internal("git-repository-base holds a non-map value"));
        };
        map.extend(additions);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sticky_options_win() {
        let mut opts = OptionsMap::new();
        opts.set("branch", "work".into()).unwrap();
        assert_eq!(opts.get_str("branch"), "work");

        opts.set("#branch", "frozen".into()).unwrap();
        assert_eq!(opts.get_str("branch"), "frozen");
        assert!(opts.has_sticky("branch"));
        assert_eq!(opts.get_exact("branch").unwrap().as_str(), "work");
    }

    #[test]
    fn set_env_appends_instead_of_replacing() {
        let mut opts = OptionsMap::new();
        opts.set("set-env", "CC clang".into()).unwrap();
        opts.set("set-env", "CXX clang++".into()).unwrap();

        let env = opts.get("set-env").unwrap().as_map().unwrap();
        assert_eq!(env.get("CC").unwrap(), "clang");
        assert_eq!(env.get("CXX").unwrap(), "clang++");
    }

    #[test]
    fn repository_base_pair_updates_one_entry() {
        let mut opts = OptionsMap::new();
        opts.set("git-repository-base", "work https://example.org/work/".into())
            .unwrap();
        opts.set("git-repository-base", "play https://example.org/play/".into())
            .unwrap();

        let map = opts.get("git-repository-base").unwrap().as_map().unwrap();
        assert_eq!(map.get("work").unwrap(), "https://example.org/work/");
        assert_eq!(map.get("play").unwrap(), "https://example.org/play/");
    }

    #[test]
    fn repository_base_rejects_bare_name() {
        let mut opts = OptionsMap::new();
        let err = opts
            .set("git-repository-base", "nourl".into())
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn falsy_values() {
        assert!(!OptionValue::Str(String::new()).is_true());
        assert!(!OptionValue::Str("0".into()).is_true());
        assert!(!OptionValue::Bool(false).is_true());
        assert!(OptionValue::Str("yes".into()).is_true());
    }
}
