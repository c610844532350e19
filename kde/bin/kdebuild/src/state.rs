// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Cross-run persistent state, stored as a JSON object keyed by module name
//! (plus the special `global` key). Only the main process ever writes the
//! file; updater-side changes arrive over IPC.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{error, warn};

use crate::error::Result;

pub const GLOBAL: &str = "global";

#[derive(Debug, Default)]
pub struct PersistentState {
    path: PathBuf,
    data: BTreeMap<String, BTreeMap<String, Value>>,
}

impl PersistentState {
    /// Reads in all persistent options from the file where they are kept.
    /// A missing file yields an empty store; an unreadable one is reported
    /// and treated as empty rather than failing the run.
    pub fn load(path: &Path) -> Self {
        let mut state = PersistentState {
            path: path.to_path_buf(),
            data: BTreeMap::new(),
        };
        if !path.exists() {
            return state;
        }
        match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(data) => state.data = data,
                Err(err) => error!("Failed to read persistent module data: {err}"),
            },
            Err(err) => error!("Failed to read {}: {err}", path.display()),
        }
        state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, module: &str, key: &str) -> Option<&Value> {
        self.data.get(module)?.get(key)
    }

    pub fn get_str(&self, module: &str, key: &str) -> Option<String> {
        match self.get(module, key)? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn get_u64(&self, module: &str, key: &str) -> Option<u64> {
        match self.get(module, key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn set(&mut self, module: &str, key: &str, value: impl Into<Value>) {
        self.data
            .entry(module.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    pub fn unset(&mut self, module: &str, key: &str) {
        if let Some(entries) = self.data.get_mut(module) {
            entries.remove(key);
        }
    }

    /// Writes the store back out. Skipped entirely in pretend mode (the
    /// caller checks), so a `--pretend` run leaves the file untouched.
    pub fn store(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.is_dir() {
                fs::create_dir_all(dir)?;
            }
        }
        let encoded = serde_json::to_string_pretty(&self.data)
            .map_err(|err| crate::error::BuildError::internal(err.to_string()))?;
        if let Err(err) = fs::write(&self.path, encoded) {
            warn!("Unable to save persistent module data: {err}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kdesrc-build-data");

        let mut state = PersistentState::load(&path);
        state.set("juk", "last-build-rev", "abc123");
        state.set("juk", "failure-count", 2);
        state.set(GLOBAL, "last-metadata-update", 1700000000u64);
        state.store().unwrap();

        let reread = PersistentState::load(&path);
        assert_eq!(reread.get_str("juk", "last-build-rev").unwrap(), "abc123");
        assert_eq!(reread.get_u64("juk", "failure-count").unwrap(), 2);
        assert_eq!(
            reread.get_u64(GLOBAL, "last-metadata-update").unwrap(),
            1700000000
        );
        assert!(reread.get("juk", "last-install-rev").is_none());
    }

    #[test]
    fn idempotent_writes_produce_identical_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kdesrc-build-data");

        let mut state = PersistentState::load(&path);
        state.set("ark", "failure-count", 1);
        state.store().unwrap();
        let first = std::fs::read(&path).unwrap();

        state.set("ark", "failure-count", 1);
        state.store().unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let state = PersistentState::load(&dir.path().join("nope"));
        assert!(state.get("juk", "anything").is_none());
    }
}
