// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use strum_macros::{Display, EnumString};

/// A phase of the per-module pipeline.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    Update,
    Build,
    Test,
    Install,
    Uninstall,
}

impl Phase {
    /// Relative interestingness of a failure in this phase, used by the
    /// post-run failure ranking. Install failures are rarest and therefore
    /// score highest.
    pub fn failure_score(self) -> u32 {
        match self {
            Phase::Install => 4,
            Phase::Test => 3,
            Phase::Build => 2,
            Phase::Update => 1,
            Phase::Uninstall => 0,
        }
    }
}

/// An ordered list of phases carried by each module (and by the context,
/// which provides the default for new modules).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PhaseList {
    phases: Vec<Phase>,
}

impl Default for PhaseList {
    fn default() -> Self {
        PhaseList {
            phases: vec![Phase::Update, Phase::Build, Phase::Install],
        }
    }
}

impl PhaseList {
    pub fn new(phases: Vec<Phase>) -> Self {
        PhaseList { phases }
    }

    pub fn has(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn filter_out(&mut self, phase: Phase) {
        self.phases.retain(|p| *p != phase);
    }

    pub fn add(&mut self, phase: Phase) {
        if !self.has(phase) {
            self.phases.push(phase);
        }
    }

    /// Restricts the list to the single given phase if present, otherwise
    /// clears it entirely (e.g. `build-only` on a module whose build phase
    /// was already filtered away leaves nothing to do).
    pub fn restrict_to(&mut self, phase: Phase) {
        if self.has(phase) {
            self.phases = vec![phase];
        } else {
            self.phases.clear();
        }
    }

    pub fn reset_to(&mut self, phases: Vec<Phase>) {
        self.phases = phases;
    }

    pub fn clear(&mut self) {
        self.phases.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_phases() {
        let phases = PhaseList::default();
        assert!(phases.has(Phase::Update));
        assert!(phases.has(Phase::Build));
        assert!(phases.has(Phase::Install));
        assert!(!phases.has(Phase::Test));
    }

    #[test]
    fn filter_and_restrict() {
        let mut phases = PhaseList::default();
        phases.filter_out(Phase::Update);
        assert_eq!(phases.phases(), &[Phase::Build, Phase::Install]);

        phases.restrict_to(Phase::Build);
        assert_eq!(phases.phases(), &[Phase::Build]);

        phases.restrict_to(Phase::Install);
        assert!(phases.is_empty());
    }

    #[test]
    fn parses_phase_names() {
        assert_eq!("update".parse::<Phase>().unwrap(), Phase::Update);
        assert_eq!(Phase::Install.to_string(), "install");
        assert!("qwerty".parse::<Phase>().is_err());
    }
}
