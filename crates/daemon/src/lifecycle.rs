//! Folder lifecycle state machine (spec §4.F).
//!
//! No `codescope` analog exists — a one-shot CLI has no notion of folder
//! status. Modeled as a small explicit enum plus a transition table, in the
//! style of phase tracking seen in the `otters` pipeline reference
//! (`pipeline.phase`, terminal-state checks).

use folderd_core::types::FolderStatus;

/// Drives legal transitions for one folder and records the previous state
/// for diagnostics. Self-transitions are always illegal.
#[derive(Debug, Clone)]
pub struct LifecycleMachine {
    current: FolderStatus,
    previous: Option<FolderStatus>,
}

impl Default for LifecycleMachine {
    fn default() -> Self {
        Self { current: FolderStatus::Scanning, previous: None }
    }
}

impl LifecycleMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> FolderStatus {
        self.current
    }

    pub fn previous(&self) -> Option<FolderStatus> {
        self.previous
    }

    /// True iff `(current, target)` appears in the §4.F transition table.
    pub fn can_transition_to(&self, target: FolderStatus) -> bool {
        use FolderStatus::*;
        if target == self.current {
            return false;
        }
        matches!(
            (self.current, target),
            (Scanning, Indexing)
                | (Scanning, Active)
                | (Scanning, Error)
                | (Indexing, Active)
                | (Indexing, Error)
                | (Active, Scanning)
                | (Error, Scanning)
        )
    }

    /// Attempt the transition. Returns `false` and leaves state unchanged on
    /// an illegal transition.
    pub fn transition_to(&mut self, target: FolderStatus) -> bool {
        if !self.can_transition_to(target) {
            return false;
        }
        self.previous = Some(self.current);
        self.current = target;
        true
    }
}
