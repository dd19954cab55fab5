//! Per-model sync state
//!
//! ```text
//! Idle ──▶ Syncing ──┬──▶ Idle
//!                    └──▶ FastRetry | SlowRetry ──▶ (repair) ──▶ Syncing
//!                                   └──▶ Exhausted   (budget spent)
//! Disabled: no usable remote client, terminal
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use crate::locks::{safe_read, safe_write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    Idle,
    Syncing,
    FastRetry,
    SlowRetry,
    Exhausted,
    Disabled,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::FastRetry => "fast_retry",
            SyncState::SlowRetry => "slow_retry",
            SyncState::Exhausted => "exhausted",
            SyncState::Disabled => "disabled",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of every model seen so far; unknown models are `Idle`
#[derive(Debug, Default)]
pub struct ModelStates {
    states: RwLock<HashMap<String, SyncState>>,
}

impl ModelStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, model: &str) -> SyncState {
        safe_read(&self.states)
            .get(model)
            .copied()
            .unwrap_or(SyncState::Idle)
    }

    pub fn set(&self, model: &str, state: SyncState) {
        safe_write(&self.states).insert(model.to_string(), state);
    }

    pub fn forget(&self, model: &str) {
        safe_write(&self.states).remove(model);
    }

    /// Models currently in `state`
    pub fn in_state(&self, state: SyncState) -> Vec<String> {
        let mut models: Vec<String> = safe_read(&self.states)
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(m, _)| m.clone())
            .collect();
        models.sort();
        models
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_model_is_idle() {
        let states = ModelStates::new();
        assert_eq!(states.get("admin/vs"), SyncState::Idle);

        states.set("admin/vs", SyncState::SlowRetry);
        states.set("admin/other", SyncState::SlowRetry);
        assert_eq!(states.in_state(SyncState::SlowRetry), vec!["admin/other", "admin/vs"]);

        states.forget("admin/vs");
        assert_eq!(states.get("admin/vs"), SyncState::Idle);
    }
}
