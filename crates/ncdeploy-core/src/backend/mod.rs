//! Durable state behind the reconciliation core.
//!
//! A backend persists the flag store, its ad hoc values and the last
//! published status as one unit, plus a bounded history of pass reports.

pub mod db;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};
use crate::flags::FlagStore;
use crate::runner::PassReport;
use crate::types::Status;

pub use db::RedbBackend;

/// Pass reports kept before the oldest are pruned.
pub const MAX_HISTORY: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub flags: BTreeSet<String>,
    pub values: BTreeMap<String, serde_json::Value>,
    pub status: Option<Status>,
}

impl PersistedState {
    pub fn store(&self) -> FlagStore {
        FlagStore::from_parts(self.flags.clone(), self.values.clone())
    }

    pub fn from_store(store: FlagStore, status: Option<Status>) -> Self {
        let (flags, values) = store.into_parts();
        Self {
            flags,
            values,
            status,
        }
    }
}

pub trait StateBackend {
    fn load(&self) -> Result<PersistedState>;

    /// Replace the persisted state as a whole. On error nothing changes.
    fn commit(&mut self, state: &PersistedState) -> Result<()>;

    fn record_pass(&mut self, report: &PassReport) -> Result<()>;

    /// Most recent passes first.
    fn history(&self, limit: usize) -> Result<Vec<PassReport>>;
}

// ---------------------------------------------------------------------------
// MemoryBackend
// ---------------------------------------------------------------------------

/// Keeps everything in process memory. Commits can be made to fail.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: PersistedState,
    passes: Vec<PassReport>,
    fail_commits: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    pub fn fail_commits(&mut self, fail: bool) {
        self.fail_commits = fail;
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }
}

impl StateBackend for MemoryBackend {
    fn load(&self) -> Result<PersistedState> {
        Ok(self.state.clone())
    }

    fn commit(&mut self, state: &PersistedState) -> Result<()> {
        if self.fail_commits {
            return Err(ReconcileError::Persistence("commit rejected".into()));
        }
        self.state = state.clone();
        Ok(())
    }

    fn record_pass(&mut self, report: &PassReport) -> Result<()> {
        self.passes.push(report.clone());
        if self.passes.len() > MAX_HISTORY {
            let excess = self.passes.len() - MAX_HISTORY;
            self.passes.drain(..excess);
        }
        Ok(())
    }

    fn history(&self, limit: usize) -> Result<Vec<PassReport>> {
        Ok(self.passes.iter().rev().take(limit).cloned().collect())
    }
}
