//! redb-backed state store.
//!
//! # Table design
//!
//! - `FLAGS`: flag name -> unit. Presence is the value.
//! - `VALUES`: key -> JSON-encoded value.
//! - `META`: `"status"` -> JSON-encoded last published [`Status`].
//! - `PASSES`: 24-byte composite key -> JSON-encoded [`PassReport`]:
//!   ```text
//!   [ started_at_ms: u64 big-endian (8 bytes) | uuid: 16 bytes ]
//!   ```
//!   Big-endian timestamps in the high bytes make byte order equal
//!   chronological order, so history is a reverse scan.
//!
//! A commit rewrites `FLAGS`, `VALUES` and `META` in one write transaction.
//! redb holds an exclusive lock on the file while the database is open, so a
//! second process opening the same state fails instead of running a
//! concurrent pass.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ReconcileError, Result};
use crate::runner::PassReport;
use crate::types::Status;

use super::{PersistedState, StateBackend, MAX_HISTORY};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const FLAGS: TableDefinition<&str, ()> = TableDefinition::new("flags");
const VALUES: TableDefinition<&str, &[u8]> = TableDefinition::new("values");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const PASSES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("passes");

const STATUS_KEY: &str = "status";

fn db_err(e: impl std::fmt::Display) -> ReconcileError {
    ReconcileError::Persistence(e.to_string())
}

fn pass_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

// ---------------------------------------------------------------------------
// RedbBackend
// ---------------------------------------------------------------------------

pub struct RedbBackend {
    db: Database,
}

impl RedbBackend {
    /// Open or create the database at `path`, creating all tables.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::io::ensure_dir(parent)?;
        }
        let db = Database::create(path).map_err(|e| {
            ReconcileError::Persistence(format!("cannot open {}: {e}", path.display()))
        })?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(FLAGS).map_err(db_err)?;
        wt.open_table(VALUES).map_err(db_err)?;
        wt.open_table(META).map_err(db_err)?;
        wt.open_table(PASSES).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }
}

impl StateBackend for RedbBackend {
    fn load(&self) -> Result<PersistedState> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let mut state = PersistedState::default();

        let flags = rt.open_table(FLAGS).map_err(db_err)?;
        for entry in flags.iter().map_err(db_err)? {
            let (k, _) = entry.map_err(db_err)?;
            state.flags.insert(k.value().to_string());
        }

        let values = rt.open_table(VALUES).map_err(db_err)?;
        for entry in values.iter().map_err(db_err)? {
            let (k, v) = entry.map_err(db_err)?;
            let value = serde_json::from_slice(v.value()).map_err(db_err)?;
            state.values.insert(k.value().to_string(), value);
        }

        let meta = rt.open_table(META).map_err(db_err)?;
        if let Some(raw) = meta.get(STATUS_KEY).map_err(db_err)? {
            let status: Status = serde_json::from_slice(raw.value()).map_err(db_err)?;
            state.status = Some(status);
        }

        Ok(state)
    }

    fn commit(&mut self, state: &PersistedState) -> Result<()> {
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut flags = wt.open_table(FLAGS).map_err(db_err)?;
            let stale: Vec<String> = flags
                .iter()
                .map_err(db_err)?
                .map(|e| e.map(|(k, _)| k.value().to_string()))
                .collect::<std::result::Result<_, _>>()
                .map_err(db_err)?;
            for name in stale.iter().filter(|n| !state.flags.contains(*n)) {
                flags.remove(name.as_str()).map_err(db_err)?;
            }
            for name in &state.flags {
                flags.insert(name.as_str(), ()).map_err(db_err)?;
            }

            let mut values = wt.open_table(VALUES).map_err(db_err)?;
            let stale: Vec<String> = values
                .iter()
                .map_err(db_err)?
                .map(|e| e.map(|(k, _)| k.value().to_string()))
                .collect::<std::result::Result<_, _>>()
                .map_err(db_err)?;
            for key in stale.iter().filter(|k| !state.values.contains_key(*k)) {
                values.remove(key.as_str()).map_err(db_err)?;
            }
            for (key, value) in &state.values {
                let encoded = serde_json::to_vec(value)?;
                values
                    .insert(key.as_str(), encoded.as_slice())
                    .map_err(db_err)?;
            }

            let mut meta = wt.open_table(META).map_err(db_err)?;
            match &state.status {
                Some(status) => {
                    let encoded = serde_json::to_vec(status)?;
                    meta.insert(STATUS_KEY, encoded.as_slice()).map_err(db_err)?;
                }
                None => {
                    meta.remove(STATUS_KEY).map_err(db_err)?;
                }
            }
        }
        wt.commit().map_err(db_err)?;
        debug!(flags = state.flags.len(), values = state.values.len(), "state committed");
        Ok(())
    }

    fn record_pass(&mut self, report: &PassReport) -> Result<()> {
        let key = pass_key(report.started_at, report.id);
        let value = serde_json::to_vec(report)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(PASSES).map_err(db_err)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(db_err)?;

            let len = table.len().map_err(db_err)? as usize;
            if len > MAX_HISTORY {
                let oldest: Vec<Vec<u8>> = table
                    .iter()
                    .map_err(db_err)?
                    .take(len - MAX_HISTORY)
                    .map(|e| e.map(|(k, _)| k.value().to_vec()))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(db_err)?;
                for k in &oldest {
                    table.remove(k.as_slice()).map_err(db_err)?;
                }
            }
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    fn history(&self, limit: usize) -> Result<Vec<PassReport>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(PASSES).map_err(db_err)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)?.rev().take(limit) {
            let (_, v) = entry.map_err(db_err)?;
            let report: PassReport = serde_json::from_slice(v.value()).map_err(db_err)?;
            result.push(report);
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
