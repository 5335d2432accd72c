//! Named boolean facts that survive across invocations.
//!
//! A flag is present or absent; presence is its only value. The store also
//! carries a small set of ad hoc JSON values (e.g. the selected storage mount)
//! that share the flags' persistence boundary.
//!
//! During a pass, handlers never touch the store directly: they record their
//! intent in a [`FlagChanges`] which the runner applies only if the handler
//! succeeds.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::paths::validate_flag;

// ---------------------------------------------------------------------------
// FlagSnapshot
// ---------------------------------------------------------------------------

/// Frozen view of the flag set, used for one sweep of condition evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSnapshot(BTreeSet<String>);

impl FlagSnapshot {
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for FlagSnapshot {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

// ---------------------------------------------------------------------------
// FlagChanges
// ---------------------------------------------------------------------------

/// Mutations staged by one handler invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlagChanges {
    set: BTreeSet<String>,
    cleared: BTreeSet<String>,
    values: BTreeMap<String, Option<serde_json::Value>>,
}

impl FlagChanges {
    pub fn set(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.cleared.remove(&name);
        self.set.insert(name);
    }

    pub fn clear(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.set.remove(&name);
        self.cleared.insert(name);
    }

    pub fn put_value(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), Some(value));
    }

    pub fn unset_value(&mut self, key: impl Into<String>) {
        self.values.insert(key.into(), None);
    }

    /// Staged value for `key`: `Some(None)` when staged for removal.
    pub fn staged_value(&self, key: &str) -> Option<Option<&serde_json::Value>> {
        self.values.get(key).map(Option::as_ref)
    }

    pub fn flags_set(&self) -> impl Iterator<Item = &str> {
        self.set.iter().map(String::as_str)
    }

    pub fn flags_cleared(&self) -> impl Iterator<Item = &str> {
        self.cleared.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.cleared.is_empty() && self.values.is_empty()
    }
}

// ---------------------------------------------------------------------------
// FlagStore
// ---------------------------------------------------------------------------

/// In-memory working copy of the persistent flag set for one invocation.
///
/// Loaded from a `StateBackend` before the pass and committed after it;
/// nothing here touches disk.
#[derive(Debug, Clone, Default)]
pub struct FlagStore {
    flags: BTreeSet<String>,
    values: BTreeMap<String, serde_json::Value>,
}

impl FlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(
        flags: BTreeSet<String>,
        values: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self { flags, values }
    }

    pub fn into_parts(self) -> (BTreeSet<String>, BTreeMap<String, serde_json::Value>) {
        (self.flags, self.values)
    }

    // -----------------------------------------------------------------------
    // Flags
    // -----------------------------------------------------------------------

    /// Set `name`. Returns true if it was not already set.
    pub fn set(&mut self, name: &str) -> Result<bool> {
        validate_flag(name)?;
        Ok(self.flags.insert(name.to_string()))
    }

    /// Clear `name`. Returns true if it was set.
    pub fn clear(&mut self, name: &str) -> bool {
        self.flags.remove(name)
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.flags.contains(name)
    }

    pub fn snapshot(&self) -> FlagSnapshot {
        FlagSnapshot(self.flags.clone())
    }

    pub fn flags(&self) -> impl Iterator<Item = &str> {
        self.flags.iter().map(String::as_str)
    }

    // -----------------------------------------------------------------------
    // Values
    // -----------------------------------------------------------------------

    pub fn raw_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Typed read of an ad hoc value; a value of the wrong shape reads as absent.
    pub fn value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn put_value(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    pub fn unset_value(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub fn values(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.values
    }

    // -----------------------------------------------------------------------
    // Staged changes
    // -----------------------------------------------------------------------

    /// Apply a successful handler's staged mutations.
    pub fn apply(&mut self, changes: FlagChanges) -> Result<()> {
        for name in &changes.set {
            validate_flag(name)?;
        }
        for name in changes.cleared {
            self.flags.remove(&name);
        }
        self.flags.extend(changes.set);
        for (key, value) in changes.values {
            match value {
                Some(v) => {
                    self.values.insert(key, v);
                }
                None => {
                    self.values.remove(&key);
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
