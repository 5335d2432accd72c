//! Live facts read from `.ncdeploy/facts.yaml` and probed from the system.
//!
//! The delivery layer keeps the facts file current (relation data, storage
//! locations, operator config). It is re-read on every query so a pass
//! always sees the latest values.
//!
//! ```yaml
//! databases:
//!   mysql: { host: 10.0.0.5, port: 3306, database: nextcloud, user: nc, password: ... }
//! storage:
//!   data: /mnt/data
//! config:
//!   admin-username: admin
//!   fqdn: cloud.example.com
//! public_address: 203.0.113.7
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::command;
use crate::condition::LiveFacts;
use crate::error::Result;
use crate::host::CommandSpec;
use crate::paths;
use crate::types::{DbEndpoint, DbKind};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactsDoc {
    #[serde(default)]
    pub databases: BTreeMap<DbKind, DbEndpoint>,
    #[serde(default)]
    pub storage: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub config: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub public_address: Option<String>,
}

impl FactsDoc {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&data)?)
    }
}

/// Scalar config value as text; mappings and sequences are not config values.
fn scalar_text(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub struct FactsFile {
    path: PathBuf,
}

impl FactsFile {
    pub fn new(root: &Path) -> Self {
        Self {
            path: paths::facts_path(root),
        }
    }

    fn doc(&self) -> FactsDoc {
        FactsDoc::load(&self.path).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "unreadable facts file; treating as empty");
            FactsDoc::default()
        })
    }
}

impl LiveFacts for FactsFile {
    fn database(&self, kind: DbKind) -> Option<DbEndpoint> {
        self.doc().databases.remove(&kind)
    }

    fn storage_mount(&self, name: &str) -> Option<PathBuf> {
        self.doc().storage.remove(name)
    }

    fn config_value(&self, key: &str) -> Option<String> {
        self.doc()
            .config
            .get(key)
            .and_then(scalar_text)
            .filter(|v| !v.trim().is_empty())
    }

    fn service_running(&self, name: &str) -> bool {
        let cmd = CommandSpec::new("systemctl").args(["is-active", "--quiet", name]);
        command::run(&cmd, PROBE_TIMEOUT).is_ok_and(|out| out.is_success())
    }

    fn command_available(&self, name: &str) -> bool {
        which::which(name).is_ok()
    }

    fn public_address(&self) -> Option<String> {
        self.doc().public_address
    }
}
