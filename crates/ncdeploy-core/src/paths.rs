use crate::error::{ReconcileError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const STATE_DIR: &str = ".ncdeploy";

pub const CONFIG_FILE: &str = ".ncdeploy/config.yaml";
pub const FACTS_FILE: &str = ".ncdeploy/facts.yaml";
pub const STATUS_FILE: &str = ".ncdeploy/status.yaml";
pub const DB_FILE: &str = ".ncdeploy/state.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn state_dir(root: &Path) -> PathBuf {
    root.join(STATE_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn facts_path(root: &Path) -> PathBuf {
    root.join(FACTS_FILE)
}

pub fn status_path(root: &Path) -> PathBuf {
    root.join(STATUS_FILE)
}

pub fn db_path(root: &Path) -> PathBuf {
    root.join(DB_FILE)
}

// ---------------------------------------------------------------------------
// Flag name validation
// ---------------------------------------------------------------------------

static FLAG_RE: OnceLock<Regex> = OnceLock::new();

fn flag_re() -> &'static Regex {
    FLAG_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9._\-]*$").unwrap())
}

pub fn validate_flag(name: &str) -> Result<()> {
    if name.len() > 128 || !flag_re().is_match(name) || name.ends_with('.') {
        return Err(ReconcileError::InvalidFlag(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
