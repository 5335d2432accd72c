use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// StatusLevel
// ---------------------------------------------------------------------------

/// Coarse lifecycle status published after each pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Maintenance,
    Blocked,
    Waiting,
    Active,
}

impl StatusLevel {
    pub fn all() -> &'static [StatusLevel] {
        &[
            StatusLevel::Maintenance,
            StatusLevel::Blocked,
            StatusLevel::Waiting,
            StatusLevel::Active,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusLevel::Maintenance => "maintenance",
            StatusLevel::Blocked => "blocked",
            StatusLevel::Waiting => "waiting",
            StatusLevel::Active => "active",
        }
    }
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StatusLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StatusLevel::all()
            .iter()
            .copied()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| format!("unknown status level: {s}"))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub level: StatusLevel,
    pub message: String,
}

impl Status {
    pub fn new(level: StatusLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self::new(StatusLevel::Blocked, message)
    }

    pub fn active(message: impl Into<String>) -> Self {
        Self::new(StatusLevel::Active, message)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.level, self.message)
    }
}

// ---------------------------------------------------------------------------
// DbKind
// ---------------------------------------------------------------------------

/// Database flavours the application can be installed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbKind {
    Mysql,
    Postgres,
}

impl DbKind {
    /// Preference order when more than one endpoint is available.
    pub fn all() -> &'static [DbKind] {
        &[DbKind::Mysql, DbKind::Postgres]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DbKind::Mysql => "mysql",
            DbKind::Postgres => "postgres",
        }
    }

    /// Name the installer expects for `--database`.
    pub fn installer_name(self) -> &'static str {
        match self {
            DbKind::Mysql => "mysql",
            DbKind::Postgres => "pgsql",
        }
    }
}

impl fmt::Display for DbKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection details of a related database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbEndpoint {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub database: String,
    pub user: String,
    pub password: String,
}

// ---------------------------------------------------------------------------
// ServiceAction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceAction {
    Start,
    Stop,
    Reload,
}

impl ServiceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Reload => "reload",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
