use std::time::Duration;

use thiserror::Error;

use crate::types::StatusLevel;

/// Errors that abort a reconciliation pass or a store/registry operation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("state store unavailable: {0}")]
    Persistence(String),

    #[error("reconciliation did not converge after {sweeps} sweeps (limit {limit})")]
    Divergence { sweeps: usize, limit: usize },

    #[error("invalid action configuration: {0}")]
    Configuration(String),

    #[error("invalid flag '{0}': must be lowercase alphanumeric with '.', '_' or '-'")]
    InvalidFlag(String),

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Failure of a single action handler.
///
/// Local to that action: the runner logs it, reports it as the action's
/// status, discards the action's flag mutations and does not retry it until
/// the next trigger.
#[derive(Debug, Error)]
pub enum HandlerFailure {
    #[error("{0}")]
    Blocked(String),

    #[error("{0}")]
    Waiting(String),

    #[error("{0}")]
    Configuration(String),

    #[error("`{command}` exited with {}: {output}", .code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("`{command}` timed out after {}s", .after.as_secs())]
    Timeout { command: String, after: Duration },

    #[error("action '{action}' touched undeclared flag '{flag}'")]
    UndeclaredFlag { action: String, flag: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HandlerFailure {
    /// Status level a failure is surfaced with.
    pub fn status_level(&self) -> StatusLevel {
        match self {
            HandlerFailure::Waiting(_) => StatusLevel::Waiting,
            _ => StatusLevel::Blocked,
        }
    }
}

pub type HandlerResult = std::result::Result<(), HandlerFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_maps_to_waiting_everything_else_blocks() {
        assert_eq!(
            HandlerFailure::Waiting("db".into()).status_level(),
            StatusLevel::Waiting
        );
        assert_eq!(
            HandlerFailure::Blocked("disk".into()).status_level(),
            StatusLevel::Blocked
        );
        let timeout = HandlerFailure::Timeout {
            command: "rsync".into(),
            after: Duration::from_secs(3),
        };
        assert_eq!(timeout.status_level(), StatusLevel::Blocked);
        assert_eq!(timeout.to_string(), "`rsync` timed out after 3s");
    }

    #[test]
    fn command_failure_message_includes_exit_code() {
        let err = HandlerFailure::CommandFailed {
            command: "a2enmod rewrite".into(),
            code: Some(2),
            output: "no such module".into(),
        };
        assert_eq!(err.to_string(), "`a2enmod rewrite` exited with 2: no such module");
    }
}
