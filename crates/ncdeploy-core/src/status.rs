use serde::{Deserialize, Serialize};

use crate::types::{Status, StatusLevel};

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PassOutcome {
    /// A full sweep ran without any eligible action.
    Converged,
    /// The sweep limit was reached with actions still firing.
    Diverged { limit: usize },
}

/// Collects status writes made during one pass and derives the status to
/// publish. Last writer wins, except that divergence and blocking flags
/// always surface as blocked.
#[derive(Debug, Default)]
pub struct StatusReporter {
    updates: Vec<Status>,
}

impl StatusReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, level: StatusLevel, message: impl Into<String>) {
        self.updates.push(Status::new(level, message));
    }

    pub fn latest(&self) -> Option<&Status> {
        self.updates.last()
    }

    pub fn updates(&self) -> &[Status] {
        &self.updates
    }

    pub fn finish(
        self,
        outcome: PassOutcome,
        blocking: Option<Status>,
        previous: Option<&Status>,
    ) -> Status {
        if let PassOutcome::Diverged { limit } = outcome {
            return Status::blocked(format!(
                "Reconciliation did not converge within {limit} sweeps"
            ));
        }
        if let Some(status) = blocking {
            return status;
        }
        self.updates
            .into_iter()
            .last()
            .or_else(|| previous.cloned())
            .unwrap_or_else(|| Status::new(StatusLevel::Waiting, "Waiting for events"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_writer_wins() {
        let mut reporter = StatusReporter::new();
        reporter.set(StatusLevel::Maintenance, "Initializing Nextcloud");
        reporter.set(StatusLevel::Active, "Nextcloud init complete");
        let status = reporter.finish(PassOutcome::Converged, None, None);
        assert_eq!(status, Status::active("Nextcloud init complete"));
    }

    #[test]
    fn silent_pass_keeps_previous_status() {
        let previous = Status::active("Ready");
        let status = StatusReporter::new().finish(PassOutcome::Converged, None, Some(&previous));
        assert_eq!(status, previous);
    }

    #[test]
    fn divergence_and_blocking_flags_override_writes() {
        let mut reporter = StatusReporter::new();
        reporter.set(StatusLevel::Active, "Ready");
        let status = reporter.finish(PassOutcome::Diverged { limit: 20 }, None, None);
        assert_eq!(status.level, StatusLevel::Blocked);
        assert!(status.message.contains("20 sweeps"));

        let mut reporter = StatusReporter::new();
        reporter.set(StatusLevel::Active, "Ready");
        let status = reporter.finish(
            PassOutcome::Converged,
            Some(Status::blocked("Storage detached")),
            None,
        );
        assert_eq!(status, Status::blocked("Storage detached"));
    }

    #[test]
    fn first_ever_silent_pass_is_waiting() {
        let status = StatusReporter::new().finish(PassOutcome::Converged, None, None);
        assert_eq!(status.level, StatusLevel::Waiting);
    }
}
