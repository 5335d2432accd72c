//! The reconciliation loop.
//!
//! A pass is a sequence of sweeps. Each sweep freezes one [`FlagSnapshot`],
//! walks the registry in order and runs every action whose condition holds
//! against that snapshot. Mutations made by a handler become visible to the
//! next sweep, never to the rest of the current one. The pass ends at the
//! first sweep in which nothing ran, or as divergent when the sweep limit is
//! reached.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::condition::LiveFacts;
use crate::config::Settings;
use crate::error::{HandlerFailure, HandlerResult, ReconcileError, Result};
use crate::flags::{FlagChanges, FlagSnapshot, FlagStore};
use crate::host::Host;
use crate::registry::ActionRegistry;
use crate::status::{PassOutcome, StatusReporter};
use crate::types::{Status, StatusLevel};

// ---------------------------------------------------------------------------
// ActionContext
// ---------------------------------------------------------------------------

/// Everything a handler may read or change while it runs.
pub struct ActionContext<'a> {
    action: &'a str,
    flags: &'a FlagSnapshot,
    store: &'a FlagStore,
    changes: FlagChanges,
    status: &'a mut StatusReporter,
    pub facts: &'a dyn LiveFacts,
    pub host: &'a mut dyn Host,
    pub settings: &'a Settings,
}

impl<'a> ActionContext<'a> {
    pub fn action_name(&self) -> &str {
        self.action
    }

    /// Flag state as of the current sweep's snapshot.
    pub fn is_set(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    pub fn set_flag(&mut self, flag: &str) {
        self.changes.set(flag);
    }

    pub fn clear_flag(&mut self, flag: &str) {
        self.changes.clear(flag);
    }

    /// Ad hoc value, seeing this handler's own staged writes first.
    pub fn value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.changes.staged_value(key) {
            Some(Some(v)) => serde_json::from_value(v.clone()).ok(),
            Some(None) => None,
            None => self.store.value(key),
        }
    }

    pub fn put_value(&mut self, key: &str, value: serde_json::Value) {
        self.changes.put_value(key, value);
    }

    pub fn unset_value(&mut self, key: &str) {
        self.changes.unset_value(key);
    }

    pub fn status(&mut self, level: StatusLevel, message: impl Into<String>) {
        let message = message.into();
        debug!(action = self.action, %level, %message, "status");
        self.status.set(level, message);
    }

    pub fn maintenance(&mut self, message: impl Into<String>) {
        self.status(StatusLevel::Maintenance, message);
    }

    pub fn active(&mut self, message: impl Into<String>) {
        self.status(StatusLevel::Active, message);
    }

    fn into_changes(self) -> FlagChanges {
        self.changes
    }
}

// ---------------------------------------------------------------------------
// PassReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunResult {
    Succeeded,
    Failed { level: StatusLevel, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRun {
    pub action: String,
    pub sweep: usize,
    pub result: RunResult,
}

/// What one pass did; persisted as pass history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassReport {
    pub id: Uuid,
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sweeps: usize,
    pub limit: usize,
    pub runs: Vec<ActionRun>,
    pub outcome: PassOutcome,
    pub status: Status,
    /// Flags present when the pass ended.
    pub flags: Vec<String>,
}

impl PassReport {
    pub fn fired(&self) -> Vec<&str> {
        self.runs.iter().map(|r| r.action.as_str()).collect()
    }

    pub fn failed(&self) -> Vec<&str> {
        self.runs
            .iter()
            .filter(|r| matches!(r.result, RunResult::Failed { .. }))
            .map(|r| r.action.as_str())
            .collect()
    }

    pub fn is_converged(&self) -> bool {
        self.outcome == PassOutcome::Converged
    }

    /// Surface divergence as an error.
    pub fn into_result(self) -> Result<Self> {
        match self.outcome {
            PassOutcome::Converged => Ok(self),
            PassOutcome::Diverged { limit } => Err(ReconcileError::Divergence {
                sweeps: self.sweeps,
                limit,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler<'r> {
    registry: &'r ActionRegistry,
    settings: &'r Settings,
}

impl<'r> Reconciler<'r> {
    pub fn new(registry: &'r ActionRegistry, settings: &'r Settings) -> Self {
        Self { registry, settings }
    }

    pub fn max_sweeps(&self) -> usize {
        self.settings.max_sweeps(self.registry.len())
    }

    /// Names of actions whose condition holds right now.
    pub fn eligible(&self, store: &FlagStore, facts: &dyn LiveFacts) -> Vec<&'r str> {
        let snapshot = store.snapshot();
        self.registry
            .actions()
            .iter()
            .filter(|a| a.condition().evaluate(&snapshot, facts))
            .map(|a| a.name())
            .collect()
    }

    /// Run one pass to a fixed point or the sweep limit.
    ///
    /// `previous` is the status published by the last pass; it is kept when
    /// no action reports anything.
    pub fn run(
        &self,
        trigger: &str,
        store: &mut FlagStore,
        facts: &dyn LiveFacts,
        host: &mut dyn Host,
        previous: Option<&Status>,
    ) -> PassReport {
        let started_at = Utc::now();
        let limit = self.max_sweeps();
        let mut reporter = StatusReporter::new();
        let mut failed: BTreeSet<&str> = BTreeSet::new();
        let mut runs = Vec::new();
        let mut sweeps = 0;
        let mut outcome = PassOutcome::Diverged { limit };

        while sweeps < limit {
            sweeps += 1;
            let snapshot = store.snapshot();
            let mut executed = 0;

            for action in self.registry.actions() {
                if failed.contains(action.name()) {
                    continue;
                }
                if !action.condition().evaluate(&snapshot, facts) {
                    continue;
                }
                executed += 1;
                debug!(action = action.name(), sweep = sweeps, "running action");

                let mut ctx = ActionContext {
                    action: action.name(),
                    flags: &snapshot,
                    store,
                    changes: FlagChanges::default(),
                    status: &mut reporter,
                    facts,
                    host: &mut *host,
                    settings: self.settings,
                };
                let result = (action.handler())(&mut ctx);
                let changes = ctx.into_changes();

                let result: HandlerResult = result
                    .and_then(|()| action.check_declared(&changes))
                    .and_then(|()| {
                        store
                            .apply(changes)
                            .map_err(|e| HandlerFailure::Configuration(e.to_string()))
                    });

                match result {
                    Ok(()) => runs.push(ActionRun {
                        action: action.name().to_string(),
                        sweep: sweeps,
                        result: RunResult::Succeeded,
                    }),
                    Err(failure) => {
                        let level = failure.status_level();
                        let message = failure.to_string();
                        warn!(action = action.name(), %level, error = %message, "action failed");
                        reporter.set(level, message.clone());
                        failed.insert(action.name());
                        runs.push(ActionRun {
                            action: action.name().to_string(),
                            sweep: sweeps,
                            result: RunResult::Failed { level, message },
                        });
                    }
                }
            }

            if executed == 0 {
                outcome = PassOutcome::Converged;
                break;
            }
        }

        let final_flags = store.snapshot();
        match outcome {
            PassOutcome::Converged => info!(
                trigger,
                sweeps,
                fired = runs.len(),
                failed = failed.len(),
                "pass converged"
            ),
            PassOutcome::Diverged { limit } => error!(
                trigger,
                sweeps,
                limit,
                "pass diverged: actions still eligible at the sweep limit"
            ),
        }

        let blocking = self.registry.blocking_status(&final_flags);
        let status = reporter.finish(outcome, blocking, previous);

        PassReport {
            id: Uuid::new_v4(),
            trigger: trigger.to_string(),
            started_at,
            finished_at: Utc::now(),
            sweeps,
            limit,
            runs,
            outcome,
            status,
            flags: final_flags.iter().map(str::to_string).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Action;
    use crate::testing::{FakeHost, StaticFacts};

    fn install(ctx: &mut ActionContext<'_>) -> HandlerResult {
        if ctx.facts.config_value("break-install").is_some() {
            return Err(HandlerFailure::Blocked("install command failed".into()));
        }
        ctx.set_flag("init-done");
        ctx.active("Nextcloud init complete");
        Ok(())
    }

    fn set_x(ctx: &mut ActionContext<'_>) -> HandlerResult {
        ctx.set_flag("x");
        Ok(())
    }

    fn clear_x(ctx: &mut ActionContext<'_>) -> HandlerResult {
        ctx.clear_flag("x");
        Ok(())
    }

    fn mark_done(ctx: &mut ActionContext<'_>) -> HandlerResult {
        let flag = format!("{}.done", ctx.action_name());
        ctx.set_flag(&flag);
        Ok(())
    }

    fn sneaky(ctx: &mut ActionContext<'_>) -> HandlerResult {
        ctx.set_flag("a");
        ctx.set_flag("not-mine");
        Ok(())
    }

    fn install_registry() -> ActionRegistry {
        ActionRegistry::builder()
            .action(
                Action::new("install", install)
                    .when("db-endpoint-available")
                    .when_not("init-done")
                    .sets(["init-done"]),
            )
            .build()
            .unwrap()
    }

    fn store_with(flags: &[&str]) -> FlagStore {
        let mut store = FlagStore::new();
        for f in flags {
            store.set(f).unwrap();
        }
        store
    }

    #[test]
    fn end_to_end_install_then_noop() {
        let registry = install_registry();
        let settings = Settings::default();
        let runner = Reconciler::new(&registry, &settings);
        let facts = StaticFacts::default();
        let mut host = FakeHost::new();
        let mut store = store_with(&["db-endpoint-available"]);

        let first = runner.run("relation-changed", &mut store, &facts, &mut host, None);
        assert!(first.is_converged());
        assert_eq!(first.fired(), vec!["install"]);
        assert!(store.is_set("init-done"));
        assert_eq!(first.status, Status::active("Nextcloud init complete"));

        let second = runner.run(
            "update-status",
            &mut store,
            &facts,
            &mut host,
            Some(&first.status),
        );
        assert!(second.is_converged());
        assert!(second.fired().is_empty());
        assert_eq!(second.sweeps, 1);
        assert_eq!(second.status, first.status);
        assert_eq!(second.flags, first.flags);
    }

    #[test]
    fn repeated_pass_is_idempotent() {
        let registry = install_registry();
        let settings = Settings::default();
        let runner = Reconciler::new(&registry, &settings);
        let facts = StaticFacts::default();
        let mut host = FakeHost::new();
        let mut store = store_with(&["db-endpoint-available", "init-done"]);
        let previous = Status::active("Ready");

        let a = runner.run("update-status", &mut store, &facts, &mut host, Some(&previous));
        let b = runner.run("update-status", &mut store, &facts, &mut host, Some(&a.status));
        assert_eq!(a.flags, b.flags);
        assert_eq!(a.status, b.status);
        assert!(a.fired().is_empty() && b.fired().is_empty());
    }

    #[test]
    fn acyclic_chain_terminates_within_action_count() {
        let n = 5;
        let names: Vec<String> = (1..=n).map(|i| format!("step-{i}")).collect();
        let done: Vec<String> = names.iter().map(|s| format!("{s}.done")).collect();

        // Registered last-to-first so every sweep can only advance one link.
        let mut builder = ActionRegistry::builder();
        for i in (0..n).rev() {
            let mut action = Action::new(names[i].clone(), mark_done)
                .when_not(&done[i])
                .sets([done[i].as_str()]);
            if i > 0 {
                action = action.when(&done[i - 1]);
            }
            builder = builder.action(action);
        }
        let registry = builder.build().unwrap();
        let settings = Settings::default();
        let runner = Reconciler::new(&registry, &settings);
        let mut store = FlagStore::new();

        let report = runner.run(
            "install",
            &mut store,
            &StaticFacts::default(),
            &mut FakeHost::new(),
            None,
        );
        assert!(report.is_converged());
        assert_eq!(report.runs.len(), n);
        // n productive sweeps plus the quiet one that confirms the fixed point.
        assert!(report.sweeps <= n + 1, "took {} sweeps", report.sweeps);
        assert!(done.iter().all(|f| store.is_set(f)));
    }

    #[test]
    fn mutations_are_visible_only_from_the_next_sweep() {
        let registry = ActionRegistry::builder()
            .action(Action::new("a", mark_done).when_not("a.done").sets(["a.done"]))
            .action(
                Action::new("b", mark_done)
                    .when("a.done")
                    .when_not("b.done")
                    .sets(["b.done"]),
            )
            .build()
            .unwrap();
        let settings = Settings::default();
        let report = Reconciler::new(&registry, &settings).run(
            "install",
            &mut FlagStore::new(),
            &StaticFacts::default(),
            &mut FakeHost::new(),
            None,
        );
        let sweeps: Vec<_> = report.runs.iter().map(|r| (r.action.as_str(), r.sweep)).collect();
        assert_eq!(sweeps, vec![("a", 1), ("b", 2)]);
        assert_eq!(report.sweeps, 3);
    }

    #[test]
    fn cyclic_configuration_is_reported_as_divergence() {
        let registry = ActionRegistry::builder()
            .action(Action::new("raise", set_x).when_not("x").sets(["x"]))
            .action(Action::new("lower", clear_x).when("x").clears(["x"]))
            .build()
            .unwrap();
        let settings = Settings::default();
        let runner = Reconciler::new(&registry, &settings);
        let report = runner.run(
            "config-changed",
            &mut FlagStore::new(),
            &StaticFacts::default(),
            &mut FakeHost::new(),
            Some(&Status::active("Ready")),
        );

        assert_eq!(report.outcome, PassOutcome::Diverged { limit: 20 });
        assert_eq!(report.sweeps, 20);
        assert_eq!(report.status.level, StatusLevel::Blocked);
        assert!(matches!(
            report.into_result(),
            Err(ReconcileError::Divergence { sweeps: 20, limit: 20 })
        ));
    }

    #[test]
    fn failed_handler_is_retried_on_next_trigger() {
        let registry = install_registry();
        let settings = Settings::default();
        let runner = Reconciler::new(&registry, &settings);
        let mut host = FakeHost::new();
        let mut store = store_with(&["db-endpoint-available"]);

        let broken = StaticFacts::default().with_config("break-install", "yes");
        let first = runner.run("relation-changed", &mut store, &broken, &mut host, None);
        assert!(first.is_converged());
        assert_eq!(first.failed(), vec!["install"]);
        assert_eq!(first.runs.len(), 1, "no retry within the same pass");
        assert!(!store.is_set("init-done"));
        assert_eq!(first.status, Status::blocked("install command failed"));

        let second = runner.run(
            "update-status",
            &mut store,
            &StaticFacts::default(),
            &mut host,
            Some(&first.status),
        );
        assert_eq!(second.fired(), vec!["install"]);
        assert!(second.failed().is_empty());
        assert!(store.is_set("init-done"));
        assert_eq!(second.status, Status::active("Nextcloud init complete"));
    }

    #[test]
    fn undeclared_flag_discards_all_mutations() {
        let registry = ActionRegistry::builder()
            .action(Action::new("sneaky", sneaky).when_not("a").sets(["a"]))
            .build()
            .unwrap();
        let settings = Settings::default();
        let mut store = FlagStore::new();
        let report = Reconciler::new(&registry, &settings).run(
            "install",
            &mut store,
            &StaticFacts::default(),
            &mut FakeHost::new(),
            None,
        );
        assert_eq!(report.failed(), vec!["sneaky"]);
        assert!(!store.is_set("a"));
        assert!(!store.is_set("not-mine"));
        assert!(report.status.message.contains("undeclared flag 'not-mine'"));
    }

    #[test]
    fn eligible_lists_actions_whose_condition_holds() {
        let registry = install_registry();
        let settings = Settings::default();
        let runner = Reconciler::new(&registry, &settings);
        let facts = StaticFacts::default();
        assert!(runner.eligible(&FlagStore::new(), &facts).is_empty());
        assert_eq!(
            runner.eligible(&store_with(&["db-endpoint-available"]), &facts),
            vec!["install"]
        );
    }
}
