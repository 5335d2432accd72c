//! The static table of guarded actions, assembled once at startup.
//!
//! Registration order is execution order within a sweep. `build()` lints the
//! table and refuses configurations that are provably broken: an action that
//! cannot falsify its own condition would fire on every sweep.

use std::collections::BTreeSet;

use crate::condition::{self, Condition};
use crate::error::{HandlerFailure, HandlerResult, ReconcileError, Result};
use crate::flags::{FlagChanges, FlagSnapshot};
use crate::paths::validate_flag;
use crate::runner::ActionContext;
use crate::types::Status;

/// A handler is a plain function; all state it needs arrives through the context.
pub type Handler = fn(&mut ActionContext<'_>) -> HandlerResult;

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

pub struct Action {
    name: String,
    description: String,
    condition: Condition,
    sets: BTreeSet<String>,
    clears: BTreeSet<String>,
    handler: Handler,
}

impl Action {
    pub fn new(name: impl Into<String>, handler: Handler) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            condition: Condition::All(Vec::new()),
            sets: BTreeSet::new(),
            clears: BTreeSet::new(),
            handler,
        }
    }

    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    /// Add an arbitrary term (typically a live predicate) to the conjunction.
    pub fn require(mut self, term: Condition) -> Self {
        if let Condition::All(terms) = &mut self.condition {
            terms.push(term);
        }
        self
    }

    pub fn when(self, flag: &str) -> Self {
        self.require(condition::flag(flag))
    }

    pub fn when_all<'a>(self, flags: impl IntoIterator<Item = &'a str>) -> Self {
        flags.into_iter().fold(self, |a, f| a.when(f))
    }

    pub fn when_any<'a>(self, flags: impl IntoIterator<Item = &'a str>) -> Self {
        self.require(condition::any(flags.into_iter().map(condition::flag)))
    }

    pub fn when_not(self, flag: &str) -> Self {
        self.require(condition::not(condition::flag(flag)))
    }

    pub fn when_none<'a>(self, flags: impl IntoIterator<Item = &'a str>) -> Self {
        self.require(condition::none_of(flags.into_iter().map(condition::flag)))
    }

    pub fn sets<'a>(mut self, flags: impl IntoIterator<Item = &'a str>) -> Self {
        self.sets.extend(flags.into_iter().map(str::to_string));
        self
    }

    pub fn clears<'a>(mut self, flags: impl IntoIterator<Item = &'a str>) -> Self {
        self.clears.extend(flags.into_iter().map(str::to_string));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    pub fn handler(&self) -> Handler {
        self.handler
    }

    pub fn declared_sets(&self) -> impl Iterator<Item = &str> {
        self.sets.iter().map(String::as_str)
    }

    pub fn declared_clears(&self) -> impl Iterator<Item = &str> {
        self.clears.iter().map(String::as_str)
    }

    /// Reject staged mutations of flags the action did not declare.
    pub(crate) fn check_declared(&self, changes: &FlagChanges) -> HandlerResult {
        let undeclared = changes
            .flags_set()
            .find(|f| !self.sets.contains(*f))
            .or_else(|| changes.flags_cleared().find(|f| !self.clears.contains(*f)));
        match undeclared {
            Some(flag) => Err(HandlerFailure::UndeclaredFlag {
                action: self.name.clone(),
                flag: flag.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn lint(&self, problems: &mut Vec<String>) {
        let name = &self.name;
        let required = self.condition.required_flags();
        let forbidden = self.condition.forbidden_flags();

        for flag in self
            .condition
            .referenced_flags()
            .into_iter()
            .chain(self.declared_sets())
            .chain(self.declared_clears())
        {
            if validate_flag(flag).is_err() {
                problems.push(format!("action '{name}' uses invalid flag '{flag}'"));
            }
        }

        if let Some(flag) = required.iter().find(|f| forbidden.contains(*f)) {
            problems.push(format!(
                "action '{name}' both requires and forbids '{flag}' and can never run"
            ));
        }

        if let Some(flag) = self.sets.intersection(&self.clears).next() {
            problems.push(format!("action '{name}' both sets and clears '{flag}'"));
        }

        let falsifies = self.sets.iter().any(|f| forbidden.contains(&f.as_str()))
            || self.clears.iter().any(|f| required.contains(&f.as_str()));
        if !falsifies {
            problems.push(format!(
                "action '{name}' neither sets a flag it forbids nor clears a flag it requires, \
                 so it would re-fire on every sweep"
            ));
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("condition", &self.condition.to_string())
            .field("sets", &self.sets)
            .field("clears", &self.clears)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ActionRegistry
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ActionRegistry {
    actions: Vec<Action>,
    transient: BTreeSet<String>,
    blocking: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    actions: Vec<Action>,
    transient: BTreeSet<String>,
    blocking: Vec<(String, String)>,
}

impl RegistryBuilder {
    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Declare a flag as a transient signal that some action must consume.
    pub fn transient(mut self, flag: &str) -> Self {
        self.transient.insert(flag.to_string());
        self
    }

    /// While `flag` is set, every pass ends blocked with `message`.
    pub fn blocking(mut self, flag: &str, message: &str) -> Self {
        self.blocking.push((flag.to_string(), message.to_string()));
        self
    }

    pub fn build(self) -> Result<ActionRegistry> {
        let mut problems = Vec::new();

        let mut seen = BTreeSet::new();
        for action in &self.actions {
            if !seen.insert(action.name.as_str()) {
                problems.push(format!("duplicate action name '{}'", action.name));
            }
            action.lint(&mut problems);
        }

        for flag in &self.transient {
            if !self.actions.iter().any(|a| a.clears.contains(flag)) {
                problems.push(format!("transient flag '{flag}' is never cleared"));
            }
        }

        for (flag, _) in &self.blocking {
            if validate_flag(flag).is_err() {
                problems.push(format!("blocking flag '{flag}' is invalid"));
            }
        }

        if !problems.is_empty() {
            return Err(ReconcileError::Configuration(problems.join("; ")));
        }

        Ok(ActionRegistry {
            actions: self.actions,
            transient: self.transient,
            blocking: self.blocking,
        })
    }
}

impl ActionRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Actions in registration order.
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn get(&self, name: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn is_transient(&self, flag: &str) -> bool {
        self.transient.contains(flag)
    }

    /// Status forced by the first blocking flag present in `flags`.
    pub fn blocking_status(&self, flags: &FlagSnapshot) -> Option<Status> {
        self.blocking
            .iter()
            .find(|(flag, _)| flags.contains(flag))
            .map(|(_, message)| Status::blocked(message.clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
