//! Declarative condition expressions over flags and live predicates.
//!
//! Flags are read from a frozen [`FlagSnapshot`]; live predicates are queried
//! from [`LiveFacts`] each time they are evaluated and never cached.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::flags::FlagSnapshot;
use crate::types::{DbEndpoint, DbKind};

// ---------------------------------------------------------------------------
// LiveFacts
// ---------------------------------------------------------------------------

/// External state that is queried fresh on every evaluation.
pub trait LiveFacts {
    /// Connection details of a related database, if the relation is usable.
    fn database(&self, kind: DbKind) -> Option<DbEndpoint>;

    /// Mount location of the named storage, if attached.
    fn storage_mount(&self, name: &str) -> Option<PathBuf>;

    /// Operator configuration value; empty strings count as unset.
    fn config_value(&self, key: &str) -> Option<String>;

    fn service_running(&self, name: &str) -> bool;

    fn command_available(&self, name: &str) -> bool;

    /// Address the unit is reachable at from outside.
    fn public_address(&self) -> Option<String> {
        None
    }
}

// ---------------------------------------------------------------------------
// Predicate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    DatabaseAvailable { kind: DbKind },
    StorageMounted { name: String },
    ConfigSet { key: String },
    ServiceRunning { name: String },
    CommandAvailable { name: String },
}

impl Predicate {
    pub fn holds(&self, facts: &dyn LiveFacts) -> bool {
        match self {
            Predicate::DatabaseAvailable { kind } => facts.database(*kind).is_some(),
            Predicate::StorageMounted { name } => facts.storage_mount(name).is_some(),
            Predicate::ConfigSet { key } => facts
                .config_value(key)
                .is_some_and(|v| !v.trim().is_empty()),
            Predicate::ServiceRunning { name } => facts.service_running(name),
            Predicate::CommandAvailable { name } => facts.command_available(name),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::DatabaseAvailable { kind } => write!(f, "database-available({kind})"),
            Predicate::StorageMounted { name } => write!(f, "storage-mounted({name})"),
            Predicate::ConfigSet { key } => write!(f, "config-set({key})"),
            Predicate::ServiceRunning { name } => write!(f, "service-running({name})"),
            Predicate::CommandAvailable { name } => write!(f, "command-available({name})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum Condition {
    Always,
    Flag(String),
    Live(Predicate),
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
    /// Sugar for `All` of `Not` over each member.
    NoneOf(Vec<Condition>),
}

pub fn flag(name: impl Into<String>) -> Condition {
    Condition::Flag(name.into())
}

pub fn live(predicate: Predicate) -> Condition {
    Condition::Live(predicate)
}

pub fn all(conds: impl IntoIterator<Item = Condition>) -> Condition {
    Condition::All(conds.into_iter().collect())
}

pub fn any(conds: impl IntoIterator<Item = Condition>) -> Condition {
    Condition::Any(conds.into_iter().collect())
}

pub fn not(cond: Condition) -> Condition {
    Condition::Not(Box::new(cond))
}

pub fn none_of(conds: impl IntoIterator<Item = Condition>) -> Condition {
    Condition::NoneOf(conds.into_iter().collect())
}

impl Condition {
    /// Evaluate against one snapshot. Short-circuits left to right, so live
    /// predicates behind a false flag are never queried.
    pub fn evaluate(&self, flags: &FlagSnapshot, facts: &dyn LiveFacts) -> bool {
        match self {
            Condition::Always => true,
            Condition::Flag(name) => flags.contains(name),
            Condition::Live(p) => p.holds(facts),
            Condition::All(cs) => cs.iter().all(|c| c.evaluate(flags, facts)),
            Condition::Any(cs) => cs.iter().any(|c| c.evaluate(flags, facts)),
            Condition::Not(c) => !c.evaluate(flags, facts),
            Condition::NoneOf(cs) => !cs.iter().any(|c| c.evaluate(flags, facts)),
        }
    }

    /// Flags that must be present for the condition to hold, as far as can be
    /// read off its top-level conjunction.
    pub fn required_flags(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for term in self.conjuncts() {
            if let Condition::Flag(name) = term {
                out.push(name.as_str());
            }
        }
        out
    }

    /// Flags that must be absent, read off the top-level conjunction.
    pub fn forbidden_flags(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for term in self.conjuncts() {
            match term {
                Condition::Not(inner) => {
                    if let Condition::Flag(name) = inner.as_ref() {
                        out.push(name.as_str());
                    }
                }
                Condition::NoneOf(cs) => {
                    out.extend(cs.iter().filter_map(|c| match c {
                        Condition::Flag(name) => Some(name.as_str()),
                        _ => None,
                    }));
                }
                _ => {}
            }
        }
        out
    }

    /// Every flag name mentioned anywhere in the expression.
    pub fn referenced_flags(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_flags(&mut out);
        out
    }

    fn collect_flags<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Flag(name) => out.push(name),
            Condition::All(cs) | Condition::Any(cs) | Condition::NoneOf(cs) => {
                cs.iter().for_each(|c| c.collect_flags(out))
            }
            Condition::Not(c) => c.collect_flags(out),
            Condition::Always | Condition::Live(_) => {}
        }
    }

    fn conjuncts(&self) -> Vec<&Condition> {
        match self {
            Condition::All(cs) => cs.iter().flat_map(|c| c.conjuncts()).collect(),
            other => vec![other],
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, op: &str, cs: &[Condition]) -> fmt::Result {
            write!(f, "{op}(")?;
            for (i, c) in cs.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{c}")?;
            }
            f.write_str(")")
        }

        match self {
            Condition::Always => f.write_str("always"),
            Condition::Flag(name) => f.write_str(name),
            Condition::Live(p) => write!(f, "{p}"),
            Condition::All(cs) => join(f, "all", cs),
            Condition::Any(cs) => join(f, "any", cs),
            Condition::Not(c) => write!(f, "not({c})"),
            Condition::NoneOf(cs) => join(f, "none", cs),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticFacts;
    use std::cell::Cell;

    fn snap(names: &[&str]) -> FlagSnapshot {
        names.iter().copied().collect()
    }

    /// Counts live queries so short-circuiting can be observed.
    struct CountingFacts {
        queries: Cell<u32>,
    }

    impl LiveFacts for CountingFacts {
        fn database(&self, _: DbKind) -> Option<DbEndpoint> {
            self.queries.set(self.queries.get() + 1);
            None
        }
        fn storage_mount(&self, _: &str) -> Option<PathBuf> {
            self.queries.set(self.queries.get() + 1);
            None
        }
        fn config_value(&self, _: &str) -> Option<String> {
            self.queries.set(self.queries.get() + 1);
            None
        }
        fn service_running(&self, _: &str) -> bool {
            self.queries.set(self.queries.get() + 1);
            true
        }
        fn command_available(&self, _: &str) -> bool {
            self.queries.set(self.queries.get() + 1);
            true
        }
    }

    #[test]
    fn combinators_over_flags() {
        let facts = StaticFacts::default();
        let flags = snap(&["a", "b"]);

        assert!(all([flag("a"), flag("b")]).evaluate(&flags, &facts));
        assert!(!all([flag("a"), flag("c")]).evaluate(&flags, &facts));
        assert!(any([flag("c"), flag("b")]).evaluate(&flags, &facts));
        assert!(!any([flag("c"), flag("d")]).evaluate(&flags, &facts));
        assert!(not(flag("c")).evaluate(&flags, &facts));
        assert!(none_of([flag("c"), flag("d")]).evaluate(&flags, &facts));
        assert!(!none_of([flag("c"), flag("a")]).evaluate(&flags, &facts));
        assert!(all([]).evaluate(&flags, &facts));
        assert!(!any([]).evaluate(&flags, &facts));
    }

    #[test]
    fn live_predicates_are_queried() {
        let facts = StaticFacts::default()
            .with_config("fqdn", "cloud.example.com")
            .with_config("admin-password", "   ")
            .with_command("rsync");
        let flags = FlagSnapshot::default();

        let fqdn = live(Predicate::ConfigSet { key: "fqdn".into() });
        let blank = live(Predicate::ConfigSet {
            key: "admin-password".into(),
        });
        let rsync = live(Predicate::CommandAvailable {
            name: "rsync".into(),
        });
        let mysql = live(Predicate::DatabaseAvailable {
            kind: DbKind::Mysql,
        });

        assert!(fqdn.evaluate(&flags, &facts));
        assert!(!blank.evaluate(&flags, &facts));
        assert!(rsync.evaluate(&flags, &facts));
        assert!(!mysql.evaluate(&flags, &facts));
    }

    #[test]
    fn short_circuits_before_live_queries() {
        let facts = CountingFacts {
            queries: Cell::new(0),
        };
        let flags = FlagSnapshot::default();
        let cond = all([
            flag("nextcloud.initdone"),
            live(Predicate::ServiceRunning {
                name: "apache2".into(),
            }),
        ]);
        assert!(!cond.evaluate(&flags, &facts));
        assert_eq!(facts.queries.get(), 0);

        let cond = any([
            live(Predicate::CommandAvailable {
                name: "rsync".into(),
            }),
            live(Predicate::ServiceRunning {
                name: "apache2".into(),
            }),
        ]);
        assert!(cond.evaluate(&flags, &facts));
        assert_eq!(facts.queries.get(), 1);
    }

    #[test]
    fn live_predicates_are_not_cached() {
        let facts = CountingFacts {
            queries: Cell::new(0),
        };
        let cond = live(Predicate::CommandAvailable {
            name: "rsync".into(),
        });
        let flags = FlagSnapshot::default();
        cond.evaluate(&flags, &facts);
        cond.evaluate(&flags, &facts);
        assert_eq!(facts.queries.get(), 2);
    }

    #[test]
    fn required_and_forbidden_read_nested_conjunctions() {
        let cond = all([
            all([flag("a"), not(flag("b"))]),
            none_of([flag("c"), flag("d")]),
            any([flag("e"), flag("f")]),
        ]);
        assert_eq!(cond.required_flags(), vec!["a"]);
        assert_eq!(cond.forbidden_flags(), vec!["b", "c", "d"]);
        assert_eq!(cond.referenced_flags(), vec!["a", "b", "c", "d", "e", "f"]);
    }

    #[test]
    fn display_is_readable() {
        let cond = all([
            any([flag("mysql.available"), flag("postgres.master.available")]),
            not(flag("nextcloud.initdone")),
        ]);
        assert_eq!(
            cond.to_string(),
            "all(any(mysql.available, postgres.master.available), not(nextcloud.initdone))"
        );
    }
}
