//! External triggers and the flag mutations they imply.
//!
//! Events are named after the hooks that deliver them. An event only seeds
//! facts; every decision is left to the pass that follows.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Settings;
use crate::error::{ReconcileError, Result};
use crate::flags::FlagStore;
use crate::nextcloud;
use crate::storage::StorageFlags;

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Mysql,
    Postgres,
    Apache,
}

impl Endpoint {
    pub fn all() -> &'static [Endpoint] {
        &[Endpoint::Mysql, Endpoint::Postgres, Endpoint::Apache]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Mysql => "mysql",
            Endpoint::Postgres => "pgsql",
            Endpoint::Apache => "apache",
        }
    }

    /// Flag that mirrors the relation's availability.
    pub fn flag(self) -> &'static str {
        match self {
            Endpoint::Mysql => nextcloud::MYSQL_AVAILABLE,
            Endpoint::Postgres => nextcloud::POSTGRES_AVAILABLE,
            Endpoint::Apache => nextcloud::APACHE_AVAILABLE,
        }
    }

    fn from_relation(name: &str) -> Option<Self> {
        match name {
            "mysql" | "db" => Some(Endpoint::Mysql),
            "pgsql" | "postgres" | "postgresql" => Some(Endpoint::Postgres),
            "apache" | "website" => Some(Endpoint::Apache),
            _ => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

const LIFECYCLE_HOOKS: &[&str] = &[
    "install",
    "start",
    "stop",
    "upgrade-charm",
    "leader-elected",
    "leader-settings-changed",
    "post-series-upgrade",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RelationAvailable { endpoint: Endpoint },
    RelationGone { endpoint: Endpoint },
    /// `None` names the managed storage, whatever it is configured as.
    StorageAttached { storage: Option<String> },
    StorageDetaching { storage: Option<String> },
    ConfigChanged,
    /// Periodic check; carries no facts.
    UpdateStatus,
    /// Any other lifecycle hook; the pass still runs.
    Lifecycle { hook: String },
}

impl Event {
    /// Seed `store` with the facts this event carries.
    ///
    /// Storage events for a storage other than the managed one are ignored.
    pub fn apply(&self, store: &mut FlagStore, settings: &Settings) -> Result<()> {
        match self {
            Event::RelationAvailable { endpoint } => {
                store.set(endpoint.flag())?;
            }
            Event::RelationGone { endpoint } => {
                store.clear(endpoint.flag());
            }
            Event::StorageAttached { storage } => {
                if let Some(flags) = managed(storage.as_deref(), settings) {
                    store.set(&flags.attaching)?;
                    store.clear(&flags.detaching);
                }
            }
            Event::StorageDetaching { storage } => {
                if let Some(flags) = managed(storage.as_deref(), settings) {
                    store.set(&flags.detaching)?;
                    store.clear(&flags.attaching);
                }
            }
            Event::ConfigChanged => {
                store.set(nextcloud::CONFIG_CHANGED)?;
            }
            Event::UpdateStatus | Event::Lifecycle { .. } => {}
        }
        Ok(())
    }
}

fn managed(storage: Option<&str>, settings: &Settings) -> Option<StorageFlags> {
    match storage {
        Some(name) if name != settings.storage_name => {
            debug!(storage = %name, "ignoring event for unmanaged storage");
            None
        }
        _ => Some(StorageFlags::new(&settings.storage_name)),
    }
}

impl FromStr for Event {
    type Err = ReconcileError;

    fn from_str(hook: &str) -> Result<Self> {
        let hook = hook.trim();
        match hook {
            "config-changed" => return Ok(Event::ConfigChanged),
            "update-status" | "periodic-check" => return Ok(Event::UpdateStatus),
            "storage-attached" => return Ok(Event::StorageAttached { storage: None }),
            "storage-detaching" => return Ok(Event::StorageDetaching { storage: None }),
            h if LIFECYCLE_HOOKS.contains(&h) => {
                return Ok(Event::Lifecycle { hook: h.into() })
            }
            _ => {}
        }

        for (suffix, available) in [
            ("-relation-joined", true),
            ("-relation-changed", true),
            ("-relation-departed", false),
            ("-relation-broken", false),
        ] {
            if let Some(name) = hook.strip_suffix(suffix) {
                let endpoint = Endpoint::from_relation(name)
                    .ok_or_else(|| ReconcileError::UnknownEvent(hook.to_string()))?;
                return Ok(if available {
                    Event::RelationAvailable { endpoint }
                } else {
                    Event::RelationGone { endpoint }
                });
            }
        }

        if let Some(storage) = hook.strip_suffix("-storage-attached") {
            return Ok(Event::StorageAttached {
                storage: Some(storage.into()),
            });
        }
        if let Some(storage) = hook.strip_suffix("-storage-detaching") {
            return Ok(Event::StorageDetaching {
                storage: Some(storage.into()),
            });
        }

        Err(ReconcileError::UnknownEvent(hook.to_string()))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::RelationAvailable { endpoint } => write!(f, "{endpoint}-relation-changed"),
            Event::RelationGone { endpoint } => write!(f, "{endpoint}-relation-broken"),
            Event::StorageAttached { storage: None } => f.write_str("storage-attached"),
            Event::StorageAttached { storage: Some(s) } => write!(f, "{s}-storage-attached"),
            Event::StorageDetaching { storage: None } => f.write_str("storage-detaching"),
            Event::StorageDetaching { storage: Some(s) } => write!(f, "{s}-storage-detaching"),
            Event::ConfigChanged => f.write_str("config-changed"),
            Event::UpdateStatus => f.write_str("update-status"),
            Event::Lifecycle { hook } => f.write_str(hook),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(hook: &str) -> Event {
        hook.parse().unwrap()
    }

    #[test]
    fn parses_relation_hooks() {
        assert_eq!(
            parse("db-relation-joined"),
            Event::RelationAvailable {
                endpoint: Endpoint::Mysql
            }
        );
        assert_eq!(
            parse("pgsql-relation-broken"),
            Event::RelationGone {
                endpoint: Endpoint::Postgres
            }
        );
        assert_eq!(
            parse("website-relation-changed"),
            Event::RelationAvailable {
                endpoint: Endpoint::Apache
            }
        );
    }

    #[test]
    fn parses_storage_and_periodic_hooks() {
        assert_eq!(
            parse("data-storage-attached"),
            Event::StorageAttached {
                storage: Some("data".into())
            }
        );
        assert_eq!(parse("storage-detaching"), Event::StorageDetaching { storage: None });
        assert_eq!(parse("periodic-check"), Event::UpdateStatus);
        assert_eq!(
            parse("upgrade-charm"),
            Event::Lifecycle {
                hook: "upgrade-charm".into()
            }
        );
    }

    #[test]
    fn rejects_unknown_hooks() {
        for hook in ["", "frobnicate", "ldap-relation-joined"] {
            assert!(
                matches!(hook.parse::<Event>(), Err(ReconcileError::UnknownEvent(_))),
                "{hook:?}"
            );
        }
    }

    #[test]
    fn relation_events_toggle_endpoint_flags() {
        let settings = Settings::default();
        let mut store = FlagStore::new();
        parse("mysql-relation-changed")
            .apply(&mut store, &settings)
            .unwrap();
        assert!(store.is_set("mysql.available"));
        parse("mysql-relation-departed")
            .apply(&mut store, &settings)
            .unwrap();
        assert!(!store.is_set("mysql.available"));
    }

    #[test]
    fn storage_events_seed_transient_flags() {
        let settings = Settings::default();
        let mut store = FlagStore::new();
        parse("data-storage-detaching")
            .apply(&mut store, &settings)
            .unwrap();
        assert!(store.is_set("nextcloud.storage.data.detaching"));

        parse("data-storage-attached")
            .apply(&mut store, &settings)
            .unwrap();
        assert!(store.is_set("nextcloud.storage.data.attaching"));
        assert!(!store.is_set("nextcloud.storage.data.detaching"));

        let before = store.snapshot();
        parse("scratch-storage-attached")
            .apply(&mut store, &settings)
            .unwrap();
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn bare_storage_events_follow_configured_storage() {
        let settings = Settings {
            storage_name: "files".into(),
            ..Settings::default()
        };
        let mut store = FlagStore::new();
        parse("storage-attached")
            .apply(&mut store, &settings)
            .unwrap();
        assert!(store.is_set("nextcloud.storage.files.attaching"));

        parse("storage-detaching")
            .apply(&mut store, &settings)
            .unwrap();
        assert!(store.is_set("nextcloud.storage.files.detaching"));
        assert!(!store.is_set("nextcloud.storage.files.attaching"));

        let before = store.snapshot();
        parse("data-storage-attached")
            .apply(&mut store, &settings)
            .unwrap();
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn detaching_consumes_a_pending_attach() {
        let settings = Settings::default();
        let mut store = FlagStore::new();
        parse("data-storage-attached")
            .apply(&mut store, &settings)
            .unwrap();
        parse("data-storage-detaching")
            .apply(&mut store, &settings)
            .unwrap();
        assert!(!store.is_set("nextcloud.storage.data.attaching"));
        assert!(store.is_set("nextcloud.storage.data.detaching"));
    }

    #[test]
    fn display_round_trips_through_parse() {
        for event in [
            Event::ConfigChanged,
            Event::UpdateStatus,
            Event::RelationGone {
                endpoint: Endpoint::Apache,
            },
            Event::StorageAttached {
                storage: Some("data".into()),
            },
            Event::StorageDetaching { storage: None },
        ] {
            assert_eq!(event.to_string().parse::<Event>().unwrap(), event);
        }
    }
}
