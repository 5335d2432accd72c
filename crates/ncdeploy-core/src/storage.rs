//! Relocation of the application's data directory onto attached storage.
//!
//! Each transition of [`MigrationState`] is one registered action gated on
//! the previous state's flag and the absence of the next one:
//!
//! ```text
//! unattached -> attached -> capacity-checked -> migrating -> migrated
//!                                                              |
//!                                              detach event    v
//!                                                 detached-without-migration
//! ```
//!
//! Detaching before migration completes returns to `unattached`. Detaching
//! after it is terminal: the data lives only on the removed storage, so the
//! deployment stays blocked and never migrates again.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::condition::{live, Predicate};
use crate::config::Settings;
use crate::error::{HandlerFailure, HandlerResult};
use crate::flags::FlagSnapshot;
use crate::host::run_checked;
use crate::nextcloud::{self, INIT_DONE};
use crate::registry::{Action, RegistryBuilder};
use crate::runner::ActionContext;
use crate::types::ServiceAction;

pub const DETACHED_MESSAGE: &str = "Storage detached. No way to store files.";

// ---------------------------------------------------------------------------
// StorageFlags
// ---------------------------------------------------------------------------

/// Flag and value names for one named storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageFlags {
    pub attaching: String,
    pub attached: String,
    pub capacity_checked: String,
    pub migrating: String,
    pub migrated: String,
    pub detached: String,
    pub detaching: String,
    /// Value key holding the mount location.
    pub mount_key: String,
}

impl StorageFlags {
    pub fn new(storage: &str) -> Self {
        let flag = |suffix: &str| format!("nextcloud.storage.{storage}.{suffix}");
        Self {
            attaching: flag("attaching"),
            attached: flag("attached"),
            capacity_checked: flag("capacity-checked"),
            migrating: flag("migrating"),
            migrated: flag("migrated"),
            detached: flag("detached"),
            detaching: flag("detaching"),
            mount_key: flag("mount"),
        }
    }

    fn of(ctx: &ActionContext<'_>) -> Self {
        Self::new(&ctx.settings.storage_name)
    }
}

// ---------------------------------------------------------------------------
// MigrationState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationState {
    Unattached,
    Attached,
    CapacityChecked,
    Migrating,
    Migrated,
    DetachedWithoutMigration,
}

impl MigrationState {
    pub fn all() -> &'static [MigrationState] {
        &[
            MigrationState::Unattached,
            MigrationState::Attached,
            MigrationState::CapacityChecked,
            MigrationState::Migrating,
            MigrationState::Migrated,
            MigrationState::DetachedWithoutMigration,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationState::Unattached => "unattached",
            MigrationState::Attached => "attached",
            MigrationState::CapacityChecked => "capacity-checked",
            MigrationState::Migrating => "migrating",
            MigrationState::Migrated => "migrated",
            MigrationState::DetachedWithoutMigration => "detached-without-migration",
        }
    }

    /// Derive the state of `storage` from the flags that record it.
    pub fn derive(flags: &FlagSnapshot, storage: &str) -> Self {
        let f = StorageFlags::new(storage);
        if flags.contains(&f.detached) {
            MigrationState::DetachedWithoutMigration
        } else if flags.contains(&f.migrated) {
            MigrationState::Migrated
        } else if flags.contains(&f.migrating) {
            MigrationState::Migrating
        } else if flags.contains(&f.capacity_checked) {
            MigrationState::CapacityChecked
        } else if flags.contains(&f.attached) {
            MigrationState::Attached
        } else {
            MigrationState::Unattached
        }
    }

    pub fn is_terminal(self) -> bool {
        self == MigrationState::DetachedWithoutMigration
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

pub fn register(builder: RegistryBuilder, settings: &Settings) -> RegistryBuilder {
    let f = StorageFlags::new(&settings.storage_name);
    builder
        .action(
            Action::new("storage-attach", attach)
                .describe("Record the mount location of newly attached storage")
                .when(&f.attaching)
                .when_none([f.attached.as_str(), f.detached.as_str()])
                .sets([f.attached.as_str()])
                .clears([f.attaching.as_str()]),
        )
        .action(
            Action::new("storage-attach-ignored", attach_ignored)
                .describe("Consume an attach signal for storage already attached or detached")
                .when(&f.attaching)
                .when_any([f.attached.as_str(), f.detached.as_str()])
                .clears([f.attaching.as_str()]),
        )
        .action(
            Action::new("storage-capacity-check", capacity_check)
                .describe("Verify the attached storage can hold the current data")
                .when(&f.attached)
                .when_none([
                    f.capacity_checked.as_str(),
                    f.detached.as_str(),
                    f.detaching.as_str(),
                ])
                .sets([f.capacity_checked.as_str()]),
        )
        .action(
            Action::new("storage-quiesce", quiesce)
                .describe("Enter maintenance mode and stop the web service")
                .when_all([f.capacity_checked.as_str(), INIT_DONE])
                .require(live(Predicate::CommandAvailable {
                    name: "rsync".into(),
                }))
                .when_none([
                    f.migrating.as_str(),
                    f.migrated.as_str(),
                    f.detached.as_str(),
                    f.detaching.as_str(),
                ])
                .sets([f.migrating.as_str()]),
        )
        .action(
            Action::new("storage-migrate", migrate)
                .describe("Copy data onto the storage and relink the data directory")
                .when(&f.migrating)
                .when_none([
                    f.migrated.as_str(),
                    f.detached.as_str(),
                    f.detaching.as_str(),
                ])
                .sets([f.migrated.as_str()])
                .clears([f.migrating.as_str()]),
        )
        .action(
            Action::new("storage-detach-migrated", detach_migrated)
                .describe("Stop serving once storage holding the only data copy is gone")
                .when_all([f.detaching.as_str(), f.migrated.as_str()])
                .sets([f.detached.as_str()])
                .clears([f.detaching.as_str()]),
        )
        .action(
            Action::new("storage-detach-unmigrated", detach_unmigrated)
                .describe("Forget storage that was detached before migration")
                .when(&f.detaching)
                .when_not(&f.migrated)
                .clears([
                    f.attaching.as_str(),
                    f.attached.as_str(),
                    f.capacity_checked.as_str(),
                    f.migrating.as_str(),
                    f.detaching.as_str(),
                ]),
        )
        .transient(&f.attaching)
        .transient(&f.detaching)
        .blocking(&f.detached, DETACHED_MESSAGE)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn recorded_mount(ctx: &ActionContext<'_>, f: &StorageFlags) -> Result<PathBuf, HandlerFailure> {
    ctx.value::<PathBuf>(&f.mount_key).ok_or_else(|| {
        HandlerFailure::Configuration(format!(
            "No mount recorded for {} storage",
            ctx.settings.storage_name
        ))
    })
}

fn set_maintenance_mode(ctx: &mut ActionContext<'_>, on: bool) -> HandlerResult {
    let flag = if on { "--on" } else { "--off" };
    let cmd = nextcloud::occ(ctx.settings, ["maintenance:mode", flag]);
    run_checked(ctx.host, &cmd)?;
    Ok(())
}

fn attach(ctx: &mut ActionContext<'_>) -> HandlerResult {
    let f = StorageFlags::of(ctx);
    let name = ctx.settings.storage_name.as_str();
    let mount = ctx.facts.storage_mount(name).ok_or_else(|| {
        HandlerFailure::Blocked(format!(
            "Cannot locate attached storage mount directory for {name}"
        ))
    })?;
    info!(mount = %mount.display(), "{name} storage attached");

    ctx.put_value(
        &f.mount_key,
        serde_json::Value::String(mount.to_string_lossy().into_owned()),
    );
    ctx.set_flag(&f.attached);
    ctx.clear_flag(&f.attaching);
    Ok(())
}

fn attach_ignored(ctx: &mut ActionContext<'_>) -> HandlerResult {
    let f = StorageFlags::of(ctx);
    if ctx.is_set(&f.detached) {
        warn!("storage attached after detach of migrated data; ignoring");
    } else {
        debug!("storage already attached");
    }
    ctx.clear_flag(&f.attaching);
    Ok(())
}

fn capacity_check(ctx: &mut ActionContext<'_>) -> HandlerResult {
    let f = StorageFlags::of(ctx);
    let settings = ctx.settings;
    let mount = recorded_mount(ctx, &f)?;

    let required = if ctx.host.exists(&settings.app_dir) {
        ctx.host.used_bytes(&settings.data_dir())?
    } else {
        0
    };
    let free = ctx.host.free_bytes(&mount)?;
    info!(required, free, mount = %mount.display(), "storage capacity");

    if required > free {
        return Err(HandlerFailure::Blocked(format!(
            "Not enough free space in {} storage: {}",
            settings.storage_name,
            mount.display()
        )));
    }
    ctx.set_flag(&f.capacity_checked);
    Ok(())
}

fn quiesce(ctx: &mut ActionContext<'_>) -> HandlerResult {
    let f = StorageFlags::of(ctx);
    let settings = ctx.settings;
    let mount = recorded_mount(ctx, &f)?;

    ctx.maintenance(format!(
        "Preparing to migrate data to {}",
        mount.display()
    ));
    set_maintenance_mode(ctx, true)?;
    ctx.host.service(&settings.web_service, ServiceAction::Stop)?;
    ctx.set_flag(&f.migrating);
    Ok(())
}

fn migrate(ctx: &mut ActionContext<'_>) -> HandlerResult {
    let f = StorageFlags::of(ctx);
    let settings = ctx.settings;
    let old = settings.data_dir();
    let new = recorded_mount(ctx, &f)?;
    let backup = backup_path(&old, ctx.host.now().timestamp());

    ctx.maintenance(format!(
        "Migrating data from {} to {}",
        old.display(),
        new.display()
    ));

    if let Err(e) = ctx.host.copy_tree(&old, &new) {
        error!(error = %e, "data copy failed");
        return Err(HandlerFailure::Blocked(format!(
            "Failed to sync data from {} to {}",
            old.display(),
            new.display()
        )));
    }

    ctx.host.rename(&old, &backup)?;
    ctx.maintenance(format!("Relocated data-directory to {}", backup.display()));

    if let Err(e) = ctx.host.symlink(&new, &old) {
        if let Err(restore) = ctx.host.rename(&backup, &old) {
            error!(error = %restore, backup = %backup.display(), "could not restore data directory");
        }
        return Err(e);
    }
    ctx.maintenance("Created symlink to new data directory");

    ctx.host
        .chown_recursive(&new, &settings.web_user, &settings.web_group)?;
    ctx.maintenance("Ensured proper permissions on new data directory");

    ctx.host.chmod(&new, settings.data_mode)?;
    ctx.maintenance("Migration completed.");

    set_maintenance_mode(ctx, false)?;
    ctx.host.service(&settings.web_service, ServiceAction::Start)?;

    ctx.set_flag(&f.migrated);
    ctx.clear_flag(&f.migrating);
    ctx.active("Nextcloud is OK.");
    Ok(())
}

fn detach_migrated(ctx: &mut ActionContext<'_>) -> HandlerResult {
    let f = StorageFlags::of(ctx);
    if !ctx.is_set(&f.detached) {
        warn!("storage holding migrated data is detaching");
        ctx.host
            .service(&ctx.settings.web_service, ServiceAction::Stop)?;
    }
    ctx.set_flag(&f.detached);
    ctx.clear_flag(&f.detaching);
    Ok(())
}

fn detach_unmigrated(ctx: &mut ActionContext<'_>) -> HandlerResult {
    let f = StorageFlags::of(ctx);
    if ctx.is_set(&f.migrating) {
        set_maintenance_mode(ctx, false)?;
        ctx.host
            .service(&ctx.settings.web_service, ServiceAction::Start)?;
    }
    if ctx.is_set(INIT_DONE) {
        ctx.active(format!(
            "Storage detached; serving data from {}",
            ctx.settings.data_dir().display()
        ));
    }

    ctx.unset_value(&f.mount_key);
    for flag in [
        &f.attaching,
        &f.attached,
        &f.capacity_checked,
        &f.migrating,
        &f.detaching,
    ] {
        ctx.clear_flag(flag);
    }
    Ok(())
}

fn backup_path(data_dir: &Path, ts: i64) -> PathBuf {
    let mut name = data_dir.as_os_str().to_owned();
    name.push(format!("-{ts}"));
    PathBuf::from(name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
