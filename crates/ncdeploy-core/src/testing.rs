//! Scripted collaborators shared by the unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};

use crate::condition::LiveFacts;
use crate::error::{HandlerFailure, HandlerResult};
use crate::host::{CommandOutput, CommandSpec, Host};
use crate::types::{DbEndpoint, DbKind, ServiceAction, Status};

// ---------------------------------------------------------------------------
// StaticFacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct StaticFacts {
    pub databases: BTreeMap<DbKind, DbEndpoint>,
    pub mounts: BTreeMap<String, PathBuf>,
    pub config: BTreeMap<String, String>,
    pub services: BTreeSet<String>,
    pub commands: BTreeSet<String>,
    pub public_address: Option<String>,
}

impl StaticFacts {
    pub fn with_database(mut self, kind: DbKind) -> Self {
        self.databases.insert(
            kind,
            DbEndpoint {
                host: "10.0.0.5".into(),
                port: Some(3306),
                database: "nextcloud".into(),
                user: "nc".into(),
                password: "db-secret".into(),
            },
        );
        self
    }

    pub fn with_mount(mut self, name: &str, path: impl Into<PathBuf>) -> Self {
        self.mounts.insert(name.into(), path.into());
        self
    }

    pub fn with_config(mut self, key: &str, value: &str) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_service(mut self, name: &str) -> Self {
        self.services.insert(name.into());
        self
    }

    pub fn with_command(mut self, name: &str) -> Self {
        self.commands.insert(name.into());
        self
    }

    pub fn with_public_address(mut self, addr: &str) -> Self {
        self.public_address = Some(addr.into());
        self
    }

    /// Database, admin credentials and rsync: everything an install needs.
    pub fn ready() -> Self {
        Self::default()
            .with_database(DbKind::Mysql)
            .with_config("admin-username", "admin")
            .with_config("admin-password", "admin-secret")
            .with_public_address("203.0.113.7")
            .with_command("rsync")
    }
}

impl LiveFacts for StaticFacts {
    fn database(&self, kind: DbKind) -> Option<DbEndpoint> {
        self.databases.get(&kind).cloned()
    }

    fn storage_mount(&self, name: &str) -> Option<PathBuf> {
        self.mounts.get(name).cloned()
    }

    fn config_value(&self, key: &str) -> Option<String> {
        self.config.get(key).cloned()
    }

    fn service_running(&self, name: &str) -> bool {
        self.services.contains(name)
    }

    fn command_available(&self, name: &str) -> bool {
        self.commands.contains(name)
    }

    fn public_address(&self) -> Option<String> {
        self.public_address.clone()
    }
}

// ---------------------------------------------------------------------------
// FakeHost
// ---------------------------------------------------------------------------

/// Records every side effect as a line in `calls`; failures are scripted.
#[derive(Debug, Default)]
pub struct FakeHost {
    pub calls: Vec<String>,
    pub statuses: Vec<Status>,
    pub version: Option<String>,
    pub ports: Vec<u16>,
    /// Commands whose display starts with the key return the given output.
    pub command_results: Vec<(String, CommandOutput)>,
    /// Operation names (`copy_tree`, `rename`, `symlink`, ...) that fail.
    pub failing_ops: BTreeSet<String>,
    pub existing: BTreeSet<PathBuf>,
    pub used: BTreeMap<PathBuf, u64>,
    pub free: BTreeMap<PathBuf, u64>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_command(mut self, prefix: &str, code: i32, stderr: &str) -> Self {
        self.command_results.push((
            prefix.into(),
            CommandOutput {
                code: Some(code),
                stdout: String::new(),
                stderr: stderr.into(),
            },
        ));
        self
    }

    pub fn fail_op(mut self, op: &str) -> Self {
        self.failing_ops.insert(op.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.existing.insert(path.into());
        self
    }

    pub fn with_usage(mut self, path: impl Into<PathBuf>, used: u64) -> Self {
        self.used.insert(path.into(), used);
        self
    }

    pub fn with_free(mut self, path: impl Into<PathBuf>, free: u64) -> Self {
        self.free.insert(path.into(), free);
        self
    }

    pub fn ran(&self, prefix: &str) -> bool {
        self.calls.iter().any(|c| c.starts_with(prefix))
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.calls.iter().position(|c| c.starts_with(prefix))
    }

    fn op(&mut self, name: &str, line: String) -> HandlerResult {
        self.calls.push(line);
        if self.failing_ops.contains(name) {
            return Err(HandlerFailure::Io(std::io::Error::other(format!(
                "{name} failed"
            ))));
        }
        Ok(())
    }
}

impl Host for FakeHost {
    fn run(&mut self, command: &CommandSpec) -> Result<CommandOutput, HandlerFailure> {
        let line = format!("run {command}");
        self.calls.push(line);
        let shown = command.to_string();
        Ok(self
            .command_results
            .iter()
            .find(|(prefix, _)| shown.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_else(CommandOutput::success))
    }

    fn copy_tree(&mut self, from: &Path, to: &Path) -> HandlerResult {
        self.op("copy_tree", format!("copy {} {}", from.display(), to.display()))
    }

    fn rename(&mut self, from: &Path, to: &Path) -> HandlerResult {
        self.op("rename", format!("rename {} {}", from.display(), to.display()))
    }

    fn symlink(&mut self, target: &Path, link: &Path) -> HandlerResult {
        self.op(
            "symlink",
            format!("symlink {} {}", target.display(), link.display()),
        )
    }

    fn chown_recursive(&mut self, path: &Path, user: &str, group: &str) -> HandlerResult {
        self.op("chown", format!("chown {user}:{group} {}", path.display()))
    }

    fn chmod(&mut self, path: &Path, mode: u32) -> HandlerResult {
        self.op("chmod", format!("chmod {mode:o} {}", path.display()))
    }

    fn exists(&self, path: &Path) -> bool {
        self.existing.contains(path)
    }

    fn used_bytes(&self, path: &Path) -> Result<u64, HandlerFailure> {
        Ok(self.used.get(path).copied().unwrap_or(0))
    }

    fn free_bytes(&self, path: &Path) -> Result<u64, HandlerFailure> {
        Ok(self.free.get(path).copied().unwrap_or(u64::MAX))
    }

    fn service(&mut self, name: &str, action: ServiceAction) -> HandlerResult {
        self.op("service", format!("service {action} {name}"))
    }

    fn open_port(&mut self, port: u16) -> HandlerResult {
        self.ports.push(port);
        self.op("open_port", format!("open-port {port}"))
    }

    fn set_status(&mut self, status: &Status) {
        self.statuses.push(status.clone());
    }

    fn set_application_version(&mut self, version: &str) {
        self.version = Some(version.to_string());
    }

    fn now(&self) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}
