//! Production [`Host`]: real commands, real filesystem, systemd services.
//!
//! Everything published for operators (status, application version, opened
//! ports) is written to `.ncdeploy/status.yaml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::command;
use crate::config::Settings;
use crate::error::{HandlerFailure, HandlerResult, Result};
use crate::host::{run_checked, CommandOutput, CommandSpec, Host};
use crate::paths;
use crate::types::{ServiceAction, Status};

// ---------------------------------------------------------------------------
// Published status file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishedStatus {
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub application_version: Option<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PublishedStatus {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::status_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&paths::status_path(root), data.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// SystemHost
// ---------------------------------------------------------------------------

pub struct SystemHost {
    root: PathBuf,
    timeout: Duration,
    published: PublishedStatus,
}

impl SystemHost {
    pub fn new(root: &Path, settings: &Settings) -> Result<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            timeout: settings.command_timeout(),
            published: PublishedStatus::load(root)?,
        })
    }

    pub fn published(&self) -> &PublishedStatus {
        &self.published
    }

    fn publish(&mut self) {
        self.published.updated_at = Some(Utc::now());
        if let Err(e) = self.published.save(&self.root) {
            warn!(error = %e, "could not write status file");
        }
    }

    fn command(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program).timeout(self.timeout)
    }
}

impl Host for SystemHost {
    fn run(&mut self, command: &CommandSpec) -> std::result::Result<CommandOutput, HandlerFailure> {
        command::run(command, self.timeout)
    }

    fn copy_tree(&mut self, from: &Path, to: &Path) -> HandlerResult {
        let cmd = self.command("rsync").args([
            "-a".to_string(),
            format!("{}/", from.display()),
            format!("{}/", to.display()),
        ]);
        run_checked(self, &cmd)?;
        Ok(())
    }

    fn rename(&mut self, from: &Path, to: &Path) -> HandlerResult {
        std::fs::rename(from, to)?;
        Ok(())
    }

    fn symlink(&mut self, target: &Path, link: &Path) -> HandlerResult {
        make_symlink(target, link)?;
        Ok(())
    }

    fn chown_recursive(&mut self, path: &Path, user: &str, group: &str) -> HandlerResult {
        let cmd = self
            .command("chown")
            .args(["-R".to_string(), format!("{user}:{group}")])
            .arg(path.display().to_string());
        run_checked(self, &cmd)?;
        Ok(())
    }

    fn chmod(&mut self, path: &Path, mode: u32) -> HandlerResult {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        {
            let _ = (path, mode);
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn used_bytes(&self, path: &Path) -> std::result::Result<u64, HandlerFailure> {
        Ok(crate::io::tree_size(path)?)
    }

    fn free_bytes(&self, path: &Path) -> std::result::Result<u64, HandlerFailure> {
        let cmd = self
            .command("df")
            .args(["--output=avail", "-B1"])
            .arg(path.display().to_string());
        let out = command::run(&cmd, self.timeout)?.check(&cmd)?;
        parse_df_avail(&out.stdout).ok_or_else(|| HandlerFailure::CommandFailed {
            command: cmd.to_string(),
            code: out.code,
            output: format!("unexpected output: {}", out.stdout.trim()),
        })
    }

    fn service(&mut self, name: &str, action: ServiceAction) -> HandlerResult {
        info!(service = name, %action, "service control");
        let cmd = self.command("systemctl").args([action.as_str(), name]);
        run_checked(self, &cmd)?;
        Ok(())
    }

    fn open_port(&mut self, port: u16) -> HandlerResult {
        if !self.published.ports.contains(&port) {
            self.published.ports.push(port);
            self.published.ports.sort_unstable();
            self.publish();
        }
        Ok(())
    }

    fn set_status(&mut self, status: &Status) {
        info!(level = %status.level, message = %status.message, "status");
        self.published.status = Some(status.clone());
        self.publish();
    }

    fn set_application_version(&mut self, version: &str) {
        self.published.application_version = Some(version.to_string());
        self.publish();
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks require a unix host",
    ))
}

/// Last numeric line of `df --output=avail -B1`.
fn parse_df_avail(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .filter_map(|l| l.trim().parse::<u64>().ok())
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn host(dir: &TempDir) -> SystemHost {
        SystemHost::new(dir.path(), &Settings::default()).unwrap()
    }

    #[test]
    fn parses_df_output() {
        assert_eq!(parse_df_avail("    Avail\n52428800\n"), Some(52_428_800));
        assert_eq!(parse_df_avail("Avail\n"), None);
    }

    #[test]
    fn status_and_ports_are_published_to_file() {
        let dir = TempDir::new().unwrap();
        let mut h = host(&dir);
        h.open_port(80).unwrap();
        h.open_port(80).unwrap();
        h.set_application_version("28.0.1");
        h.set_status(&Status::active("Ready"));

        let published = PublishedStatus::load(dir.path()).unwrap();
        assert_eq!(published.status, Some(Status::active("Ready")));
        assert_eq!(published.application_version.as_deref(), Some("28.0.1"));
        assert_eq!(published.ports, vec![80]);

        // A fresh host picks up what was already published.
        assert_eq!(host(&dir).published().ports, vec![80]);
    }

    #[cfg(unix)]
    #[test]
    fn filesystem_operations() {
        let dir = TempDir::new().unwrap();
        let mut h = host(&dir);
        let data = dir.path().join("data");
        let mount = dir.path().join("mnt");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::create_dir_all(&mount).unwrap();
        std::fs::write(data.join("file.txt"), b"12345").unwrap();

        assert_eq!(h.used_bytes(&data).unwrap(), 5);
        let backup = dir.path().join("data-1");
        h.rename(&data, &backup).unwrap();
        h.symlink(&mount, &data).unwrap();
        assert!(h.exists(&data));
        assert_eq!(std::fs::read_link(&data).unwrap(), mount);

        h.chmod(&mount, 0o700).unwrap();
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&mount).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
