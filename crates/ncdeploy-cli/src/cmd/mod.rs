pub mod actions;
pub mod check;
pub mod flags;
pub mod history;
pub mod hook;
pub mod init;
pub mod status;

use anyhow::Context;
use ncdeploy_core::backend::RedbBackend;
use ncdeploy_core::config::Settings;
use ncdeploy_core::deployment::Deployment;
use ncdeploy_core::facts::FactsFile;
use ncdeploy_core::paths;
use ncdeploy_core::system::SystemHost;
use std::path::Path;

pub type SystemDeployment = Deployment<RedbBackend, FactsFile, SystemHost>;

pub fn load_settings(root: &Path) -> anyhow::Result<Settings> {
    Settings::load(root).context("failed to load settings")
}

pub fn open_backend(root: &Path) -> anyhow::Result<RedbBackend> {
    RedbBackend::open(&paths::db_path(root)).context("failed to open state store")
}

/// Deployment wired to the real system, as used for hook handling.
pub fn open_deployment(root: &Path) -> anyhow::Result<SystemDeployment> {
    let settings = load_settings(root)?;
    let backend = open_backend(root)?;
    let host = SystemHost::new(root, &settings).context("failed to read published status")?;
    let deployment = Deployment::new(settings, backend, FactsFile::new(root), host)
        .context("invalid action registry")?;
    Ok(deployment)
}
