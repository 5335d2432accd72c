use crate::output::print_json;
use ncdeploy_core::backend::StateBackend;
use ncdeploy_core::flags::FlagSnapshot;
use ncdeploy_core::storage::MigrationState;
use ncdeploy_core::system::PublishedStatus;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let settings = super::load_settings(root)?;
    let state = super::open_backend(root)?.load()?;
    let published = PublishedStatus::load(root)?;

    let flags: FlagSnapshot = state.store().snapshot();
    let migration = MigrationState::derive(&flags, &settings.storage_name);

    if json {
        let value = serde_json::json!({
            "status": state.status,
            "migration": migration,
            "storage": settings.storage_name,
            "application_version": published.application_version,
            "ports": published.ports,
            "updated_at": published.updated_at,
        });
        return print_json(&value);
    }

    match &state.status {
        Some(status) => println!("Status:    {status}"),
        None => println!("Status:    (no pass has run yet)"),
    }
    println!("Storage:   {} ({migration})", settings.storage_name);
    if let Some(version) = &published.application_version {
        println!("Version:   {version}");
    }
    if !published.ports.is_empty() {
        let ports: Vec<String> = published.ports.iter().map(u16::to_string).collect();
        println!("Ports:     {}", ports.join(", "));
    }
    if let Some(at) = published.updated_at {
        println!("Updated:   {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    Ok(())
}
