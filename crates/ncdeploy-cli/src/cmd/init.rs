use anyhow::Context;
use ncdeploy_core::config::Settings;
use ncdeploy_core::{io, paths};
use std::path::Path;

const FACTS_TEMPLATE: &str = "\
# Live facts maintained by the event delivery layer.
databases: {}
storage: {}
config: {}
";

pub fn run(root: &Path) -> anyhow::Result<()> {
    io::ensure_dir(&paths::state_dir(root)).context("failed to create state directory")?;

    let config = paths::config_path(root);
    if config.exists() {
        println!("Kept existing {}", paths::CONFIG_FILE);
    } else {
        Settings::default()
            .save(root)
            .context("failed to write settings")?;
        println!("Created {}", paths::CONFIG_FILE);
    }

    let facts = paths::facts_path(root);
    if facts.exists() {
        println!("Kept existing {}", paths::FACTS_FILE);
    } else {
        io::atomic_write(&facts, FACTS_TEMPLATE.as_bytes()).context("failed to write facts")?;
        println!("Created {}", paths::FACTS_FILE);
    }
    Ok(())
}
