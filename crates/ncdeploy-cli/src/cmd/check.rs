use crate::output::print_json;
use ncdeploy_core::config::WarnLevel;
use ncdeploy_core::deployment::default_registry;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let settings = super::load_settings(root)?;
    let warnings = settings.validate();
    let registry = default_registry(&settings);

    if json {
        let value = serde_json::json!({
            "warnings": warnings,
            "actions": registry.as_ref().ok().map(|r| r.len()),
            "registry_error": registry.as_ref().err().map(|e| e.to_string()),
        });
        print_json(&value)?;
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
        match &registry {
            Ok(r) => println!("Registry: {} actions, lint clean.", r.len()),
            Err(e) => println!("[error] {e}"),
        }
    }

    let has_errors = warnings.iter().any(|w| w.level == WarnLevel::Error);
    if let Err(e) = registry {
        anyhow::bail!("action registry is invalid: {e}");
    }
    if has_errors {
        anyhow::bail!("settings validation found errors");
    }
    Ok(())
}
