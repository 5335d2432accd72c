use crate::output::{print_json, print_table};
use clap::Subcommand;
use ncdeploy_core::backend::{PersistedState, StateBackend};
use std::path::Path;

#[derive(Subcommand)]
pub enum FlagsSubcommand {
    /// List set flags and stored values
    List,

    /// Set a flag by hand
    Set { name: String },

    /// Clear a flag by hand
    Clear { name: String },
}

pub fn run(root: &Path, subcmd: FlagsSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        FlagsSubcommand::List => list(root, json),
        FlagsSubcommand::Set { name } => update(root, &name, true, json),
        FlagsSubcommand::Clear { name } => update(root, &name, false, json),
    }
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let state = super::open_backend(root)?.load()?;

    if json {
        let value = serde_json::json!({
            "flags": state.flags,
            "values": state.values,
        });
        return print_json(&value);
    }

    if state.flags.is_empty() {
        println!("No flags set.");
    } else {
        for flag in &state.flags {
            println!("{flag}");
        }
    }
    if !state.values.is_empty() {
        println!();
        let rows: Vec<Vec<String>> = state
            .values
            .iter()
            .map(|(k, v)| vec![k.clone(), v.to_string()])
            .collect();
        print_table(&["KEY", "VALUE"], &rows);
    }
    Ok(())
}

fn update(root: &Path, name: &str, set: bool, json: bool) -> anyhow::Result<()> {
    let mut backend = super::open_backend(root)?;
    let state = backend.load()?;
    let mut store = state.store();

    let changed = if set {
        store.set(name)?
    } else {
        store.clear(name)
    };
    if changed {
        backend.commit(&PersistedState::from_store(store, state.status))?;
    }

    if json {
        print_json(&serde_json::json!({ "flag": name, "set": set, "changed": changed }))?;
    } else {
        let verb = if set { "set" } else { "cleared" };
        if changed {
            println!("{verb} {name}");
        } else {
            println!("{name} already {verb}");
        }
    }
    Ok(())
}
