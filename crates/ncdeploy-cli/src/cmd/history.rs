use crate::output::{print_json, print_table, truncate};
use ncdeploy_core::backend::StateBackend;
use ncdeploy_core::status::PassOutcome;
use std::path::Path;

pub fn run(root: &Path, limit: usize, json: bool) -> anyhow::Result<()> {
    let passes = super::open_backend(root)?.history(limit)?;

    if json {
        return print_json(&passes);
    }
    if passes.is_empty() {
        println!("No passes recorded.");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = passes
        .iter()
        .map(|p| {
            let outcome = match p.outcome {
                PassOutcome::Converged => "converged".to_string(),
                PassOutcome::Diverged { limit } => format!("diverged ({limit})"),
            };
            vec![
                p.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                p.trigger.clone(),
                p.sweeps.to_string(),
                p.runs.len().to_string(),
                outcome,
                truncate(&p.status.to_string(), 60),
            ]
        })
        .collect();
    print_table(
        &["STARTED", "TRIGGER", "SWEEPS", "ACTIONS", "OUTCOME", "STATUS"],
        &rows,
    );
    Ok(())
}
