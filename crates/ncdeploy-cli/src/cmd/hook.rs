use crate::output::{print_json, print_table};
use anyhow::Context;
use ncdeploy_core::event::Event;
use ncdeploy_core::runner::RunResult;
use std::path::Path;

pub fn run(root: &Path, hook: &str, json: bool) -> anyhow::Result<()> {
    let event: Event = hook.parse()?;
    let mut deployment = super::open_deployment(root)?;
    let report = deployment
        .handle_event(&event)
        .with_context(|| format!("failed to handle {event}"))?;

    if json {
        print_json(&report)?;
    } else {
        println!(
            "{}: {} sweep(s), {} action run(s)",
            report.trigger,
            report.sweeps,
            report.runs.len()
        );
        if !report.runs.is_empty() {
            let rows: Vec<Vec<String>> = report
                .runs
                .iter()
                .map(|r| {
                    let result = match &r.result {
                        RunResult::Succeeded => "ok".to_string(),
                        RunResult::Failed { level, message } => format!("{level}: {message}"),
                    };
                    vec![r.sweep.to_string(), r.action.clone(), result]
                })
                .collect();
            print_table(&["SWEEP", "ACTION", "RESULT"], &rows);
        }
        println!("Status: {}", report.status);
    }

    report.into_result()?;
    Ok(())
}
