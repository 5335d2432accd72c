use crate::output::{print_json, print_table};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let deployment = super::open_deployment(root)?;
    let eligible = deployment.eligible()?;

    if json {
        let list: Vec<_> = deployment
            .registry()
            .actions()
            .iter()
            .map(|a| {
                serde_json::json!({
                    "name": a.name(),
                    "description": a.description(),
                    "condition": a.condition().to_string(),
                    "sets": a.declared_sets().collect::<Vec<_>>(),
                    "clears": a.declared_clears().collect::<Vec<_>>(),
                    "eligible": eligible.contains(&a.name()),
                })
            })
            .collect();
        return print_json(&list);
    }

    let rows: Vec<Vec<String>> = deployment
        .registry()
        .actions()
        .iter()
        .map(|a| {
            let mark = if eligible.contains(&a.name()) { "*" } else { "" };
            vec![
                a.name().to_string(),
                mark.to_string(),
                a.condition().to_string(),
            ]
        })
        .collect();
    print_table(&["ACTION", "ELIGIBLE", "CONDITION"], &rows);
    Ok(())
}
