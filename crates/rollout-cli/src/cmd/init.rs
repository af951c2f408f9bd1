use crate::output::print_json;
use anyhow::Context;
use rollout_core::{paths, Orchestrator};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let created = Orchestrator::init(root)
        .with_context(|| format!("failed to initialize {}", root.display()))?;

    if json {
        return print_json(&serde_json::json!({
            "root": root,
            "config": paths::config_path(root),
            "config_created": created,
        }));
    }

    println!("Initialized rollout in: {}", root.display());
    if created {
        println!("  created: {}", paths::CONFIG_FILE);
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }
    Ok(())
}
