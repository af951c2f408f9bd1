use crate::output::{or_dash, print_json, timestamp, Table};
use rollout_core::journal::OperationStatus;
use std::path::Path;

pub fn run(root: &Path, domain: &str, json: bool) -> anyhow::Result<()> {
    let orch = super::open(root)?;
    let status = crate::runtime::block_on(|_| async { orch.status(domain).await })?;
    if json {
        return print_json(&status);
    }

    let site = &status.site;
    println!("{} ({})", site.domain, site.kind);
    println!("  tls:      {}", site.tls_state);
    if let Some(state) = status.process {
        println!("  process:  {}", super::site::process_label(state));
    }
    println!(
        "  release:  {}",
        or_dash(status.releases.active().map(|r| r.id.as_str()))
    );
    if let Some(target) = status.releases.rollback_target() {
        println!("  rollback: {}", target.id);
    }
    println!("  schema:   {}", status.schema_version);
    println!("  backups:  {}", status.backups);

    for held in &status.locks {
        println!(
            "  locked:   {} by {} since {}",
            held.scope,
            held.info.operation,
            timestamp(held.info.acquired_at)
        );
    }

    if !status.recent_operations.is_empty() {
        println!();
        let mut table = Table::new(&["STARTED", "COMMAND", "TARGET", "OUTCOME"]);
        for op in &status.recent_operations {
            let outcome = match &op.status {
                OperationStatus::Running => "running".to_string(),
                OperationStatus::Completed => "completed".to_string(),
                OperationStatus::Failed { code, .. } => format!("failed ({code})"),
                OperationStatus::Interrupted => "interrupted".to_string(),
            };
            table.row(vec![
                timestamp(op.started_at),
                op.command.clone(),
                or_dash(op.target.as_deref()),
                outcome,
            ]);
        }
        table.print();
    }
    Ok(())
}
