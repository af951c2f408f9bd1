use crate::output::{or_dash, print_json, timestamp, Table};
use crate::runtime;
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum ReleaseSubcommand {
    /// Stage, migrate, swap and health-check an artifact
    Ship {
        domain: String,
        /// Artifact file or directory
        artifact: PathBuf,
    },
    /// List a site's releases, newest first
    List { domain: String },
}

pub fn run(root: &Path, subcmd: ReleaseSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ReleaseSubcommand::Ship { domain, artifact } => ship(root, &domain, &artifact, json),
        ReleaseSubcommand::List { domain } => list(root, &domain, json),
    }
}

fn ship(root: &Path, domain: &str, artifact: &Path, json: bool) -> anyhow::Result<()> {
    let orch = super::open(root)?;
    let outcome = runtime::block_on(|cancel| async move {
        orch.release(domain, artifact, &cancel).await
    })?;

    if json {
        return print_json(&outcome);
    }
    if !outcome.changed {
        println!("{domain}: release {} is already active", outcome.release.id);
        return Ok(());
    }
    println!("{domain}: release {} is active", outcome.release.id);
    if let Some(report) = &outcome.migrations {
        if report.applied.is_empty() {
            println!("  migrations: up to date (version {})", report.current_version);
        } else {
            let applied: Vec<String> = report.applied.iter().map(u64::to_string).collect();
            println!(
                "  migrations: applied {} (version {})",
                applied.join(", "),
                report.current_version
            );
        }
    }
    if outcome.proxy_reloaded {
        println!("  proxy config reloaded");
    }
    Ok(())
}

fn list(root: &Path, domain: &str, json: bool) -> anyhow::Result<()> {
    let orch = super::open(root)?;
    let ledger = orch.releases(domain)?;
    if json {
        return print_json(&ledger);
    }
    if ledger.releases.is_empty() {
        println!("No releases for {domain}.");
        return Ok(());
    }
    let mut table =
        Table::new(&["ID", "STATUS", "CREATED", "ACTIVATED", "CHECKS"]).numeric(&["CHECKS"]);
    for r in ledger.releases.iter().rev() {
        let marker = if ledger.current.as_deref() == Some(r.id.as_str()) {
            "*"
        } else {
            ""
        };
        table.row(vec![
            format!("{}{marker}", r.id),
            r.status.to_string(),
            timestamp(r.created_at),
            or_dash(r.activated_at.map(timestamp)),
            or_dash(r.health_check_result.as_ref().map(|h| h.attempts)),
        ]);
    }
    table.print();
    Ok(())
}

pub fn rollback(root: &Path, domain: &str, json: bool) -> anyhow::Result<()> {
    let orch = super::open(root)?;
    let outcome =
        runtime::block_on(|cancel| async move { orch.rollback(domain, &cancel).await })?;
    if json {
        return print_json(&outcome);
    }
    println!(
        "{domain}: rolled back from {} to {}",
        or_dash(outcome.from.as_deref()),
        outcome.to.id
    );
    Ok(())
}
