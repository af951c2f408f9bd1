use crate::output::{bytes, print_json, timestamp, Table};
use crate::runtime;
use clap::Subcommand;
use rollout_core::confirm::Confirmation;
use std::path::Path;

#[derive(Subcommand)]
pub enum BackupSubcommand {
    /// Dump a site's database
    Run {
        /// Site to back up (omit with --all)
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        domain: Option<String>,
        /// Back up every site with a database
        #[arg(long)]
        all: bool,
    },
    /// List a site's backups
    List { domain: String },
    /// Restore a backup over the site's database
    Restore {
        domain: String,
        backup_id: String,
        /// Repeat the domain to confirm
        #[arg(long, value_name = "DOMAIN")]
        confirm: Option<String>,
    },
    /// Remove backups past retention
    Prune,
}

pub fn run(root: &Path, subcmd: BackupSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        BackupSubcommand::Run { domain: Some(domain), .. } => run_one(root, &domain, json),
        BackupSubcommand::Run { domain: None, .. } => run_all(root, json),
        BackupSubcommand::List { domain } => list(root, &domain, json),
        BackupSubcommand::Restore {
            domain,
            backup_id,
            confirm,
        } => restore(root, &domain, &backup_id, confirm, json),
        BackupSubcommand::Prune => prune(root, json),
    }
}

fn run_one(root: &Path, domain: &str, json: bool) -> anyhow::Result<()> {
    let orch = super::open(root)?;
    let record = runtime::block_on(|_| async move { orch.backup(domain).await })?;
    if json {
        return print_json(&record);
    }
    println!(
        "{domain}: backup {} ({}) at {}",
        record.id,
        bytes(record.size),
        record.storage_path.display()
    );
    Ok(())
}

fn run_all(root: &Path, json: bool) -> anyhow::Result<()> {
    let orch = super::open(root)?;
    let runs = runtime::block_on(|_| async move { orch.backup_all().await })?;
    let failed = runs.iter().filter(|r| r.error.is_some()).count();
    if json {
        print_json(&runs)?;
    } else {
        let mut table = Table::new(&["DOMAIN", "BACKUP", "SIZE", "ERROR"]).numeric(&["SIZE"]);
        for r in &runs {
            match (&r.backup, &r.error) {
                (Some(b), _) => table.row(vec![r.domain.clone(), b.id.clone(), bytes(b.size)]),
                (None, error) => table.row(vec![
                    r.domain.clone(),
                    "FAILED".to_string(),
                    "-".to_string(),
                    error.clone().unwrap_or_default(),
                ]),
            }
        }
        table.print();
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} backups failed", runs.len());
    }
    Ok(())
}

fn list(root: &Path, domain: &str, json: bool) -> anyhow::Result<()> {
    let orch = super::open(root)?;
    let backups = orch.backups(domain)?;
    if json {
        return print_json(&backups);
    }
    if backups.is_empty() {
        println!("No backups for {domain}.");
        return Ok(());
    }
    let mut table =
        Table::new(&["ID", "CREATED", "SIZE", "SCHEMA", "EXPIRES"]).numeric(&["SIZE", "SCHEMA"]);
    for b in &backups {
        table.row(vec![
            b.id.clone(),
            timestamp(b.created_at),
            bytes(b.size),
            b.schema_version.to_string(),
            timestamp(b.retention_expiry),
        ]);
    }
    table.print();
    Ok(())
}

fn restore(
    root: &Path,
    domain: &str,
    backup_id: &str,
    confirm: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let orch = super::open(root)?;
    let confirmation = confirm.map(Confirmation::new);
    let record = runtime::block_on(|_| async move {
        orch.restore(domain, backup_id, confirmation).await
    })?;
    if json {
        return print_json(&record);
    }
    println!(
        "{domain}: restored {backup_id}, schema version {}",
        record.applied_version
    );
    Ok(())
}

fn prune(root: &Path, json: bool) -> anyhow::Result<()> {
    let orch = super::open(root)?;
    let report = orch.prune()?;
    if json {
        return print_json(&report);
    }
    for b in &report.removed {
        println!("  removed {} {}", b.site_domain, b.id);
    }
    for s in &report.skipped {
        println!("  skipped {} ({} in progress)", s.domain, s.operation);
    }
    println!("Pruned {} backups.", report.removed.len());
    Ok(())
}
