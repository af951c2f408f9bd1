use crate::output::{or_dash, print_json, timestamp, Table};
use crate::runtime;
use clap::Subcommand;
use rollout_core::confirm::Confirmation;
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum MigrateSubcommand {
    /// Apply outstanding migrations in version order
    Apply {
        domain: String,
        /// Migration scripts (default: migrations/ of the current release)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Back up, drop the schema and replay every migration
    Reset {
        domain: String,
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Repeat the domain to confirm
        #[arg(long, value_name = "DOMAIN")]
        confirm: Option<String>,
    },
    /// Show the schema version, ledger and outstanding migrations
    Status {
        domain: String,
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

pub fn run(root: &Path, subcmd: MigrateSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        MigrateSubcommand::Apply { domain, dir } => apply(root, &domain, dir.as_deref(), json),
        MigrateSubcommand::Reset {
            domain,
            dir,
            confirm,
        } => reset(root, &domain, dir.as_deref(), confirm, json),
        MigrateSubcommand::Status { domain, dir } => status(root, &domain, dir.as_deref(), json),
    }
}

fn apply(root: &Path, domain: &str, dir: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let orch = super::open(root)?;
    let report =
        runtime::block_on(|_| async move { orch.migrate_apply(domain, dir).await })?;
    if json {
        return print_json(&report);
    }
    if report.applied.is_empty() {
        println!("{domain}: schema up to date (version {})", report.current_version);
    } else {
        for v in &report.applied {
            println!("  applied {v}");
        }
        println!("{domain}: schema at version {}", report.current_version);
    }
    Ok(())
}

fn reset(
    root: &Path,
    domain: &str,
    dir: Option<&Path>,
    confirm: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let orch = super::open(root)?;
    let confirmation = confirm.map(Confirmation::new);
    let report = runtime::block_on(|_| async move {
        orch.migrate_reset(domain, dir, confirmation).await
    })?;
    if json {
        return print_json(&report);
    }
    println!("{domain}: backup {} taken before reset", report.backup_id);
    println!(
        "{domain}: schema rebuilt at version {} ({} migrations)",
        report.migrations.current_version,
        report.migrations.applied.len()
    );
    Ok(())
}

fn status(root: &Path, domain: &str, dir: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let orch = super::open(root)?;
    let status = orch.migrate_status(domain, dir)?;
    if json {
        return print_json(&status);
    }
    println!("{domain}: schema version {}", status.current_version);
    if !status.records.is_empty() {
        let mut table = Table::new(&["VERSION", "NAME", "MODE", "APPLIED", "BACKUP"])
            .numeric(&["VERSION"]);
        for r in &status.records {
            table.row(vec![
                r.applied_version.to_string(),
                or_dash(r.name.as_deref()),
                r.mode.to_string(),
                timestamp(r.applied_at),
                or_dash(r.backup_id.as_deref()),
            ]);
        }
        table.print();
    }
    if status.outstanding.is_empty() {
        println!("No outstanding migrations.");
    } else {
        println!("Outstanding:");
        for m in &status.outstanding {
            println!("  {} {}", m.version, m.name);
        }
    }
    Ok(())
}
