use crate::output::{or_dash, print_json, timestamp, Table};
use clap::{Args, Subcommand};
use rollout_core::database::DatabaseTarget;
use rollout_core::registry::SiteSpec;
use rollout_core::supervisor::ProcessState;
use rollout_core::types::SiteKind;
use std::path::Path;

#[derive(Args)]
pub struct ProvisionArgs {
    domain: String,
    /// static or process
    kind: SiteKind,
    /// Local port of the backend (process sites)
    #[arg(long)]
    port: Option<u16>,
    /// Supervisor program name (default: domain with dashes)
    #[arg(long)]
    program: Option<String>,
    /// Database connection string, or env:VAR to read it at run time
    #[arg(long = "database-url", value_name = "URL")]
    database_url: Option<String>,
    /// Health endpoint path (default from config)
    #[arg(long)]
    health_path: Option<String>,
}

#[derive(Subcommand)]
pub enum SiteSubcommand {
    /// List declared sites
    List,
    /// Show one site
    Show { domain: String },
    /// Start a process site's backend
    Start { domain: String },
    /// Stop a process site's backend; the active release stays selected
    Stop { domain: String },
}

pub fn provision(root: &Path, args: ProvisionArgs, json: bool) -> anyhow::Result<()> {
    let orch = super::open(root)?;
    let mut spec = SiteSpec::new(&args.domain, args.kind);
    spec.port = args.port;
    spec.program = args.program;
    spec.database = args.database_url.map(DatabaseTarget::new);
    spec.health_path = args.health_path;

    let report = crate::runtime::block_on(|_| async move { orch.provision(spec).await })?;

    if json {
        return print_json(&report);
    }
    let verb = if report.created { "Provisioned" } else { "Updated" };
    println!("{verb} {} ({})", report.site.domain, report.site.kind);
    if report.proxy_reloaded {
        println!("  proxy config written and reloaded");
    } else {
        println!("  proxy config unchanged");
    }
    Ok(())
}

pub fn run(root: &Path, subcmd: SiteSubcommand, json: bool) -> anyhow::Result<()> {
    let orch = super::open(root)?;
    match subcmd {
        SiteSubcommand::List => {
            let sites = orch.sites()?;
            if json {
                return print_json(&sites);
            }
            if sites.is_empty() {
                println!("No sites declared.");
                return Ok(());
            }
            let mut table =
                Table::new(&["DOMAIN", "KIND", "PORT", "TLS", "RELEASE"]).numeric(&["PORT"]);
            for s in &sites {
                table.row(vec![
                    s.domain.clone(),
                    s.kind.to_string(),
                    or_dash(s.port),
                    s.tls_state.to_string(),
                    or_dash(s.current_release_id.as_deref()),
                ]);
            }
            table.print();
        }
        SiteSubcommand::Show { domain } => {
            let site = orch.site(&domain)?;
            if json {
                return print_json(&site);
            }
            println!("Domain:   {}", site.domain);
            println!("Kind:     {}", site.kind);
            println!("Port:     {}", or_dash(site.port));
            println!("Program:  {}", site.program_name());
            println!("Database: {}", if site.database.is_some() { "yes" } else { "no" });
            println!("TLS:      {}", site.tls_state);
            println!("Release:  {}", or_dash(site.current_release_id.as_deref()));
            println!("Created:  {}", timestamp(site.created_at));
        }
        SiteSubcommand::Start { domain } => {
            let state = crate::runtime::block_on(|_| async { orch.start(&domain).await })?;
            report_process(&domain, state, json)?;
        }
        SiteSubcommand::Stop { domain } => {
            let state = crate::runtime::block_on(|_| async { orch.stop(&domain).await })?;
            report_process(&domain, state, json)?;
        }
    }
    Ok(())
}

fn report_process(domain: &str, state: ProcessState, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&serde_json::json!({ "domain": domain, "process": state }));
    }
    println!("{domain}: {}", process_label(state));
    Ok(())
}

pub(crate) fn process_label(state: ProcessState) -> &'static str {
    match state {
        ProcessState::Running => "running",
        ProcessState::Starting => "starting",
        ProcessState::Stopped => "stopped",
        ProcessState::Fatal => "fatal",
        ProcessState::Unknown => "unknown",
    }
}
