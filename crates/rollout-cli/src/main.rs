mod cmd;
mod output;
mod root;
mod runtime;

use clap::{Parser, Subcommand};
use cmd::{
    backup::BackupSubcommand, config::ConfigSubcommand, migrate::MigrateSubcommand,
    proxy::ProxySubcommand, release::ReleaseSubcommand, site::SiteSubcommand,
    tls::TlsSubcommand,
};
use rollout_core::{ErrorKind, RolloutError};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "rollout",
    about = "Release orchestrator: sites, releases, TLS, migrations and backups on one host",
    version,
    propagate_version = true
)]
struct Cli {
    /// State root (default: auto-detect from .rollout/)
    #[arg(long, global = true, env = "ROLLOUT_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .rollout/ and a default config
    Init,

    /// Declare a site, create its deploy directories and install its proxy config
    Provision(cmd::site::ProvisionArgs),

    /// Inspect declared sites
    Site {
        #[command(subcommand)]
        subcommand: SiteSubcommand,
    },

    /// Ship, list and roll back releases
    Release {
        #[command(subcommand)]
        subcommand: ReleaseSubcommand,
    },

    /// Point a site back at its last known-good release
    Rollback { domain: String },

    /// Certificate issuance and edge proxy mode
    Tls {
        #[command(subcommand)]
        subcommand: TlsSubcommand,
    },

    /// Database schema migrations
    Migrate {
        #[command(subcommand)]
        subcommand: MigrateSubcommand,
    },

    /// Database backups, restore and retention
    Backup {
        #[command(subcommand)]
        subcommand: BackupSubcommand,
    },

    /// Render reverse-proxy configuration
    Proxy {
        #[command(subcommand)]
        subcommand: ProxySubcommand,
    },

    /// Validate the config
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Show a site's releases, schema version, backups, locks and recent operations
    Status { domain: String },
}

impl Commands {
    /// Commands that wait on external systems log progress by default.
    fn long_running(&self) -> bool {
        matches!(
            self,
            Commands::Release { .. }
                | Commands::Rollback { .. }
                | Commands::Tls { .. }
                | Commands::Migrate { .. }
                | Commands::Backup { .. }
        )
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.command.long_running() {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let json = cli.json;

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root, json),
        Commands::Provision(args) => cmd::site::provision(&root, args, json),
        Commands::Site { subcommand } => cmd::site::run(&root, subcommand, json),
        Commands::Release { subcommand } => cmd::release::run(&root, subcommand, json),
        Commands::Rollback { domain } => cmd::release::rollback(&root, &domain, json),
        Commands::Tls { subcommand } => cmd::tls::run(&root, subcommand, json),
        Commands::Migrate { subcommand } => cmd::migrate::run(&root, subcommand, json),
        Commands::Backup { subcommand } => cmd::backup::run(&root, subcommand, json),
        Commands::Proxy { subcommand } => cmd::proxy::run(&root, subcommand, json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, json),
        Commands::Status { domain } => cmd::status::run(&root, &domain, json),
    };

    if let Err(e) = result {
        let core = e.chain().find_map(|c| c.downcast_ref::<RolloutError>());
        if json {
            let value = match core {
                Some(err) => serde_json::json!({
                    "error": {
                        "code": err.code(),
                        "kind": err.kind(),
                        "retryable": err.kind().is_retryable(),
                        "message": format!("{e:#}"),
                    }
                }),
                None => serde_json::json!({
                    "error": {
                        "code": "error",
                        "kind": "internal",
                        "retryable": false,
                        "message": format!("{e:#}"),
                    }
                }),
            };
            println!("{value}");
        } else {
            // Print the full error chain (anyhow's alternate Display)
            eprintln!("error: {e:#}");
        }
        std::process::exit(exit_code(core.map(RolloutError::kind)));
    }
}

fn exit_code(kind: Option<ErrorKind>) -> i32 {
    match kind {
        Some(ErrorKind::Precondition) => 2,
        Some(ErrorKind::PartialFailure) => 3,
        Some(ErrorKind::Fatal) => 4,
        // EX_TEMPFAIL
        Some(ErrorKind::Retryable) => 75,
        Some(ErrorKind::Internal) | None => 1,
    }
}
