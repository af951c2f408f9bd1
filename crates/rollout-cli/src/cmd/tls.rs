use crate::output::print_json;
use crate::runtime;
use clap::Subcommand;
use rollout_core::types::TlsState;
use rollout_core::Orchestrator;
use std::path::Path;
use tokio_util::sync::CancellationToken;

#[derive(Subcommand)]
pub enum TlsSubcommand {
    /// Request a certificate (DNS must be in direct mode)
    Begin { domain: String },
    /// Wait for issuance to finish and install the HTTPS server
    Poll { domain: String },
    /// Switch the DNS record to proxied mode
    Enable { domain: String },
    /// Manual recovery: direct DNS and dns_only state
    ForceUnproxy { domain: String },
    /// Begin, poll and enable in one locked sequence
    SwitchToProxied { domain: String },
    /// Show the current TLS state
    Show { domain: String },
}

pub fn run(root: &Path, subcmd: TlsSubcommand, json: bool) -> anyhow::Result<()> {
    let orch = super::open(root)?;
    let (domain, state, previous) =
        runtime::block_on(|cancel| async move { dispatch(&orch, subcmd, &cancel).await })?;

    if json {
        return print_json(&serde_json::json!({
            "domain": domain,
            "tls_state": state,
            "previous": previous,
        }));
    }
    match previous {
        Some(previous) => println!("{domain}: tls {previous} -> {state}"),
        None => println!("{domain}: tls {state}"),
    }
    Ok(())
}

/// Returns the domain, its resulting state and, for force-unproxy, the
/// state it replaced.
async fn dispatch(
    orch: &Orchestrator,
    subcmd: TlsSubcommand,
    cancel: &CancellationToken,
) -> rollout_core::Result<(String, TlsState, Option<TlsState>)> {
    Ok(match subcmd {
        TlsSubcommand::Begin { domain } => {
            let state = orch.tls_begin(&domain).await?;
            (domain, state, None)
        }
        TlsSubcommand::Poll { domain } => {
            let state = orch.tls_poll(&domain, cancel).await?;
            (domain, state, None)
        }
        TlsSubcommand::Enable { domain } => {
            let state = orch.tls_enable(&domain, cancel).await?;
            (domain, state, None)
        }
        TlsSubcommand::ForceUnproxy { domain } => {
            let previous = orch.tls_force_unproxy(&domain).await?;
            (domain, TlsState::DnsOnly, Some(previous))
        }
        TlsSubcommand::SwitchToProxied { domain } => {
            let state = orch.switch_to_proxied(&domain, cancel).await?;
            (domain, state, None)
        }
        TlsSubcommand::Show { domain } => {
            let state = orch.site(&domain)?.tls_state;
            (domain, state, None)
        }
    })
}
