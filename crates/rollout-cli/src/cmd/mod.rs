pub mod backup;
pub mod config;
pub mod init;
pub mod migrate;
pub mod proxy;
pub mod release;
pub mod site;
pub mod status;
pub mod tls;

use rollout_core::Orchestrator;
use std::path::Path;

/// Load the config and wire the production collaborators.
pub fn open(root: &Path) -> anyhow::Result<Orchestrator> {
    Ok(Orchestrator::open(root)?)
}
