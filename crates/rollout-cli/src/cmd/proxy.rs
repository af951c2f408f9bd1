use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum ProxySubcommand {
    /// Print the config `provision` would install, without applying it
    Render { domain: String },
}

pub fn run(root: &Path, subcmd: ProxySubcommand, json: bool) -> anyhow::Result<()> {
    let orch = super::open(root)?;
    match subcmd {
        ProxySubcommand::Render { domain } => {
            let text = orch.render_proxy(&domain)?;
            if json {
                crate::output::print_json(&serde_json::json!({
                    "domain": domain,
                    "config": text,
                }))?;
            } else {
                print!("{text}");
            }
        }
    }
    Ok(())
}
