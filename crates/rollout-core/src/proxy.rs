//! Reverse-proxy virtual host generation and reload.
//!
//! `render` is a pure function of the site and configuration: the same input
//! always yields the same bytes, so `apply` can skip the write and the
//! reload when nothing changed.
//!
//! TLS and deploy commands both change what a vhost must say. Every write
//! goes through [`ProxyInstaller`], which holds the domain's `proxy` lock
//! and renders from the site as persisted at that moment.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::backoff::RetryPolicy;
use crate::config::{Config, PathsConfig, ProxyConfig};
use crate::error::{Result, RolloutError};
use crate::io;
use crate::lock::{LockGuard, LockManager, LockScope};
use crate::paths;
use crate::registry::{Registry, Site};
use crate::types::SiteKind;

/// A crashed installer frees the vhost after this long.
const PROXY_LOCK_TTL: Duration = Duration::from_secs(120);

/// Proxy writes are short, so a busy vhost is waited on rather than
/// reported as in progress.
const PROXY_LOCK_WAIT: RetryPolicy = RetryPolicy {
    initial: Duration::from_millis(20),
    max: Duration::from_millis(500),
    max_attempts: None,
    deadline: Some(Duration::from_secs(60)),
};

/// Validates and reloads the running proxy.
#[async_trait]
pub trait ProxyControl: Send + Sync {
    /// Check the configuration on disk without applying it.
    async fn test(&self) -> Result<()>;
    async fn reload(&self) -> Result<()>;
}

/// Runs the configured `test` and `reload` commands.
pub struct CommandProxyControl {
    test_command: Vec<String>,
    reload_command: Vec<String>,
}

impl CommandProxyControl {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            test_command: config.test_command.clone(),
            reload_command: config.reload_command.clone(),
        }
    }

    async fn run(command: &[String]) -> Result<std::process::Output> {
        let (bin, args) = command
            .split_first()
            .ok_or_else(|| RolloutError::Config("empty proxy command".to_string()))?;
        let path = which::which(bin).map_err(|_| RolloutError::ToolNotInstalled(bin.clone()))?;
        Ok(Command::new(path)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?)
    }
}

#[async_trait]
impl ProxyControl for CommandProxyControl {
    async fn test(&self) -> Result<()> {
        let output = Self::run(&self.test_command).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(RolloutError::external(
            "proxy",
            format!(
                "config test failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ))
    }

    async fn reload(&self) -> Result<()> {
        let output = Self::run(&self.reload_command).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(RolloutError::transient(
            "proxy",
            format!(
                "reload failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ))
    }
}

/// Where the virtual host for `domain` is written.
pub fn config_path(paths_config: &PathsConfig, domain: &str) -> PathBuf {
    paths_config.proxy_sites_dir.join(format!("{domain}.conf"))
}

/// Render the virtual host for `site`.
pub fn render(site: &Site, proxy: &ProxyConfig, paths_config: &PathsConfig) -> String {
    let mut out = String::new();
    let tls = site.tls_state.has_certificate();

    // Writes into a String cannot fail.
    let _ = writeln!(out, "# Managed by rollout for {}. Local edits are overwritten.", site.domain);
    let _ = writeln!(out, "server {{");
    let _ = writeln!(out, "    listen 80;");
    let _ = writeln!(out, "    listen [::]:80;");
    let _ = writeln!(out, "    server_name {};", site.domain);
    let _ = writeln!(out);
    write_acme(&mut out, &paths_config.acme_webroot);
    if tls {
        let _ = writeln!(out);
        let _ = writeln!(out, "    location / {{");
        let _ = writeln!(out, "        return 301 https://$host$request_uri;");
        let _ = writeln!(out, "    }}");
    } else {
        write_site_body(&mut out, site, proxy, paths_config);
    }
    let _ = writeln!(out, "}}");

    if tls {
        let cert = paths_config.cert_dir.join(&site.domain);
        let _ = writeln!(out);
        let _ = writeln!(out, "server {{");
        let _ = writeln!(out, "    listen 443 ssl;");
        let _ = writeln!(out, "    listen [::]:443 ssl;");
        let _ = writeln!(out, "    server_name {};", site.domain);
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "    ssl_certificate {};",
            cert.join("fullchain.pem").display()
        );
        let _ = writeln!(
            out,
            "    ssl_certificate_key {};",
            cert.join("privkey.pem").display()
        );
        let _ = writeln!(out, "    ssl_protocols TLSv1.2 TLSv1.3;");
        write_site_body(&mut out, site, proxy, paths_config);
        let _ = writeln!(out, "}}");
    }
    out
}

fn write_acme(out: &mut String, webroot: &Path) {
    let _ = writeln!(out, "    location ^~ /.well-known/acme-challenge/ {{");
    let _ = writeln!(out, "        root {};", webroot.display());
    let _ = writeln!(out, "        default_type \"text/plain\";");
    let _ = writeln!(out, "    }}");
}

fn write_site_body(out: &mut String, site: &Site, proxy: &ProxyConfig, paths_config: &PathsConfig) {
    let _ = writeln!(out);
    match site.kind {
        SiteKind::Static => {
            let docroot = paths::current_link(&paths_config.deploy_root, &site.domain);
            let _ = writeln!(out, "    root {};", docroot.display());
            let _ = writeln!(out, "    index index.html;");
            if !proxy.asset_extensions.is_empty() {
                let _ = writeln!(out);
                let _ = writeln!(
                    out,
                    "    location ~* \\.(?:{})$ {{",
                    proxy.asset_extensions.join("|")
                );
                let _ = writeln!(out, "        expires 1y;");
                let _ = writeln!(
                    out,
                    "        add_header Cache-Control \"public, max-age=31536000, immutable\";"
                );
                let _ = writeln!(out, "        try_files $uri =404;");
                let _ = writeln!(out, "    }}");
            }
            let _ = writeln!(out);
            let _ = writeln!(out, "    location = /index.html {{");
            let _ = writeln!(
                out,
                "        add_header Cache-Control \"no-cache, no-store, must-revalidate\";"
            );
            let _ = writeln!(out, "    }}");
            let _ = writeln!(out);
            let _ = writeln!(out, "    location / {{");
            let _ = writeln!(out, "        try_files $uri $uri/ /index.html;");
            let _ = writeln!(out, "    }}");
        }
        SiteKind::Process => {
            let port = site.port.unwrap_or_default();
            let _ = writeln!(out, "    client_max_body_size {};", proxy.client_max_body_size);
            let _ = writeln!(out);
            let _ = writeln!(out, "    location / {{");
            let _ = writeln!(out, "        proxy_pass http://127.0.0.1:{port};");
            let _ = writeln!(out, "        proxy_http_version 1.1;");
            let _ = writeln!(out, "        proxy_set_header Upgrade $http_upgrade;");
            let _ = writeln!(out, "        proxy_set_header Connection \"upgrade\";");
            let _ = writeln!(out, "        proxy_set_header Host $host;");
            let _ = writeln!(out, "        proxy_set_header X-Real-IP $remote_addr;");
            let _ = writeln!(
                out,
                "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"
            );
            let _ = writeln!(out, "        proxy_set_header X-Forwarded-Proto $scheme;");
            let _ = writeln!(
                out,
                "        proxy_connect_timeout {}s;",
                proxy.connect_timeout_secs
            );
            let _ = writeln!(out, "        proxy_send_timeout {}s;", proxy.send_timeout_secs);
            let _ = writeln!(out, "        proxy_read_timeout {}s;", proxy.read_timeout_secs);
            let _ = writeln!(out, "    }}");
        }
    }
}

/// Single writer of the vhost files.
#[derive(Clone)]
pub struct ProxyInstaller {
    registry: Registry,
    locks: LockManager,
    proxy: ProxyConfig,
    paths: PathsConfig,
    control: Arc<dyn ProxyControl>,
}

impl ProxyInstaller {
    pub fn new(
        root: &Path,
        registry: Registry,
        config: &Config,
        control: Arc<dyn ProxyControl>,
    ) -> Self {
        Self {
            registry,
            locks: LockManager::new(root, PROXY_LOCK_TTL),
            proxy: config.proxy.clone(),
            paths: config.paths.clone(),
            control,
        }
    }

    /// Render `domain` from its current record and install it. Returns true
    /// when the proxy was reloaded.
    pub async fn install(&self, domain: &str) -> Result<bool> {
        let lock = self.acquire(domain).await?;
        let site = self.registry.get(domain)?;
        apply(&lock, &site, &self.proxy, &self.paths, self.control.as_ref()).await
    }

    async fn acquire(&self, domain: &str) -> Result<LockGuard> {
        let mut schedule = PROXY_LOCK_WAIT.schedule();
        loop {
            match self.locks.acquire(domain, LockScope::Proxy, "proxy install") {
                Err(e @ RolloutError::AlreadyInProgress { .. }) => match schedule.next_delay() {
                    Some(delay) => {
                        tracing::debug!(domain, "proxy vhost busy, waiting");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                other => return other,
            }
        }
    }
}

/// Write the rendered config and reload the proxy if the bytes changed.
///
/// A config that fails `test` is reverted to the previous file before the
/// error is returned, so the proxy never loads a broken vhost.
pub async fn apply(
    lock: &LockGuard,
    site: &Site,
    proxy: &ProxyConfig,
    paths_config: &PathsConfig,
    control: &dyn ProxyControl,
) -> Result<bool> {
    lock.ensure(&site.domain, LockScope::Proxy)?;
    let text = render(site, proxy, paths_config);
    let path = config_path(paths_config, &site.domain);
    let previous = match std::fs::read(&path) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    if !io::write_if_changed(&path, text.as_bytes())? {
        tracing::debug!(domain = %site.domain, "proxy config unchanged");
        return Ok(false);
    }
    if let Err(e) = control.test().await {
        tracing::warn!(domain = %site.domain, "proxy config rejected, reverting");
        match previous {
            Some(bytes) => io::atomic_write(&path, &bytes)?,
            None => std::fs::remove_file(&path)?,
        }
        return Err(e);
    }
    control.reload().await?;
    tracing::info!(domain = %site.domain, path = %path.display(), "proxy config applied");
    Ok(true)
}
