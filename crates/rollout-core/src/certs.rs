//! Certificate issuance boundary.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{PathsConfig, TlsConfig};
use crate::error::{Result, RolloutError};
use crate::paths;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IssueStatus {
    Pending,
    Issued { fullchain: PathBuf },
    Failed { reason: String },
}

/// Requests and reports certificates. Validation requires the domain to
/// resolve straight to this origin.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Start issuance. Returns once the request is submitted, not issued.
    async fn request(&self, domain: &str) -> Result<()>;
    async fn status(&self, domain: &str) -> Result<IssueStatus>;
}

/// `certbot certonly --webroot`, run in the background.
///
/// The run writes its output to `certbot.log` in the site's state
/// directory and its exit code to `certbot.exit` when it finishes, so a
/// later `status` call from another process can pick up the result.
pub struct Certbot {
    root: PathBuf,
    bin: String,
    email: Option<String>,
    webroot: PathBuf,
    cert_dir: PathBuf,
}

const LOG_FILE: &str = "certbot.log";
const EXIT_FILE: &str = "certbot.exit";

impl Certbot {
    pub fn new(root: impl Into<PathBuf>, tls: &TlsConfig, paths: &PathsConfig) -> Self {
        Self {
            root: root.into(),
            bin: tls.certbot_bin.clone(),
            email: tls.email.clone(),
            webroot: paths.acme_webroot.clone(),
            cert_dir: paths.cert_dir.clone(),
        }
    }

    fn args(&self, domain: &str) -> Vec<String> {
        let mut args = vec![
            "certonly".to_string(),
            "--webroot".to_string(),
            "-w".to_string(),
            self.webroot.to_string_lossy().into_owned(),
            "-d".to_string(),
            domain.to_string(),
            "--non-interactive".to_string(),
            "--agree-tos".to_string(),
            "--keep-until-expiring".to_string(),
        ];
        match &self.email {
            Some(email) => {
                args.push("-m".to_string());
                args.push(email.clone());
            }
            None => args.push("--register-unsafely-without-email".to_string()),
        }
        args
    }

    fn state_file(&self, domain: &str, name: &str) -> PathBuf {
        paths::site_dir(&self.root, domain).join(name)
    }

    fn fullchain(&self, domain: &str) -> PathBuf {
        self.cert_dir.join(domain).join("fullchain.pem")
    }
}

#[async_trait]
impl CertificateIssuer for Certbot {
    async fn request(&self, domain: &str) -> Result<()> {
        let bin =
            which::which(&self.bin).map_err(|_| RolloutError::ToolNotInstalled(self.bin.clone()))?;
        std::fs::create_dir_all(&self.webroot)?;
        let log = self.state_file(domain, LOG_FILE);
        let exit = self.state_file(domain, EXIT_FILE);
        match std::fs::remove_file(&exit) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // Detached from this process: the CLI may exit before issuance ends.
        std::process::Command::new("sh")
            .arg("-c")
            .arg(r#""$@" >"$ROLLOUT_CERT_LOG" 2>&1; echo $? >"$ROLLOUT_CERT_EXIT""#)
            .arg("sh")
            .arg(&bin)
            .args(self.args(domain))
            .env("ROLLOUT_CERT_LOG", &log)
            .env("ROLLOUT_CERT_EXIT", &exit)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        tracing::info!(domain, log = %log.display(), "certificate requested");
        Ok(())
    }

    async fn status(&self, domain: &str) -> Result<IssueStatus> {
        let fullchain = self.fullchain(domain);
        let exit = self.state_file(domain, EXIT_FILE);
        let code = match std::fs::read_to_string(&exit) {
            Ok(s) => s.trim().parse::<i32>().ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(match code {
            Some(0) if fullchain.exists() => IssueStatus::Issued { fullchain },
            Some(0) => IssueStatus::Failed {
                reason: format!("certbot succeeded but {} is missing", fullchain.display()),
            },
            Some(code) => IssueStatus::Failed {
                reason: format!(
                    "certbot exited with {code}: {}",
                    log_tail(&self.state_file(domain, LOG_FILE))
                ),
            },
            None => IssueStatus::Pending,
        })
    }
}

/// Last few lines of the certbot log, for error messages.
fn log_tail(path: &Path) -> String {
    let Ok(data) = std::fs::read_to_string(path) else {
        return "no log".to_string();
    };
    let lines: Vec<&str> = data.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(3);
    lines[start..].join(" | ")
}
