use crate::backoff::RetryPolicy;
use crate::error::{Result, RolloutError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// PathsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Parent of every site's `releases/` and `current` link.
    #[serde(default = "default_deploy_root")]
    pub deploy_root: PathBuf,
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,
    /// Directory the reverse proxy includes virtual hosts from.
    #[serde(default = "default_proxy_sites_dir")]
    pub proxy_sites_dir: PathBuf,
    /// Webroot answering HTTP-01 challenges.
    #[serde(default = "default_acme_webroot")]
    pub acme_webroot: PathBuf,
    /// Parent of `<domain>/fullchain.pem` and `<domain>/privkey.pem`.
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
}

fn default_deploy_root() -> PathBuf {
    PathBuf::from("/var/www")
}

fn default_backup_root() -> PathBuf {
    PathBuf::from("/var/backups/rollout")
}

fn default_proxy_sites_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/conf.d")
}

fn default_acme_webroot() -> PathBuf {
    PathBuf::from("/var/www/_acme")
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("/etc/letsencrypt/live")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            deploy_root: default_deploy_root(),
            backup_root: default_backup_root(),
            proxy_sites_dir: default_proxy_sites_dir(),
            acme_webroot: default_acme_webroot(),
            cert_dir: default_cert_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProxyConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_proxy_timeout")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_proxy_timeout")]
    pub connect_timeout_secs: u64,
    /// Request bodies above this size are answered with 413 by the proxy.
    #[serde(default = "default_body_size")]
    pub client_max_body_size: String,
    /// Extensions of content-hashed assets that may be cached forever.
    #[serde(default = "default_asset_extensions")]
    pub asset_extensions: Vec<String>,
    #[serde(default = "default_test_command")]
    pub test_command: Vec<String>,
    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,
}

fn default_proxy_timeout() -> u64 {
    900
}

fn default_body_size() -> String {
    "50m".to_string()
}

fn default_asset_extensions() -> Vec<String> {
    ["js", "css", "woff", "woff2", "ttf", "svg", "png", "jpg", "jpeg", "gif", "webp", "ico"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_test_command() -> Vec<String> {
    vec!["nginx".to_string(), "-t".to_string()]
}

fn default_reload_command() -> Vec<String> {
    vec!["nginx".to_string(), "-s".to_string(), "reload".to_string()]
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_proxy_timeout(),
            send_timeout_secs: default_proxy_timeout(),
            connect_timeout_secs: default_proxy_timeout(),
            client_max_body_size: default_body_size(),
            asset_extensions: default_asset_extensions(),
            test_command: default_test_command(),
            reload_command: default_reload_command(),
        }
    }
}

// ---------------------------------------------------------------------------
// BackoffConfig
// ---------------------------------------------------------------------------

/// Serialized form of a [`RetryPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

impl BackoffConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(self.initial_ms),
            max: Duration::from_millis(self.max_ms),
            max_attempts: self.max_attempts,
            deadline: self.deadline_secs.map(Duration::from_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// TlsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_issue_poll")]
    pub issue_poll: BackoffConfig,
    #[serde(default = "default_propagation_poll")]
    pub propagation_poll: BackoffConfig,
    #[serde(default = "default_certbot_bin")]
    pub certbot_bin: String,
    #[serde(default)]
    pub email: Option<String>,
}

fn default_issue_poll() -> BackoffConfig {
    BackoffConfig {
        initial_ms: 2_000,
        max_ms: 30_000,
        max_attempts: None,
        deadline_secs: Some(600),
    }
}

fn default_propagation_poll() -> BackoffConfig {
    BackoffConfig {
        initial_ms: 1_000,
        max_ms: 15_000,
        max_attempts: None,
        deadline_secs: Some(300),
    }
}

fn default_certbot_bin() -> String {
    "certbot".to_string()
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            issue_poll: default_issue_poll(),
            propagation_poll: default_propagation_poll(),
            certbot_bin: default_certbot_bin(),
            email: None,
        }
    }
}

// ---------------------------------------------------------------------------
// DnsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_dns_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub zone_id: Option<String>,
    /// Environment variable holding the API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_dns_api_base() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

fn default_token_env() -> String {
    "CLOUDFLARE_API_TOKEN".to_string()
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            api_base: default_dns_api_base(),
            zone_id: None,
            token_env: default_token_env(),
        }
    }
}

// ---------------------------------------------------------------------------
// HealthConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_health_poll")]
    pub poll: BackoffConfig,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Where static sites are fetched from; the Host header selects the site.
    #[serde(default = "default_static_base_url")]
    pub static_base_url: String,
    /// The local HTTPS listener checked once a static site has a certificate.
    #[serde(default = "default_static_tls_addr")]
    pub static_tls_addr: SocketAddr,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_poll() -> BackoffConfig {
    BackoffConfig {
        initial_ms: 500,
        max_ms: 5_000,
        max_attempts: Some(10),
        deadline_secs: None,
    }
}

fn default_request_timeout() -> u64 {
    5
}

fn default_static_base_url() -> String {
    "http://127.0.0.1".to_string()
}

fn default_static_tls_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 443))
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            poll: default_health_poll(),
            request_timeout_secs: default_request_timeout(),
            static_base_url: default_static_base_url(),
            static_tls_addr: default_static_tls_addr(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tool configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_supervisorctl")]
    pub ctl_bin: String,
}

fn default_supervisorctl() -> String {
    "supervisorctl".to_string()
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ctl_bin: default_supervisorctl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_psql")]
    pub psql_bin: String,
    #[serde(default = "default_pg_dump")]
    pub pg_dump_bin: String,
    #[serde(default = "default_pg_restore")]
    pub pg_restore_bin: String,
}

fn default_psql() -> String {
    "psql".to_string()
}

fn default_pg_dump() -> String {
    "pg_dump".to_string()
}

fn default_pg_restore() -> String {
    "pg_restore".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            psql_bin: default_psql(),
            pg_dump_bin: default_pg_dump(),
            pg_restore_bin: default_pg_restore(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    14
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocksConfig {
    #[serde(default = "default_lock_ttl")]
    pub ttl_secs: u64,
}

fn default_lock_ttl() -> u64 {
    3_600
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub locks: LocksConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            paths: PathsConfig::default(),
            proxy: ProxyConfig::default(),
            tls: TlsConfig::default(),
            dns: DnsConfig::default(),
            health: HealthConfig::default(),
            supervisor: SupervisorConfig::default(),
            database: DatabaseConfig::default(),
            backup: BackupConfig::default(),
            locks: LocksConfig::default(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(RolloutError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let config: Config = serde_yaml::from_str(&data)?;
        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        crate::io::write_yaml(&paths::config_path(root), self)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.locks.ttl_secs)
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut push = |level: WarnLevel, message: String| {
            warnings.push(ConfigWarning { level, message })
        };

        if self.dns.zone_id.is_none() {
            push(
                WarnLevel::Warning,
                "dns.zone_id is not set; TLS proxy transitions will fail".to_string(),
            );
        }
        if self.tls.email.is_none() {
            push(
                WarnLevel::Warning,
                "tls.email is not set; certbot will register without a contact".to_string(),
            );
        }
        for (name, poll) in [
            ("tls.issue_poll", &self.tls.issue_poll),
            ("tls.propagation_poll", &self.tls.propagation_poll),
            ("health.poll", &self.health.poll),
        ] {
            if poll.initial_ms == 0 {
                push(WarnLevel::Error, format!("{name}.initial_ms must be > 0"));
            }
            if poll.max_ms < poll.initial_ms {
                push(
                    WarnLevel::Error,
                    format!("{name}.max_ms is smaller than initial_ms"),
                );
            }
            if poll.max_attempts.is_none() && poll.deadline_secs.is_none() {
                push(
                    WarnLevel::Error,
                    format!("{name} needs max_attempts or deadline_secs to stay bounded"),
                );
            }
            if poll.max_attempts == Some(0) {
                push(WarnLevel::Error, format!("{name}.max_attempts must be > 0"));
            }
        }
        if self.proxy.read_timeout_secs == 0 || self.proxy.send_timeout_secs == 0 {
            push(
                WarnLevel::Error,
                "proxy timeouts must be greater than zero".to_string(),
            );
        }
        if !self.health.path.starts_with('/') {
            push(
                WarnLevel::Error,
                format!("health.path '{}' must start with '/'", self.health.path),
            );
        }
        if self.backup.retention_days == 0 {
            push(
                WarnLevel::Warning,
                "backup.retention_days is 0; every prune removes all backups".to_string(),
            );
        }
        if self.proxy.test_command.is_empty() || self.proxy.reload_command.is_empty() {
            push(
                WarnLevel::Error,
                "proxy.test_command and proxy.reload_command must not be empty".to_string(),
            );
        }
        warnings
    }
}
