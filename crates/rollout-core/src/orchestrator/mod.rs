//! Orchestrator Core: top-level commands sequencing the components.
//!
//! Each command takes the domain lock for its scope, records itself in the
//! scope's journal, runs, and finalizes the journal entry on every exit
//! path. Commands on different domains share nothing and run in parallel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backup::{BackupManager, BackupRecord};
use crate::certs::{Certbot, CertificateIssuer};
use crate::config::Config;
use crate::confirm::Confirmation;
use crate::database::{DatabaseEngine, Postgres};
use crate::dns::{CloudflareDns, DnsProvider};
use crate::error::{Result, RolloutError};
use crate::health::{HealthProbe, HttpProbe};
use crate::io;
use crate::journal::{Journal, Operation};
use crate::lock::{LockGuard, LockInfo, LockManager, LockScope};
use crate::migration::{Migration, MigrationRecord, MigrationReport, MigrationRunner, ResetReport};
use crate::paths;
use crate::pipeline::{ReleaseOutcome, ReleasePipeline, RollbackOutcome};
use crate::proxy::{self, CommandProxyControl, ProxyControl, ProxyInstaller};
use crate::registry::{Registry, Site, SiteSpec};
use crate::release::ReleaseLedger;
use crate::supervisor::{ProcessState, Supervisor, SupervisorCtl};
use crate::tls::TlsCoordinator;
use crate::types::{SiteKind, TlsState};


/// Journal entries shown by `status`.
const STATUS_JOURNAL_TAIL: usize = 10;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// The external systems the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub dns: Arc<dyn DnsProvider>,
    pub issuer: Arc<dyn CertificateIssuer>,
    pub supervisor: Arc<dyn Supervisor>,
    pub database: Arc<dyn DatabaseEngine>,
    pub probe: Arc<dyn HealthProbe>,
    pub proxy: Arc<dyn ProxyControl>,
}

impl Collaborators {
    /// Cloudflare, certbot, supervisorctl, PostgreSQL, HTTP and nginx.
    pub fn production(root: &Path, config: &Config) -> Result<Self> {
        Ok(Self {
            dns: Arc::new(CloudflareDns::new(&config.dns)),
            issuer: Arc::new(Certbot::new(root, &config.tls, &config.paths)),
            supervisor: Arc::new(SupervisorCtl::new(config.supervisor.ctl_bin.clone())),
            database: Arc::new(Postgres::new(config.database.clone())),
            probe: Arc::new(HttpProbe::new(Duration::from_secs(
                config.health.request_timeout_secs,
            ))?),
            proxy: Arc::new(CommandProxyControl::new(&config.proxy)),
        })
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub site: Site,
    pub created: bool,
    pub proxy_reloaded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub domain: String,
    pub current_version: u64,
    pub records: Vec<MigrationRecord>,
    pub outstanding: Vec<Migration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupRun {
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedDomain {
    pub domain: String,
    pub operation: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub removed: Vec<BackupRecord>,
    /// Domains whose deploy lock was held, e.g. by a restore.
    pub skipped: Vec<SkippedDomain>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeldLock {
    pub scope: LockScope,
    #[serde(flatten)]
    pub info: LockInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub site: Site,
    /// Supervisor run state; absent for static sites.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessState>,
    pub releases: ReleaseLedger,
    pub schema_version: u64,
    pub backups: usize,
    pub locks: Vec<HeldLock>,
    pub recent_operations: Vec<Operation>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Orchestrator {
    root: PathBuf,
    config: Config,
    registry: Registry,
    locks: LockManager,
    journal: Journal,
    tls: TlsCoordinator,
    migrations: MigrationRunner,
    backups: BackupManager,
    pipeline: ReleasePipeline,
    proxy: ProxyInstaller,
    supervisor: Arc<dyn Supervisor>,
}

impl Orchestrator {
    pub fn new(root: impl Into<PathBuf>, config: Config, collaborators: Collaborators) -> Self {
        let root = root.into();
        let registry = Registry::new(&root);
        let migrations = MigrationRunner::new(&root, collaborators.database.clone());
        let backups = BackupManager::new(
            &root,
            &config.paths.backup_root,
            &config.backup,
            collaborators.database.clone(),
        );
        let tls = TlsCoordinator::new(
            registry.clone(),
            collaborators.dns.clone(),
            collaborators.issuer.clone(),
            config.tls.issue_poll.policy(),
            config.tls.propagation_poll.policy(),
        );
        let proxy = ProxyInstaller::new(&root, registry.clone(), &config, collaborators.proxy);
        let pipeline = ReleasePipeline::new(
            registry.clone(),
            migrations.clone(),
            collaborators.supervisor.clone(),
            collaborators.probe.clone(),
            proxy.clone(),
            config.clone(),
        );
        Self {
            locks: LockManager::new(&root, config.lock_ttl()),
            journal: Journal::new(&root),
            root,
            config,
            registry,
            tls,
            migrations,
            backups,
            pipeline,
            proxy,
            supervisor: collaborators.supervisor,
        }
    }

    /// Load the config under `root` and wire the production collaborators.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let config = Config::load(&root)?;
        let collaborators = Collaborators::production(&root, &config)?;
        Ok(Self::new(root, config, collaborators))
    }

    /// Scaffold `.rollout/` and a default config. Idempotent; returns true
    /// when the config file was created.
    pub fn init(root: &Path) -> Result<bool> {
        io::ensure_dir(&paths::sites_dir(root))?;
        io::ensure_dir(&root.join(paths::LOCKS_DIR))?;
        let yaml = serde_yaml::to_string(&Config::default())?;
        io::write_if_missing(&paths::config_path(root), yaml.as_bytes())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Lock + journal plumbing
    // -----------------------------------------------------------------------

    fn begin(
        &self,
        domain: &str,
        scope: LockScope,
        operation: &str,
        target: Option<&str>,
    ) -> Result<(LockGuard, Uuid)> {
        let lock = self.locks.acquire_for(domain, scope, operation, target)?;
        self.journal.recover(&lock)?;
        let id = self.journal.begin(&lock, target)?;
        Ok((lock, id))
    }

    fn conclude<T>(&self, lock: &LockGuard, id: Uuid, result: Result<T>) -> Result<T> {
        if let Err(e) = self.journal.finish(lock, id, &result) {
            tracing::warn!(domain = lock.domain(), "failed to finalize journal entry: {e}");
        }
        result
    }

    // -----------------------------------------------------------------------
    // Sites
    // -----------------------------------------------------------------------

    /// Declare a site, create its deploy directories and install its proxy
    /// config.
    pub async fn provision(&self, spec: SiteSpec) -> Result<ProvisionReport> {
        let domain = spec.domain.clone();
        paths::validate_domain(&domain)?;
        let (lock, id) = self.begin(&domain, LockScope::Deploy, "provision", None)?;
        let result = async {
            let (site, created) = self.registry.declare(&lock, spec)?;
            io::ensure_dir(
                &paths::deploy_dir(&self.config.paths.deploy_root, &domain).join("releases"),
            )?;
            let proxy_reloaded = self.proxy.install(&domain).await?;
            Ok(ProvisionReport {
                site,
                created,
                proxy_reloaded,
            })
        }
        .await;
        self.conclude(&lock, id, result)
    }

    pub fn sites(&self) -> Result<Vec<Site>> {
        self.registry.list()
    }

    pub fn site(&self, domain: &str) -> Result<Site> {
        self.registry.get(domain)
    }

    /// The proxy config `provision` would install, without applying it.
    pub fn render_proxy(&self, domain: &str) -> Result<String> {
        let site = self.registry.get(domain)?;
        Ok(proxy::render(&site, &self.config.proxy, &self.config.paths))
    }

    // -----------------------------------------------------------------------
    // Releases
    // -----------------------------------------------------------------------

    pub async fn release(
        &self,
        domain: &str,
        artifact: &Path,
        cancel: &CancellationToken,
    ) -> Result<ReleaseOutcome> {
        let target = artifact.to_string_lossy();
        let (lock, id) = self.begin(domain, LockScope::Deploy, "release", Some(&target))?;
        let result = self.pipeline.release(&lock, domain, artifact, cancel).await;
        self.conclude(&lock, id, result)
    }

    pub async fn rollback(&self, domain: &str, cancel: &CancellationToken) -> Result<RollbackOutcome> {
        let (lock, id) = self.begin(domain, LockScope::Deploy, "rollback", None)?;
        let result = self.pipeline.rollback(&lock, domain, cancel).await;
        self.conclude(&lock, id, result)
    }

    pub fn releases(&self, domain: &str) -> Result<ReleaseLedger> {
        self.registry.get(domain)?;
        self.registry.releases(domain)
    }

    /// Start a process site's backend and report its run state.
    pub async fn start(&self, domain: &str) -> Result<ProcessState> {
        let (lock, id) = self.begin(domain, LockScope::Deploy, "start", None)?;
        let result = async {
            let program = self.program(domain)?;
            self.supervisor.start(&program).await?;
            self.supervisor.status(&program).await
        }
        .await;
        self.conclude(&lock, id, result)
    }

    /// Stop a process site's backend. Releases and state are untouched.
    pub async fn stop(&self, domain: &str) -> Result<ProcessState> {
        let (lock, id) = self.begin(domain, LockScope::Deploy, "stop", None)?;
        let result = async {
            let program = self.program(domain)?;
            tracing::warn!(domain, %program, "stopping backend");
            self.supervisor.stop(&program).await?;
            self.supervisor.status(&program).await
        }
        .await;
        self.conclude(&lock, id, result)
    }

    fn program(&self, domain: &str) -> Result<String> {
        let site = self.registry.get(domain)?;
        if site.kind != SiteKind::Process {
            return Err(RolloutError::NotAProcess(domain.to_string()));
        }
        Ok(site.program_name())
    }

    // -----------------------------------------------------------------------
    // TLS
    // -----------------------------------------------------------------------

    pub async fn tls_begin(&self, domain: &str) -> Result<TlsState> {
        let (lock, id) = self.begin(domain, LockScope::Tls, "tls begin", None)?;
        let result = self.tls.begin_issue(&lock, domain).await;
        self.conclude(&lock, id, result)
    }

    /// Poll issuance; once verified, the proxy config gains its HTTPS server.
    pub async fn tls_poll(&self, domain: &str, cancel: &CancellationToken) -> Result<TlsState> {
        let (lock, id) = self.begin(domain, LockScope::Tls, "tls poll", None)?;
        let result = async {
            let state = self.tls.poll_issue(&lock, domain, cancel).await?;
            self.proxy.install(domain).await?;
            Ok(state)
        }
        .await;
        self.conclude(&lock, id, result)
    }

    pub async fn tls_enable(&self, domain: &str, cancel: &CancellationToken) -> Result<TlsState> {
        let (lock, id) = self.begin(domain, LockScope::Tls, "tls enable", None)?;
        let result = self.tls.enable_proxy(&lock, domain, cancel).await;
        self.conclude(&lock, id, result)
    }

    /// Manual recovery. Returns the state that was replaced.
    pub async fn tls_force_unproxy(&self, domain: &str) -> Result<TlsState> {
        let (lock, id) = self.begin(domain, LockScope::Tls, "tls force-unproxy", None)?;
        let result = async {
            let previous = self.tls.force_unproxy(&lock, domain).await?;
            self.proxy.install(domain).await?;
            Ok(previous)
        }
        .await;
        self.conclude(&lock, id, result)
    }

    /// Drive a site from wherever it is to `proxied` under one lock:
    /// begin issuance, wait for it, install HTTPS, flip the DNS record.
    pub async fn switch_to_proxied(
        &self,
        domain: &str,
        cancel: &CancellationToken,
    ) -> Result<TlsState> {
        let (lock, id) = self.begin(domain, LockScope::Tls, "switch-to-proxied", None)?;
        let result = async {
            let mut state = self.registry.tls_state(domain)?;
            if state == TlsState::DnsOnly {
                state = self.tls.begin_issue(&lock, domain).await?;
            }
            if state == TlsState::Issuing {
                self.tls.poll_issue(&lock, domain, cancel).await?;
            }
            self.proxy.install(domain).await?;
            self.tls.enable_proxy(&lock, domain, cancel).await
        }
        .await;
        self.conclude(&lock, id, result)
    }

    // -----------------------------------------------------------------------
    // Migrations
    // -----------------------------------------------------------------------

    /// Scripts of the release `current` points at.
    fn default_migrations_dir(&self, domain: &str) -> PathBuf {
        paths::current_link(&self.config.paths.deploy_root, domain).join("migrations")
    }

    pub async fn migrate_apply(&self, domain: &str, source: Option<&Path>) -> Result<MigrationReport> {
        let source = source
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_migrations_dir(domain));
        let (lock, id) = self.begin(domain, LockScope::Deploy, "migrate apply", None)?;
        let result = async {
            let site = self.registry.get(domain)?;
            self.migrations.apply_incremental(&lock, &site, &source).await
        }
        .await;
        self.conclude(&lock, id, result)
    }

    pub async fn migrate_reset(
        &self,
        domain: &str,
        source: Option<&Path>,
        confirmation: Option<Confirmation>,
    ) -> Result<ResetReport> {
        let source = source
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_migrations_dir(domain));
        let (lock, id) = self.begin(domain, LockScope::Deploy, "migrate reset", None)?;
        let result = async {
            let site = self.registry.get(domain)?;
            self.migrations
                .destructive_reset(&lock, &site, &source, confirmation, &self.backups)
                .await
        }
        .await;
        self.conclude(&lock, id, result)
    }

    pub fn migrate_status(&self, domain: &str, source: Option<&Path>) -> Result<MigrationStatus> {
        let site = self.registry.get(domain)?;
        let source = source
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_migrations_dir(domain));
        let ledger = self.migrations.ledger(domain)?;
        Ok(MigrationStatus {
            domain: domain.to_string(),
            current_version: ledger.current_version(),
            outstanding: self.migrations.outstanding(&site, &source)?,
            records: ledger.records,
        })
    }

    // -----------------------------------------------------------------------
    // Backups
    // -----------------------------------------------------------------------

    pub async fn backup(&self, domain: &str) -> Result<BackupRecord> {
        let (lock, id) = self.begin(domain, LockScope::Deploy, "backup", None)?;
        let result = async {
            let site = self.registry.get(domain)?;
            self.backups.backup(&lock, &site).await
        }
        .await;
        self.conclude(&lock, id, result)
    }

    /// Back up every site with a database. One failing site does not stop
    /// the others; each outcome is reported.
    pub async fn backup_all(&self) -> Result<Vec<BackupRun>> {
        let mut runs = Vec::new();
        for site in self.registry.list()? {
            if site.database.is_none() {
                continue;
            }
            let run = match self.backup(&site.domain).await {
                Ok(record) => BackupRun {
                    domain: site.domain,
                    backup: Some(record),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(domain = %site.domain, "backup failed: {e}");
                    BackupRun {
                        domain: site.domain,
                        backup: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            runs.push(run);
        }
        Ok(runs)
    }

    pub fn backups(&self, domain: &str) -> Result<Vec<BackupRecord>> {
        self.registry.get(domain)?;
        self.backups.list(domain)
    }

    pub async fn restore(
        &self,
        domain: &str,
        backup_id: &str,
        confirmation: Option<Confirmation>,
    ) -> Result<MigrationRecord> {
        let (lock, id) = self.begin(domain, LockScope::Deploy, "restore", Some(backup_id))?;
        let result = async {
            let site = self.registry.get(domain)?;
            self.backups
                .restore(&lock, &site, backup_id, confirmation)
                .await
        }
        .await;
        self.conclude(&lock, id, result)
    }

    /// Remove expired backups across all sites. Sites whose deploy lock is
    /// held are skipped, so a backup being restored is never removed.
    pub fn prune(&self) -> Result<PruneReport> {
        let mut report = PruneReport::default();
        let now = Utc::now();
        for site in self.registry.list()? {
            let (lock, id) = match self.begin(&site.domain, LockScope::Deploy, "prune", None) {
                Ok(acquired) => acquired,
                Err(RolloutError::AlreadyInProgress { operation, .. }) => {
                    tracing::info!(domain = %site.domain, %operation, "skipping prune, domain busy");
                    report.skipped.push(SkippedDomain {
                        domain: site.domain,
                        operation,
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };
            let result = self.backups.prune(&lock, &site.domain, now);
            report.removed.extend(self.conclude(&lock, id, result)?);
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub async fn status(&self, domain: &str) -> Result<StatusReport> {
        let site = self.registry.get(domain)?;
        let process = match site.kind {
            SiteKind::Static => None,
            SiteKind::Process => {
                let state = self
                    .supervisor
                    .status(&site.program_name())
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!(domain, "supervisor status unavailable: {e}");
                        ProcessState::Unknown
                    });
                Some(state)
            }
        };
        let mut locks = Vec::new();
        let mut recent_operations = Vec::new();
        for scope in [LockScope::Tls, LockScope::Deploy, LockScope::Proxy] {
            if let Some(info) = self.locks.holder(domain, scope)? {
                locks.push(HeldLock { scope, info });
            }
        }
        for scope in [LockScope::Tls, LockScope::Deploy] {
            recent_operations.extend(self.journal.list(domain, scope)?);
        }
        recent_operations.sort_by_key(|op| op.started_at);
        let skip = recent_operations.len().saturating_sub(STATUS_JOURNAL_TAIL);
        recent_operations.drain(..skip);

        Ok(StatusReport {
            releases: self.registry.releases(domain)?,
            schema_version: self.migrations.ledger(domain)?.current_version(),
            backups: self.backups.list(domain)?.len(),
            locks,
            recent_operations,
            process,
            site,
        })
    }
}
