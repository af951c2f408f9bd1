//! Release Pipeline: stage, migrate, swap, health-gate, roll back.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::artifact;
use crate::config::Config;
use crate::error::{FailureStage, Result, RolloutError};
use crate::health::{self, HealthCheckResult, HealthProbe, HealthTarget};
use crate::lock::{LockGuard, LockScope};
use crate::migration::{MigrationReport, MigrationRunner};
use crate::paths;
use crate::proxy::ProxyInstaller;
use crate::registry::{Registry, Site};
use crate::release::Release;
use crate::supervisor::Supervisor;
use crate::types::{ReleaseStatus, SiteKind};

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseOutcome {
    pub release: Release,
    /// False when the artifact was already the active release.
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migrations: Option<MigrationReport>,
    pub proxy_reloaded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub from: Option<String>,
    pub to: Release,
}

#[derive(Clone)]
pub struct ReleasePipeline {
    registry: Registry,
    migrations: MigrationRunner,
    supervisor: Arc<dyn Supervisor>,
    probe: Arc<dyn HealthProbe>,
    proxy: ProxyInstaller,
    config: Config,
}

impl ReleasePipeline {
    pub fn new(
        registry: Registry,
        migrations: MigrationRunner,
        supervisor: Arc<dyn Supervisor>,
        probe: Arc<dyn HealthProbe>,
        proxy: ProxyInstaller,
        config: Config,
    ) -> Self {
        Self {
            registry,
            migrations,
            supervisor,
            probe,
            proxy,
            config,
        }
    }

    /// Where the health gate checks `site`.
    ///
    /// Once a static site has a certificate its port 80 server only
    /// redirects, so the entry document is fetched from the local HTTPS
    /// listener under the site's own name.
    pub fn health_target(&self, site: &Site) -> HealthTarget {
        match site.kind {
            SiteKind::Process => HealthTarget {
                url: format!(
                    "http://127.0.0.1:{}{}",
                    site.port.unwrap_or_default(),
                    site.health_path.as_deref().unwrap_or(&self.config.health.path)
                ),
                host: None,
                connect_to: None,
            },
            SiteKind::Static if site.tls_state.has_certificate() => HealthTarget {
                url: format!("https://{}/", site.domain),
                host: None,
                connect_to: Some(self.config.health.static_tls_addr),
            },
            SiteKind::Static => HealthTarget {
                url: format!(
                    "{}/",
                    self.config.health.static_base_url.trim_end_matches('/')
                ),
                host: Some(site.domain.clone()),
                connect_to: None,
            },
        }
    }

    /// Release `artifact` to the site.
    ///
    /// Failure before the swap marks the new release rolled back and leaves
    /// the running release untouched. Failure after the swap rolls back to
    /// the previously active release automatically.
    pub async fn release(
        &self,
        lock: &LockGuard,
        domain: &str,
        artifact_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<ReleaseOutcome> {
        lock.ensure(domain, LockScope::Deploy)?;
        let site = self.registry.get(domain)?;
        artifact::validate(site.kind, artifact_path)?;
        let digest = artifact::digest(artifact_path)?;

        let before = self.registry.releases(domain)?;
        if let Some(existing) = before.by_digest(&digest) {
            if existing.status == ReleaseStatus::Active
                && before.current.as_deref() == Some(existing.id.as_str())
            {
                tracing::info!(domain, release = %existing.id, "artifact already active");
                return Ok(ReleaseOutcome {
                    release: existing.clone(),
                    changed: false,
                    migrations: None,
                    proxy_reloaded: false,
                });
            }
        }

        let (release, created) = self.registry.stage_release(lock, domain, &digest)?;
        tracing::info!(domain, release = %release.id, created, "release staged");
        let deploy_root = &self.config.paths.deploy_root;
        if let Err(e) = artifact::stage(artifact_path, deploy_root, domain, &release.id) {
            return Err(self.abort(lock, &release, FailureStage::Stage, e)?);
        }

        let mut migrations = None;
        if site.kind == SiteKind::Process && site.database.is_some() {
            let source = paths::release_dir(deploy_root, domain, &release.id).join("migrations");
            match self.migrations.apply_incremental(lock, &site, &source).await {
                Ok(report) => migrations = Some(report),
                Err(e) => return Err(self.abort(lock, &release, FailureStage::Migration, e)?),
            }
        }

        // Rendered from the persisted site: TLS work may have moved on
        // while migrations ran.
        let proxy_reloaded = match self.proxy.install(domain).await {
            Ok(reloaded) => reloaded,
            Err(e) => return Err(self.abort(lock, &release, FailureStage::Swap, e)?),
        };
        let site = match self.registry.get(domain) {
            Ok(site) => site,
            Err(e) => return Err(self.abort(lock, &release, FailureStage::Swap, e)?),
        };

        // From here on the new release may be serving traffic.
        let fallback = before.active().filter(|r| r.id != release.id).cloned();
        if let Err(e) = self.switch_to(lock, &site, &release.id).await {
            return Err(self
                .compensate(lock, &site, &release, fallback, FailureStage::Swap, e.to_string(), None, cancel)
                .await);
        }

        let target = self.health_target(&site);
        let health = match health::wait_healthy(
            self.probe.as_ref(),
            &target,
            self.config.health.poll.policy(),
            cancel,
        )
        .await
        {
            Ok(result) => result,
            Err(e) => {
                let failed = self
                    .compensate(lock, &site, &release, fallback, FailureStage::HealthCheck, e.to_string(), None, cancel)
                    .await;
                // A cancelled gate reports `Cancelled` once the swap is undone.
                return Err(match (failed, e) {
                    (RolloutError::ReleaseFailed { .. }, RolloutError::Cancelled) => {
                        RolloutError::Cancelled
                    }
                    (failed, _) => failed,
                });
            }
        };
        if !health.passed {
            let cause = health
                .detail
                .clone()
                .unwrap_or_else(|| "health check failed".to_string());
            return Err(self
                .compensate(lock, &site, &release, fallback, FailureStage::HealthCheck, cause, Some(health), cancel)
                .await);
        }

        self.registry.promote(lock, domain, &release.id, health)?;
        tracing::info!(domain, release = %release.id, "release active");
        Ok(ReleaseOutcome {
            release: self.registry.release(domain, &release.id)?,
            changed: true,
            migrations,
            proxy_reloaded,
        })
    }

    /// Point the site back at the last known-good release.
    pub async fn rollback(
        &self,
        lock: &LockGuard,
        domain: &str,
        cancel: &CancellationToken,
    ) -> Result<RollbackOutcome> {
        lock.ensure(domain, LockScope::Deploy)?;
        let site = self.registry.get(domain)?;
        let ledger = self.registry.releases(domain)?;
        let target = ledger
            .rollback_target()
            .cloned()
            .ok_or_else(|| RolloutError::NoRollbackTarget(domain.to_string()))?;
        let from = ledger.current.clone();
        tracing::warn!(domain, from = ?from, to = %target.id, "rolling back");

        self.switch_to(lock, &site, &target.id).await?;
        let health = health::wait_healthy(
            self.probe.as_ref(),
            &self.health_target(&site),
            self.config.health.poll.policy(),
            cancel,
        )
        .await?;
        if !health.passed {
            return Err(RolloutError::RollbackUnhealthy {
                domain: domain.to_string(),
                release: target.id,
            });
        }
        self.registry.promote(lock, domain, &target.id, health)?;
        if let Some(from) = from.as_deref().filter(|id| *id != target.id) {
            self.registry.mark_rolled_back(lock, domain, from, None)?;
        }
        Ok(RollbackOutcome {
            from,
            to: self.registry.release(domain, &target.id)?,
        })
    }

    /// Swap `current` to `release_id` and restart the backend.
    async fn switch_to(&self, lock: &LockGuard, site: &Site, release_id: &str) -> Result<()> {
        artifact::activate(&self.config.paths.deploy_root, &site.domain, release_id)?;
        self.registry
            .set_active_release(lock, &site.domain, release_id)?;
        if site.kind == SiteKind::Process {
            self.supervisor.restart(&site.program_name()).await?;
        }
        Ok(())
    }

    /// Pre-swap failure: mark the release rolled back; nothing to undo.
    fn abort(
        &self,
        lock: &LockGuard,
        release: &Release,
        stage: FailureStage,
        cause: RolloutError,
    ) -> Result<RolloutError> {
        tracing::warn!(domain = %release.site_domain, release = %release.id, %stage, "release aborted: {cause}");
        self.registry
            .mark_rolled_back(lock, &release.site_domain, &release.id, None)?;
        Ok(RolloutError::ReleaseFailed {
            domain: release.site_domain.clone(),
            release: release.id.clone(),
            stage,
            cause: cause.to_string(),
        })
    }

    /// Post-swap failure: restore `fallback` and report the failed stage.
    #[allow(clippy::too_many_arguments)]
    async fn compensate(
        &self,
        lock: &LockGuard,
        site: &Site,
        release: &Release,
        fallback: Option<Release>,
        stage: FailureStage,
        cause: String,
        health: Option<HealthCheckResult>,
        cancel: &CancellationToken,
    ) -> RolloutError {
        let domain = site.domain.as_str();
        tracing::warn!(domain, release = %release.id, %stage, %cause, "release failed after swap");
        if let Err(e) = self
            .registry
            .mark_rolled_back(lock, domain, &release.id, health)
        {
            return e;
        }
        let Some(target) = fallback else {
            return RolloutError::NoRollbackTarget(domain.to_string());
        };

        if let Err(e) = self.switch_to(lock, site, &target.id).await {
            tracing::error!(domain, release = %target.id, "rollback swap failed: {e}");
            return RolloutError::RollbackUnhealthy {
                domain: domain.to_string(),
                release: target.id,
            };
        }
        // A cancelled release still swaps back, but does not wait on health.
        if !cancel.is_cancelled() {
            let verified = health::wait_healthy(
                self.probe.as_ref(),
                &self.health_target(site),
                self.config.health.poll.policy(),
                cancel,
            )
            .await;
            if !matches!(verified, Ok(ref h) if h.passed) {
                tracing::error!(domain, release = %target.id, "rollback target is unhealthy");
                return RolloutError::RollbackUnhealthy {
                    domain: domain.to_string(),
                    release: target.id,
                };
            }
        }
        tracing::info!(domain, release = %target.id, "rolled back");
        RolloutError::ReleaseFailed {
            domain: domain.to_string(),
            release: release.id.clone(),
            stage,
            cause,
        }
    }
}
