//! Site Registry: the durable record of declared sites and their releases.
//!
//! Each site owns a directory under `.rollout/sites/<domain>/`. The
//! declaration, the TLS record and the release ledger live in separate
//! files because they have different writers: `site.yaml` and
//! `releases.yaml` change under the deploy lock, `tls.yaml` under the TLS
//! lock. Every mutating call takes the `LockGuard` that proves exclusivity.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::DatabaseTarget;
use crate::error::{Result, RolloutError};
use crate::health::HealthCheckResult;
use crate::io;
use crate::lock::{LockGuard, LockScope};
use crate::paths;
use crate::release::{Release, ReleaseLedger};
use crate::types::{ReleaseStatus, SiteKind, TlsState};

// ---------------------------------------------------------------------------
// SiteSpec / Site
// ---------------------------------------------------------------------------

/// Input to `declare`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteSpec {
    pub domain: String,
    pub kind: SiteKind,
    #[serde(default)]
    pub port: Option<u16>,
    /// Supervisor program name; defaults to the domain with dashes.
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub database: Option<DatabaseTarget>,
    #[serde(default)]
    pub health_path: Option<String>,
}

impl SiteSpec {
    pub fn new(domain: impl Into<String>, kind: SiteKind) -> Self {
        Self {
            domain: domain.into(),
            kind,
            port: None,
            program: None,
            database: None,
            health_path: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_database(mut self, database: DatabaseTarget) -> Self {
        self.database = Some(database);
        self
    }

    fn validate(&self) -> Result<()> {
        paths::validate_domain(&self.domain)?;
        let invalid = |reason: &str| RolloutError::InvalidSiteSpec {
            domain: self.domain.clone(),
            reason: reason.to_string(),
        };
        match (self.kind, self.port) {
            (SiteKind::Process, None) => return Err(invalid("process sites need a port")),
            (SiteKind::Process, Some(0)) => return Err(invalid("port must be non-zero")),
            (SiteKind::Static, Some(_)) => return Err(invalid("static sites take no port")),
            _ => {}
        }
        if let Some(path) = &self.health_path {
            if !path.starts_with('/') {
                return Err(invalid("health path must start with '/'"));
            }
        }
        Ok(())
    }
}

/// The declaration as persisted in `site.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SiteRecord {
    #[serde(flatten)]
    spec: SiteSpec,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TlsRecord {
    state: TlsState,
    updated_at: DateTime<Utc>,
}

/// A declared site with its current TLS state and active release pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub domain: String,
    pub kind: SiteKind,
    pub port: Option<u16>,
    pub program: Option<String>,
    pub database: Option<DatabaseTarget>,
    pub health_path: Option<String>,
    pub tls_state: TlsState,
    pub current_release_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Site {
    /// Name of the supervisor program running this site's backend.
    pub fn program_name(&self) -> String {
        self.program
            .clone()
            .unwrap_or_else(|| self.domain.replace('.', "-"))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
}

impl Registry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Declare a site. Re-declaring with the same kind and port is a no-op;
    /// a different kind or port is a conflict. Returns true when created.
    pub fn declare(&self, lock: &LockGuard, spec: SiteSpec) -> Result<(Site, bool)> {
        spec.validate()?;
        lock.ensure(&spec.domain, LockScope::Deploy)?;

        let path = paths::site_file(&self.root, &spec.domain);
        if let Some(existing) = io::read_yaml::<SiteRecord>(&path)? {
            if existing.spec.kind != spec.kind || existing.spec.port != spec.port {
                return Err(RolloutError::Conflict {
                    domain: spec.domain.clone(),
                    reason: format!(
                        "already declared as {} (port {}), requested {} (port {})",
                        existing.spec.kind,
                        fmt_port(existing.spec.port),
                        spec.kind,
                        fmt_port(spec.port)
                    ),
                });
            }
            return Ok((self.get(&spec.domain)?, false));
        }

        let domain = spec.domain.clone();
        let record = SiteRecord {
            spec,
            created_at: Utc::now(),
        };
        io::write_yaml(&path, &record)?;
        tracing::info!(domain = %domain, kind = %record.spec.kind, "site declared");
        Ok((self.get(&domain)?, true))
    }

    pub fn get(&self, domain: &str) -> Result<Site> {
        paths::validate_domain(domain)?;
        let record: SiteRecord = io::read_yaml(&paths::site_file(&self.root, domain))?
            .ok_or_else(|| RolloutError::SiteNotFound(domain.to_string()))?;
        let tls_state = self.tls_state(domain)?;
        let ledger = self.releases(domain)?;
        let SiteSpec {
            domain,
            kind,
            port,
            program,
            database,
            health_path,
        } = record.spec;
        Ok(Site {
            domain,
            kind,
            port,
            program,
            database,
            health_path,
            tls_state,
            current_release_id: ledger.current,
            created_at: record.created_at,
        })
    }

    pub fn exists(&self, domain: &str) -> bool {
        paths::site_file(&self.root, domain).exists()
    }

    /// All declared sites, sorted by domain.
    pub fn list(&self) -> Result<Vec<Site>> {
        let dir = paths::sites_dir(&self.root);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut sites = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let domain = entry.file_name().to_string_lossy().into_owned();
            match self.get(&domain) {
                Ok(site) => sites.push(site),
                Err(RolloutError::SiteNotFound(_)) | Err(RolloutError::InvalidDomain(_)) => {}
                Err(e) => return Err(e),
            }
        }
        sites.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(sites)
    }

    // -----------------------------------------------------------------------
    // TLS state
    // -----------------------------------------------------------------------

    pub fn tls_state(&self, domain: &str) -> Result<TlsState> {
        let record: Option<TlsRecord> = io::read_yaml(&paths::tls_file(&self.root, domain))?;
        Ok(record.map(|r| r.state).unwrap_or(TlsState::DnsOnly))
    }

    /// Move the TLS state along the automated transition table. Setting the
    /// current state again is a no-op.
    pub fn update_tls_state(
        &self,
        lock: &LockGuard,
        domain: &str,
        new_state: TlsState,
    ) -> Result<()> {
        lock.ensure(domain, LockScope::Tls)?;
        self.require(domain)?;
        let current = self.tls_state(domain)?;
        if current == new_state {
            return Ok(());
        }
        if !current.can_transition_to(new_state) {
            return Err(RolloutError::InvalidTransition {
                domain: domain.to_string(),
                from: current,
                to: new_state,
            });
        }
        self.write_tls(domain, new_state)?;
        tracing::info!(domain, from = %current, to = %new_state, "tls state changed");
        Ok(())
    }

    /// Manual recovery: any state back to `DnsOnly`.
    pub fn force_dns_only(&self, lock: &LockGuard, domain: &str) -> Result<TlsState> {
        lock.ensure(domain, LockScope::Tls)?;
        self.require(domain)?;
        let previous = self.tls_state(domain)?;
        self.write_tls(domain, TlsState::DnsOnly)?;
        tracing::warn!(domain, from = %previous, "tls state forced to dns_only");
        Ok(previous)
    }

    fn write_tls(&self, domain: &str, state: TlsState) -> Result<()> {
        io::write_yaml(
            &paths::tls_file(&self.root, domain),
            &TlsRecord {
                state,
                updated_at: Utc::now(),
            },
        )
    }

    // -----------------------------------------------------------------------
    // Releases
    // -----------------------------------------------------------------------

    pub fn releases(&self, domain: &str) -> Result<ReleaseLedger> {
        Ok(io::read_yaml(&paths::releases_file(&self.root, domain))?.unwrap_or_default())
    }

    pub fn release(&self, domain: &str, id: &str) -> Result<Release> {
        self.releases(domain)?
            .get(id)
            .cloned()
            .ok_or_else(|| RolloutError::ReleaseNotFound {
                domain: domain.to_string(),
                id: id.to_string(),
            })
    }

    /// Stage a release for `digest`; returns the existing record when the
    /// same content was staged before. The boolean is true when created.
    pub fn stage_release(
        &self,
        lock: &LockGuard,
        domain: &str,
        digest: &str,
    ) -> Result<(Release, bool)> {
        self.mutate_releases(lock, domain, |ledger| Ok(ledger.stage(domain, digest)))
    }

    /// Atomically repoint the site's current release.
    pub fn set_active_release(&self, lock: &LockGuard, domain: &str, id: &str) -> Result<()> {
        self.mutate_releases(lock, domain, |ledger| {
            if ledger.get(id).is_none() {
                return Err(RolloutError::ReleaseNotFound {
                    domain: domain.to_string(),
                    id: id.to_string(),
                });
            }
            ledger.current = Some(id.to_string());
            Ok(())
        })
    }

    /// Mark `id` active and demote the previously active release.
    pub fn promote(
        &self,
        lock: &LockGuard,
        domain: &str,
        id: &str,
        health: HealthCheckResult,
    ) -> Result<()> {
        self.mutate_releases(lock, domain, |ledger| {
            if !ledger.promote(id) {
                return Err(RolloutError::ReleaseNotFound {
                    domain: domain.to_string(),
                    id: id.to_string(),
                });
            }
            if let Some(release) = ledger.get_mut(id) {
                release.health_check_result = Some(health);
            }
            Ok(())
        })
    }

    pub fn mark_rolled_back(
        &self,
        lock: &LockGuard,
        domain: &str,
        id: &str,
        health: Option<HealthCheckResult>,
    ) -> Result<()> {
        self.mutate_releases(lock, domain, |ledger| {
            let release = ledger
                .get_mut(id)
                .ok_or_else(|| RolloutError::ReleaseNotFound {
                    domain: domain.to_string(),
                    id: id.to_string(),
                })?;
            release.status = ReleaseStatus::RolledBack;
            if health.is_some() {
                release.health_check_result = health;
            }
            Ok(())
        })
    }

    fn mutate_releases<T>(
        &self,
        lock: &LockGuard,
        domain: &str,
        f: impl FnOnce(&mut ReleaseLedger) -> Result<T>,
    ) -> Result<T> {
        lock.ensure(domain, LockScope::Deploy)?;
        self.require(domain)?;
        let mut ledger = self.releases(domain)?;
        let out = f(&mut ledger)?;
        io::write_yaml(&paths::releases_file(&self.root, domain), &ledger)?;
        Ok(out)
    }

    fn require(&self, domain: &str) -> Result<()> {
        if self.exists(domain) {
            Ok(())
        } else {
            Err(RolloutError::SiteNotFound(domain.to_string()))
        }
    }
}

fn fmt_port(port: Option<u16>) -> String {
    port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockManager;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        registry: Registry,
        locks: LockManager,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new(dir.path());
        let locks = LockManager::new(dir.path(), Duration::from_secs(60));
        Fixture {
            _dir: dir,
            registry,
            locks,
        }
    }

    fn declare(f: &Fixture, spec: SiteSpec) -> Result<(Site, bool)> {
        let lock = f
            .locks
            .acquire(&spec.domain, LockScope::Deploy, "provision")
            .unwrap();
        f.registry.declare(&lock, spec)
    }

    #[test]
    fn declare_is_idempotent() {
        let f = fixture();
        let spec = SiteSpec::new("api.example.com", SiteKind::Process).with_port(8020);
        let (site, created) = declare(&f, spec.clone()).unwrap();
        assert!(created);
        assert_eq!(site.tls_state, TlsState::DnsOnly);
        let (_, created_again) = declare(&f, spec).unwrap();
        assert!(!created_again);
    }

    #[test]
    fn declare_conflicting_port_fails() {
        let f = fixture();
        declare(
            &f,
            SiteSpec::new("api.example.com", SiteKind::Process).with_port(8020),
        )
        .unwrap();
        let err = declare(
            &f,
            SiteSpec::new("api.example.com", SiteKind::Process).with_port(8021),
        )
        .unwrap_err();
        assert!(matches!(err, RolloutError::Conflict { .. }));
    }

    #[test]
    fn declare_validates_port_rules() {
        let f = fixture();
        assert!(matches!(
            declare(&f, SiteSpec::new("api.example.com", SiteKind::Process)),
            Err(RolloutError::InvalidSiteSpec { .. })
        ));
        assert!(matches!(
            declare(
                &f,
                SiteSpec::new("front.example.com", SiteKind::Static).with_port(80)
            ),
            Err(RolloutError::InvalidSiteSpec { .. })
        ));
    }

    #[test]
    fn get_unknown_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.registry.get("nope.example.com"),
            Err(RolloutError::SiteNotFound(_))
        ));
    }

    #[test]
    fn list_sorts_by_domain() {
        let f = fixture();
        declare(&f, SiteSpec::new("front.example.com", SiteKind::Static)).unwrap();
        declare(
            &f,
            SiteSpec::new("api.example.com", SiteKind::Process).with_port(8020),
        )
        .unwrap();
        let domains: Vec<String> = f
            .registry
            .list()
            .unwrap()
            .into_iter()
            .map(|s| s.domain)
            .collect();
        assert_eq!(domains, vec!["api.example.com", "front.example.com"]);
    }

    #[test]
    fn tls_transitions_are_validated() {
        let f = fixture();
        declare(&f, SiteSpec::new("front.example.com", SiteKind::Static)).unwrap();
        let lock = f
            .locks
            .acquire("front.example.com", LockScope::Tls, "test")
            .unwrap();
        let err = f
            .registry
            .update_tls_state(&lock, "front.example.com", TlsState::Proxied)
            .unwrap_err();
        assert!(matches!(err, RolloutError::InvalidTransition { .. }));

        f.registry
            .update_tls_state(&lock, "front.example.com", TlsState::Issuing)
            .unwrap();
        f.registry
            .update_tls_state(&lock, "front.example.com", TlsState::IssuedVerified)
            .unwrap();
        f.registry
            .update_tls_state(&lock, "front.example.com", TlsState::Proxied)
            .unwrap();
        assert_eq!(
            f.registry.get("front.example.com").unwrap().tls_state,
            TlsState::Proxied
        );

        let previous = f
            .registry
            .force_dns_only(&lock, "front.example.com")
            .unwrap();
        assert_eq!(previous, TlsState::Proxied);
    }

    #[test]
    fn tls_update_requires_tls_lock() {
        let f = fixture();
        declare(&f, SiteSpec::new("front.example.com", SiteKind::Static)).unwrap();
        let deploy = f
            .locks
            .acquire("front.example.com", LockScope::Deploy, "release")
            .unwrap();
        let err = f
            .registry
            .update_tls_state(&deploy, "front.example.com", TlsState::Issuing)
            .unwrap_err();
        assert!(matches!(err, RolloutError::LockNotHeld { .. }));
    }

    #[test]
    fn set_active_release_and_promote() {
        let f = fixture();
        declare(
            &f,
            SiteSpec::new("api.example.com", SiteKind::Process).with_port(8020),
        )
        .unwrap();
        let lock = f
            .locks
            .acquire("api.example.com", LockScope::Deploy, "release")
            .unwrap();
        let (release, _) = f
            .registry
            .stage_release(&lock, "api.example.com", "a1a1a1a1a1a1a1a1")
            .unwrap();
        f.registry
            .set_active_release(&lock, "api.example.com", &release.id)
            .unwrap();
        f.registry
            .promote(
                &lock,
                "api.example.com",
                &release.id,
                HealthCheckResult {
                    passed: true,
                    attempts: 1,
                    detail: None,
                    checked_at: Utc::now(),
                },
            )
            .unwrap();
        let site = f.registry.get("api.example.com").unwrap();
        assert_eq!(site.current_release_id.as_deref(), Some(release.id.as_str()));
        assert_eq!(
            f.registry.release("api.example.com", &release.id).unwrap().status,
            ReleaseStatus::Active
        );
        assert!(f
            .registry
            .set_active_release(&lock, "api.example.com", "9999-missing")
            .is_err());
    }
}
