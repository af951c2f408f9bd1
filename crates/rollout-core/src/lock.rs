//! Per-domain advisory locks backed by lock files.
//!
//! Acquisition creates `.rollout/locks/<domain>.<scope>.lock` with create-new
//! semantics, so exactly one holder wins across threads and processes. A
//! held lock is reported as `AlreadyInProgress` immediately; callers are
//! never queued. Locks carry a TTL so a crashed holder does not wedge the
//! domain forever: an expired lock is taken over.
//!
//! The guard removes the file on drop, covering every exit path.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RolloutError};
use crate::paths;

/// Independent lock domains for one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    /// Certificate issuance and edge proxy transitions.
    Tls,
    /// Release swaps and everything touching the migration/backup ledgers.
    Deploy,
    /// The domain's proxy vhost. Held only for one render, test and reload.
    Proxy,
}

impl LockScope {
    pub fn as_str(self) -> &'static str {
        match self {
            LockScope::Tls => "tls",
            LockScope::Deploy => "deploy",
            LockScope::Proxy => "proxy",
        }
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder_id: String,
    pub operation: String,
    /// Resource the operation works on, e.g. the backup being restored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct LockManager {
    root: PathBuf,
    ttl: Duration,
}

impl LockManager {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
        }
    }

    pub fn acquire(&self, domain: &str, scope: LockScope, operation: &str) -> Result<LockGuard> {
        self.acquire_for(domain, scope, operation, None)
    }

    /// Acquire the lock, recording `target` as the resource being worked on.
    pub fn acquire_for(
        &self,
        domain: &str,
        scope: LockScope,
        operation: &str,
        target: Option<&str>,
    ) -> Result<LockGuard> {
        paths::validate_domain(domain)?;
        let path = paths::lock_file(&self.root, domain, scope);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let now = Utc::now();
        let info = LockInfo {
            holder_id: Uuid::new_v4().to_string(),
            operation: operation.to_string(),
            target: target.map(str::to_string),
            acquired_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(1)),
        };
        let data = serde_yaml::to_string(&info)?;

        // Two attempts: the second only after evicting an expired holder.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(data.as_bytes())?;
                    file.sync_all()?;
                    tracing::debug!(domain, %scope, operation, "lock acquired");
                    return Ok(LockGuard {
                        path,
                        domain: domain.to_string(),
                        scope,
                        info,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match read_info(&path)? {
                        Some(existing) if !existing.is_expired() => {
                            return Err(RolloutError::AlreadyInProgress {
                                domain: domain.to_string(),
                                scope,
                                operation: existing.operation,
                            });
                        }
                        Some(existing) => {
                            tracing::warn!(
                                domain,
                                %scope,
                                operation = %existing.operation,
                                "taking over expired lock"
                            );
                            remove_if_present(&path)?;
                        }
                        // Vanished between create and read; just retry.
                        None => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(RolloutError::AlreadyInProgress {
            domain: domain.to_string(),
            scope,
            operation: "unknown".to_string(),
        })
    }

    /// The live (unexpired) holder of a lock, if any.
    pub fn holder(&self, domain: &str, scope: LockScope) -> Result<Option<LockInfo>> {
        let path = paths::lock_file(&self.root, domain, scope);
        Ok(read_info(&path)?.filter(|info| !info.is_expired()))
    }
}

/// Proof that the caller holds a domain lock. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    domain: String,
    scope: LockScope,
    info: LockInfo,
}

impl LockGuard {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn scope(&self) -> LockScope {
        self.scope
    }

    pub fn operation(&self) -> &str {
        &self.info.operation
    }

    /// Fail unless this guard covers `domain` in `scope`.
    pub fn ensure(&self, domain: &str, scope: LockScope) -> Result<()> {
        if self.domain == domain && self.scope == scope {
            Ok(())
        } else {
            Err(RolloutError::LockNotHeld {
                domain: domain.to_string(),
                scope,
            })
        }
    }

    fn release(&self) -> Result<()> {
        // Only remove the file if we still own it; an expired lock may have
        // been taken over by another holder.
        match read_info(&self.path)? {
            Some(current) if current.holder_id == self.info.holder_id => {
                remove_if_present(&self.path)
            }
            _ => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(domain = %self.domain, scope = %self.scope, "failed to release lock: {e}");
        }
    }
}

fn read_info(path: &Path) -> Result<Option<LockInfo>> {
    match std::fs::read_to_string(path) {
        // A half-written file from a concurrent creator reads as empty.
        Ok(data) if data.trim().is_empty() => Ok(Some(LockInfo {
            holder_id: String::new(),
            operation: "acquiring".to_string(),
            target: None,
            acquired_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(5),
        })),
        Ok(data) => Ok(Some(serde_yaml::from_str(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> LockManager {
        LockManager::new(dir.path(), Duration::from_secs(60))
    }

    #[test]
    fn second_acquire_is_rejected() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        let _guard = locks
            .acquire("api.example.com", LockScope::Deploy, "release")
            .unwrap();
        let err = locks
            .acquire("api.example.com", LockScope::Deploy, "restore")
            .unwrap_err();
        match err {
            RolloutError::AlreadyInProgress { operation, .. } => assert_eq!(operation, "release"),
            other => panic!("expected AlreadyInProgress, got {other:?}"),
        }
    }

    #[test]
    fn drop_releases_lock() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        {
            let _guard = locks
                .acquire("api.example.com", LockScope::Deploy, "release")
                .unwrap();
        }
        locks
            .acquire("api.example.com", LockScope::Deploy, "release")
            .unwrap();
    }

    #[test]
    fn scopes_and_domains_are_independent() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        let _a = locks
            .acquire("api.example.com", LockScope::Deploy, "release")
            .unwrap();
        let _b = locks
            .acquire("api.example.com", LockScope::Tls, "poll")
            .unwrap();
        let _c = locks
            .acquire("front.example.com", LockScope::Deploy, "release")
            .unwrap();
    }

    #[test]
    fn expired_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let short = LockManager::new(dir.path(), Duration::ZERO);
        let stale = short
            .acquire("api.example.com", LockScope::Deploy, "crashed")
            .unwrap();
        // Simulate a crash: the guard never runs its drop.
        std::mem::forget(stale);

        let locks = manager(&dir);
        let guard = locks
            .acquire("api.example.com", LockScope::Deploy, "release")
            .unwrap();
        assert_eq!(guard.operation(), "release");
    }

    #[test]
    fn holder_reports_target() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        let _guard = locks
            .acquire_for("api.example.com", LockScope::Deploy, "restore", Some("b-1"))
            .unwrap();
        let info = locks
            .holder("api.example.com", LockScope::Deploy)
            .unwrap()
            .unwrap();
        assert_eq!(info.target.as_deref(), Some("b-1"));
        assert!(locks.holder("api.example.com", LockScope::Tls).unwrap().is_none());
    }

    #[test]
    fn ensure_checks_domain_and_scope() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        let guard = locks
            .acquire("api.example.com", LockScope::Tls, "begin")
            .unwrap();
        assert!(guard.ensure("api.example.com", LockScope::Tls).is_ok());
        assert!(guard.ensure("api.example.com", LockScope::Deploy).is_err());
        assert!(guard.ensure("front.example.com", LockScope::Tls).is_err());
    }
}
