//! Backup Manager: database dumps, retention and restore.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BackupConfig;
use crate::confirm::Confirmation;
use crate::database::DatabaseEngine;
use crate::error::{Result, RolloutError};
use crate::io;
use crate::lock::{LockGuard, LockScope};
use crate::migration::{self, MigrationLedger, MigrationRecord};
use crate::paths;
use crate::registry::Site;
use crate::types::MigrationMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub site_domain: String,
    pub created_at: DateTime<Utc>,
    /// Dump size in bytes.
    pub size: u64,
    pub storage_path: PathBuf,
    pub retention_expiry: DateTime<Utc>,
    /// Ledger version at the time of the dump; becomes current on restore.
    pub schema_version: u64,
}

impl BackupRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.retention_expiry
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BackupLedger {
    #[serde(default)]
    backups: Vec<BackupRecord>,
}

#[derive(Clone)]
pub struct BackupManager {
    root: PathBuf,
    backup_root: PathBuf,
    retention: chrono::Duration,
    engine: Arc<dyn DatabaseEngine>,
}

impl BackupManager {
    pub fn new(
        root: impl Into<PathBuf>,
        backup_root: impl Into<PathBuf>,
        config: &BackupConfig,
        engine: Arc<dyn DatabaseEngine>,
    ) -> Self {
        Self {
            root: root.into(),
            backup_root: backup_root.into(),
            retention: chrono::Duration::days(i64::from(config.retention_days)),
            engine,
        }
    }

    /// Backups for `domain`, oldest first.
    pub fn list(&self, domain: &str) -> Result<Vec<BackupRecord>> {
        Ok(self.load(domain)?.backups)
    }

    pub fn get(&self, domain: &str, id: &str) -> Result<BackupRecord> {
        self.list(domain)?
            .into_iter()
            .find(|b| b.id == id)
            .ok_or_else(|| RolloutError::BackupNotFound {
                domain: domain.to_string(),
                id: id.to_string(),
            })
    }

    /// Dump the site's database and record it. Returns only after the dump
    /// is complete on disk.
    ///
    /// The dump is written to `<id>.dump.partial` and renamed only once it
    /// verifies, so a failed run leaves no unrecorded file behind.
    pub async fn backup(&self, lock: &LockGuard, site: &Site) -> Result<BackupRecord> {
        lock.ensure(&site.domain, LockScope::Deploy)?;
        let url = migration::database_url(site)?;
        let now = Utc::now();
        let id = format!(
            "{}-{}",
            now.format("%Y%m%dT%H%M%SZ"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let dir = self.backup_root.join(&site.domain);
        io::ensure_dir(&dir)?;
        let partial = dir.join(format!("{id}.dump.partial"));
        let storage_path = dir.join(format!("{id}.dump"));

        let record = match self.dump_verified(&url, site, &id, now, &partial).await {
            Ok(record) => record,
            Err(e) => {
                discard(&site.domain, &partial);
                return Err(e);
            }
        };
        if let Err(e) = std::fs::rename(&partial, &storage_path) {
            discard(&site.domain, &partial);
            return Err(e.into());
        }
        let record = BackupRecord {
            storage_path,
            ..record
        };

        let recorded = self.load(&site.domain).and_then(|mut ledger| {
            ledger.backups.push(record.clone());
            self.save(&site.domain, &ledger)
        });
        if let Err(e) = recorded {
            discard(&site.domain, &record.storage_path);
            return Err(e);
        }
        tracing::info!(domain = %site.domain, backup = %record.id, size = record.size, "backup recorded");
        Ok(record)
    }

    async fn dump_verified(
        &self,
        url: &str,
        site: &Site,
        id: &str,
        now: DateTime<Utc>,
        dest: &Path,
    ) -> Result<BackupRecord> {
        let size = self.engine.dump(url, dest).await?;
        let record = BackupRecord {
            id: id.to_string(),
            site_domain: site.domain.clone(),
            created_at: now,
            size,
            storage_path: dest.to_path_buf(),
            retention_expiry: now + self.retention,
            schema_version: MigrationLedger::load(&self.root, &site.domain)?.current_version(),
        };
        self.verify(&record)?;
        Ok(record)
    }

    /// The dump exists and matches its recorded, non-zero size.
    pub fn verify(&self, record: &BackupRecord) -> Result<()> {
        let unverified = |reason: String| RolloutError::BackupUnverified {
            domain: record.site_domain.clone(),
            reason,
        };
        let meta = std::fs::metadata(&record.storage_path).map_err(|e| {
            unverified(format!("{}: {e}", record.storage_path.display()))
        })?;
        if meta.len() == 0 || record.size == 0 {
            return Err(unverified(format!("backup {} is empty", record.id)));
        }
        if meta.len() != record.size {
            return Err(unverified(format!(
                "backup {} is {} bytes on disk, {} recorded",
                record.id,
                meta.len(),
                record.size
            )));
        }
        Ok(())
    }

    /// Restore a backup and record its schema version as current.
    pub async fn restore(
        &self,
        lock: &LockGuard,
        site: &Site,
        backup_id: &str,
        confirmation: Option<Confirmation>,
    ) -> Result<MigrationRecord> {
        Confirmation::require(confirmation, &site.domain, "restore")?;
        lock.ensure(&site.domain, LockScope::Deploy)?;
        let url = migration::database_url(site)?;
        let backup = self.get(&site.domain, backup_id)?;
        self.verify(&backup)?;

        tracing::warn!(domain = %site.domain, backup = %backup.id, "restoring database");
        self.engine.restore(&url, &backup.storage_path).await?;
        let record = MigrationRecord {
            site_domain: site.domain.clone(),
            applied_version: backup.schema_version,
            name: None,
            applied_at: Utc::now(),
            mode: MigrationMode::Restored,
            backup_id: Some(backup.id.clone()),
        };
        MigrationLedger::append(&self.root, lock, record.clone())?;
        tracing::info!(domain = %site.domain, backup = %backup.id, version = backup.schema_version, "restore complete");
        Ok(record)
    }

    /// Remove records past retention and their dump files.
    pub fn prune(&self, lock: &LockGuard, domain: &str, now: DateTime<Utc>) -> Result<Vec<BackupRecord>> {
        lock.ensure(domain, LockScope::Deploy)?;
        let ledger = self.load(domain)?;
        let (expired, kept): (Vec<_>, Vec<_>) =
            ledger.backups.into_iter().partition(|b| b.is_expired(now));
        if expired.is_empty() {
            return Ok(expired);
        }
        // Drop the records first: a crash then leaves an orphan file, never
        // a record pointing at nothing.
        self.save(domain, &BackupLedger { backups: kept })?;
        for record in &expired {
            remove_dump(&record.storage_path)?;
            tracing::info!(domain, backup = %record.id, "backup pruned");
        }
        Ok(expired)
    }

    fn load(&self, domain: &str) -> Result<BackupLedger> {
        Ok(io::read_yaml(&paths::backups_file(&self.root, domain))?.unwrap_or_default())
    }

    fn save(&self, domain: &str, ledger: &BackupLedger) -> Result<()> {
        io::write_yaml(&paths::backups_file(&self.root, domain), ledger)
    }
}

/// Best-effort removal of a dump that will not be recorded.
fn discard(domain: &str, path: &Path) {
    if let Err(e) = remove_dump(path) {
        tracing::warn!(domain, path = %path.display(), "failed to remove unrecorded dump: {e}");
    }
}

fn remove_dump(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseTarget;
    use crate::lock::LockManager;
    use crate::testing::{self, FakeDatabase};
    use crate::types::SiteKind;
    use std::time::Duration;
    use tempfile::TempDir;

    const DOMAIN: &str = "api.example.com";

    struct Fixture {
        dir: TempDir,
        locks: LockManager,
        db: Arc<FakeDatabase>,
        backups: BackupManager,
        site: Site,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(FakeDatabase::default());
        let backups = BackupManager::new(
            dir.path(),
            dir.path().join("backups"),
            &BackupConfig { retention_days: 7 },
            db.clone(),
        );
        let mut site = testing::site(DOMAIN, SiteKind::Process, Some(8020));
        site.database = Some(DatabaseTarget::new("postgres://localhost/api"));
        Fixture {
            locks: LockManager::new(dir.path(), Duration::from_secs(60)),
            dir,
            db,
            backups,
            site,
        }
    }

    #[tokio::test]
    async fn backup_records_verified_dump() {
        let f = fixture();
        let lock = f.locks.acquire(DOMAIN, LockScope::Deploy, "backup").unwrap();
        let record = f.backups.backup(&lock, &f.site).await.unwrap();
        assert!(record.size > 0);
        assert!(record.storage_path.starts_with(f.dir.path().join("backups").join(DOMAIN)));
        assert_eq!(record.retention_expiry - record.created_at, chrono::Duration::days(7));
        assert_eq!(f.backups.list(DOMAIN).unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn empty_dump_is_not_recorded() {
        let f = fixture();
        f.db.empty_dump(true);
        let lock = f.locks.acquire(DOMAIN, LockScope::Deploy, "backup").unwrap();
        let err = f.backups.backup(&lock, &f.site).await.unwrap_err();
        assert!(matches!(err, RolloutError::BackupUnverified { .. }));
        assert!(f.backups.list(DOMAIN).unwrap().is_empty());
    }

    fn files_in(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect()
    }

    #[tokio::test]
    async fn failed_dumps_leave_nothing_on_disk() {
        let f = fixture();
        let lock = f.locks.acquire(DOMAIN, LockScope::Deploy, "backup").unwrap();
        f.db.empty_dump(true);
        for _ in 0..3 {
            assert!(f.backups.backup(&lock, &f.site).await.is_err());
        }
        f.db.empty_dump(false);
        f.db.fail_dump(true);
        assert!(f.backups.backup(&lock, &f.site).await.is_err());

        assert!(f.backups.list(DOMAIN).unwrap().is_empty());
        assert!(files_in(&f.dir.path().join("backups").join(DOMAIN)).is_empty());
    }

    #[tokio::test]
    async fn recorded_dump_has_its_final_name() {
        let f = fixture();
        let lock = f.locks.acquire(DOMAIN, LockScope::Deploy, "backup").unwrap();
        let record = f.backups.backup(&lock, &f.site).await.unwrap();
        assert_eq!(
            record.storage_path.file_name().unwrap().to_str().unwrap(),
            format!("{}.dump", record.id)
        );
        assert_eq!(
            files_in(&f.dir.path().join("backups").join(DOMAIN)),
            vec![record.storage_path]
        );
    }

    #[tokio::test]
    async fn restore_appends_restored_record() {
        let f = fixture();
        let lock = f.locks.acquire(DOMAIN, LockScope::Deploy, "restore").unwrap();
        MigrationLedger::append(
            f.dir.path(),
            &lock,
            MigrationRecord {
                site_domain: DOMAIN.into(),
                applied_version: 4,
                name: Some("init".into()),
                applied_at: Utc::now(),
                mode: MigrationMode::Incremental,
                backup_id: None,
            },
        )
        .unwrap();
        let backup = f.backups.backup(&lock, &f.site).await.unwrap();
        assert_eq!(backup.schema_version, 4);

        let record = f
            .backups
            .restore(&lock, &f.site, &backup.id, Some(Confirmation::new(DOMAIN)))
            .await
            .unwrap();
        assert_eq!(record.mode, MigrationMode::Restored);
        assert_eq!(record.applied_version, 4);
        assert_eq!(f.db.calls().last().map(String::as_str), Some("restore"));
    }

    #[tokio::test]
    async fn restore_requires_confirmation_and_known_backup() {
        let f = fixture();
        let lock = f.locks.acquire(DOMAIN, LockScope::Deploy, "restore").unwrap();
        assert!(matches!(
            f.backups.restore(&lock, &f.site, "nope", None).await,
            Err(RolloutError::ConfirmationRequired { .. })
        ));
        assert!(matches!(
            f.backups
                .restore(&lock, &f.site, "nope", Some(Confirmation::new(DOMAIN)))
                .await,
            Err(RolloutError::BackupNotFound { .. })
        ));
        assert!(f.db.calls().is_empty());
    }

    #[tokio::test]
    async fn prune_removes_only_expired() {
        let f = fixture();
        let lock = f.locks.acquire(DOMAIN, LockScope::Deploy, "prune").unwrap();
        let record = f.backups.backup(&lock, &f.site).await.unwrap();

        assert!(f.backups.prune(&lock, DOMAIN, Utc::now()).unwrap().is_empty());
        let later = Utc::now() + chrono::Duration::days(8);
        let removed = f.backups.prune(&lock, DOMAIN, later).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(!record.storage_path.exists());
        assert!(f.backups.list(DOMAIN).unwrap().is_empty());
    }
}
