//! Migration Runner: versioned schema scripts and the append-only ledger.
//!
//! Scripts live in a `migrations/` directory shipped with each release, named
//! `<version>_<name>.up.sql` with an optional `<version>_<name>.down.sql`.
//! The ledger in `migrations.yaml` records successes only: a migration that
//! fails leaves no record, and the next `apply_incremental` retries it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::backup::BackupManager;
use crate::confirm::Confirmation;
use crate::database::DatabaseEngine;
use crate::error::{Result, RolloutError};
use crate::io;
use crate::lock::{LockGuard, LockScope};
use crate::paths;
use crate::registry::Site;
use crate::types::MigrationMode;

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub site_domain: String,
    pub applied_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub applied_at: DateTime<Utc>,
    pub mode: MigrationMode,
    /// Backup taken before a destructive reset, or restored from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationLedger {
    #[serde(default)]
    pub records: Vec<MigrationRecord>,
}

impl MigrationLedger {
    pub fn load(root: &Path, domain: &str) -> Result<Self> {
        Ok(io::read_yaml(&paths::migrations_file(root, domain))?.unwrap_or_default())
    }

    /// Schema version the database is at: the last record wins, so a reset
    /// (version 0) or a restore moves it backwards.
    pub fn current_version(&self) -> u64 {
        self.records.last().map(|r| r.applied_version).unwrap_or(0)
    }

    /// Append one record and persist. Callers hold the deploy lock.
    pub(crate) fn append(
        root: &Path,
        lock: &LockGuard,
        record: MigrationRecord,
    ) -> Result<()> {
        lock.ensure(&record.site_domain, LockScope::Deploy)?;
        let mut ledger = Self::load(root, &record.site_domain)?;
        let path = paths::migrations_file(root, &record.site_domain);
        ledger.records.push(record);
        io::write_yaml(&path, &ledger)
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Migration {
    pub version: u64,
    pub name: String,
    pub up: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub down: Option<PathBuf>,
}

static FILE_RE: OnceLock<Regex> = OnceLock::new();

fn file_re() -> &'static Regex {
    FILE_RE.get_or_init(|| {
        Regex::new(r"^(\d+)_([A-Za-z0-9][A-Za-z0-9_\-]*)\.(up|down)\.sql$").unwrap()
    })
}

/// Migrations in `dir`, ascending by version. A missing directory has none.
pub fn discover(dir: &Path) -> Result<Vec<Migration>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut ups: BTreeMap<u64, (String, PathBuf)> = BTreeMap::new();
    let mut downs: BTreeMap<u64, PathBuf> = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if !file_name.ends_with(".sql") {
            continue;
        }
        let caps = file_re()
            .captures(&file_name)
            .ok_or_else(|| RolloutError::InvalidMigration(file_name.clone()))?;
        let version: u64 = caps[1]
            .parse()
            .map_err(|_| RolloutError::InvalidMigration(file_name.clone()))?;
        if version == 0 {
            return Err(RolloutError::InvalidMigration(file_name));
        }
        let duplicate = match &caps[3] {
            "up" => ups
                .insert(version, (caps[2].to_string(), entry.path()))
                .is_some(),
            _ => downs.insert(version, entry.path()).is_some(),
        };
        if duplicate {
            return Err(RolloutError::InvalidMigration(format!(
                "{file_name}: version {version} appears twice"
            )));
        }
    }
    if let Some(orphan) = downs.keys().find(|v| !ups.contains_key(v)) {
        return Err(RolloutError::InvalidMigration(format!(
            "version {orphan} has a down script but no up script"
        )));
    }
    Ok(ups
        .into_iter()
        .map(|(version, (name, up))| Migration {
            version,
            name,
            up,
            down: downs.remove(&version),
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MigrationReport {
    pub applied: Vec<u64>,
    pub current_version: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    pub backup_id: String,
    pub migrations: MigrationReport,
}

#[derive(Clone)]
pub struct MigrationRunner {
    root: PathBuf,
    engine: Arc<dyn DatabaseEngine>,
}

impl MigrationRunner {
    pub fn new(root: impl Into<PathBuf>, engine: Arc<dyn DatabaseEngine>) -> Self {
        Self {
            root: root.into(),
            engine,
        }
    }

    pub fn ledger(&self, domain: &str) -> Result<MigrationLedger> {
        MigrationLedger::load(&self.root, domain)
    }

    /// Migrations in `source` newer than the ledger's current version.
    pub fn outstanding(&self, site: &Site, source: &Path) -> Result<Vec<Migration>> {
        let current = self.ledger(&site.domain)?.current_version();
        Ok(discover(source)?
            .into_iter()
            .filter(|m| m.version > current)
            .collect())
    }

    /// Apply outstanding migrations in ascending order, one transaction each.
    ///
    /// Stops at the first failure with `MigrationFailed`; earlier migrations
    /// in the same run stay applied and recorded.
    pub async fn apply_incremental(
        &self,
        lock: &LockGuard,
        site: &Site,
        source: &Path,
    ) -> Result<MigrationReport> {
        lock.ensure(&site.domain, LockScope::Deploy)?;
        let url = database_url(site)?;
        let pending = self.outstanding(site, source)?;
        let mut report = MigrationReport {
            applied: Vec::new(),
            current_version: self.ledger(&site.domain)?.current_version(),
        };
        if pending.is_empty() {
            tracing::debug!(domain = %site.domain, version = report.current_version, "schema up to date");
            return Ok(report);
        }

        for migration in pending {
            tracing::info!(domain = %site.domain, version = migration.version, name = %migration.name, "applying migration");
            if let Err(e) = self.engine.apply(&url, &migration.up).await {
                tracing::warn!(domain = %site.domain, version = migration.version, "migration failed: {e}");
                return Err(RolloutError::MigrationFailed {
                    version: migration.version,
                    cause: e.to_string(),
                });
            }
            MigrationLedger::append(
                &self.root,
                lock,
                MigrationRecord {
                    site_domain: site.domain.clone(),
                    applied_version: migration.version,
                    name: Some(migration.name.clone()),
                    applied_at: Utc::now(),
                    mode: MigrationMode::Incremental,
                    backup_id: None,
                },
            )?;
            report.applied.push(migration.version);
            report.current_version = migration.version;
        }
        Ok(report)
    }

    /// Drop and recreate the schema, then migrate from empty.
    ///
    /// Order: confirmation, backup, backup verification, drop, ledger reset
    /// record, incremental apply. Nothing is dropped unless the backup taken
    /// in this call is verified on disk.
    pub async fn destructive_reset(
        &self,
        lock: &LockGuard,
        site: &Site,
        source: &Path,
        confirmation: Option<Confirmation>,
        backups: &BackupManager,
    ) -> Result<ResetReport> {
        Confirmation::require(confirmation, &site.domain, "destructive reset")?;
        lock.ensure(&site.domain, LockScope::Deploy)?;
        let url = database_url(site)?;
        // Refuse to drop anything if the scripts to rebuild it are broken.
        discover(source)?;

        let backup = backups
            .backup(lock, site)
            .await
            .map_err(|e| RolloutError::BackupUnverified {
                domain: site.domain.clone(),
                reason: e.to_string(),
            })?;
        backups.verify(&backup)?;

        tracing::warn!(domain = %site.domain, backup = %backup.id, "dropping schema");
        self.engine.reset(&url).await?;
        MigrationLedger::append(
            &self.root,
            lock,
            MigrationRecord {
                site_domain: site.domain.clone(),
                applied_version: 0,
                name: None,
                applied_at: Utc::now(),
                mode: MigrationMode::DestructiveReset,
                backup_id: Some(backup.id.clone()),
            },
        )?;

        let migrations = self.apply_incremental(lock, site, source).await?;
        Ok(ResetReport {
            backup_id: backup.id,
            migrations,
        })
    }
}

pub(crate) fn database_url(site: &Site) -> Result<String> {
    site.database
        .as_ref()
        .ok_or_else(|| RolloutError::NoDatabase(site.domain.clone()))?
        .resolve()
}
