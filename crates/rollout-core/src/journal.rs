//! Operation journal for crash recovery.
//!
//! Every locked command records a `Running` entry before doing any work and
//! finalizes it on the way out. A process that dies mid-operation leaves its
//! entry `Running`; the next holder of the same lock scope marks it
//! `Interrupted` so `status` can tell the operator which step to inspect.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RolloutError};
use crate::io;
use crate::lock::{LockGuard, LockScope};
use crate::paths;

/// Entries kept per journal; older ones are dropped on write.
pub const MAX_ENTRIES: usize = 200;

/// Transitions: `Running → Completed | Failed | Interrupted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Completed,
    Failed { code: String, reason: String },
    /// The holder exited without finalizing the entry.
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JournalFile {
    #[serde(default)]
    operations: Vec<Operation>,
}

#[derive(Debug, Clone)]
pub struct Journal {
    root: PathBuf,
}

impl Journal {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Oldest first.
    pub fn list(&self, domain: &str, scope: LockScope) -> Result<Vec<Operation>> {
        Ok(self.load(domain, scope)?.operations)
    }

    /// Mark entries left `Running` by a crashed holder as `Interrupted`.
    /// Returns the number of recovered entries.
    pub fn recover(&self, lock: &LockGuard) -> Result<u32> {
        let mut recovered = 0;
        self.mutate(lock, |file| {
            for op in file
                .operations
                .iter_mut()
                .filter(|op| op.status == OperationStatus::Running)
            {
                tracing::warn!(
                    domain = lock.domain(),
                    scope = %lock.scope(),
                    command = %op.command,
                    started_at = %op.started_at,
                    "previous operation was interrupted"
                );
                op.status = OperationStatus::Interrupted;
                op.finished_at = Some(Utc::now());
                recovered += 1;
            }
        })?;
        Ok(recovered)
    }

    /// Record the start of the lock holder's operation.
    pub fn begin(&self, lock: &LockGuard, target: Option<&str>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.mutate(lock, |file| {
            file.operations.push(Operation {
                id,
                command: lock.operation().to_string(),
                target: target.map(str::to_string),
                status: OperationStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
            });
        })?;
        Ok(id)
    }

    pub fn finish<T>(&self, lock: &LockGuard, id: Uuid, outcome: &Result<T>) -> Result<()> {
        let status = match outcome {
            Ok(_) => OperationStatus::Completed,
            Err(e) => failed(e),
        };
        self.mutate(lock, |file| {
            if let Some(op) = file.operations.iter_mut().find(|op| op.id == id) {
                op.status = status;
                op.finished_at = Some(Utc::now());
            }
        })
    }

    fn load(&self, domain: &str, scope: LockScope) -> Result<JournalFile> {
        Ok(io::read_yaml(&paths::journal_file(&self.root, domain, scope))?.unwrap_or_default())
    }

    fn mutate(&self, lock: &LockGuard, f: impl FnOnce(&mut JournalFile)) -> Result<()> {
        let mut file = self.load(lock.domain(), lock.scope())?;
        f(&mut file);
        if file.operations.len() > MAX_ENTRIES {
            let excess = file.operations.len() - MAX_ENTRIES;
            file.operations.drain(..excess);
        }
        io::write_yaml(
            &paths::journal_file(&self.root, lock.domain(), lock.scope()),
            &file,
        )
    }
}

fn failed(e: &RolloutError) -> OperationStatus {
    OperationStatus::Failed {
        code: e.code().to_string(),
        reason: e.to_string(),
    }
}
