use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::HealthCheckResult;
use crate::types::ReleaseStatus;

/// One content-addressed artifact activation for a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    /// `<seq:04>-<digest prefix>`; sorts in creation order.
    pub id: String,
    pub seq: u64,
    pub site_domain: String,
    pub artifact_digest: String,
    pub status: ReleaseStatus,
    #[serde(default)]
    pub health_check_result: Option<HealthCheckResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,
}

impl Release {
    pub fn new(domain: &str, seq: u64, digest: &str) -> Self {
        let prefix: String = digest.chars().take(12).collect();
        Self {
            id: format!("{seq:04}-{prefix}"),
            seq,
            site_domain: domain.to_string(),
            artifact_digest: digest.to_string(),
            status: ReleaseStatus::Staged,
            health_check_result: None,
            created_at: Utc::now(),
            activated_at: None,
        }
    }
}

/// Per-site release ledger persisted as `releases.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseLedger {
    #[serde(default)]
    pub next_seq: u64,
    /// Release the `current` link points at.
    #[serde(default)]
    pub current: Option<String>,
    #[serde(default)]
    pub releases: Vec<Release>,
}

impl ReleaseLedger {
    pub fn get(&self, id: &str) -> Option<&Release> {
        self.releases.iter().find(|r| r.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Release> {
        self.releases.iter_mut().find(|r| r.id == id)
    }

    pub fn by_digest(&self, digest: &str) -> Option<&Release> {
        self.releases.iter().find(|r| r.artifact_digest == digest)
    }

    pub fn active(&self) -> Option<&Release> {
        self.releases
            .iter()
            .find(|r| r.status == ReleaseStatus::Active)
    }

    /// Most recently activated release that was replaced by a newer one.
    pub fn last_superseded(&self) -> Option<&Release> {
        self.releases
            .iter()
            .filter(|r| r.status == ReleaseStatus::Superseded)
            .max_by_key(|r| (r.activated_at, r.seq))
    }

    /// The last known-good release to fall back to, excluding `current`.
    ///
    /// If `current` never became active (a failed swap), the active release
    /// is the target; otherwise the most recently superseded one.
    pub fn rollback_target(&self) -> Option<&Release> {
        let current = self.current.as_deref();
        match self.active() {
            Some(active) if Some(active.id.as_str()) != current => Some(active),
            _ => self
                .last_superseded()
                .filter(|r| Some(r.id.as_str()) != current),
        }
    }

    /// Append a new staged release, or return the existing one for `digest`.
    /// The boolean is true when a new record was created.
    pub(crate) fn stage(&mut self, domain: &str, digest: &str) -> (Release, bool) {
        if let Some(existing) = self.releases.iter_mut().find(|r| r.artifact_digest == digest) {
            if matches!(
                existing.status,
                ReleaseStatus::RolledBack | ReleaseStatus::Superseded
            ) {
                existing.status = ReleaseStatus::Staged;
                existing.health_check_result = None;
            }
            return (existing.clone(), false);
        }
        self.next_seq += 1;
        let release = Release::new(domain, self.next_seq, digest);
        self.releases.push(release.clone());
        (release, true)
    }

    /// Make `id` the single active release; the previous active one becomes
    /// superseded. Both happen in the same ledger write.
    pub(crate) fn promote(&mut self, id: &str) -> bool {
        if self.get(id).is_none() {
            return false;
        }
        let now = Utc::now();
        for release in &mut self.releases {
            if release.id == id {
                release.status = ReleaseStatus::Active;
                release.activated_at = Some(now);
            } else if release.status == ReleaseStatus::Active {
                release.status = ReleaseStatus::Superseded;
            }
        }
        true
    }

    pub fn count_active(&self) -> usize {
        self.releases
            .iter()
            .filter(|r| r.status == ReleaseStatus::Active)
            .count()
    }
}
