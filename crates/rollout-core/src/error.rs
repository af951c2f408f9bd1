use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::lock::LockScope;
use crate::types::TlsState;

/// Pipeline stage at which a release failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Stage,
    Migration,
    Swap,
    HealthCheck,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureStage::Stage => "stage",
            FailureStage::Migration => "migration",
            FailureStage::Swap => "swap",
            FailureStage::HealthCheck => "health_check",
        })
    }
}

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("not initialized: run 'rollout init'")]
    NotInitialized,

    #[error("invalid domain '{0}': expected lowercase DNS labels")]
    InvalidDomain(String),

    #[error("invalid site spec for {domain}: {reason}")]
    InvalidSiteSpec { domain: String, reason: String },

    #[error("site not found: {0}")]
    SiteNotFound(String),

    #[error("release not found for {domain}: {id}")]
    ReleaseNotFound { domain: String, id: String },

    #[error("backup not found for {domain}: {id}")]
    BackupNotFound { domain: String, id: String },

    #[error("conflict for {domain}: {reason}")]
    Conflict { domain: String, reason: String },

    #[error("invalid TLS transition for {domain} from {from} to {to}")]
    InvalidTransition {
        domain: String,
        from: TlsState,
        to: TlsState,
    },

    #[error("DNS record for {0} is proxied; switch it to direct mode before issuing")]
    DnsNotDirect(String),

    /// `enable_proxy` before issuance completed. A precondition: nothing was
    /// attempted. `IssueTimeout` is the retryable outcome of a poll that ran
    /// out of time.
    #[error("certificate for {domain} is not verified yet (state: {state})")]
    CertificateNotVerified { domain: String, state: TlsState },

    #[error("{scope} operation already in progress for {domain}: {operation}")]
    AlreadyInProgress {
        domain: String,
        scope: LockScope,
        operation: String,
    },

    #[error("lock for {domain} ({scope}) is not held by this operation")]
    LockNotHeld { domain: String, scope: LockScope },

    #[error("{operation} is destructive: pass the domain as confirmation")]
    ConfirmationRequired { operation: String },

    #[error("confirmation does not match domain {0}")]
    ConfirmationMismatch(String),

    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("site {0} has no database configured")]
    NoDatabase(String),

    #[error("site {0} is static and has no supervised process")]
    NotAProcess(String),

    #[error("invalid migration file '{0}'")]
    InvalidMigration(String),

    #[error("certificate issuance for {domain} timed out after {waited_secs}s")]
    IssueTimeout { domain: String, waited_secs: u64 },

    #[error("certificate issuance for {domain} failed: {reason}")]
    IssueFailed { domain: String, reason: String },

    #[error("DNS change for {domain} did not propagate within {waited_secs}s")]
    DnsPropagationTimeout { domain: String, waited_secs: u64 },

    #[error("migration {version} failed: {cause}")]
    MigrationFailed { version: u64, cause: String },

    #[error("release {release} of {domain} failed at {stage}: {cause}")]
    ReleaseFailed {
        domain: String,
        release: String,
        stage: FailureStage,
        cause: String,
    },

    #[error("no rollback target for {0}: no release was ever active")]
    NoRollbackTarget(String),

    #[error("rollback of {domain} to {release} failed its health check; manual intervention required")]
    RollbackUnhealthy { domain: String, release: String },

    #[error("backup for {domain} could not be verified: {reason}")]
    BackupUnverified { domain: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{system} error: {message}")]
    External {
        system: &'static str,
        message: String,
        retryable: bool,
    },

    #[error("{0} not found on PATH")]
    ToolNotInstalled(String),

    #[error("missing environment variable {0}")]
    MissingEnv(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, RolloutError>;

/// Error taxonomy surfaced to callers as a machine-readable outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Failed before any side effect; fix the input and retry.
    Precondition,
    /// Safe to re-run as-is once the external condition clears.
    Retryable,
    /// A multi-step sequence failed and its compensating action ran.
    PartialFailure,
    /// Requires an operator; never retried automatically.
    Fatal,
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Retryable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Precondition => "precondition",
            ErrorKind::Retryable => "retryable",
            ErrorKind::PartialFailure => "partial_failure",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RolloutError {
    pub fn kind(&self) -> ErrorKind {
        use RolloutError::*;
        match self {
            NotInitialized
            | InvalidDomain(_)
            | InvalidSiteSpec { .. }
            | SiteNotFound(_)
            | ReleaseNotFound { .. }
            | BackupNotFound { .. }
            | Conflict { .. }
            | InvalidTransition { .. }
            | DnsNotDirect(_)
            | CertificateNotVerified { .. }
            | ConfirmationRequired { .. }
            | ConfirmationMismatch(_)
            | InvalidArtifact(_)
            | NoDatabase(_)
            | NotAProcess(_)
            | InvalidMigration(_)
            | ToolNotInstalled(_)
            | MissingEnv(_)
            | Config(_) => ErrorKind::Precondition,
            AlreadyInProgress { .. }
            | IssueTimeout { .. }
            | DnsPropagationTimeout { .. }
            | Cancelled
            | Http(_) => ErrorKind::Retryable,
            External { retryable, .. } => {
                if *retryable {
                    ErrorKind::Retryable
                } else {
                    ErrorKind::Internal
                }
            }
            IssueFailed { .. } | MigrationFailed { .. } | ReleaseFailed { .. } => {
                ErrorKind::PartialFailure
            }
            NoRollbackTarget(_) | RollbackUnhealthy { .. } | BackupUnverified { .. } => {
                ErrorKind::Fatal
            }
            LockNotHeld { .. } | Io(_) | Yaml(_) | Json(_) => ErrorKind::Internal,
        }
    }

    /// Stable snake_case identifier for scripts and JSON output.
    pub fn code(&self) -> &'static str {
        use RolloutError::*;
        match self {
            NotInitialized => "not_initialized",
            InvalidDomain(_) => "invalid_domain",
            InvalidSiteSpec { .. } => "invalid_site_spec",
            SiteNotFound(_) | ReleaseNotFound { .. } | BackupNotFound { .. } => "not_found",
            Conflict { .. } => "conflict",
            InvalidTransition { .. } => "invalid_transition",
            DnsNotDirect(_) => "dns_not_direct",
            // Issuance still pending when the proxy flip was asked for.
            // Not `issue_timeout`: no poll ran, and retrying will not help
            // until `tls poll` succeeds.
            CertificateNotVerified { .. } => "certificate_not_verified",
            AlreadyInProgress { .. } => "already_in_progress",
            LockNotHeld { .. } => "lock_not_held",
            ConfirmationRequired { .. } => "confirmation_required",
            ConfirmationMismatch(_) => "confirmation_mismatch",
            InvalidArtifact(_) => "invalid_artifact",
            NoDatabase(_) => "no_database",
            NotAProcess(_) => "not_a_process",
            InvalidMigration(_) => "invalid_migration",
            IssueTimeout { .. } => "issue_timeout",
            IssueFailed { .. } => "issue_failed",
            DnsPropagationTimeout { .. } => "dns_propagation_timeout",
            MigrationFailed { .. } => "migration_failed",
            ReleaseFailed { .. } => "release_failed",
            NoRollbackTarget(_) => "no_rollback_target",
            RollbackUnhealthy { .. } => "rollback_unhealthy",
            BackupUnverified { .. } => "backup_unverified",
            Cancelled => "cancelled",
            External { .. } => "external",
            ToolNotInstalled(_) => "tool_not_installed",
            MissingEnv(_) => "missing_env",
            Config(_) => "config",
            Io(_) => "io",
            Yaml(_) => "yaml",
            Json(_) => "json",
            Http(_) => "http",
        }
    }

    pub(crate) fn external(system: &'static str, message: impl Into<String>) -> Self {
        RolloutError::External {
            system,
            message: message.into(),
            retryable: false,
        }
    }

    pub(crate) fn transient(system: &'static str, message: impl Into<String>) -> Self {
        RolloutError::External {
            system,
            message: message.into(),
            retryable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_matches_error_families() {
        assert_eq!(
            RolloutError::DnsNotDirect("a.example.com".into()).kind(),
            ErrorKind::Precondition
        );
        assert!(RolloutError::IssueTimeout {
            domain: "a.example.com".into(),
            waited_secs: 5
        }
        .kind()
        .is_retryable());
        assert_eq!(
            RolloutError::NoRollbackTarget("a.example.com".into()).kind(),
            ErrorKind::Fatal
        );
        assert_eq!(
            RolloutError::ReleaseFailed {
                domain: "a.example.com".into(),
                release: "0002-abc".into(),
                stage: FailureStage::Migration,
                cause: "boom".into(),
            }
            .kind(),
            ErrorKind::PartialFailure
        );
    }

    #[test]
    fn enable_before_issuance_is_not_a_timeout() {
        let early = RolloutError::CertificateNotVerified {
            domain: "a.example.com".into(),
            state: TlsState::Issuing,
        };
        let timeout = RolloutError::IssueTimeout {
            domain: "a.example.com".into(),
            waited_secs: 600,
        };
        assert_eq!(early.kind(), ErrorKind::Precondition);
        assert_eq!(early.code(), "certificate_not_verified");
        assert_eq!(timeout.kind(), ErrorKind::Retryable);
    }

    #[test]
    fn codes_are_shared_for_not_found() {
        let a = RolloutError::SiteNotFound("x.example.com".into());
        let b = RolloutError::BackupNotFound {
            domain: "x.example.com".into(),
            id: "b1".into(),
        };
        assert_eq!(a.code(), "not_found");
        assert_eq!(b.code(), "not_found");
    }
}
