use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// SiteKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteKind {
    /// A built asset bundle served straight from the document root.
    Static,
    /// A long-running backend process behind a reverse proxy.
    Process,
}

impl SiteKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SiteKind::Static => "static",
            SiteKind::Process => "process",
        }
    }
}

impl fmt::Display for SiteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SiteKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(SiteKind::Static),
            "process" => Ok(SiteKind::Process),
            _ => Err(format!("unknown site kind '{s}' (expected static or process)")),
        }
    }
}

// ---------------------------------------------------------------------------
// TlsState
// ---------------------------------------------------------------------------

/// Certificate / edge-proxy state of a domain.
///
/// Automated transitions: `DnsOnly → Issuing → IssuedVerified → Proxied`,
/// plus `Issuing → DnsOnly` when issuance fails. Manual recovery may force
/// any state back to `DnsOnly`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsState {
    DnsOnly,
    Issuing,
    IssuedVerified,
    Proxied,
}

impl TlsState {
    pub fn as_str(self) -> &'static str {
        match self {
            TlsState::DnsOnly => "dns_only",
            TlsState::Issuing => "issuing",
            TlsState::IssuedVerified => "issued_verified",
            TlsState::Proxied => "proxied",
        }
    }

    /// Whether an automated flow may move from `self` to `next`.
    pub fn can_transition_to(self, next: TlsState) -> bool {
        matches!(
            (self, next),
            (TlsState::DnsOnly, TlsState::Issuing)
                | (TlsState::Issuing, TlsState::IssuedVerified)
                | (TlsState::Issuing, TlsState::DnsOnly)
                | (TlsState::IssuedVerified, TlsState::Proxied)
        )
    }

    /// A certificate exists on disk and the proxy may serve HTTPS.
    pub fn has_certificate(self) -> bool {
        matches!(self, TlsState::IssuedVerified | TlsState::Proxied)
    }
}

impl fmt::Display for TlsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ProxyMode
// ---------------------------------------------------------------------------

/// Edge DNS mode: direct resolution to the origin, or through the CDN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    Direct,
    Proxied,
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProxyMode::Direct => "direct",
            ProxyMode::Proxied => "proxied",
        })
    }
}

// ---------------------------------------------------------------------------
// ReleaseStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Staged,
    Active,
    /// Was active, replaced by a newer healthy release. Rollback target.
    Superseded,
    RolledBack,
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReleaseStatus::Staged => "staged",
            ReleaseStatus::Active => "active",
            ReleaseStatus::Superseded => "superseded",
            ReleaseStatus::RolledBack => "rolled_back",
        })
    }
}

// ---------------------------------------------------------------------------
// MigrationMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    Incremental,
    DestructiveReset,
    Restored,
}

impl fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MigrationMode::Incremental => "incremental",
            MigrationMode::DestructiveReset => "destructive_reset",
            MigrationMode::Restored => "restored",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_transition_table() {
        use TlsState::*;
        assert!(DnsOnly.can_transition_to(Issuing));
        assert!(Issuing.can_transition_to(IssuedVerified));
        assert!(Issuing.can_transition_to(DnsOnly));
        assert!(IssuedVerified.can_transition_to(Proxied));

        assert!(!Issuing.can_transition_to(Proxied));
        assert!(!DnsOnly.can_transition_to(Proxied));
        assert!(!Proxied.can_transition_to(DnsOnly));
        assert!(!IssuedVerified.can_transition_to(DnsOnly));
    }

    #[test]
    fn site_kind_parses() {
        assert_eq!("process".parse::<SiteKind>().unwrap(), SiteKind::Process);
        assert!("lambda".parse::<SiteKind>().is_err());
    }
}
