use crate::error::{Result, RolloutError};
use crate::lock::LockScope;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const STATE_DIR: &str = ".rollout";
pub const SITES_DIR: &str = ".rollout/sites";
pub const LOCKS_DIR: &str = ".rollout/locks";
pub const CONFIG_FILE: &str = ".rollout/config.yaml";

pub const SITE_FILE: &str = "site.yaml";
pub const TLS_FILE: &str = "tls.yaml";
pub const RELEASES_FILE: &str = "releases.yaml";
pub const MIGRATIONS_FILE: &str = "migrations.yaml";
pub const BACKUPS_FILE: &str = "backups.yaml";

// ---------------------------------------------------------------------------
// State paths
// ---------------------------------------------------------------------------

pub fn state_dir(root: &Path) -> PathBuf {
    root.join(STATE_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn sites_dir(root: &Path) -> PathBuf {
    root.join(SITES_DIR)
}

pub fn site_dir(root: &Path, domain: &str) -> PathBuf {
    sites_dir(root).join(domain)
}

pub fn site_file(root: &Path, domain: &str) -> PathBuf {
    site_dir(root, domain).join(SITE_FILE)
}

pub fn tls_file(root: &Path, domain: &str) -> PathBuf {
    site_dir(root, domain).join(TLS_FILE)
}

pub fn releases_file(root: &Path, domain: &str) -> PathBuf {
    site_dir(root, domain).join(RELEASES_FILE)
}

pub fn migrations_file(root: &Path, domain: &str) -> PathBuf {
    site_dir(root, domain).join(MIGRATIONS_FILE)
}

pub fn backups_file(root: &Path, domain: &str) -> PathBuf {
    site_dir(root, domain).join(BACKUPS_FILE)
}

pub fn journal_file(root: &Path, domain: &str, scope: LockScope) -> PathBuf {
    site_dir(root, domain).join(format!("journal-{scope}.yaml"))
}

pub fn lock_file(root: &Path, domain: &str, scope: LockScope) -> PathBuf {
    root.join(LOCKS_DIR).join(format!("{domain}.{scope}.lock"))
}

// ---------------------------------------------------------------------------
// Deploy paths
// ---------------------------------------------------------------------------

pub fn deploy_dir(deploy_root: &Path, domain: &str) -> PathBuf {
    deploy_root.join(domain)
}

pub fn release_dir(deploy_root: &Path, domain: &str, release_id: &str) -> PathBuf {
    deploy_dir(deploy_root, domain)
        .join("releases")
        .join(release_id)
}

/// The document root / working directory the proxy and supervisor point at.
pub fn current_link(deploy_root: &Path, domain: &str) -> PathBuf {
    deploy_dir(deploy_root, domain).join("current")
}

// ---------------------------------------------------------------------------
// Domain validation
// ---------------------------------------------------------------------------

static DOMAIN_RE: OnceLock<Regex> = OnceLock::new();

fn domain_re() -> &'static Regex {
    DOMAIN_RE.get_or_init(|| {
        Regex::new(r"^([a-z0-9]([a-z0-9\-]{0,61}[a-z0-9])?)(\.[a-z0-9]([a-z0-9\-]{0,61}[a-z0-9])?)*$")
            .unwrap()
    })
}

pub fn validate_domain(domain: &str) -> Result<()> {
    if domain.is_empty() || domain.len() > 253 || !domain_re().is_match(domain) {
        return Err(RolloutError::InvalidDomain(domain.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_domains() {
        for d in ["api.example.com", "front.example.com", "localhost", "a-b.c1.io"] {
            validate_domain(d).unwrap_or_else(|_| panic!("expected valid: {d}"));
        }
    }

    #[test]
    fn invalid_domains() {
        for d in ["", "-a.example.com", "a-.example.com", "UPPER.com", "a..b", "a b.com", "../etc"] {
            assert!(validate_domain(d).is_err(), "expected invalid: {d}");
        }
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/srv/ops");
        assert_eq!(
            site_file(root, "api.example.com"),
            PathBuf::from("/srv/ops/.rollout/sites/api.example.com/site.yaml")
        );
        assert_eq!(
            lock_file(root, "api.example.com", LockScope::Deploy),
            PathBuf::from("/srv/ops/.rollout/locks/api.example.com.deploy.lock")
        );
        assert_eq!(
            current_link(Path::new("/var/www"), "front.example.com"),
            PathBuf::from("/var/www/front.example.com/current")
        );
    }
}
