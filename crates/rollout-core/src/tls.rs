//! TLS Coordinator: the DNS-mode / certificate-issuance state machine.
//!
//! ```text
//! dns_only --begin_issue--> issuing --poll_issue--> issued_verified --enable_proxy--> proxied
//!    ^                         |
//!    +------ issue failed -----+
//! ```
//!
//! Every transition runs under the domain's TLS lock. `force_unproxy` is the
//! only way back from `issued_verified` or `proxied` and is never called by
//! automated flows.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backoff::{self, RetryPolicy};
use crate::certs::{CertificateIssuer, IssueStatus};
use crate::dns::DnsProvider;
use crate::error::{Result, RolloutError};
use crate::lock::{LockGuard, LockScope};
use crate::registry::Registry;
use crate::types::{ProxyMode, TlsState};

#[derive(Clone)]
pub struct TlsCoordinator {
    registry: Registry,
    dns: Arc<dyn DnsProvider>,
    issuer: Arc<dyn CertificateIssuer>,
    issue_poll: RetryPolicy,
    propagation_poll: RetryPolicy,
}

impl TlsCoordinator {
    pub fn new(
        registry: Registry,
        dns: Arc<dyn DnsProvider>,
        issuer: Arc<dyn CertificateIssuer>,
        issue_poll: RetryPolicy,
        propagation_poll: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            dns,
            issuer,
            issue_poll,
            propagation_poll,
        }
    }

    /// `dns_only → issuing`. The DNS record must resolve directly to the
    /// origin, or the CA cannot validate the domain.
    pub async fn begin_issue(&self, lock: &LockGuard, domain: &str) -> Result<TlsState> {
        lock.ensure(domain, LockScope::Tls)?;
        let state = self.registry.get(domain)?.tls_state;
        match state {
            TlsState::Issuing => {
                tracing::info!(domain, "issuance already in flight");
                return Ok(state);
            }
            TlsState::DnsOnly => {}
            other => {
                return Err(RolloutError::InvalidTransition {
                    domain: domain.to_string(),
                    from: other,
                    to: TlsState::Issuing,
                })
            }
        }

        if self.dns.proxy_mode(domain).await? != ProxyMode::Direct {
            return Err(RolloutError::DnsNotDirect(domain.to_string()));
        }

        self.registry
            .update_tls_state(lock, domain, TlsState::Issuing)?;
        if let Err(e) = self.issuer.request(domain).await {
            tracing::warn!(domain, "certificate request failed, reverting to dns_only: {e}");
            self.registry
                .update_tls_state(lock, domain, TlsState::DnsOnly)?;
            return Err(e);
        }
        Ok(TlsState::Issuing)
    }

    /// `issuing → issued_verified`, polling the issuer on the backoff
    /// schedule. A deadline or cancellation leaves the state at `issuing`
    /// so the poll can be resumed; a reported failure reverts to `dns_only`.
    pub async fn poll_issue(
        &self,
        lock: &LockGuard,
        domain: &str,
        cancel: &CancellationToken,
    ) -> Result<TlsState> {
        lock.ensure(domain, LockScope::Tls)?;
        let state = self.registry.get(domain)?.tls_state;
        match state {
            TlsState::Issuing => {}
            TlsState::IssuedVerified | TlsState::Proxied => return Ok(state),
            TlsState::DnsOnly => {
                return Err(RolloutError::InvalidTransition {
                    domain: domain.to_string(),
                    from: state,
                    to: TlsState::IssuedVerified,
                })
            }
        }

        let mut schedule = self.issue_poll.schedule();
        while schedule.begin_attempt() {
            match self.issuer.status(domain).await? {
                IssueStatus::Issued { fullchain } => {
                    tracing::info!(domain, attempt = schedule.attempt(), fullchain = %fullchain.display(), "certificate issued");
                    self.registry
                        .update_tls_state(lock, domain, TlsState::IssuedVerified)?;
                    return Ok(TlsState::IssuedVerified);
                }
                IssueStatus::Failed { reason } => {
                    tracing::warn!(domain, %reason, "issuance failed, reverting to dns_only");
                    self.registry
                        .update_tls_state(lock, domain, TlsState::DnsOnly)?;
                    return Err(RolloutError::IssueFailed {
                        domain: domain.to_string(),
                        reason,
                    });
                }
                IssueStatus::Pending => {
                    tracing::debug!(domain, attempt = schedule.attempt(), "issuance pending");
                }
            }
            match schedule.next_delay() {
                Some(delay) => backoff::sleep(cancel, delay).await?,
                None => break,
            }
        }
        Err(RolloutError::IssueTimeout {
            domain: domain.to_string(),
            waited_secs: schedule.elapsed().as_secs(),
        })
    }

    /// `issued_verified → proxied`. Flips the DNS record and waits until the
    /// provider reports the new mode before recording it.
    pub async fn enable_proxy(
        &self,
        lock: &LockGuard,
        domain: &str,
        cancel: &CancellationToken,
    ) -> Result<TlsState> {
        lock.ensure(domain, LockScope::Tls)?;
        let state = self.registry.get(domain)?.tls_state;
        match state {
            TlsState::IssuedVerified => {}
            TlsState::Proxied => return Ok(state),
            TlsState::DnsOnly | TlsState::Issuing => {
                return Err(RolloutError::CertificateNotVerified {
                    domain: domain.to_string(),
                    state,
                })
            }
        }

        self.dns.set_proxy_mode(domain, ProxyMode::Proxied).await?;
        self.wait_for_mode(domain, ProxyMode::Proxied, cancel).await?;
        self.registry
            .update_tls_state(lock, domain, TlsState::Proxied)?;
        Ok(TlsState::Proxied)
    }

    /// Manual recovery: DNS back to direct and the state to `dns_only`.
    /// Returns the state it replaced.
    pub async fn force_unproxy(&self, lock: &LockGuard, domain: &str) -> Result<TlsState> {
        lock.ensure(domain, LockScope::Tls)?;
        self.registry.get(domain)?;
        self.dns.set_proxy_mode(domain, ProxyMode::Direct).await?;
        self.registry.force_dns_only(lock, domain)
    }

    async fn wait_for_mode(
        &self,
        domain: &str,
        mode: ProxyMode,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut schedule = self.propagation_poll.schedule();
        while schedule.begin_attempt() {
            let seen = self.dns.proxy_mode(domain).await?;
            if seen == mode {
                tracing::info!(domain, %mode, attempt = schedule.attempt(), "dns change visible");
                return Ok(());
            }
            tracing::debug!(domain, %seen, attempt = schedule.attempt(), "waiting for dns propagation");
            match schedule.next_delay() {
                Some(delay) => backoff::sleep(cancel, delay).await?,
                None => break,
            }
        }
        Err(RolloutError::DnsPropagationTimeout {
            domain: domain.to_string(),
            waited_secs: schedule.elapsed().as_secs(),
        })
    }
}
