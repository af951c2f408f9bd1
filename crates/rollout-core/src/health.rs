//! Health-check gate used before a release is considered active.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backoff::{self, RetryPolicy};
use crate::error::{Result, RolloutError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthTarget {
    pub url: String,
    /// Sent as the Host header so a shared listener selects the right site.
    #[serde(default)]
    pub host: Option<String>,
    /// Connect here instead of resolving the URL's host, keeping the host
    /// for SNI and certificate checks.
    #[serde(default)]
    pub connect_to: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub passed: bool,
    pub attempts: u32,
    #[serde(default)]
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, target: &HealthTarget) -> Result<ProbeOutcome>;
}

/// Plain HTTP GET; any 2xx is healthy, anything else (including connection
/// errors while the process is still starting) is not ready yet.
///
/// Redirects are never followed: a 3xx means the origin under test did not
/// serve the page itself.
pub struct HttpProbe {
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Self::builder(timeout).build()?;
        Ok(Self { timeout, client })
    }

    fn builder(timeout: Duration) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
    }

    /// The shared client, or a pinned one when the target fixes its address.
    fn client_for(&self, target: &HealthTarget) -> Result<reqwest::Client> {
        let Some(addr) = target.connect_to else {
            return Ok(self.client.clone());
        };
        let url = reqwest::Url::parse(&target.url).map_err(|e| {
            RolloutError::Config(format!("invalid health check url {}: {e}", target.url))
        })?;
        let Some(host) = url.host_str() else {
            return Ok(self.client.clone());
        };
        Ok(Self::builder(self.timeout).resolve(host, addr).build()?)
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, target: &HealthTarget) -> Result<ProbeOutcome> {
        let client = self.client_for(target)?;
        let mut req = client.get(&target.url);
        if let Some(host) = &target.host {
            req = req.header(reqwest::header::HOST, host);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => Ok(ProbeOutcome::Healthy),
            Ok(resp) => Ok(ProbeOutcome::Unhealthy(format!("status {}", resp.status()))),
            Err(e) => Ok(ProbeOutcome::Unhealthy(e.to_string())),
        }
    }
}

/// Poll `target` until healthy or the policy is exhausted.
///
/// Exhaustion is not an error: the caller decides the compensating action
/// from `passed`. Only cancellation and probe failures surface as errors.
pub async fn wait_healthy(
    probe: &dyn HealthProbe,
    target: &HealthTarget,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<HealthCheckResult> {
    let mut schedule = policy.schedule();
    let mut last_detail = None;
    while schedule.begin_attempt() {
        match probe.probe(target).await? {
            ProbeOutcome::Healthy => {
                tracing::info!(url = %target.url, attempt = schedule.attempt(), "health check passed");
                return Ok(HealthCheckResult {
                    passed: true,
                    attempts: schedule.attempt(),
                    detail: None,
                    checked_at: Utc::now(),
                });
            }
            ProbeOutcome::Unhealthy(detail) => {
                tracing::debug!(url = %target.url, attempt = schedule.attempt(), %detail, "not ready");
                last_detail = Some(detail);
            }
        }
        match schedule.next_delay() {
            Some(delay) => backoff::sleep(cancel, delay).await?,
            None => break,
        }
    }
    tracing::warn!(url = %target.url, attempts = schedule.attempt(), "health check exhausted");
    Ok(HealthCheckResult {
        passed: false,
        attempts: schedule.attempt(),
        detail: last_detail,
        checked_at: Utc::now(),
    })
}
