//! Edge DNS provider boundary.
//!
//! The provider is eventually consistent: a successful `set_proxy_mode` may
//! take a while to show up in `proxy_mode`. Callers poll (see `tls`).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::DnsConfig;
use crate::error::{Result, RolloutError};
use crate::types::ProxyMode;

#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn proxy_mode(&self, domain: &str) -> Result<ProxyMode>;
    async fn set_proxy_mode(&self, domain: &str, mode: ProxyMode) -> Result<()>;
}

/// Cloudflare v4 API client. Reads the API token from the environment on
/// every call so no credential outlives a single operation.
pub struct CloudflareDns {
    client: reqwest::Client,
    api_base: String,
    zone_id: Option<String>,
    token_env: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
    #[serde(rename = "type")]
    record_type: String,
    #[serde(default)]
    proxied: bool,
}

impl CloudflareDns {
    pub fn new(config: &DnsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            zone_id: config.zone_id.clone(),
            token_env: config.token_env.clone(),
        }
    }

    fn zone(&self) -> Result<&str> {
        self.zone_id
            .as_deref()
            .ok_or_else(|| RolloutError::Config("dns.zone_id is not set".to_string()))
    }

    fn token(&self) -> Result<String> {
        std::env::var(&self.token_env).map_err(|_| RolloutError::MissingEnv(self.token_env.clone()))
    }

    /// Proxiable records (A/AAAA/CNAME) for `domain`.
    async fn records(&self, domain: &str) -> Result<Vec<DnsRecord>> {
        let url = format!("{}/zones/{}/dns_records", self.api_base, self.zone()?);
        let resp = self
            .client
            .get(url)
            .bearer_auth(self.token()?)
            .query(&[("name", domain)])
            .send()
            .await?;
        let records: Vec<DnsRecord> = unwrap_response(resp).await?.unwrap_or_default();
        let records: Vec<DnsRecord> = records
            .into_iter()
            .filter(|r| matches!(r.record_type.as_str(), "A" | "AAAA" | "CNAME"))
            .collect();
        if records.is_empty() {
            return Err(RolloutError::external(
                "dns",
                format!("no A/AAAA/CNAME record for {domain}"),
            ));
        }
        Ok(records)
    }
}

async fn unwrap_response<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<Option<T>> {
    let status = resp.status();
    let body: ApiResponse<T> = match resp.json().await {
        Ok(body) => body,
        Err(e) => {
            return Err(RolloutError::External {
                system: "dns",
                message: format!("status {status}: {e}"),
                retryable: status.is_server_error(),
            })
        }
    };
    if !status.is_success() || !body.success {
        let detail = body
            .errors
            .iter()
            .map(|e| format!("{} ({})", e.message, e.code))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(RolloutError::External {
            system: "dns",
            message: format!("status {status}: {detail}"),
            retryable: status.is_server_error() || status.as_u16() == 429,
        });
    }
    Ok(body.result)
}

#[async_trait]
impl DnsProvider for CloudflareDns {
    async fn proxy_mode(&self, domain: &str) -> Result<ProxyMode> {
        let records = self.records(domain).await?;
        if records.iter().any(|r| r.proxied) {
            Ok(ProxyMode::Proxied)
        } else {
            Ok(ProxyMode::Direct)
        }
    }

    async fn set_proxy_mode(&self, domain: &str, mode: ProxyMode) -> Result<()> {
        let proxied = mode == ProxyMode::Proxied;
        let zone = self.zone()?.to_string();
        let token = self.token()?;
        for record in self.records(domain).await? {
            if record.proxied == proxied {
                continue;
            }
            let url = format!("{}/zones/{}/dns_records/{}", self.api_base, zone, record.id);
            let resp = self
                .client
                .patch(url)
                .bearer_auth(&token)
                .json(&json!({ "proxied": proxied }))
                .send()
                .await?;
            unwrap_response::<serde_json::Value>(resp).await?;
            tracing::info!(domain, record = %record.id, %mode, "dns record updated");
        }
        Ok(())
    }
}
