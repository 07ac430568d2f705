//! Seam to the external usage service that counts conversation tokens.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Conversation usage as reported by the usage source, before profile overhead.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BaseUsage {
    pub length: u64,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cache_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub auxiliary_id: Option<String>,
    #[serde(default)]
    pub settings: serde_json::Map<String, Value>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Base usage for a conversation; `Ok(None)` when the source has no data.
    async fn derive_base(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        is_fresh_message: bool,
        body: Option<&Value>,
    ) -> Result<Option<BaseUsage>>;

    /// Fixed per-tenant token overhead (system prompt, enabled features, profile).
    async fn profile_overhead_tokens(&self, tenant_id: &str) -> Result<u64>;
}

#[derive(Debug, Serialize)]
struct DeriveRequest<'a> {
    tenant_id: &'a str,
    conversation_id: &'a str,
    is_fresh_message: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a Value>,
}

#[derive(Debug, Deserialize)]
struct OverheadResponse {
    tokens: u64,
}

/// HTTP client for a usage service exposing
/// `POST /v1/usage/derive` and `GET /v1/usage/profile_overhead`.
#[derive(Debug, Clone)]
pub struct HttpUsageSource {
    http: reqwest::Client,
    base_url: String,
}

impl HttpUsageSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(timeout)
            .build()
            .context("failed to build usage http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl UsageSource for HttpUsageSource {
    async fn derive_base(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        is_fresh_message: bool,
        body: Option<&Value>,
    ) -> Result<Option<BaseUsage>> {
        let url = format!("{}/v1/usage/derive", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&DeriveRequest {
                tenant_id,
                conversation_id,
                is_fresh_message,
                body,
            })
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        match resp.status() {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let usage = resp
                    .json::<Option<BaseUsage>>()
                    .await
                    .context("invalid derive response")?;
                Ok(usage)
            }
            status => anyhow::bail!("usage service returned {status} for {conversation_id}"),
        }
    }

    async fn profile_overhead_tokens(&self, tenant_id: &str) -> Result<u64> {
        let url = format!("{}/v1/usage/profile_overhead", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("tenant_id", tenant_id)])
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()?;
        let overhead: OverheadResponse = resp.json().await.context("invalid overhead response")?;
        Ok(overhead.tokens)
    }
}
