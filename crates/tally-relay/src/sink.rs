use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;

use crate::notifier::{Ack, DestinationSink, SendError};
use crate::readiness::ReadyRegistry;

fn classify_reqwest_error(error: &reqwest::Error) -> &'static str {
    if error.is_timeout() {
        return "timeout";
    }
    if error.is_connect() {
        return "connect";
    }
    "other"
}

/// Posts updates to the callback URL each destination announced when it
/// became ready.
pub struct HttpSink {
    http: reqwest::Client,
    registry: Arc<ReadyRegistry>,
}

impl HttpSink {
    pub fn new(registry: Arc<ReadyRegistry>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(timeout)
            .build()
            .context("failed to build sink http client")?;
        Ok(Self { http, registry })
    }
}

#[async_trait]
impl DestinationSink for HttpSink {
    async fn send(&self, destination: &str, payload: &Value) -> Result<Ack, SendError> {
        let not_ready = || SendError::NotReady {
            destination: destination.to_string(),
        };
        let other = |reason: anyhow::Error| SendError::Other {
            destination: destination.to_string(),
            reason,
        };

        let info = self.registry.get(destination).ok_or_else(not_ready)?;
        let url = info
            .callback_url
            .ok_or_else(|| other(anyhow::anyhow!("destination has no callback url")))?;

        let resp = match self.http.post(&url).json(payload).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_connect() => {
                tracing::debug!(destination, error=%e, "callback refused connection");
                return Err(not_ready());
            }
            Err(e) => {
                let kind = classify_reqwest_error(&e);
                return Err(other(anyhow::Error::new(e).context(format!("{kind} error posting to {url}"))));
            }
        };

        let status = resp.status();
        if !status.is_success() {
            return Err(other(anyhow::anyhow!("callback returned {status}")));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| other(anyhow::Error::new(e).context("reading callback response")))?;
        if bytes.is_empty() {
            return Ok(Ack(Value::Null));
        }
        let ack = serde_json::from_slice(&bytes)
            .map_err(|e| other(anyhow::Error::new(e).context("callback returned non-json ack")))?;
        Ok(Ack(ack))
    }
}
