//! Delivery of usage updates to display destinations.
//!
//! A destination may announce readiness after the first update is produced,
//! so "not ready" is retried on a fixed delay. Any other failure is returned
//! at once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::stats::RelayStats;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("destination {destination} is not listening")]
    NotReady { destination: String },
    #[error("delivery to {destination} failed: {reason:#}")]
    Other {
        destination: String,
        reason: anyhow::Error,
    },
}

impl SendError {
    pub fn is_not_ready(&self) -> bool {
        matches!(self, SendError::NotReady { .. })
    }
}

/// Acknowledgement returned by a destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack(pub Value);

#[async_trait]
pub trait DestinationSink: Send + Sync {
    async fn send(&self, destination: &str, payload: &Value) -> Result<Ack, SendError>;
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_DELAY,
        }
    }
}

pub struct ReliableNotifier {
    sink: Arc<dyn DestinationSink>,
    config: NotifierConfig,
    stats: Arc<RelayStats>,
}

impl ReliableNotifier {
    pub fn new(sink: Arc<dyn DestinationSink>, config: NotifierConfig, stats: Arc<RelayStats>) -> Self {
        Self { sink, config, stats }
    }

    pub async fn deliver(&self, destination: &str, payload: &Value) -> Result<Option<Ack>, SendError> {
        self.deliver_with(destination, payload, self.config.max_attempts, self.config.delay)
            .await
    }

    /// Send `payload`, retrying only while the destination is not ready.
    ///
    /// Returns `Ok(None)` once `max_attempts` sends have all been refused.
    pub async fn deliver_with(
        &self,
        destination: &str,
        payload: &Value,
        max_attempts: u32,
        delay: Duration,
    ) -> Result<Option<Ack>, SendError> {
        for attempt in 1..=max_attempts {
            match self.sink.send(destination, payload).await {
                Ok(ack) => {
                    RelayStats::inc(&self.stats.deliveries_ok);
                    tracing::debug!(destination, attempt, "update delivered");
                    return Ok(Some(ack));
                }
                Err(SendError::NotReady { .. }) => {
                    if attempt == max_attempts {
                        break;
                    }
                    RelayStats::inc(&self.stats.delivery_retries);
                    tracing::warn!(destination, attempt, max_attempts, "destination not ready, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    RelayStats::inc(&self.stats.deliveries_failed);
                    return Err(e);
                }
            }
        }
        RelayStats::inc(&self.stats.deliveries_exhausted);
        tracing::warn!(destination, max_attempts, "destination never became ready, giving up");
        Ok(None)
    }
}
