//! Correlates outgoing chat completions with the conversation fetch that
//! follows them, turns each into a usage result, and pushes it to the
//! display destination that asked.
//!
//! Outgoing requests are recorded immediately in a persisted correlation
//! cache. Completed fetches are processed one at a time on a
//! [`SequentialExecutor`]; each task derives usage, delivers the update, and
//! only then drops the correlation entry it consumed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tally_common::{ConversationKey, PendingRequest, UsageResult};
use tally_meta::MetaStore;

pub mod correlation;
pub mod error;
pub mod executor;
pub mod intercept;
pub mod notifier;
pub mod processor;
pub mod readiness;
pub mod sink;
pub mod stats;
pub mod usage;

pub use correlation::{CorrelationCache, TenantRegistry};
pub use error::{InterceptError, ProcessError, RelayError};
pub use executor::{ExecutorConfig, SequentialExecutor, LOCK_TIMEOUT};
pub use intercept::{parse_request_body, CompletedExchange, InterceptConfig, Interceptor, OutgoingExchange};
pub use notifier::{Ack, DestinationSink, NotifierConfig, ReliableNotifier, SendError};
pub use processor::{Processed, ResponseProcessor};
pub use readiness::{DestinationInfo, ReadyRegistry};
pub use sink::HttpSink;
pub use stats::RelayStats;
pub use usage::{BaseUsage, HttpUsageSource, UsageSource};

/// Message type the display layer listens for.
pub const UPDATE_MESSAGE_TYPE: &str = "updateConversationData";

#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub intercept: InterceptConfig,
    pub executor: ExecutorConfig,
    pub notifier: NotifierConfig,
    /// Leak guard for requests whose conversation fetch is never seen.
    pub pending_ttl: Option<Duration>,
}

/// Wrap a usage result in the update envelope sent to destinations.
pub fn conversation_update(result: &UsageResult) -> serde_json::Result<Value> {
    Ok(json!({
        "type": UPDATE_MESSAGE_TYPE,
        "data": { "conversationData": serde_json::to_value(result)? },
    }))
}

pub struct Relay {
    interceptor: Interceptor,
    cache: Arc<CorrelationCache>,
    tenants: TenantRegistry,
    processor: Arc<ResponseProcessor>,
    notifier: Arc<ReliableNotifier>,
    executor: SequentialExecutor,
    stats: Arc<RelayStats>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("executor", &self.executor)
            .finish()
    }
}

impl Relay {
    /// Must be called from within a tokio runtime; spawns the executor actor.
    pub fn new(
        config: RelayConfig,
        backend: Arc<dyn MetaStore>,
        usage: Arc<dyn UsageSource>,
        sink: Arc<dyn DestinationSink>,
    ) -> Arc<Self> {
        let stats = Arc::new(RelayStats::default());
        let cache = Arc::new(CorrelationCache::new(backend.clone(), config.pending_ttl));
        let processor = Arc::new(ResponseProcessor::new(
            cache.clone(),
            usage,
            config.intercept.default_model.clone(),
        ));
        let notifier = Arc::new(ReliableNotifier::new(sink, config.notifier, stats.clone()));
        let executor = SequentialExecutor::spawn(config.executor, stats.clone());

        Arc::new(Self {
            interceptor: Interceptor::new(config.intercept),
            cache,
            tenants: TenantRegistry::new(backend),
            processor,
            notifier,
            executor,
            stats,
        })
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    /// Record the pending request behind an outgoing completion.
    ///
    /// Returns the conversation key when the exchange was a completion,
    /// `None` when it is not something the relay tracks.
    pub async fn on_outgoing(
        &self,
        exchange: &OutgoingExchange,
    ) -> Result<Option<ConversationKey>, RelayError> {
        let Some(key) = self
            .interceptor
            .classify_outgoing(&exchange.url, &exchange.method)?
        else {
            return Ok(None);
        };
        RelayStats::inc(&self.stats.outgoing_observed);

        self.tenants.record(key.tenant_id()).await?;
        let body = exchange.body.as_deref().and_then(parse_request_body);
        let request = self
            .interceptor
            .pending_request(&key, &exchange.origin_id, body.as_ref(), Utc::now());
        tracing::info!(
            %key,
            origin = %request.origin_id,
            model = %request.declared_model,
            tools = request.tool_declarations.len(),
            "pending request recorded"
        );
        self.cache.set(&key, request).await?;
        Ok(Some(key))
    }

    /// Queue processing of a completed conversation fetch.
    pub async fn on_completed(
        &self,
        exchange: CompletedExchange,
    ) -> Result<Option<ConversationKey>, RelayError> {
        let Some(key) = self
            .interceptor
            .classify_completed(&exchange.url, &exchange.method)?
        else {
            return Ok(None);
        };
        RelayStats::inc(&self.stats.completed_observed);
        self.tenants.record(key.tenant_id()).await?;

        let task = CompletionTask {
            processor: self.processor.clone(),
            notifier: self.notifier.clone(),
            cache: self.cache.clone(),
            stats: self.stats.clone(),
            key: key.clone(),
            exchange,
        };
        self.executor
            .enqueue(format!("completed {key}"), move || task.run())?;
        Ok(Some(key))
    }

    /// Queue a recompute of `key` delivered to `origin_id`, without touching
    /// the correlation cache.
    pub fn request_refresh(&self, key: ConversationKey, origin_id: String) -> Result<(), RelayError> {
        let task = RefreshTask {
            processor: self.processor.clone(),
            notifier: self.notifier.clone(),
            stats: self.stats.clone(),
            key,
            origin_id,
        };
        self.executor
            .enqueue(format!("refresh {}", task.key), move || task.run())?;
        Ok(())
    }

    pub async fn known_tenants(&self) -> Result<Vec<(String, DateTime<Utc>)>, RelayError> {
        Ok(self.tenants.list().await?)
    }

    pub async fn pending(&self) -> Result<Vec<(ConversationKey, PendingRequest)>, RelayError> {
        Ok(self.cache.entries().await?)
    }
}

struct CompletionTask {
    processor: Arc<ResponseProcessor>,
    notifier: Arc<ReliableNotifier>,
    cache: Arc<CorrelationCache>,
    stats: Arc<RelayStats>,
    key: ConversationKey,
    exchange: CompletedExchange,
}

impl CompletionTask {
    async fn run(self) -> anyhow::Result<()> {
        let key = &self.key;
        let processed = match self.processor.process(key, &self.exchange).await {
            Ok(processed) => processed,
            Err(ProcessError::NoData) => {
                RelayStats::inc(&self.stats.no_data);
                tracing::warn!(%key, "no usage data, keeping pending request");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // A matched update goes to whoever sent the completion.
        let destination = processed
            .matched
            .as_ref()
            .map_or(self.exchange.origin_id.as_str(), |p| p.origin_id.as_str());
        let payload = conversation_update(&processed.result)?;
        let ack = self.notifier.deliver(destination, &payload).await?;
        tracing::info!(
            %key,
            destination,
            tokens = processed.result.total_length_tokens,
            model = %processed.result.model,
            delivered = ack.is_some(),
            "usage update processed"
        );

        if processed.is_fresh_message() && self.cache.has(key).await? {
            self.cache.delete(key).await?;
        }
        Ok(())
    }
}

struct RefreshTask {
    processor: Arc<ResponseProcessor>,
    notifier: Arc<ReliableNotifier>,
    stats: Arc<RelayStats>,
    key: ConversationKey,
    origin_id: String,
}

impl RefreshTask {
    async fn run(self) -> anyhow::Result<()> {
        let key = &self.key;
        let result = match self.processor.refresh(key).await {
            Ok(result) => result,
            Err(ProcessError::NoData) => {
                RelayStats::inc(&self.stats.no_data);
                tracing::warn!(%key, "no usage data for refresh");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        self.notifier
            .deliver(&self.origin_id, &conversation_update(&result)?)
            .await?;
        Ok(())
    }
}
