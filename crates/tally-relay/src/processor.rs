use std::sync::Arc;

use serde_json::Value;
use tally_common::{ConversationKey, PendingRequest, UsageResult};

use crate::correlation::CorrelationCache;
use crate::error::ProcessError;
use crate::intercept::CompletedExchange;
use crate::usage::UsageSource;

/// Result of processing one completed exchange.
#[derive(Debug, Clone)]
pub struct Processed {
    pub result: UsageResult,
    /// The pending request this response was matched to, if any. When set,
    /// the caller owns deleting the correlation entry once delivery is done.
    pub matched: Option<PendingRequest>,
}

impl Processed {
    pub fn is_fresh_message(&self) -> bool {
        self.matched.is_some()
    }
}

/// Turns a completed conversation fetch into a [`UsageResult`].
///
/// Reads the correlation cache but never mutates it, and does not retry.
pub struct ResponseProcessor {
    cache: Arc<CorrelationCache>,
    usage: Arc<dyn UsageSource>,
    default_model: String,
}

impl ResponseProcessor {
    pub fn new(
        cache: Arc<CorrelationCache>,
        usage: Arc<dyn UsageSource>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            usage,
            default_model: default_model.into(),
        }
    }

    pub async fn process(
        &self,
        key: &ConversationKey,
        exchange: &CompletedExchange,
    ) -> Result<Processed, ProcessError> {
        let pending = self.cache.get(key).await?;
        tracing::debug!(%key, is_fresh = pending.is_some(), "processing completed exchange");
        let result = self
            .compute(key, pending.as_ref(), exchange.body.as_ref())
            .await?;
        Ok(Processed {
            result,
            matched: pending,
        })
    }

    /// Recompute usage for `key` outside any completion, as a passive fetch.
    pub async fn refresh(&self, key: &ConversationKey) -> Result<UsageResult, ProcessError> {
        tracing::debug!(%key, "refreshing conversation usage");
        self.compute(key, None, None).await
    }

    async fn compute(
        &self,
        key: &ConversationKey,
        pending: Option<&PendingRequest>,
        body: Option<&Value>,
    ) -> Result<UsageResult, ProcessError> {
        let base = self
            .usage
            .derive_base(
                key.tenant_id(),
                key.conversation_id(),
                pending.is_some(),
                body,
            )
            .await
            .map_err(ProcessError::Usage)?
            .ok_or(ProcessError::NoData)?;

        let overhead = self
            .usage
            .profile_overhead_tokens(key.tenant_id())
            .await
            .map_err(ProcessError::Usage)?;
        tracing::debug!(%key, base_length = base.length, overhead, "usage derived");

        let model = pending
            .map(|p| p.declared_model.clone())
            .or(base.model)
            .unwrap_or_else(|| self.default_model.clone());

        Ok(UsageResult {
            conversation_id: key.conversation_id().to_string(),
            total_length_tokens: base.length.saturating_add(overhead),
            model,
            cache_expires_at: base.cache_expires_at,
            associated_project_id: base.project_id,
            auxiliary_id: base
                .auxiliary_id
                .or_else(|| pending.and_then(|p| p.auxiliary_id.clone())),
            settings: base.settings,
            last_message_at: base.last_message_at,
        })
    }
}
