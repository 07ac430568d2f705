use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tally_common::{ConversationKey, PendingRequest};
use tally_meta::{MetaStore, StoreError, StoredMap};

/// Backing-store key holding every in-flight request.
pub const PENDING_REQUESTS_KEY: &str = "pendingRequests";
/// Backing-store key holding every tenant ever observed.
pub const TENANTS_KEY: &str = "tenants";

/// In-flight requests keyed by `tenant:conversation`.
///
/// One record per key; a later outgoing request for the same conversation
/// replaces the earlier one. Entries normally live until the matching
/// conversation fetch is processed; `ttl` only guards against leaks from
/// requests whose response is never seen.
#[derive(Debug)]
pub struct CorrelationCache {
    map: StoredMap<PendingRequest>,
    ttl: Option<Duration>,
}

impl CorrelationCache {
    pub fn new(backend: Arc<dyn MetaStore>, ttl: Option<Duration>) -> Self {
        Self::from_map(StoredMap::new(PENDING_REQUESTS_KEY, backend), ttl)
    }

    pub fn from_map(map: StoredMap<PendingRequest>, ttl: Option<Duration>) -> Self {
        Self { map, ttl }
    }

    pub async fn set(&self, key: &ConversationKey, request: PendingRequest) -> Result<(), StoreError> {
        self.map.set(&key.to_string(), request, self.ttl).await
    }

    pub async fn get(&self, key: &ConversationKey) -> Result<Option<PendingRequest>, StoreError> {
        self.map.get(&key.to_string()).await
    }

    pub async fn has(&self, key: &ConversationKey) -> Result<bool, StoreError> {
        self.map.has(&key.to_string()).await
    }

    pub async fn delete(&self, key: &ConversationKey) -> Result<(), StoreError> {
        self.map.delete(&key.to_string()).await
    }

    pub async fn entries(&self) -> Result<Vec<(ConversationKey, PendingRequest)>, StoreError> {
        let entries = self.map.entries().await?;
        Ok(entries
            .into_iter()
            .filter_map(|(raw, request)| match raw.parse::<ConversationKey>() {
                Ok(key) => Some((key, request)),
                Err(e) => {
                    tracing::warn!(key=%raw, error=%e, "skipping malformed pending key");
                    None
                }
            })
            .collect())
    }
}

/// Tenants seen on either event path, with the time each was first observed.
#[derive(Debug)]
pub struct TenantRegistry {
    map: StoredMap<DateTime<Utc>>,
}

impl TenantRegistry {
    pub fn new(backend: Arc<dyn MetaStore>) -> Self {
        Self {
            map: StoredMap::new(TENANTS_KEY, backend),
        }
    }

    /// Returns `true` the first time `tenant_id` is seen.
    pub async fn record(&self, tenant_id: &str) -> Result<bool, StoreError> {
        if self.map.has(tenant_id).await? {
            return Ok(false);
        }
        self.map.set(tenant_id, Utc::now(), None).await?;
        tracing::info!(tenant_id, "new tenant observed");
        Ok(true)
    }

    pub async fn list(&self) -> Result<Vec<(String, DateTime<Utc>)>, StoreError> {
        self.map.entries().await
    }
}

#[cfg(test)]
mod tests {
    use tally_meta::MemoryMetaStore;

    use super::*;

    fn request(model: &str, origin: &str) -> PendingRequest {
        PendingRequest {
            tenant_id: "org1".to_string(),
            conversation_id: "conv1".to_string(),
            origin_id: origin.to_string(),
            declared_model: model.to_string(),
            auxiliary_id: Some("style".to_string()),
            created_at: Utc::now(),
            tool_declarations: vec![],
        }
    }

    #[tokio::test]
    async fn test_round_trip_before_response() {
        let cache = CorrelationCache::new(Arc::new(MemoryMetaStore::new()), None);
        let key = ConversationKey::new("org1", "conv1").unwrap();
        let written = request("Sonnet", "tab-1");

        cache.set(&key, written.clone()).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), Some(written));
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let cache = CorrelationCache::new(Arc::new(MemoryMetaStore::new()), None);
        let key = ConversationKey::new("org1", "conv1").unwrap();

        cache.set(&key, request("Sonnet", "tab-1")).await.unwrap();
        cache.set(&key, request("Opus", "tab-2")).await.unwrap();

        let current = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(current.declared_model, "Opus");
        assert_eq!(current.origin_id, "tab-2");

        let entries = cache.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, key);
    }

    #[tokio::test]
    async fn test_persisted_under_wire_key() {
        let backend = Arc::new(MemoryMetaStore::new());
        let cache = CorrelationCache::new(backend.clone(), None);
        let key = ConversationKey::new("org1", "conv1").unwrap();
        cache.set(&key, request("Haiku", "tab-9")).await.unwrap();

        let reloaded = CorrelationCache::new(backend.clone(), None);
        assert!(reloaded.has(&key).await.unwrap());
        reloaded.delete(&key).await.unwrap();

        let raw = backend.get(PENDING_REQUESTS_KEY).await.unwrap().unwrap();
        assert_eq!(raw, b"[]".to_vec());
    }

    #[tokio::test]
    async fn test_tenant_registry_records_once() {
        let tenants = TenantRegistry::new(Arc::new(MemoryMetaStore::new()));
        assert!(tenants.record("org1").await.unwrap());
        assert!(!tenants.record("org1").await.unwrap());
        assert!(tenants.record("org2").await.unwrap());

        let names: Vec<String> = tenants.list().await.unwrap().into_iter().map(|(t, _)| t).collect();
        assert_eq!(names, vec!["org1".to_string(), "org2".to_string()]);
    }
}
