use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;

use crate::types::MetaStore;

/// Process-local backing store. Nothing survives a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetaStore {
    kv: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.kv.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.kv.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.kv.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.kv.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.kv.write().await.remove(key);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetaStoreExt;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryMetaStore::new();
        assert_eq!(store.get("a").await.unwrap(), None);

        store.put("a", b"1".to_vec()).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.len().await, 1);

        store.delete("a").await.unwrap();
        assert!(store.is_empty().await);
        assert_eq!(store.get_or("a", b"[]".to_vec()).await.unwrap(), b"[]".to_vec());
    }
}
