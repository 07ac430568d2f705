use anyhow::Result;
use async_trait::async_trait;

/// Persistent key/value backing for long-lived relay state.
///
/// Values are opaque bytes (JSON in practice). Every call is expected to be
/// durable once it returns: callers write through and never batch.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;

    /// Backend name for logs.
    fn kind(&self) -> &'static str;
}

#[async_trait]
pub trait MetaStoreExt: MetaStore {
    /// `get` with a fallback for missing keys.
    async fn get_or(&self, key: &str, default: Vec<u8>) -> Result<Vec<u8>> {
        Ok(self.get(key).await?.unwrap_or(default))
    }
}

impl<T: MetaStore + ?Sized> MetaStoreExt for T {}
