use std::sync::Arc;

use anyhow::Result;
use etcd_client::Client;
use tokio::sync::Mutex;

use crate::types::MetaStore;

/// etcd-backed store. Every key is written under `namespace`.
#[derive(Clone)]
pub struct EtcdMetaStore {
    client: Arc<Mutex<Client>>,
    namespace: String,
}

impl EtcdMetaStore {
    pub async fn connect(endpoints: &[String], namespace: &str) -> Result<Self> {
        let c = Client::connect(endpoints, None).await?;
        tracing::info!(?endpoints, namespace, "connected to etcd");
        Ok(Self {
            client: Arc::new(Mutex::new(c)),
            namespace: namespace.to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        namespaced_key(&self.namespace, key)
    }
}

/// `/ns` + `key` becomes `/ns/key`; a trailing slash on the namespace is not doubled.
fn namespaced_key(namespace: &str, key: &str) -> String {
    let namespace = namespace.trim_end_matches('/');
    let key = key.trim_start_matches('/');
    format!("{namespace}/{key}")
}

#[async_trait::async_trait]
impl MetaStore for EtcdMetaStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(self.full_key(key), None).await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut cli = self.client.lock().await;
        cli.put(self.full_key(key), value, None).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut cli = self.client.lock().await;
        cli.delete(self.full_key(key), None).await?;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "etcd"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced_key_has_separator() {
        assert_eq!(namespaced_key("/tally", "pendingRequests"), "/tally/pendingRequests");
        assert_eq!(namespaced_key("/tally/", "tenants"), "/tally/tenants");
        assert_eq!(namespaced_key("", "tenants"), "/tenants");
    }
}
