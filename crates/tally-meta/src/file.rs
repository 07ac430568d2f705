use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use crate::types::MetaStore;

/// Single JSON document on disk mapping keys to UTF-8 values.
///
/// The whole document is rewritten on every mutation through a sibling temp
/// file and a rename, so a crash leaves either the old or the new version.
#[derive(Debug, Clone)]
pub struct FileMetaStore {
    path: PathBuf,
    doc: Arc<Mutex<BTreeMap<String, String>>>,
}

impl FileMetaStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt store file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tracing::debug!(path=%path.display(), keys = doc.len(), "opened file store");
        Ok(Self {
            path,
            doc: Arc::new(Mutex::new(doc)),
        })
    }

    async fn flush(&self, doc: &BTreeMap<String, String>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MetaStore for FileMetaStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let doc = self.doc.lock().await;
        Ok(doc.get(key).map(|v| v.as_bytes().to_vec()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let value = String::from_utf8(value)
            .with_context(|| format!("value for {key} is not UTF-8"))?;
        let mut doc = self.doc.lock().await;
        doc.insert(key.to_string(), value);
        self.flush(&doc).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut doc = self.doc.lock().await;
        if doc.remove(key).is_some() {
            self.flush(&doc).await?;
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "file"
    }
}
