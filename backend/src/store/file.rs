//! JSON-document state store on local disk.
//!
//! The whole store is one JSON object. Every mutation rewrites the document
//! to a temporary sibling and renames it into place, so a crash never leaves
//! a half-written file behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{StateKey, StateStore, StoreError, StoreErrorContext, StoreResult};

pub struct FileStateStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl FileStateStore {
    /// Open the document at `path`, creating an empty store if it is missing.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let values = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StoreError::serialization(e.to_string()).with_context(
                    StoreErrorContext::new("open").with_details(path.display().to_string()),
                )
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(StoreError::storage(e.to_string()).with_context(
                    StoreErrorContext::new("open").with_details(path.display().to_string()),
                ))
            }
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, values: &BTreeMap<String, Value>, operation: &str) -> StoreResult<()> {
        let ctx = || StoreErrorContext::new(operation).with_details(self.path.display().to_string());
        let failed = |e: std::io::Error| write_error(e, ctx());
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(failed)?;
        }
        let bytes = serde_json::to_vec_pretty(values)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(failed)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(failed)?;
        debug!("Persisted {} state entries to {}", values.len(), self.path.display());
        Ok(())
    }
}

/// Storage error for a failed write; interrupted or timed-out writes may be retried.
fn write_error(e: std::io::Error, context: StoreErrorContext) -> StoreError {
    use std::io::ErrorKind;
    let context = match e.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => context.retryable(),
        _ => context,
    };
    StoreError::storage(e.to_string()).with_context(context)
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn health_check(&self) -> StoreResult<bool> {
        Ok(match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                tokio::fs::metadata(parent).await.is_ok() || tokio::fs::create_dir_all(parent).await.is_ok()
            }
            _ => true,
        })
    }

    async fn put(&self, key: &StateKey, value: Value) -> StoreResult<()> {
        let mut values = self.values.lock().await;
        values.insert(key.to_string(), value);
        self.persist(&values, "put").await
    }

    async fn get(&self, key: &StateKey) -> StoreResult<Option<Value>> {
        Ok(self.values.lock().await.get(&key.to_string()).cloned())
    }

    async fn delete(&self, key: &StateKey) -> StoreResult<bool> {
        let mut values = self.values.lock().await;
        let existed = values.remove(&key.to_string()).is_some();
        if existed {
            self.persist(&values, "delete").await?;
        }
        Ok(existed)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .values
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
