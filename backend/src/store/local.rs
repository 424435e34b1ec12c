//! In-memory state store.
//!
//! Suitable for tests and dry runs: everything lives in a sorted map behind
//! a lock and disappears with the process. Health can be toggled to exercise
//! error paths.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{StateKey, StateStore, StoreError, StoreErrorContext, StoreResult};

#[derive(Clone)]
pub struct LocalStateStore {
    data: Arc<RwLock<LocalData>>,
}

struct LocalData {
    values: BTreeMap<String, Value>,
    is_healthy: bool,
}

impl LocalStateStore {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(LocalData {
                values: BTreeMap::new(),
                is_healthy: true,
            })),
        }
    }

    /// Mark the store healthy or unhealthy; unhealthy stores reject every call.
    pub fn set_healthy(&self, healthy: bool) {
        self.data.write().is_healthy = healthy;
    }

    pub fn len(&self) -> usize {
        self.data.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored value.
    pub fn dump(&self) -> BTreeMap<String, Value> {
        self.data.read().values.clone()
    }

    fn ensure_healthy(&self, operation: &str, key: &dyn ToString) -> StoreResult<()> {
        if self.data.read().is_healthy {
            Ok(())
        } else {
            Err(StoreError::connection("local store marked unhealthy")
                .with_context(StoreErrorContext::new(operation).with_key(key.to_string())))
        }
    }
}

impl Default for LocalStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn health_check(&self) -> StoreResult<bool> {
        Ok(self.data.read().is_healthy)
    }

    async fn put(&self, key: &StateKey, value: Value) -> StoreResult<()> {
        self.ensure_healthy("put", key)?;
        self.data.write().values.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &StateKey) -> StoreResult<Option<Value>> {
        self.ensure_healthy("get", key)?;
        Ok(self.data.read().values.get(&key.to_string()).cloned())
    }

    async fn delete(&self, key: &StateKey) -> StoreResult<bool> {
        self.ensure_healthy("delete", key)?;
        Ok(self.data.write().values.remove(&key.to_string()).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.ensure_healthy("keys_with_prefix", &prefix)?;
        Ok(self
            .data
            .read()
            .values
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
