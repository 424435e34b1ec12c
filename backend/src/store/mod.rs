//! State store: where calibration solutions and sky models are published.
//!
//! ```text
//!  SolutionPublisher ──► Arc<dyn StateStore>
//!                              │
//!             ┌────────────────┴────────────────┐
//!      LocalStateStore                    FileStateStore
//!      (in-memory, tests)                 (JSON document on disk)
//! ```
//!
//! Keys are scoped `<observation>:<target>:<name>`; writes overwrite.

pub mod checksum;
pub mod error;
pub mod factory;
#[cfg(feature = "file-store")]
pub mod file;
pub mod local;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

pub use error::{StoreError, StoreErrorContext, StoreResult};
pub use factory::{StoreFactory, StoreType};
#[cfg(feature = "file-store")]
pub use file::FileStateStore;
pub use local::LocalStateStore;

/// Observation- and target-scoped key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    pub observation: String,
    pub target: Option<String>,
    pub name: String,
}

impl StateKey {
    pub fn target(observation: &str, target: &str, name: &str) -> Self {
        Self {
            observation: observation.to_string(),
            target: Some(target.to_string()),
            name: name.to_string(),
        }
    }

    pub fn observation(observation: &str, name: &str) -> Self {
        Self {
            observation: observation.to_string(),
            target: None,
            name: name.to_string(),
        }
    }

    /// Prefix shared by every key of one target.
    pub fn target_prefix(observation: &str, target: &str) -> String {
        format!("{}:{}:", observation, target)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{}:{}:{}", self.observation, target, self.name),
            None => write!(f, "{}:{}", self.observation, self.name),
        }
    }
}

/// Key-value store for published products.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Check that the backend is reachable.
    async fn health_check(&self) -> StoreResult<bool>;

    /// Write `value` under `key`, replacing any previous value.
    async fn put(&self, key: &StateKey, value: Value) -> StoreResult<()>;

    async fn get(&self, key: &StateKey) -> StoreResult<Option<Value>>;

    /// Remove `key`; returns whether it existed.
    async fn delete(&self, key: &StateKey) -> StoreResult<bool>;

    /// All keys starting with `prefix`, sorted.
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_rendering() {
        let k = StateKey::target("123_continuum", "PKS1934", "sky_model");
        assert_eq!(k.to_string(), "123_continuum:PKS1934:sky_model");
        assert!(k
            .to_string()
            .starts_with(&StateKey::target_prefix("123_continuum", "PKS1934")));
        assert_eq!(
            StateKey::observation("123_continuum", "failures").to_string(),
            "123_continuum:failures"
        );
    }
}
