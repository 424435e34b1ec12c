//! State store factory.
//!
//! Picks the backend from configuration or the `STATE_STORE_TYPE`
//! environment variable so the pipeline only ever sees `Arc<dyn StateStore>`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

#[cfg(feature = "file-store")]
use super::file::FileStateStore;
use super::local::LocalStateStore;
use super::{StateStore, StoreError, StoreErrorContext, StoreResult};
use crate::config::StoreSettings;

/// State store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    /// In-memory store, lost at exit
    Local,
    /// JSON document on disk
    File,
}

impl FromStr for StoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "memory" => Ok(Self::Local),
            "file" | "json" => Ok(Self::File),
            _ => Err(format!("Unknown state store type: {}", s)),
        }
    }
}

impl StoreType {
    /// Read `STATE_STORE_TYPE`, defaulting to the file store when
    /// `STATE_STORE_PATH` is set and to the local store otherwise.
    pub fn from_env() -> Self {
        if let Ok(val) = std::env::var("STATE_STORE_TYPE") {
            return val.parse().unwrap_or(Self::Local);
        }
        if std::env::var("STATE_STORE_PATH").is_ok() {
            Self::File
        } else {
            Self::Local
        }
    }
}

pub struct StoreFactory;

impl StoreFactory {
    /// Create a store of `store_type`. The file backend requires `path`.
    pub async fn create(
        store_type: StoreType,
        path: Option<&Path>,
    ) -> StoreResult<Arc<dyn StateStore>> {
        match store_type {
            StoreType::File => {
                #[cfg(feature = "file-store")]
                {
                    let path = path.ok_or_else(|| {
                        StoreError::configuration("file state store requires a path")
                            .with_context(StoreErrorContext::new("create_store"))
                    })?;
                    let store = FileStateStore::open(path).await?;
                    Ok(Arc::new(store) as Arc<dyn StateStore>)
                }
                #[cfg(not(feature = "file-store"))]
                {
                    let _ = path;
                    Err(StoreError::configuration("file-store feature not enabled")
                        .with_context(StoreErrorContext::new("create_store")))
                }
            }
            StoreType::Local => Ok(Self::create_local()),
        }
    }

    pub fn create_local() -> Arc<dyn StateStore> {
        Arc::new(LocalStateStore::new())
    }

    /// Create the store described by the `[store]` config section.
    pub async fn from_settings(settings: &StoreSettings) -> StoreResult<Arc<dyn StateStore>> {
        let store_type = settings.store_type.parse::<StoreType>().map_err(|e| {
            StoreError::configuration(e).with_context(StoreErrorContext::new("create_store"))
        })?;
        Self::create(store_type, settings.path.as_deref()).await
    }

    /// Create the store named by `STATE_STORE_TYPE` / `STATE_STORE_PATH`.
    pub async fn from_env() -> StoreResult<Arc<dyn StateStore>> {
        let path = std::env::var("STATE_STORE_PATH").ok().map(PathBuf::from);
        Self::create(StoreType::from_env(), path.as_deref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_type_from_str() {
        assert_eq!("local".parse::<StoreType>().unwrap(), StoreType::Local);
        assert_eq!("MEMORY".parse::<StoreType>().unwrap(), StoreType::Local);
        assert_eq!("json".parse::<StoreType>().unwrap(), StoreType::File);
        assert!("redis".parse::<StoreType>().is_err());
    }

    #[tokio::test]
    async fn test_file_store_requires_path() {
        let result = StoreFactory::create(StoreType::File, None).await;
        assert!(matches!(
            result.err(),
            Some(StoreError::ConfigurationError { .. })
        ));
    }

    #[tokio::test]
    async fn test_from_settings_rejects_unknown_type() {
        let settings = StoreSettings {
            store_type: "katstore".to_string(),
            path: None,
        };
        assert!(StoreFactory::from_settings(&settings).await.is_err());
    }

    #[tokio::test]
    async fn test_create_local_is_healthy() {
        let store = StoreFactory::create(StoreType::Local, None).await.unwrap();
        assert!(store.health_check().await.unwrap());
    }
}
