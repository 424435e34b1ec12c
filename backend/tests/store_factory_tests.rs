//! State store selection from the environment and from config.

mod support;

use contim::config::StoreSettings;
use contim::store::{StateKey, StoreFactory, StoreType};
use serde_json::json;
use support::with_scoped_env;

#[test]
fn test_store_type_defaults_to_local() {
    let store_type = with_scoped_env(
        &[("STATE_STORE_TYPE", None), ("STATE_STORE_PATH", None)],
        StoreType::from_env,
    );
    assert_eq!(store_type, StoreType::Local);
}

#[test]
fn test_store_path_implies_file_store() {
    let store_type = with_scoped_env(
        &[
            ("STATE_STORE_TYPE", None),
            ("STATE_STORE_PATH", Some("/tmp/contim-state.json")),
        ],
        StoreType::from_env,
    );
    assert_eq!(store_type, StoreType::File);
}

#[test]
fn test_explicit_store_type_wins() {
    let store_type = with_scoped_env(
        &[
            ("STATE_STORE_TYPE", Some("memory")),
            ("STATE_STORE_PATH", Some("/tmp/contim-state.json")),
        ],
        StoreType::from_env,
    );
    assert_eq!(store_type, StoreType::Local);

    let store_type = with_scoped_env(&[("STATE_STORE_TYPE", Some("bogus"))], StoreType::from_env);
    assert_eq!(store_type, StoreType::Local);
}

#[tokio::test]
async fn test_file_store_from_settings_persists() {
    let dir = tempfile::tempdir().unwrap();
    let settings = StoreSettings {
        store_type: "file".to_string(),
        path: Some(dir.path().join("state.json")),
    };
    let key = StateKey::target("1551234567_continuum_image", "PKS1934-63", "sky_model");

    let store = StoreFactory::from_settings(&settings).await.unwrap();
    assert!(store.health_check().await.unwrap());
    store.put(&key, json!({"components": []})).await.unwrap();
    drop(store);

    let reopened = StoreFactory::from_settings(&settings).await.unwrap();
    assert_eq!(
        reopened.get(&key).await.unwrap(),
        Some(json!({"components": []}))
    );
}

#[tokio::test]
async fn test_file_store_requires_path() {
    let settings = StoreSettings {
        store_type: "file".to_string(),
        path: None,
    };
    assert!(StoreFactory::from_settings(&settings).await.is_err());

    let settings = StoreSettings {
        store_type: "redis".to_string(),
        path: None,
    };
    assert!(StoreFactory::from_settings(&settings).await.is_err());
}
