//! Staging capacity: FIFO admission and timeouts.

use std::sync::Arc;
use std::time::Duration;

use contim::error::PipelineError;
use contim::staging::{Catalog, DiskId, StagingStore, GRANULE_BYTES};
use parking_lot::Mutex;

fn store(root: &std::path::Path, granules: u64, timeout: Duration) -> StagingStore {
    let catalog = Catalog::new(vec![root.to_path_buf()]);
    StagingStore::new(catalog, DiskId(1), granules * GRANULE_BYTES, timeout).unwrap()
}

#[tokio::test]
async fn test_waiters_are_served_in_arrival_order() {
    let dir = tempfile::tempdir().unwrap();
    let staging = store(dir.path(), 4, Duration::from_secs(10));
    let mut held = staging.reserve(4 * GRANULE_BYTES).await.unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let large = {
        let (staging, order) = (staging.clone(), order.clone());
        tokio::spawn(async move {
            let r = staging.reserve(3 * GRANULE_BYTES).await.unwrap();
            order.lock().push("large");
            r
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let small = {
        let (staging, order) = (staging.clone(), order.clone());
        tokio::spawn(async move {
            let r = staging.reserve(GRANULE_BYTES).await.unwrap();
            order.lock().push("small");
            r
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // One free granule would fit the small request, but it queued second
    let freed = held.split(GRANULE_BYTES).unwrap();
    drop(freed);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(order.lock().is_empty());

    drop(held);
    let large = large.await.unwrap();
    let small = small.await.unwrap();
    assert_eq!(*order.lock(), vec!["large", "small"]);
    assert_eq!(large.bytes() + small.bytes(), staging.capacity_bytes());
}

#[tokio::test]
async fn test_reserve_times_out_when_space_never_frees() {
    let dir = tempfile::tempdir().unwrap();
    let staging = store(dir.path(), 2, Duration::from_millis(50));
    let _held = staging.reserve(2 * GRANULE_BYTES).await.unwrap();

    let err = staging.reserve(1).await.unwrap_err();
    assert!(matches!(err, PipelineError::StagingCapacityExceeded { .. }));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_oversized_request_fails_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let staging = store(dir.path(), 2, Duration::from_secs(60));

    let err = staging.reserve(3 * GRANULE_BYTES).await.unwrap_err();
    assert!(matches!(err, PipelineError::StagingCapacityExceeded { .. }));
    assert_eq!(staging.available_bytes(), 2 * GRANULE_BYTES);
}
