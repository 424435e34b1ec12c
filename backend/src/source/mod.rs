//! Observation sources: where raw scans come from.
//!
//! The pipeline only needs observation metadata, a time-ordered scan list and
//! a blocking read of one scan. Reads run on the blocking thread pool.

pub mod manifest;
pub mod memory;

use crate::error::PipelineResult;
use crate::models::{ObservationMetadata, Scan, ScanRef, Target};

pub use manifest::{ManifestSource, RawSample, ScanManifest};
pub use memory::MemorySource;

pub trait ObservationSource: Send + Sync {
    fn metadata(&self) -> &ObservationMetadata;

    /// Every scan of the observation, sorted by start time.
    fn scans(&self) -> Vec<ScanRef>;

    /// Load the samples of `scan`. May block on I/O.
    fn read_scan(&self, scan: &ScanRef) -> PipelineResult<Scan>;

    fn targets(&self) -> &[Target] {
        &self.metadata().targets
    }
}

/// Sort scans by start time, breaking ties on the scan index.
pub(crate) fn sort_scans(scans: &mut [ScanRef]) {
    scans.sort_by(|a, b| {
        a.start_time
            .total_cmp(&b.start_time)
            .then(a.index.cmp(&b.index))
    });
}
