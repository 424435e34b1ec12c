//! In-memory observation source for tests and tooling.

use std::collections::BTreeMap;

use super::{sort_scans, ObservationSource};
use crate::error::{ErrorContext, PipelineError, PipelineResult};
use crate::models::{ObservationMetadata, Scan, ScanRef};

pub struct MemorySource {
    metadata: ObservationMetadata,
    scans: BTreeMap<u32, Scan>,
}

impl MemorySource {
    pub fn new(metadata: ObservationMetadata) -> Self {
        Self {
            metadata,
            scans: BTreeMap::new(),
        }
    }

    /// Add (or replace) a scan, keyed by its index.
    pub fn with_scan(mut self, scan: Scan) -> Self {
        self.scans.insert(scan.meta.index, scan);
        self
    }
}

impl ObservationSource for MemorySource {
    fn metadata(&self) -> &ObservationMetadata {
        &self.metadata
    }

    fn scans(&self) -> Vec<ScanRef> {
        let mut scans: Vec<ScanRef> = self.scans.values().map(|s| s.meta.clone()).collect();
        sort_scans(&mut scans);
        scans
    }

    fn read_scan(&self, scan: &ScanRef) -> PipelineResult<Scan> {
        self.scans.get(&scan.index).cloned().ok_or_else(|| {
            PipelineError::io(format!("scan {} not in source", scan.index))
                .with_context(ErrorContext::new("read_scan").with_scan(scan.index))
        })
    }
}
