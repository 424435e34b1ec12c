//! Capacity-limited staging store on the RAM disk.
//!
//! Space is accounted in 1 KiB granules through a fair semaphore: requests
//! are granted strictly in arrival order, so a large scan at the head of the
//! queue is never starved by smaller ones behind it. A reservation is held by
//! the [`StagingFile`] it pays for and returns to the pool when that file is
//! deleted or dropped.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::catalog::{remove_file_if_exists, Catalog, CatalogEntry, DiskId, FileKind};
use crate::error::{ErrorContext, PipelineError, PipelineResult};
use crate::tables;

pub const GRANULE_BYTES: u64 = 1024;

fn to_granules(bytes: u64) -> u64 {
    bytes.div_ceil(GRANULE_BYTES).max(1)
}

/// `bytes` rounded up to the space a reservation for them actually holds.
pub fn whole_granules(bytes: u64) -> u64 {
    to_granules(bytes) * GRANULE_BYTES
}

/// Space held against the staging capacity.
#[derive(Debug)]
pub struct StagingReservation {
    permit: OwnedSemaphorePermit,
}

impl StagingReservation {
    pub fn bytes(&self) -> u64 {
        self.permit.num_permits() as u64 * GRANULE_BYTES
    }

    /// Split off `bytes` (rounded up to granules) into a new reservation.
    ///
    /// Returns `None` if this reservation is not large enough.
    pub fn split(&mut self, bytes: u64) -> Option<StagingReservation> {
        let granules = to_granules(bytes) as usize;
        if granules >= self.permit.num_permits() {
            return None;
        }
        self.permit
            .split(granules)
            .map(|permit| StagingReservation { permit })
    }

    /// Release everything beyond `bytes` back to the store.
    pub fn shrink_to(&mut self, bytes: u64) {
        let keep = to_granules(bytes) as usize;
        let held = self.permit.num_permits();
        if held > keep {
            drop(self.permit.split(held - keep));
        }
    }
}

/// Staging area with bounded capacity.
#[derive(Clone)]
pub struct StagingStore {
    catalog: Catalog,
    disk: DiskId,
    capacity: Arc<Semaphore>,
    capacity_granules: u64,
    acquire_timeout: Duration,
}

impl StagingStore {
    pub fn new(
        catalog: Catalog,
        disk: DiskId,
        capacity_bytes: u64,
        acquire_timeout: Duration,
    ) -> PipelineResult<Self> {
        let capacity_granules = capacity_bytes / GRANULE_BYTES;
        if capacity_granules == 0 || capacity_granules > u32::MAX as u64 {
            return Err(PipelineError::configuration(format!(
                "staging capacity of {} bytes is out of range",
                capacity_bytes
            ))
            .with_context(ErrorContext::new("staging_new")));
        }
        if catalog.disk_root(disk).is_none() {
            return Err(PipelineError::configuration(format!(
                "staging disk {} is not configured",
                disk
            ))
            .with_context(ErrorContext::new("staging_new")));
        }

        Ok(Self {
            catalog,
            disk,
            capacity: Arc::new(Semaphore::new(capacity_granules as usize)),
            capacity_granules,
            acquire_timeout,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn disk(&self) -> DiskId {
        self.disk
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_granules * GRANULE_BYTES
    }

    pub fn available_bytes(&self) -> u64 {
        self.capacity.available_permits() as u64 * GRANULE_BYTES
    }

    /// Wait (FIFO) for `bytes` of staging space.
    ///
    /// Fails with `StagingCapacityExceeded` when the request can never fit
    /// or when it is not granted within the acquire timeout.
    pub async fn reserve(&self, bytes: u64) -> PipelineResult<StagingReservation> {
        let granules = to_granules(bytes);
        if granules > self.capacity_granules {
            return Err(PipelineError::staging_exceeded(format!(
                "request for {} bytes exceeds total capacity of {} bytes",
                bytes,
                self.capacity_bytes()
            ))
            .with_context(ErrorContext::new("staging_reserve")));
        }

        let acquire = self.capacity.clone().acquire_many_owned(granules as u32);
        match tokio::time::timeout(self.acquire_timeout, acquire).await {
            Ok(Ok(permit)) => {
                debug!(
                    "Reserved {} bytes of staging ({} bytes free)",
                    permit.num_permits() as u64 * GRANULE_BYTES,
                    self.available_bytes()
                );
                Ok(StagingReservation { permit })
            }
            Ok(Err(_)) => Err(PipelineError::staging_exceeded("staging store closed")
                .with_context(ErrorContext::new("staging_reserve"))),
            Err(_) => Err(PipelineError::staging_exceeded(format!(
                "no {} bytes freed within {:?}",
                bytes, self.acquire_timeout
            ))
            .with_context(ErrorContext::new("staging_reserve"))),
        }
    }

    /// Catalogue a new staging file paid for by `reservation`.
    pub fn create(
        &self,
        name: &str,
        class: &str,
        reservation: StagingReservation,
    ) -> PipelineResult<StagingFile> {
        let entry = self.catalog.allocate(self.disk, name, class, FileKind::Uv)?;
        Ok(StagingFile {
            entry: Some(entry),
            catalog: self.catalog.clone(),
            reservation: Some(reservation),
        })
    }
}

/// A transient UV file on the staging disk.
///
/// Deleting (or dropping) it removes the file and returns its space.
#[derive(Debug)]
pub struct StagingFile {
    entry: Option<CatalogEntry>,
    catalog: Catalog,
    reservation: Option<StagingReservation>,
}

impl StagingFile {
    pub fn path(&self) -> &Path {
        self.entry
            .as_ref()
            .map(|e| e.path.as_path())
            .unwrap_or_else(|| Path::new(""))
    }

    pub fn entry(&self) -> Option<&CatalogEntry> {
        self.entry.as_ref()
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reservation.as_ref().map(|r| r.bytes()).unwrap_or(0)
    }

    /// Trim the reservation to the file's size on disk.
    pub fn shrink_to_fit(&mut self) -> PipelineResult<()> {
        let len = std::fs::metadata(self.path())?.len();
        if let Some(reservation) = self.reservation.as_mut() {
            reservation.shrink_to(len);
        }
        Ok(())
    }

    /// Remove the file and release its space.
    pub fn delete(mut self) -> PipelineResult<()> {
        self.remove()
    }

    fn remove(&mut self) -> PipelineResult<()> {
        if let Some(entry) = self.entry.take() {
            self.catalog.remove(entry.key);
            remove_file_if_exists(&entry.path)?;
            tables::remove_tables(&entry.path)?;
            debug!("Deleted staging file {}", entry);
        }
        self.reservation = None;
        Ok(())
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!("Failed to clean up staging file: {}", e);
        }
    }
}
