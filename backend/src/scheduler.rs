//! Scan scheduler: stage, average and concatenate every selected scan.
//!
//! ```text
//!  admission task (time order)            scan workers (<= N)
//!  ───────────────────────────            ───────────────────
//!  worker permit ─► staging reserve ─►    read ─► serialize ─► UVBlAvg
//!                                                   │
//!  main loop ◄──────────── mpsc ────────────────────┘
//!     per-target reorder buffer ─► TargetAccumulator
//! ```
//!
//! Admission reserves staging space in strict time order, covering both the
//! raw file and an upper bound for the averaged one, so an earlier scan never
//! queues behind a later one. Completed scans may arrive out of order; each
//! target buffers them until the next scan in time order is available.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::averaging::{AveragingInvoker, AveragingReport};
use crate::concat::{AccumulatedTarget, TargetAccumulator};
use crate::error::{ErrorContext, PipelineError, PipelineResult};
use crate::models::{RandomParameterKind, ScanRef, Target, UvDescriptor};
use crate::source::ObservationSource;
use crate::staging::{whole_granules, DiskId, StagingFile, StagingReservation, StagingStore};
use crate::tracker::{RunTracker, TargetStatus};
use crate::uv::{self, UvWriter};

/// Catalog class of raw staged scans.
pub const RAW_CLASS: &str = "raw";
/// Catalog class of averaged staged scans.
pub const AVERAGED_CLASS: &str = "uvav";

/// A scan that made it through staging and averaging.
#[derive(Debug)]
pub struct ScanProduct {
    /// The averaged file, or the raw file when averaging is disabled
    pub file: StagingFile,
    pub raw_nvis: u64,
    pub averaging: Option<AveragingReport>,
}

struct ScanMessage {
    scan: ScanRef,
    result: PipelineResult<ScanProduct>,
}

/// Result of scheduling every selected scan.
#[derive(Debug, Default)]
pub struct ScheduleOutcome {
    /// Keyed by target id
    pub targets: BTreeMap<u32, PipelineResult<AccumulatedTarget>>,
    /// Admission stopped early; unfinished targets are absent from `targets`
    pub cancelled: bool,
}

enum Slot {
    Ready(ScanProduct),
    Dropped,
}

struct TargetQueue {
    target: Target,
    /// Scan indices in time order
    order: Vec<u32>,
    next: usize,
    buffer: HashMap<u32, Slot>,
    accumulator: TargetAccumulator,
}

impl TargetQueue {
    fn is_complete(&self) -> bool {
        self.next == self.order.len()
    }
}

/// Everything a scan worker needs, shared across workers.
struct WorkerContext {
    source: Arc<dyn ObservationSource>,
    staging: StagingStore,
    averaging: AveragingInvoker,
    descriptor: UvDescriptor,
}

/// Descriptor of the files staged for `target`.
///
/// Staging sizes must come from this exact header: the object name is part
/// of the JSON header and so of every file's length.
pub fn staged_descriptor(base: &UvDescriptor, target: &str) -> UvDescriptor {
    let mut descriptor = base.clone();
    descriptor.object = target.to_string();
    descriptor
}

fn target_name(source: &dyn ObservationSource, target_id: u32) -> String {
    source
        .metadata()
        .target(target_id)
        .map(|t| t.name.clone())
        .unwrap_or_else(|| format!("target{}", target_id))
}

/// Staging bytes for a scan of `samples` visibilities staged with
/// `descriptor`: the raw file and, when `averaged`, an averaged file of at
/// most as many records with an extra `INTTIM` parameter.
///
/// Each share is rounded up to whole granules so that splitting the combined
/// reservation leaves both files fully paid for.
pub fn reservation_bytes(
    descriptor: &UvDescriptor,
    samples: usize,
    averaged: bool,
) -> PipelineResult<(u64, u64)> {
    let raw = whole_granules(uv::file_size(descriptor, samples as u64)?);
    if !averaged {
        return Ok((raw, 0));
    }
    let mut averaged = descriptor.clone();
    if averaged
        .parameter_index(RandomParameterKind::IntegrationTime)
        .is_none()
    {
        averaged
            .random_parameters
            .push(RandomParameterKind::IntegrationTime);
    }
    Ok((raw, whole_granules(uv::file_size(&averaged, samples as u64)?)))
}

pub struct ScanScheduler {
    source: Arc<dyn ObservationSource>,
    staging: StagingStore,
    averaging: AveragingInvoker,
    work_disk: DiskId,
    workers: usize,
    tracker: RunTracker,
    cancel: CancellationToken,
}

impl ScanScheduler {
    pub fn new(
        source: Arc<dyn ObservationSource>,
        staging: StagingStore,
        averaging: AveragingInvoker,
        work_disk: DiskId,
        workers: usize,
        tracker: RunTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            staging,
            averaging,
            work_disk,
            workers: workers.max(1),
            tracker,
            cancel,
        }
    }

    /// Stage, average and merge `scans` (already selected, any order).
    ///
    /// Scan-local failures drop the scan and are recorded in the tracker.
    /// Only fatal errors (staging exhaustion, configuration, store) are
    /// returned as `Err`, after in-flight work has been abandoned.
    pub async fn run(&self, mut scans: Vec<ScanRef>) -> PipelineResult<ScheduleOutcome> {
        crate::source::sort_scans(&mut scans);
        let mut queues = self.build_queues(&scans)?;
        let mut outcome = ScheduleOutcome::default();
        info!(
            "Scheduling {} scans over {} targets with {} workers",
            scans.len(),
            queues.len(),
            self.workers
        );

        let sizes = self.sizes(&scans)?;
        let admission_cancel = self.cancel.child_token();
        let (tx, mut rx) = mpsc::unbounded_channel::<ScanMessage>();
        let admission = tokio::spawn(admit(
            scans,
            Arc::new(WorkerContext {
                source: self.source.clone(),
                staging: self.staging.clone(),
                averaging: self.averaging.clone(),
                descriptor: self.source.metadata().descriptor(),
            }),
            self.workers,
            admission_cancel.clone(),
            tx,
            sizes,
        ));

        while let Some(message) = rx.recv().await {
            let target_id = message.scan.target_id;
            let Some(queue) = queues.get_mut(&target_id) else {
                continue;
            };
            let slot = match message.result {
                Ok(product) => {
                    if let Some(report) = &product.averaging {
                        self.tracker.record_history(report.history.clone());
                    }
                    Slot::Ready(product)
                }
                Err(e) if e.is_fatal() => {
                    error!("Fatal error on scan {}: {}", message.scan.index, e);
                    admission_cancel.cancel();
                    return Err(e);
                }
                Err(e) if e.is_scan_local() => {
                    warn!("Dropping scan {}: {}", message.scan.index, e);
                    self.tracker
                        .scan_dropped(&queue.target.name, message.scan.index, e.to_string());
                    Slot::Dropped
                }
                Err(e) => {
                    debug!("Scan {} abandoned: {}", message.scan.index, e);
                    Slot::Dropped
                }
            };
            queue.buffer.insert(message.scan.index, slot);
            self.drain(queue);

            if queue.is_complete() {
                if let Some(queue) = queues.remove(&target_id) {
                    outcome.targets.insert(target_id, self.finish(queue));
                }
            }
        }

        match admission.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => {
                return Err(PipelineError::io(format!("admission task failed: {}", e))
                    .with_context(ErrorContext::new("schedule_scans")))
            }
        }

        if self.cancel.is_cancelled() {
            outcome.cancelled = true;
            for queue in queues.values() {
                warn!(
                    "Target '{}' left unfinished after cancellation",
                    queue.target.name
                );
            }
            return Ok(outcome);
        }

        // Scans whose worker never reported (panicked) leave gaps; close them.
        for (target_id, mut queue) in queues {
            while !queue.is_complete() {
                let missing = queue.order[queue.next];
                if !queue.buffer.contains_key(&missing) {
                    self.tracker
                        .scan_dropped(&queue.target.name, missing, "scan worker did not report");
                    queue.buffer.insert(missing, Slot::Dropped);
                }
                self.drain(&mut queue);
            }
            outcome.targets.insert(target_id, self.finish(queue));
        }
        Ok(outcome)
    }

    fn sizes(&self, scans: &[ScanRef]) -> PipelineResult<HashMap<u32, (u64, u64)>> {
        let base = self.source.metadata().descriptor();
        scans
            .iter()
            .map(|scan| {
                let name = target_name(self.source.as_ref(), scan.target_id);
                let descriptor = staged_descriptor(&base, &name);
                let bytes = reservation_bytes(&descriptor, scan.samples, self.averaging.enabled())?;
                Ok((scan.index, bytes))
            })
            .collect()
    }

    fn build_queues(&self, scans: &[ScanRef]) -> PipelineResult<BTreeMap<u32, TargetQueue>> {
        let metadata = self.source.metadata();
        let mut queues: BTreeMap<u32, TargetQueue> = BTreeMap::new();
        for scan in scans {
            let target = metadata.target(scan.target_id).ok_or_else(|| {
                PipelineError::configuration(format!(
                    "scan {} refers to unknown target {}",
                    scan.index, scan.target_id
                ))
                .with_context(ErrorContext::new("schedule_scans").with_scan(scan.index))
            })?;
            let queue = queues.entry(target.id).or_insert_with(|| {
                self.tracker.add_target(&target.name);
                self.tracker
                    .set_target_status(&target.name, TargetStatus::Merging);
                TargetQueue {
                    target: target.clone(),
                    order: Vec::new(),
                    next: 0,
                    buffer: HashMap::new(),
                    accumulator: TargetAccumulator::new(
                        self.staging.catalog().clone(),
                        self.work_disk,
                        &target.name,
                        target.id,
                    ),
                }
            });
            queue.order.push(scan.index);
        }
        Ok(queues)
    }

    /// Merge buffered scans that are next in time order.
    fn drain(&self, queue: &mut TargetQueue) {
        while let Some(index) = queue.order.get(queue.next).copied() {
            let Some(slot) = queue.buffer.remove(&index) else {
                break;
            };
            queue.next += 1;
            let Slot::Ready(product) = slot else {
                continue;
            };

            match queue.accumulator.append(index, product.file.path()) {
                Ok(nvis) => {
                    self.tracker.scan_merged(&queue.target.name, index, nvis);
                    debug!("Merged scan {} ({} visibilities)", index, nvis);
                }
                Err(e) => {
                    warn!("Dropping scan {} at merge: {}", index, e);
                    self.tracker
                        .scan_dropped(&queue.target.name, index, e.to_string());
                }
            }
            if let Err(e) = product.file.delete() {
                warn!("Failed to delete staged scan {}: {}", index, e);
            }
        }
    }

    fn finish(&self, queue: TargetQueue) -> PipelineResult<AccumulatedTarget> {
        let name = queue.target.name.clone();
        let result = queue.accumulator.finish();
        match &result {
            Ok(merged) => info!("Target '{}' merged: {} visibilities", name, merged.nvis),
            Err(e @ PipelineError::EmptyTarget { .. }) => {
                warn!("Target '{}' excluded: {}", name, e);
                self.tracker.set_target_status(&name, TargetStatus::Empty);
            }
            Err(e) => self.tracker.fail_target(&name, e.to_string()),
        }
        result
    }
}

/// Admit scans in time order: worker permit first, then staging space.
async fn admit(
    scans: Vec<ScanRef>,
    context: Arc<WorkerContext>,
    workers: usize,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<ScanMessage>,
    sizes: HashMap<u32, (u64, u64)>,
) -> PipelineResult<()> {
    let worker_slots = Arc::new(Semaphore::new(workers));
    let mut join_set = JoinSet::new();

    for scan in scans {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = worker_slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (raw_bytes, averaged_bytes) = sizes.get(&scan.index).copied().unwrap_or_default();
        let reservation = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            reserved = context.staging.reserve(raw_bytes + averaged_bytes) => reserved,
        };
        let reservation = match reservation {
            Ok(reservation) => reservation,
            Err(e) => {
                let e = e.for_scan(scan.index);
                let _ = tx.send(ScanMessage {
                    scan,
                    result: Err(e),
                });
                break;
            }
        };

        debug!(
            "Admitted scan {} ({} staging bytes)",
            scan.index,
            reservation.bytes()
        );
        let context = context.clone();
        let tx = tx.clone();
        join_set.spawn(async move {
            let result = process_scan(&context, &scan, reservation, averaged_bytes, permit).await;
            let _ = tx.send(ScanMessage { scan, result });
        });
    }
    drop(tx);

    while let Some(joined) = join_set.join_next().await {
        if let Err(e) = joined {
            error!("Scan worker panicked: {}", e);
        }
    }
    Ok(())
}

/// Read, serialize and average one scan.
async fn process_scan(
    context: &WorkerContext,
    scan: &ScanRef,
    mut reservation: StagingReservation,
    averaged_bytes: u64,
    _permit: OwnedSemaphorePermit,
) -> PipelineResult<ScanProduct> {
    let target = target_name(context.source.as_ref(), scan.target_id);
    let tag = |e: PipelineError| e.for_target(&target).for_scan(scan.index);

    let averaged_reservation = if context.averaging.enabled() {
        Some(reservation.split(averaged_bytes).ok_or_else(|| {
            PipelineError::staging_exceeded("reservation too small to split")
                .with_context(ErrorContext::new("stage_scan"))
        }).map_err(tag)?)
    } else {
        None
    };

    let mut raw = context
        .staging
        .create(&target, RAW_CLASS, reservation)
        .map_err(tag)?;

    let raw_nvis = {
        let source = context.source.clone();
        let scan_ref = scan.clone();
        let path = raw.path().to_path_buf();
        let descriptor = staged_descriptor(&context.descriptor, &target);
        tokio::task::spawn_blocking(move || -> PipelineResult<u64> {
            let data = source.read_scan(&scan_ref)?;
            let mut writer = UvWriter::create(&path, descriptor)?;
            let written = writer.write_scan(&data)?;
            writer.finish()?;
            Ok(written)
        })
        .await
        .map_err(|e| {
            PipelineError::io(format!("serializer task failed: {}", e))
                .with_context(ErrorContext::new("stage_scan"))
        })
        .and_then(|r| r)
        .map_err(tag)?
    };
    debug!("Staged scan {} of '{}': {} visibilities", scan.index, target, raw_nvis);

    let Some(averaged_reservation) = averaged_reservation else {
        raw.shrink_to_fit().map_err(tag)?;
        return Ok(ScanProduct {
            file: raw,
            raw_nvis,
            averaging: None,
        });
    };

    let mut averaged = context
        .staging
        .create(&target, AVERAGED_CLASS, averaged_reservation)
        .map_err(tag)?;
    let report = context
        .averaging
        .average(scan.index, &target, raw.path(), averaged.path())
        .await;
    raw.delete().map_err(tag)?;
    let report = report?;
    averaged.shrink_to_fit().map_err(tag)?;

    Ok(ScanProduct {
        file: averaged,
        raw_nvis,
        averaging: Some(report),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::GRANULE_BYTES;

    fn base() -> UvDescriptor {
        UvDescriptor::continuum(2, 4, 1, 1.284e9, 208_984.0)
    }

    #[test]
    fn test_staged_descriptor_names_the_target() {
        let staged = staged_descriptor(&base(), "PKS1934-63");
        assert_eq!(staged.object, "PKS1934-63");
        assert_eq!(staged.axes, base().axes);
        assert!(uv::file_size(&staged, 0).unwrap() > uv::file_size(&base(), 0).unwrap());
    }

    #[test]
    fn test_reservation_covers_both_staged_files() {
        let staged = staged_descriptor(&base(), "PKS1934-63");
        let mut averaged = staged.clone();
        averaged
            .random_parameters
            .push(RandomParameterKind::IntegrationTime);

        for samples in 1..3000usize {
            let (raw_share, averaged_share) = reservation_bytes(&staged, samples, true).unwrap();
            assert_eq!(raw_share % GRANULE_BYTES, 0);
            assert_eq!(averaged_share % GRANULE_BYTES, 0);
            assert!(raw_share >= uv::file_size(&staged, samples as u64).unwrap(), "n={}", samples);
            assert!(
                averaged_share >= uv::file_size(&averaged, samples as u64).unwrap(),
                "n={}",
                samples
            );
        }
    }

    #[test]
    fn test_reservation_without_averaging_is_raw_only() {
        let staged = staged_descriptor(&base(), "J0408-6545");
        let (raw_share, averaged_share) = reservation_bytes(&staged, 203, false).unwrap();
        assert_eq!(averaged_share, 0);
        assert_eq!(raw_share, whole_granules(uv::file_size(&staged, 203).unwrap()));
    }

    #[tokio::test]
    async fn test_split_reservation_leaves_the_raw_share() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = crate::staging::Catalog::new(vec![dir.path().to_path_buf()]);
        let staging = StagingStore::new(
            catalog,
            DiskId(1),
            64 * GRANULE_BYTES,
            std::time::Duration::from_secs(1),
        )
        .unwrap();
        let staged = staged_descriptor(&base(), "PKS1934-63");
        let (raw_share, averaged_share) = reservation_bytes(&staged, 2, true).unwrap();

        let mut reservation = staging.reserve(raw_share + averaged_share).await.unwrap();
        let averaged = reservation.split(averaged_share).unwrap();
        assert_eq!(averaged.bytes(), averaged_share);
        assert_eq!(reservation.bytes(), raw_share);
    }
}
