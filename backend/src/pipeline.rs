//! The continuum pipeline: select scans, stage and average them, merge per
//! target, self-calibrate, publish and export.
//!
//! In [`RunMode::ExportOnly`] the run stops after the merge and leaves one
//! merged UV file per target on the work disk.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{info, warn};
use obit_task::TaskRunner;
use tokio_util::sync::CancellationToken;

use crate::averaging::AveragingInvoker;
use crate::concat::{AccumulatedTarget, MERGE_CLASS};
use crate::config::{BandSettings, ImagingSettings, PipelineConfig, RunMode};
use crate::error::{ErrorContext, PipelineError, PipelineResult};
use crate::export::ImageExporter;
use crate::models::{AxisKind, ScanRef, Target};
use crate::publish::{load_products, FailureRecord, SolutionPublisher};
use crate::scheduler::{ScanScheduler, ScheduleOutcome};
use crate::selfcal::{
    ImagingEngine, ObitImagingEngine, SelfCalOrchestrator, SelfCalProducts, SelfCalState,
    CALIBRATED_CLASS, IMAGE_CLASS,
};
use crate::source::ObservationSource;
use crate::staging::{Catalog, DiskId, StagingStore};
use crate::store::{StateStore, StoreError};
use crate::tracker::{LogLevel, RunReport, RunTracker, TargetStatus};

/// Catalog disk of the staging area.
pub const STAGING_DISK: DiskId = DiskId(1);
/// Catalog disk of merged targets and imaging output.
pub const WORK_DISK: DiskId = DiskId(2);

/// Which scans and targets to process; empty lists select everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanSelection {
    pub scans: Vec<u32>,
    pub targets: Vec<String>,
}

/// Most scans a single range in a scan list may name.
pub const MAX_SCAN_RANGE: u32 = 10_000;

/// Parse a scan list such as `1,3,5-8`.
pub fn parse_scan_list(raw: &str) -> PipelineResult<Vec<u32>> {
    let invalid = |part: &str| {
        PipelineError::configuration(format!("invalid scan selection '{}'", part))
            .with_context(ErrorContext::new("parse_scan_list"))
    };
    let mut scans = BTreeSet::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u32 = start.trim().parse().map_err(|_| invalid(part))?;
                let end: u32 = end.trim().parse().map_err(|_| invalid(part))?;
                if start > end || end - start >= MAX_SCAN_RANGE {
                    return Err(invalid(part));
                }
                scans.extend(start..=end);
            }
            None => {
                scans.insert(part.parse().map_err(|_| invalid(part))?);
            }
        }
    }
    Ok(scans.into_iter().collect())
}

pub struct ContinuumPipeline {
    config: PipelineConfig,
    source: Arc<dyn ObservationSource>,
    runner: Arc<dyn TaskRunner>,
    engine: Arc<dyn ImagingEngine>,
    store: Arc<dyn StateStore>,
    selection: ScanSelection,
    capture_block_id: String,
    cancel: CancellationToken,
}

impl ContinuumPipeline {
    /// Pipeline running both tasks through `runner`.
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn ObservationSource>,
        runner: Arc<dyn TaskRunner>,
        store: Arc<dyn StateStore>,
        cancel: CancellationToken,
    ) -> PipelineResult<Self> {
        let engine = Arc::new(ObitImagingEngine::new(
            runner.clone(),
            config.imaging.clone(),
            config.obit.prt_lv,
        )?);
        let capture_block_id = source.metadata().id.clone();
        Ok(Self {
            config,
            source,
            runner,
            engine,
            store,
            selection: ScanSelection::default(),
            capture_block_id,
            cancel,
        })
    }

    pub fn with_engine(mut self, engine: Arc<dyn ImagingEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_selection(mut self, selection: ScanSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_capture_block_id(mut self, id: impl Into<String>) -> Self {
        self.capture_block_id = id.into();
        self
    }

    /// Observation part of every state-store key: `<capture block>_<output id>`.
    pub fn observation_key(&self) -> String {
        format!("{}_{}", self.capture_block_id, self.config.output.output_id)
    }

    /// Run to completion and return the report. Never fails; run-level
    /// errors end up in the report's status and error fields.
    pub async fn execute(&self) -> RunReport {
        let tracker = RunTracker::new(&self.observation_key());
        info!(
            "Run {} for observation {}",
            tracker.run_id(),
            self.observation_key()
        );
        match self.run(&tracker).await {
            Ok(true) => {
                warn!("Run cancelled; unfinished targets were not published");
                tracker.log(LogLevel::Warning, "Run cancelled");
                tracker.cancel();
            }
            Ok(false) => {
                tracker.log(LogLevel::Success, "Run completed");
                tracker.complete();
            }
            Err(e) => {
                log::error!("Run failed: {}", e);
                tracker.fail(e.to_string());
            }
        }
        tracker.snapshot()
    }

    /// Selected scans in time order.
    pub fn select_scans(&self) -> PipelineResult<Vec<ScanRef>> {
        let metadata = self.source.metadata();
        let mut target_ids = BTreeSet::new();
        for name in &self.selection.targets {
            let target = metadata
                .targets
                .iter()
                .find(|t| &t.name == name)
                .ok_or_else(|| {
                    PipelineError::configuration(format!("unknown target '{}'", name))
                        .with_context(ErrorContext::new("select_scans").with_target(name))
                })?;
            target_ids.insert(target.id);
        }
        Ok(self
            .source
            .scans()
            .into_iter()
            .filter(|s| self.selection.scans.is_empty() || self.selection.scans.contains(&s.index))
            .filter(|s| target_ids.is_empty() || target_ids.contains(&s.target_id))
            .collect())
    }

    /// Returns whether the run was cancelled.
    async fn run(&self, tracker: &RunTracker) -> PipelineResult<bool> {
        if !self.store.health_check().await? {
            return Err(StoreError::connection("state store is not healthy").into());
        }
        let disks = &self.config.disks;
        for dir in [&disks.staging, &disks.work] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                PipelineError::configuration(format!("cannot create {}: {}", dir.display(), e))
                    .with_context(ErrorContext::new("prepare_disks"))
            })?;
        }

        let metadata = self.source.metadata();
        let catalog = Catalog::new(vec![disks.staging.clone(), disks.work.clone()]);
        let staging = StagingStore::new(
            catalog.clone(),
            STAGING_DISK,
            self.config.staging.capacity_bytes,
            self.config.staging.acquire_timeout(),
        )?;
        let averaging = AveragingInvoker::new(
            self.runner.clone(),
            self.config.averaging.clone(),
            self.config.obit.prt_lv,
            metadata.nchan,
        )?;

        let scans = self.select_scans()?;
        if scans.is_empty() {
            warn!("No scans selected");
            tracker.log(LogLevel::Warning, "No scans selected");
            return Ok(false);
        }

        let start_time = scans
            .iter()
            .map(|s| s.start_time)
            .fold(f64::INFINITY, f64::min);
        let mut exposure: BTreeMap<u32, f64> = BTreeMap::new();
        for scan in &scans {
            *exposure.entry(scan.target_id).or_default() +=
                (scan.end_time - scan.start_time).max(0.0) / 3600.0;
        }

        let scheduler = ScanScheduler::new(
            self.source.clone(),
            staging,
            averaging,
            WORK_DISK,
            self.config.staging.workers,
            tracker.clone(),
            self.cancel.clone(),
        );
        let outcome = scheduler.run(scans).await?;
        if outcome.cancelled {
            return Ok(true);
        }
        if self.config.output.mode == RunMode::ExportOnly {
            self.report_merged(tracker, outcome);
            return Ok(false);
        }

        let band_key = ImagingSettings::band_key(metadata);
        let band = self.config.imaging.for_band(&band_key).clone();
        info!(
            "Imaging with '{}' settings: threshold {}, {} phase and {} amplitude+phase loops",
            band_key, band.quality_threshold, band.max_phase_loops, band.max_amp_phase_loops
        );
        let publisher = SolutionPublisher::new(self.store.clone(), self.observation_key());
        let orchestrator = SelfCalOrchestrator::new(
            self.engine.clone(),
            catalog.clone(),
            WORK_DISK,
            self.cancel.clone(),
        );
        let exporter = self.config.output.export_dir.as_ref().map(|dir| {
            Arc::new(ImageExporter::new(
                dir,
                self.capture_block_id.clone(),
                self.config.output.output_id.clone(),
            ))
        });

        let mut cancelled = false;
        for (target_id, merged) in outcome.targets {
            let Some(target) = metadata.target(target_id) else {
                continue;
            };
            let merged = match merged {
                Ok(merged) => merged,
                Err(PipelineError::EmptyTarget { .. }) => continue,
                Err(e) => {
                    publisher
                        .publish_failure(FailureRecord::from_error(&target.name, &e))
                        .await?;
                    continue;
                }
            };
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let export = exporter
                .as_ref()
                .map(|e| (e, exposure.get(&target_id).copied().unwrap_or(0.0)));
            if self
                .image_target(
                    tracker,
                    &orchestrator,
                    &publisher,
                    target,
                    &merged,
                    &band,
                    export,
                )
                .await?
            {
                cancelled = true;
                break;
            }
        }

        if !cancelled {
            if let Some(exporter) = &exporter {
                if let Err(e) = exporter.finish(metadata, start_time, &tracker.snapshot()) {
                    warn!("Could not write export documents: {}", e);
                    tracker.log(
                        LogLevel::Warning,
                        format!("Export documents not written: {}", e),
                    );
                }
            }
            self.clobber(&catalog);
        }
        Ok(cancelled)
    }

    /// Record every merged target as exported.
    fn report_merged(&self, tracker: &RunTracker, outcome: ScheduleOutcome) {
        for merged in outcome.targets.into_values().flatten() {
            let descriptor = &merged.descriptor;
            info!(
                "Exported '{}': {} visibilities, {} scans, {} channels to {}",
                merged.target,
                merged.nvis,
                merged.index.len(),
                descriptor.axis_len(AxisKind::Frequency),
                merged.path().display()
            );
            tracker.update_target(&merged.target, |t| {
                t.status = TargetStatus::Exported;
                t.products.push(merged.path().display().to_string());
            });
        }
    }

    /// Copy the final image of `target` into the export directory. Export
    /// problems are logged; the target keeps its published state.
    async fn export_target(
        &self,
        tracker: &RunTracker,
        exporter: &Arc<ImageExporter>,
        target: &Target,
        products: SelfCalProducts,
        hours: f64,
    ) {
        let name = target.name.as_str();
        let (exporter, owned) = (exporter.clone(), target.clone());
        let exported =
            tokio::task::spawn_blocking(move || exporter.export_image(&owned, &products, hours))
                .await
                .map_err(|e| {
                    PipelineError::io(format!("image export failed: {}", e))
                        .with_context(ErrorContext::new("export_image").with_target(name))
                })
                .and_then(|r| r);
        match exported {
            Ok(image) => tracker.update_target(name, |t| {
                t.products.push(image.path.display().to_string());
            }),
            Err(e) => {
                warn!("Image of '{}' not exported: {}", name, e);
                tracker.target_log(
                    name,
                    None,
                    LogLevel::Warning,
                    format!("Image not exported: {}", e),
                );
            }
        }
    }

    /// Self-calibrate, publish and optionally export one target. Returns
    /// whether it was cancelled. `export` pairs the exporter with the hours
    /// spent on the target.
    #[allow(clippy::too_many_arguments)]
    async fn image_target(
        &self,
        tracker: &RunTracker,
        orchestrator: &SelfCalOrchestrator,
        publisher: &SolutionPublisher,
        target: &Target,
        merged: &AccumulatedTarget,
        band: &BandSettings,
        export: Option<(&Arc<ImageExporter>, f64)>,
    ) -> PipelineResult<bool> {
        let name = target.name.as_str();
        tracker.set_target_status(name, TargetStatus::Imaging);
        tracker.target_log(
            name,
            None,
            LogLevel::Info,
            format!("Imaging {} visibilities", merged.nvis),
        );

        let result = orchestrator.run(merged, band).await;
        tracker.update_target(name, |t| {
            t.iterations = result.state.iteration;
            t.engine_invocations = result.state.invocations;
            t.quality = result.state.best.map(|(_, q)| q.dynamic_range());
        });

        match result.status() {
            SelfCalState::Converged | SelfCalState::Exhausted => {}
            SelfCalState::Cancelled => {
                info!("Self-calibration of '{}' cancelled", name);
                return Ok(true);
            }
            _ => {
                let error = result.error.unwrap_or_else(|| {
                    PipelineError::imaging_failure("self-calibration stopped without a result")
                        .with_context(ErrorContext::new("selfcal").with_target(name))
                });
                tracker.fail_target(name, error.to_string());
                publisher
                    .publish_failure(FailureRecord::from_error(name, &error))
                    .await?;
                return Ok(false);
            }
        }

        let Some(products) = result.products() else {
            return Ok(false);
        };
        let owned = (target.clone(), self.source.metadata().clone(), products.clone());
        let loaded = tokio::task::spawn_blocking(move || {
            let (target, metadata, products) = owned;
            load_products(&target, &products, &metadata)
        })
        .await
        .map_err(|e| {
            PipelineError::io(format!("product reader failed: {}", e))
                .with_context(ErrorContext::new("load_products").with_target(name))
        })?;

        let (solution, model) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                tracker.fail_target(name, e.to_string());
                publisher
                    .publish_failure(FailureRecord::from_error(name, &e))
                    .await?;
                return Ok(false);
            }
        };
        let receipt = publisher.publish(name, &solution, &model).await?;
        let status = if result.status() == SelfCalState::Converged {
            TargetStatus::Converged
        } else {
            TargetStatus::Exhausted
        };
        tracker.update_target(name, |t| {
            t.status = status;
            t.published_keys = receipt.keys();
        });
        tracker.target_log(
            name,
            None,
            LogLevel::Success,
            format!(
                "Published {} components and {} antenna solutions",
                model.components.len(),
                solution.antennas.len()
            ),
        );
        if let Some((exporter, hours)) = export {
            self.export_target(tracker, exporter, target, products, hours)
                .await;
        }
        Ok(false)
    }

    fn clobber(&self, catalog: &Catalog) {
        for class in &self.config.output.clobber {
            let class = match class.as_str() {
                "merge" => MERGE_CLASS,
                "clean" => IMAGE_CLASS,
                "mfimage" => CALIBRATED_CLASS,
                other => {
                    warn!("Not clobbering unknown class '{}'", other);
                    continue;
                }
            };
            let zapped = catalog.zap_class(class);
            info!("Clobbered {} '{}' files", zapped, class);
        }
    }
}
