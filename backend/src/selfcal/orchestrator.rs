//! Per-target self-calibration loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::engine::{ImagingEngine, ImagingOutcome, ImagingRequest};
use super::state::{CalibrationMode, ConvergenceState, QualityMetric, SelfCalState};
use crate::concat::AccumulatedTarget;
use crate::config::BandSettings;
use crate::error::{ErrorContext, PipelineError, PipelineResult};
use crate::staging::{Catalog, DiskId, FileKind};

/// Catalog class of calibrated visibilities written by each pass.
pub const CALIBRATED_CLASS: &str = "mfimage";
/// Catalog class of clean images.
pub const IMAGE_CLASS: &str = "clean";

/// One engine pass inside the loop.
#[derive(Debug, Clone)]
pub struct PassRecord {
    pub iteration: u32,
    pub mode: CalibrationMode,
    pub outcome: ImagingOutcome,
}

/// Files the publisher reads for a finished target.
#[derive(Debug, Clone, PartialEq)]
pub struct SelfCalProducts {
    pub clean_image: PathBuf,
    /// Output of the latest self-calibration pass, if any ran
    pub solution_uv: Option<PathBuf>,
    pub converged: bool,
    /// Statistics of `clean_image`
    pub quality: QualityMetric,
}

#[derive(Debug)]
pub struct SelfCalResult {
    pub target: String,
    pub state: ConvergenceState,
    pub passes: Vec<PassRecord>,
    /// The last clean, run only after convergence
    pub final_pass: Option<ImagingOutcome>,
    pub error: Option<PipelineError>,
}

impl SelfCalResult {
    pub fn status(&self) -> SelfCalState {
        self.state.state
    }

    /// Stop the loop on `error`: `Cancelled` for a cancellation, `Failed` otherwise.
    fn abort(&mut self, error: PipelineError) {
        if matches!(error, PipelineError::Cancelled { .. }) {
            self.state.cancel();
        } else {
            self.state.fail();
        }
        self.error = Some(error);
    }

    /// Products to publish; `None` unless the loop converged or exhausted.
    pub fn products(&self) -> Option<SelfCalProducts> {
        let upto = match self.state.state {
            SelfCalState::Converged => self.passes.len(),
            SelfCalState::Exhausted => {
                let (best, _) = self.state.best?;
                best as usize + 1
            }
            _ => return None,
        };
        let passes = self.passes.get(..upto)?;
        let solution_uv = passes
            .iter()
            .rev()
            .find(|p| p.mode != CalibrationMode::None)
            .map(|p| p.outcome.artifacts.uv_output.clone());
        let image = match (&self.final_pass, self.state.state) {
            (Some(last), SelfCalState::Converged) => last,
            _ => &passes.last()?.outcome,
        };
        Some(SelfCalProducts {
            clean_image: image.artifacts.clean_image.clone(),
            quality: image.quality,
            solution_uv,
            converged: self.state.state == SelfCalState::Converged,
        })
    }
}

/// Drives the imaging engine through the self-calibration state machine.
///
/// Engine calls from every orchestrator sharing `gate` are serialized.
pub struct SelfCalOrchestrator {
    engine: Arc<dyn ImagingEngine>,
    catalog: Catalog,
    work_disk: DiskId,
    gate: Arc<Mutex<()>>,
    cancel: CancellationToken,
}

impl SelfCalOrchestrator {
    pub fn new(
        engine: Arc<dyn ImagingEngine>,
        catalog: Catalog,
        work_disk: DiskId,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            catalog,
            work_disk,
            gate: Arc::new(Mutex::new(())),
            cancel,
        }
    }

    /// Share an engine gate with other orchestrators.
    pub fn with_gate(mut self, gate: Arc<Mutex<()>>) -> Self {
        self.gate = gate;
        self
    }

    /// Run the loop on a merged target until it reaches a terminal state.
    pub async fn run(&self, target: &AccumulatedTarget, band: &BandSettings) -> SelfCalResult {
        let mut result = SelfCalResult {
            target: target.target.clone(),
            state: ConvergenceState::new(band),
            passes: Vec::new(),
            final_pass: None,
            error: None,
        };
        let mut input = target.path().to_path_buf();

        while !result.state.state.is_terminal() {
            let iteration = result.state.iteration;
            let mode = result.state.mode();
            let outcome = match self
                .pass(target, band, &input, iteration, mode, false, &mut result.state)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    result.abort(e);
                    return result;
                }
            };
            let next = result.state.record_pass(outcome.quality);
            info!(
                "'{}' pass {} ({:?}): dynamic range {:.1} against {:.1}, now {:?}",
                target.target,
                iteration,
                mode,
                outcome.quality.dynamic_range(),
                band.quality_threshold,
                next
            );
            input = outcome.artifacts.uv_output.clone();
            result.passes.push(PassRecord {
                iteration,
                mode,
                outcome,
            });
        }

        match result.state.state {
            SelfCalState::Converged => {
                let iteration = result.state.iteration;
                match self
                    .pass(
                        target,
                        band,
                        &input,
                        iteration,
                        CalibrationMode::None,
                        true,
                        &mut result.state,
                    )
                    .await
                {
                    Ok(outcome) => result.final_pass = Some(outcome),
                    Err(e) => result.abort(e),
                }
            }
            SelfCalState::Exhausted => {
                if let Some((best, quality)) = result.state.best {
                    warn!(
                        "'{}' did not reach dynamic range {:.1} after {} passes; keeping pass {} ({:.1})",
                        target.target,
                        band.quality_threshold,
                        result.state.iteration,
                        best,
                        quality.dynamic_range()
                    );
                }
            }
            _ => {}
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn pass(
        &self,
        target: &AccumulatedTarget,
        band: &BandSettings,
        input: &Path,
        iteration: u32,
        mode: CalibrationMode,
        final_pass: bool,
        state: &mut ConvergenceState,
    ) -> PipelineResult<ImagingOutcome> {
        let context = || {
            ErrorContext::new("selfcal_pass")
                .with_target(&target.target)
                .with_iteration(iteration)
        };
        let uv_output = self
            .catalog
            .allocate(self.work_disk, &target.target, CALIBRATED_CLASS, FileKind::Uv)?;
        let clean_image = self
            .catalog
            .allocate(self.work_disk, &target.target, IMAGE_CLASS, FileKind::Image)?;
        let request = ImagingRequest {
            target: target.target.clone(),
            uv_input: input.to_path_buf(),
            descriptor: target.descriptor.clone(),
            iteration,
            mode,
            final_pass,
            band: band.clone(),
            uv_output: uv_output.path,
            clean_image: clean_image.path,
        };

        let _gate = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(PipelineError::cancelled().with_context(context()));
            }
            guard = self.gate.lock() => guard,
        };
        if self.cancel.is_cancelled() {
            return Err(PipelineError::cancelled().with_context(context()));
        }
        state.invoked();
        self.engine.run(&request).await
    }
}
