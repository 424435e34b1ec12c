//! The imaging engine seam and its `MFImage` implementation.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use obit_task::{TaskParams, TaskRunner, TaskSpec, TaskStatus};
use serde::{Deserialize, Serialize};

use super::state::{CalibrationMode, QualityMetric};
use crate::config::{BandSettings, ImagingSettings};
use crate::error::{ErrorContext, PipelineError, PipelineResult};
use crate::models::{AxisKind, UvDescriptor};
use crate::tables::{EngineTable, CLEAN_TABLE};

pub const TASK_NAME: &str = "MFImage";

/// One engine pass over a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagingRequest {
    pub target: String,
    /// Visibilities to image; the previous pass's calibrated output after the first
    pub uv_input: PathBuf,
    pub descriptor: UvDescriptor,
    pub iteration: u32,
    pub mode: CalibrationMode,
    /// Final clean without self-calibration
    pub final_pass: bool,
    pub band: BandSettings,
    pub uv_output: PathBuf,
    pub clean_image: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagingArtifacts {
    /// Calibrated visibilities carrying the `AIPS SN` table
    pub uv_output: PathBuf,
    /// Clean image carrying the `AIPS CC` table
    pub clean_image: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagingOutcome {
    pub status: TaskStatus,
    pub artifacts: ImagingArtifacts,
    pub quality: QualityMetric,
}

/// Runs one imaging (and optional self-calibration) pass.
///
/// A pass that ran but failed is an `ImagingTaskFailure`.
#[async_trait]
pub trait ImagingEngine: Send + Sync {
    async fn run(&self, request: &ImagingRequest) -> PipelineResult<ImagingOutcome>;
}

/// Read the quality keywords the engine leaves on the clean-component table.
pub fn read_quality(clean_image: &std::path::Path) -> PipelineResult<QualityMetric> {
    let table = EngineTable::read_latest(clean_image, CLEAN_TABLE)?;
    let keyword = |name: &str| {
        table.keyword_f64(name).ok_or_else(|| {
            PipelineError::format(format!("{} table has no {} keyword", CLEAN_TABLE, name))
                .with_context(
                    ErrorContext::new("read_quality")
                        .with_details(clean_image.display().to_string()),
                )
        })
    };
    Ok(QualityMetric {
        peak_flux: keyword("PEAKFLUX")?,
        peak_residual: keyword("PEAKRES")?,
        rms: keyword("IMRMS")?,
    })
}

/// Total bandwidth over the reference frequency.
pub fn fractional_bandwidth(descriptor: &UvDescriptor) -> f64 {
    let Some(freq) = descriptor.axis(AxisKind::Frequency) else {
        return 0.0;
    };
    if freq.ref_value == 0.0 {
        return 0.0;
    }
    let nif = descriptor.axis_len(AxisKind::SpectralWindow) as f64;
    (freq.length as f64 * freq.increment * nif / freq.ref_value).abs()
}

/// Drives `MFImage` through a [`TaskRunner`].
pub struct ObitImagingEngine {
    runner: Arc<dyn TaskRunner>,
    settings: ImagingSettings,
    overrides: TaskParams,
    prt_lv: i64,
    threads: usize,
}

impl ObitImagingEngine {
    pub fn new(
        runner: Arc<dyn TaskRunner>,
        settings: ImagingSettings,
        prt_lv: i64,
    ) -> PipelineResult<Self> {
        let overrides = settings.override_params()?;
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Ok(Self {
            runner,
            settings,
            overrides,
            prt_lv,
            threads,
        })
    }

    pub fn task_spec(&self, request: &ImagingRequest) -> TaskSpec {
        let band = &request.band;
        let (psc_loops, asc_loops) = match (request.final_pass, request.mode) {
            (true, _) | (_, CalibrationMode::None) => (0i64, 0i64),
            (false, CalibrationMode::Phase) => (1, 0),
            (false, CalibrationMode::AmplitudePhase) => (0, 1),
        };

        let mut params = TaskParams::new()
            .with("DataType", "UV")
            .with("inFile", request.uv_input.display().to_string())
            .with("outDType", "UV")
            .with("outFile", request.clean_image.display().to_string())
            .with("out2File", request.uv_output.display().to_string())
            .with("Sources", vec![request.target.clone()])
            .with("maxFBW", fractional_bandwidth(&request.descriptor) / 20.0)
            .with("nThreads", self.threads as i64)
            .with("prtLv", self.prt_lv)
            .with("FOV", band.fov)
            .with("Niter", band.niter)
            .with("minFluxPSC", band.min_flux_psc)
            .with("minFluxASC", band.min_flux_asc)
            .with("solPInt", band.sol_p_int)
            .with("solAInt", band.sol_a_int)
            .with("maxPSCLoop", psc_loops)
            .with("maxASCLoop", asc_loops)
            .with("refAnt", band.ref_ant);
        params.merge(&self.overrides);
        TaskSpec::new(TASK_NAME, params).with_timeout(self.settings.timeout())
    }
}

#[async_trait]
impl ImagingEngine for ObitImagingEngine {
    async fn run(&self, request: &ImagingRequest) -> PipelineResult<ImagingOutcome> {
        let context = || {
            ErrorContext::new("run_imaging")
                .with_target(&request.target)
                .with_iteration(request.iteration)
        };
        let spec = self.task_spec(request);
        debug!("{} arguments: {:?}", TASK_NAME, spec.params);

        let outcome = self.runner.run(&spec).await?;
        if !outcome.is_success() {
            let details = outcome
                .log
                .last()
                .cloned()
                .unwrap_or_else(|| "no task output".to_string());
            return Err(PipelineError::imaging_failure(format!(
                "{} pass {} failed",
                TASK_NAME, request.iteration
            ))
            .with_context(
                context()
                    .with_exit_status(outcome.status)
                    .with_details(details),
            ));
        }

        let quality = read_quality(&request.clean_image).map_err(|e| {
            PipelineError::imaging_failure(e.to_string()).with_context(
                context().with_exit_status(outcome.status),
            )
        })?;
        info!(
            "{} pass {} on '{}': peak {:.4} Jy, rms {:.2e}, DR {:.0}",
            TASK_NAME,
            request.iteration,
            request.target,
            quality.peak_flux,
            quality.rms,
            quality.dynamic_range()
        );
        Ok(ImagingOutcome {
            status: outcome.status,
            artifacts: ImagingArtifacts {
                uv_output: request.uv_output.clone(),
                clean_image: request.clean_image.clone(),
            },
            quality,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::Keyword;

    fn request(mode: CalibrationMode, final_pass: bool) -> ImagingRequest {
        ImagingRequest {
            target: "PKS1934".to_string(),
            uv_input: PathBuf::from("/work/PKS1934.merge.1.uv"),
            descriptor: UvDescriptor::continuum(2, 1024, 1, 1.284e9, 835_937.5),
            iteration: 2,
            mode,
            final_pass,
            band: BandSettings::default(),
            uv_output: PathBuf::from("/work/PKS1934.mfimage.1.uv"),
            clean_image: PathBuf::from("/work/PKS1934.clean.1.img"),
        }
    }

    struct NoRunner;

    #[async_trait]
    impl TaskRunner for NoRunner {
        async fn run(&self, _spec: &TaskSpec) -> obit_task::Result<obit_task::TaskOutcome> {
            Ok(obit_task::TaskOutcome::failed(7))
        }
    }

    fn engine(overrides: &str) -> ObitImagingEngine {
        let settings = ImagingSettings {
            overrides: overrides.to_string(),
            ..Default::default()
        };
        ObitImagingEngine::new(Arc::new(NoRunner), settings, 1).unwrap()
    }

    #[test]
    fn test_fractional_bandwidth() {
        let desc = UvDescriptor::continuum(2, 1024, 1, 1.284e9, 835_937.5);
        let fbw = fractional_bandwidth(&desc);
        assert!((fbw - 856.0e6 / 1.284e9).abs() < 1e-9);
    }

    #[test]
    fn test_loop_parameters_follow_mode() {
        let engine = engine("");
        let spec = engine.task_spec(&request(CalibrationMode::Phase, false));
        assert_eq!(spec.params.get_i64("maxPSCLoop"), Some(1));
        assert_eq!(spec.params.get_i64("maxASCLoop"), Some(0));

        let spec = engine.task_spec(&request(CalibrationMode::AmplitudePhase, true));
        assert_eq!(spec.params.get_i64("maxPSCLoop"), Some(0));
        assert_eq!(spec.params.get_i64("maxASCLoop"), Some(0));
        assert_eq!(spec.params.get_i64("Niter"), Some(5000));
    }

    #[test]
    fn test_overrides_applied_last() {
        let spec = engine("Niter=100; FOV=0.5").task_spec(&request(CalibrationMode::None, false));
        assert_eq!(spec.params.get_i64("Niter"), Some(100));
        assert_eq!(spec.params.get_f64("FOV"), Some(0.5));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_imaging_failure() {
        let err = engine("")
            .run(&request(CalibrationMode::Phase, false))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ImagingTaskFailure { .. }));
        let ctx = err.context().unwrap();
        assert_eq!(ctx.iteration, Some(2));
        assert_eq!(ctx.exit_status, Some(TaskStatus::Failed(Some(7))));
    }

    #[test]
    fn test_read_quality() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("t.clean.1.img");
        let mut table = EngineTable::new(CLEAN_TABLE, 1);
        table.set_keyword("PEAKFLUX", Keyword::double(2.5));
        table.set_keyword("PEAKRES", Keyword::double(0.01));
        table.set_keyword("IMRMS", Keyword::double(0.0025));
        table.write(&image).unwrap();

        let quality = read_quality(&image).unwrap();
        assert_eq!(quality.peak_flux, 2.5);
        assert!((quality.dynamic_range() - 1000.0).abs() < 1e-9);

        let missing = dir.path().join("none.img");
        assert!(read_quality(&missing).is_err());
    }
}
