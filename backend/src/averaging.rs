//! Baseline-dependent time averaging of staged scans through `UVBlAvg`.
//!
//! The task reads one staged scan and writes a (usually much smaller) file
//! in which short baselines are averaged over longer intervals. Failed
//! attempts are retried with identical parameters; once the retry budget is
//! spent the scan is reported as an [`PipelineError::AveragingTaskFailure`].

use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use obit_task::{TaskParams, TaskRunner, TaskSpec, TaskStatus};

use crate::config::AveragingSettings;
use crate::error::{ErrorContext, PipelineError, PipelineResult};
use crate::staging::catalog::remove_file_if_exists;
use crate::uv;

pub const TASK_NAME: &str = "UVBlAvg";

/// What one successful averaging run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AveragingReport {
    pub scan: u32,
    pub input_nvis: u64,
    pub output_nvis: u64,
    /// Attempts made, including the successful one
    pub attempts: u32,
    /// `Scan N 'target' averaged A to B visibilities. UVBlAvg(...)`
    pub history: String,
}

/// Invokes `UVBlAvg` on staged scans.
#[derive(Clone)]
pub struct AveragingInvoker {
    runner: Arc<dyn TaskRunner>,
    settings: AveragingSettings,
    /// Averaging parameters recorded in history lines
    averaging_params: TaskParams,
    prt_lv: i64,
}

impl AveragingInvoker {
    /// Build an invoker for an observation with `nchan` channels.
    ///
    /// Fails with a configuration error when the override string does not parse.
    pub fn new(
        runner: Arc<dyn TaskRunner>,
        settings: AveragingSettings,
        prt_lv: i64,
        nchan: usize,
    ) -> PipelineResult<Self> {
        let (avg_freq, ch_avg) = settings.channel_averaging(nchan);
        let mut averaging_params = TaskParams::new()
            .with("FOV", settings.fov)
            .with("maxInt", settings.max_int)
            .with("maxFact", settings.max_fact)
            .with("avgFreq", avg_freq)
            .with("chAvg", ch_avg);
        averaging_params.merge(&settings.override_params()?);

        Ok(Self {
            runner,
            settings,
            averaging_params,
            prt_lv,
        })
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Parameters passed on every invocation, overrides included.
    pub fn averaging_params(&self) -> &TaskParams {
        &self.averaging_params
    }

    /// Averaged channel count for `nchan` input channels.
    pub fn output_channels(&self, nchan: usize) -> usize {
        let ch_avg = self.averaging_params.get_i64("chAvg").unwrap_or(1).max(1) as usize;
        let avg_freq = self.averaging_params.get_i64("avgFreq").unwrap_or(0);
        if avg_freq > 0 && ch_avg > 1 {
            nchan.div_ceil(ch_avg)
        } else {
            nchan
        }
    }

    pub fn task_spec(&self, input: &Path, output: &Path) -> TaskSpec {
        let mut params = TaskParams::new()
            .with("DataType", "UV")
            .with("inFile", input.display().to_string())
            .with("outDType", "UV")
            .with("outFile", output.display().to_string())
            .with("prtLv", self.prt_lv);
        params.merge(&self.averaging_params);
        TaskSpec::new(TASK_NAME, params).with_timeout(self.settings.timeout())
    }

    /// Average `input` into `output`, retrying failed attempts.
    pub async fn average(
        &self,
        scan: u32,
        target: &str,
        input: &Path,
        output: &Path,
    ) -> PipelineResult<AveragingReport> {
        let input_nvis = uv::inspect(input)
            .map_err(|e| e.for_target(target).for_scan(scan))?
            .nvis;
        let spec = self.task_spec(input, output);
        let max_attempts = self.settings.retries.saturating_add(1);
        let mut last_status: Option<TaskStatus> = None;
        let mut last_problem = String::new();

        for attempt in 1..=max_attempts {
            remove_file_if_exists(output)?;
            debug!(
                "Averaging scan {} '{}' (attempt {}/{})",
                scan, target, attempt, max_attempts
            );

            match self.runner.run(&spec).await {
                Ok(outcome) if outcome.is_success() => match uv::inspect(output) {
                    Ok(info) if info.nvis > input_nvis => {
                        last_status = Some(outcome.status);
                        last_problem = format!(
                            "output grew from {} to {} visibilities",
                            input_nvis, info.nvis
                        );
                    }
                    Ok(info) => {
                        let history = self.history(scan, target, input_nvis, info.nvis);
                        info!("{}", history);
                        return Ok(AveragingReport {
                            scan,
                            input_nvis,
                            output_nvis: info.nvis,
                            attempts: attempt,
                            history,
                        });
                    }
                    Err(e) => {
                        last_status = Some(outcome.status);
                        last_problem = format!("unreadable output: {}", e);
                    }
                },
                Ok(outcome) => {
                    last_status = Some(outcome.status);
                    last_problem = outcome
                        .log
                        .last()
                        .cloned()
                        .unwrap_or_else(|| "no task output".to_string());
                }
                Err(e) => {
                    last_status = None;
                    last_problem = e.to_string();
                }
            }

            warn!(
                "{} attempt {}/{} for scan {} '{}' failed: {}",
                TASK_NAME, attempt, max_attempts, scan, target, last_problem
            );
        }

        remove_file_if_exists(output)?;
        let mut context = ErrorContext::new("average_scan")
            .with_target(target)
            .with_scan(scan)
            .with_details(last_problem);
        if let Some(status) = last_status {
            context = context.with_exit_status(status);
        }
        Err(PipelineError::averaging_failure(format!(
            "{} failed {} times",
            TASK_NAME, max_attempts
        ))
        .with_context(context))
    }

    fn history(&self, scan: u32, target: &str, input_nvis: u64, output_nvis: u64) -> String {
        let params: Vec<String> = self
            .averaging_params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!(
            "Scan {} '{}' averaged {} to {} visibilities. {}({})",
            scan,
            target,
            input_nvis,
            output_nvis,
            TASK_NAME,
            params.join(", ")
        )
    }
}
