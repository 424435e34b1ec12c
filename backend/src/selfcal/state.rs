//! Self-calibration state machine.
//!
//! ```text
//!            met                         met
//! Imaging ───────► Converged ◄──── PhaseSelfCal ◄─┐ not met, phase loops left
//!    │                  ▲              │   └──────┘
//!    │ not met          │ met          │ not met, phase loops spent
//!    └─► PhaseSelfCal   └────── AmplitudePhaseSelfCal ◄─┐ not met, a+p loops left
//!                                      │  └─────────────┘
//!                                      └─► Exhausted (all loops spent)
//! ```
//!
//! Any engine failure moves to `Failed` from any non-terminal state, and a
//! cancelled run moves to `Cancelled`.

use serde::{Deserialize, Serialize};

use crate::config::BandSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfCalState {
    Imaging,
    PhaseSelfCal,
    AmplitudePhaseSelfCal,
    Converged,
    Exhausted,
    Failed,
    Cancelled,
}

impl SelfCalState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SelfCalState::Converged
                | SelfCalState::Exhausted
                | SelfCalState::Failed
                | SelfCalState::Cancelled
        )
    }

    /// Calibration applied by the engine pass run in this state.
    pub fn mode(&self) -> CalibrationMode {
        match self {
            SelfCalState::PhaseSelfCal => CalibrationMode::Phase,
            SelfCalState::AmplitudePhaseSelfCal => CalibrationMode::AmplitudePhase,
            _ => CalibrationMode::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMode {
    None,
    Phase,
    AmplitudePhase,
}

/// Image statistics reported by one engine pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityMetric {
    /// Jy/beam
    pub peak_flux: f64,
    pub peak_residual: f64,
    pub rms: f64,
}

impl QualityMetric {
    /// Peak over rms; zero when the rms is not a positive number.
    pub fn dynamic_range(&self) -> f64 {
        if self.rms > 0.0 && self.rms.is_finite() {
            self.peak_flux / self.rms
        } else {
            0.0
        }
    }

    pub fn meets(&self, threshold: f64) -> bool {
        self.dynamic_range() >= threshold
    }
}

/// Per-target progress through the self-calibration loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceState {
    pub state: SelfCalState,
    /// Passes completed so far
    pub iteration: u32,
    pub phase_loops: u32,
    pub amp_phase_loops: u32,
    pub max_phase_loops: u32,
    pub max_amp_phase_loops: u32,
    pub threshold: f64,
    pub latest: Option<QualityMetric>,
    /// Iteration and metric of the highest dynamic range seen
    pub best: Option<(u32, QualityMetric)>,
    pub invocations: u32,
}

impl ConvergenceState {
    pub fn new(band: &BandSettings) -> Self {
        Self {
            state: SelfCalState::Imaging,
            iteration: 0,
            phase_loops: 0,
            amp_phase_loops: 0,
            max_phase_loops: band.max_phase_loops,
            max_amp_phase_loops: band.max_amp_phase_loops,
            threshold: band.quality_threshold,
            latest: None,
            best: None,
            invocations: 0,
        }
    }

    /// Upper bound on loop passes: the initial image plus every self-cal loop.
    pub fn max_passes(&self) -> u32 {
        1 + self.max_phase_loops + self.max_amp_phase_loops
    }

    pub fn mode(&self) -> CalibrationMode {
        self.state.mode()
    }

    /// Count an engine invocation.
    pub fn invoked(&mut self) {
        self.invocations += 1;
    }

    /// Record the metric of the pass just run and advance.
    pub fn record_pass(&mut self, quality: QualityMetric) -> SelfCalState {
        if self.state.is_terminal() {
            return self.state;
        }
        let iteration = self.iteration;
        self.iteration += 1;
        self.latest = Some(quality);
        let improved = self
            .best
            .map(|(_, best)| quality.dynamic_range() > best.dynamic_range())
            .unwrap_or(true);
        if improved {
            self.best = Some((iteration, quality));
        }

        self.state = if quality.meets(self.threshold) {
            SelfCalState::Converged
        } else if self.phase_loops < self.max_phase_loops {
            self.phase_loops += 1;
            SelfCalState::PhaseSelfCal
        } else if self.amp_phase_loops < self.max_amp_phase_loops {
            self.amp_phase_loops += 1;
            SelfCalState::AmplitudePhaseSelfCal
        } else {
            SelfCalState::Exhausted
        };
        self.state
    }

    pub fn fail(&mut self) {
        self.state = SelfCalState::Failed;
    }

    pub fn cancel(&mut self) {
        self.state = SelfCalState::Cancelled;
    }

    pub fn self_cal_loops(&self) -> u32 {
        self.phase_loops + self.amp_phase_loops
    }
}
