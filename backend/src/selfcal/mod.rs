//! Self-calibration: the engine seam, the convergence state machine and the
//! per-target loop that ties them together.

pub mod engine;
pub mod orchestrator;
pub mod state;

pub use engine::{
    fractional_bandwidth, read_quality, ImagingArtifacts, ImagingEngine, ImagingOutcome,
    ImagingRequest, ObitImagingEngine,
};
pub use orchestrator::{
    PassRecord, SelfCalOrchestrator, SelfCalProducts, SelfCalResult, CALIBRATED_CLASS,
    IMAGE_CLASS,
};
pub use state::{CalibrationMode, ConvergenceState, QualityMetric, SelfCalState};
