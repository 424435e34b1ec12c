//! # Continuum imaging pipeline
//!
//! Turns a multi-scan interferometer observation into per-target calibration
//! solutions and sky models.
//!
//! ## Flow
//!
//! ```text
//! ObservationSource ─► ScanScheduler ─────────────► SelfCalOrchestrator ─► SolutionPublisher
//!                      stage, UVBlAvg, merge        MFImage loop            StateStore
//! ```
//!
//! ## Architecture
//!
//! - [`source`]: observation metadata and scan data
//! - [`uv`]: the UV file format, serializer and reader
//! - [`staging`]: disk catalog and capacity-bounded staging area
//! - [`averaging`]: baseline-dependent averaging through `UVBlAvg`
//! - [`concat`]: per-target merge in time order with an index table
//! - [`scheduler`]: concurrent scan processing
//! - [`selfcal`]: the imaging engine seam and the self-calibration loop
//! - [`publish`]: solutions and sky models written to the [`store`]
//! - [`export`]: FITS images, `metadata.json` and the QA report
//! - [`pipeline`]: the end-to-end run, reported through [`tracker`]
//!
//! External tasks run through the `obit-task` crate.

// Allow large error types - PipelineError carries structured context
#![allow(clippy::result_large_err)]

pub mod averaging;
pub mod concat;
pub mod config;
pub mod error;
pub mod export;
pub mod models;
pub mod pipeline;
pub mod publish;
pub mod scheduler;
pub mod selfcal;
pub mod source;
pub mod staging;
pub mod store;
pub mod tables;
pub mod tracker;
pub mod uv;

pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{ContinuumPipeline, ScanSelection};
