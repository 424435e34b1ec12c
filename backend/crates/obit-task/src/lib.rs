//! # obit-task
//!
//! Safe wrapper around Obit task invocation.
//!
//! The continuum pipeline treats averaging (`UVBlAvg`) and imaging
//! (`MFImage`) as opaque external tasks. This crate owns the boundary:
//! named parameter sets, their rendering into Obit parameter files, and
//! launching the task executable with a timeout while capturing its log.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use obit_task::{ProcessTaskRunner, TaskParams, TaskRunner, TaskSpec};
//!
//! # async fn demo() -> obit_task::Result<()> {
//! let runner = ProcessTaskRunner::new("/opt/obit/bin", "/tmp/contim");
//! let params = TaskParams::new()
//!     .with("inName", "target")
//!     .with("FOV", 1.0)
//!     .with("chAvg", 8i64);
//! let spec = TaskSpec::new("UVBlAvg", params).with_timeout(Duration::from_secs(3600));
//! let outcome = runner.run(&spec).await?;
//! assert!(outcome.is_success());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod params;
pub mod runner;

pub use error::{Error, Result};
pub use params::{ParamValue, TaskParams};
pub use runner::{ProcessTaskRunner, TaskOutcome, TaskRunner, TaskSpec, TaskStatus};
