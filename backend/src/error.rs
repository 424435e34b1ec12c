//! Error types for pipeline operations.
//!
//! Per-scan and per-target failures are contained by the caller; only
//! [`PipelineError::is_fatal`] errors abort a run. Every error carries an
//! [`ErrorContext`] naming the target, scan, iteration and task exit status
//! where they exist.

use std::fmt;

use obit_task::TaskStatus;

use crate::store::StoreError;

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Structured context for pipeline errors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorContext {
    /// The operation being performed (e.g., "serialize_scan", "average_scan")
    pub operation: Option<String>,
    pub target: Option<String>,
    pub scan: Option<u32>,
    /// Self-calibration iteration, when inside the imaging loop
    pub iteration: Option<u32>,
    pub exit_status: Option<TaskStatus>,
    pub details: Option<String>,
}

impl ErrorContext {
    /// Create a new error context with an operation name.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Default::default()
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_scan(mut self, scan: u32) -> Self {
        self.scan = Some(scan);
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn with_exit_status(mut self, status: TaskStatus) -> Self {
        self.exit_status = Some(status);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(ref op) = self.operation {
            parts.push(format!("operation={}", op));
        }
        if let Some(ref target) = self.target {
            parts.push(format!("target={}", target));
        }
        if let Some(scan) = self.scan {
            parts.push(format!("scan={}", scan));
        }
        if let Some(iteration) = self.iteration {
            parts.push(format!("iteration={}", iteration));
        }
        if let Some(ref status) = self.exit_status {
            parts.push(format!("exit={}", status));
        }
        if let Some(ref details) = self.details {
            parts.push(format!("details={}", details));
        }
        write!(f, "[{}]", parts.join(", "))
    }
}

/// Error type for pipeline operations
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Visibility cube does not match the descriptor's axis product.
    /// The scan is skipped.
    #[error("Shape mismatch: {message} {context}")]
    ShapeMismatch {
        message: String,
        context: ErrorContext,
    },

    /// Averaging task failed on every attempt. The scan is dropped.
    #[error("Averaging task failure: {message} {context}")]
    AveragingTaskFailure {
        message: String,
        context: ErrorContext,
    },

    /// No scans survived for a target. The target is not imaged.
    #[error("Empty target: {message} {context}")]
    EmptyTarget {
        message: String,
        context: ErrorContext,
    },

    /// Imaging engine exited non-zero or crashed. The target fails.
    #[error("Imaging task failure: {message} {context}")]
    ImagingTaskFailure {
        message: String,
        context: ErrorContext,
    },

    /// Staging space could not be acquired. Fatal for the run.
    #[error("Staging capacity exceeded: {message} {context}")]
    StagingCapacityExceeded {
        message: String,
        context: ErrorContext,
    },

    /// Malformed UV file, table or manifest.
    #[error("Format error: {message} {context}")]
    Format {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {message} {context}")]
    Io {
        message: String,
        context: ErrorContext,
    },

    #[error("Configuration error: {message} {context}")]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    /// Run was cancelled before this work completed.
    #[error("Cancelled: {context}")]
    Cancelled { context: ErrorContext },

    #[error("Task error: {0}")]
    Task(#[from] obit_task::Error),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn shape_mismatch(message: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn averaging_failure(message: impl Into<String>) -> Self {
        Self::AveragingTaskFailure {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn empty_target(message: impl Into<String>) -> Self {
        Self::EmptyTarget {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn imaging_failure(message: impl Into<String>) -> Self {
        Self::ImagingTaskFailure {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn staging_exceeded(message: impl Into<String>) -> Self {
        Self::StagingCapacityExceeded {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn cancelled() -> Self {
        Self::Cancelled {
            context: ErrorContext::default(),
        }
    }

    /// Attach (replace) the structured context.
    pub fn with_context(mut self, ctx: ErrorContext) -> Self {
        if let Some(slot) = self.context_mut() {
            *slot = ctx;
        }
        self
    }

    /// Fill in the target name on whatever context is already attached.
    pub fn for_target(mut self, target: &str) -> Self {
        if let Some(ctx) = self.context_mut() {
            if ctx.target.is_none() {
                ctx.target = Some(target.to_string());
            }
        }
        self
    }

    /// Fill in the scan index on whatever context is already attached.
    pub fn for_scan(mut self, scan: u32) -> Self {
        if let Some(ctx) = self.context_mut() {
            if ctx.scan.is_none() {
                ctx.scan = Some(scan);
            }
        }
        self
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::ShapeMismatch { context, .. }
            | Self::AveragingTaskFailure { context, .. }
            | Self::EmptyTarget { context, .. }
            | Self::ImagingTaskFailure { context, .. }
            | Self::StagingCapacityExceeded { context, .. }
            | Self::Format { context, .. }
            | Self::Io { context, .. }
            | Self::Configuration { context, .. }
            | Self::Cancelled { context } => Some(context),
            Self::Task(_) | Self::Store(_) => None,
        }
    }

    fn context_mut(&mut self) -> Option<&mut ErrorContext> {
        match self {
            Self::ShapeMismatch { context, .. }
            | Self::AveragingTaskFailure { context, .. }
            | Self::EmptyTarget { context, .. }
            | Self::ImagingTaskFailure { context, .. }
            | Self::StagingCapacityExceeded { context, .. }
            | Self::Format { context, .. }
            | Self::Io { context, .. }
            | Self::Configuration { context, .. }
            | Self::Cancelled { context } => Some(context),
            Self::Task(_) | Self::Store(_) => None,
        }
    }

    /// Whether this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StagingCapacityExceeded { .. } | Self::Configuration { .. } | Self::Store(_)
        )
    }

    /// Whether this error only costs a single scan.
    pub fn is_scan_local(&self) -> bool {
        matches!(
            self,
            Self::ShapeMismatch { .. }
                | Self::AveragingTaskFailure { .. }
                | Self::Format { .. }
                | Self::Io { .. }
                | Self::Task(_)
        )
    }

    /// Stable snake_case name of the variant, used in failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ShapeMismatch { .. } => "shape_mismatch",
            Self::AveragingTaskFailure { .. } => "averaging_task_failure",
            Self::EmptyTarget { .. } => "empty_target",
            Self::ImagingTaskFailure { .. } => "imaging_task_failure",
            Self::StagingCapacityExceeded { .. } => "staging_capacity_exceeded",
            Self::Format { .. } => "format",
            Self::Io { .. } => "io",
            Self::Configuration { .. } => "configuration",
            Self::Cancelled { .. } => "cancelled",
            Self::Task(_) => "task",
            Self::Store(_) => "store",
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::io(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::format(err.to_string())
    }
}
