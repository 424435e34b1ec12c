//! Error types for state store operations.

use std::fmt;

/// Result type for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Structured context for store errors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreErrorContext {
    /// The operation being performed (e.g., "put", "keys_with_prefix")
    pub operation: Option<String>,
    pub key: Option<String>,
    pub details: Option<String>,
    /// Whether the operation may succeed if repeated
    pub retryable: bool,
}

impl StoreErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl ToString) -> Self {
        self.key = Some(key.to_string());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl fmt::Display for StoreErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(ref op) = self.operation {
            parts.push(format!("operation={}", op));
        }
        if let Some(ref key) = self.key {
            parts.push(format!("key={}", key));
        }
        if let Some(ref details) = self.details {
            parts.push(format!("details={}", details));
        }
        if self.retryable {
            parts.push("retryable=true".to_string());
        }
        write!(f, "[{}]", parts.join(", "))
    }
}

/// Error type for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend unreachable or marked unhealthy.
    #[error("Connection error: {message} {context}")]
    ConnectionError {
        message: String,
        context: StoreErrorContext,
    },

    /// Value could not be encoded or decoded.
    #[error("Serialization error: {message} {context}")]
    SerializationError {
        message: String,
        context: StoreErrorContext,
    },

    /// Backend storage failed (disk, permissions).
    #[error("Storage error: {message} {context}")]
    StorageError {
        message: String,
        context: StoreErrorContext,
    },

    #[error("Configuration error: {message} {context}")]
    ConfigurationError {
        message: String,
        context: StoreErrorContext,
    },
}

impl StoreError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
            context: StoreErrorContext::default(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
            context: StoreErrorContext::default(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError {
            message: message.into(),
            context: StoreErrorContext::default(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
            context: StoreErrorContext::default(),
        }
    }

    pub fn with_context(mut self, ctx: StoreErrorContext) -> Self {
        match &mut self {
            Self::ConnectionError { context, .. }
            | Self::SerializationError { context, .. }
            | Self::StorageError { context, .. }
            | Self::ConfigurationError { context, .. } => *context = ctx,
        }
        self
    }

    pub fn context(&self) -> &StoreErrorContext {
        match self {
            Self::ConnectionError { context, .. }
            | Self::SerializationError { context, .. }
            | Self::StorageError { context, .. }
            | Self::ConfigurationError { context, .. } => context,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionError { .. }) || self.context().retryable
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::serialization(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::storage(err.to_string())
    }
}
