//! Operation failure taxonomy and its status mapping.

use docket_core::{ServiceErrorResponse, StatusCode};

use crate::storage::StoreError;

/// Failure outcome of an operation.
///
/// `Display` is the user-visible message; it never carries a backtrace.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// Malformed body, wrong kind, unsupported content type or clone request.
    #[error("{message}")]
    Validation { message: String },

    /// Duplicate create, stale strict update, or rejected version check.
    #[error("{message}")]
    Conflict { message: String },

    #[error("service not found: {path}")]
    NotFound { path: String },

    /// A service or factory was registered inconsistently.
    #[error("{message}")]
    Configuration { message: String },

    /// The store or replication layer could not complete the request.
    #[error("{operation} failed: {message}")]
    Infrastructure {
        operation: &'static str,
        message: String,
    },

    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("server overloaded, try again later")]
    Overloaded,

    #[error("host unavailable: {reason}")]
    Unavailable { reason: String },

    /// Unclassified error raised by service code.
    #[error("{0}")]
    Hook(#[from] anyhow::Error),
}

impl OperationError {
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BadRequest,
            Self::Conflict { .. } => StatusCode::Conflict,
            Self::NotFound { .. } => StatusCode::NotFound,
            Self::Configuration { .. } | Self::Infrastructure { .. } | Self::Hook(_) => {
                StatusCode::InternalError
            }
            Self::Timeout { .. } => StatusCode::Timeout,
            Self::Overloaded | Self::Unavailable { .. } => StatusCode::ServiceUnavailable,
        }
    }

    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Conflict { .. } => "conflict",
            Self::NotFound { .. } => "not_found",
            Self::Configuration { .. } => "configuration",
            Self::Infrastructure { .. } => "infrastructure",
            Self::Timeout { .. } => "timeout",
            Self::Overloaded => "overloaded",
            Self::Unavailable { .. } => "unavailable",
            Self::Hook(_) => "internal",
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Structured error body for the transport boundary.
    #[must_use]
    pub fn to_response(&self) -> ServiceErrorResponse {
        ServiceErrorResponse::new(self.status_code(), self.to_string())
            .with_error_code(self.error_code())
    }
}

impl From<StoreError> for OperationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { .. } => Self::conflict(err.to_string()),
            StoreError::Serialization(_) | StoreError::Backend(_) => Self::Infrastructure {
                operation: "document store",
                message: err.to_string(),
            },
        }
    }
}
