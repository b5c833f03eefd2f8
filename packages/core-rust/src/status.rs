//! Status outcomes and the structured error body.

use serde::{Deserialize, Serialize};

/// Outcome status of a completed operation, numbered like HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum StatusCode {
    Ok,
    /// Update accepted but the state did not change.
    NotModified,
    BadRequest,
    NotFound,
    Timeout,
    Conflict,
    InternalError,
    ServiceUnavailable,
}

impl StatusCode {
    #[must_use]
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::NotModified => 304,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::Timeout => 408,
            Self::Conflict => 409,
            Self::InternalError => 500,
            Self::ServiceUnavailable => 503,
        }
    }

    /// Returns `true` for 2xx and 3xx outcomes.
    #[must_use]
    pub fn is_success(self) -> bool {
        self.as_u16() < 400
    }
}

impl From<StatusCode> for u16 {
    fn from(status: StatusCode) -> Self {
        status.as_u16()
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            200 => Ok(Self::Ok),
            304 => Ok(Self::NotModified),
            400 => Ok(Self::BadRequest),
            404 => Ok(Self::NotFound),
            408 => Ok(Self::Timeout),
            409 => Ok(Self::Conflict),
            500 => Ok(Self::InternalError),
            503 => Ok(Self::ServiceUnavailable),
            other => Err(format!("unsupported status code {other}")),
        }
    }
}

/// Structured error body carried by every failed operation.
///
/// `message` is a human-readable description of the condition; it names the
/// offending field when that is known and is never a backtrace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceErrorResponse {
    pub message: String,
    pub status_code: u16,
    /// Stable machine-readable code, e.g. `"conflict"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl ServiceErrorResponse {
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: status.as_u16(),
            error_code: None,
        }
    }

    #[must_use]
    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }
}
