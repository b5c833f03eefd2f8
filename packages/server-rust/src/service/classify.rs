//! Request classification: converts transport-level requests into `Operation`s.
//!
//! The verb selects the action, headers carry the content type, pragmas,
//! context id, deadline and referer, and the `expand` query parameter asks a
//! factory for full documents. The body is passed through undecoded; it is
//! interpreted against the content type when a service reads it.

use std::time::Duration;

use docket_core::{Action, Pragmas};
use http::header::{CONTENT_TYPE, REFERER};
use http::{HeaderMap, Method};

use super::operation::{Operation, OperationError, CONTENT_TYPE_JSON};

pub const HEADER_PRAGMA: &str = "x-docket-pragma";
pub const HEADER_CONTEXT_ID: &str = "x-docket-context-id";
pub const HEADER_TIMEOUT_MS: &str = "x-docket-timeout-ms";

/// Requests that cannot become operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("invalid {name} header: {reason}")]
    InvalidHeader { name: &'static str, reason: String },

    #[error("invalid request path: {0}")]
    InvalidPath(String),
}

impl From<ClassifyError> for OperationError {
    fn from(err: ClassifyError) -> Self {
        Self::validation(err.to_string())
    }
}

/// Classifies one request. `target` is the path plus optional query string.
///
/// # Errors
///
/// Returns `ClassifyError` for an unmapped method, a relative path, or an
/// unreadable header.
pub fn classify(
    method: &Method,
    target: &str,
    headers: &HeaderMap,
    body: Option<String>,
) -> Result<Operation, ClassifyError> {
    let action = Action::from_http_method(method.as_str())
        .ok_or_else(|| ClassifyError::UnsupportedMethod(method.to_string()))?;

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };
    if !path.starts_with('/') {
        return Err(ClassifyError::InvalidPath(path.to_string()));
    }
    let path = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };

    let mut op = Operation::new(action, path);

    if let Some(text) = body {
        let content_type = header_str(headers, CONTENT_TYPE.as_str(), "content-type")?
            .unwrap_or(CONTENT_TYPE_JSON);
        op = op.with_raw_body(text, content_type);
    }
    if let Some(pragma) = header_str(headers, HEADER_PRAGMA, HEADER_PRAGMA)? {
        op = op.with_pragma(Pragmas::parse_header(pragma));
    }
    if let Some(context_id) = header_str(headers, HEADER_CONTEXT_ID, HEADER_CONTEXT_ID)? {
        op = op.with_context_id(context_id);
    }
    if let Some(timeout) = header_str(headers, HEADER_TIMEOUT_MS, HEADER_TIMEOUT_MS)? {
        let millis = timeout
            .trim()
            .parse::<u64>()
            .map_err(|e| ClassifyError::InvalidHeader {
                name: HEADER_TIMEOUT_MS,
                reason: e.to_string(),
            })?;
        op = op.with_timeout(Duration::from_millis(millis));
    }
    if let Some(referer) = header_str(headers, REFERER.as_str(), "referer")? {
        op = op.with_referer(referer);
    }
    if query.is_some_and(wants_expand) {
        op = op.with_expand();
    }
    Ok(op)
}

fn header_str<'a>(
    headers: &'a HeaderMap,
    key: &str,
    name: &'static str,
) -> Result<Option<&'a str>, ClassifyError> {
    headers
        .get(key)
        .map(|value| {
            value.to_str().map_err(|e| ClassifyError::InvalidHeader {
                name,
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn wants_expand(query: &str) -> bool {
    query.split('&').any(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, "true"));
        matches!(key, "expand" | "$expand") && !value.eq_ignore_ascii_case("false")
    })
}
