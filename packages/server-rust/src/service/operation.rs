//! The operation envelope: one request/response exchange with a service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use docket_core::{Action, ContextId, Document, Pragmas, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

pub use super::error::OperationError;

pub const CONTENT_TYPE_JSON: &str = "application/json";

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome delivered to the caller of an operation.
pub type OperationResult = Result<OperationResponse, OperationError>;

// ---------------------------------------------------------------------------
// Body
// ---------------------------------------------------------------------------

/// Request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Already-decoded JSON.
    Json(Value),
    /// Undecoded text, interpreted according to the operation's content type.
    Raw(String),
}

/// Who produced an operation, as far as the pipeline cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationOrigin {
    #[default]
    Client,
    /// Update synthesized by a factory from a duplicate create.
    IdempotentCreate,
    /// Delete synthesized on lazy expiry.
    Expiration,
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Request envelope. Immutable once submitted; completed exactly once.
#[derive(Debug, Clone)]
pub struct Operation {
    id: u64,
    action: Action,
    path: String,
    body: Option<Body>,
    content_type: String,
    context_id: Option<ContextId>,
    pragmas: Pragmas,
    referer: Option<String>,
    timeout: Option<Duration>,
    expand: bool,
    origin: OperationOrigin,
}

impl Operation {
    #[must_use]
    pub fn new(action: Action, path: impl Into<String>) -> Self {
        Self {
            id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
            action,
            path: path.into(),
            body: None,
            content_type: CONTENT_TYPE_JSON.to_string(),
            context_id: None,
            pragmas: Pragmas::empty(),
            referer: None,
            timeout: None,
            expand: false,
            origin: OperationOrigin::Client,
        }
    }

    #[must_use]
    pub fn discover(path: impl Into<String>) -> Self {
        Self::new(Action::Discover, path)
    }

    #[must_use]
    pub fn read(path: impl Into<String>) -> Self {
        Self::new(Action::Read, path)
    }

    #[must_use]
    pub fn create(path: impl Into<String>) -> Self {
        Self::new(Action::Create, path)
    }

    #[must_use]
    pub fn update(path: impl Into<String>) -> Self {
        Self::new(Action::Update, path)
    }

    #[must_use]
    pub fn update_merge(path: impl Into<String>) -> Self {
        Self::new(Action::UpdateMerge, path)
    }

    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Action::Delete, path)
    }

    /// New operation caused by this one. The context id is copied verbatim
    /// and the referer is this operation's path.
    #[must_use]
    pub fn derive(&self, action: Action, path: impl Into<String>) -> Self {
        let mut derived = Self::new(action, path);
        derived.context_id.clone_from(&self.context_id);
        derived.referer = Some(self.path.clone());
        derived
    }

    // -- builders ----------------------------------------------------------

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(Body::Json(body));
        self.content_type = CONTENT_TYPE_JSON.to_string();
        self
    }

    #[must_use]
    pub fn with_document(self, document: &Document) -> Self {
        self.with_body(document.to_value())
    }

    /// Attaches an undecoded payload tagged with its wire content type.
    #[must_use]
    pub fn with_raw_body(mut self, text: impl Into<String>, content_type: impl Into<String>) -> Self {
        self.body = Some(Body::Raw(text.into()));
        self.content_type = content_type.into();
        self
    }

    #[must_use]
    pub fn with_context_id(mut self, context_id: impl Into<ContextId>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    #[must_use]
    pub fn with_pragma(mut self, pragma: Pragmas) -> Self {
        self.pragmas |= pragma;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_expand(mut self) -> Self {
        self.expand = true;
        self
    }

    #[must_use]
    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    #[must_use]
    pub(crate) fn with_origin(mut self, origin: OperationOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Same request retargeted at `action` on `path`, keeping body, pragmas,
    /// context id and deadline.
    #[must_use]
    pub(crate) fn retarget(mut self, action: Action, path: impl Into<String>) -> Self {
        self.action = action;
        self.path = path.into();
        self
    }

    // -- accessors ---------------------------------------------------------

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn action(&self) -> Action {
        self.action
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Distinguishes an absent body from an empty one.
    #[must_use]
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    #[must_use]
    pub fn context_id(&self) -> Option<&ContextId> {
        self.context_id.as_ref()
    }

    #[must_use]
    pub fn pragmas(&self) -> Pragmas {
        self.pragmas
    }

    #[must_use]
    pub fn has_pragma(&self, pragma: Pragmas) -> bool {
        self.pragmas.contains(pragma)
    }

    #[must_use]
    pub fn referer(&self) -> Option<&str> {
        self.referer.as_deref()
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[must_use]
    pub fn expand(&self) -> bool {
        self.expand
    }

    #[must_use]
    pub fn origin(&self) -> OperationOrigin {
        self.origin
    }

    // -- body decoding -----------------------------------------------------

    fn body_value(&self) -> Result<Option<Value>, OperationError> {
        let Some(body) = &self.body else {
            return Ok(None);
        };
        if !is_json_content_type(&self.content_type) {
            return Err(OperationError::validation(format!(
                "Unrecognized Content-Type: {}",
                self.content_type
            )));
        }
        match body {
            Body::Json(value) => Ok(Some(value.clone())),
            Body::Raw(text) => serde_json::from_str(text).map(Some).map_err(|e| {
                OperationError::validation(format!("Unparseable JSON body: {e}"))
            }),
        }
    }

    /// Decodes the body as a document.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a non-JSON content type, unparseable text, or
    /// a body that is not a document.
    pub fn body_document(&self) -> Result<Option<Document>, OperationError> {
        let Some(value) = self.body_value()? else {
            return Ok(None);
        };
        Document::from_value(value)
            .map(Some)
            .map_err(|e| OperationError::validation(format!("Invalid document body: {e}")))
    }

    /// Decodes the body as `T`.
    ///
    /// # Errors
    ///
    /// Returns `Validation` when the body is absent or does not decode.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, OperationError> {
        let value = self
            .body_value()?
            .ok_or_else(|| OperationError::validation("body is required"))?;
        serde_json::from_value(value)
            .map_err(|e| OperationError::validation(format!("Invalid body: {e}")))
    }
}

fn is_json_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|media| media.trim().eq_ignore_ascii_case(CONTENT_TYPE_JSON))
}

// ---------------------------------------------------------------------------
// OperationResponse
// ---------------------------------------------------------------------------

/// Successful outcome of an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResponse {
    pub status: StatusCode,
    pub body: Option<Value>,
    /// Context id of the request this answers.
    pub context_id: Option<ContextId>,
}

impl OperationResponse {
    #[must_use]
    pub fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::Ok,
            body: Some(body),
            context_id: None,
        }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            status: StatusCode::Ok,
            body: None,
            context_id: None,
        }
    }

    #[must_use]
    pub fn from_document(document: &Document) -> Self {
        Self::ok(document.to_value())
    }

    /// Response whose body is `value` serialized as JSON.
    ///
    /// # Errors
    ///
    /// Returns `Infrastructure` when `value` does not serialize.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, OperationError> {
        serde_json::to_value(value)
            .map(Self::ok)
            .map_err(|e| OperationError::Infrastructure {
                operation: "response encoding",
                message: e.to_string(),
            })
    }

    /// Update accepted without a state change; the body is the current state.
    #[must_use]
    pub fn not_modified(document: &Document) -> Self {
        Self {
            status: StatusCode::NotModified,
            body: Some(document.to_value()),
            context_id: None,
        }
    }

    #[must_use]
    pub fn with_context_id(mut self, context_id: Option<ContextId>) -> Self {
        self.context_id = context_id;
        self
    }

    /// Decodes the body as a document.
    ///
    /// # Errors
    ///
    /// Returns `Validation` when there is no body or it is not a document.
    pub fn document(&self) -> Result<Document, OperationError> {
        self.body_as()
    }

    /// Decodes the body as `T`.
    ///
    /// # Errors
    ///
    /// Returns `Validation` when there is no body or it does not decode.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, OperationError> {
        let value = self
            .body
            .clone()
            .ok_or_else(|| OperationError::validation("response has no body"))?;
        serde_json::from_value(value)
            .map_err(|e| OperationError::validation(format!("Invalid response body: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Single-use completion handle. Consumed by value, so it fires at most once;
/// a result sent after the caller gave up is dropped.
#[derive(Debug)]
pub(crate) struct Completion {
    tx: oneshot::Sender<OperationResult>,
}

impl Completion {
    pub(crate) fn pair() -> (Self, oneshot::Receiver<OperationResult>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub(crate) fn complete(self, result: OperationResult) {
        if self.tx.send(result).is_err() {
            tracing::debug!("caller abandoned operation before completion");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
