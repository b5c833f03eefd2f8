//! Hooks implemented by document-owning services.

use async_trait::async_trait;
use docket_core::{Action, ContextId, Document, DocumentDescription, ServiceOptions};

use super::host::ServiceHost;
use super::operation::{Operation, OperationError, OperationResult};

// ---------------------------------------------------------------------------
// ServiceContext
// ---------------------------------------------------------------------------

/// What a hook can see and do besides its own state.
///
/// Operations issued through the context are independent operations routed
/// by the host. A hook must not await an operation addressed to its own
/// path: that operation waits in the same queue the hook is blocking.
pub struct ServiceContext {
    self_link: String,
    context_id: Option<ContextId>,
    host: ServiceHost,
}

impl ServiceContext {
    pub(crate) fn new(self_link: String, context_id: Option<ContextId>, host: ServiceHost) -> Self {
        Self {
            self_link,
            context_id,
            host,
        }
    }

    #[must_use]
    pub fn self_link(&self) -> &str {
        &self.self_link
    }

    /// Context id of the operation being handled.
    #[must_use]
    pub fn context_id(&self) -> Option<&ContextId> {
        self.context_id.as_ref()
    }

    #[must_use]
    pub fn host(&self) -> &ServiceHost {
        &self.host
    }

    #[must_use]
    pub fn now_micros(&self) -> u64 {
        self.host.clock().now_micros()
    }

    /// New operation carrying the current context id, with this service as
    /// referer.
    #[must_use]
    pub fn operation(&self, action: Action, path: impl Into<String>) -> Operation {
        let op = Operation::new(action, path).with_referer(self.self_link.clone());
        match &self.context_id {
            Some(context_id) => op.with_context_id(context_id.clone()),
            None => op,
        }
    }

    /// Sends `op` through the host and waits for its outcome.
    pub async fn send(&self, op: Operation) -> OperationResult {
        self.host.send(op).await
    }

    /// Sends `op` without waiting. Failures are logged.
    pub fn send_and_forget(&self, op: Operation) {
        let path = op.path().to_string();
        self.host.send_with_callback(op, move |result| {
            if let Err(e) = result {
                tracing::debug!(path = %path, error = %e, "forwarded operation failed");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// StatefulService
// ---------------------------------------------------------------------------

/// A service owning one versioned document.
///
/// The engine assigns versions, stamps system fields, persists and
/// replicates; hooks only decide the next state. Any hook error fails the
/// operation and leaves the state untouched.
#[async_trait]
pub trait StatefulService: Send + Sync + 'static {
    /// Kind tag and field schema of this service's document.
    fn description(&self) -> &DocumentDescription;

    /// Capability flags. A factory ORs its child options into these.
    fn options(&self) -> ServiceOptions {
        ServiceOptions::empty()
    }

    /// Validates the initial state of a create. An error aborts the create
    /// with nothing persisted.
    async fn handle_start(
        &self,
        _ctx: &ServiceContext,
        _initial: &Document,
    ) -> Result<(), OperationError> {
        Ok(())
    }

    /// Computes the state after an UPDATE. Default: the body replaces the state.
    async fn handle_update(
        &self,
        _ctx: &ServiceContext,
        _op: &Operation,
        _current: &Document,
        body: Document,
    ) -> Result<Document, OperationError> {
        Ok(body)
    }

    /// Computes the state after an UPDATE-MERGE. Default: non-null body
    /// fields overlay the current state.
    async fn handle_update_merge(
        &self,
        _ctx: &ServiceContext,
        _op: &Operation,
        current: &Document,
        body: Document,
    ) -> Result<Document, OperationError> {
        let mut next = current.clone();
        next.merge_from(&body);
        Ok(next)
    }

    /// Runs before a delete takes effect. `state` is the state being removed,
    /// or `None` when the document expired; the expired document is then the
    /// operation's body.
    async fn handle_delete(
        &self,
        _ctx: &ServiceContext,
        _op: &Operation,
        _state: Option<&Document>,
    ) -> Result<(), OperationError> {
        Ok(())
    }
}
