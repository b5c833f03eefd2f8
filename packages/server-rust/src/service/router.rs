//! Operation routing: the innermost service of the pipeline, dispatching
//! each `Operation` to the service registered at its path.

use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use tower::Service;

use super::host::HostInner;
use super::operation::{Operation, OperationError, OperationResponse};

/// Routes operations into the host they belong to.
///
/// Holds the host weakly: the host owns the pipeline that owns the router.
#[derive(Clone)]
pub(crate) struct HostRouter {
    host: Weak<HostInner>,
}

impl HostRouter {
    pub(crate) fn new(host: Weak<HostInner>) -> Self {
        Self { host }
    }
}

impl Service<Operation> for HostRouter {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let host = self.host.upgrade();
        Box::pin(async move {
            let Some(host) = host else {
                return Err(OperationError::Unavailable {
                    reason: "host dropped".to_string(),
                });
            };
            let _in_flight = host.shutdown.admit()?;
            let context_id = op.context_id().cloned();
            host.route(op)
                .await
                .map(|response| response.with_context_id(context_id))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
