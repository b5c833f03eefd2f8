//! Deadline enforcement for operations.
//!
//! The deadline is fixed when the operation enters the layer: its own
//! timeout if it carries one, the host default otherwise. On expiry the
//! caller gets `OperationError::Timeout`; the operation may still run to
//! completion inside its service, and that late result is dropped.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::time::Instant;
use tower::{Layer, Service};

use crate::service::operation::{Operation, OperationError, OperationResponse};

#[derive(Debug, Clone)]
pub struct TimeoutLayer {
    default_timeout: Duration,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            default_timeout: self.default_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    default_timeout: Duration,
}

impl<S> Service<Operation> for TimeoutService<S>
where
    S: Service<Operation, Response = OperationResponse, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let budget = op.timeout().unwrap_or(self.default_timeout);
        let deadline = Instant::now() + budget;
        let path = op.path().to_string();
        let fut = self.inner.call(op);
        Box::pin(async move {
            tokio::time::timeout_at(deadline, fut).await.unwrap_or_else(|_| {
                let timeout_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX);
                tracing::debug!(path = %path, timeout_ms, "operation deadline passed");
                Err(OperationError::Timeout { timeout_ms })
            })
        })
    }
}
