//! Admission limit for the operation pipeline.
//!
//! At most `max_concurrent_operations` operations are inside the pipeline at
//! once. A permit is held from admission until the operation completes,
//! including nested operations a service issues while handling it. Excess
//! operations fail at once with `OperationError::Overloaded`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower::{Layer, Service};

use crate::service::operation::{Operation, OperationError, OperationResponse};

/// Shared permit pool behind every clone of the pipeline.
#[derive(Debug)]
struct Limiter {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl Limiter {
    fn try_admit(&self, op: &Operation) -> Result<OwnedSemaphorePermit, OperationError> {
        Arc::clone(&self.permits).try_acquire_owned().map_err(|_| {
            tracing::debug!(
                path = %op.path(),
                action = %op.action(),
                limit = self.limit,
                "operation shed"
            );
            ::metrics::counter!("docket_operations_shed_total").increment(1);
            OperationError::Overloaded
        })
    }
}

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    limiter: Arc<Limiter>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        let limit = usize::try_from(max_concurrent).unwrap_or(Semaphore::MAX_PERMITS);
        Self {
            limiter: Arc::new(Limiter {
                permits: Arc::new(Semaphore::new(limit.min(Semaphore::MAX_PERMITS))),
                limit,
            }),
        }
    }

    /// Permits currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.limiter.permits.available_permits()
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            limiter: Arc::clone(&self.limiter),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    limiter: Arc<Limiter>,
}

impl<S> Service<Operation> for LoadShedService<S>
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
        match self.limiter.try_admit(&op) {
            Ok(permit) => {
                let fut = self.inner.call(op);
                Box::pin(async move {
                    let _permit = permit;
                    fut.await
                })
            }
            Err(e) => Box::pin(std::future::ready(Err(e))),
        }
    }
}
