//! Metrics middleware for operations.
//!
//! Opens a `tracing` span per operation and records its outcome and
//! duration, both on the span and through the `metrics` facade.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use docket_core::StatusCode;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::operation::{Operation, OperationError, OperationResponse};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Operation> for MetricsService<S>
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
        let action = op.action().as_str();
        let span = info_span!(
            "operation",
            id = op.id(),
            action = action,
            path = %op.path(),
            context_id = op.context_id().map(docket_core::ContextId::as_str),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(op);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(response) if response.status == StatusCode::NotModified => "not_modified",
                    Ok(_) => "ok",
                    Err(e) => e.error_code(),
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome);

                ::metrics::counter!("docket_operations_total", "action" => action).increment(1);
                if result.is_err() {
                    ::metrics::counter!(
                        "docket_operation_errors_total",
                        "action" => action,
                        "error" => outcome
                    )
                    .increment(1);
                }
                ::metrics::histogram!("docket_operation_duration_seconds", "action" => action)
                    .record(elapsed.as_secs_f64());

                tracing::debug!(duration_ms, outcome, "operation complete");

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
