//! Pipeline composition: combines all middleware layers into a single service stack.

use tower::util::BoxCloneService;
use tower::{Service, ServiceBuilder};

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::service::config::HostConfig;
use crate::service::operation::{Operation, OperationError, OperationResponse};

/// The composed, type-erased operation pipeline.
pub type OperationPipeline = BoxCloneService<Operation, OperationResponse, OperationError>;

/// Wraps `router` with the middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded (fail fast before doing any work)
/// 2. `TimeoutLayer` -- enforce per-operation deadlines
/// 3. `MetricsLayer` -- record timing and outcome (closest to the actual handler)
#[must_use]
pub fn build_operation_pipeline<S>(router: S, config: &HostConfig) -> OperationPipeline
where
    S: Service<Operation, Response = OperationResponse, Error = OperationError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    BoxCloneService::new(
        ServiceBuilder::new()
            .layer(LoadShedLayer::new(config.max_concurrent_operations))
            .layer(TimeoutLayer::new(config.default_operation_timeout()))
            .layer(MetricsLayer)
            .service(router),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
