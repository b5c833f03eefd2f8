//! Tower middleware layers for the operation pipeline.
//!
//! - [`load_shed`]: admission limit on concurrent operations
//! - [`timeout`]: per-operation deadline enforcement
//! - [`metrics`]: operation spans, counters and latency histograms
//! - [`pipeline`]: composes the layers in front of the host router

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_operation_pipeline, OperationPipeline};
pub use timeout::TimeoutLayer;
