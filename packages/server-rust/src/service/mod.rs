//! Service lifecycle engine.
//!
//! This module implements the path-addressed service host:
//!
//! 1. **Classification** (`classify`): transport request -> `Result<Operation, ClassifyError>`
//! 2. **Middleware** (`middleware`): Tower layers (load-shedding, timeout, metrics)
//! 3. **Routing** (`router`, `host`): dispatch to the service registered at the path
//! 4. **Instances** (`instance`): one queue-draining task per stateful path
//! 5. **Factories** (`factory`): child creation, idempotent create, queries
//! 6. **Domain services** (`domain`): the built-in example service
//! 7. **Background workers** (`worker`): asynchronous replication fan-out

pub mod classify;
pub mod config;
pub mod domain;
pub mod error;
pub mod factory;
pub mod host;
mod instance;
pub mod lifecycle;
pub mod middleware;
pub mod operation;
pub mod registry;
mod router;
pub mod shutdown;
pub mod stateful;
pub mod stateless;
pub mod stats;
pub mod worker;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
pub(crate) mod test_support;

// Re-export key types for convenient access.
pub use classify::{classify, ClassifyError};
pub use config::HostConfig;
pub use error::OperationError;
pub use factory::FactoryService;
pub use host::{HostBuilder, ServiceHost};
pub use lifecycle::LifecycleState;
pub use operation::{Body, Operation, OperationOrigin, OperationResponse, OperationResult};
pub use registry::ServiceRegistry;
pub use shutdown::{HealthState, ShutdownController};
pub use stateful::{ServiceContext, StatefulService};
pub use stateless::StatelessService;
pub use stats::StatsRegistry;
pub use worker::{BackgroundRunnable, BackgroundWorker};
