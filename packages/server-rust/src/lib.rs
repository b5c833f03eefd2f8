//! Docket Server: path-addressed document services with versioned,
//! persisted, replicated state.

pub mod replication;
pub mod service;
pub mod storage;

pub use replication::{LocalReplicator, ReplicationAck, ReplicationRequest, Replicator};
pub use service::{
    FactoryService, HostBuilder, HostConfig, Operation, OperationError, OperationResponse,
    ServiceContext, ServiceHost, StatefulService, StatelessService,
};
pub use storage::{DocumentStore, StoreError, StoredDocument};
