use std::time::Duration;

/// Host-level configuration for the operation pipeline and service instances.
///
/// Controls operation timeouts, concurrency limits, state caching and
/// shutdown behavior.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Unique identifier for this host.
    pub host_id: String,
    /// Timeout for operations that carry no deadline of their own, in milliseconds.
    pub default_operation_timeout_ms: u64,
    /// Maximum number of concurrent operations before load shedding.
    pub max_concurrent_operations: u32,
    /// Capacity of each service instance's queue.
    pub instance_queue_capacity: usize,
    /// Serve reads and pre-update checks from memory. When off, persistent
    /// services consult the store on every access.
    pub service_state_caching: bool,
    /// Complete merges that change nothing with Not-Modified.
    pub not_modified_detection: bool,
    /// Capacity of the asynchronous replication queue.
    pub replication_queue_capacity: usize,
    /// How long `shutdown` waits for in-flight operations, in milliseconds.
    pub shutdown_drain_timeout_ms: u64,
}

impl HostConfig {
    #[must_use]
    pub fn default_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.default_operation_timeout_ms)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_id: String::new(),
            default_operation_timeout_ms: 30_000,
            max_concurrent_operations: 1000,
            instance_queue_capacity: 256,
            service_state_caching: true,
            not_modified_detection: true,
            replication_queue_capacity: 256,
            shutdown_drain_timeout_ms: 5_000,
        }
    }
}
