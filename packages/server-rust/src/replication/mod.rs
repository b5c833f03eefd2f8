//! Replication and owner-selection contract.
//!
//! The engine hands every accepted mutation of a `REPLICATION` service to a
//! [`Replicator`]. With `OWNER_SELECTION` the acknowledgement is awaited and
//! must reach quorum before the mutation is persisted; otherwise the request
//! is queued on the [`ReplicationRunnable`] worker after the append.

use std::sync::Arc;

use async_trait::async_trait;
use docket_core::{Action, ContextId, Document};

use crate::service::worker::BackgroundRunnable;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One accepted mutation to fan out.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationRequest {
    pub document: Document,
    pub action: Action,
    /// The document is a tombstone.
    pub deleted: bool,
    pub context_id: Option<ContextId>,
}

/// Acknowledgement from the replication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationAck {
    pub accepted: usize,
    pub required: usize,
}

impl ReplicationAck {
    #[must_use]
    pub fn has_quorum(&self) -> bool {
        self.accepted >= self.required
    }
}

// ---------------------------------------------------------------------------
// Replicator
// ---------------------------------------------------------------------------

/// Fans accepted updates out to peer replicas and reports acceptance.
///
/// Used as `Arc<dyn Replicator>`.
#[async_trait]
pub trait Replicator: Send + Sync {
    async fn replicate(&self, request: &ReplicationRequest) -> anyhow::Result<ReplicationAck>;
}

/// Single-host replicator: this host is the owner and the only replica.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalReplicator;

#[async_trait]
impl Replicator for LocalReplicator {
    async fn replicate(&self, _request: &ReplicationRequest) -> anyhow::Result<ReplicationAck> {
        Ok(ReplicationAck {
            accepted: 1,
            required: 1,
        })
    }
}

// ---------------------------------------------------------------------------
// ReplicationRunnable
// ---------------------------------------------------------------------------

/// Background handler for fire-and-forget replication. Failures are logged
/// and counted; nobody waits on them.
pub struct ReplicationRunnable {
    replicator: Arc<dyn Replicator>,
    sent: u64,
    failed: u64,
}

impl ReplicationRunnable {
    #[must_use]
    pub fn new(replicator: Arc<dyn Replicator>) -> Self {
        Self {
            replicator,
            sent: 0,
            failed: 0,
        }
    }
}

#[async_trait]
impl BackgroundRunnable for ReplicationRunnable {
    type Task = ReplicationRequest;

    async fn run(&mut self, task: ReplicationRequest) {
        self.sent += 1;
        match self.replicator.replicate(&task).await {
            Ok(ack) if ack.has_quorum() => {}
            Ok(ack) => {
                self.failed += 1;
                tracing::warn!(
                    path = %task.document.self_link,
                    version = task.document.version,
                    accepted = ack.accepted,
                    required = ack.required,
                    "replication below quorum"
                );
            }
            Err(e) => {
                self.failed += 1;
                tracing::warn!(
                    path = %task.document.self_link,
                    version = task.document.version,
                    error = %e,
                    "replication failed"
                );
            }
        }
    }

    async fn on_tick(&mut self) {
        tracing::debug!(sent = self.sent, failed = self.failed, "replication fan-out");
    }

    async fn shutdown(&mut self) {
        tracing::debug!(sent = self.sent, failed = self.failed, "replication worker stopped");
    }
}
