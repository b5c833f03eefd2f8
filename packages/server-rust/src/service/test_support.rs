//! Test services, stores and replicators shared by host-level tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docket_core::{
    Action, Document, DocumentDescription, FieldDef, FieldType, ManualClock, ServiceOptions,
};
use parking_lot::Mutex;
use serde_json::json;

use super::config::HostConfig;
use super::factory::FactoryService;
use super::host::ServiceHost;
use super::operation::{Operation, OperationError};
use super::stateful::{ServiceContext, StatefulService};
use crate::replication::{ReplicationAck, ReplicationRequest, Replicator};
use crate::storage::datastores::MemoryDocumentStore;
use crate::storage::{DocumentStore, StoreError, StoredDocument};

pub(crate) const COUNTER_KIND: &str = "test:Counter";
pub(crate) const COUNTERS_LINK: &str = "/test/counters";
pub(crate) const CLOCK_START_MICROS: u64 = 1_000_000;

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// Observations and knobs shared by every [`CounterService`] a test builds.
#[derive(Default)]
pub(crate) struct Probe {
    /// Number of upcoming starts to fail.
    pub fail_starts: AtomicUsize,
    pub start_delay_ms: AtomicU64,
    pub update_delay_ms: AtomicU64,
    pub delete_delay_ms: AtomicU64,
    /// State seen by each delete hook, `None` on expiry.
    pub deletes: Mutex<Vec<Option<Document>>>,
    /// `(self link, context id)` of every update hook.
    pub contexts: Mutex<Vec<(String, Option<String>)>>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl Probe {
    async fn track_update(&self, ctx: &ServiceContext) {
        self.contexts.lock().push((
            ctx.self_link().to_string(),
            ctx.context_id().map(|c| c.as_str().to_string()),
        ));
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let delay = self.update_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// CounterService
// ---------------------------------------------------------------------------

pub(crate) fn counter_description() -> DocumentDescription {
    DocumentDescription::new(COUNTER_KIND)
        .field(FieldDef::required("name", FieldType::String))
        .field(FieldDef::optional("counter", FieldType::Integer))
}

/// Stateful service with default hooks, instrumented through a [`Probe`].
pub(crate) struct CounterService {
    description: DocumentDescription,
    options: ServiceOptions,
    probe: Arc<Probe>,
    /// Path every update forwards a merge to.
    forward_to: Option<String>,
}

impl CounterService {
    pub(crate) fn new(probe: Arc<Probe>, options: ServiceOptions) -> Self {
        Self {
            description: counter_description(),
            options,
            probe,
            forward_to: None,
        }
    }

    pub(crate) fn forwarding(mut self, link: impl Into<String>) -> Self {
        self.forward_to = Some(link.into());
        self
    }
}

#[async_trait]
impl StatefulService for CounterService {
    fn description(&self) -> &DocumentDescription {
        &self.description
    }

    fn options(&self) -> ServiceOptions {
        self.options
    }

    async fn handle_start(
        &self,
        _ctx: &ServiceContext,
        _initial: &Document,
    ) -> Result<(), OperationError> {
        let delay = self.probe.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let failing = self
            .probe
            .fail_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow::anyhow!("start refused").into());
        }
        Ok(())
    }

    async fn handle_update(
        &self,
        ctx: &ServiceContext,
        _op: &Operation,
        _current: &Document,
        body: Document,
    ) -> Result<Document, OperationError> {
        self.probe.track_update(ctx).await;
        if let Some(target) = &self.forward_to {
            let nested = ctx
                .operation(Action::UpdateMerge, target.clone())
                .with_body(json!({ "counter": body.field("counter").cloned() }));
            ctx.send(nested).await?;
        }
        Ok(body)
    }

    async fn handle_update_merge(
        &self,
        ctx: &ServiceContext,
        _op: &Operation,
        current: &Document,
        body: Document,
    ) -> Result<Document, OperationError> {
        self.probe.track_update(ctx).await;
        let mut next = current.clone();
        next.merge_from(&body);
        Ok(next)
    }

    async fn handle_delete(
        &self,
        _ctx: &ServiceContext,
        _op: &Operation,
        state: Option<&Document>,
    ) -> Result<(), OperationError> {
        self.probe.deletes.lock().push(state.cloned());
        let delay = self.probe.delete_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(())
    }
}

/// Factory of [`CounterService`] children with `child_options`.
pub(crate) fn counter_factory(probe: &Arc<Probe>, child_options: ServiceOptions) -> FactoryService {
    let probe = Arc::clone(probe);
    FactoryService::new(counter_description(), move || {
        Arc::new(CounterService::new(Arc::clone(&probe), ServiceOptions::empty()))
    })
    .with_child_options(child_options)
}

// ---------------------------------------------------------------------------
// FlakyStore
// ---------------------------------------------------------------------------

/// Memory store whose appends can be made to fail.
#[derive(Default)]
pub(crate) struct FlakyStore {
    inner: MemoryDocumentStore,
    pub fail_appends: AtomicBool,
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn get_latest(&self, link: &str) -> Result<Option<StoredDocument>, StoreError> {
        self.inner.get_latest(link).await
    }

    async fn get_version(
        &self,
        link: &str,
        version: u64,
    ) -> Result<Option<StoredDocument>, StoreError> {
        self.inner.get_version(link, version).await
    }

    async fn append(&self, entry: StoredDocument) -> Result<(), StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(anyhow::anyhow!("disk unavailable")));
        }
        self.inner.append(entry).await
    }

    async fn query(&self, prefix: &str) -> Result<Vec<Document>, StoreError> {
        self.inner.query(prefix).await
    }

    async fn history(&self, link: &str) -> Result<Vec<StoredDocument>, StoreError> {
        self.inner.history(link).await
    }
}

// ---------------------------------------------------------------------------
// QuorumReplicator
// ---------------------------------------------------------------------------

/// Replicator reporting `accepted` of two required replicas.
pub(crate) struct QuorumReplicator {
    pub accepted: AtomicUsize,
    pub calls: AtomicUsize,
}

impl QuorumReplicator {
    pub(crate) fn new(accepted: usize) -> Self {
        Self {
            accepted: AtomicUsize::new(accepted),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Replicator for QuorumReplicator {
    async fn replicate(&self, _request: &ReplicationRequest) -> anyhow::Result<ReplicationAck> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ReplicationAck {
            accepted: self.accepted.load(Ordering::SeqCst),
            required: 2,
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A started host wired to a manual clock, a flaky store and a quorum
/// replicator.
pub(crate) struct Harness {
    pub host: ServiceHost,
    pub clock: Arc<ManualClock>,
    pub store: Arc<FlakyStore>,
    pub replicator: Arc<QuorumReplicator>,
    pub probe: Arc<Probe>,
}

impl Harness {
    pub(crate) async fn start(config: HostConfig) -> Self {
        Self::with_store(config, Arc::new(FlakyStore::default())).await
    }

    pub(crate) async fn with_store(config: HostConfig, store: Arc<FlakyStore>) -> Self {
        let clock = Arc::new(ManualClock::new(CLOCK_START_MICROS));
        let replicator = Arc::new(QuorumReplicator::new(2));
        let host = ServiceHost::builder(config)
            .store(Arc::clone(&store) as Arc<dyn DocumentStore>)
            .replicator(Arc::clone(&replicator) as Arc<dyn Replicator>)
            .clock(Arc::clone(&clock) as Arc<dyn docket_core::ClockSource>)
            .build();
        host.start().await.unwrap();
        Self {
            host,
            clock,
            store,
            replicator,
            probe: Arc::new(Probe::default()),
        }
    }

    /// Starts a counter factory at [`COUNTERS_LINK`].
    pub(crate) fn counters(&self, child_options: ServiceOptions) -> Arc<FactoryService> {
        self.host
            .start_factory(COUNTERS_LINK, counter_factory(&self.probe, child_options))
            .unwrap()
    }

    pub(crate) fn child(name: &str) -> String {
        format!("{COUNTERS_LINK}/{name}")
    }

    /// Creates the counter `name` through the factory.
    pub(crate) fn post(name: &str) -> Operation {
        Operation::create(COUNTERS_LINK).with_body(json!({
            "documentSelfLink": name,
            "name": name,
        }))
    }
}
