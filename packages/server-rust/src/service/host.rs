//! The service host: registry, routing, collaborators and lifecycle.

use std::sync::Arc;
use std::time::Duration;

use docket_core::{
    Action, ClockSource, Document, ServiceOptions, ServiceStats, SystemClock, STATS_SUFFIX,
};
use futures_util::future::BoxFuture;
use tower::ServiceExt;
use tracing::{info, warn};

use super::config::HostConfig;
use super::factory::FactoryService;
use super::instance::{spawn_instance, InstanceHandle, StartMode};
use super::lifecycle::LifecycleState;
use super::middleware::{build_operation_pipeline, OperationPipeline};
use super::operation::{
    Completion, Operation, OperationError, OperationOrigin, OperationResponse, OperationResult,
};
use super::registry::{Lookup, ServiceRegistry};
use super::router::HostRouter;
use super::shutdown::{HealthState, ShutdownController};
use super::stateful::StatefulService;
use super::stateless::StatelessService;
use super::stats::StatsRegistry;
use super::worker::BackgroundWorker;
use crate::replication::{LocalReplicator, ReplicationRequest, ReplicationRunnable, Replicator};
use crate::storage::datastores::MemoryDocumentStore;
use crate::storage::DocumentStore;

const REPLICATION_TICK_MS: u64 = 60_000;

// ---------------------------------------------------------------------------
// HostInner
// ---------------------------------------------------------------------------

pub(crate) struct HostInner {
    pub(crate) config: HostConfig,
    pub(crate) registry: ServiceRegistry,
    pub(crate) factories: dashmap::DashMap<String, Arc<FactoryService>>,
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) replicator: Arc<dyn Replicator>,
    pub(crate) clock: Arc<dyn ClockSource>,
    pub(crate) stats: StatsRegistry,
    pub(crate) shutdown: ShutdownController,
    replication: tokio::sync::Mutex<BackgroundWorker<ReplicationRunnable>>,
    pipeline: parking_lot::Mutex<OperationPipeline>,
}

impl HostInner {
    /// Resolves `op` to the service owning its path and awaits the outcome.
    pub(crate) fn route(self: &Arc<Self>, op: Operation) -> BoxFuture<'static, OperationResult> {
        let host = Arc::clone(self);
        Box::pin(async move { host.dispatch(op).await })
    }

    async fn dispatch(self: Arc<Self>, op: Operation) -> OperationResult {
        let path = op.path().to_string();

        if !self.registry.contains(&path) {
            if let Some(owner) = path.strip_suffix(STATS_SUFFIX) {
                if self.registry.contains(owner) {
                    return self.stats.handle(owner, &op, self.clock.now_micros());
                }
            }
        }

        match self.registry.lookup(&path) {
            Lookup::Stateless(service) => {
                if op.action() == Action::Discover {
                    return OperationResponse::json(&service.capabilities(&path));
                }
                let host = ServiceHost::from_inner(Arc::clone(&self));
                service.handle(&host, op).await
            }
            Lookup::Instance { handle, state } => {
                if state == LifecycleState::Creating
                    && !state.permits(op.action())
                    && op.origin() != OperationOrigin::IdempotentCreate
                {
                    return Err(OperationError::not_found(path));
                }
                self.submit(handle, op).await
            }
            Lookup::Vacant { prior } => {
                if prior.is_some_and(|prior| prior.deleted) {
                    return Err(OperationError::not_found(path));
                }
                match self.restore(&path) {
                    Some(handle) => self.submit(handle, op).await,
                    None => Err(OperationError::not_found(path)),
                }
            }
        }
    }

    /// Re-instantiates a stopped child of a factory with persistent children.
    fn restore(self: &Arc<Self>, path: &str) -> Option<InstanceHandle> {
        let (parent, _) = path.rsplit_once('/')?;
        let factory = self.factories.get(parent).map(|f| Arc::clone(f.value()))?;
        let (service, options) = factory.build_child().ok()?;
        if !options.contains(ServiceOptions::PERSISTENCE) {
            return None;
        }
        let host = Arc::clone(self);
        self.registry.begin_restore(path, move |prior| {
            spawn_instance(
                host,
                path.to_string(),
                service,
                options,
                StartMode::Restore { prior },
            )
        })
    }

    async fn submit(self: &Arc<Self>, handle: InstanceHandle, op: Operation) -> OperationResult {
        let path = op.path().to_string();
        match handle.enqueue(op).await {
            Ok(rx) => rx.await.unwrap_or_else(|_| {
                Err(OperationError::Hook(anyhow::anyhow!(
                    "service {path} dropped the operation"
                )))
            }),
            Err(op) => {
                // The instance stopped between lookup and enqueue.
                if let Lookup::Instance { handle: current, .. } = self.registry.lookup(&path) {
                    if current.id() == handle.id() {
                        self.registry.abandon(&path, handle.id(), None);
                        return Err(OperationError::not_found(path));
                    }
                }
                self.route(op).await
            }
        }
    }

    /// Claims `link` and runs the create of a new instance.
    pub(crate) async fn start_child(
        self: &Arc<Self>,
        link: String,
        service: Arc<dyn StatefulService>,
        options: ServiceOptions,
        initial: Document,
        request: Operation,
    ) -> OperationResult {
        let (completion, rx) = Completion::pair();
        let host = Arc::clone(self);
        self.registry.begin_create(&link, |prior| {
            spawn_instance(
                host,
                link.clone(),
                service,
                options,
                StartMode::Create {
                    initial,
                    request,
                    prior,
                    completion,
                },
            )
        })?;
        rx.await.unwrap_or_else(|_| {
            Err(OperationError::Hook(anyhow::anyhow!(
                "service {link} dropped its create"
            )))
        })
    }

    /// Queues fire-and-forget replication.
    pub(crate) async fn replicate_async(&self, request: ReplicationRequest) {
        if let Err(e) = self.replication.lock().await.submit(request).await {
            warn!(error = %e, "replication queue unavailable");
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceHost
// ---------------------------------------------------------------------------

/// Handle to a running host. Cheap to clone.
#[derive(Clone)]
pub struct ServiceHost {
    inner: Arc<HostInner>,
}

impl ServiceHost {
    /// Host with an in-memory store, local replication and the system clock.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(config: HostConfig) -> Self {
        HostBuilder::new(config).build()
    }

    #[must_use]
    pub fn builder(config: HostConfig) -> HostBuilder {
        HostBuilder::new(config)
    }

    pub(crate) fn from_inner(inner: Arc<HostInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<HostInner> {
        &self.inner
    }

    /// Initializes the store and starts admitting operations.
    ///
    /// # Errors
    ///
    /// Returns the store's initialization error.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.inner.store.initialize().await?;
        self.inner.shutdown.set_ready();
        info!(host_id = %self.inner.config.host_id, "host started");
        Ok(())
    }

    /// Sends `op` through the pipeline and waits for its outcome.
    pub async fn send(&self, op: Operation) -> OperationResult {
        let pipeline = self.inner.pipeline.lock().clone();
        pipeline.oneshot(op).await
    }

    /// Sends `op` and invokes `callback` exactly once with the outcome.
    pub fn send_with_callback<F>(&self, op: Operation, callback: F)
    where
        F: FnOnce(OperationResult) + Send + 'static,
    {
        let host = self.clone();
        tokio::spawn(async move {
            callback(host.send(op).await);
        });
    }

    /// Starts a stateful service at `link` with `initial` as its first state.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for a malformed description, `Conflict` when
    /// a service already runs at `link`, or the create's own failure.
    pub async fn start_service(
        &self,
        link: &str,
        service: Arc<dyn StatefulService>,
        mut initial: Document,
    ) -> OperationResult {
        service
            .description()
            .check()
            .map_err(|e| OperationError::configuration(e.to_string()))?;
        let options = service.options();
        initial.self_link = link.to_string();
        self.inner
            .start_child(
                link.to_string(),
                service,
                options,
                initial,
                Operation::create(link),
            )
            .await
    }

    /// Checks and registers a factory at `link`.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the factory's children do not match its
    /// declared description, or `Conflict` when `link` is taken.
    pub fn start_factory(
        &self,
        link: &str,
        factory: FactoryService,
    ) -> Result<Arc<FactoryService>, OperationError> {
        factory.check_child_type()?;
        factory.bind(link)?;
        let factory = Arc::new(factory);
        self.inner
            .registry
            .register_stateless(link, Arc::clone(&factory) as Arc<dyn StatelessService>)?;
        self.inner
            .factories
            .insert(link.to_string(), Arc::clone(&factory));
        info!(
            path = %link,
            kind = %factory.child_description().kind,
            "factory started"
        );
        Ok(factory)
    }

    /// Registers a stateless service at `link`.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when `link` is taken.
    pub fn start_stateless(
        &self,
        link: &str,
        service: Arc<dyn StatelessService>,
    ) -> Result<(), OperationError> {
        self.inner.registry.register_stateless(link, service)
    }

    /// Unregisters the factory at `link`. Its children keep running.
    pub fn stop_factory(&self, link: &str) -> bool {
        let removed = self.inner.factories.remove(link).is_some();
        if removed {
            self.inner.registry.remove_stateless(link);
            info!(path = %link, "factory stopped");
        }
        removed
    }

    #[must_use]
    pub fn factory(&self, link: &str) -> Option<Arc<FactoryService>> {
        self.inner.factories.get(link).map(|f| Arc::clone(f.value()))
    }

    #[must_use]
    pub fn lifecycle_state(&self, link: &str) -> Option<LifecycleState> {
        self.inner.registry.state(link)
    }

    #[must_use]
    pub fn stats(&self, link: &str) -> ServiceStats {
        self.inner.stats.snapshot(link)
    }

    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn ClockSource> {
        &self.inner.clock
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        self.inner.shutdown.health_state()
    }

    /// Stops admitting operations, drains in-flight ones, stops every
    /// service, flushes replication and closes the store.
    pub async fn shutdown(&self) {
        self.inner.shutdown.trigger_shutdown();
        let timeout = Duration::from_millis(self.inner.config.shutdown_drain_timeout_ms);
        if !self.inner.shutdown.wait_for_drain(timeout).await {
            warn!(
                in_flight = self.inner.shutdown.in_flight_count(),
                "shutdown drain timed out"
            );
        }

        let stopped = self.inner.registry.clear();
        self.inner.factories.clear();
        self.inner.replication.lock().await.stop().await;
        if let Err(e) = self.inner.store.close().await {
            warn!(error = %e, "document store close failed");
        }
        info!(
            host_id = %self.inner.config.host_id,
            services = stopped,
            "host stopped"
        );
    }
}

// ---------------------------------------------------------------------------
// HostBuilder
// ---------------------------------------------------------------------------

/// Assembles a [`ServiceHost`] from its collaborators.
pub struct HostBuilder {
    config: HostConfig,
    store: Option<Arc<dyn DocumentStore>>,
    replicator: Option<Arc<dyn Replicator>>,
    clock: Option<Arc<dyn ClockSource>>,
}

impl HostBuilder {
    #[must_use]
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            store: None,
            replicator: None,
            clock: None,
        }
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn replicator(mut self, replicator: Arc<dyn Replicator>) -> Self {
        self.replicator = Some(replicator);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the host. Defaults: in-memory store, local replicator, system clock.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn build(self) -> ServiceHost {
        let Self {
            config,
            store,
            replicator,
            clock,
        } = self;
        let store =
            store.unwrap_or_else(|| Arc::new(MemoryDocumentStore::new()) as Arc<dyn DocumentStore>);
        let replicator =
            replicator.unwrap_or_else(|| Arc::new(LocalReplicator) as Arc<dyn Replicator>);
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn ClockSource>);
        let replication = BackgroundWorker::start(
            ReplicationRunnable::new(Arc::clone(&replicator)),
            REPLICATION_TICK_MS,
            config.replication_queue_capacity.max(1),
        );

        let inner = Arc::new_cyclic(|weak| {
            let pipeline = build_operation_pipeline(HostRouter::new(weak.clone()), &config);
            HostInner {
                config,
                registry: ServiceRegistry::new(),
                factories: dashmap::DashMap::new(),
                store,
                replicator,
                clock,
                stats: StatsRegistry::new(),
                shutdown: ShutdownController::new(),
                replication: tokio::sync::Mutex::new(replication),
                pipeline: parking_lot::Mutex::new(pipeline),
            }
        });
        ServiceHost { inner }
    }
}
