//! Per-path service instance: a task owning one document and its queue.
//!
//! Every operation for a path goes through the instance's bounded queue.
//! In serial mode operations are handled one at a time in queue order; with
//! `CONCURRENT_UPDATE_HANDLING` each runs on its own task while version
//! assignment and persistence stay serialized under the state lock. DELETE
//! always runs inline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use docket_core::{
    Action, ContextId, Document, Pragmas, ServiceCapabilities, ServiceOptions, INITIAL_VERSION,
};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, warn};

use super::host::{HostInner, ServiceHost};
use super::lifecycle::LifecycleState;
use super::operation::{
    Completion, Operation, OperationError, OperationOrigin, OperationResponse, OperationResult,
};
use super::registry::{Lookup, PriorVersion};
use super::stateful::{ServiceContext, StatefulService};
use crate::replication::ReplicationRequest;
use crate::storage::{check_expiry, ExpiryReason, StoredDocument};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// A queued operation and the handle that completes it.
pub(crate) struct Pending {
    pub op: Operation,
    pub completion: Completion,
}

// ---------------------------------------------------------------------------
// InstanceHandle
// ---------------------------------------------------------------------------

/// Cloneable address of a running instance.
#[derive(Clone)]
pub(crate) struct InstanceHandle {
    id: u64,
    tx: mpsc::Sender<Pending>,
    snapshot: Arc<ArcSwapOption<Document>>,
    settled: watch::Receiver<bool>,
}

impl InstanceHandle {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Last committed document, if the instance is available.
    pub(crate) fn current(&self) -> Option<Arc<Document>> {
        self.snapshot.load_full()
    }

    /// Resolves once the create or restore has finished, whatever its
    /// outcome. The registry already reflects that outcome by then.
    pub(crate) async fn settled(&self) {
        let mut settled = self.settled.clone();
        // A closed channel means the task is gone, which is settled too.
        let _ = settled.wait_for(|done| *done).await;
    }

    /// Queues `op`, waiting for queue capacity. Gives the operation back
    /// when the instance has stopped accepting work.
    pub(crate) async fn enqueue(
        &self,
        op: Operation,
    ) -> Result<oneshot::Receiver<OperationResult>, Operation> {
        let (completion, rx) = Completion::pair();
        match self.tx.send(Pending { op, completion }).await {
            Ok(()) => Ok(rx),
            Err(mpsc::error::SendError(pending)) => Err(pending.op),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        let (_done, settled) = watch::channel(true);
        Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            snapshot: Arc::new(ArcSwapOption::empty()),
            settled,
        }
    }
}

/// How a new instance obtains its first state.
pub(crate) enum StartMode {
    /// Run the start hook on `initial` and persist it.
    Create {
        initial: Document,
        request: Operation,
        prior: Option<PriorVersion>,
        completion: Completion,
    },
    /// Load the latest durable version.
    Restore { prior: Option<PriorVersion> },
}

/// Spawns the task for a new instance and returns its address.
pub(crate) fn spawn_instance(
    host: Arc<HostInner>,
    link: String,
    service: Arc<dyn StatefulService>,
    options: ServiceOptions,
    start: StartMode,
) -> InstanceHandle {
    let (tx, rx) = mpsc::channel(host.config.instance_queue_capacity.max(1));
    let snapshot = Arc::new(ArcSwapOption::empty());
    let (settle, settled) = watch::channel(false);
    let id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
    let instance = Arc::new(Instance {
        id,
        link,
        service,
        options,
        host,
        snapshot: Arc::clone(&snapshot),
        state: Mutex::new(InstanceState {
            document: None,
            stage: LifecycleState::Creating,
        }),
        stopped: AtomicBool::new(false),
        expiring: AtomicBool::new(false),
        retired: AtomicBool::new(false),
    });
    tokio::spawn(instance.run(start, rx, settle));
    InstanceHandle {
        id,
        tx,
        snapshot,
        settled,
    }
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

struct InstanceState {
    document: Option<Document>,
    stage: LifecycleState,
}

enum Flow {
    Continue,
    Stop,
}

struct Instance {
    id: u64,
    link: String,
    service: Arc<dyn StatefulService>,
    options: ServiceOptions,
    host: Arc<HostInner>,
    snapshot: Arc<ArcSwapOption<Document>>,
    /// Commit lock: version assignment and persistence happen under it.
    state: Mutex<InstanceState>,
    stopped: AtomicBool,
    expiring: AtomicBool,
    /// Set once deleted; stats are no longer recorded.
    retired: AtomicBool,
}

impl Instance {
    async fn run(
        self: Arc<Self>,
        start: StartMode,
        mut rx: mpsc::Receiver<Pending>,
        settle: watch::Sender<bool>,
    ) {
        let failure = match start {
            StartMode::Create {
                initial,
                request,
                prior,
                completion,
            } => {
                let started = Instant::now();
                let result = self.create(initial, &request, prior).await;
                let failure = match &result {
                    Ok(_) => {
                        self.record(Action::Create, started);
                        None
                    }
                    Err(e) => {
                        debug!(path = %self.link, error = %e, "create failed");
                        self.host.registry.abandon(&self.link, self.id, prior);
                        Some(OperationError::not_found(&self.link))
                    }
                };
                completion.complete(result.map(|doc| OperationResponse::from_document(&doc)));
                failure
            }
            StartMode::Restore { prior } => self.restore(prior).await.err(),
        };
        settle.send_replace(true);

        if let Some(cause) = failure {
            self.fail_queued(rx, &cause).await;
            return;
        }

        let concurrent = self
            .options
            .contains(ServiceOptions::CONCURRENT_UPDATE_HANDLING);
        while let Some(pending) = rx.recv().await {
            if self.stopped.load(Ordering::Acquire) {
                self.redispatch(pending);
                break;
            }
            if concurrent && pending.op.action() != Action::Delete {
                let this = Arc::clone(&self);
                tokio::spawn(async move {
                    this.process(pending).await;
                });
            } else if let Flow::Stop = self.process(pending).await {
                break;
            }
        }

        rx.close();
        while let Some(pending) = rx.recv().await {
            self.redispatch(pending);
        }
    }

    async fn process(&self, pending: Pending) -> Flow {
        let Pending { op, completion } = pending;
        let action = op.action();
        let started = Instant::now();
        let (result, flow) = self.dispatch(&op).await;
        self.record(action, started);
        completion.complete(result);
        flow
    }

    async fn dispatch(&self, op: &Operation) -> (OperationResult, Flow) {
        let current = match self.current().await {
            Ok(current) => current,
            Err(e) => return (Err(e), Flow::Continue),
        };

        if check_expiry(&current, self.host.clock.now_micros()) == ExpiryReason::Deadline {
            self.expire(op.context_id().cloned(), current).await;
            return (Err(OperationError::not_found(&self.link)), Flow::Stop);
        }

        match op.action() {
            Action::Discover => (OperationResponse::json(&self.capabilities()), Flow::Continue),
            Action::Read => (Ok(OperationResponse::from_document(&current)), Flow::Continue),
            Action::Create => (
                Err(OperationError::conflict(format!(
                    "service already started: {}",
                    self.link
                ))),
                Flow::Continue,
            ),
            Action::Update | Action::UpdateMerge => (self.update(op, current).await, Flow::Continue),
            Action::Delete => self.delete(op, current).await,
        }
    }

    // -- start -------------------------------------------------------------

    async fn create(
        &self,
        mut initial: Document,
        request: &Operation,
        prior: Option<PriorVersion>,
    ) -> Result<Document, OperationError> {
        self.validate_body(&initial, false)?;

        let prior = if self.persistent() {
            self.host
                .store
                .get_latest(&self.link)
                .await?
                .map(|stored| PriorVersion {
                    version: stored.version(),
                    deleted: stored.deleted,
                })
        } else {
            prior
        };
        let version = match prior {
            // The tombstone sits one above the version that was deleted.
            Some(prior)
                if prior.deleted
                    && request.has_pragma(Pragmas::VERSION_CHECK)
                    && initial.version <= prior.version.saturating_sub(1) =>
            {
                return Err(OperationError::conflict(format!(
                    "version {} of {} is not greater than deleted version {}",
                    initial.version,
                    self.link,
                    prior.version.saturating_sub(1)
                )));
            }
            Some(prior) => prior.version + 1,
            None => INITIAL_VERSION,
        };

        self.stamp(&mut initial, version, Action::Create);
        let ctx = self.context(request);
        self.service.handle_start(&ctx, &initial).await?;
        self.make_durable(&initial, false, request).await?;

        {
            let mut state = self.state.lock().await;
            state.document = Some(initial.clone());
            state.stage = LifecycleState::Available;
        }
        self.snapshot.store(Some(Arc::new(initial.clone())));
        self.host
            .registry
            .transition(&self.link, self.id, LifecycleState::Available, None);
        debug!(path = %self.link, version, "service created");
        Ok(initial)
    }

    async fn restore(&self, prior: Option<PriorVersion>) -> Result<(), OperationError> {
        let stored = match self.host.store.get_latest(&self.link).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(path = %self.link, error = %e, "restore failed");
                self.host.registry.abandon(&self.link, self.id, prior);
                return Err(e.into());
            }
        };
        let document = match stored {
            None => {
                self.host.registry.abandon(&self.link, self.id, prior);
                return Err(OperationError::not_found(&self.link));
            }
            Some(stored) if stored.deleted => {
                self.host.registry.transition(
                    &self.link,
                    self.id,
                    LifecycleState::Deleted,
                    Some(stored.version()),
                );
                return Err(OperationError::not_found(&self.link));
            }
            Some(stored) => stored.document,
        };

        {
            let mut state = self.state.lock().await;
            state.document = Some(document.clone());
            state.stage = LifecycleState::Available;
        }
        if document.is_expired_at(self.host.clock.now_micros()) {
            self.expire(None, document).await;
            return Err(OperationError::not_found(&self.link));
        }

        let version = document.version;
        self.snapshot.store(Some(Arc::new(document)));
        self.host
            .registry
            .transition(&self.link, self.id, LifecycleState::Available, None);
        debug!(path = %self.link, version, "service restored");
        Ok(())
    }

    // -- update ------------------------------------------------------------

    async fn update(&self, op: &Operation, current: Document) -> OperationResult {
        let body = op
            .body_document()?
            .ok_or_else(|| OperationError::validation("body is required"))?;
        let merge = op.action() == Action::UpdateMerge;
        self.validate_body(&body, merge)?;

        let expected = (self.options.contains(ServiceOptions::STRICT_UPDATE_CHECKING)
            && op.origin() == OperationOrigin::Client)
            .then_some(body.version);
        if let Some(expected) = expected {
            check_strict(&self.link, expected, current.version)?;
        }

        let ctx = self.context(op);
        let next = if merge {
            self.service
                .handle_update_merge(&ctx, op, &current, body)
                .await?
        } else {
            self.service.handle_update(&ctx, op, &current, body).await?
        };

        if merge && self.host.config.not_modified_detection && next.state_equals(&current) {
            return Ok(OperationResponse::not_modified(&current));
        }

        let committed = self.commit(op, next, expected).await?;
        Ok(OperationResponse::from_document(&committed))
    }

    async fn commit(
        &self,
        op: &Operation,
        mut next: Document,
        expected: Option<u64>,
    ) -> Result<Document, OperationError> {
        let mut state = self.state.lock().await;
        let base_version = self.locked_base(&mut state).await?.version;
        if let Some(expected) = expected {
            check_strict(&self.link, expected, base_version)?;
        }

        next.source_link = None;
        self.stamp(&mut next, base_version + 1, op.action());
        self.make_durable(&next, false, op).await?;

        state.document = Some(next.clone());
        self.snapshot.store(Some(Arc::new(next.clone())));
        Ok(next)
    }

    // -- delete ------------------------------------------------------------

    async fn delete(&self, op: &Operation, current: Document) -> (OperationResult, Flow) {
        let ctx = self.context(op);
        if let Err(e) = self.service.handle_delete(&ctx, op, Some(&current)).await {
            return (Err(e), Flow::Continue);
        }

        let mut state = self.state.lock().await;
        let base = match self.locked_base(&mut state).await {
            Ok(base) => base,
            Err(e) => return (Err(e), Flow::Continue),
        };

        if op.has_pragma(Pragmas::NO_INDEX_UPDATE) {
            self.leave(&mut state, LifecycleState::Stopped, base.version);
            debug!(path = %self.link, version = base.version, "service stopped");
            return (Ok(OperationResponse::from_document(&base)), Flow::Stop);
        }

        let mut tombstone = base;
        let version = tombstone.version + 1;
        self.stamp(&mut tombstone, version, Action::Delete);
        if let Err(e) = self.make_durable(&tombstone, true, op).await {
            return (Err(e), Flow::Continue);
        }
        self.leave(&mut state, LifecycleState::Deleted, version);
        debug!(path = %self.link, version, "service deleted");
        (Ok(OperationResponse::from_document(&tombstone)), Flow::Stop)
    }

    /// Runs the delete hook for an expired document and tombstones it.
    /// Hook and store failures are logged; the document is gone either way.
    async fn expire(&self, context_id: Option<ContextId>, expired: Document) {
        if self.expiring.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut delete = Operation::delete(self.link.clone())
            .with_document(&expired)
            .with_origin(OperationOrigin::Expiration);
        if let Some(context_id) = context_id {
            delete = delete.with_context_id(context_id);
        }

        let ctx = self.context(&delete);
        if let Err(e) = self.service.handle_delete(&ctx, &delete, None).await {
            warn!(path = %self.link, error = %e, "delete hook failed on expiry");
        }

        let mut state = self.state.lock().await;
        let mut tombstone = match self.locked_base(&mut state).await {
            Ok(base) => base,
            Err(e) => {
                debug!(path = %self.link, error = %e, "expired document already gone");
                return;
            }
        };
        let version = tombstone.version + 1;
        self.stamp(&mut tombstone, version, Action::Delete);
        if let Err(e) = self.make_durable(&tombstone, true, &delete).await {
            warn!(path = %self.link, error = %e, "expiry tombstone not recorded");
        }
        self.leave(&mut state, LifecycleState::Deleted, version);
        debug!(path = %self.link, version, "document expired");
    }

    fn leave(&self, state: &mut InstanceState, next: LifecycleState, version: u64) {
        state.stage = next;
        state.document = None;
        self.snapshot.store(None);
        self.stopped.store(true, Ordering::Release);
        if next == LifecycleState::Deleted {
            self.retired.store(true, Ordering::Release);
            self.host.stats.remove(&self.link);
        }
        self.host
            .registry
            .transition(&self.link, self.id, next, Some(version));
    }

    // -- helpers -----------------------------------------------------------

    /// The document the next version builds on, read under the commit lock.
    /// Without state caching a persistent instance takes it from the store
    /// and refreshes its own copy.
    async fn locked_base(&self, state: &mut InstanceState) -> Result<Document, OperationError> {
        let cached = match (&state.document, state.stage) {
            (Some(doc), LifecycleState::Available) => doc.clone(),
            _ => return Err(OperationError::not_found(&self.link)),
        };
        if !self.reads_through() {
            return Ok(cached);
        }
        match self.host.store.get_latest(&self.link).await? {
            Some(stored) if !stored.deleted => {
                state.document = Some(stored.document.clone());
                Ok(stored.document)
            }
            _ => Err(OperationError::not_found(&self.link)),
        }
    }

    fn reads_through(&self) -> bool {
        self.persistent() && !self.host.config.service_state_caching
    }

    async fn current(&self) -> Result<Document, OperationError> {
        let Some(cached) = self.snapshot.load_full() else {
            return Err(OperationError::not_found(&self.link));
        };
        if !self.reads_through() {
            return Ok((*cached).clone());
        }
        match self.host.store.get_latest(&self.link).await? {
            Some(stored) if !stored.deleted => Ok(stored.document),
            _ => Err(OperationError::not_found(&self.link)),
        }
    }

    /// Replicates with quorum when required, appends, then queues
    /// asynchronous replication. Nothing in memory changes here.
    async fn make_durable(
        &self,
        document: &Document,
        deleted: bool,
        op: &Operation,
    ) -> Result<(), OperationError> {
        let replicated = self.options.contains(ServiceOptions::REPLICATION);
        let request = replicated.then(|| ReplicationRequest {
            document: document.clone(),
            action: op.action(),
            deleted,
            context_id: op.context_id().cloned(),
        });

        if let Some(request) = &request {
            if self.options.contains(ServiceOptions::OWNER_SELECTION) {
                let ack = self
                    .host
                    .replicator
                    .replicate(request)
                    .await
                    .map_err(|e| OperationError::Infrastructure {
                        operation: "replication",
                        message: e.to_string(),
                    })?;
                if !ack.has_quorum() {
                    return Err(OperationError::Infrastructure {
                        operation: "replication",
                        message: format!(
                            "accepted by {} of {} required replicas",
                            ack.accepted, ack.required
                        ),
                    });
                }
            }
        }

        if self.persistent() {
            let entry = if deleted {
                StoredDocument::tombstone(document.clone())
            } else {
                StoredDocument::live(document.clone())
            };
            self.host.store.append(entry).await?;
        }

        if let Some(request) = request {
            if !self.options.contains(ServiceOptions::OWNER_SELECTION) {
                self.host.replicate_async(request).await;
            }
        }
        Ok(())
    }

    fn stamp(&self, document: &mut Document, version: u64, action: Action) {
        document.self_link.clone_from(&self.link);
        document.kind.clone_from(&self.service.description().kind);
        document.version = version;
        document.update_time_micros = self.host.clock.now_micros();
        document.update_action = Some(action);
    }

    fn validate_body(&self, body: &Document, partial: bool) -> Result<(), OperationError> {
        self.service
            .description()
            .validate(body, partial)
            .into_result()
            .map_err(OperationError::validation)
    }

    fn capabilities(&self) -> ServiceCapabilities {
        let description = self.service.description();
        ServiceCapabilities {
            document_self_link: self.link.clone(),
            document_kind: Some(description.kind.clone()),
            options: self.options.names(),
            actions: Action::ALL.to_vec(),
            description: Some(description.clone()),
        }
    }

    fn context(&self, op: &Operation) -> ServiceContext {
        ServiceContext::new(
            self.link.clone(),
            op.context_id().cloned(),
            ServiceHost::from_inner(Arc::clone(&self.host)),
        )
    }

    fn persistent(&self) -> bool {
        self.options.contains(ServiceOptions::PERSISTENCE)
    }

    fn record(&self, action: Action, started: Instant) {
        if self.options.contains(ServiceOptions::INSTRUMENTATION)
            && !self.retired.load(Ordering::Acquire)
        {
            self.host.stats.record_action(
                &self.link,
                action,
                started.elapsed(),
                self.host.clock.now_micros(),
            );
        }
    }

    /// Hands an operation that arrived after this instance stopped back to
    /// the host, which routes it to whatever now owns the path.
    fn redispatch(&self, pending: Pending) {
        let Pending { op, completion } = pending;
        let route = self.host.route(op);
        tokio::spawn(async move {
            completion.complete(route.await);
        });
    }

    /// Completes everything queued behind a failed start. When the store
    /// had nothing and another instance has since claimed the path, queued
    /// operations go to that instance instead.
    async fn fail_queued(&self, mut rx: mpsc::Receiver<Pending>, cause: &OperationError) {
        rx.close();
        while let Some(pending) = rx.recv().await {
            if matches!(cause, OperationError::NotFound { .. }) && self.superseded() {
                self.redispatch(pending);
                continue;
            }
            let error = match cause {
                OperationError::NotFound { .. } => OperationError::not_found(&self.link),
                other => OperationError::Infrastructure {
                    operation: "restore",
                    message: other.to_string(),
                },
            };
            pending.completion.complete(Err(error));
        }
    }

    fn superseded(&self) -> bool {
        matches!(
            self.host.registry.lookup(&self.link),
            Lookup::Instance { handle, .. } if handle.id() != self.id
        )
    }
}

fn check_strict(link: &str, expected: u64, current: u64) -> Result<(), OperationError> {
    if expected == current {
        Ok(())
    } else {
        Err(OperationError::conflict(format!(
            "stale update of {link}: body version {expected}, current version {current}"
        )))
    }
}
