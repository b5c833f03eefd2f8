//! Factory: a stateless service that creates and lists child services.
//!
//! Creates are serialized per child link. A duplicate create either becomes
//! an update of the running child (`IDEMPOTENT_CREATE`) or fails Conflict.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use docket_core::{
    Action, Document, DocumentDescription, DocumentQueryResult, ServiceCapabilities, ServiceOptions,
};
use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::host::{HostInner, ServiceHost};
use super::lifecycle::LifecycleState;
use super::operation::{
    Operation, OperationError, OperationOrigin, OperationResponse, OperationResult,
};
use super::registry::{is_direct_child, Lookup};
use super::stateful::StatefulService;
use super::stateless::StatelessService;

type ChildBuilder = dyn Fn() -> Arc<dyn StatefulService> + Send + Sync;

pub struct FactoryService {
    description: DocumentDescription,
    builder: Box<ChildBuilder>,
    options: RwLock<ServiceOptions>,
    child_options: ServiceOptions,
    cloning: bool,
    self_link: OnceLock<String>,
    create_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl fmt::Debug for FactoryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryService")
            .field("self_link", &self.self_link())
            .field("kind", &self.description.kind)
            .field("options", &self.options())
            .field("child_options", &self.child_options)
            .field("cloning", &self.cloning)
            .finish_non_exhaustive()
    }
}

impl FactoryService {
    /// Factory for children described by `description`, built by `builder`.
    #[must_use]
    pub fn new<F>(description: DocumentDescription, builder: F) -> Self
    where
        F: Fn() -> Arc<dyn StatefulService> + Send + Sync + 'static,
    {
        Self {
            description,
            builder: Box::new(builder),
            options: RwLock::new(ServiceOptions::empty()),
            child_options: ServiceOptions::empty(),
            cloning: false,
            self_link: OnceLock::new(),
            create_locks: DashMap::new(),
        }
    }

    /// Options of the factory itself (`IDEMPOTENT_CREATE`, `INSTRUMENTATION`).
    #[must_use]
    pub fn with_options(self, options: ServiceOptions) -> Self {
        *self.options.write() = options;
        self
    }

    /// Options OR-ed into every child's own options.
    #[must_use]
    pub fn with_child_options(mut self, options: ServiceOptions) -> Self {
        self.child_options = options;
        self
    }

    /// Accept creates carrying a `documentSourceLink`.
    #[must_use]
    pub fn with_cloning(mut self) -> Self {
        self.cloning = true;
        self
    }

    /// Turns a factory option on or off at runtime.
    pub fn set_option(&self, option: ServiceOptions, enabled: bool) {
        self.options.write().set(option, enabled);
    }

    #[must_use]
    pub fn child_description(&self) -> &DocumentDescription {
        &self.description
    }

    #[must_use]
    pub fn child_options(&self) -> ServiceOptions {
        self.child_options
    }

    /// Path the factory was started at; empty before start.
    #[must_use]
    pub fn self_link(&self) -> &str {
        self.self_link.get().map_or("", String::as_str)
    }

    pub(crate) fn bind(&self, link: &str) -> Result<(), OperationError> {
        self.self_link.set(link.to_string()).map_err(|_| {
            OperationError::configuration(format!(
                "factory already started at {}",
                self.self_link()
            ))
        })
    }

    /// Builds a probe child and checks it against the declared description.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the description is malformed or the
    /// builder constructs a different kind.
    pub(crate) fn check_child_type(&self) -> Result<ServiceOptions, OperationError> {
        self.description.check().map_err(|e| {
            OperationError::configuration(format!("invalid child description: {e}"))
        })?;
        self.build_child().map(|(_, options)| options)
    }

    /// Constructs a child and its effective options.
    pub(crate) fn build_child(
        &self,
    ) -> Result<(Arc<dyn StatefulService>, ServiceOptions), OperationError> {
        let child = (self.builder)();
        let built = child.description();
        if built.kind != self.description.kind {
            return Err(OperationError::configuration(format!(
                "factory declares kind '{}' but constructs '{}'",
                self.description.kind, built.kind
            )));
        }
        built
            .check()
            .map_err(|e| OperationError::configuration(e.to_string()))?;
        let options = self.child_options | child.options();
        Ok((child, options))
    }

    fn idempotent(&self) -> bool {
        self.options().contains(ServiceOptions::IDEMPOTENT_CREATE)
            || self
                .child_options
                .contains(ServiceOptions::IDEMPOTENT_CREATE)
    }

    fn prefix(&self) -> String {
        format!("{}/", self.self_link())
    }

    /// Places the requested link under this factory, generating one when absent.
    fn child_link(&self, requested: &str) -> String {
        match requested.rsplit('/').next() {
            Some(name) if !name.is_empty() => format!("{}{name}", self.prefix()),
            _ => format!("{}{}", self.prefix(), Uuid::new_v4()),
        }
    }

    // -- CREATE ------------------------------------------------------------

    async fn handle_create(&self, host: &ServiceHost, op: Operation) -> OperationResult {
        let mut body = op
            .body_document()?
            .ok_or_else(|| OperationError::validation("body is required"))?;

        if let Some(source) = body.source_link.clone() {
            if !self.cloning {
                return Err(OperationError::validation(format!(
                    "factory {} does not support cloning",
                    self.self_link()
                )));
            }
            body = clone_from(host, &op, &source, body).await?;
        }

        let link = self.child_link(&body.self_link);
        body.self_link.clone_from(&link);

        let slot = CreateLock::acquire(&self.create_locks, &link);
        let guard = slot.lock.lock().await;
        self.create_locked(host, op, link.clone(), body, guard).await
    }

    async fn create_locked(
        &self,
        host: &ServiceHost,
        op: Operation,
        link: String,
        body: Document,
        guard: MutexGuard<'_, ()>,
    ) -> OperationResult {
        let inner = host.inner();
        match settled_lookup(inner, &link).await {
            Lookup::Instance { handle, .. } => {
                if !self.idempotent() {
                    return Err(OperationError::conflict(format!(
                        "service already started: {link}"
                    )));
                }
                debug!(path = %link, "duplicate create converted to update");
                let update = op
                    .retarget(Action::Update, link.clone())
                    .with_document(&body)
                    .with_origin(OperationOrigin::IdempotentCreate);
                let queued = handle.enqueue(update).await;
                drop(guard);
                match queued {
                    Ok(rx) => rx.await.unwrap_or_else(|_| Err(abandoned(&link))),
                    Err(update) => inner.route(update).await,
                }
            }
            Lookup::Stateless(_) => Err(OperationError::conflict(format!(
                "service already started: {link}"
            ))),
            Lookup::Vacant { .. } => {
                let (service, options) = self.build_child()?;
                let result = inner.start_child(link, service, options, body, op).await;
                drop(guard);
                result
            }
        }
    }

    // -- READ --------------------------------------------------------------

    async fn handle_query(&self, host: &ServiceHost, op: &Operation) -> OperationResult {
        let inner = host.inner();
        let prefix = self.prefix();

        let mut children: BTreeMap<String, Document> = inner
            .store
            .query(&prefix)
            .await?
            .into_iter()
            .filter(|doc| is_direct_child(&doc.self_link, &prefix))
            .map(|doc| (doc.self_link.clone(), doc))
            .collect();
        for (link, doc) in inner.registry.running_children(&prefix) {
            children.insert(link, (*doc).clone());
        }

        let now = inner.clock.now_micros();
        let expired: Vec<String> = children
            .iter()
            .filter(|(_, doc)| doc.is_expired_at(now))
            .map(|(link, _)| link.clone())
            .collect();
        if !expired.is_empty() {
            // A read drives each child through its lazy expiry path.
            let reads = expired
                .iter()
                .map(|link| host.send(op.derive(Action::Read, link.clone())));
            futures_util::future::join_all(reads).await;
            for link in &expired {
                children.remove(link);
            }
        }

        let result = DocumentQueryResult {
            document_links: children.keys().cloned().collect(),
            document_count: children.len() as u64,
            documents: op.expand().then_some(children),
        };
        OperationResponse::json(&result)
    }
}

/// Per-link create lock. Dropping it, including when the create is
/// cancelled, removes the map entry once nobody else waits on it.
struct CreateLock<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    link: &'a str,
    lock: Arc<Mutex<()>>,
}

impl<'a> CreateLock<'a> {
    fn acquire(locks: &'a DashMap<String, Arc<Mutex<()>>>, link: &'a str) -> Self {
        let lock = locks
            .entry(link.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Self { locks, link, lock }
    }
}

impl Drop for CreateLock<'_> {
    fn drop(&mut self) {
        // Two references left: the map's and this one.
        self.locks
            .remove_if(self.link, |_, lock| Arc::strong_count(lock) == 2);
    }
}

/// Looks `link` up, first waiting out a restore in progress so a path the
/// store knows nothing about reads as vacant.
async fn settled_lookup(inner: &HostInner, link: &str) -> Lookup {
    let mut waited = None;
    loop {
        match inner.registry.lookup(link) {
            Lookup::Instance {
                handle,
                state: LifecycleState::Stopped,
            } if waited != Some(handle.id()) => {
                handle.settled().await;
                waited = Some(handle.id());
            }
            other => return other,
        }
    }
}

/// Reads `source` and overlays the create body on it.
async fn clone_from(
    host: &ServiceHost,
    op: &Operation,
    source: &str,
    body: Document,
) -> Result<Document, OperationError> {
    let response = host.send(op.derive(Action::Read, source)).await?;
    let mut cloned = response.document()?;
    cloned.merge_from(&body);
    cloned.self_link = body.self_link;
    cloned.version = body.version;
    cloned.kind = body.kind;
    cloned.source_link = Some(source.to_string());
    Ok(cloned)
}

fn abandoned(link: &str) -> OperationError {
    OperationError::Unavailable {
        reason: format!("service {link} stopped before completing the operation"),
    }
}

#[async_trait]
impl StatelessService for FactoryService {
    fn options(&self) -> ServiceOptions {
        *self.options.read()
    }

    fn capabilities(&self, self_link: &str) -> ServiceCapabilities {
        ServiceCapabilities {
            document_self_link: self_link.to_string(),
            document_kind: Some(self.description.kind.clone()),
            options: self.options().names(),
            actions: vec![Action::Discover, Action::Read, Action::Create, Action::Delete],
            description: Some(self.description.clone()),
        }
    }

    async fn handle(&self, host: &ServiceHost, op: Operation) -> OperationResult {
        let action = op.action();
        let started = Instant::now();
        let result = match action {
            Action::Create => self.handle_create(host, op).await,
            Action::Read => self.handle_query(host, &op).await,
            Action::Delete => {
                host.stop_factory(self.self_link());
                Ok(OperationResponse::empty())
            }
            Action::Discover => OperationResponse::json(&self.capabilities(self.self_link())),
            Action::Update | Action::UpdateMerge => Err(OperationError::validation(format!(
                "{action} not supported on factory {}",
                self.self_link()
            ))),
        };
        if self.options().contains(ServiceOptions::INSTRUMENTATION) {
            let inner = host.inner();
            inner.stats.record_action(
                self.self_link(),
                action,
                started.elapsed(),
                inner.clock.now_micros(),
            );
        }
        result
    }
}
