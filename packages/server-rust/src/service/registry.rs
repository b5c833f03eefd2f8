//! Path registry: the lifecycle state and running service of every link.
//!
//! All state changes for one link happen under that link's `DashMap` shard
//! lock, so check-then-insert races between concurrent creates cannot occur.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use docket_core::Document;
use tracing::warn;

use super::instance::InstanceHandle;
use super::lifecycle::LifecycleState;
use super::operation::OperationError;
use super::stateless::StatelessService;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// The running service behind a path.
#[derive(Clone)]
pub(crate) enum ServiceSlot {
    Stateful(InstanceHandle),
    Stateless(Arc<dyn StatelessService>),
}

/// Last version a path held before its instance went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PriorVersion {
    pub version: u64,
    pub deleted: bool,
}

struct ServiceEntry {
    state: LifecycleState,
    slot: Option<ServiceSlot>,
    last_version: Option<u64>,
}

impl ServiceEntry {
    fn prior(&self) -> Option<PriorVersion> {
        self.last_version.map(|version| PriorVersion {
            version,
            deleted: self.state == LifecycleState::Deleted,
        })
    }

    fn holds_instance(&self, instance_id: u64) -> bool {
        matches!(&self.slot, Some(ServiceSlot::Stateful(handle)) if handle.id() == instance_id)
    }
}

/// Result of resolving a path.
pub(crate) enum Lookup {
    Instance {
        handle: InstanceHandle,
        state: LifecycleState,
    },
    Stateless(Arc<dyn StatelessService>),
    /// Nothing runs at the path. `prior` is set when something did.
    Vacant { prior: Option<PriorVersion> },
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ServiceRegistry {
    entries: DashMap<String, ServiceEntry>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lifecycle state of a stateful path, if the host has seen it.
    #[must_use]
    pub fn state(&self, link: &str) -> Option<LifecycleState> {
        self.entries.get(link).and_then(|entry| match entry.slot {
            Some(ServiceSlot::Stateless(_)) => None,
            _ => Some(entry.state),
        })
    }

    #[must_use]
    pub fn contains(&self, link: &str) -> bool {
        self.entries
            .get(link)
            .is_some_and(|entry| entry.slot.is_some())
    }

    /// Number of paths with a running service.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.slot.is_some())
            .count()
    }

    pub(crate) fn lookup(&self, link: &str) -> Lookup {
        let Some(entry) = self.entries.get(link) else {
            return Lookup::Vacant { prior: None };
        };
        match &entry.slot {
            Some(ServiceSlot::Stateful(handle)) => Lookup::Instance {
                handle: handle.clone(),
                state: entry.state,
            },
            Some(ServiceSlot::Stateless(service)) => Lookup::Stateless(Arc::clone(service)),
            None => Lookup::Vacant {
                prior: entry.prior(),
            },
        }
    }

    /// Registers a stateless service.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when a service already runs at `link`.
    pub(crate) fn register_stateless(
        &self,
        link: &str,
        service: Arc<dyn StatelessService>,
    ) -> Result<(), OperationError> {
        match self.entries.entry(link.to_string()) {
            Entry::Occupied(entry) if entry.get().slot.is_some() => Err(already_started(link)),
            Entry::Occupied(mut entry) => {
                let entry = entry.get_mut();
                entry.slot = Some(ServiceSlot::Stateless(service));
                entry.state = LifecycleState::Available;
                Ok(())
            }
            Entry::Vacant(entry) => {
                entry.insert(ServiceEntry {
                    state: LifecycleState::Available,
                    slot: Some(ServiceSlot::Stateless(service)),
                    last_version: None,
                });
                Ok(())
            }
        }
    }

    /// Claims `link` for a new instance in `Creating`. `spawn` receives the
    /// version the path last held and runs under the shard lock.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when a service already runs at `link`.
    pub(crate) fn begin_create<F>(&self, link: &str, spawn: F) -> Result<(), OperationError>
    where
        F: FnOnce(Option<PriorVersion>) -> InstanceHandle,
    {
        match self.entries.entry(link.to_string()) {
            Entry::Occupied(entry) if entry.get().slot.is_some() => Err(already_started(link)),
            Entry::Occupied(mut entry) => {
                let entry = entry.get_mut();
                let handle = spawn(entry.prior());
                entry.slot = Some(ServiceSlot::Stateful(handle));
                entry.state = LifecycleState::Creating;
                Ok(())
            }
            Entry::Vacant(entry) => {
                let handle = spawn(None);
                entry.insert(ServiceEntry {
                    state: LifecycleState::Creating,
                    slot: Some(ServiceSlot::Stateful(handle)),
                    last_version: None,
                });
                Ok(())
            }
        }
    }

    /// Returns the instance running at `link`, spawning a restoring one when
    /// the path is vacant. Returns `None` for deleted or stateless paths.
    pub(crate) fn begin_restore<F>(&self, link: &str, spawn: F) -> Option<InstanceHandle>
    where
        F: FnOnce(Option<PriorVersion>) -> InstanceHandle,
    {
        match self.entries.entry(link.to_string()) {
            Entry::Occupied(mut entry) => {
                let entry = entry.get_mut();
                match &entry.slot {
                    Some(ServiceSlot::Stateful(handle)) => Some(handle.clone()),
                    Some(ServiceSlot::Stateless(_)) => None,
                    None if entry.state == LifecycleState::Deleted => None,
                    None => {
                        let handle = spawn(entry.prior());
                        entry.slot = Some(ServiceSlot::Stateful(handle.clone()));
                        entry.state = LifecycleState::Stopped;
                        Some(handle)
                    }
                }
            }
            Entry::Vacant(entry) => {
                let handle = spawn(None);
                entry.insert(ServiceEntry {
                    state: LifecycleState::Stopped,
                    slot: Some(ServiceSlot::Stateful(handle.clone())),
                    last_version: None,
                });
                Some(handle)
            }
        }
    }

    /// Moves the instance `instance_id` at `link` to `next`. Leaving memory
    /// (`Stopped`, `Deleted`) releases the slot and records `version`.
    ///
    /// Ignored when another instance has since taken the path.
    pub(crate) fn transition(
        &self,
        link: &str,
        instance_id: u64,
        next: LifecycleState,
        version: Option<u64>,
    ) {
        let Some(mut entry) = self.entries.get_mut(link) else {
            return;
        };
        if !entry.holds_instance(instance_id) {
            return;
        }
        if !entry.state.can_transition_to(next) {
            warn!(
                path = %link,
                from = ?entry.state,
                to = ?next,
                "illegal lifecycle transition ignored"
            );
            return;
        }
        entry.state = next;
        if matches!(next, LifecycleState::Stopped | LifecycleState::Deleted) {
            entry.slot = None;
        }
        if version.is_some() {
            entry.last_version = version;
        }
    }

    /// Undoes a failed create or restore, putting back what the path held before.
    pub(crate) fn abandon(&self, link: &str, instance_id: u64, prior: Option<PriorVersion>) {
        match self.entries.entry(link.to_string()) {
            Entry::Occupied(entry) if !entry.get().holds_instance(instance_id) => {}
            Entry::Occupied(mut entry) => match prior {
                None => {
                    entry.remove();
                }
                Some(prior) => {
                    let entry = entry.get_mut();
                    entry.slot = None;
                    entry.last_version = Some(prior.version);
                    entry.state = if prior.deleted {
                        LifecycleState::Deleted
                    } else {
                        LifecycleState::Stopped
                    };
                }
            },
            Entry::Vacant(_) => {}
        }
    }

    /// Removes a stateless service; instances are left alone.
    pub(crate) fn remove_stateless(&self, link: &str) -> bool {
        self.entries
            .remove_if(link, |_, entry| {
                matches!(entry.slot, Some(ServiceSlot::Stateless(_)))
            })
            .is_some()
    }

    /// Current documents of the available instances directly under `prefix`.
    pub(crate) fn running_children(&self, prefix: &str) -> Vec<(String, Arc<Document>)> {
        self.entries
            .iter()
            .filter(|entry| is_direct_child(entry.key(), prefix))
            .filter(|entry| entry.state == LifecycleState::Available)
            .filter_map(|entry| match &entry.slot {
                Some(ServiceSlot::Stateful(handle)) => {
                    handle.current().map(|doc| (entry.key().clone(), doc))
                }
                _ => None,
            })
            .collect()
    }

    /// Forgets every service. Dropping the handles ends the instance tasks
    /// once their queues drain.
    pub(crate) fn clear(&self) -> usize {
        let count = self.running_count();
        self.entries.clear();
        count
    }
}

pub(crate) fn is_direct_child(link: &str, prefix: &str) -> bool {
    link.strip_prefix(prefix)
        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
}

fn already_started(link: &str) -> OperationError {
    OperationError::conflict(format!("service already started: {link}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
