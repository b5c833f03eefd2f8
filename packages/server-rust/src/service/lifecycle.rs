//! Lifecycle states of a stateful service instance.

use docket_core::Action;
use serde::{Deserialize, Serialize};

/// Lifecycle state stored next to each instance in the host registry.
///
/// ```text
/// Creating -> Available -> Stopped -> Available   (restore)
///                 |           |
///                 +-----------+--> Deleted -> Creating (recreate)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    /// Document not yet durable; only the create itself may run.
    Creating,
    Available,
    /// In-memory instance gone; a durable document may survive.
    Stopped,
    /// Tombstoned. History retained; reads resolve to NotFound.
    Deleted,
}

impl LifecycleState {
    /// Whether a client operation with `action` may be handled in this state.
    #[must_use]
    pub fn permits(self, action: Action) -> bool {
        match self {
            Self::Creating => action == Action::Create,
            Self::Available => true,
            Self::Stopped | Self::Deleted => false,
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Creating | Self::Stopped, Self::Available)
                | (Self::Available, Self::Stopped)
                | (Self::Available | Self::Stopped, Self::Deleted)
                | (Self::Stopped | Self::Deleted, Self::Creating)
        )
    }
}
