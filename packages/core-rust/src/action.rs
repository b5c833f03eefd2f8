//! The fixed verb surface of a document service.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the six verbs a service can be asked to perform.
///
/// The transport boundary maps these to HTTP methods:
/// `OPTIONS`, `GET`, `POST`, `PUT`, `PATCH`, `DELETE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Capability introspection.
    Discover,
    Read,
    Create,
    /// Full state replacement.
    Update,
    /// Partial update: non-null body fields overlay the current state.
    UpdateMerge,
    Delete,
}

impl Action {
    /// Every action, in declaration order.
    pub const ALL: [Action; 6] = [
        Action::Discover,
        Action::Read,
        Action::Create,
        Action::Update,
        Action::UpdateMerge,
        Action::Delete,
    ];

    /// Stable upper-case name, also used as the stat name prefix.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discover => "DISCOVER",
            Self::Read => "READ",
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::UpdateMerge => "UPDATE_MERGE",
            Self::Delete => "DELETE",
        }
    }

    /// HTTP method this action is carried by at the transport boundary.
    #[must_use]
    pub fn http_method(self) -> &'static str {
        match self {
            Self::Discover => "OPTIONS",
            Self::Read => "GET",
            Self::Create => "POST",
            Self::Update => "PUT",
            Self::UpdateMerge => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Maps an HTTP method name (case-insensitive) back to an action.
    #[must_use]
    pub fn from_http_method(method: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|action| action.http_method().eq_ignore_ascii_case(method))
    }

    /// Returns `true` for actions that may produce a new document version.
    #[must_use]
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Self::Create | Self::Update | Self::UpdateMerge | Self::Delete
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
