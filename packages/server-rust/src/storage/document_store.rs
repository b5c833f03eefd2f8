//! Durable, versioned document store contract.
//!
//! Defines [`DocumentStore`], the backing store shared across host restarts.
//! Every accepted mutation of a persistent service is one
//! [`append()`](DocumentStore::append); versions are never overwritten.

use async_trait::async_trait;
use docket_core::Document;
use serde::{Deserialize, Serialize};

/// One stored version of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub document: Document,
    /// Tombstone marker: the link was deleted at this version.
    pub deleted: bool,
}

impl StoredDocument {
    #[must_use]
    pub fn live(document: Document) -> Self {
        Self {
            document,
            deleted: false,
        }
    }

    #[must_use]
    pub fn tombstone(document: Document) -> Self {
        Self {
            document,
            deleted: true,
        }
    }

    #[must_use]
    pub fn link(&self) -> &str {
        &self.document.self_link
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.document.version
    }
}

/// Errors produced by a [`DocumentStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cannot append version {attempted} of {link}: latest stored version is {latest}")]
    VersionConflict {
        link: String,
        attempted: u64,
        latest: u64,
    },
    #[error("document encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Backend(#[from] anyhow::Error),
}

/// Enforces the append rule: the first version of a link is free, every
/// later one must be exactly `latest + 1`.
///
/// # Errors
///
/// Returns [`StoreError::VersionConflict`] for stale or gapped versions.
pub fn check_append(link: &str, latest: Option<u64>, attempted: u64) -> Result<(), StoreError> {
    match latest {
        Some(latest) if attempted != latest + 1 => Err(StoreError::VersionConflict {
            link: link.to_string(),
            attempted,
            latest,
        }),
        _ => Ok(()),
    }
}

/// Durable, per-link versioned document store.
///
/// Appends for one link are atomic per version; different links never
/// contend. Used as `Arc<dyn DocumentStore>`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Prepare the backend (create tables, open files).
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Latest stored version of `link`, tombstone included.
    async fn get_latest(&self, link: &str) -> Result<Option<StoredDocument>, StoreError>;

    /// A specific stored version of `link`.
    async fn get_version(
        &self,
        link: &str,
        version: u64,
    ) -> Result<Option<StoredDocument>, StoreError>;

    /// Append one version. Fails without side effects on version conflicts.
    async fn append(&self, entry: StoredDocument) -> Result<(), StoreError>;

    /// Latest non-deleted version of every link starting with `prefix`,
    /// ordered by link.
    async fn query(&self, prefix: &str) -> Result<Vec<Document>, StoreError>;

    /// Every stored version of `link`, oldest first.
    async fn history(&self, link: &str) -> Result<Vec<StoredDocument>, StoreError>;

    /// Flush and release the backend.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
