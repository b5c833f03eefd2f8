//! In-memory [`DocumentStore`] backed by [`DashMap`].
//!
//! Each link owns a vector of its versions. Appends lock only the shard of
//! their own link, so different links never contend.

use async_trait::async_trait;
use dashmap::DashMap;
use docket_core::Document;

use crate::storage::document_store::{check_append, DocumentStore, StoreError, StoredDocument};

/// Version history per link, oldest first.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    entries: DashMap<String, Vec<StoredDocument>>,
}

impl MemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of links with at least one stored version.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get_latest(&self, link: &str) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self
            .entries
            .get(link)
            .and_then(|versions| versions.last().cloned()))
    }

    async fn get_version(
        &self,
        link: &str,
        version: u64,
    ) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self.entries.get(link).and_then(|versions| {
            versions
                .iter()
                .find(|entry| entry.version() == version)
                .cloned()
        }))
    }

    async fn append(&self, entry: StoredDocument) -> Result<(), StoreError> {
        let mut versions = self.entries.entry(entry.link().to_string()).or_default();
        check_append(
            entry.link(),
            versions.last().map(StoredDocument::version),
            entry.version(),
        )?;
        versions.push(entry);
        Ok(())
    }

    async fn query(&self, prefix: &str) -> Result<Vec<Document>, StoreError> {
        let mut documents: Vec<Document> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .filter_map(|entry| match entry.value().last() {
                Some(latest) if !latest.deleted => Some(latest.document.clone()),
                _ => None,
            })
            .collect();
        documents.sort_by(|a, b| a.self_link.cmp(&b.self_link));
        Ok(documents)
    }

    async fn history(&self, link: &str) -> Result<Vec<StoredDocument>, StoreError> {
        Ok(self
            .entries
            .get(link)
            .map(|versions| versions.clone())
            .unwrap_or_default())
    }
}
