//! [`DocumentStore`] backed by an embedded `redb` database file.
//!
//! One table keyed by `(link, version)` holds JSON-encoded
//! [`StoredDocument`]s. Each append is a single write transaction that reads
//! the link's latest version and inserts the next one, so it either commits
//! whole or not at all. `redb` calls are blocking and run on the blocking
//! pool.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use docket_core::Document;
use redb::{Database, ReadableTable, TableDefinition};

use crate::storage::document_store::{check_append, DocumentStore, StoreError, StoredDocument};

const DOCUMENTS: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("documents");

/// File-backed document store.
pub struct RedbDocumentStore {
    db: Arc<Database>,
}

impl RedbDocumentStore {
    /// Opens (or creates) the database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or is not a redb database.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = Database::create(path.as_ref())?;
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("store task failed: {e}")))?
    }
}

fn backend(err: impl Into<redb::Error>) -> StoreError {
    StoreError::Backend(anyhow::Error::new(err.into()))
}

fn decode(bytes: &[u8]) -> Result<StoredDocument, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn latest_in<T: ReadableTable<(&'static str, u64), &'static [u8]>>(
    table: &T,
    link: &str,
) -> Result<Option<StoredDocument>, StoreError> {
    let mut range = table.range((link, 0)..=(link, u64::MAX)).map_err(backend)?;
    match range.next_back() {
        Some(item) => {
            let (_, value) = item.map_err(backend)?;
            decode(value.value()).map(Some)
        }
        None => Ok(None),
    }
}

#[async_trait]
impl DocumentStore for RedbDocumentStore {
    async fn initialize(&self) -> anyhow::Result<()> {
        self.blocking(|db| {
            let txn = db.begin_write().map_err(backend)?;
            txn.open_table(DOCUMENTS).map_err(backend)?;
            txn.commit().map_err(backend)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn get_latest(&self, link: &str) -> Result<Option<StoredDocument>, StoreError> {
        let link = link.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(backend)?;
            let table = txn.open_table(DOCUMENTS).map_err(backend)?;
            latest_in(&table, &link)
        })
        .await
    }

    async fn get_version(
        &self,
        link: &str,
        version: u64,
    ) -> Result<Option<StoredDocument>, StoreError> {
        let link = link.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(backend)?;
            let table = txn.open_table(DOCUMENTS).map_err(backend)?;
            match table.get((link.as_str(), version)).map_err(backend)? {
                Some(value) => decode(value.value()).map(Some),
                None => Ok(None),
            }
        })
        .await
    }

    async fn append(&self, entry: StoredDocument) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&entry)?;
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(backend)?;
            {
                let mut table = txn.open_table(DOCUMENTS).map_err(backend)?;
                let latest = latest_in(&table, entry.link())?.map(|s| s.version());
                check_append(entry.link(), latest, entry.version())?;
                table
                    .insert((entry.link(), entry.version()), bytes.as_slice())
                    .map_err(backend)?;
            }
            txn.commit().map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn query(&self, prefix: &str) -> Result<Vec<Document>, StoreError> {
        let prefix = prefix.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(backend)?;
            let table = txn.open_table(DOCUMENTS).map_err(backend)?;
            let mut documents: Vec<Document> = Vec::new();
            let mut current: Option<StoredDocument> = None;
            for item in table.range((prefix.as_str(), 0)..).map_err(backend)? {
                let (key, value) = item.map_err(backend)?;
                let (link, _) = key.value();
                if !link.starts_with(prefix.as_str()) {
                    break;
                }
                let stored = decode(value.value())?;
                if let Some(previous) = current.take() {
                    if previous.link() != stored.link() && !previous.deleted {
                        documents.push(previous.document);
                    }
                }
                current = Some(stored);
            }
            if let Some(last) = current {
                if !last.deleted {
                    documents.push(last.document);
                }
            }
            Ok(documents)
        })
        .await
    }

    async fn history(&self, link: &str) -> Result<Vec<StoredDocument>, StoreError> {
        let link = link.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(backend)?;
            let table = txn.open_table(DOCUMENTS).map_err(backend)?;
            let mut versions = Vec::new();
            for item in table
                .range((link.as_str(), 0)..=(link.as_str(), u64::MAX))
                .map_err(backend)?
            {
                let (_, value) = item.map_err(backend)?;
                versions.push(decode(value.value())?);
            }
            Ok(versions)
        })
        .await
    }
}
