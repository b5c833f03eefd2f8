//! Construction of the configured [`DocumentStore`] backend.

use std::path::PathBuf;
use std::sync::Arc;

use crate::storage::datastores::MemoryDocumentStore;
use crate::storage::document_store::DocumentStore;

/// Which backend a host persists documents to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// Process-local; history is lost when the process exits.
    #[default]
    Memory,
    /// Embedded redb file at the given path.
    Redb { path: PathBuf },
}

/// Opens and initializes the store for `backend`.
///
/// # Errors
///
/// Returns an error if the backend cannot be opened or initialized, or if
/// `Redb` is requested without the `redb` feature.
pub async fn open_store(backend: &StoreBackend) -> anyhow::Result<Arc<dyn DocumentStore>> {
    let store: Arc<dyn DocumentStore> = match backend {
        StoreBackend::Memory => Arc::new(MemoryDocumentStore::new()),
        #[cfg(feature = "redb")]
        StoreBackend::Redb { path } => {
            Arc::new(crate::storage::datastores::RedbDocumentStore::open(path)?)
        }
        #[cfg(not(feature = "redb"))]
        StoreBackend::Redb { path } => {
            anyhow::bail!("redb support not compiled in, cannot open {}", path.display())
        }
    };
    store.initialize().await?;
    tracing::info!(backend = ?backend, "document store opened");
    Ok(store)
}
