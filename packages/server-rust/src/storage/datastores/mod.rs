//! `DocumentStore` implementations.
//!
//! Provides concrete backends for the [`DocumentStore`](super::DocumentStore)
//! trait: [`MemoryDocumentStore`] for tests and ephemeral hosts, and
//! `RedbDocumentStore` for durable single-file storage.

mod memory;
#[cfg(feature = "redb")]
mod redb_store;

pub use memory::MemoryDocumentStore;
#[cfg(feature = "redb")]
pub use redb_store::RedbDocumentStore;
