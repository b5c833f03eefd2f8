//! Document storage for the docket server.
//!
//! - [`DocumentStore`]: durable, versioned, append-only store contract
//! - [`datastores`]: memory and redb implementations
//! - [`expiry`]: lazy expiration checks
//! - [`factory`]: backend selection

pub mod datastores;
pub mod document_store;
pub mod expiry;
pub mod factory;

pub use document_store::*;
pub use expiry::{check_expiry, ExpiryReason};
pub use factory::{open_store, StoreBackend};
