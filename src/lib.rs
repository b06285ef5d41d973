//! Read-after-write visibility checks for view-indexed document stores.

pub mod config;
pub mod couch;
pub mod error;
pub mod memory;
pub mod store;
pub mod verifier;

// Re-export main modules for library users
pub use config::Config;
pub use couch::{CouchStore, ViewMode};
pub use error::{StoreError, VerifyError};
pub use memory::MemoryStore;
pub use store::{
    DocumentStore, Durability, IndexDefinition, QueryResult, Staleness, ViewDefinition, ViewQuery,
    ViewRow,
};
pub use verifier::{
    probe_document, random_probe_id, ConsistencyVerifier, VerifierOptions, VisibilityReport,
};
