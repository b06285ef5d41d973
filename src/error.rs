use std::time::Duration;

use thiserror::Error;

use crate::verifier::VisibilityReport;

/// Enumeration of errors related to talking to a document store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} is not a valid durability level")]
    ParseDurabilityError(String),
    #[error("{0} is not a valid staleness setting")]
    ParseStalenessError(String),
    #[error("{0} is not a valid view mode")]
    ParseViewModeError(String),
    #[error("store endpoint is not usable: {0}")]
    InvalidEndpoint(String),
    #[error("failed to reach the store: {0}")]
    Connection(#[source] reqwest::Error),
    #[error("no such document or index: {id}")]
    NotFound { id: String },
    #[error("{id} already exists")]
    AlreadyExists { id: String },
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },
    #[error("store rejected the request: {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("failed to decode store response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Enumeration of errors related to running a verification sequence in the
/// ConsistencyVerifier.
#[derive(Error, Debug)]
pub enum VerifyError {
    /// A store operation outside the measured window failed.
    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),
    #[error("failed to create index {name}: {source}")]
    IndexCreation { name: String, source: StoreError },
    #[error("probe write {id} was not acknowledged: {source}")]
    Write { id: String, source: StoreError },
    #[error("index already held {observed} rows before the probe write (expected {expected})")]
    Precheck { expected: u64, observed: u64 },
    /// The outcome this harness exists to detect: the write was
    /// acknowledged but a non-stale query did not return it.
    #[error("saved but not indexed: {0}")]
    Violation(VisibilityReport),
}
