use std::fmt;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{StoreError, VerifyError};
use crate::store::{DocumentStore, Durability, IndexDefinition, Staleness, ViewQuery};

/// Map function for the probe view: emits each document's `id` field.
pub const DEFAULT_MAP_FUNCTION: &str = "function (doc) {\n    emit(doc.id, null);\n}\n";

/// Knobs for a verification run.
#[derive(Debug, Clone)]
pub struct VerifierOptions {
    /// Name of the index holding the probe view.
    pub index: String,
    /// Name of the view to query.
    pub view: String,
    /// Map function installed when the index has to be created.
    pub map_function: String,
    /// Ask the view to return documents inline with their rows.
    pub include_docs: bool,
    /// Cap on returned rows. Never affects the count oracle.
    pub row_limit: Option<u64>,
    /// Rows the view must report before the probe write.
    pub expected_before: u64,
    /// Rows the view must report after the probe write.
    pub expected_after: u64,
}

impl Default for VerifierOptions {
    fn default() -> Self {
        VerifierOptions {
            index: "probes".to_owned(),
            view: "by_id".to_owned(),
            map_function: DEFAULT_MAP_FUNCTION.to_owned(),
            include_docs: false,
            row_limit: None,
            expected_before: 0,
            expected_after: 1,
        }
    }
}

/// The outcome of one verification run.
#[derive(Debug, Clone)]
pub struct VisibilityReport {
    pub probe_id: String,
    /// Durability the probe write was acknowledged at.
    pub durability: Durability,
    /// Rows the view reported before the write.
    pub count_before: u64,
    /// Rows the view reported after the write.
    pub count_after: u64,
    /// Whether the probe could be read back by id after the write.
    pub document_readable: bool,
    /// Time from the probe write to the final count.
    pub elapsed: Duration,
}

impl fmt::Display for VisibilityReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "probe {} at durability {}: count {} -> {} (document readable: {}) in {:?}",
            self.probe_id,
            self.durability,
            self.count_before,
            self.count_after,
            self.document_readable,
            self.elapsed
        )
    }
}

/// Checks that durably acknowledged writes become visible to non-stale view
/// queries.
///
/// One verifier drives one store session. The full sequence lives in
/// [`verify_visibility`](ConsistencyVerifier::verify_visibility); the
/// individual steps are public so callers can compose their own runs.
pub struct ConsistencyVerifier<S> {
    store: S,
    options: VerifierOptions,
}

impl<S: DocumentStore> ConsistencyVerifier<S> {
    pub fn new(store: S, options: VerifierOptions) -> ConsistencyVerifier<S> {
        ConsistencyVerifier { store, options }
    }

    /// A verifier over the stock probe index and view.
    pub fn with_defaults(store: S) -> ConsistencyVerifier<S> {
        ConsistencyVerifier::new(store, VerifierOptions::default())
    }

    pub fn options(&self) -> &VerifierOptions {
        &self.options
    }

    /// The underlying store, for direct reads around a verification.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create the probe index unless it already exists. Returns whether this
    /// call created it.
    pub async fn ensure_index(&self) -> Result<bool, VerifyError> {
        if let Some(existing) = self.store.index_definition(&self.options.index).await? {
            if !existing.views.contains_key(&self.options.view) {
                warn!(
                    "index {} exists but has no view named {}",
                    self.options.index, self.options.view
                );
            }
            return Ok(false);
        }

        let definition = IndexDefinition::new(&self.options.index)
            .with_view(&self.options.view, &self.options.map_function);
        match self.store.create_index(&definition).await {
            Ok(()) => {
                info!(
                    "created index {} with view {}",
                    self.options.index, self.options.view
                );
                Ok(true)
            }
            // Someone else created it between our check and our write.
            Err(StoreError::AlreadyExists { .. }) => Ok(false),
            Err(source) => Err(VerifyError::IndexCreation {
                name: self.options.index.clone(),
                source,
            }),
        }
    }

    /// Delete any leftover probe under `id`. Returns whether a document was
    /// deleted. Failures are not fatal: a leftover that survives shows up in
    /// the precheck instead.
    pub async fn ensure_absent(&self, id: &str) -> bool {
        match self.store.delete(id).await {
            Ok(()) => {
                info!("deleted leftover probe {}", id);
                true
            }
            Err(StoreError::NotFound { .. }) => {
                info!("no leftover probe {} to delete", id);
                false
            }
            Err(error) => {
                warn!("failed to delete probe {}: {}", id, error);
                false
            }
        }
    }

    /// Insert the probe document, blocking until the store acknowledges the
    /// requested durability.
    pub async fn write_probe(
        &self,
        id: &str,
        content: &Value,
        durability: Durability,
    ) -> Result<(), VerifyError> {
        self.store
            .add(id, content, durability)
            .await
            .map_err(|source| VerifyError::Write {
                id: id.to_owned(),
                source,
            })
    }

    /// Count the rows the view reports once all pending writes are indexed.
    ///
    /// Always queries with `Staleness::None` and reads `total_rows`, so the
    /// answer is unaffected by any configured row limit.
    pub async fn count_visible(&self) -> Result<u64, VerifyError> {
        let query = ViewQuery {
            staleness: Staleness::None,
            include_docs: self.options.include_docs,
            limit: self.options.row_limit,
        };
        let result = self
            .store
            .query(&self.options.index, &self.options.view, &query)
            .await?;
        Ok(result.total_rows)
    }

    /// Run the full sequence: ensure the index, clear leftovers, write the
    /// probe, and check that a non-stale query sees it.
    ///
    /// Returns the report when the write became visible, and
    /// `VerifyError::Violation` carrying the same report when it did not.
    pub async fn verify_visibility(
        &self,
        id: &str,
        content: &Value,
        durability: Durability,
    ) -> Result<VisibilityReport, VerifyError> {
        self.ensure_index().await?;
        self.ensure_absent(id).await;

        let count_before = self.count_visible().await?;
        if count_before != self.options.expected_before {
            return Err(VerifyError::Precheck {
                expected: self.options.expected_before,
                observed: count_before,
            });
        }

        let started = Instant::now();
        self.write_probe(id, content, durability).await?;
        let document_readable = self.readback(id, content).await?;
        let count_after = self.count_visible().await?;
        let elapsed = started.elapsed();

        let report = VisibilityReport {
            probe_id: id.to_owned(),
            durability,
            count_before,
            count_after,
            document_readable,
            elapsed,
        };

        metrics::histogram!("viewprobe_visibility_lag_seconds").record(elapsed.as_secs_f64());
        if count_after == self.options.expected_after {
            metrics::counter!("viewprobe_runs_total", &[("outcome", "consistent")]).increment(1);
            info!("probe {} visible after {:?}", id, elapsed);
            Ok(report)
        } else {
            metrics::counter!("viewprobe_runs_total", &[("outcome", "violation")]).increment(1);
            error!("saved but not indexed: {}", report);
            Err(VerifyError::Violation(report))
        }
    }

    /// Release the underlying store session.
    pub async fn finish(self) -> Result<(), StoreError> {
        self.store.close().await
    }

    /// Read the probe back by id and compare it to what was written.
    async fn readback(&self, id: &str, content: &Value) -> Result<bool, VerifyError> {
        match self.store.get(id).await {
            Ok(stored) if stored == *content => Ok(true),
            Ok(_) => {
                warn!("probe {} read back with different content", id);
                Ok(false)
            }
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(error) => Err(VerifyError::Store(error)),
        }
    }
}

/// Build a probe document carrying `id` plus filler, so its serialized body
/// is at least `padding_bytes` long.
pub fn probe_document(id: &str, padding_bytes: usize) -> Value {
    json!({
        "id": id,
        "padding": "x".repeat(padding_bytes),
    })
}

/// A fresh probe id. Time-ordered so ids from repeated runs sort cleanly.
pub fn random_probe_id() -> String {
    format!("probe-{}", Uuid::now_v7())
}
