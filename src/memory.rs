use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::StoreError;
use crate::store::{
    DocumentStore, Durability, IndexDefinition, QueryResult, Staleness, ViewQuery, ViewRow,
};

/// Serialized body size over which the indexer skips a document.
pub const DEFAULT_INDEXED_BODY_LIMIT: usize = 1 << 20;

/// Durability budget reported when a write cannot meet its target.
pub const DEFAULT_DURABILITY_BUDGET: Duration = Duration::from_secs(55);

/// An in-process document store with couch-like view indexing.
///
/// Views are materialized lazily: a fresh write stays invisible to stale
/// queries until a non-stale query forces indexing. Map functions are not
/// executed; every view behaves like the canonical probe view and emits
/// `(doc.id, null)` per document. Documents whose serialized body exceeds
/// the indexed body limit are skipped by the indexer but stay readable by
/// id, which reproduces the visibility gap this crate exists to detect.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    indexed_body_limit: usize,
    durability_ceiling: Durability,
    durability_budget: Duration,
}

#[derive(Default)]
struct Inner {
    documents: HashMap<String, Value>,
    indexes: HashMap<String, IndexDefinition>,
    /// Materialized rows per index and view: storage id to emitted key.
    views: HashMap<String, HashMap<String, BTreeMap<String, Value>>>,
    /// Writes the indexer has not picked up yet.
    pending: HashSet<String>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            inner: Mutex::new(Inner::default()),
            indexed_body_limit: DEFAULT_INDEXED_BODY_LIMIT,
            durability_ceiling: Durability::All,
            durability_budget: DEFAULT_DURABILITY_BUDGET,
        }
    }

    /// Skip documents larger than `limit` bytes when indexing.
    pub fn with_indexed_body_limit(mut self, limit: usize) -> MemoryStore {
        self.indexed_body_limit = limit;
        self
    }

    /// Fail writes that ask for more durability than `ceiling`.
    pub fn with_durability_ceiling(mut self, ceiling: Durability) -> MemoryStore {
        self.durability_ceiling = ceiling;
        self
    }

    /// Report this budget as the elapsed time on failed durability waits.
    pub fn with_durability_budget(mut self, budget: Duration) -> MemoryStore {
        self.durability_budget = budget;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("poisoned MemoryStore mutex")
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

/// Run the indexer over every pending write.
fn refresh(inner: &mut Inner, indexed_body_limit: usize) {
    let pending: Vec<String> = inner.pending.drain().collect();
    if pending.is_empty() {
        return;
    }

    let targets: Vec<(String, String)> = inner
        .indexes
        .iter()
        .flat_map(|(index, definition)| {
            definition
                .views
                .keys()
                .map(|view| (index.clone(), view.clone()))
        })
        .collect();

    for id in pending {
        let document = match inner.documents.get(&id) {
            Some(document) => document.clone(),
            None => continue,
        };

        let size = document.to_string().len();
        if size > indexed_body_limit {
            warn!("skipping document {}: body too large ({} bytes)", id, size);
            continue;
        }

        let key = document.get("id").cloned().unwrap_or(Value::Null);
        for (index, view) in &targets {
            inner
                .views
                .entry(index.clone())
                .or_default()
                .entry(view.clone())
                .or_default()
                .insert(id.clone(), key.clone());
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Value, StoreError> {
        self.lock()
            .documents
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_owned() })
    }

    async fn add(&self, id: &str, body: &Value, durability: Durability) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.documents.contains_key(id) {
            return Err(StoreError::AlreadyExists { id: id.to_owned() });
        }

        inner.documents.insert(id.to_owned(), body.clone());
        inner.pending.insert(id.to_owned());

        // The write lands on the primary either way; when the requested
        // durability exceeds what the store can provide, only the
        // acknowledgment wait fails.
        if durability > self.durability_ceiling {
            return Err(StoreError::Timeout {
                operation: "durable write",
                elapsed: self.durability_budget,
            });
        }

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.documents.remove(id).is_none() {
            return Err(StoreError::NotFound { id: id.to_owned() });
        }

        inner.pending.remove(id);
        for views in inner.views.values_mut() {
            for rows in views.values_mut() {
                rows.remove(id);
            }
        }

        Ok(())
    }

    async fn index_definition(&self, name: &str) -> Result<Option<IndexDefinition>, StoreError> {
        Ok(self.lock().indexes.get(name).cloned())
    }

    async fn create_index(&self, definition: &IndexDefinition) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.indexes.contains_key(&definition.name) {
            return Err(StoreError::AlreadyExists {
                id: definition.name.clone(),
            });
        }

        inner
            .indexes
            .insert(definition.name.clone(), definition.clone());

        // Documents written before the index existed are picked up the next
        // time a query forces indexing.
        let ids: Vec<String> = inner.documents.keys().cloned().collect();
        inner.pending.extend(ids);

        Ok(())
    }

    async fn delete_index(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.indexes.remove(name).is_none() {
            return Err(StoreError::NotFound {
                id: name.to_owned(),
            });
        }

        inner.views.remove(name);
        Ok(())
    }

    async fn query(
        &self,
        index: &str,
        view: &str,
        query: &ViewQuery,
    ) -> Result<QueryResult, StoreError> {
        let mut inner = self.lock();

        let definition =
            inner
                .indexes
                .get(index)
                .cloned()
                .ok_or_else(|| StoreError::NotFound {
                    id: index.to_owned(),
                })?;
        if !definition.views.contains_key(view) {
            return Err(StoreError::NotFound {
                id: format!("{index}/{view}"),
            });
        }

        if query.staleness == Staleness::None {
            refresh(&mut inner, self.indexed_body_limit);
        }

        let (total_rows, mut rows) = {
            let materialized = inner.views.get(index).and_then(|views| views.get(view));
            let total_rows = materialized.map_or(0, |rows| rows.len() as u64);
            let rows: Vec<ViewRow> = materialized
                .map(|rows| {
                    rows.iter()
                        .map(|(id, key)| ViewRow {
                            id: id.clone(),
                            key: key.clone(),
                            value: Value::Null,
                            doc: query
                                .include_docs
                                .then(|| inner.documents.get(id).cloned())
                                .flatten(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            (total_rows, rows)
        };

        if let Some(limit) = query.limit {
            rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }

        if query.staleness == Staleness::UpdateAfter {
            refresh(&mut inner, self.indexed_body_limit);
        }

        Ok(QueryResult { total_rows, rows })
    }

    async fn close(self) -> Result<(), StoreError> {
        Ok(())
    }
}
