use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// How many copies of a write must be persisted to disk before the store
/// acknowledges it.
///
/// Variants are ordered from weakest to strongest, so requirements can be
/// compared: `Durability::One < Durability::Majority`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum Durability {
    /// Acknowledge as soon as the write is accepted in memory.
    None,
    /// Acknowledge once the active copy is on disk.
    One,
    /// Acknowledge once a majority of copies are on disk.
    Majority,
    /// Acknowledge once every copy is on disk.
    All,
}

/// Allow casting `Durability` from strings.
impl FromStr for Durability {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "none" => Ok(Durability::None),
            "one" => Ok(Durability::One),
            "majority" => Ok(Durability::Majority),
            "all" => Ok(Durability::All),
            invalid => Err(StoreError::ParseDurabilityError(invalid.to_owned())),
        }
    }
}

/// Implement `std::fmt::Display` to convert Durability to its wire form.
impl fmt::Display for Durability {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Durability::None => write!(f, "none"),
            Durability::One => write!(f, "one"),
            Durability::Majority => write!(f, "majority"),
            Durability::All => write!(f, "all"),
        }
    }
}

/// How much indexing a store must do before answering a view query.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Staleness {
    /// Index every pending write before answering. The answer reflects all
    /// writes acknowledged before the query was issued.
    None,
    /// Answer from the index as-is, then index pending writes.
    UpdateAfter,
    /// Answer from the index as-is.
    Allow,
}

/// Allow casting `Staleness` from its wire form (the `stale` query parameter).
impl FromStr for Staleness {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "false" => Ok(Staleness::None),
            "update_after" => Ok(Staleness::UpdateAfter),
            "ok" => Ok(Staleness::Allow),
            invalid => Err(StoreError::ParseStalenessError(invalid.to_owned())),
        }
    }
}

/// Implement `std::fmt::Display` to convert Staleness to its wire form.
impl fmt::Display for Staleness {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Staleness::None => write!(f, "false"),
            Staleness::UpdateAfter => write!(f, "update_after"),
            Staleness::Allow => write!(f, "ok"),
        }
    }
}

/// Parameters for a view query.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ViewQuery {
    pub staleness: Staleness,
    /// Return each matching document inline with its row.
    pub include_docs: bool,
    /// Cap the number of rows returned. Does not affect `total_rows`.
    pub limit: Option<u64>,
}

impl Default for ViewQuery {
    fn default() -> Self {
        ViewQuery {
            staleness: Staleness::None,
            include_docs: false,
            limit: None,
        }
    }
}

/// A single view within an index: the map function applied to every document.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub map: String,
}

/// A named index: a design document holding one or more views.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// The name is carried in the resource path, not the document body.
    #[serde(skip)]
    pub name: String,
    pub views: HashMap<String, ViewDefinition>,
}

impl IndexDefinition {
    /// Start an empty definition with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        IndexDefinition {
            name: name.into(),
            views: HashMap::new(),
        }
    }

    /// Add a view holding the given map function.
    pub fn with_view(mut self, view: impl Into<String>, map: impl Into<String>) -> Self {
        self.views
            .insert(view.into(), ViewDefinition { map: map.into() });
        self
    }
}

/// One row emitted by a view query.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ViewRow {
    /// Id of the document that emitted the row.
    pub id: String,
    pub key: Value,
    pub value: Value,
    /// The document itself, present when the query asked to include docs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

/// The answer to a view query.
///
/// `total_rows` counts every row in the view regardless of any `limit`
/// applied to `rows`, which makes it a reliable visibility oracle.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub total_rows: u64,
    pub rows: Vec<ViewRow>,
}

/// A document store that materializes secondary indexes over its documents.
///
/// Implemented by `CouchStore` for the real REST dialect and by
/// `MemoryStore` for an in-process simulator, so verification runs can be
/// exercised without a server.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document by id.
    async fn get(&self, id: &str) -> Result<Value, StoreError>;

    /// Insert a new document, returning once the requested durability is
    /// met. Insert-only: an existing document is never overwritten.
    async fn add(&self, id: &str, body: &Value, durability: Durability) -> Result<(), StoreError>;

    /// Remove a document by id.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Fetch an index definition, or `None` if no index has that name.
    async fn index_definition(&self, name: &str) -> Result<Option<IndexDefinition>, StoreError>;

    /// Create a new index. The name is taken from the definition.
    async fn create_index(&self, definition: &IndexDefinition) -> Result<(), StoreError>;

    /// Remove an index and everything it has materialized.
    async fn delete_index(&self, name: &str) -> Result<(), StoreError>;

    /// Run a query against one view of one index.
    async fn query(
        &self,
        index: &str,
        view: &str,
        query: &ViewQuery,
    ) -> Result<QueryResult, StoreError>;

    /// Release the session. Dropping a store disconnects too; `close` exists
    /// so callers can surface shutdown errors.
    async fn close(self) -> Result<(), StoreError>;
}
