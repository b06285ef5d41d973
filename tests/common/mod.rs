use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use once_cell::sync::Lazy;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use url::Url;

use viewprobe::config::{Config, EnvMsDuration, NonEmptyString};
use viewprobe::{
    Durability, DocumentStore, IndexDefinition, MemoryStore, Staleness, StoreError, ViewMode,
    ViewQuery,
};

pub const BUCKET: &str = "default";

static TRACING: Lazy<()> = Lazy::new(|| {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
});

pub fn setup_tracing() {
    Lazy::force(&TRACING);
}

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{prefix}_{suffix}")
}

/// A config pointing at `endpoint` with budgets short enough for tests.
pub fn test_config(endpoint: &Url) -> Config {
    Config {
        endpoint: endpoint.clone(),
        bucket: NonEmptyString(BUCKET.to_owned()),
        username: None,
        password: None,
        view_mode: ViewMode::Production,
        index_name: NonEmptyString("probes".to_owned()),
        view_name: NonEmptyString("by_id".to_owned()),
        include_docs: false,
        row_limit: None,
        connect_timeout: EnvMsDuration(Duration::from_secs(2)),
        op_timeout: EnvMsDuration(Duration::from_secs(5)),
        durability_timeout: EnvMsDuration(Duration::from_secs(5)),
        view_timeout: EnvMsDuration(Duration::from_secs(5)),
    }
}

/// A `MemoryStore` served over the couch dialect, for exercising
/// `CouchStore` against real HTTP.
pub struct FakeStoreHandle {
    pub endpoint: Url,
}

impl FakeStoreHandle {
    /// Serve `store` on a random local port.
    pub async fn spawn(store: MemoryStore) -> FakeStoreHandle {
        setup_tracing();

        let app = router(Arc::new(store));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind fake store listener");
        let addr = listener.local_addr().expect("listener has no local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake store failed");
        });

        FakeStoreHandle {
            endpoint: Url::parse(&format!("http://{addr}")).expect("bound addr is a valid url"),
        }
    }

    /// A config pointing at this fake.
    pub fn config(&self) -> Config {
        test_config(&self.endpoint)
    }
}

fn router(store: Arc<MemoryStore>) -> Router {
    Router::new()
        .route("/", get(server_info))
        .route(
            "/:bucket/:id",
            get(get_document).put(put_document).delete(delete_document),
        )
        .route(
            "/:bucket/_design/:index",
            get(get_index).put(put_index).delete(delete_index),
        )
        .route("/:bucket/_design/:index/_view/:view", get(query_view))
        .with_state(store)
}

/// Map store errors onto the status codes the couch dialect uses, the
/// mirror image of how `CouchStore` reads them back.
fn error_response(error: StoreError) -> Response {
    let status = match &error {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::AlreadyExists { .. } => StatusCode::CONFLICT,
        StoreError::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": error.to_string()}))).into_response()
}

fn unknown_bucket(bucket: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("no bucket named {bucket}")})),
    )
        .into_response()
}

async fn server_info() -> Response {
    Json(json!({"viewprobe": "fake store", "version": "0.1.0"})).into_response()
}

#[derive(Deserialize)]
struct WriteParams {
    persist_to: Option<String>,
}

async fn get_document(
    State(store): State<Arc<MemoryStore>>,
    Path((bucket, id)): Path<(String, String)>,
) -> Response {
    if bucket != BUCKET {
        return unknown_bucket(&bucket);
    }
    match store.get(&id).await {
        Ok(document) => Json(document).into_response(),
        Err(error) => error_response(error),
    }
}

async fn put_document(
    State(store): State<Arc<MemoryStore>>,
    Path((bucket, id)): Path<(String, String)>,
    Query(params): Query<WriteParams>,
    Json(body): Json<Value>,
) -> Response {
    if bucket != BUCKET {
        return unknown_bucket(&bucket);
    }
    let durability = match params.persist_to.as_deref().map(Durability::from_str) {
        Some(Ok(durability)) => durability,
        Some(Err(error)) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": error.to_string()})))
                .into_response()
        }
        None => Durability::None,
    };
    match store.add(&id, &body, durability).await {
        Ok(()) => (StatusCode::CREATED, Json(json!({"ok": true, "id": id}))).into_response(),
        Err(error) => error_response(error),
    }
}

async fn delete_document(
    State(store): State<Arc<MemoryStore>>,
    Path((bucket, id)): Path<(String, String)>,
) -> Response {
    if bucket != BUCKET {
        return unknown_bucket(&bucket);
    }
    match store.delete(&id).await {
        Ok(()) => Json(json!({"ok": true, "id": id})).into_response(),
        Err(error) => error_response(error),
    }
}

async fn get_index(
    State(store): State<Arc<MemoryStore>>,
    Path((bucket, index)): Path<(String, String)>,
) -> Response {
    if bucket != BUCKET {
        return unknown_bucket(&bucket);
    }
    match store.index_definition(&index).await {
        Ok(Some(definition)) => Json(definition).into_response(),
        Ok(None) => error_response(StoreError::NotFound { id: index }),
        Err(error) => error_response(error),
    }
}

async fn put_index(
    State(store): State<Arc<MemoryStore>>,
    Path((bucket, index)): Path<(String, String)>,
    Json(mut definition): Json<IndexDefinition>,
) -> Response {
    if bucket != BUCKET {
        return unknown_bucket(&bucket);
    }
    // The body never carries the name; the resource path does.
    definition.name = index;
    match store.create_index(&definition).await {
        Ok(()) => (
            StatusCode::CREATED,
            Json(json!({"ok": true, "id": definition.name})),
        )
            .into_response(),
        Err(error) => error_response(error),
    }
}

async fn delete_index(
    State(store): State<Arc<MemoryStore>>,
    Path((bucket, index)): Path<(String, String)>,
) -> Response {
    if bucket != BUCKET {
        return unknown_bucket(&bucket);
    }
    match store.delete_index(&index).await {
        Ok(()) => Json(json!({"ok": true, "id": index})).into_response(),
        Err(error) => error_response(error),
    }
}

#[derive(Deserialize)]
struct ViewParams {
    stale: Option<String>,
    include_docs: Option<bool>,
    limit: Option<u64>,
}

async fn query_view(
    State(store): State<Arc<MemoryStore>>,
    Path((bucket, index, view)): Path<(String, String, String)>,
    Query(params): Query<ViewParams>,
) -> Response {
    if bucket != BUCKET {
        return unknown_bucket(&bucket);
    }
    let staleness = match params.stale.as_deref().map(Staleness::from_str) {
        Some(Ok(staleness)) => staleness,
        Some(Err(error)) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": error.to_string()})))
                .into_response()
        }
        None => Staleness::UpdateAfter,
    };
    let query = ViewQuery {
        staleness,
        include_docs: params.include_docs.unwrap_or(false),
        limit: params.limit,
    };
    match store.query(&index, &view, &query).await {
        Ok(result) => Json(result).into_response(),
        Err(error) => error_response(error),
    }
}
