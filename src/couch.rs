use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::info;
use url::Url;

use crate::config::Config;
use crate::error::StoreError;
use crate::store::{DocumentStore, Durability, IndexDefinition, QueryResult, ViewQuery};

/// Whether view queries address production or development design documents.
///
/// Development design documents live under a `dev_` name prefix so they can
/// be edited without touching the production copy.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ViewMode {
    Production,
    Development,
}

impl ViewMode {
    /// The on-wire design document name for a logical index name.
    pub fn qualify(&self, name: &str) -> String {
        match self {
            ViewMode::Production => name.to_owned(),
            ViewMode::Development => format!("dev_{name}"),
        }
    }
}

/// Allow casting `ViewMode` from strings.
impl FromStr for ViewMode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "production" => Ok(ViewMode::Production),
            "development" => Ok(ViewMode::Development),
            invalid => Err(StoreError::ParseViewModeError(invalid.to_owned())),
        }
    }
}

/// A `DocumentStore` backed by a couch-dialect HTTP API.
///
/// Documents live under `/{bucket}/{id}`, indexes under
/// `/{bucket}/_design/{name}`, and views are queried through
/// `/{bucket}/_design/{name}/_view/{view}`.
pub struct CouchStore {
    /// The client used for HTTP requests.
    client: reqwest::Client,
    /// Root endpoint of the store, without the bucket.
    base: Url,
    bucket: String,
    view_mode: ViewMode,
    /// Username and password for HTTP basic auth, if the store wants any.
    credentials: Option<(String, Option<String>)>,
    /// Budget for plain document and index operations.
    op_timeout: Duration,
    /// Budget for writes that wait on persistence.
    durability_timeout: Duration,
    /// Budget for view queries, which may block on indexing.
    view_timeout: Duration,
}

impl CouchStore {
    /// Connect to the store described by `config`, probing the endpoint once
    /// so a dead store fails here instead of mid-verification.
    pub async fn connect(config: &Config) -> Result<CouchStore, StoreError> {
        if config.endpoint.cannot_be_a_base() {
            return Err(StoreError::InvalidEndpoint(config.endpoint.to_string()));
        }

        let client = reqwest::Client::builder()
            .user_agent("viewprobe")
            .connect_timeout(config.connect_timeout.0)
            .build()
            .map_err(StoreError::Connection)?;

        let store = CouchStore {
            client,
            base: config.endpoint.clone(),
            bucket: config.bucket.as_str().to_owned(),
            view_mode: config.view_mode,
            credentials: config.credentials(),
            op_timeout: config.op_timeout.0,
            durability_timeout: config.durability_timeout.0,
            view_timeout: config.view_timeout.0,
        };

        let started = Instant::now();
        let response = store
            .request(Method::GET, store.base.clone(), config.connect_timeout.0)
            .send()
            .await
            .map_err(|error| classify("connect", started, error))?;
        if !response.status().is_success() {
            return Err(read_rejection(response).await);
        }

        info!("connected to document store at {}", store.base);
        Ok(store)
    }

    fn request(&self, method: Method, url: Url, timeout: Duration) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method, url).timeout(timeout);
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, password.as_deref());
        }
        request
    }

    fn bucket_url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| StoreError::InvalidEndpoint(self.base.to_string()))?;
            path.pop_if_empty();
            path.push(&self.bucket);
            path.extend(segments);
        }
        Ok(url)
    }

    fn design_url(&self, name: &str) -> Result<Url, StoreError> {
        self.bucket_url(&["_design", &self.view_mode.qualify(name)])
    }
}

/// Sort a transport error into the timeout and connection buckets.
fn classify(operation: &'static str, started: Instant, error: reqwest::Error) -> StoreError {
    if error.is_timeout() {
        StoreError::Timeout {
            operation,
            elapsed: started.elapsed(),
        }
    } else {
        StoreError::Connection(error)
    }
}

/// Turn an unexpected HTTP response into a `Rejected` error carrying the body.
async fn read_rejection(response: reqwest::Response) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    StoreError::Rejected { status, body }
}

/// Read the response body as JSON.
async fn decode<T: DeserializeOwned>(
    operation: &'static str,
    started: Instant,
    response: reqwest::Response,
) -> Result<T, StoreError> {
    let body = response
        .text()
        .await
        .map_err(|error| classify(operation, started, error))?;
    Ok(serde_json::from_str(&body)?)
}

#[async_trait]
impl DocumentStore for CouchStore {
    async fn get(&self, id: &str) -> Result<Value, StoreError> {
        let url = self.bucket_url(&[id])?;
        let started = Instant::now();
        let response = self
            .request(Method::GET, url, self.op_timeout)
            .send()
            .await
            .map_err(|error| classify("document read", started, error))?;

        match response.status() {
            status if status.is_success() => decode("document read", started, response).await,
            StatusCode::NOT_FOUND => Err(StoreError::NotFound { id: id.to_owned() }),
            _ => Err(read_rejection(response).await),
        }
    }

    async fn add(&self, id: &str, body: &Value, durability: Durability) -> Result<(), StoreError> {
        let url = self.bucket_url(&[id])?;
        let started = Instant::now();
        let response = self
            .request(Method::PUT, url, self.durability_timeout)
            .query(&[("persist_to", durability.to_string())])
            .json(body)
            .send()
            .await
            .map_err(|error| classify("durable write", started, error))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(StoreError::AlreadyExists { id: id.to_owned() }),
            // The store accepted the write but could not confirm persistence
            // within its observe budget.
            StatusCode::SERVICE_UNAVAILABLE => Err(StoreError::Timeout {
                operation: "durable write",
                elapsed: started.elapsed(),
            }),
            _ => Err(read_rejection(response).await),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let url = self.bucket_url(&[id])?;
        let started = Instant::now();
        let response = self
            .request(Method::DELETE, url, self.op_timeout)
            .send()
            .await
            .map_err(|error| classify("document delete", started, error))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound { id: id.to_owned() }),
            _ => Err(read_rejection(response).await),
        }
    }

    async fn index_definition(&self, name: &str) -> Result<Option<IndexDefinition>, StoreError> {
        let url = self.design_url(name)?;
        let started = Instant::now();
        let response = self
            .request(Method::GET, url, self.op_timeout)
            .send()
            .await
            .map_err(|error| classify("index read", started, error))?;

        match response.status() {
            status if status.is_success() => {
                let mut definition: IndexDefinition =
                    decode("index read", started, response).await?;
                definition.name = name.to_owned();
                Ok(Some(definition))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(read_rejection(response).await),
        }
    }

    async fn create_index(&self, definition: &IndexDefinition) -> Result<(), StoreError> {
        let url = self.design_url(&definition.name)?;
        let started = Instant::now();
        let response = self
            .request(Method::PUT, url, self.op_timeout)
            .json(definition)
            .send()
            .await
            .map_err(|error| classify("index create", started, error))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(StoreError::AlreadyExists {
                id: definition.name.clone(),
            }),
            _ => Err(read_rejection(response).await),
        }
    }

    async fn delete_index(&self, name: &str) -> Result<(), StoreError> {
        let url = self.design_url(name)?;
        let started = Instant::now();
        let response = self
            .request(Method::DELETE, url, self.op_timeout)
            .send()
            .await
            .map_err(|error| classify("index delete", started, error))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound {
                id: name.to_owned(),
            }),
            _ => Err(read_rejection(response).await),
        }
    }

    async fn query(
        &self,
        index: &str,
        view: &str,
        query: &ViewQuery,
    ) -> Result<QueryResult, StoreError> {
        let url = self.bucket_url(&["_design", &self.view_mode.qualify(index), "_view", view])?;
        let mut request = self
            .request(Method::GET, url, self.view_timeout)
            .query(&[("stale", query.staleness.to_string())]);
        if query.include_docs {
            request = request.query(&[("include_docs", "true")]);
        }
        if let Some(limit) = query.limit {
            request = request.query(&[("limit", limit.to_string())]);
        }

        let started = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|error| classify("view query", started, error))?;

        match response.status() {
            status if status.is_success() => decode("view query", started, response).await,
            StatusCode::NOT_FOUND => Err(StoreError::NotFound {
                id: format!("{index}/{view}"),
            }),
            _ => Err(read_rejection(response).await),
        }
    }

    async fn close(self) -> Result<(), StoreError> {
        // reqwest pools connections per client; dropping the store is what
        // actually releases them.
        info!("disconnected from document store at {}", self.base);
        Ok(())
    }
}
