//! Navusoft external query API client.
//!
//! A small client for the two endpoints the ingest pipeline needs: the
//! entity metadata catalog and `runquery`. Queries use a short connect
//! timeout and a long read timeout; read timeouts are retried with linear
//! backoff, every other failure is returned immediately.
//!
//! # Example
//!
//! ```rust,ignore
//! use navu_client::{ClientConfig, Filter, NavuClient};
//!
//! let client = NavuClient::new(ClientConfig::new(
//!     "https://tenant.navusoft.net",
//!     "/rest/external/navu/runquery",
//!     session_id,
//! ))?;
//!
//! let columns = client.resolve_columns("v_query_workorder").await?;
//! let filter = Filter::at_least("updated_at", "2024-01-08T00:00:00Z")?;
//! let rows = client.fetch("v_query_workorder", &columns, Some(&filter)).await?;
//! ```

pub mod error;
pub mod retry;
pub mod session;
pub mod types;

pub use error::{NavuError, Result};
pub use retry::{retry_on_timeout, RetryPolicy};
pub use session::SessionToken;
pub use types::{Comparison, EntityInfo, Filter, QueryRequest, QueryResponse, Row};

use serde::de::DeserializeOwned;
use std::time::Duration;

pub const DEFAULT_ENTITIES_ENDPOINT: &str = "/rest/external/navu/entities/";

/// Connection settings for [`NavuClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub runquery_endpoint: String,
    pub entities_endpoint: String,
    pub session: SessionToken,
    pub connect_timeout: Duration,
    /// Read timeout for `runquery`. Large queries can take minutes.
    pub read_timeout: Duration,
    /// Read timeout for the metadata catalog.
    pub metadata_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    pub fn new(
        base_url: impl Into<String>,
        runquery_endpoint: impl Into<String>,
        session: impl Into<SessionToken>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            runquery_endpoint: runquery_endpoint.into(),
            entities_endpoint: DEFAULT_ENTITIES_ENDPOINT.to_string(),
            session: session.into(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(300),
            metadata_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_entities_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.entities_endpoint = endpoint.into();
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

pub struct NavuClient {
    client: reqwest::Client,
    base_url: String,
    config: ClientConfig,
}

impl NavuClient {
    /// Build a client. Fails with [`NavuError::MissingSession`] when the
    /// session token is blank.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.session.is_blank() {
            return Err(NavuError::MissingSession);
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    /// Fetch the full metadata catalog.
    pub async fn entities(&self) -> Result<Vec<EntityInfo>> {
        let url = self.url(&self.config.entities_endpoint);
        tracing::debug!(url = %url, "Fetching entity catalog");

        let resp = self
            .client
            .get(&url)
            .header("sessionId", self.config.session.expose())
            .header("Accept", "application/json")
            .timeout(self.config.metadata_timeout)
            .send()
            .await?;

        read_json(resp).await
    }

    /// Ids of every entity in the catalog.
    pub async fn entity_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .entities()
            .await?
            .into_iter()
            .filter_map(|e| e.id)
            .collect())
    }

    /// Column names declared for `entity`, in catalog order.
    ///
    /// Not cached: every call re-reads the catalog.
    pub async fn resolve_columns(&self, entity: &str) -> Result<Vec<String>> {
        let catalog = self.entities().await?;
        columns_from_catalog(&catalog, entity)
    }

    /// Run a query using the client's retry policy.
    pub async fn fetch(
        &self,
        entity: &str,
        columns: &[String],
        filter: Option<&Filter>,
    ) -> Result<Vec<Row>> {
        self.fetch_with_retries(entity, columns, filter, self.config.retry.attempts)
            .await
    }

    /// Run a query, retrying read timeouts up to `retries` attempts.
    ///
    /// The whole response is returned; there is no row cap.
    pub async fn fetch_with_retries(
        &self,
        entity: &str,
        columns: &[String],
        filter: Option<&Filter>,
        retries: u32,
    ) -> Result<Vec<Row>> {
        let request = QueryRequest::new(entity, columns).with_filter(filter);
        let policy = self.config.retry.with_attempts(retries);

        tracing::debug!(
            entity,
            columns = columns.len(),
            filter = ?filter.map(ToString::to_string),
            "Running query"
        );

        retry_on_timeout(&policy, entity, |_| self.run_query(entity, &request)).await
    }

    /// Single-row probe used to check connectivity and credentials.
    pub async fn probe(&self, entity: &str, columns: &[String]) -> Result<Vec<Row>> {
        let request = QueryRequest::new(entity, columns).with_top_count(1);
        self.run_query(entity, &request).await
    }

    async fn run_query(&self, entity: &str, request: &QueryRequest) -> Result<Vec<Row>> {
        let url = self.url(&self.config.runquery_endpoint);
        let resp = self
            .client
            .post(&url)
            .header("sessionId", self.config.session.expose())
            .header("Accept", "application/json")
            .json(request)
            .timeout(self.config.read_timeout)
            .send()
            .await
            .map_err(|e| NavuError::from_transport(entity, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NavuError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let body: QueryResponse = resp
            .json()
            .await
            .map_err(|e| NavuError::from_transport(entity, e))?;

        tracing::debug!(entity, rows = body.result_data.len(), "Query returned");
        Ok(body.result_data)
    }
}

fn columns_from_catalog(catalog: &[EntityInfo], entity: &str) -> Result<Vec<String>> {
    let info = catalog
        .iter()
        .find(|e| e.matches(entity))
        .ok_or_else(|| NavuError::EntityNotFound {
            entity: entity.to_string(),
        })?;

    let columns = info.column_names();
    if columns.is_empty() {
        return Err(NavuError::NoColumnsDefined {
            entity: entity.to_string(),
        });
    }
    Ok(columns)
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(NavuError::Api {
            status: status.as_u16(),
            message: body,
        });
    }
    Ok(resp.json().await?)
}
