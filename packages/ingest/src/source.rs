//! The remote side of an extraction: column metadata and row queries.

use async_trait::async_trait;
use navu_client::{Filter, NavuClient, NavuError, Row};

/// Anything that can answer catalog lookups and filtered queries.
#[async_trait]
pub trait QuerySource: Send + Sync {
    /// Ordered column names declared for `entity`.
    async fn resolve_columns(&self, entity: &str) -> navu_client::Result<Vec<String>>;

    /// Run one query, retrying read timeouts up to `retries` attempts.
    async fn fetch(
        &self,
        entity: &str,
        columns: &[String],
        filter: Option<&Filter>,
        retries: u32,
    ) -> navu_client::Result<Vec<Row>>;
}

#[async_trait]
impl QuerySource for NavuClient {
    async fn resolve_columns(&self, entity: &str) -> navu_client::Result<Vec<String>> {
        NavuClient::resolve_columns(self, entity).await
    }

    async fn fetch(
        &self,
        entity: &str,
        columns: &[String],
        filter: Option<&Filter>,
        retries: u32,
    ) -> navu_client::Result<Vec<Row>> {
        self.fetch_with_retries(entity, columns, filter, retries).await
    }
}

/// Where an entity's column list comes from. Chosen once per entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSource {
    Explicit(Vec<String>),
    /// Look the columns up in the remote catalog.
    Remote,
}

impl ColumnSource {
    pub async fn resolve<Q: QuerySource + ?Sized>(
        &self,
        source: &Q,
        entity: &str,
    ) -> Result<Vec<String>, NavuError> {
        match self {
            ColumnSource::Explicit(columns) => Ok(columns.clone()),
            ColumnSource::Remote => {
                let columns = source.resolve_columns(entity).await?;
                tracing::debug!(entity, columns = columns.len(), "Resolved columns from catalog");
                Ok(columns)
            }
        }
    }
}
