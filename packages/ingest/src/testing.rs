//! Testing utilities.
//!
//! `MockQuerySource` answers catalog and query calls from scripted
//! responses, so the orchestrator can be exercised without a server.

use async_trait::async_trait;
use navu_client::{retry_on_timeout, Filter, NavuError, RetryPolicy, Row};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::source::QuerySource;

/// A scripted reply to one query attempt.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Rows(Vec<Row>),
    /// Non-success HTTP status.
    Status(u16),
    /// Read timeout on this attempt.
    Timeout,
}

/// Record of a call made to the mock source.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    ResolveColumns {
        entity: String,
    },
    Fetch {
        entity: String,
        columns: Vec<String>,
        filter: Option<String>,
        attempt: u32,
    },
}

#[derive(Default)]
pub struct MockQuerySource {
    /// Catalog columns by entity id.
    catalog: Arc<RwLock<HashMap<String, Vec<String>>>>,

    /// Replies per entity, consumed one per attempt. The last reply repeats.
    responses: Arc<RwLock<HashMap<String, VecDeque<MockResponse>>>>,

    calls: Arc<RwLock<Vec<MockCall>>>,
}

impl MockQuerySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an entity in the catalog.
    pub fn with_entity<I, S>(self, entity: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.catalog
            .write()
            .unwrap()
            .insert(entity.into(), columns.into_iter().map(Into::into).collect());
        self
    }

    /// Every query for `entity` returns `rows`.
    pub fn with_rows(self, entity: impl Into<String>, rows: Vec<Row>) -> Self {
        self.with_responses(entity, vec![MockResponse::Rows(rows)])
    }

    /// Every query for `entity` fails with `status`.
    pub fn with_status(self, entity: impl Into<String>, status: u16) -> Self {
        self.with_responses(entity, vec![MockResponse::Status(status)])
    }

    /// Replies for successive attempts on `entity`.
    pub fn with_responses(self, entity: impl Into<String>, responses: Vec<MockResponse>) -> Self {
        self.responses
            .write()
            .unwrap()
            .insert(entity.into(), responses.into());
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.read().unwrap().clone()
    }

    /// Filters sent for `entity`, one per attempt.
    pub fn filters_for(&self, entity: &str) -> Vec<Option<String>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Fetch {
                    entity: e, filter, ..
                } if e == entity => Some(filter),
                _ => None,
            })
            .collect()
    }

    pub fn fetch_attempts(&self, entity: &str) -> usize {
        self.filters_for(entity).len()
    }

    fn next_response(&self, entity: &str) -> MockResponse {
        let mut responses = self.responses.write().unwrap();
        match responses.get_mut(entity) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(MockResponse::Rows(vec![])),
            Some(queue) => queue.front().cloned().unwrap_or(MockResponse::Rows(vec![])),
            None => MockResponse::Rows(vec![]),
        }
    }

    fn attempt(
        &self,
        entity: &str,
        columns: &[String],
        filter: Option<&Filter>,
        attempt: u32,
    ) -> navu_client::Result<Vec<Row>> {
        self.calls.write().unwrap().push(MockCall::Fetch {
            entity: entity.to_string(),
            columns: columns.to_vec(),
            filter: filter.map(ToString::to_string),
            attempt,
        });

        match self.next_response(entity) {
            MockResponse::Rows(rows) => Ok(rows),
            MockResponse::Status(status) => Err(NavuError::Api {
                status,
                message: format!("mock status {}", status),
            }),
            MockResponse::Timeout => Err(NavuError::ReadTimeout {
                entity: entity.to_string(),
                attempts: 1,
            }),
        }
    }
}

#[async_trait]
impl QuerySource for MockQuerySource {
    async fn resolve_columns(&self, entity: &str) -> navu_client::Result<Vec<String>> {
        self.calls.write().unwrap().push(MockCall::ResolveColumns {
            entity: entity.to_string(),
        });

        let catalog = self.catalog.read().unwrap();
        let columns = catalog.get(entity).ok_or_else(|| NavuError::EntityNotFound {
            entity: entity.to_string(),
        })?;
        if columns.is_empty() {
            return Err(NavuError::NoColumnsDefined {
                entity: entity.to_string(),
            });
        }
        Ok(columns.clone())
    }

    async fn fetch(
        &self,
        entity: &str,
        columns: &[String],
        filter: Option<&Filter>,
        retries: u32,
    ) -> navu_client::Result<Vec<Row>> {
        let policy = RetryPolicy::new(retries, Duration::ZERO);
        retry_on_timeout(&policy, entity, |attempt| {
            let result = self.attempt(entity, columns, filter, attempt);
            async move { result }
        })
        .await
    }
}
