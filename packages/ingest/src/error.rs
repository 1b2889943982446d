//! Typed errors for the ingest pipeline.
//!
//! Entity-level failures (`Plan`, `Metadata`, `FetchFailed`, `Staging`) are caught by
//! the orchestrator and turned into per-entity outcomes. `Config`, `Output`
//! and `StoreError::WriteConflict` abort the run.

use navu_client::NavuError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The stored watermark cannot be rendered into a query filter.
    #[error("cannot plan '{entity}': {source}")]
    Plan {
        entity: String,
        #[source]
        source: NavuError,
    },

    /// Column auto-resolution failed (entity missing or has no fields).
    #[error("metadata error for '{entity}': {source}")]
    Metadata {
        entity: String,
        #[source]
        source: NavuError,
    },

    /// Non-retryable HTTP error, or read-timeout retries exhausted.
    #[error("fetch failed for '{entity}': {source}")]
    FetchFailed {
        entity: String,
        #[source]
        source: NavuError,
    },

    #[error("staging failed for '{entity}': {source}")]
    Staging {
        entity: String,
        #[source]
        source: std::io::Error,
    },

    /// The output directory or run manifest could not be written.
    #[error("output error at {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl IngestError {
    /// Errors that must stop the whole run rather than a single entity.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::Config(_)
                | IngestError::Output { .. }
                | IngestError::Store(StoreError::WriteConflict { .. })
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(any(feature = "sqlite", feature = "postgres"))]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The conditional upsert collided with a concurrent writer. The upsert
    /// is a single statement, so this indicates a store-layer bug.
    #[error("write conflict on watermark {source_system}/{entity}")]
    WriteConflict { source_system: String, entity: String },

    #[error("corrupt watermark row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to read staged artifact {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[cfg(any(feature = "sqlite", feature = "postgres"))]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("load rejected: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub type SinkResult<T> = std::result::Result<T, SinkError>;
