//! Load sinks for staged artifacts.
//!
//! A sink appends the records of one artifact to the raw layer. Loads are
//! idempotent: each record is keyed by (source, entity, ingested_at,
//! line number) and duplicates are ignored, so a retried load inserts
//! nothing twice. Lines that fail to parse are counted and skipped.
//!
//! Available backends:
//! - `MemorySink` - In-memory (always available)
//! - `SqliteSink` - SQLite (requires `sqlite` feature)
//! - `PostgresSink` - PostgreSQL (requires `postgres` feature)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemorySink;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSink;

#[cfg(feature = "postgres")]
pub use postgres::PostgresSink;

use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::error::{SinkError, SinkResult};
use crate::pipeline::stage::{StagedArtifact, StagedRecord};

/// One artifact to load.
#[derive(Debug, Clone, Copy)]
pub struct LoadRequest<'a> {
    pub artifact: &'a StagedArtifact,
    pub source_system: &'a str,
    /// Delete the entity's existing raw rows in the same transaction.
    pub replace: bool,
}

/// Outcome of loading one artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Records written (or already present from an earlier attempt).
    pub loaded: usize,
    /// Lines that could not be parsed or belong to another entity.
    pub rejected: usize,
}

#[async_trait]
pub trait LoadSink: Send + Sync {
    async fn load(&self, request: LoadRequest<'_>) -> SinkResult<LoadReport>;
}

#[async_trait]
impl<T: LoadSink + ?Sized> LoadSink for Arc<T> {
    async fn load(&self, request: LoadRequest<'_>) -> SinkResult<LoadReport> {
        (**self).load(request).await
    }
}

/// A staged record with its 1-based line number.
#[derive(Debug, Clone)]
pub struct SequencedRecord {
    pub seq: i64,
    pub record: StagedRecord,
}

#[derive(Debug, Default)]
pub struct ParsedArtifact {
    pub records: Vec<SequencedRecord>,
    pub rejected: usize,
}

/// Read and parse an artifact, isolating bad lines.
pub async fn read_artifact(artifact: &StagedArtifact) -> SinkResult<ParsedArtifact> {
    let text = read_text(artifact.path()).await?;
    let mut parsed = ParsedArtifact::default();

    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StagedRecord>(line) {
            Ok(record) if record.entity == artifact.entity() => {
                parsed.records.push(SequencedRecord {
                    seq: index as i64 + 1,
                    record,
                });
            }
            Ok(record) => {
                tracing::warn!(
                    entity = artifact.entity(),
                    line = index + 1,
                    found = %record.entity,
                    "Rejecting record for another entity"
                );
                parsed.rejected += 1;
            }
            Err(e) => {
                tracing::warn!(
                    entity = artifact.entity(),
                    line = index + 1,
                    error = %e,
                    "Rejecting unparseable record"
                );
                parsed.rejected += 1;
            }
        }
    }

    Ok(parsed)
}

async fn read_text(path: &Path) -> SinkResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SinkError::Artifact {
            path: path.to_path_buf(),
            source,
        })
}
