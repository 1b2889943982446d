//! In-memory raw layer for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Mutex;

use super::{read_artifact, LoadReport, LoadRequest, LoadSink};
use crate::error::{SinkError, SinkResult};
use crate::pipeline::plan::LoadMode;

/// A row of the raw layer.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub source_system: String,
    pub entity_name: String,
    pub load_mode: LoadMode,
    pub ingested_at: DateTime<Utc>,
    pub record_seq: i64,
    pub payload: serde_json::Value,
}

#[derive(Default)]
pub struct MemorySink {
    rows: Mutex<Vec<RawRow>>,
    failing: Mutex<HashSet<String>>,
    loads: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every load of `entity` fail.
    pub fn failing_for(self, entity: impl Into<String>) -> Self {
        self.failing.lock().unwrap().insert(entity.into());
        self
    }

    pub fn rows(&self) -> Vec<RawRow> {
        self.rows.lock().unwrap().clone()
    }

    pub fn rows_for(&self, entity: &str) -> Vec<RawRow> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.entity_name == entity)
            .cloned()
            .collect()
    }

    /// Entities in the order their loads were attempted.
    pub fn load_order(&self) -> Vec<String> {
        self.loads.lock().unwrap().clone()
    }
}

#[async_trait]
impl LoadSink for MemorySink {
    async fn load(&self, request: LoadRequest<'_>) -> SinkResult<LoadReport> {
        let entity = request.artifact.entity();
        self.loads.lock().unwrap().push(entity.to_string());

        if self.failing.lock().unwrap().contains(entity) {
            return Err(SinkError::Rejected(format!("load of '{}' refused", entity)));
        }

        let parsed = read_artifact(request.artifact).await?;

        let mut rows = self.rows.lock().unwrap();
        if request.replace {
            rows.retain(|r| !(r.source_system == request.source_system && r.entity_name == entity));
        }

        for seq in &parsed.records {
            let exists = rows.iter().any(|r| {
                r.source_system == request.source_system
                    && r.entity_name == entity
                    && r.ingested_at == seq.record.ingested_at
                    && r.record_seq == seq.seq
            });
            if !exists {
                rows.push(RawRow {
                    source_system: request.source_system.to_string(),
                    entity_name: entity.to_string(),
                    load_mode: seq.record.load_mode,
                    ingested_at: seq.record.ingested_at,
                    record_seq: seq.seq,
                    payload: seq.record.payload.clone(),
                });
            }
        }

        Ok(LoadReport {
            loaded: parsed.records.len(),
            rejected: parsed.rejected,
        })
    }
}
