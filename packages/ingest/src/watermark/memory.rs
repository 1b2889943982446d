//! In-memory watermark store for testing and development.

use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{Advance, Watermark, WatermarkStore, WatermarkValue};
use crate::error::StoreResult;

/// Watermarks held in a map. Lost on restart.
#[derive(Default)]
pub struct MemoryWatermarks {
    records: Mutex<HashMap<(String, String), Watermark>>,
}

impl MemoryWatermarks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a watermark directly, bypassing the monotonic check.
    pub fn with_watermark(self, watermark: Watermark) -> Self {
        self.records.lock().unwrap().insert(
            (watermark.source_system.clone(), watermark.entity_name.clone()),
            watermark,
        );
        self
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarks {
    async fn get(&self, source_system: &str, entity: &str) -> StoreResult<Option<Watermark>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&(source_system.to_string(), entity.to_string()))
            .cloned())
    }

    async fn record_observed_max(
        &self,
        source_system: &str,
        entity: &str,
        incremental_field: &str,
        observed_max: &WatermarkValue,
    ) -> StoreResult<Advance> {
        // The lock is held across compare and write.
        let mut records = self.records.lock().unwrap();
        let key = (source_system.to_string(), entity.to_string());

        match records.get_mut(&key) {
            Some(existing) => {
                if observed_max.partial_cmp(&existing.last_value) != Some(Ordering::Greater) {
                    return Ok(Advance::Unchanged);
                }
                existing.last_value = observed_max.clone();
                existing.incremental_field = incremental_field.to_string();
                existing.updated_at = Utc::now();
            }
            None => {
                records.insert(
                    key,
                    Watermark {
                        source_system: source_system.to_string(),
                        entity_name: entity.to_string(),
                        incremental_field: incremental_field.to_string(),
                        last_value: observed_max.clone(),
                        updated_at: Utc::now(),
                    },
                );
            }
        }

        Ok(Advance::Recorded)
    }
}
