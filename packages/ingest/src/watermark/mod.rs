//! Soft watermarks.
//!
//! A watermark records the largest incremental value observed for a
//! (source system, entity) pair. It is only ever used as a query hint: reads
//! subtract an overlap window from time-typed values, and writes only move
//! the value forward.
//!
//! Available backends:
//! - `MemoryWatermarks` - In-memory (always available)
//! - `SqliteWatermarks` - SQLite (requires `sqlite` feature)
//! - `PostgresWatermarks` - PostgreSQL (requires `postgres` feature)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryWatermarks;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteWatermarks;

#[cfg(feature = "postgres")]
pub use postgres::PostgresWatermarks;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use navu_client::Row;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};

/// An ordered incremental value.
///
/// Values of different kinds are not comparable with each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WatermarkValue {
    Timestamp(DateTime<Utc>),
    Integer(i64),
    Text(String),
}

impl WatermarkValue {
    /// Tie-break order when a batch mixes kinds: timestamps first.
    fn kind_rank(&self) -> usize {
        match self {
            WatermarkValue::Timestamp(_) => 0,
            WatermarkValue::Integer(_) => 1,
            WatermarkValue::Text(_) => 2,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WatermarkValue::Timestamp(_) => "timestamp",
            WatermarkValue::Integer(_) => "integer",
            WatermarkValue::Text(_) => "text",
        }
    }

    /// Interpret a fetched JSON value.
    ///
    /// Strings that look like timestamps become `Timestamp` (naive values are
    /// taken as UTC), integral numbers become `Integer`, other strings are
    /// `Text`. Nulls, floats, booleans and containers have no ordering here,
    /// and neither does text a query filter cannot carry (line breaks, NUL).
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => match parse_timestamp(s) {
                Some(ts) => Some(WatermarkValue::Timestamp(ts)),
                None if s.contains(['\n', '\r', '\0']) => None,
                None => Some(WatermarkValue::Text(s.clone())),
            },
            serde_json::Value::Number(n) => n.as_i64().map(WatermarkValue::Integer),
            _ => None,
        }
    }

    /// Rebuild a value from its persisted `(value_kind, last_value)` columns.
    pub fn from_stored(kind: &str, value: &str) -> StoreResult<Self> {
        match kind {
            "timestamp" => DateTime::parse_from_rfc3339(value)
                .map(|dt| WatermarkValue::Timestamp(dt.with_timezone(&Utc)))
                .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", value, e))),
            "integer" => value
                .parse()
                .map(WatermarkValue::Integer)
                .map_err(|e| StoreError::Corrupt(format!("bad integer '{}': {}", value, e))),
            "text" => Ok(WatermarkValue::Text(value.to_string())),
            other => Err(StoreError::Corrupt(format!("unknown value kind '{}'", other))),
        }
    }

    /// Persisted / filter representation.
    pub fn to_literal(&self) -> String {
        match self {
            WatermarkValue::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            WatermarkValue::Integer(i) => i.to_string(),
            WatermarkValue::Text(s) => s.clone(),
        }
    }

    /// Key whose byte order matches the natural order within one kind.
    ///
    /// Timestamps use fixed-width nanosecond RFC 3339; integers are shifted
    /// into the unsigned range and zero-padded.
    pub fn sort_key(&self) -> String {
        match self {
            WatermarkValue::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Nanos, true),
            WatermarkValue::Integer(i) => format!("{:020}", (*i as u64) ^ (1u64 << 63)),
            WatermarkValue::Text(s) => s.clone(),
        }
    }

    /// Apply the overlap window. Only time-typed values move.
    pub fn soften(self, overlap: Option<Duration>) -> Self {
        match (self, overlap) {
            (WatermarkValue::Timestamp(ts), Some(overlap)) => {
                WatermarkValue::Timestamp(ts.checked_sub_signed(overlap).unwrap_or(ts))
            }
            (value, _) => value,
        }
    }
}

impl PartialOrd for WatermarkValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (WatermarkValue::Timestamp(a), WatermarkValue::Timestamp(b)) => a.partial_cmp(b),
            (WatermarkValue::Integer(a), WatermarkValue::Integer(b)) => a.partial_cmp(b),
            (WatermarkValue::Text(a), WatermarkValue::Text(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl fmt::Display for WatermarkValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_literal())
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// A persisted watermark.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Watermark {
    pub source_system: String,
    pub entity_name: String,
    pub incremental_field: String,
    pub last_value: WatermarkValue,
    pub updated_at: DateTime<Utc>,
}

/// Result of a monotonic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// A new record was inserted or the stored value moved forward.
    Recorded,
    /// The stored value was equal, greater, or of a different kind.
    Unchanged,
}

/// Persistent (source, entity) → last observed value mapping.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Read the stored watermark, if any.
    async fn get(&self, source_system: &str, entity: &str) -> StoreResult<Option<Watermark>>;

    /// Read the watermark reduced by `overlap`.
    ///
    /// Absent stays absent: callers must treat `None` as "do a full load".
    async fn get_soft(
        &self,
        source_system: &str,
        entity: &str,
        overlap: Option<Duration>,
    ) -> StoreResult<Option<WatermarkValue>> {
        Ok(self
            .get(source_system, entity)
            .await?
            .map(|w| w.last_value.soften(overlap)))
    }

    /// Insert the watermark, or advance it if `observed_max` is strictly
    /// greater than the stored value. Must be one atomic conditional write.
    async fn record_observed_max(
        &self,
        source_system: &str,
        entity: &str,
        incremental_field: &str,
        observed_max: &WatermarkValue,
    ) -> StoreResult<Advance>;
}

#[async_trait]
impl<T: WatermarkStore + ?Sized> WatermarkStore for Arc<T> {
    async fn get(&self, source_system: &str, entity: &str) -> StoreResult<Option<Watermark>> {
        (**self).get(source_system, entity).await
    }

    async fn get_soft(
        &self,
        source_system: &str,
        entity: &str,
        overlap: Option<Duration>,
    ) -> StoreResult<Option<WatermarkValue>> {
        (**self).get_soft(source_system, entity, overlap).await
    }

    async fn record_observed_max(
        &self,
        source_system: &str,
        entity: &str,
        incremental_field: &str,
        observed_max: &WatermarkValue,
    ) -> StoreResult<Advance> {
        (**self)
            .record_observed_max(source_system, entity, incremental_field, observed_max)
            .await
    }
}

/// Maximum incremental value seen across a batch of rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservedMax {
    pub value: Option<WatermarkValue>,
    /// Rows with a usable non-null value of the chosen kind.
    pub counted: usize,
    /// Non-null values skipped because they had no ordering or were of a
    /// minority kind.
    pub ignored: usize,
}

/// Scan `rows` for the maximum non-null value of `field`.
///
/// When a batch mixes kinds, the kind most rows carry wins (ties go to
/// timestamps, then integers) and the rest are counted as ignored.
pub fn observed_max(rows: &[Row], field: &str) -> ObservedMax {
    let mut by_kind: [(Option<WatermarkValue>, usize); 3] = Default::default();
    let mut unusable = 0;

    for row in rows {
        let raw = match row.get(field) {
            None | Some(serde_json::Value::Null) => continue,
            Some(raw) => raw,
        };
        let Some(value) = WatermarkValue::from_json(raw) else {
            unusable += 1;
            continue;
        };

        let (max, count) = &mut by_kind[value.kind_rank()];
        *count += 1;
        if max.as_ref().map_or(true, |current| value > *current) {
            *max = Some(value);
        }
    }

    let usable: usize = by_kind.iter().map(|(_, count)| count).sum();
    let mut chosen: (Option<WatermarkValue>, usize) = (None, 0);
    for slot in by_kind {
        if slot.1 > chosen.1 {
            chosen = slot;
        }
    }

    ObservedMax {
        value: chosen.0,
        counted: chosen.1,
        ignored: unusable + usable - chosen.1,
    }
}
