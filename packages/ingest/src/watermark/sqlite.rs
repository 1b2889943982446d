//! SQLite watermark store.
//!
//! Good for local runs and tests. The advance-only write is a single
//! `INSERT .. ON CONFLICT DO UPDATE .. WHERE` statement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::time::Duration;

use super::{Advance, Watermark, WatermarkStore, WatermarkValue};
use crate::error::{StoreError, StoreResult};

pub struct SqliteWatermarks {
    pool: SqlitePool,
}

impl SqliteWatermarks {
    /// Connect and create the watermark table if needed.
    ///
    /// # Example URLs
    /// - `sqlite::memory:` - In-memory database (ephemeral)
    /// - `sqlite://./warehouse.db?mode=rwc` - Create if not exists
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        let pool = sqlite_pool(database_url).await?;
        Self::from_pool(pool).await
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> StoreResult<Self> {
        Self::new("sqlite::memory:").await
    }

    pub async fn from_pool(pool: SqlitePool) -> StoreResult<Self> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ingest_watermarks (
                source_system TEXT NOT NULL,
                entity_name TEXT NOT NULL,
                incremental_field TEXT NOT NULL,
                last_value TEXT NOT NULL,
                value_kind TEXT NOT NULL,
                sort_key TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (source_system, entity_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Open a pool. In-memory databases live only as long as their single
/// connection, so that connection is never recycled.
pub async fn sqlite_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(30));
    let options = if database_url.contains(":memory:") {
        options.max_connections(1).idle_timeout(None).max_lifetime(None)
    } else {
        options.max_connections(5)
    };
    options.connect(database_url).await
}

#[derive(Debug, FromRow)]
struct WatermarkRow {
    source_system: String,
    entity_name: String,
    incremental_field: String,
    last_value: String,
    value_kind: String,
    updated_at: String,
}

impl WatermarkRow {
    fn into_watermark(self) -> StoreResult<Watermark> {
        let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)
            .map_err(|e| StoreError::Corrupt(format!("invalid updated_at: {}", e)))?
            .with_timezone(&Utc);

        Ok(Watermark {
            last_value: WatermarkValue::from_stored(&self.value_kind, &self.last_value)?,
            source_system: self.source_system,
            entity_name: self.entity_name,
            incremental_field: self.incremental_field,
            updated_at,
        })
    }
}

#[async_trait]
impl WatermarkStore for SqliteWatermarks {
    async fn get(&self, source_system: &str, entity: &str) -> StoreResult<Option<Watermark>> {
        let row = sqlx::query_as::<_, WatermarkRow>(
            "SELECT source_system, entity_name, incremental_field, last_value, value_kind, updated_at \
             FROM ingest_watermarks WHERE source_system = ? AND entity_name = ?",
        )
        .bind(source_system)
        .bind(entity)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WatermarkRow::into_watermark).transpose()
    }

    async fn record_observed_max(
        &self,
        source_system: &str,
        entity: &str,
        incremental_field: &str,
        observed_max: &WatermarkValue,
    ) -> StoreResult<Advance> {
        let result = sqlx::query(
            r#"
            INSERT INTO ingest_watermarks
                (source_system, entity_name, incremental_field, last_value, value_kind, sort_key, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_system, entity_name) DO UPDATE SET
                incremental_field = excluded.incremental_field,
                last_value = excluded.last_value,
                sort_key = excluded.sort_key,
                updated_at = excluded.updated_at
            WHERE excluded.value_kind = ingest_watermarks.value_kind
              AND excluded.sort_key > ingest_watermarks.sort_key
            "#,
        )
        .bind(source_system)
        .bind(entity)
        .bind(incremental_field)
        .bind(observed_max.to_literal())
        .bind(observed_max.kind())
        .bind(observed_max.sort_key())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_or(e, source_system, entity))?;

        Ok(if result.rows_affected() > 0 {
            Advance::Recorded
        } else {
            Advance::Unchanged
        })
    }
}

fn conflict_or(err: sqlx::Error, source_system: &str, entity: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::WriteConflict {
            source_system: source_system.to_string(),
            entity: entity.to_string(),
        },
        _ => StoreError::Database(err),
    }
}
