//! PostgreSQL watermark store.
//!
//! `sort_key` is declared with the "C" collation so text comparison is
//! byte order regardless of the database default.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;

use super::{Advance, Watermark, WatermarkStore, WatermarkValue};
use crate::error::{StoreError, StoreResult};

pub struct PostgresWatermarks {
    pool: PgPool,
}

impl PostgresWatermarks {
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        let pool = postgres_pool(database_url).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
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
                sort_key TEXT COLLATE "C" NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (source_system, entity_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub async fn postgres_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
}

#[derive(Debug, FromRow)]
struct WatermarkRow {
    source_system: String,
    entity_name: String,
    incremental_field: String,
    last_value: String,
    value_kind: String,
    updated_at: DateTime<Utc>,
}

impl WatermarkRow {
    fn into_watermark(self) -> StoreResult<Watermark> {
        Ok(Watermark {
            last_value: WatermarkValue::from_stored(&self.value_kind, &self.last_value)?,
            source_system: self.source_system,
            entity_name: self.entity_name,
            incremental_field: self.incremental_field,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl WatermarkStore for PostgresWatermarks {
    async fn get(&self, source_system: &str, entity: &str) -> StoreResult<Option<Watermark>> {
        let row = sqlx::query_as::<_, WatermarkRow>(
            "SELECT source_system, entity_name, incremental_field, last_value, value_kind, updated_at \
             FROM ingest_watermarks WHERE source_system = $1 AND entity_name = $2",
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
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (source_system, entity_name) DO UPDATE SET
                incremental_field = EXCLUDED.incremental_field,
                last_value = EXCLUDED.last_value,
                sort_key = EXCLUDED.sort_key,
                updated_at = EXCLUDED.updated_at
            WHERE EXCLUDED.value_kind = ingest_watermarks.value_kind
              AND EXCLUDED.sort_key > ingest_watermarks.sort_key
            "#,
        )
        .bind(source_system)
        .bind(entity)
        .bind(incremental_field)
        .bind(observed_max.to_literal())
        .bind(observed_max.kind())
        .bind(observed_max.sort_key())
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::WriteConflict {
                source_system: source_system.to_string(),
                entity: entity.to_string(),
            },
            _ => StoreError::Database(e),
        })?;

        Ok(if result.rows_affected() > 0 {
            Advance::Recorded
        } else {
            Advance::Unchanged
        })
    }
}
