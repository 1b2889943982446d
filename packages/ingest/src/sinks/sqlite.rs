//! SQLite raw layer.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;

use super::{read_artifact, LoadReport, LoadRequest, LoadSink};
use crate::error::SinkResult;
use crate::watermark::sqlite::sqlite_pool;

pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    pub async fn new(database_url: &str) -> SinkResult<Self> {
        let pool = sqlite_pool(database_url).await?;
        Self::from_pool(pool).await
    }

    /// Create an in-memory sink (for testing).
    pub async fn in_memory() -> SinkResult<Self> {
        Self::new("sqlite::memory:").await
    }

    /// Share a pool with a [`SqliteWatermarks`](crate::watermark::SqliteWatermarks).
    pub async fn from_pool(pool: SqlitePool) -> SinkResult<Self> {
        let sink = Self { pool };
        sink.run_migrations().await?;
        Ok(sink)
    }

    async fn run_migrations(&self) -> SinkResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS raw_entities (
                source_system TEXT NOT NULL,
                entity_name TEXT NOT NULL,
                load_mode TEXT NOT NULL,
                ingested_at TEXT NOT NULL,
                record_seq INTEGER NOT NULL,
                payload TEXT NOT NULL,
                loaded_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                UNIQUE (source_system, entity_name, ingested_at, record_seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_raw_entities_entity ON raw_entities(source_system, entity_name)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn count(&self, source_system: &str, entity: &str) -> SinkResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM raw_entities WHERE source_system = ? AND entity_name = ?",
        )
        .bind(source_system)
        .bind(entity)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl LoadSink for SqliteSink {
    async fn load(&self, request: LoadRequest<'_>) -> SinkResult<LoadReport> {
        let parsed = read_artifact(request.artifact).await?;
        let entity = request.artifact.entity();

        let mut tx = self.pool.begin().await?;

        if request.replace {
            let deleted = sqlx::query(
                "DELETE FROM raw_entities WHERE source_system = ? AND entity_name = ?",
            )
            .bind(request.source_system)
            .bind(entity)
            .execute(&mut *tx)
            .await?;
            tracing::info!(entity, deleted = deleted.rows_affected(), "Cleared raw rows for full reload");
        }

        for seq in &parsed.records {
            sqlx::query(
                r#"
                INSERT INTO raw_entities
                    (source_system, entity_name, load_mode, ingested_at, record_seq, payload)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (source_system, entity_name, ingested_at, record_seq) DO NOTHING
                "#,
            )
            .bind(request.source_system)
            .bind(entity)
            .bind(seq.record.load_mode.as_str())
            .bind(seq.record.ingested_at.to_rfc3339())
            .bind(seq.seq)
            .bind(seq.record.payload.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(LoadReport {
            loaded: parsed.records.len(),
            rejected: parsed.rejected,
        })
    }
}
