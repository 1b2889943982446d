//! PostgreSQL raw layer.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::types::Json;

use super::{read_artifact, LoadReport, LoadRequest, LoadSink};
use crate::error::SinkResult;
use crate::watermark::postgres::postgres_pool;

pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    pub async fn new(database_url: &str) -> SinkResult<Self> {
        let pool = postgres_pool(database_url).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> SinkResult<Self> {
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
                ingested_at TIMESTAMPTZ NOT NULL,
                record_seq BIGINT NOT NULL,
                payload JSONB NOT NULL,
                loaded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
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

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LoadSink for PostgresSink {
    async fn load(&self, request: LoadRequest<'_>) -> SinkResult<LoadReport> {
        let parsed = read_artifact(request.artifact).await?;
        let entity = request.artifact.entity();

        let mut tx = self.pool.begin().await?;

        if request.replace {
            let deleted = sqlx::query(
                "DELETE FROM raw_entities WHERE source_system = $1 AND entity_name = $2",
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
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (source_system, entity_name, ingested_at, record_seq) DO NOTHING
                "#,
            )
            .bind(request.source_system)
            .bind(entity)
            .bind(seq.record.load_mode.as_str())
            .bind(seq.record.ingested_at)
            .bind(seq.seq)
            .bind(Json(&seq.record.payload))
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
