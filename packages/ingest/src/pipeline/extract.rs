//! Per-entity extraction.
//!
//! For each configured entity the extractor reads the soft watermark, picks a
//! load mode, fetches, stages, and then records the observed maximum. Entity
//! failures are isolated: they become a `Failed` outcome and the run moves on.
//! After all entities are staged, a manifest is written and the load pass
//! hands each artifact to the sink in entity order.

use futures::stream::{self, StreamExt, TryStreamExt};
use std::fmt;
use std::path::PathBuf;

use crate::config::EntityConfig;
use crate::error::{IngestError, Result, StoreError, StoreResult};
use crate::pipeline::context::{ExtractSettings, RunContext, WatermarkCommit};
use crate::pipeline::load::load_pass;
use crate::pipeline::plan::{plan_entity, LoadMode};
use crate::pipeline::stage::{RunManifest, StagedArtifact, Stager};
use crate::sinks::{LoadReport, LoadSink};
use crate::source::QuerySource;
use crate::watermark::{observed_max, Advance, WatermarkStore, WatermarkValue};

/// What happened to an entity's watermark this run.
#[derive(Debug, Clone, PartialEq)]
pub enum WatermarkUpdate {
    /// The entity has no incremental field.
    NotTracked,
    /// Nothing was staged, so nothing was recorded.
    NotAttempted,
    /// Rows were staged but none carried a usable incremental value.
    NoValues,
    Advanced(WatermarkValue),
    /// The stored value was already at or past the observed maximum.
    Unchanged(WatermarkValue),
    /// Waiting for the artifact to load.
    Deferred(WatermarkValue),
    /// The write failed; the stored watermark is untouched.
    Failed(String),
}

impl WatermarkUpdate {
    pub fn advanced(&self) -> bool {
        matches!(self, WatermarkUpdate::Advanced(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityStatus {
    Pending,
    /// Fetch returned zero rows.
    Skipped,
    Failed(String),
    Staged,
    Loaded(LoadReport),
    LoadFailed(String),
}

/// Everything the run learned about one entity.
#[derive(Debug, Clone)]
pub struct EntityOutcome {
    pub entity: String,
    pub mode: Option<LoadMode>,
    pub watermark_used: Option<WatermarkValue>,
    pub rows_fetched: usize,
    pub rows_staged: usize,
    /// Non-null incremental values left out of the observed maximum.
    pub values_ignored: usize,
    pub watermark: WatermarkUpdate,
    pub status: EntityStatus,
    pub artifact: Option<StagedArtifact>,
    pub(crate) incremental_field: Option<String>,
}

impl EntityOutcome {
    fn new(entity: &EntityConfig) -> Self {
        Self {
            entity: entity.name.clone(),
            mode: None,
            watermark_used: None,
            rows_fetched: 0,
            rows_staged: 0,
            values_ignored: 0,
            watermark: WatermarkUpdate::NotAttempted,
            status: EntityStatus::Pending,
            artifact: None,
            incremental_field: entity.incremental_field.clone(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self.status,
            EntityStatus::Failed(_) | EntityStatus::LoadFailed(_)
        )
    }
}

impl fmt::Display for EntityOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match &self.status {
            EntityStatus::Pending => "PENDING".to_string(),
            EntityStatus::Skipped => "SKIPPED (no rows)".to_string(),
            EntityStatus::Failed(reason) => format!("FAILED ({})", reason),
            EntityStatus::Staged => "STAGED".to_string(),
            EntityStatus::Loaded(report) => format!(
                "LOADED ({} loaded, {} rejected)",
                report.loaded, report.rejected
            ),
            EntityStatus::LoadFailed(reason) => format!("LOAD FAILED ({})", reason),
        };

        write!(
            f,
            "{}: {} mode={} watermark_used={} fetched={} staged={} watermark_updated={}",
            self.entity,
            status,
            self.mode.map_or("-", |m| m.as_str()),
            self.watermark_used
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string),
            self.rows_fetched,
            self.rows_staged,
            if self.watermark.advanced() { "yes" } else { "no" },
        )?;
        if self.values_ignored > 0 {
            write!(f, " ignored_values={}", self.values_ignored)?;
        }
        Ok(())
    }
}

/// Result of a whole run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcomes: Vec<EntityOutcome>,
    pub manifest: Option<PathBuf>,
}

impl RunSummary {
    pub fn total_rows(&self) -> usize {
        self.outcomes.iter().map(|o| o.rows_fetched).sum()
    }

    pub fn failed_entities(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.is_failed())
            .map(|o| o.entity.as_str())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| !o.is_failed())
    }

    pub fn outcome(&self, entity: &str) -> Option<&EntityOutcome> {
        self.outcomes.iter().find(|o| o.entity == entity)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self.failed_entities();
        write!(
            f,
            "{} entities, {} rows fetched, {} failed",
            self.outcomes.len(),
            self.total_rows(),
            failed.len()
        )?;
        if !failed.is_empty() {
            write!(f, ": {}", failed.join(", "))?;
        }
        Ok(())
    }
}

/// Record an observed maximum for a staged entity.
///
/// Taking the artifact ties the write to data that is already on disk.
pub async fn advance_watermark<W: WatermarkStore + ?Sized>(
    store: &W,
    source_system: &str,
    artifact: &StagedArtifact,
    incremental_field: &str,
    observed: &WatermarkValue,
) -> StoreResult<Advance> {
    store
        .record_observed_max(source_system, artifact.entity(), incremental_field, observed)
        .await
}

/// Turn a store write result into the outcome's watermark state.
///
/// Write conflicts abort the run; other store errors only cost this run's
/// advance.
pub(crate) fn settle_advance(
    entity: &str,
    observed: WatermarkValue,
    result: StoreResult<Advance>,
) -> Result<WatermarkUpdate> {
    match result {
        Ok(Advance::Recorded) => {
            tracing::info!(entity, value = %observed, "Watermark advanced");
            Ok(WatermarkUpdate::Advanced(observed))
        }
        Ok(Advance::Unchanged) => {
            tracing::debug!(entity, value = %observed, "Watermark already at or past observed max");
            Ok(WatermarkUpdate::Unchanged(observed))
        }
        Err(e @ StoreError::WriteConflict { .. }) => Err(e.into()),
        Err(e) => {
            tracing::error!(entity, error = %e, "Failed to record watermark");
            Ok(WatermarkUpdate::Failed(e.to_string()))
        }
    }
}

pub struct Extractor<Q, W, K> {
    source: Q,
    watermarks: W,
    sink: K,
    stager: Stager,
    settings: ExtractSettings,
    run: RunContext,
}

impl<Q, W, K> Extractor<Q, W, K>
where
    Q: QuerySource,
    W: WatermarkStore,
    K: LoadSink,
{
    pub fn new(
        source: Q,
        watermarks: W,
        sink: K,
        output_dir: impl Into<PathBuf>,
        settings: ExtractSettings,
        run: RunContext,
    ) -> Self {
        let stager = Stager::new(output_dir, settings.source_tag.clone());
        Self {
            source,
            watermarks,
            sink,
            stager,
            settings,
            run,
        }
    }

    pub fn watermarks(&self) -> &W {
        &self.watermarks
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn source(&self) -> &Q {
        &self.source
    }

    pub fn run_context(&self) -> &RunContext {
        &self.run
    }

    /// Extract every entity, write the manifest, then load.
    ///
    /// Only fatal errors (config, output directory, watermark write
    /// conflicts) are returned as `Err`.
    pub async fn run(&self, entities: &[EntityConfig]) -> Result<RunSummary> {
        self.stager
            .prepare()
            .await
            .map_err(|source| IngestError::Output {
                path: self.stager.output_dir().to_path_buf(),
                source,
            })?;

        tracing::info!(
            entities = entities.len(),
            full_reload = self.run.force_full_reload,
            concurrency = self.settings.max_concurrency,
            "Starting extraction run"
        );

        // `buffered` keeps results in input order
        let mut outcomes: Vec<EntityOutcome> = stream::iter(entities)
            .map(|entity| self.extract_entity(entity))
            .buffered(self.settings.max_concurrency.max(1))
            .try_collect()
            .await?;

        let manifest = RunManifest {
            run_started_at: self.run.run_started_at,
            source_system: self.settings.source_system.clone(),
            force_full_reload: self.run.force_full_reload,
            artifacts: outcomes
                .iter()
                .filter_map(|o| o.artifact.clone())
                .collect(),
        };
        let manifest_path = self
            .stager
            .write_manifest(&manifest)
            .await
            .map_err(|source| IngestError::Output {
                path: self.stager.output_dir().join("manifest.json"),
                source,
            })?;

        load_pass(
            &self.sink,
            &self.watermarks,
            &self.settings,
            &self.run,
            &mut outcomes,
        )
        .await?;

        let summary = RunSummary {
            outcomes,
            manifest: Some(manifest_path),
        };
        tracing::info!(summary = %summary, "Extraction run finished");
        Ok(summary)
    }

    /// Extract one entity. Entity-level errors are folded into the outcome.
    pub async fn extract_entity(&self, entity: &EntityConfig) -> Result<EntityOutcome> {
        let mut outcome = EntityOutcome::new(entity);

        match self.try_extract(entity, &mut outcome).await {
            Ok(()) => Ok(outcome),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::error!(entity = %entity.name, error = %e, "Entity failed");
                outcome.status = EntityStatus::Failed(e.to_string());
                Ok(outcome)
            }
        }
    }

    async fn try_extract(&self, entity: &EntityConfig, outcome: &mut EntityOutcome) -> Result<()> {
        let name = entity.name.as_str();
        let field = entity.incremental_field.as_deref();

        let soft = match field {
            Some(_) if !self.run.force_full_reload => {
                self.watermarks
                    .get_soft(&self.settings.source_system, name, self.run.overlap)
                    .await?
            }
            _ => None,
        };

        let plan = plan_entity(&self.run, field, soft).map_err(|source| IngestError::Plan {
            entity: name.to_string(),
            source,
        })?;
        outcome.mode = Some(plan.mode);
        outcome.watermark_used = plan.soft_watermark.clone();

        tracing::info!(
            entity = name,
            mode = %plan.mode,
            watermark = ?plan.soft_watermark.as_ref().map(ToString::to_string),
            "Extracting entity"
        );

        let columns = entity
            .column_source()
            .resolve(&self.source, name)
            .await
            .map_err(|source| {
                if source.is_metadata() {
                    IngestError::Metadata {
                        entity: name.to_string(),
                        source,
                    }
                } else {
                    IngestError::FetchFailed {
                        entity: name.to_string(),
                        source,
                    }
                }
            })?;

        let rows = self
            .source
            .fetch(name, &columns, plan.filter.as_ref(), self.settings.retries)
            .await
            .map_err(|source| IngestError::FetchFailed {
                entity: name.to_string(),
                source,
            })?;
        outcome.rows_fetched = rows.len();

        let staged = self
            .stager
            .stage(name, plan.mode, &self.run, &rows)
            .await
            .map_err(|source| IngestError::Staging {
                entity: name.to_string(),
                source,
            })?;

        let Some(artifact) = staged else {
            tracing::info!(entity = name, "No rows returned, skipping");
            outcome.status = EntityStatus::Skipped;
            return Ok(());
        };
        outcome.rows_staged = artifact.rows();

        outcome.watermark = match field {
            None => WatermarkUpdate::NotTracked,
            Some(field) => {
                let max = observed_max(&rows, field);
                outcome.values_ignored = max.ignored;
                if max.ignored > 0 {
                    tracing::warn!(
                        entity = name,
                        field,
                        ignored = max.ignored,
                        "Skipped incremental values without a usable ordering"
                    );
                }
                match max.value {
                    None => {
                        tracing::warn!(entity = name, field, "No non-null incremental values, watermark not updated");
                        WatermarkUpdate::NoValues
                    }
                    Some(value) => match self.settings.commit {
                        WatermarkCommit::AfterLoad => WatermarkUpdate::Deferred(value),
                        WatermarkCommit::AfterStaging => {
                            let result = advance_watermark(
                                &self.watermarks,
                                &self.settings.source_system,
                                &artifact,
                                field,
                                &value,
                            )
                            .await;
                            settle_advance(name, value, result)?
                        }
                    },
                }
            }
        };

        outcome.artifact = Some(artifact);
        outcome.status = EntityStatus::Staged;
        Ok(())
    }
}
