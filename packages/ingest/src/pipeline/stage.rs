//! Local staging of fetched rows.
//!
//! Each entity gets one newline-delimited JSON artifact. Rows are written to
//! a `.partial` file, flushed and synced, then renamed into place, so a
//! [`StagedArtifact`] only exists for data that is fully on disk.

use chrono::{DateTime, Utc};
use navu_client::Row;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::pipeline::context::RunContext;
use crate::pipeline::plan::LoadMode;

/// One line of a staged artifact.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StagedRecord {
    #[serde(rename = "_source")]
    pub source: String,
    #[serde(rename = "_entity")]
    pub entity: String,
    #[serde(rename = "_load_mode")]
    pub load_mode: LoadMode,
    #[serde(rename = "_ingested_at")]
    pub ingested_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "_source")]
    source: &'a str,
    #[serde(rename = "_entity")]
    entity: &'a str,
    #[serde(rename = "_load_mode")]
    load_mode: LoadMode,
    #[serde(rename = "_ingested_at")]
    ingested_at: DateTime<Utc>,
    payload: &'a Row,
}

/// Proof that an entity's rows were durably staged.
///
/// Only [`Stager::stage`] creates these, and only for a non-empty batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagedArtifact {
    entity: String,
    path: PathBuf,
    rows: usize,
    mode: LoadMode,
    ingested_at: DateTime<Utc>,
}

impl StagedArtifact {
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn mode(&self) -> LoadMode {
        self.mode
    }

    pub fn ingested_at(&self) -> DateTime<Utc> {
        self.ingested_at
    }
}

/// Artifacts produced by one run, in entity order.
#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub run_started_at: DateTime<Utc>,
    pub source_system: String,
    pub force_full_reload: bool,
    pub artifacts: Vec<StagedArtifact>,
}

pub struct Stager {
    output_dir: PathBuf,
    source_tag: String,
    /// Lowercased file stem -> entity that owns it.
    claims: Mutex<HashMap<String, String>>,
}

impl Stager {
    pub fn new(output_dir: impl Into<PathBuf>, source_tag: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            source_tag: source_tag.into(),
            claims: Mutex::new(HashMap::new()),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub async fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(&self.output_dir).await
    }

    pub fn artifact_path(&self, entity: &str) -> PathBuf {
        self.output_dir.join(format!("{}.json", artifact_stem(entity)))
    }

    /// Reserve the artifact file name for `entity`. Fails if another entity
    /// already maps to the same name, ignoring case.
    fn claim(&self, entity: &str) -> io::Result<()> {
        let key = artifact_stem(entity).to_lowercase();
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        match claims.get(&key) {
            Some(owner) if owner != entity => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("artifact name '{}' is already used by entity '{}'", key, owner),
            )),
            Some(_) => Ok(()),
            None => {
                claims.insert(key, entity.to_string());
                Ok(())
            }
        }
    }

    /// Write `rows` for `entity`. Returns `None` for an empty batch; no file
    /// is created in that case.
    pub async fn stage(
        &self,
        entity: &str,
        mode: LoadMode,
        run: &RunContext,
        rows: &[Row],
    ) -> io::Result<Option<StagedArtifact>> {
        if rows.is_empty() {
            return Ok(None);
        }

        self.claim(entity)?;
        let path = self.artifact_path(entity);
        let partial = path.with_extension("json.partial");

        let mut writer = BufWriter::new(File::create(&partial).await?);
        for row in rows {
            let envelope = Envelope {
                source: &self.source_tag,
                entity,
                load_mode: mode,
                ingested_at: run.run_started_at,
                payload: row,
            };
            let mut line = serde_json::to_vec(&envelope)?;
            line.push(b'\n');
            writer.write_all(&line).await?;
        }
        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        fs::rename(&partial, &path).await?;

        tracing::debug!(entity, path = %path.display(), rows = rows.len(), "Staged artifact");

        Ok(Some(StagedArtifact {
            entity: entity.to_string(),
            path,
            rows: rows.len(),
            mode,
            ingested_at: run.run_started_at,
        }))
    }

    /// Write `manifest.json` next to the artifacts.
    pub async fn write_manifest(&self, manifest: &RunManifest) -> io::Result<PathBuf> {
        let path = self.output_dir.join("manifest.json");
        let partial = path.with_extension("json.partial");

        let body = serde_json::to_vec_pretty(manifest)?;
        let mut file = File::create(&partial).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        fs::rename(&partial, &path).await?;

        Ok(path)
    }
}

/// Entity names become file names; anything outside `[A-Za-z0-9_.-]` is
/// replaced so names cannot escape the output directory.
pub fn artifact_stem(entity: &str) -> String {
    let stem: String = entity
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    stem.trim_start_matches('.').to_string()
}
