//! Run configuration.
//!
//! Loaded from a YAML file. The session id and warehouse URL may be left out
//! of the file and supplied through `NAVU_SESSION_ID` / `DATABASE_URL`
//! (a `.env` file is read first if present).

use chrono::Duration;
use dotenvy::dotenv;
use navu_client::{ClientConfig, Filter, RetryPolicy, SessionToken};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::pipeline::context::{ExtractSettings, RunContext, WatermarkCommit};
use crate::pipeline::stage::artifact_stem;
use crate::source::ColumnSource;

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    pub api: ApiConfig,

    #[serde(default)]
    pub warehouse: WarehouseConfig,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub entities: Vec<EntityConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub runquery_endpoint: String,

    #[serde(default = "default_entities_endpoint")]
    pub entities_endpoint: String,

    #[serde(default, alias = "sessionId")]
    pub session_id: Option<SessionToken>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WarehouseConfig {
    /// `postgres://...` or `sqlite://...`
    #[serde(default)]
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Watermark key for this source.
    pub source_system: String,
    /// `_source` tag written into staged records.
    pub source_tag: String,
    pub force_full_reload: bool,
    /// Safety overlap subtracted from time-typed watermarks. `0` disables it.
    pub overlap_hours: u32,
    pub output_dir: PathBuf,
    pub retries: u32,
    pub backoff_secs: u64,
    pub max_concurrency: usize,
    pub commit_watermarks: WatermarkCommit,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            source_system: "NAVUSOFT".to_string(),
            source_tag: "navusoft".to_string(),
            force_full_reload: false,
            overlap_hours: 48,
            output_dir: PathBuf::from("output"),
            retries: 3,
            backoff_secs: 5,
            max_concurrency: 1,
            commit_watermarks: WatermarkCommit::AfterStaging,
        }
    }
}

/// One entity to extract.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EntityConfig {
    pub name: String,

    /// Explicit column list. Omitted means `["id"]`; an empty list means
    /// resolve from the catalog.
    #[serde(default)]
    pub columns: Option<Vec<String>>,

    #[serde(default)]
    pub incremental_field: Option<String>,

    /// Force catalog resolution even if `columns` is set.
    #[serde(default)]
    pub resolve_columns: bool,
}

impl EntityConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: None,
            incremental_field: None,
            resolve_columns: false,
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_incremental_field(mut self, field: impl Into<String>) -> Self {
        self.incremental_field = Some(field.into());
        self
    }

    pub fn remote_columns(mut self) -> Self {
        self.resolve_columns = true;
        self
    }

    pub fn column_source(&self) -> ColumnSource {
        match &self.columns {
            _ if self.resolve_columns => ColumnSource::Remote,
            Some(columns) if columns.is_empty() => ColumnSource::Remote,
            Some(columns) => ColumnSource::Explicit(columns.clone()),
            None => ColumnSource::Explicit(vec!["id".to_string()]),
        }
    }
}

fn default_entities_endpoint() -> String {
    navu_client::DEFAULT_ENTITIES_ENDPOINT.to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    300
}

fn default_metadata_timeout() -> u64 {
    60
}

impl IngestConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read, fill from the environment and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        // Load .env file if present (development)
        let _ = dotenv();

        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_yaml(&text)?;
        config.fill_from(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Fill settings left out of the file from `lookup`.
    pub fn fill_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let session_missing = self
            .api
            .session_id
            .as_ref()
            .map_or(true, SessionToken::is_blank);
        if session_missing {
            if let Some(token) = lookup("NAVU_SESSION_ID") {
                self.api.session_id = Some(SessionToken::new(token));
            }
        }
        if self.warehouse.database_url.is_none() {
            self.warehouse.database_url = lookup("DATABASE_URL");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.base_url.trim().is_empty() {
            return Err(ConfigError::Missing("api.base_url"));
        }
        if self.api.runquery_endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("api.runquery_endpoint"));
        }
        if self.entities.is_empty() {
            return Err(ConfigError::Missing("entities"));
        }

        let mut seen = HashSet::new();
        let mut stems: HashMap<String, &str> = HashMap::new();
        for entity in &self.entities {
            if entity.name.trim().is_empty() {
                return Err(ConfigError::Invalid("entity with empty name".into()));
            }
            if !seen.insert(entity.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "entity '{}' listed twice",
                    entity.name
                )));
            }
            let stem = artifact_stem(&entity.name).to_lowercase();
            if let Some(other) = stems.insert(stem, entity.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "entities '{}' and '{}' map to the same artifact file",
                    other, entity.name
                )));
            }
            if let Some(field) = &entity.incremental_field {
                // Same rules the query filter applies
                Filter::at_least(field, "").map_err(|e| {
                    ConfigError::Invalid(format!("entity '{}': {}", entity.name, e))
                })?;
            }
        }

        if self.run.max_concurrency == 0 {
            return Err(ConfigError::Invalid("run.max_concurrency must be at least 1".into()));
        }
        Ok(())
    }

    /// Client settings. A blank or absent session id is a config error.
    pub fn client_config(&self) -> Result<ClientConfig, ConfigError> {
        let session = self
            .api
            .session_id
            .clone()
            .filter(|s| !s.is_blank())
            .ok_or(ConfigError::Missing("api.session_id (or NAVU_SESSION_ID)"))?;

        Ok(ClientConfig::new(
            self.api.base_url.clone(),
            self.api.runquery_endpoint.clone(),
            session,
        )
        .with_entities_endpoint(self.api.entities_endpoint.clone())
        .with_timeouts(
            std::time::Duration::from_secs(self.api.connect_timeout_secs),
            std::time::Duration::from_secs(self.api.read_timeout_secs),
        )
        .with_metadata_timeout(std::time::Duration::from_secs(self.api.metadata_timeout_secs))
        .with_retry(RetryPolicy::new(
            self.run.retries,
            std::time::Duration::from_secs(self.run.backoff_secs),
        )))
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.warehouse
            .database_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing("warehouse.database_url (or DATABASE_URL)"))
    }

    pub fn overlap(&self) -> Option<Duration> {
        match self.run.overlap_hours {
            0 => None,
            hours => Some(Duration::hours(i64::from(hours))),
        }
    }

    pub fn run_context(&self) -> RunContext {
        RunContext::new(self.run.force_full_reload, self.overlap())
    }

    pub fn extract_settings(&self) -> ExtractSettings {
        ExtractSettings::default()
            .with_source(self.run.source_system.clone(), self.run.source_tag.clone())
            .with_retries(self.run.retries)
            .with_concurrency(self.run.max_concurrency)
            .with_commit(self.run.commit_watermarks)
    }
}
