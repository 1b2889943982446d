use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Per-invocation settings, fixed when the run starts.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Stamped on every staged record of this run.
    pub run_started_at: DateTime<Utc>,
    pub force_full_reload: bool,
    /// Subtracted from time-typed watermarks when they are read.
    pub overlap: Option<Duration>,
}

impl RunContext {
    pub fn new(force_full_reload: bool, overlap: Option<Duration>) -> Self {
        Self {
            run_started_at: Utc::now(),
            force_full_reload,
            overlap,
        }
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.run_started_at = started_at;
        self
    }
}

/// When observed maxima are written to the watermark store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkCommit {
    /// Right after the entity's artifact is durably staged.
    #[default]
    AfterStaging,
    /// Only after the artifact has been loaded by the sink.
    AfterLoad,
}

/// Source identity and worker settings for an extraction run.
#[derive(Debug, Clone)]
pub struct ExtractSettings {
    /// Key used in the watermark table (e.g. `NAVUSOFT`).
    pub source_system: String,
    /// Value of `_source` in staged records (e.g. `navusoft`).
    pub source_tag: String,
    /// Attempts per query on read timeout.
    pub retries: u32,
    /// Entities extracted at once. `1` keeps the run sequential.
    pub max_concurrency: usize,
    pub commit: WatermarkCommit,
}

impl Default for ExtractSettings {
    fn default() -> Self {
        Self {
            source_system: "NAVUSOFT".to_string(),
            source_tag: "navusoft".to_string(),
            retries: 3,
            max_concurrency: 1,
            commit: WatermarkCommit::AfterStaging,
        }
    }
}

impl ExtractSettings {
    pub fn with_source(mut self, system: impl Into<String>, tag: impl Into<String>) -> Self {
        self.source_system = system.into();
        self.source_tag = tag.into();
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_commit(mut self, commit: WatermarkCommit) -> Self {
        self.commit = commit;
        self
    }
}
