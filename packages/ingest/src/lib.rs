//! Incremental extraction from the Navusoft query API.
//!
//! Each configured entity is fetched either in full or incrementally from a
//! soft watermark (the last observed value minus an overlap window), staged
//! as newline-delimited JSON, and appended to a raw table. Watermarks only
//! move forward, and only after the rows that produced them are on disk.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ingest::{Extractor, IngestConfig, MemorySink, MemoryWatermarks};
//! use navu_client::NavuClient;
//!
//! let config = IngestConfig::load("ingest.yaml")?;
//! let client = NavuClient::new(config.client_config()?)?;
//!
//! let extractor = Extractor::new(
//!     client,
//!     MemoryWatermarks::new(),
//!     MemorySink::new(),
//!     &config.run.output_dir,
//!     config.extract_settings(),
//!     config.run_context(),
//! );
//! let summary = extractor.run(&config.entities).await?;
//! println!("{}", summary);
//! ```
//!
//! # Modules
//!
//! - [`config`] - YAML run configuration
//! - [`source`] - Query source trait and column resolution
//! - [`watermark`] - Soft watermark stores
//! - [`pipeline`] - Mode planning, staging, orchestration
//! - [`sinks`] - Raw layer loaders
//! - [`testing`] - Mock implementations for testing

pub mod config;
pub mod error;
pub mod pipeline;
pub mod sinks;
pub mod source;
pub mod testing;
pub mod watermark;

pub use config::{EntityConfig, IngestConfig};
pub use error::{ConfigError, IngestError, Result, SinkError, StoreError};
pub use pipeline::{
    EntityOutcome, EntityStatus, ExtractSettings, Extractor, LoadMode, RunContext, RunSummary,
    StagedArtifact, Stager, WatermarkCommit, WatermarkUpdate,
};
pub use sinks::{LoadReport, LoadRequest, LoadSink, MemorySink};
pub use source::{ColumnSource, QuerySource};
pub use watermark::{Advance, MemoryWatermarks, Watermark, WatermarkStore, WatermarkValue};

#[cfg(feature = "sqlite")]
pub use sinks::SqliteSink;
#[cfg(feature = "sqlite")]
pub use watermark::SqliteWatermarks;

#[cfg(feature = "postgres")]
pub use sinks::PostgresSink;
#[cfg(feature = "postgres")]
pub use watermark::PostgresWatermarks;

pub use testing::{MockCall, MockQuerySource, MockResponse};
