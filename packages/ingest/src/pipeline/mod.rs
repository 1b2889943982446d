//! Extraction pipeline: mode planning, staging, orchestration and the load
//! pass.

pub mod context;
pub mod extract;
pub mod load;
pub mod plan;
pub mod stage;

pub use context::{ExtractSettings, RunContext, WatermarkCommit};
pub use extract::{
    advance_watermark, EntityOutcome, EntityStatus, Extractor, RunSummary, WatermarkUpdate,
};
pub use load::load_pass;
pub use plan::{plan_entity, ExtractPlan, LoadMode};
pub use stage::{RunManifest, StagedArtifact, StagedRecord, Stager};
