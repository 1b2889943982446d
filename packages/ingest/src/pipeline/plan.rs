//! Load mode decision.

use navu_client::{Filter, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::pipeline::context::RunContext;
use crate::watermark::WatermarkValue;

/// How an entity's fetch filter was derived. Informational only: it is
/// stamped on staged records and does not change load behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadMode {
    Full,
    IncrementalSoft,
}

impl LoadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadMode::Full => "FULL",
            LoadMode::IncrementalSoft => "INCREMENTAL_SOFT",
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to fetch for one entity in this run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractPlan {
    pub mode: LoadMode,
    pub soft_watermark: Option<WatermarkValue>,
    pub filter: Option<Filter>,
}

impl ExtractPlan {
    pub fn full() -> Self {
        Self {
            mode: LoadMode::Full,
            soft_watermark: None,
            filter: None,
        }
    }
}

/// Decide the load mode.
///
/// FULL when the run forces a reload, the entity has no incremental field,
/// or there is no soft watermark. Otherwise INCREMENTAL_SOFT filtered on
/// `incremental_field >= soft_watermark`. Fails when the watermark cannot be
/// rendered as a filter literal.
pub fn plan_entity(
    run: &RunContext,
    incremental_field: Option<&str>,
    soft_watermark: Option<WatermarkValue>,
) -> Result<ExtractPlan> {
    let (field, watermark) = match (incremental_field, soft_watermark) {
        (Some(field), Some(watermark)) if !run.force_full_reload => (field, watermark),
        _ => return Ok(ExtractPlan::full()),
    };

    let filter = Filter::at_least(field, watermark.to_literal())?;

    Ok(ExtractPlan {
        mode: LoadMode::IncrementalSoft,
        soft_watermark: Some(watermark),
        filter: Some(filter),
    })
}
