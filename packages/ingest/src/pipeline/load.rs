//! Second pass: hand staged artifacts to the sink.

use crate::error::Result;
use crate::pipeline::context::{ExtractSettings, RunContext};
use crate::pipeline::extract::{
    advance_watermark, settle_advance, EntityOutcome, EntityStatus, WatermarkUpdate,
};
use crate::sinks::{LoadRequest, LoadSink};
use crate::watermark::WatermarkStore;

/// Load every staged outcome, in order.
///
/// Deferred watermarks are committed only when their load succeeds.
pub async fn load_pass<K, W>(
    sink: &K,
    watermarks: &W,
    settings: &ExtractSettings,
    run: &RunContext,
    outcomes: &mut [EntityOutcome],
) -> Result<()>
where
    K: LoadSink + ?Sized,
    W: WatermarkStore + ?Sized,
{
    for outcome in outcomes.iter_mut() {
        if outcome.status != EntityStatus::Staged {
            continue;
        }
        let Some(artifact) = outcome.artifact.as_ref() else {
            continue;
        };

        let request = LoadRequest {
            artifact,
            source_system: &settings.source_system,
            replace: run.force_full_reload,
        };

        match sink.load(request).await {
            Ok(report) => {
                tracing::info!(
                    entity = %outcome.entity,
                    loaded = report.loaded,
                    rejected = report.rejected,
                    "Loaded artifact"
                );
                outcome.status = EntityStatus::Loaded(report);

                let deferred = match (&outcome.watermark, &outcome.incremental_field) {
                    (WatermarkUpdate::Deferred(value), Some(field)) => {
                        Some((value.clone(), field.clone()))
                    }
                    _ => None,
                };
                if let Some((value, field)) = deferred {
                    let result = advance_watermark(
                        watermarks,
                        &settings.source_system,
                        artifact,
                        &field,
                        &value,
                    )
                    .await;
                    outcome.watermark = settle_advance(&outcome.entity, value, result)?;
                }
            }
            Err(e) => {
                tracing::error!(entity = %outcome.entity, error = %e, "Load failed");
                outcome.status = EntityStatus::LoadFailed(e.to_string());
            }
        }
    }

    Ok(())
}
