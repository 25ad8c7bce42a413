//! Aggregate speed test document.

use netharvest_common::{NormalizedDocument, TransformError};
use tracing::debug;

use super::{round_to, TransformContext};
use crate::models::{SourceKind, SpeedSample};

/// Fold all samples into one document. `Ok(None)` for an empty sample list.
pub fn aggregate_samples(
    samples: &[SpeedSample],
    ctx: &TransformContext,
) -> Result<Option<NormalizedDocument>, TransformError> {
    if samples.is_empty() {
        return Ok(None);
    }

    let speeds: Vec<f64> = samples.iter().map(|s| s.speed_mbps).collect();
    let sum: f64 = speeds.iter().sum();
    let average = sum / speeds.len() as f64;
    let min = speeds.iter().copied().fold(f64::INFINITY, f64::min);
    let max = speeds.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let min_r = round_to(min, 2);
    let max_r = round_to(max, 2);

    let tests = serde_json::to_value(samples).map_err(|e| TransformError::Malformed(e.to_string()))?;
    let stamp = ctx.stamp();

    let doc = ctx
        .document(format!("speed_{stamp}"), SourceKind::Speed, tests.clone())?
        .with_field("test_timestamp", stamp)
        .with_field("test_count", samples.len())
        .with_field("average_speed_mbps", round_to(average, 2))
        .with_field("min_speed_mbps", min_r)
        .with_field("max_speed_mbps", max_r)
        .with_field("speed_variance", round_to(max_r - min_r, 2))
        .with_field("individual_tests", tests);

    debug!(samples = samples.len(), average_mbps = round_to(average, 2), "Speed samples aggregated");
    Ok(Some(doc))
}
