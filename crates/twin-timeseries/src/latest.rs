//! ---
//! ems_section: "04-data-processing"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Time-series query, aggregation, and fallback engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};

use crate::compose::ComposedQuery;
use crate::error::RetrievalError;
use crate::fallback::{decide, Decision, FallbackReason, Synthesizer};
use crate::model::{LatestValue, LatestValueSet, Metric};
use crate::retrieval::Retrieved;

/// A pair answered synthetically, kept for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilledPair {
    pub zone_id: String,
    pub metric: Metric,
    pub reason: FallbackReason,
}

#[derive(Debug, Clone)]
pub struct LatestOutcome {
    pub values: LatestValueSet,
    pub filled: Vec<FilledPair>,
}

/// Merge the grouped last-per-series read with synthetic values for every
/// requested pair the read did not cover.
pub fn assemble_latest(
    composed: &ComposedQuery,
    retrieved: Result<&Retrieved, &RetrievalError>,
    synthesizer: &Synthesizer,
    now: DateTime<Utc>,
) -> LatestOutcome {
    let mut values = LatestValueSet::new(&composed.building_id);
    let mut filled = Vec::new();
    for zone_id in &composed.zones {
        for metric in &composed.metrics {
            let pair = retrieved.map(|retrieved| retrieved.find(zone_id, *metric));
            let value = match decide(pair, &composed.window) {
                Decision::UseReal => pair
                    .ok()
                    .flatten()
                    .and_then(|series| series.last())
                    .map(LatestValue::from_sample),
                Decision::UseSynthetic(reason) => {
                    filled.push(FilledPair {
                        zone_id: zone_id.clone(),
                        metric: *metric,
                        reason,
                    });
                    None
                }
            };
            let value = value.unwrap_or_else(|| {
                synthesizer.value(&composed.building_id, zone_id, *metric, now)
            });
            values.insert(zone_id, *metric, value);
        }
    }
    LatestOutcome { values, filled }
}
