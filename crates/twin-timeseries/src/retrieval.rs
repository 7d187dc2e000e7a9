//! ---
//! ems_section: "04-data-processing"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Time-series query, aggregation, and fallback engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use twin_store::{RawRow, TelemetryStore};

use crate::compose::{ComposedQuery, BUILDING_TAG, ZONE_TAG};
use crate::error::RetrievalError;
use crate::model::{Metric, MetricSample, MetricSeries, Provenance};

/// Why a raw row could not become a sample.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowRejection {
    #[error("row has no zone_id tag")]
    MissingZone,
    #[error("row has no measurement")]
    MissingMeasurement,
    #[error("measurement '{0}' is not a known metric")]
    UnknownMeasurement(String),
    #[error("row has no timestamp")]
    MissingTime,
    #[error("row value is missing or not numeric")]
    NonNumeric,
    #[error("row value {0} is not finite")]
    NonFinite(f64),
}

/// Convert one schema-less store row into a real sample.
///
/// Requires a `zone_id` tag, a known measurement, a timestamp, and a finite
/// numeric value. The building comes from the row when tagged, otherwise from
/// the request. Extra tags are ignored.
pub fn sample_from_row(row: &RawRow, building_id: &str) -> Result<MetricSample, RowRejection> {
    let zone_id = row
        .tag(ZONE_TAG)
        .filter(|zone| !zone.is_empty())
        .ok_or(RowRejection::MissingZone)?;
    let measurement = row
        .measurement
        .as_deref()
        .ok_or(RowRejection::MissingMeasurement)?;
    let metric = Metric::from_name(measurement)
        .ok_or_else(|| RowRejection::UnknownMeasurement(measurement.to_owned()))?;
    let timestamp: DateTime<Utc> = row.time.ok_or(RowRejection::MissingTime)?;
    let value = row
        .value
        .as_ref()
        .and_then(|value| value.as_f64())
        .ok_or(RowRejection::NonNumeric)?;
    if !value.is_finite() {
        return Err(RowRejection::NonFinite(value));
    }
    let building = row
        .tag(BUILDING_TAG)
        .filter(|building| !building.is_empty())
        .unwrap_or(building_id);
    Ok(MetricSample::new(
        building,
        zone_id,
        metric,
        timestamp,
        value,
        Provenance::Real,
    ))
}

/// Series recovered from one store read.
#[derive(Debug, Clone, Default)]
pub struct Retrieved {
    pub series: Vec<MetricSeries>,
    pub rows: usize,
    pub skipped: usize,
}

impl Retrieved {
    pub fn find(&self, zone_id: &str, metric: Metric) -> Option<&MetricSeries> {
        self.series
            .iter()
            .find(|series| series.zone_id() == zone_id && series.metric() == metric)
    }

    pub fn sample_count(&self) -> usize {
        self.series.iter().map(MetricSeries::len).sum()
    }
}

/// Runs composed queries against the store under a bounded timeout.
pub struct RetrievalClient<'a> {
    store: &'a dyn TelemetryStore,
    timeout: Duration,
}

impl<'a> RetrievalClient<'a> {
    pub fn new(store: &'a dyn TelemetryStore, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Execute the query and group adapted rows by `(zone, metric)`.
    pub async fn fetch(&self, composed: &ComposedQuery) -> Result<Retrieved, RetrievalError> {
        let rows = tokio::time::timeout(self.timeout, self.store.query(&composed.query))
            .await
            .map_err(|_| RetrievalError::Timeout(self.timeout))??;
        Ok(group_rows(&rows, composed))
    }
}

/// Adapt rows and group them into time-sorted real series. Rows outside the
/// requested zones or metrics are dropped with the unadaptable ones.
pub fn group_rows(rows: &[RawRow], composed: &ComposedQuery) -> Retrieved {
    let mut grouped: BTreeMap<(String, Metric), Vec<(DateTime<Utc>, f64)>> = BTreeMap::new();
    let mut skipped = 0;
    for row in rows {
        match sample_from_row(row, &composed.building_id) {
            Ok(sample)
                if composed.zones.iter().any(|zone| zone == sample.zone_id())
                    && composed.metrics.contains(&sample.metric()) =>
            {
                grouped
                    .entry((sample.zone_id().to_owned(), sample.metric()))
                    .or_default()
                    .push((sample.timestamp(), sample.value()));
            }
            Ok(sample) => {
                tracing::debug!(
                    zone = sample.zone_id(),
                    metric = sample.metric().as_str(),
                    "row outside the requested pairs skipped"
                );
                skipped += 1;
            }
            Err(reason) => {
                tracing::debug!(%reason, "store row skipped");
                skipped += 1;
            }
        }
    }

    let series = grouped
        .into_iter()
        .map(|((zone_id, metric), points)| {
            MetricSeries::real(&composed.building_id, &zone_id, metric, points)
        })
        .collect();
    Retrieved {
        series,
        rows: rows.len(),
        skipped,
    }
}
