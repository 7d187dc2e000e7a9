//! ---
//! ems_section: "04-data-processing"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Time-series query, aggregation, and fallback engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Write path for externally produced series.
//!
//! Every point is its own unit of work: a failure is recorded against that point
//! and the rest of the batch is still attempted. Points may land in any order.

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use twin_store::{FieldValue, TelemetryStore, WritePoint};

use crate::compose::{BUILDING_TAG, VALUE_FIELD, ZONE_TAG};
use crate::error::WriteError;

/// Tag marking points that arrived through the write path.
pub const SOURCE_TAG: &str = "source";
pub const SOURCE_VALUE: &str = "simulation";

/// Timestamp of an incoming point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointTime {
    Absolute(DateTime<Utc>),
    /// Offset from the batch origin, in seconds.
    OffsetSeconds(i64),
}

impl PointTime {
    fn resolve(&self, origin: DateTime<Utc>) -> Result<DateTime<Utc>, WriteError> {
        match *self {
            PointTime::Absolute(at) => Ok(at),
            PointTime::OffsetSeconds(offset_seconds) => ChronoDuration::try_seconds(offset_seconds)
                .and_then(|offset| origin.checked_add_signed(offset))
                .ok_or(WriteError::TimestampOutOfRange { offset_seconds }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub at: PointTime,
    pub value: f64,
}

impl SeriesPoint {
    pub fn at(at: DateTime<Utc>, value: f64) -> Self {
        Self {
            at: PointTime::Absolute(at),
            value,
        }
    }

    pub fn offset(seconds: i64, value: f64) -> Self {
        Self {
            at: PointTime::OffsetSeconds(seconds),
            value,
        }
    }
}

/// Series to persist, keyed by measurement name.
pub type SeriesByMetric = IndexMap<String, Vec<SeriesPoint>>;

/// One point that could not be written.
#[derive(Debug, Clone, PartialEq)]
pub struct PointFailure {
    pub metric: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub error: WriteError,
}

/// Per-point accounting of one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteReport {
    pub attempted: usize,
    pub written: usize,
    pub failures: Vec<PointFailure>,
}

impl WriteReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Concurrent, per-point writer.
pub struct WritePath<'a> {
    store: &'a dyn TelemetryStore,
    timeout: Duration,
    concurrency: usize,
}

impl<'a> WritePath<'a> {
    pub fn new(store: &'a dyn TelemetryStore, timeout: Duration, concurrency: usize) -> Self {
        Self {
            store,
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    /// Write every point of every series for one zone. Never fails as a whole.
    pub async fn store_results(
        &self,
        building_id: &str,
        zone_id: &str,
        series: &SeriesByMetric,
        origin: DateTime<Utc>,
    ) -> WriteReport {
        let mut report = WriteReport::default();
        let mut ready = Vec::new();

        for (name, points) in series {
            let metric = name.trim();
            for point in points {
                report.attempted += 1;
                match prepare(building_id, zone_id, metric, point, origin) {
                    Ok(prepared) => ready.push(prepared),
                    Err((timestamp, error)) => report.failures.push(PointFailure {
                        metric: name.clone(),
                        timestamp,
                        error,
                    }),
                }
            }
        }

        let results: Vec<(WritePoint, Result<(), WriteError>)> = stream::iter(ready)
            .map(|point| async move {
                let outcome = self.write_one(&point).await;
                (point, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (point, outcome) in results {
            match outcome {
                Ok(()) => report.written += 1,
                Err(error) => {
                    tracing::warn!(
                        metric = %point.measurement,
                        timestamp = %point.time,
                        %error,
                        "point write failed"
                    );
                    report.failures.push(PointFailure {
                        metric: point.measurement,
                        timestamp: Some(point.time),
                        error,
                    });
                }
            }
        }
        report
    }

    async fn write_one(&self, point: &WritePoint) -> Result<(), WriteError> {
        match tokio::time::timeout(self.timeout, self.store.write(point)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(WriteError::Store(err.to_string())),
            Err(_) => Err(WriteError::Timeout(self.timeout)),
        }
    }
}

type Rejected = (Option<DateTime<Utc>>, WriteError);

fn prepare(
    building_id: &str,
    zone_id: &str,
    metric: &str,
    point: &SeriesPoint,
    origin: DateTime<Utc>,
) -> Result<WritePoint, Rejected> {
    let timestamp = point.at.resolve(origin).map_err(|err| (None, err))?;
    if metric.is_empty() {
        return Err((Some(timestamp), WriteError::BlankMetric));
    }
    if building_id.trim().is_empty() {
        return Err((Some(timestamp), WriteError::BlankIdentifier(BUILDING_TAG)));
    }
    if zone_id.trim().is_empty() {
        return Err((Some(timestamp), WriteError::BlankIdentifier(ZONE_TAG)));
    }
    if !point.value.is_finite() {
        return Err((
            Some(timestamp),
            WriteError::NonFinite {
                metric: metric.to_owned(),
                value: point.value,
            },
        ));
    }
    let prepared = WritePoint::new(metric, timestamp)
        .tag(BUILDING_TAG, building_id.trim())
        .tag(ZONE_TAG, zone_id.trim())
        .tag(SOURCE_TAG, SOURCE_VALUE)
        .field(VALUE_FIELD, FieldValue::Float(point.value));
    prepared
        .validate()
        .map_err(|err| (Some(timestamp), WriteError::Unencodable(err.to_string())))?;
    Ok(prepared)
}
