//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry store adapters and query model."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::point::{RawRow, WritePoint};
use crate::query::{Selector, StoreQuery, FIELD_COLUMN, MEASUREMENT_COLUMN};
use crate::{HealthStatus, Result, StoreError, StoreHealth, TelemetryStore};

type WritePredicate = Arc<dyn Fn(&WritePoint) -> bool + Send + Sync>;

/// In-process store evaluating [`StoreQuery`] the way the real store would.
///
/// Counts every call, records the queries it received, and can be told to fail
/// reads, reject selected writes, or answer slowly.
#[derive(Default)]
pub struct MemoryStore {
    points: Mutex<Vec<WritePoint>>,
    received: Mutex<Vec<StoreQuery>>,
    read_failure: Mutex<Option<String>>,
    write_rejection: Mutex<Option<WritePredicate>>,
    latency: Mutex<Option<Duration>>,
    query_calls: AtomicUsize,
    write_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a point directly, bypassing call accounting.
    pub fn insert(&self, point: WritePoint) {
        self.points.lock().push(point);
    }

    /// Every point currently held.
    pub fn points(&self) -> Vec<WritePoint> {
        self.points.lock().clone()
    }

    /// Make every subsequent read fail as if the store were unreachable.
    pub fn fail_reads(&self, reason: impl Into<String>) {
        *self.read_failure.lock() = Some(reason.into());
    }

    pub fn restore_reads(&self) {
        *self.read_failure.lock() = None;
    }

    /// Reject writes for which `predicate` returns true.
    pub fn reject_writes_where<F>(&self, predicate: F)
    where
        F: Fn(&WritePoint) -> bool + Send + Sync + 'static,
    {
        *self.write_rejection.lock() = Some(Arc::new(predicate));
    }

    /// Delay every call by `latency` before answering.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Number of read calls received so far.
    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    /// Number of write calls received so far, including rejected ones.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Queries received so far, in arrival order.
    pub fn received_queries(&self) -> Vec<StoreQuery> {
        self.received.lock().clone()
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn evaluate(&self, query: &StoreQuery) -> Vec<RawRow> {
        let range = query.range();
        let mut rows: Vec<RawRow> = self
            .points
            .lock()
            .iter()
            .filter(|point| range.contains(point.time))
            .flat_map(expand_point)
            .filter(|row| {
                query
                    .filters()
                    .iter()
                    .all(|filter| filter.matches(column_value(row, filter.column())))
            })
            .collect();
        rows.sort_by_key(|row| row.time);

        match query.selector() {
            Selector::Raw => rows,
            Selector::LastPerSeries { group_by } => {
                let mut last: BTreeMap<Vec<Option<String>>, RawRow> = BTreeMap::new();
                for row in rows {
                    let key = group_by
                        .iter()
                        .map(|column| column_value(&row, column).map(str::to_owned))
                        .collect::<Vec<_>>();
                    last.insert(key, row);
                }
                last.into_values().collect()
            }
        }
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("points", &self.points.lock().len())
            .field("query_calls", &self.query_calls())
            .field("write_calls", &self.write_calls())
            .finish_non_exhaustive()
    }
}

fn expand_point(point: &WritePoint) -> Vec<RawRow> {
    point
        .fields
        .iter()
        .map(|(field, value)| RawRow {
            measurement: Some(point.measurement.clone()),
            field: Some(field.clone()),
            value: Some(value.clone()),
            time: Some(point.time),
            tags: point.tags.clone(),
        })
        .collect()
}

fn column_value<'a>(row: &'a RawRow, column: &str) -> Option<&'a str> {
    match column {
        MEASUREMENT_COLUMN => row.measurement.as_deref(),
        FIELD_COLUMN => row.field.as_deref(),
        tag => row.tag(tag),
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn query(&self, query: &StoreQuery) -> Result<Vec<RawRow>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.received.lock().push(query.clone());
        self.simulate_latency().await;
        let failure = self.read_failure.lock().clone();
        if let Some(reason) = failure {
            return Err(StoreError::Unavailable(reason));
        }
        Ok(self.evaluate(query))
    }

    async fn write(&self, point: &WritePoint) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        point.validate()?;
        let rejection = self.write_rejection.lock().clone();
        if let Some(predicate) = rejection {
            if predicate(point) {
                return Err(StoreError::Status {
                    status: 503,
                    message: format!("write rejected for '{}'", point.measurement),
                });
            }
        }
        self.points.lock().push(point.clone());
        Ok(())
    }

    async fn health(&self) -> Result<StoreHealth> {
        self.simulate_latency().await;
        let failure = self.read_failure.lock().clone();
        Ok(match failure {
            Some(reason) => StoreHealth {
                status: HealthStatus::Fail,
                message: reason,
                version: None,
            },
            None => StoreHealth {
                status: HealthStatus::Pass,
                message: "ready for queries and writes".into(),
                version: None,
            },
        })
    }
}
