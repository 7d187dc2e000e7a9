//! ---
//! ems_section: "04-data-processing"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Time-series query, aggregation, and fallback engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Time-series query and fallback engine for building telemetry.
//!
//! Reads go `compose -> retrieve -> (resample | synthesize)`: one store query per
//! request, rows adapted into typed samples, and every `(zone, metric)` pair the
//! store cannot serve replaced by a bounded synthetic series tagged as such.
//! [`TimeseriesService`] is the facade consumed by the HTTP layer.

pub mod compose;
pub mod error;
pub mod fallback;
pub mod health;
pub mod latest;
pub mod metrics;
pub mod model;
pub mod resample;
pub mod retrieval;
pub mod service;
pub mod write;

pub use compose::{ComposedQuery, QueryComposer};
pub use error::{RetrievalError, ValidationError, WriteError};
pub use fallback::{decide, Decision, FallbackReason, Synthesizer};
pub use health::ServiceHealth;
pub use metrics::TimeseriesMetrics;
pub use model::{
    Aggregation, Bounds, LatestValue, LatestValueSet, Metric, MetricSample, MetricSeries,
    Provenance, QueryWindow,
};
pub use resample::resample;
pub use retrieval::{sample_from_row, RetrievalClient, Retrieved};
pub use service::{QueryState, TimeseriesService};
pub use write::{PointFailure, PointTime, SeriesByMetric, SeriesPoint, WritePath, WriteReport};
