//! ---
//! ems_section: "04-data-processing"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Time-series query, aggregation, and fallback engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use twin_store::StoreError;

/// Request rejected before any store call is made. The only error callers see.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("window start {start} must be strictly before end {end}")]
    EmptyWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("window spans {requested_hours} hours which exceeds the maximum of {max_days} days")]
    RangeTooLarge { requested_hours: i64, max_days: u32 },
    #[error("resolution must be at least one minute")]
    ZeroResolution,
    #[error("at least one metric must be requested")]
    NoMetrics,
    #[error("building id must not be blank")]
    BlankBuilding,
    #[error("zone id must not be blank")]
    BlankZone,
    #[error("unknown metric '{0}'")]
    UnknownMetric(String),
    #[error("query could not be composed: {0}")]
    InvalidQuery(String),
}

/// Store read failure. Recovered by the fallback policy and never returned to callers.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure of one point on the write path.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WriteError {
    #[error("metric name must not be blank")]
    BlankMetric,
    #[error("{0} must not be blank")]
    BlankIdentifier(&'static str),
    #[error("value {value} for '{metric}' is not finite")]
    NonFinite { metric: String, value: f64 },
    #[error("offset {offset_seconds}s from origin is out of range")]
    TimestampOutOfRange { offset_seconds: i64 },
    #[error("point is not encodable: {0}")]
    Unencodable(String),
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("store rejected the point: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, ValidationError>;
