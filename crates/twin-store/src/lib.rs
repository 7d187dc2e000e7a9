//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry store adapters and query model."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Store boundary for the building telemetry engine.
//!
//! Reads are described by a typed [`StoreQuery`] and answered with schema-less
//! [`RawRow`]s; writes take one [`WritePoint`] at a time. [`InfluxStore`] talks to
//! InfluxDB 2.x over HTTP and [`MemoryStore`] is a substitutable in-process store
//! with call counting and fault injection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod influx;
pub mod memory;
pub mod point;
pub mod query;

pub use influx::{parse_annotated_csv, InfluxStore};
pub use memory::MemoryStore;
pub use point::{FieldValue, RawRow, WritePoint};
pub use query::{
    flux_string, Selector, StoreQuery, StoreQueryBuilder, TagFilter, TimeRange, FIELD_COLUMN,
    MEASUREMENT_COLUMN,
};

/// Result alias used throughout the store crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type for store adapters.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The configured store url could not be parsed.
    #[error("invalid store url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    /// Connection, TLS, or client-side timeout failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The store answered with a non-success status.
    #[error("store responded with status {status}: {message}")]
    Status { status: u16, message: String },
    /// The response body could not be decoded.
    #[error("failed to decode store response: {0}")]
    Decode(String),
    /// The query is structurally invalid and was not sent.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// The point is structurally invalid and was not sent.
    #[error("invalid point: {0}")]
    InvalidPoint(String),
    /// The store is not reachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Health verdict reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Pass,
    Fail,
}

/// Result of a store health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHealth {
    pub status: HealthStatus,
    pub message: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Read/write boundary of the telemetry store. Implementations must tolerate
/// concurrent use from independent requests.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Short identifier used in logs and health reports.
    fn name(&self) -> &str;

    /// Execute one read request.
    async fn query(&self, query: &StoreQuery) -> Result<Vec<RawRow>>;

    /// Persist one point.
    async fn write(&self, point: &WritePoint) -> Result<()>;

    /// Report the store's own health verdict.
    async fn health(&self) -> Result<StoreHealth>;
}
