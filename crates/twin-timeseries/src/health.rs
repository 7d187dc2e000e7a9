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

use serde::Serialize;
use twin_store::{HealthStatus, TelemetryStore};

/// Store reachability as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceHealth {
    pub store: String,
    pub status: HealthStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ServiceHealth {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Pass
    }
}

/// Ask the store for its own verdict. Errors and timeouts become a failing report.
pub async fn probe(store: &dyn TelemetryStore, timeout: Duration) -> ServiceHealth {
    let name = store.name().to_owned();
    match tokio::time::timeout(timeout, store.health()).await {
        Ok(Ok(health)) => ServiceHealth {
            store: name,
            status: health.status,
            message: health.message,
            version: health.version,
        },
        Ok(Err(err)) => ServiceHealth {
            store: name,
            status: HealthStatus::Fail,
            message: err.to_string(),
            version: None,
        },
        Err(_) => ServiceHealth {
            store: name,
            status: HealthStatus::Fail,
            message: format!("health check timed out after {:?}", timeout),
            version: None,
        },
    }
}
