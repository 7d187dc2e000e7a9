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

use anyhow::Result;
use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, Opts};
use twin_metrics::SharedRegistry;

use crate::model::Provenance;

/// Prometheus families published by the time-series engine.
#[derive(Clone)]
pub struct TimeseriesMetrics {
    registry: SharedRegistry,
    store_queries_total: IntCounterVec,
    store_query_seconds: HistogramVec,
    series_served_total: IntCounterVec,
    write_points_total: IntCounterVec,
}

impl TimeseriesMetrics {
    /// Register the families against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let store_queries_total = IntCounterVec::new(
            Opts::new(
                "twin_store_queries_total",
                "Store reads issued, by request path and outcome",
            ),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(store_queries_total.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "twin_store_query_seconds",
            "Wall time of store reads including the timeout guard",
        )
        .buckets(prometheus::exponential_buckets(0.001, 2.0, 16)?);
        let store_query_seconds = HistogramVec::new(histogram_opts, &["kind"])?;
        registry.register(Box::new(store_query_seconds.clone()))?;

        let series_served_total = IntCounterVec::new(
            Opts::new(
                "twin_series_served_total",
                "Series and latest values returned to callers, by path and provenance",
            ),
            &["path", "provenance"],
        )?;
        registry.register(Box::new(series_served_total.clone()))?;

        let write_points_total = IntCounterVec::new(
            Opts::new(
                "twin_write_points_total",
                "Points handled by the write path, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(write_points_total.clone()))?;

        Ok(Self {
            registry,
            store_queries_total,
            store_query_seconds,
            series_served_total,
            write_points_total,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Record one store read and its latency.
    pub fn observe_query(&self, kind: &str, succeeded: bool, elapsed: Duration) {
        let outcome = if succeeded { "success" } else { "failure" };
        self.store_queries_total
            .with_label_values(&[kind, outcome])
            .inc();
        self.store_query_seconds
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_served(&self, path: &str, provenance: Provenance, count: usize) {
        self.series_served_total
            .with_label_values(&[path, provenance.as_str()])
            .inc_by(count as u64);
    }

    pub fn record_writes(&self, written: usize, failed: usize) {
        self.write_points_total
            .with_label_values(&["written"])
            .inc_by(written as u64);
        self.write_points_total
            .with_label_values(&["failed"])
            .inc_by(failed as u64);
    }
}

impl std::fmt::Debug for TimeseriesMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeseriesMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twin_metrics::{encode_text, new_registry};

    #[test]
    fn families_are_exported() {
        let metrics = TimeseriesMetrics::new(new_registry()).unwrap();
        metrics.observe_query("range", false, Duration::from_millis(12));
        metrics.record_served("range", Provenance::Synthetic, 3);
        metrics.record_writes(5, 1);

        let text = encode_text(&metrics.registry()).unwrap();
        assert!(text.contains("twin_store_queries_total{kind=\"range\",outcome=\"failure\"} 1"));
        assert!(text.contains("twin_series_served_total{path=\"range\",provenance=\"synthetic\"} 3"));
        assert!(text.contains("twin_write_points_total{outcome=\"failed\"} 1"));
        assert!(text.contains("twin_store_query_seconds_count{kind=\"range\"} 1"));
    }

    #[test]
    fn registering_twice_fails() {
        let registry = new_registry();
        TimeseriesMetrics::new(registry.clone()).unwrap();
        assert!(TimeseriesMetrics::new(registry).is_err());
    }
}
