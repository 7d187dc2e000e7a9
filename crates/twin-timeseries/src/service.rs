//! ---
//! ems_section: "04-data-processing"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Time-series query, aggregation, and fallback engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use twin_common::config::AppConfig;
use twin_logging::{EventSink, LogContext, SystemEventOutcome, TracingEventSink};
use twin_metrics::SharedRegistry;
use twin_store::{InfluxStore, TelemetryStore};

use crate::compose::{ComposedQuery, QueryComposer};
use crate::error::{Result, RetrievalError, ValidationError};
use crate::fallback::{decide, Decision, FallbackReason, Synthesizer};
use crate::health::{self, ServiceHealth};
use crate::latest::assemble_latest;
use crate::metrics::TimeseriesMetrics;
use crate::model::{LatestValueSet, Metric, MetricSeries, Provenance, QueryWindow};
use crate::resample::resample;
use crate::retrieval::{RetrievalClient, Retrieved};
use crate::write::{SeriesByMetric, WritePath, WriteReport};

const PATH_RANGE: &str = "range";
const PATH_LATEST: &str = "latest";
const PATH_WRITE: &str = "write";

/// Lifecycle of one read. Every read ends in `Returned`; there is no retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Composed,
    Executing,
    SucceededWithData,
    SucceededEmpty,
    Failed,
    Synthesizing,
    Returned,
}

impl QueryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryState::Composed => "composed",
            QueryState::Executing => "executing",
            QueryState::SucceededWithData => "succeeded_with_data",
            QueryState::SucceededEmpty => "succeeded_empty",
            QueryState::Failed => "failed",
            QueryState::Synthesizing => "synthesizing",
            QueryState::Returned => "returned",
        }
    }
}

/// Entry point used by the HTTP layer.
///
/// Reads always produce an answer: pairs the store cannot serve are filled with
/// synthetic data tagged as such. Only malformed requests are rejected.
pub struct TimeseriesService {
    store: Arc<dyn TelemetryStore>,
    config: AppConfig,
    composer: QueryComposer,
    synthesizer: Synthesizer,
    events: Arc<dyn EventSink>,
    metrics: Option<TimeseriesMetrics>,
}

impl TimeseriesService {
    /// Wire the service around an existing store handle.
    pub fn new(config: AppConfig, store: Arc<dyn TelemetryStore>) -> anyhow::Result<Self> {
        config.validate()?;
        let synthesizer =
            Synthesizer::new(&config.fallback).context("invalid fallback configuration")?;
        Ok(Self {
            store,
            composer: QueryComposer::new(&config),
            config,
            synthesizer,
            events: Arc::new(TracingEventSink),
            metrics: None,
        })
    }

    /// Build an InfluxDB-backed service from configuration, with metrics on a
    /// fresh registry when `metrics.enabled` is set.
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        Self::from_config_with_registry(config, twin_metrics::new_registry())
    }

    /// As [`from_config`](Self::from_config), registering metrics on `registry`.
    pub fn from_config_with_registry(
        config: AppConfig,
        registry: SharedRegistry,
    ) -> anyhow::Result<Self> {
        let store = InfluxStore::new(&config.store).context("failed to create store client")?;
        Self::new(config, Arc::new(store))?.register_metrics(registry)
    }

    /// Register [`TimeseriesMetrics`] on `registry` if the configuration enables them.
    pub fn register_metrics(self, registry: SharedRegistry) -> anyhow::Result<Self> {
        if !self.config.metrics.enabled {
            return Ok(self);
        }
        let metrics =
            TimeseriesMetrics::new(registry).context("failed to register timeseries metrics")?;
        Ok(self.with_metrics(metrics))
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: TimeseriesMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn synthesizer(&self) -> &Synthesizer {
        &self.synthesizer
    }

    pub fn metrics(&self) -> Option<&TimeseriesMetrics> {
        self.metrics.as_ref()
    }

    /// Historical series for every requested `(zone, metric)` pair, resampled to
    /// the window resolution. Pairs without real data come back synthetic.
    pub async fn get_metrics(
        &self,
        building_id: &str,
        zone_id: Option<&str>,
        metrics: &[Metric],
        window: QueryWindow,
    ) -> Result<Vec<MetricSeries>> {
        let composed = self
            .composer
            .compose_range(building_id, zone_id, metrics, &window)
            .map_err(|err| self.rejected(building_id, PATH_RANGE, err))?;
        let ctx = LogContext::new()
            .with_building(&composed.building_id)
            .with_path(PATH_RANGE);
        self.transition(&ctx, QueryState::Composed);

        let outcome = self.execute(&ctx, &composed, PATH_RANGE).await;
        let retrieved = outcome.as_ref();

        let mut served = Vec::with_capacity(composed.zones.len() * composed.metrics.len());
        for zone_id in &composed.zones {
            for metric in &composed.metrics {
                let pair = retrieved.map(|retrieved| retrieved.find(zone_id, *metric));
                let real = match (decide(pair, &composed.window), pair) {
                    (Decision::UseReal, Ok(Some(series))) => Some(resample(series, &composed.window)),
                    (Decision::UseSynthetic(reason), _) => {
                        self.fallback(&ctx, zone_id, *metric, reason);
                        None
                    }
                    (Decision::UseReal, _) => None,
                };
                served.push(real.unwrap_or_else(|| {
                    self.synthesizer.series(
                        &composed.building_id,
                        zone_id,
                        *metric,
                        &composed.window,
                    )
                }));
            }
        }

        self.transition(&ctx, QueryState::Returned);
        if let Some(metrics) = &self.metrics {
            for provenance in [Provenance::Real, Provenance::Synthetic] {
                let count = served
                    .iter()
                    .filter(|series| series.provenance() == provenance)
                    .count();
                metrics.record_served(PATH_RANGE, provenance, count);
            }
        }
        Ok(served)
    }

    /// Same as [`get_metrics`](Self::get_metrics) with metrics given by name.
    pub async fn get_metrics_by_name<S: AsRef<str>>(
        &self,
        building_id: &str,
        zone_id: Option<&str>,
        names: &[S],
        window: QueryWindow,
    ) -> Result<Vec<MetricSeries>> {
        let metrics = names
            .iter()
            .map(|name| Metric::parse_requested(name.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        self.get_metrics(building_id, zone_id, &metrics, window).await
    }

    /// Latest value of the fixed metric set for every requested zone, using one store read.
    pub async fn get_latest(
        &self,
        building_id: &str,
        zone_id: Option<&str>,
    ) -> Result<LatestValueSet> {
        self.get_latest_at(building_id, zone_id, Utc::now()).await
    }

    /// [`get_latest`](Self::get_latest) evaluated at a fixed instant.
    pub async fn get_latest_at(
        &self,
        building_id: &str,
        zone_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LatestValueSet> {
        let composed = self
            .composer
            .compose_latest(building_id, zone_id, &Metric::LATEST_SET, now)
            .map_err(|err| self.rejected(building_id, PATH_LATEST, err))?;
        let ctx = LogContext::new()
            .with_building(&composed.building_id)
            .with_path(PATH_LATEST);
        self.transition(&ctx, QueryState::Composed);

        let outcome = self.execute(&ctx, &composed, PATH_LATEST).await;
        let latest = assemble_latest(&composed, outcome.as_ref(), &self.synthesizer, now);
        for pair in &latest.filled {
            self.fallback(&ctx, &pair.zone_id, pair.metric, pair.reason);
        }

        self.transition(&ctx, QueryState::Returned);
        let overall = latest.values.provenance();
        self.events.record(
            &ctx,
            "timeseries.latest",
            &format!(
                "{} values, {} real, overall {}",
                latest.values.len(),
                latest.values.count(Provenance::Real),
                overall
            ),
            match overall {
                Provenance::Real => SystemEventOutcome::Success,
                Provenance::Synthetic => SystemEventOutcome::Degraded,
            },
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_served(
                PATH_LATEST,
                Provenance::Real,
                latest.values.count(Provenance::Real),
            );
            metrics.record_served(
                PATH_LATEST,
                Provenance::Synthetic,
                latest.values.count(Provenance::Synthetic),
            );
        }
        Ok(latest.values)
    }

    /// Persist externally produced series point by point. Never fails as a whole;
    /// per-point failures are listed in the report.
    pub async fn store_results(
        &self,
        building_id: &str,
        zone_id: &str,
        series: &SeriesByMetric,
        origin: DateTime<Utc>,
    ) -> WriteReport {
        let writer = WritePath::new(
            self.store.as_ref(),
            self.config.store.timeout,
            self.config.write.concurrency,
        );
        let report = writer
            .store_results(building_id, zone_id, series, origin)
            .await;

        let ctx = LogContext::new()
            .with_building(building_id)
            .with_zone(zone_id)
            .with_path(PATH_WRITE);
        let outcome = if report.is_complete() {
            SystemEventOutcome::Success
        } else if report.written > 0 {
            SystemEventOutcome::Degraded
        } else {
            SystemEventOutcome::Fault
        };
        self.events.record(
            &ctx,
            "timeseries.write",
            &format!(
                "{} of {} points written, {} failed",
                report.written,
                report.attempted,
                report.failed()
            ),
            outcome,
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_writes(report.written, report.failed());
        }
        report
    }

    /// Store reachability, checked under the store timeout.
    pub async fn health(&self) -> ServiceHealth {
        let report = health::probe(self.store.as_ref(), self.config.store.timeout).await;
        let ctx = LogContext::new().with_path("health");
        let outcome = if report.is_healthy() {
            SystemEventOutcome::Success
        } else {
            SystemEventOutcome::Fault
        };
        self.events
            .record(&ctx, "timeseries.health", &report.message, outcome);
        report
    }

    async fn execute(
        &self,
        ctx: &LogContext<'_>,
        composed: &ComposedQuery,
        kind: &str,
    ) -> std::result::Result<Retrieved, RetrievalError> {
        self.transition(ctx, QueryState::Executing);
        let started = Instant::now();
        let client = RetrievalClient::new(self.store.as_ref(), self.config.store.timeout);
        let outcome = client.fetch(composed).await;
        if let Some(metrics) = &self.metrics {
            metrics.observe_query(kind, outcome.is_ok(), started.elapsed());
        }

        match &outcome {
            Ok(retrieved) if retrieved.sample_count() > 0 => {
                if retrieved.skipped > 0 {
                    self.events.record(
                        ctx,
                        "timeseries.rows_skipped",
                        &format!("{} of {} rows could not be adapted", retrieved.skipped, retrieved.rows),
                        SystemEventOutcome::Degraded,
                    );
                }
                self.transition(ctx, QueryState::SucceededWithData);
            }
            Ok(_) => self.transition(ctx, QueryState::SucceededEmpty),
            Err(err) => {
                self.events.record(
                    ctx,
                    "timeseries.retrieval_failed",
                    &err.to_string(),
                    SystemEventOutcome::Degraded,
                );
                self.transition(ctx, QueryState::Failed);
            }
        }
        outcome
    }

    fn fallback(&self, ctx: &LogContext<'_>, zone_id: &str, metric: Metric, reason: FallbackReason) {
        let pair_ctx = ctx.clone().with_zone(zone_id).with_metric(metric.as_str());
        self.transition(&pair_ctx, QueryState::Synthesizing);
        self.events.record(
            &pair_ctx,
            "timeseries.fallback",
            reason.as_str(),
            SystemEventOutcome::Degraded,
        );
    }

    fn transition(&self, ctx: &LogContext<'_>, state: QueryState) {
        let outcome = match state {
            QueryState::Failed | QueryState::Synthesizing => SystemEventOutcome::Degraded,
            _ => SystemEventOutcome::Success,
        };
        self.events
            .record(ctx, "timeseries.state", state.as_str(), outcome);
    }

    fn rejected(&self, building_id: &str, path: &str, err: ValidationError) -> ValidationError {
        let ctx = LogContext::new().with_building(building_id).with_path(path);
        self.events
            .record(&ctx, "timeseries.rejected", &err.to_string(), SystemEventOutcome::Fault);
        err
    }
}

impl std::fmt::Debug for TimeseriesService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeseriesService")
            .field("store", &self.store.name())
            .field("bucket", &self.config.store.bucket)
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use twin_logging::MemoryEventSink;
    use twin_store::{FieldValue, MemoryStore, WritePoint};

    fn day() -> QueryWindow {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        QueryWindow::new(start, start + Duration::days(1), 60)
    }

    fn service(store: Arc<MemoryStore>, sink: Arc<MemoryEventSink>) -> TimeseriesService {
        TimeseriesService::new(AppConfig::default(), store)
            .unwrap()
            .with_event_sink(sink)
    }

    #[tokio::test]
    async fn state_events_follow_the_read_lifecycle() {
        let store = Arc::new(MemoryStore::new());
        store.insert(
            WritePoint::new("energy", day().start)
                .tag("building_id", "hq")
                .tag("zone_id", "zone-core")
                .field("value", FieldValue::Float(120.0)),
        );
        let sink = Arc::new(MemoryEventSink::new());
        let service = service(store, sink.clone());

        let series = service
            .get_metrics("hq", Some("zone-core"), &[Metric::Energy], day())
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].provenance(), Provenance::Real);

        let states: Vec<String> = sink
            .named("timeseries.state")
            .into_iter()
            .map(|event| event.message)
            .collect();
        assert_eq!(
            states,
            vec!["composed", "executing", "succeeded_with_data", "returned"]
        );
    }

    #[tokio::test]
    async fn failed_reads_synthesize_every_pair() {
        let store = Arc::new(MemoryStore::new());
        store.fail_reads("connection refused");
        let sink = Arc::new(MemoryEventSink::new());
        let service = service(store, sink.clone());

        let series = service
            .get_metrics("hq", None, &[Metric::Temperature, Metric::Occupancy], day())
            .await
            .unwrap();
        assert_eq!(series.len(), 6);
        assert!(series
            .iter()
            .all(|series| series.provenance() == Provenance::Synthetic && series.len() == 24));

        let fallbacks = sink.named("timeseries.fallback");
        assert_eq!(fallbacks.len(), 6);
        assert!(fallbacks.iter().all(|event| event.message == "retrieval_failed"));
        assert_eq!(sink.named("timeseries.retrieval_failed").len(), 1);
        assert!(sink
            .named("timeseries.state")
            .iter()
            .any(|event| event.message == "failed"));
    }

    #[tokio::test]
    async fn rejected_requests_are_reported() {
        let sink = Arc::new(MemoryEventSink::new());
        let service = service(Arc::new(MemoryStore::new()), sink.clone());
        let err = service
            .get_metrics_by_name("hq", None, &["pressure"], day())
            .await
            .unwrap_err();
        assert_eq!(err, ValidationError::UnknownMetric("pressure".into()));

        let err = service.get_latest("", None).await.unwrap_err();
        assert_eq!(err, ValidationError::BlankBuilding);
        assert_eq!(sink.named("timeseries.rejected").len(), 1);
    }

    #[tokio::test]
    async fn metrics_count_served_provenance() {
        let registry = twin_metrics::new_registry();
        let metrics = TimeseriesMetrics::new(registry.clone()).unwrap();
        let store = Arc::new(MemoryStore::new());
        let service = TimeseriesService::new(AppConfig::default(), store)
            .unwrap()
            .with_metrics(metrics);

        service
            .get_metrics("hq", Some("zone-west"), &[Metric::Co2], day())
            .await
            .unwrap();
        let text = twin_metrics::encode_text(&registry).unwrap();
        assert!(text.contains("twin_series_served_total{path=\"range\",provenance=\"synthetic\"} 1"));
        assert!(text.contains("twin_store_queries_total{kind=\"range\",outcome=\"success\"} 1"));
    }

    #[tokio::test]
    async fn metrics_section_controls_registration() {
        let registry = twin_metrics::new_registry();
        let store = Arc::new(MemoryStore::new());
        let service = TimeseriesService::new(AppConfig::default(), store.clone())
            .unwrap()
            .register_metrics(registry.clone())
            .unwrap();
        assert!(service.metrics().is_some());
        service.get_latest("hq", Some("zone-core")).await.unwrap();
        let text = twin_metrics::encode_text(&registry).unwrap();
        assert!(text.contains("twin_series_served_total{path=\"latest\",provenance=\"synthetic\"} 4"));

        let mut config = AppConfig::default();
        config.metrics.enabled = false;
        let quiet_registry = twin_metrics::new_registry();
        let quiet = TimeseriesService::new(config, store)
            .unwrap()
            .register_metrics(quiet_registry.clone())
            .unwrap();
        assert!(quiet.metrics().is_none());
        quiet.get_latest("hq", Some("zone-core")).await.unwrap();
        assert!(twin_metrics::family_names(&quiet_registry).is_empty());
    }

    #[test]
    fn from_config_follows_the_metrics_switch() {
        let registry = twin_metrics::new_registry();
        let service =
            TimeseriesService::from_config_with_registry(AppConfig::default(), registry.clone())
                .unwrap();
        assert!(service.metrics().is_some());
        assert!(TimeseriesMetrics::new(registry).is_err());

        let mut config = AppConfig::default();
        config.metrics.enabled = false;
        assert!(TimeseriesService::from_config(config)
            .unwrap()
            .metrics()
            .is_none());
    }

    #[test]
    fn unknown_bound_overrides_fail_construction() {
        let mut config = AppConfig::default();
        config.fallback.bounds.insert(
            "pressure".into(),
            twin_common::config::BoundsConfig { min: 0.0, max: 1.0 },
        );
        assert!(TimeseriesService::new(config, Arc::new(MemoryStore::new())).is_err());
    }
}
