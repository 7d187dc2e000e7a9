//! ---
//! ems_section: "04-data-processing"
//! ems_subsection: "integration-tests"
//! ems_type: "test"
//! ems_scope: "code"
//! ems_description: "End-to-end read, fallback, and write behaviour of the time-series engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use twin_common::config::AppConfig;
use twin_logging::MemoryEventSink;
use twin_store::{FieldValue, MemoryStore, TelemetryStore, WritePoint};
use twin_timeseries::{
    resample, Metric, Provenance, QueryWindow, SeriesByMetric, SeriesPoint, TimeseriesService,
    ValidationError,
};

fn jan_first() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn day_window() -> QueryWindow {
    QueryWindow::new(jan_first(), jan_first() + ChronoDuration::days(1), 60)
}

fn reading(metric: &str, zone: &str, at: DateTime<Utc>, value: f64) -> WritePoint {
    WritePoint::new(metric, at)
        .tag("building_id", "hq")
        .tag("zone_id", zone)
        .field("value", FieldValue::Float(value))
}

fn service_over(store: Arc<MemoryStore>) -> Result<TimeseriesService> {
    let mut config = AppConfig::default();
    config.store.timeout = Duration::from_millis(250);
    config.fallback.seed = Some(42);
    TimeseriesService::new(config, store)
}

#[tokio::test]
async fn hourly_real_samples_come_back_one_to_one() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let source: Vec<f64> = (0..24).map(|hour| 20.0 + f64::from(hour) * 0.1).collect();
    for (hour, value) in source.iter().enumerate() {
        store.insert(reading(
            "temperature",
            "zone-core",
            jan_first() + ChronoDuration::hours(hour as i64),
            *value,
        ));
    }
    let service = service_over(store.clone())?;

    let series = service
        .get_metrics("hq", Some("zone-core"), &[Metric::Temperature], day_window())
        .await?;

    assert_eq!(series.len(), 1);
    let temperature = &series[0];
    assert_eq!(temperature.provenance(), Provenance::Real);
    assert_eq!(temperature.len(), 24);
    assert_eq!(temperature.values(), source);
    assert!(temperature
        .samples()
        .iter()
        .all(|sample| sample.provenance() == Provenance::Real));
    assert_eq!(store.query_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn connection_failure_degrades_to_bounded_synthetic_series() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.fail_reads("connection refused");
    let service = service_over(store)?;

    let series = service
        .get_metrics("hq", Some("zone-core"), &[Metric::Temperature], day_window())
        .await?;

    assert_eq!(series.len(), 1);
    let temperature = &series[0];
    assert_eq!(temperature.provenance(), Provenance::Synthetic);
    assert_eq!(temperature.len(), 24);
    for sample in temperature.samples() {
        assert_eq!(sample.provenance(), Provenance::Synthetic);
        assert!((20.0..=25.0).contains(&sample.value()));
    }
    Ok(())
}

#[tokio::test]
async fn slow_store_is_treated_as_a_failed_read() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.insert(reading("energy", "zone-core", jan_first(), 120.0));
    store.set_latency(Duration::from_secs(2));
    let service = service_over(store)?;

    let series = service
        .get_metrics("hq", Some("zone-core"), &[Metric::Energy], day_window())
        .await?;
    assert_eq!(series[0].provenance(), Provenance::Synthetic);
    Ok(())
}

#[tokio::test]
async fn mixed_responses_keep_per_pair_provenance() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.insert(reading("co2", "zone-east", jan_first() + ChronoDuration::minutes(10), 610.0));
    store.insert(reading("co2", "zone-east", jan_first() + ChronoDuration::minutes(40), 630.0));
    let service = service_over(store)?;

    let series = service
        .get_metrics("hq", None, &[Metric::Co2], day_window())
        .await?;
    assert_eq!(series.len(), 3);
    for pair in &series {
        match pair.zone_id() {
            "zone-east" => {
                assert_eq!(pair.provenance(), Provenance::Real);
                assert_eq!(pair.values()[0], 620.0);
                assert_eq!(pair.len(), 24);
            }
            _ => {
                assert_eq!(pair.provenance(), Provenance::Synthetic);
                assert!(pair.values().iter().all(|v| (400.0..=1000.0).contains(v)));
            }
        }
    }
    Ok(())
}

#[tokio::test]
async fn latest_uses_one_store_call_and_fills_missing_pairs() -> Result<()> {
    let now = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
    let store = Arc::new(MemoryStore::new());
    store.insert(reading("temperature", "zone-core", now - ChronoDuration::hours(3), 21.0));
    store.insert(reading("temperature", "zone-core", now - ChronoDuration::hours(1), 21.7));
    let sink = Arc::new(MemoryEventSink::new());
    let service = service_over(store.clone())?.with_event_sink(sink.clone());

    let latest = service.get_latest_at("hq", None, now).await?;

    assert_eq!(store.query_calls(), 1);
    assert_eq!(latest.len(), 12);
    assert_eq!(latest.count(Provenance::Real), 1);
    assert_eq!(latest.provenance(), Provenance::Real);
    let core = latest
        .get("zone-core", Metric::Temperature)
        .expect("zone-core temperature present");
    assert_eq!(core.value(), 21.7);
    assert_eq!(core.provenance(), Provenance::Real);
    for (zone, metric, value) in latest.iter() {
        if (zone, metric) != ("zone-core", Metric::Temperature) {
            assert_eq!(value.provenance(), Provenance::Synthetic);
            assert!(metric.default_bounds().contains(value.value()));
        }
    }
    assert_eq!(sink.named("timeseries.fallback").len(), 11);
    Ok(())
}

#[tokio::test]
async fn latest_call_count_does_not_grow_with_zones() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut config = AppConfig::default();
    config.zones.buildings.insert(
        "campus".into(),
        (0..25).map(|n| format!("zone-{n}")).collect(),
    );
    let service = TimeseriesService::new(config, store.clone())?;

    let latest = service.get_latest("campus", None).await?;
    assert_eq!(latest.len(), 100);
    assert_eq!(latest.provenance(), Provenance::Synthetic);
    assert_eq!(store.query_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn malformed_windows_are_rejected_before_any_store_call() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let service = service_over(store.clone())?;

    let mut empty = day_window();
    empty.end = empty.start;
    let err = service
        .get_metrics("hq", None, &[Metric::Temperature], empty)
        .await
        .unwrap_err();
    assert!(matches!(err, ValidationError::EmptyWindow { .. }));

    let mut reversed = day_window();
    reversed.start = reversed.end + ChronoDuration::hours(1);
    assert!(service
        .get_metrics("hq", None, &[Metric::Temperature], reversed)
        .await
        .is_err());

    let mut too_long = day_window();
    too_long.end = too_long.start + ChronoDuration::days(91);
    let err = service
        .get_metrics("hq", None, &[Metric::Temperature], too_long)
        .await
        .unwrap_err();
    assert!(matches!(err, ValidationError::RangeTooLarge { .. }));

    assert_eq!(store.query_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn served_series_are_fixed_points_of_the_resampler() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    for minute in [3, 9, 31, 58, 75, 190, 410] {
        store.insert(reading(
            "occupancy",
            "zone-west",
            jan_first() + ChronoDuration::minutes(minute),
            f64::from(minute as u32 % 7) / 10.0,
        ));
    }
    let service = service_over(store)?;
    let window = QueryWindow::new(jan_first(), jan_first() + ChronoDuration::hours(8), 30);

    let series = service
        .get_metrics("hq", Some("zone-west"), &[Metric::Occupancy], window)
        .await?;
    let served = &series[0];
    assert_eq!(served.provenance(), Provenance::Real);
    assert_eq!(&resample(served, &window), served);
    Ok(())
}

#[tokio::test]
async fn written_results_can_be_read_back() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let service = service_over(store.clone())?;

    let mut results = SeriesByMetric::new();
    results.insert(
        "energy".into(),
        (0..24)
            .map(|hour| SeriesPoint::offset(hour * 3_600, 100.0 + hour as f64))
            .collect(),
    );
    results.insert("occupancy".into(), vec![SeriesPoint::offset(0, f64::INFINITY)]);

    let report = service
        .store_results("hq", "zone-core", &results, jan_first())
        .await;
    assert_eq!(report.attempted, 25);
    assert_eq!(report.written, 24);
    assert_eq!(report.failed(), 1);

    let series = service
        .get_metrics("hq", Some("zone-core"), &[Metric::Energy], day_window())
        .await?;
    assert_eq!(series[0].provenance(), Provenance::Real);
    assert_eq!(series[0].values()[23], 123.0);

    let health = service.health().await;
    assert!(health.is_healthy());
    assert_eq!(health.store, store.name());
    Ok(())
}
