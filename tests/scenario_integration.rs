//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Cross-crate scenarios from configuration to served series."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use tempfile::NamedTempFile;
use twin_common::AppConfig;
use twin_logging::{MemoryEventSink, SystemEventOutcome};
use twin_store::{FieldValue, MemoryStore, WritePoint};
use twin_timeseries::{
    Metric, Provenance, QueryWindow, SeriesByMetric, SeriesPoint, TimeseriesMetrics,
    TimeseriesService,
};

const CONFIG: &str = r#"
[store]
url = "http://influx.internal:8086"
org = "digital-twin"
bucket = "building_telemetry"
timeout = 2

[query]
max_range_days = 14
default_resolution_minutes = 15
latest_lookback_days = 7

[zones]
default = ["zone-core", "zone-east", "zone-west"]

[zones.buildings]
annex = ["lobby", "lab"]

[fallback]
seed = 1234

[fallback.bounds]
humidity = { min = 35.0, max = 45.0 }

[write]
concurrency = 4
"#;

fn config() -> Result<AppConfig> {
    let mut config: AppConfig = CONFIG.parse()?;
    config.apply_overrides_from(|_| None);
    Ok(config)
}

#[tokio::test]
async fn configured_limits_and_zones_drive_the_engine() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let start = Utc.with_ymd_and_hms(2024, 5, 6, 0, 0, 0)
        .single()
        .expect("valid date");
    store.insert(
        WritePoint::new("humidity", start + Duration::minutes(20))
            .tag("building_id", "annex")
            .tag("zone_id", "lab")
            .tag("floor", "2")
            .field("value", FieldValue::Float(52.0)),
    );
    let sink = Arc::new(MemoryEventSink::new());
    let service = TimeseriesService::new(config()?, store.clone())?.with_event_sink(sink.clone());

    let window = QueryWindow::new(start, start + Duration::hours(2), 15);
    let series = service
        .get_metrics("annex", None, &[Metric::Humidity], window)
        .await?;
    assert_eq!(series.len(), 2);
    let lab = series.iter().find(|s| s.zone_id() == "lab").expect("lab series");
    let lobby = series.iter().find(|s| s.zone_id() == "lobby").expect("lobby series");

    assert_eq!(lab.provenance(), Provenance::Real);
    assert_eq!(lab.timestamps()[0], start + Duration::minutes(15));
    assert_eq!(lab.len(), 7);
    assert!(lab.values().iter().all(|value| *value == 52.0));

    assert_eq!(lobby.provenance(), Provenance::Synthetic);
    assert_eq!(lobby.len(), 8);
    assert!(lobby.values().iter().all(|value| (35.0..=45.0).contains(value)));

    let too_long = QueryWindow::new(start, start + Duration::days(15), 60);
    assert!(service
        .get_metrics("annex", None, &[Metric::Humidity], too_long)
        .await
        .is_err());
    assert_eq!(store.query_calls(), 1);

    let fallbacks = sink.named("timeseries.fallback");
    assert_eq!(fallbacks.len(), 1);
    assert_eq!(fallbacks[0].zone.as_deref(), Some("lobby"));
    assert_eq!(fallbacks[0].outcome, SystemEventOutcome::Degraded);
    Ok(())
}

#[tokio::test]
async fn configuration_file_round_trips_into_a_working_service() -> Result<()> {
    let mut file = NamedTempFile::new()?;
    file.write_all(CONFIG.as_bytes())?;
    file.flush()?;

    let mut config = AppConfig::load(&[file.path()])?;
    config.apply_overrides_from(|key| match key {
        "INFLUXDB_BUCKET" => Some("override_bucket".to_owned()),
        _ => None,
    });
    assert_eq!(config.store.bucket, "override_bucket");
    assert_eq!(config.zones_for("annex"), ["lobby".to_owned(), "lab".to_owned()]);

    let store = Arc::new(MemoryStore::new());
    let service = TimeseriesService::new(config, store.clone())?;
    let now = Utc::now();
    service.get_latest_at("annex", Some("lab"), now).await?;

    let queries = store.received_queries();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].bucket(), "override_bucket");
    assert_eq!(queries[0].range().start, now - Duration::days(7));
    Ok(())
}

#[tokio::test]
async fn simulation_output_feeds_latest_values_and_metrics() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let registry = twin_metrics::new_registry();
    let service = TimeseriesService::new(config()?, store.clone())?
        .with_metrics(TimeseriesMetrics::new(registry.clone())?);

    let origin = Utc::now() - Duration::hours(6);
    let mut results = SeriesByMetric::new();
    for (metric, base) in [("temperature", 21.0), ("energy", 130.0), ("occupancy", 0.5), ("co2", 520.0)] {
        results.insert(
            metric.to_owned(),
            (0..6)
                .map(|hour| SeriesPoint::offset(hour * 3_600, base + hour as f64 * 0.01))
                .collect(),
        );
    }
    let report = service
        .store_results("hq", "zone-east", &results, origin)
        .await;
    assert!(report.is_complete());
    assert_eq!(report.written, 24);

    let latest = service.get_latest("hq", None).await?;
    assert_eq!(latest.len(), 12);
    assert_eq!(latest.count(Provenance::Real), 4);
    assert_eq!(latest.provenance(), Provenance::Real);
    let energy = latest.get("zone-east", Metric::Energy).expect("energy present");
    assert!((energy.value() - 130.05).abs() < 1e-9);
    assert_eq!(energy.timestamp(), Some(origin + Duration::hours(5)));

    let rendered = serde_json::to_value(&latest)?;
    assert_eq!(
        rendered["zones"]["zone-east"]["energy"]["provenance"],
        "real"
    );
    assert_eq!(
        rendered["zones"]["zone-west"]["co2"]["provenance"],
        "synthetic"
    );

    let text = twin_metrics::encode_text(&registry)?;
    assert!(text.contains("twin_write_points_total{outcome=\"written\"} 24"));
    assert!(text.contains("twin_series_served_total{path=\"latest\",provenance=\"real\"} 4"));
    Ok(())
}
