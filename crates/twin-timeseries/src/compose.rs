//! ---
//! ems_section: "04-data-processing"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Time-series query, aggregation, and fallback engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Query composition.
//!
//! Both read paths collapse every requested zone and metric into a single
//! [`StoreQuery`], so a request costs one store round trip no matter how many
//! pairs it covers.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use twin_common::config::{AppConfig, QueryConfig};
use twin_store::{StoreQuery, MEASUREMENT_COLUMN};

use crate::error::{Result, ValidationError};
use crate::model::{Metric, QueryWindow};

pub const BUILDING_TAG: &str = "building_id";
pub const ZONE_TAG: &str = "zone_id";
pub const VALUE_FIELD: &str = "value";

/// A composed read plus the request context needed to interpret its rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedQuery {
    pub building_id: String,
    pub zones: Vec<String>,
    pub metrics: Vec<Metric>,
    pub window: QueryWindow,
    pub query: StoreQuery,
}

/// Builds store queries from request parameters and configured limits.
#[derive(Debug, Clone)]
pub struct QueryComposer {
    config: AppConfig,
}

impl QueryComposer {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn limits(&self) -> &QueryConfig {
        &self.config.query
    }

    pub fn max_range(&self) -> StdDuration {
        StdDuration::from_secs(u64::from(self.limits().max_range_days) * 86_400)
    }

    /// Zones a request covers: the named zone, or every zone known for the building.
    pub fn zones_for(&self, building_id: &str, zone_id: Option<&str>) -> Result<Vec<String>> {
        match zone_id {
            Some(zone) if zone.trim().is_empty() => Err(ValidationError::BlankZone),
            Some(zone) => Ok(vec![zone.trim().to_owned()]),
            None => {
                let mut zones: Vec<String> = Vec::new();
                for zone in self.config.zones_for(building_id) {
                    let zone = zone.trim();
                    if !zone.is_empty() && !zones.iter().any(|known| known == zone) {
                        zones.push(zone.to_owned());
                    }
                }
                if zones.is_empty() {
                    return Err(ValidationError::BlankZone);
                }
                Ok(zones)
            }
        }
    }

    /// Range read of raw samples for every `(zone, metric)` pair in the window.
    pub fn compose_range(
        &self,
        building_id: &str,
        zone_id: Option<&str>,
        metrics: &[Metric],
        window: &QueryWindow,
    ) -> Result<ComposedQuery> {
        let building_id = checked_building(building_id)?;
        window.validate(self.max_range())?;
        let metrics = distinct(metrics)?;
        let zones = self.zones_for(building_id, zone_id)?;

        let query = self
            .base(building_id, &zones, &metrics)
            .range(window.start, window.end)
            .build()
            .map_err(|err| ValidationError::InvalidQuery(err.to_string()))?;

        Ok(ComposedQuery {
            building_id: building_id.to_owned(),
            zones,
            metrics,
            window: *window,
            query,
        })
    }

    /// Last sample per `(zone, metric)` over the configured lookback ending at `now`.
    pub fn compose_latest(
        &self,
        building_id: &str,
        zone_id: Option<&str>,
        metrics: &[Metric],
        now: DateTime<Utc>,
    ) -> Result<ComposedQuery> {
        let building_id = checked_building(building_id)?;
        let metrics = distinct(metrics)?;
        let zones = self.zones_for(building_id, zone_id)?;
        let window = QueryWindow::new(
            now - Duration::days(i64::from(self.limits().latest_lookback_days)),
            now,
            self.limits().default_resolution_minutes,
        );
        window.validate(self.max_range())?;

        let query = self
            .base(building_id, &zones, &metrics)
            .range(window.start, window.end)
            .last_per_series([ZONE_TAG, MEASUREMENT_COLUMN])
            .build()
            .map_err(|err| ValidationError::InvalidQuery(err.to_string()))?;

        Ok(ComposedQuery {
            building_id: building_id.to_owned(),
            zones,
            metrics,
            window,
            query,
        })
    }

    fn base(
        &self,
        building_id: &str,
        zones: &[String],
        metrics: &[Metric],
    ) -> twin_store::StoreQueryBuilder {
        StoreQuery::builder(self.config.store.bucket.as_str())
            .tag_eq(BUILDING_TAG, building_id)
            .tag_in(ZONE_TAG, zones.iter().cloned())
            .measurement_in(metrics.iter().map(Metric::as_str))
            .field(VALUE_FIELD)
    }
}

fn checked_building(building_id: &str) -> Result<&str> {
    let trimmed = building_id.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::BlankBuilding);
    }
    Ok(trimmed)
}

fn distinct(metrics: &[Metric]) -> Result<Vec<Metric>> {
    if metrics.is_empty() {
        return Err(ValidationError::NoMetrics);
    }
    let mut out: Vec<Metric> = Vec::with_capacity(metrics.len());
    for metric in metrics {
        if !out.contains(metric) {
            out.push(*metric);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use twin_store::{Selector, TagFilter, FIELD_COLUMN};

    fn day() -> QueryWindow {
        QueryWindow::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            60,
        )
    }

    fn composer() -> QueryComposer {
        QueryComposer::new(&AppConfig::default())
    }

    #[test]
    fn range_query_batches_all_known_zones() {
        let composed = composer()
            .compose_range("hq", None, &[Metric::Temperature, Metric::Co2], &day())
            .unwrap();
        assert_eq!(composed.zones, vec!["zone-core", "zone-east", "zone-west"]);
        let query = &composed.query;
        assert_eq!(query.bucket(), "building_telemetry");
        assert_eq!(
            query.filter_for(BUILDING_TAG),
            Some(&TagFilter::Equals {
                column: BUILDING_TAG.into(),
                value: "hq".into()
            })
        );
        assert_eq!(
            query.filter_for(MEASUREMENT_COLUMN),
            Some(&TagFilter::In {
                column: MEASUREMENT_COLUMN.into(),
                values: vec!["temperature".into(), "co2".into()]
            })
        );
        assert!(query.filter_for(FIELD_COLUMN).is_some());
        assert_eq!(query.selector(), &Selector::Raw);
        assert_eq!(query.range().start, day().start);
    }

    #[test]
    fn named_zone_narrows_membership() {
        let composed = composer()
            .compose_range("hq", Some("zone-east"), &[Metric::Energy], &day())
            .unwrap();
        assert_eq!(composed.zones, vec!["zone-east"]);
    }

    #[test]
    fn repeated_configured_zones_are_composed_once() {
        let mut config = AppConfig::default();
        config.zones.default = vec!["a".into(), "a".into(), " b ".into(), "b".into()];
        let composed = QueryComposer::new(&config)
            .compose_range("hq", None, &[Metric::Energy], &day())
            .unwrap();
        assert_eq!(composed.zones, vec!["a", "b"]);
    }

    #[test]
    fn per_building_zone_lists_are_used() {
        let mut config = AppConfig::default();
        config
            .zones
            .buildings
            .insert("annex".into(), vec!["lobby".into(), "lab".into()]);
        let composed = QueryComposer::new(&config)
            .compose_range("annex", None, &[Metric::Energy], &day())
            .unwrap();
        assert_eq!(composed.zones, vec!["lobby", "lab"]);
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let composer = composer();
        let mut window = day();
        window.end = window.start;
        assert!(matches!(
            composer.compose_range("hq", None, &[Metric::Energy], &window),
            Err(ValidationError::EmptyWindow { .. })
        ));

        let mut window = day();
        window.end = window.start + Duration::days(120);
        assert!(matches!(
            composer.compose_range("hq", None, &[Metric::Energy], &window),
            Err(ValidationError::RangeTooLarge { .. })
        ));

        assert_eq!(
            composer.compose_range("hq", None, &[], &day()),
            Err(ValidationError::NoMetrics)
        );
        assert_eq!(
            composer.compose_range("  ", None, &[Metric::Energy], &day()),
            Err(ValidationError::BlankBuilding)
        );
        assert_eq!(
            composer.compose_range("hq", Some(""), &[Metric::Energy], &day()),
            Err(ValidationError::BlankZone)
        );
    }

    #[test]
    fn latest_query_groups_by_zone_and_measurement() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let composed = composer()
            .compose_latest("hq", None, &Metric::LATEST_SET, now)
            .unwrap();
        assert_eq!(composed.window.end, now);
        assert_eq!(composed.window.start, now - Duration::days(30));
        assert_eq!(
            composed.query.selector(),
            &Selector::LastPerSeries {
                group_by: vec![ZONE_TAG.into(), MEASUREMENT_COLUMN.into()]
            }
        );
        assert_eq!(composed.metrics.len(), 4);
    }
}
