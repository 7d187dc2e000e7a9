//! ---
//! ems_section: "04-data-processing"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Time-series query, aggregation, and fallback engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::error::{Result, ValidationError};

/// Telemetry channel stored as one measurement per metric.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Metric {
    Temperature,
    Energy,
    Occupancy,
    Co2,
    Humidity,
}

/// How raw samples inside one bucket collapse into a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Continuous quantities.
    Mean,
    /// State-like quantities.
    Last,
}

impl Metric {
    /// Metrics returned by the latest-value path.
    pub const LATEST_SET: [Metric; 4] = [
        Metric::Temperature,
        Metric::Energy,
        Metric::Occupancy,
        Metric::Co2,
    ];

    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Parse a measurement name, ignoring case and surrounding whitespace.
    pub fn from_name(name: &str) -> Option<Self> {
        name.trim().parse().ok()
    }

    /// Parse a requested metric name or reject it.
    pub fn parse_requested(name: &str) -> Result<Self> {
        Self::from_name(name).ok_or_else(|| ValidationError::UnknownMetric(name.to_owned()))
    }

    pub fn aggregation(&self) -> Aggregation {
        match self {
            Metric::Occupancy => Aggregation::Last,
            Metric::Temperature | Metric::Energy | Metric::Co2 | Metric::Humidity => {
                Aggregation::Mean
            }
        }
    }

    /// Built-in plausible range used for synthetic values.
    pub fn default_bounds(&self) -> Bounds {
        match self {
            Metric::Temperature => Bounds::new(20.0, 25.0),
            Metric::Energy => Bounds::new(100.0, 150.0),
            Metric::Occupancy => Bounds::new(0.3, 0.7),
            Metric::Co2 => Bounds::new(400.0, 1000.0),
            Metric::Humidity => Bounds::new(30.0, 60.0),
        }
    }
}

/// Inclusive value range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    pub fn midpoint(&self) -> f64 {
        (self.min + self.max) / 2.0
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }
}

/// Where a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, IntoStaticStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Provenance {
    Real,
    Synthetic,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Requested time window and output resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub resolution_minutes: u32,
}

impl QueryWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, resolution_minutes: u32) -> Self {
        Self {
            start,
            end,
            resolution_minutes,
        }
    }

    /// Check ordering, resolution, and the maximum span. `start == end` is rejected.
    pub fn validate(&self, max_range: StdDuration) -> Result<()> {
        if self.start >= self.end {
            return Err(ValidationError::EmptyWindow {
                start: self.start,
                end: self.end,
            });
        }
        if self.resolution_minutes == 0 {
            return Err(ValidationError::ZeroResolution);
        }
        let span = self.end - self.start;
        let too_large = match Duration::from_std(max_range) {
            Ok(max) => span > max,
            Err(_) => false,
        };
        if too_large {
            return Err(ValidationError::RangeTooLarge {
                requested_hours: span.num_hours(),
                max_days: (max_range.as_secs() / 86_400) as u32,
            });
        }
        Ok(())
    }

    pub fn resolution(&self) -> Duration {
        Duration::minutes(i64::from(self.resolution_minutes))
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    /// Number of buckets covering `[start, end)`; a trailing partial bucket counts.
    pub fn bucket_count(&self) -> usize {
        let width = self.resolution().num_milliseconds();
        let span = (self.end - self.start).num_milliseconds();
        if width <= 0 || span <= 0 {
            return 0;
        }
        ((span + width - 1) / width) as usize
    }

    /// Bucket index of `at`, if it falls inside the window.
    pub fn bucket_of(&self, at: DateTime<Utc>) -> Option<usize> {
        if !self.contains(at) {
            return None;
        }
        let width = self.resolution().num_milliseconds();
        if width <= 0 {
            return None;
        }
        Some(((at - self.start).num_milliseconds() / width) as usize)
    }

    pub fn bucket_start(&self, index: usize) -> DateTime<Utc> {
        self.start + self.resolution() * index as i32
    }

    /// Start of every bucket in the window, ascending.
    pub fn bucket_starts(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        (0..self.bucket_count()).map(move |index| self.bucket_start(index))
    }
}

/// One value of one metric in one zone at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    building_id: String,
    zone_id: String,
    metric: Metric,
    timestamp: DateTime<Utc>,
    value: f64,
    provenance: Provenance,
}

impl MetricSample {
    pub(crate) fn new(
        building_id: impl Into<String>,
        zone_id: impl Into<String>,
        metric: Metric,
        timestamp: DateTime<Utc>,
        value: f64,
        provenance: Provenance,
    ) -> Self {
        Self {
            building_id: building_id.into(),
            zone_id: zone_id.into(),
            metric,
            timestamp,
            value,
            provenance,
        }
    }

    pub fn building_id(&self) -> &str {
        &self.building_id
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }
}

/// Time-ascending samples of one `(zone, metric)` pair sharing one provenance.
///
/// Series are only created by the store read path or by the synthesizer, so the
/// provenance of every sample always matches where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSeries {
    building_id: String,
    zone_id: String,
    metric: Metric,
    provenance: Provenance,
    samples: Vec<MetricSample>,
}

impl MetricSeries {
    pub(crate) fn real<I>(building_id: &str, zone_id: &str, metric: Metric, points: I) -> Self
    where
        I: IntoIterator<Item = (DateTime<Utc>, f64)>,
    {
        Self::build(building_id, zone_id, metric, Provenance::Real, points)
    }

    pub(crate) fn synthetic<I>(building_id: &str, zone_id: &str, metric: Metric, points: I) -> Self
    where
        I: IntoIterator<Item = (DateTime<Utc>, f64)>,
    {
        Self::build(building_id, zone_id, metric, Provenance::Synthetic, points)
    }

    /// Same identity and provenance, different points.
    pub(crate) fn with_points<I>(&self, points: I) -> Self
    where
        I: IntoIterator<Item = (DateTime<Utc>, f64)>,
    {
        Self::build(
            &self.building_id,
            &self.zone_id,
            self.metric,
            self.provenance,
            points,
        )
    }

    fn build<I>(
        building_id: &str,
        zone_id: &str,
        metric: Metric,
        provenance: Provenance,
        points: I,
    ) -> Self
    where
        I: IntoIterator<Item = (DateTime<Utc>, f64)>,
    {
        let mut samples: Vec<MetricSample> = points
            .into_iter()
            .map(|(timestamp, value)| {
                MetricSample::new(building_id, zone_id, metric, timestamp, value, provenance)
            })
            .collect();
        samples.sort_by_key(MetricSample::timestamp);
        Self {
            building_id: building_id.to_owned(),
            zone_id: zone_id.to_owned(),
            metric,
            provenance,
            samples,
        }
    }

    pub fn building_id(&self) -> &str {
        &self.building_id
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn samples(&self) -> &[MetricSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(MetricSample::value).collect()
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.samples.iter().map(MetricSample::timestamp).collect()
    }

    pub fn last(&self) -> Option<&MetricSample> {
        self.samples.last()
    }

    /// Whether any sample falls inside the window.
    pub fn has_samples_in(&self, window: &QueryWindow) -> bool {
        self.samples
            .iter()
            .any(|sample| window.contains(sample.timestamp))
    }
}

/// Most recent value of one `(zone, metric)` pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestValue {
    value: f64,
    provenance: Provenance,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
}

impl LatestValue {
    pub(crate) fn from_sample(sample: &MetricSample) -> Self {
        Self {
            value: sample.value,
            provenance: sample.provenance,
            timestamp: Some(sample.timestamp),
        }
    }

    pub(crate) fn synthetic(value: f64) -> Self {
        Self {
            value,
            provenance: Provenance::Synthetic,
            timestamp: None,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }
}

/// `zone -> metric -> latest value`, with an overall provenance that is `real`
/// as soon as one contained value came from the store.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct LatestValueSet {
    building_id: String,
    zones: IndexMap<String, IndexMap<Metric, LatestValue>>,
}

impl LatestValueSet {
    pub(crate) fn new(building_id: &str) -> Self {
        Self {
            building_id: building_id.to_owned(),
            zones: IndexMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, zone_id: &str, metric: Metric, value: LatestValue) {
        self.zones
            .entry(zone_id.to_owned())
            .or_default()
            .insert(metric, value);
    }

    pub fn building_id(&self) -> &str {
        &self.building_id
    }

    pub fn get(&self, zone_id: &str, metric: Metric) -> Option<&LatestValue> {
        self.zones.get(zone_id).and_then(|metrics| metrics.get(&metric))
    }

    pub fn zone(&self, zone_id: &str) -> Option<&IndexMap<Metric, LatestValue>> {
        self.zones.get(zone_id)
    }

    pub fn zone_ids(&self) -> impl Iterator<Item = &str> {
        self.zones.keys().map(String::as_str)
    }

    /// Every entry as `(zone, metric, value)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Metric, &LatestValue)> {
        self.zones.iter().flat_map(|(zone, metrics)| {
            metrics
                .iter()
                .map(move |(metric, value)| (zone.as_str(), *metric, value))
        })
    }

    pub fn len(&self) -> usize {
        self.zones.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, provenance: Provenance) -> usize {
        self.iter()
            .filter(|(_, _, value)| value.provenance == provenance)
            .count()
    }

    pub fn provenance(&self) -> Provenance {
        if self.count(Provenance::Real) > 0 {
            Provenance::Real
        } else {
            Provenance::Synthetic
        }
    }
}
