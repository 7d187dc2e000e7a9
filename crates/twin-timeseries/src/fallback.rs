//! ---
//! ems_section: "04-data-processing"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Time-series query, aggregation, and fallback engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Fallback policy and synthetic data.

use std::f64::consts::PI;

use chrono::{DateTime, Timelike, Utc};
use indexmap::IndexMap;
use rand::prelude::*;
use rand_distr::Normal;
use twin_common::config::FallbackConfig;

use crate::error::{Result, RetrievalError, ValidationError};
use crate::model::{Bounds, LatestValue, Metric, MetricSeries, QueryWindow};

/// Why a pair is answered with synthetic data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// The store read failed or timed out.
    RetrievalFailed,
    /// The read succeeded but held no sample for the pair inside the window.
    NoData,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::RetrievalFailed => "retrieval_failed",
            FallbackReason::NoData => "no_data",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    UseReal,
    UseSynthetic(FallbackReason),
}

/// Single fallback policy for both read paths, applied per `(zone, metric)` pair.
pub fn decide(
    outcome: std::result::Result<Option<&MetricSeries>, &RetrievalError>,
    window: &QueryWindow,
) -> Decision {
    match outcome {
        Err(_) => Decision::UseSynthetic(FallbackReason::RetrievalFailed),
        Ok(Some(series)) if series.has_samples_in(window) => Decision::UseReal,
        Ok(_) => Decision::UseSynthetic(FallbackReason::NoData),
    }
}

/// Relative amplitude of the daily cycle and of the noise, as fractions of the bound span.
const DIURNAL_AMPLITUDE: f64 = 0.35;
const NOISE_FRACTION: f64 = 0.05;
/// Hour of the day at which the daily cycle peaks.
const PEAK_HOUR: f64 = 15.0;

/// Generates bounded placeholder values, independently per `(building, zone, metric)`.
#[derive(Debug, Clone)]
pub struct Synthesizer {
    seed: Option<u64>,
    overrides: IndexMap<Metric, Bounds>,
}

impl Synthesizer {
    /// Build from configuration. Bound overrides must name known metrics.
    pub fn new(config: &FallbackConfig) -> Result<Self> {
        let mut overrides = IndexMap::new();
        for (name, bounds) in &config.bounds {
            let metric = Metric::from_name(name)
                .ok_or_else(|| ValidationError::UnknownMetric(name.clone()))?;
            overrides.insert(metric, Bounds::new(bounds.min, bounds.max));
        }
        Ok(Self {
            seed: config.seed,
            overrides,
        })
    }

    pub fn bounds(&self, metric: Metric) -> Bounds {
        self.overrides
            .get(&metric)
            .copied()
            .unwrap_or_else(|| metric.default_bounds())
    }

    /// One synthetic point per bucket start of the window.
    pub fn series(
        &self,
        building_id: &str,
        zone_id: &str,
        metric: Metric,
        window: &QueryWindow,
    ) -> MetricSeries {
        let mut generator = self.generator(building_id, zone_id, metric);
        let points: Vec<_> = window
            .bucket_starts()
            .map(|at| (at, generator.sample(at)))
            .collect();
        MetricSeries::synthetic(building_id, zone_id, metric, points)
    }

    /// One synthetic latest value for the instant `at`.
    pub fn value(
        &self,
        building_id: &str,
        zone_id: &str,
        metric: Metric,
        at: DateTime<Utc>,
    ) -> LatestValue {
        let mut generator = self.generator(building_id, zone_id, metric);
        LatestValue::synthetic(generator.sample(at))
    }

    fn generator(&self, building_id: &str, zone_id: &str, metric: Metric) -> CurveGenerator {
        let rng = match self.seed {
            Some(seed) => {
                let pair = fnv1a([building_id, zone_id, metric.as_str()]);
                StdRng::seed_from_u64(seed ^ pair)
            }
            None => StdRng::from_entropy(),
        };
        let bounds = self.bounds(metric);
        CurveGenerator {
            rng,
            noise: Normal::new(0.0, bounds.span() * NOISE_FRACTION).ok(),
            bounds,
        }
    }
}

struct CurveGenerator {
    rng: StdRng,
    noise: Option<Normal<f64>>,
    bounds: Bounds,
}

impl CurveGenerator {
    fn sample(&mut self, at: DateTime<Utc>) -> f64 {
        let hour = f64::from(at.hour()) + f64::from(at.minute()) / 60.0;
        let phase = 2.0 * PI * (hour - PEAK_HOUR + 6.0) / 24.0;
        let base = self.bounds.midpoint() + DIURNAL_AMPLITUDE * self.bounds.span() * phase.sin();
        let noise = match &self.noise {
            Some(noise) => noise.sample(&mut self.rng),
            None => 0.0,
        };
        self.bounds.clamp(base + noise)
    }
}

fn fnv1a<'a>(parts: impl IntoIterator<Item = &'a str>) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for part in parts {
        for byte in part.bytes().chain(std::iter::once(0)) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
    }
    hash
}
