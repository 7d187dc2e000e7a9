//! ---
//! ems_section: "04-data-processing"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Time-series query, aggregation, and fallback engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Resolution aggregation.
//!
//! Buckets are aligned to the window start and are `resolution_minutes` wide.
//! Continuous metrics take the bucket mean, state-like metrics the last sample
//! in the bucket. An empty bucket repeats the previous bucket's value; empty
//! buckets before the first populated one stay absent.

use crate::model::{Aggregation, MetricSeries, QueryWindow};

/// Running reduction of one bucket.
#[derive(Debug, Clone, Copy)]
enum Bucket {
    Mean { sum: f64, count: u32 },
    Last(f64),
}

impl Bucket {
    fn start(aggregation: Aggregation, value: f64) -> Self {
        match aggregation {
            Aggregation::Mean => Bucket::Mean {
                sum: value,
                count: 1,
            },
            Aggregation::Last => Bucket::Last(value),
        }
    }

    fn add(&mut self, value: f64) {
        match self {
            Bucket::Mean { sum, count } => {
                *sum += value;
                *count += 1;
            }
            Bucket::Last(last) => *last = value,
        }
    }

    fn value(&self) -> f64 {
        match self {
            Bucket::Mean { sum, count } => *sum / f64::from(*count),
            Bucket::Last(last) => *last,
        }
    }
}

/// Resample a series onto the window's grid.
///
/// Samples outside `[start, end)` are dropped. The output keeps the input's
/// identity and provenance, and resampling it again with the same window is a no-op.
pub fn resample(series: &MetricSeries, window: &QueryWindow) -> MetricSeries {
    let count = window.bucket_count();
    let aggregation = series.metric().aggregation();
    let mut buckets: Vec<Option<Bucket>> = vec![None; count];

    for sample in series.samples() {
        let Some(index) = window.bucket_of(sample.timestamp()) else {
            continue;
        };
        let Some(slot) = buckets.get_mut(index) else {
            continue;
        };
        if let Some(bucket) = slot.as_mut() {
            bucket.add(sample.value());
        } else {
            *slot = Some(Bucket::start(aggregation, sample.value()));
        }
    }

    let mut carried: Option<f64> = None;
    let mut points = Vec::with_capacity(count);
    for (index, bucket) in buckets.iter().enumerate() {
        if let Some(bucket) = bucket {
            carried = Some(bucket.value());
        }
        if let Some(value) = carried {
            points.push((window.bucket_start(index), value));
        }
    }
    series.with_points(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Metric, Provenance};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn window(resolution_minutes: u32) -> QueryWindow {
        QueryWindow::new(t0(), t0() + Duration::hours(4), resolution_minutes)
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        t0() + Duration::minutes(minutes)
    }

    #[test]
    fn continuous_metrics_average_each_bucket() {
        let series = MetricSeries::real(
            "hq",
            "zone-core",
            Metric::Temperature,
            vec![(at(0), 20.0), (at(30), 22.0), (at(70), 24.0)],
        );
        let out = resample(&series, &window(60));
        assert_eq!(out.timestamps(), vec![at(0), at(60), at(120), at(180)]);
        assert_eq!(out.values(), vec![21.0, 24.0, 24.0, 24.0]);
        assert_eq!(out.provenance(), Provenance::Real);
    }

    #[test]
    fn occupancy_keeps_the_last_observation() {
        let series = MetricSeries::real(
            "hq",
            "zone-core",
            Metric::Occupancy,
            vec![(at(5), 0.2), (at(50), 0.6), (at(65), 0.4)],
        );
        let values = resample(&series, &window(60)).values();
        assert_eq!(values[0], 0.6);
        assert_eq!(values[1], 0.4);
    }

    #[test]
    fn leading_gaps_stay_absent_and_outliers_are_dropped() {
        let series = MetricSeries::real(
            "hq",
            "zone-core",
            Metric::Energy,
            vec![(at(-30), 99.0), (at(130), 110.0), (at(240), 500.0)],
        );
        let out = resample(&series, &window(60));
        assert_eq!(out.timestamps(), vec![at(120), at(180)]);
        assert_eq!(out.values(), vec![110.0, 110.0]);
    }

    #[test]
    fn empty_series_stays_empty() {
        let series = MetricSeries::real("hq", "zone-core", Metric::Co2, Vec::new());
        assert!(resample(&series, &window(15)).is_empty());
    }

    #[test]
    fn resampling_is_idempotent() {
        let series = MetricSeries::real(
            "hq",
            "zone-core",
            Metric::Humidity,
            vec![
                (at(1), 40.1),
                (at(7), 41.3),
                (at(16), 39.9),
                (at(61), 44.0),
                (at(62), 45.5),
                (at(200), 50.0),
            ],
        );
        let window = window(15);
        let once = resample(&series, &window);
        let twice = resample(&once, &window);
        assert_eq!(once, twice);

        let synthetic = MetricSeries::synthetic(
            "hq",
            "zone-core",
            Metric::Occupancy,
            vec![(at(0), 0.5), (at(15), 0.4)],
        );
        let once = resample(&synthetic, &window);
        assert_eq!(once.provenance(), Provenance::Synthetic);
        assert_eq!(resample(&once, &window), once);
    }
}
