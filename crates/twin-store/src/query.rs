//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry store adapters and query model."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, StoreError};

/// Column holding the measurement name of a row.
pub const MEASUREMENT_COLUMN: &str = "_measurement";
/// Column holding the field name of a row.
pub const FIELD_COLUMN: &str = "_field";

/// Half-open time range `[start, stop)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        time >= self.start && time < self.stop
    }
}

/// Filter on a single column, composed by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagFilter {
    Equals { column: String, value: String },
    In { column: String, values: Vec<String> },
}

impl TagFilter {
    pub fn column(&self) -> &str {
        match self {
            TagFilter::Equals { column, .. } | TagFilter::In { column, .. } => column,
        }
    }

    /// Evaluate the filter against a column value.
    pub fn matches(&self, candidate: Option<&str>) -> bool {
        let Some(candidate) = candidate else {
            return false;
        };
        match self {
            TagFilter::Equals { value, .. } => value == candidate,
            TagFilter::In { values, .. } => values.iter().any(|value| value == candidate),
        }
    }
}

/// Row selection applied after filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selector {
    /// Every matching row, time ascending.
    Raw,
    /// Only the most recent row of each group formed by `group_by`.
    LastPerSeries { group_by: Vec<String> },
}

/// A complete read request against the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreQuery {
    bucket: String,
    range: TimeRange,
    filters: Vec<TagFilter>,
    selector: Selector,
}

impl StoreQuery {
    pub fn builder(bucket: impl Into<String>) -> StoreQueryBuilder {
        StoreQueryBuilder::new(bucket)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    pub fn filters(&self) -> &[TagFilter] {
        &self.filters
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Find the filter applied to a column, if any.
    pub fn filter_for(&self, column: &str) -> Option<&TagFilter> {
        self.filters.iter().find(|filter| filter.column() == column)
    }

    /// Render the query as Flux. Every identifier is emitted as an escaped string
    /// literal, never spliced in as code.
    pub fn to_flux(&self) -> String {
        let mut flux = String::new();
        let _ = writeln!(flux, "from(bucket: {})", flux_string(&self.bucket));
        let _ = writeln!(
            flux,
            "  |> range(start: {}, stop: {})",
            flux_time(self.range.start),
            flux_time(self.range.stop)
        );
        for filter in &self.filters {
            let predicate = match filter {
                TagFilter::Equals { column, value } => {
                    format!("r[{}] == {}", flux_string(column), flux_string(value))
                }
                TagFilter::In { column, values } => values
                    .iter()
                    .map(|value| format!("r[{}] == {}", flux_string(column), flux_string(value)))
                    .collect::<Vec<_>>()
                    .join(" or "),
            };
            let _ = writeln!(flux, "  |> filter(fn: (r) => {})", predicate);
        }
        match &self.selector {
            Selector::Raw => {
                flux.push_str("  |> sort(columns: [\"_time\"])\n");
            }
            Selector::LastPerSeries { group_by } => {
                let columns = group_by
                    .iter()
                    .map(|column| flux_string(column))
                    .collect::<Vec<_>>()
                    .join(", ");
                let _ = writeln!(flux, "  |> group(columns: [{}])", columns);
                flux.push_str("  |> last()\n");
            }
        }
        flux
    }
}

/// Builder for [`StoreQuery`].
#[derive(Debug, Clone)]
pub struct StoreQueryBuilder {
    bucket: String,
    range: Option<TimeRange>,
    filters: Vec<TagFilter>,
    selector: Selector,
}

impl StoreQueryBuilder {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            range: None,
            filters: Vec::new(),
            selector: Selector::Raw,
        }
    }

    pub fn range(mut self, start: DateTime<Utc>, stop: DateTime<Utc>) -> Self {
        self.range = Some(TimeRange { start, stop });
        self
    }

    pub fn tag_eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push(TagFilter::Equals {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn tag_in<I, S>(mut self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut collected: Vec<String> = Vec::new();
        for value in values {
            let value = value.into();
            if !collected.contains(&value) {
                collected.push(value);
            }
        }
        self.filters.push(TagFilter::In {
            column: column.into(),
            values: collected,
        });
        self
    }

    pub fn measurement_in<I, S>(self, measurements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tag_in(MEASUREMENT_COLUMN, measurements)
    }

    pub fn field(self, field: impl Into<String>) -> Self {
        self.tag_eq(FIELD_COLUMN, field)
    }

    pub fn last_per_series<I, S>(mut self, group_by: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selector = Selector::LastPerSeries {
            group_by: group_by.into_iter().map(Into::into).collect(),
        };
        self
    }

    pub fn build(self) -> Result<StoreQuery> {
        if self.bucket.trim().is_empty() {
            return Err(StoreError::InvalidQuery("bucket must not be empty".into()));
        }
        let range = self
            .range
            .ok_or_else(|| StoreError::InvalidQuery("time range is required".into()))?;
        if range.start >= range.stop {
            return Err(StoreError::InvalidQuery(format!(
                "range start {} is not before stop {}",
                range.start, range.stop
            )));
        }
        for filter in &self.filters {
            if let TagFilter::In { column, values } = filter {
                if values.is_empty() {
                    return Err(StoreError::InvalidQuery(format!(
                        "membership filter on '{}' has no values",
                        column
                    )));
                }
            }
        }
        if let Selector::LastPerSeries { group_by } = &self.selector {
            if group_by.is_empty() {
                return Err(StoreError::InvalidQuery(
                    "last-per-series selection needs at least one group column".into(),
                ));
            }
        }
        Ok(StoreQuery {
            bucket: self.bucket,
            range,
            filters: self.filters,
            selector: self.selector,
        })
    }
}

/// Quote a value as a Flux string literal.
pub fn flux_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '$' if chars.peek() == Some(&'{') => out.push_str("\\$"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn flux_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
