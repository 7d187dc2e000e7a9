//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry store adapters and query model."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, StoreError};

/// Field value as stored, before any interpretation by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    String(String),
    Null,
}

impl FieldValue {
    /// Numeric view of the value. Strings are parsed, booleans map to 0/1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(value) => Some(*value),
            FieldValue::Integer(value) => Some(*value as f64),
            FieldValue::Boolean(value) => Some(if *value { 1.0 } else { 0.0 }),
            FieldValue::String(raw) => raw.trim().parse::<f64>().ok(),
            FieldValue::Null => None,
        }
    }

    /// Interpret a textual cell, guided by an optional Flux datatype annotation.
    pub fn from_cell(raw: &str, datatype: Option<&str>) -> Self {
        if raw.is_empty() {
            return FieldValue::Null;
        }
        match datatype {
            Some("double") => raw
                .parse::<f64>()
                .map(FieldValue::Float)
                .unwrap_or_else(|_| FieldValue::String(raw.to_owned())),
            Some("long") => raw
                .parse::<i64>()
                .map(FieldValue::Integer)
                .unwrap_or_else(|_| FieldValue::String(raw.to_owned())),
            Some("unsignedLong") => raw
                .parse::<f64>()
                .map(FieldValue::Float)
                .unwrap_or_else(|_| FieldValue::String(raw.to_owned())),
            Some("boolean") => match raw {
                "true" => FieldValue::Boolean(true),
                "false" => FieldValue::Boolean(false),
                _ => FieldValue::String(raw.to_owned()),
            },
            Some("string") => FieldValue::String(raw.to_owned()),
            _ => {
                if let Ok(value) = raw.parse::<i64>() {
                    FieldValue::Integer(value)
                } else if let Ok(value) = raw.parse::<f64>() {
                    FieldValue::Float(value)
                } else if raw == "true" || raw == "false" {
                    FieldValue::Boolean(raw == "true")
                } else {
                    FieldValue::String(raw.to_owned())
                }
            }
        }
    }
}

/// One row returned by the store. Every column is optional because rows are
/// schema-less; interpretation happens in the caller's adapter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawRow {
    pub measurement: Option<String>,
    pub field: Option<String>,
    pub value: Option<FieldValue>,
    pub time: Option<DateTime<Utc>>,
    pub tags: BTreeMap<String, String>,
}

impl RawRow {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// One point accepted by the store write boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WritePoint {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub time: DateTime<Utc>,
}

impl WritePoint {
    pub fn new(measurement: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            time,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Structural checks shared by every store implementation.
    pub fn validate(&self) -> Result<()> {
        if self.measurement.trim().is_empty() {
            return Err(StoreError::InvalidPoint("measurement must not be empty".into()));
        }
        if self.fields.is_empty() {
            return Err(StoreError::InvalidPoint(format!(
                "point for '{}' has no fields",
                self.measurement
            )));
        }
        let names = std::iter::once(("measurement", self.measurement.as_str()))
            .chain(self.tags.iter().flat_map(|(key, value)| {
                [("tag key", key.as_str()), ("tag value", value.as_str())]
            }))
            .chain(self.fields.iter().flat_map(|(key, value)| {
                let text = match value {
                    FieldValue::String(text) => Some(("string field", text.as_str())),
                    _ => None,
                };
                std::iter::once(("field key", key.as_str())).chain(text)
            }));
        for (role, name) in names {
            if name.contains(['\n', '\r']) {
                return Err(StoreError::InvalidPoint(format!(
                    "{role} {name:?} contains a line break"
                )));
            }
        }
        for (key, value) in &self.fields {
            match value {
                FieldValue::Float(v) if !v.is_finite() => {
                    return Err(StoreError::InvalidPoint(format!(
                        "field '{}' of '{}' is not finite",
                        key, self.measurement
                    )));
                }
                FieldValue::Null => {
                    return Err(StoreError::InvalidPoint(format!(
                        "field '{}' of '{}' is null",
                        key, self.measurement
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Encode the point as one line of InfluxDB line protocol with nanosecond precision.
    pub fn to_line_protocol(&self) -> Result<String> {
        self.validate()?;
        let nanos = self.time.timestamp_nanos_opt().ok_or_else(|| {
            StoreError::InvalidPoint(format!("timestamp {} is out of range", self.time))
        })?;

        let mut line = escape(&self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            if value.is_empty() {
                continue;
            }
            line.push(',');
            line.push_str(&escape(key, &[',', '=', ' ']));
            line.push('=');
            line.push_str(&escape(value, &[',', '=', ' ']));
        }
        line.push(' ');
        let fields = self
            .fields
            .iter()
            .map(|(key, value)| format!("{}={}", escape(key, &[',', '=', ' ']), encode_field(value)))
            .collect::<Vec<_>>()
            .join(",");
        line.push_str(&fields);
        line.push(' ');
        line.push_str(&nanos.to_string());
        Ok(line)
    }
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == '\\' || special.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn encode_field(value: &FieldValue) -> String {
    match value {
        FieldValue::Float(v) => format!("{:?}", v),
        FieldValue::Integer(v) => format!("{}i", v),
        FieldValue::Boolean(v) => v.to_string(),
        FieldValue::String(v) => {
            let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
            format!("\"{}\"", escaped)
        }
        FieldValue::Null => String::new(),
    }
}
