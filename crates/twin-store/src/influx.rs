//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry store adapters and query model."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use twin_common::config::StoreConfig;
use url::Url;

use crate::point::{FieldValue, RawRow, WritePoint};
use crate::query::{StoreQuery, FIELD_COLUMN, MEASUREMENT_COLUMN};
use crate::{HealthStatus, Result, StoreError, StoreHealth, TelemetryStore};

/// Columns Flux adds to every table that are neither data nor tags.
const BOOKKEEPING_COLUMNS: [&str; 5] = ["", "result", "table", "_start", "_stop"];

/// InfluxDB 2.x adapter speaking Flux over the HTTP API.
#[derive(Debug, Clone)]
pub struct InfluxStore {
    client: Client,
    base: Url,
    org: String,
    bucket: String,
}

impl InfluxStore {
    /// Build a client for the configured store. No connection is made here.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let mut raw = config.url.trim().to_owned();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw).map_err(|source| StoreError::InvalidUrl {
            url: config.url.clone(),
            source,
        })?;

        let mut headers = HeaderMap::new();
        if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Token {}", token))
                .map_err(|err| StoreError::InvalidQuery(format!("invalid store token: {}", err)))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            base,
            org: config.org.clone(),
            bucket: config.bucket.clone(),
        })
    }

    /// Bucket configured for this store; composed queries should target it.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url> {
        let mut url = self
            .base
            .join(path)
            .map_err(|source| StoreError::InvalidUrl {
                url: format!("{}{}", self.base, path),
                source,
            })?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl TelemetryStore for InfluxStore {
    fn name(&self) -> &str {
        "influxdb"
    }

    async fn query(&self, query: &StoreQuery) -> Result<Vec<RawRow>> {
        let url = self.endpoint("api/v2/query", &[("org", self.org.as_str())])?;
        let flux = query.to_flux();
        debug!(bucket = %query.bucket(), filters = query.filters().len(), "executing flux query");
        let body = json!({
            "query": flux,
            "type": "flux",
            "dialect": {
                "header": true,
                "delimiter": ",",
                "annotations": ["datatype"],
            },
        });
        let response = self
            .client
            .post(url)
            .header(ACCEPT, "application/csv")
            .json(&body)
            .send()
            .await?;
        let text = ensure_success(response).await?.text().await?;
        parse_annotated_csv(&text)
    }

    async fn write(&self, point: &WritePoint) -> Result<()> {
        let line = point.to_line_protocol()?;
        let url = self.endpoint(
            "api/v2/write",
            &[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ],
        )?;
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(line)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn health(&self) -> Result<StoreHealth> {
        #[derive(Deserialize)]
        struct HealthBody {
            status: String,
            #[serde(default)]
            message: Option<String>,
            #[serde(default)]
            version: Option<String>,
        }

        let url = self.endpoint("health", &[])?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body: HealthBody = response
            .json()
            .await
            .map_err(|err| StoreError::Decode(format!("health response: {}", err)))?;
        let verdict = if status.is_success() && body.status.eq_ignore_ascii_case("pass") {
            HealthStatus::Pass
        } else {
            HealthStatus::Fail
        };
        Ok(StoreHealth {
            status: verdict,
            message: body.message.unwrap_or(body.status),
            version: body.version,
        })
    }
}

/// Turn a non-2xx response into [`StoreError::Status`], keeping the store's message.
async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }

    let raw = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&raw)
        .map(|body| body.message)
        .unwrap_or(raw);
    warn!(status = status.as_u16(), message = %message, "store request rejected");
    Err(StoreError::Status {
        status: status.as_u16(),
        message,
    })
}

/// Parse a Flux CSV response (optionally annotated, possibly holding several
/// tables with their own header rows) into raw rows.
pub fn parse_annotated_csv(body: &str) -> Result<Vec<RawRow>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut datatypes: Vec<String> = Vec::new();
    let mut header: Option<Vec<String>> = None;
    let mut rows = Vec::new();

    for record in reader.records() {
        let record = record.map_err(|err| StoreError::Decode(err.to_string()))?;
        let first = record.get(0).unwrap_or("");
        if first.starts_with('#') {
            if first == "#datatype" {
                datatypes = record.iter().map(str::to_owned).collect();
            }
            header = None;
            continue;
        }
        if record.iter().all(str::is_empty) {
            header = None;
            continue;
        }
        if is_header(&record) {
            header = Some(record.iter().map(str::to_owned).collect());
            continue;
        }
        let columns = match header.take() {
            Some(columns) => columns,
            None => {
                return Err(StoreError::Decode(
                    "data row encountered before a header row".into(),
                ))
            }
        };
        rows.push(row_from_record(&columns, &datatypes, &record));
        header = Some(columns);
    }

    Ok(rows)
}

fn is_header(record: &StringRecord) -> bool {
    record.iter().any(|cell| cell == "_time") && record.iter().any(|cell| cell == "_value")
}

fn row_from_record(columns: &[String], datatypes: &[String], record: &StringRecord) -> RawRow {
    let mut row = RawRow::default();
    for (index, column) in columns.iter().enumerate() {
        let cell = record.get(index).unwrap_or("");
        match column.as_str() {
            "_time" => row.time = parse_time(cell),
            "_value" => {
                let datatype = datatypes.get(index).map(String::as_str);
                row.value = Some(FieldValue::from_cell(cell, datatype));
            }
            FIELD_COLUMN => row.field = non_empty(cell),
            MEASUREMENT_COLUMN => row.measurement = non_empty(cell),
            name if BOOKKEEPING_COLUMNS.contains(&name) => {}
            name => {
                if !cell.is_empty() {
                    row.tags.insert(name.to_owned(), cell.to_owned());
                }
            }
        }
    }
    row
}

fn parse_time(cell: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(cell)
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

fn non_empty(cell: &str) -> Option<String> {
    if cell.is_empty() {
        None
    } else {
        Some(cell.to_owned())
    }
}
