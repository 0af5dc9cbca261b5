//! Time-series sink backed by the InfluxDB v2 HTTP API
//!
//! Aggregates and price points are append-only [`Point`]s written as line
//! protocol. Two small Flux queries support restarts: the most recent point
//! time for a measurement (price generation resumes from there) and a range
//! sum (already-attributed consumption is subtracted from running totals).

use crate::config::SinkConfig;
use crate::error::{GridfluxError, Result};
use crate::logging::get_logger;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Typed field value of a point
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    Text(String),
}

/// One append-only point: measurement, tags, typed fields, optional timestamp.
///
/// A point without a timestamp is stamped by the server at ingestion time.
#[derive(Debug, Clone)]
pub struct Point {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: Option<DateTime<Utc>>,
}

impl Point {
    /// Create a point for the given measurement
    pub fn new(measurement: &str) -> Self {
        Self {
            measurement: measurement.to_string(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp: None,
        }
    }

    /// Add a tag
    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    /// Add a float field
    pub fn field_f64(mut self, key: &str, value: f64) -> Self {
        self.fields.insert(key.to_string(), FieldValue::Float(value));
        self
    }

    /// Add an integer field
    pub fn field_i64(mut self, key: &str, value: i64) -> Self {
        self.fields
            .insert(key.to_string(), FieldValue::Integer(value));
        self
    }

    /// Add a boolean field
    pub fn field_bool(mut self, key: &str, value: bool) -> Self {
        self.fields
            .insert(key.to_string(), FieldValue::Boolean(value));
        self
    }

    /// Add a string field
    pub fn field_str(mut self, key: &str, value: &str) -> Self {
        self.fields
            .insert(key.to_string(), FieldValue::Text(value.to_string()));
        self
    }

    /// Set the point timestamp
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Render the point as one line of InfluxDB line protocol (second precision)
    pub fn line_protocol(&self) -> Result<String> {
        if self.fields.is_empty() {
            return Err(GridfluxError::sink(format!(
                "Point for measurement {} has no fields",
                self.measurement
            )));
        }

        let mut line = escape_measurement(&self.measurement);
        for (key, value) in &self.tags {
            let _ = write!(line, ",{}={}", escape_tag(key), escape_tag(value));
        }
        line.push(' ');

        let mut first = true;
        for (key, value) in &self.fields {
            if !first {
                line.push(',');
            }
            first = false;
            let _ = write!(line, "{}=", escape_tag(key));
            match value {
                FieldValue::Float(v) => {
                    let _ = write!(line, "{}", v);
                }
                FieldValue::Integer(v) => {
                    let _ = write!(line, "{}i", v);
                }
                FieldValue::Boolean(v) => {
                    let _ = write!(line, "{}", v);
                }
                FieldValue::Text(v) => {
                    let _ = write!(line, "\"{}\"", escape_string_value(v));
                }
            }
        }

        if let Some(ts) = self.timestamp {
            let _ = write!(line, " {}", ts.timestamp());
        }

        Ok(line)
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

fn escape_string_value(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Shared handle to the InfluxDB sink
pub struct InfluxSink {
    client: reqwest::Client,
    base_url: String,
    org: String,
    bucket: String,
    token: String,
    logger: crate::logging::StructuredLogger,
}

impl InfluxSink {
    /// Create a new sink client
    pub fn new(config: &SinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
            logger: get_logger("sink"),
        })
    }

    /// Write a batch of points; at-least-once, order-insensitive
    pub async fn write_points(&self, points: &[Point]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let mut body = String::new();
        for point in points {
            body.push_str(&point.line_protocol()?);
            body.push('\n');
        }

        let url = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=s",
            self.base_url, self.org, self.bucket
        );
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(GridfluxError::sink(format!(
                "Write rejected with status {}: {}",
                status, detail
            )));
        }

        self.logger
            .debug(&format!("Wrote {} points to sink", points.len()));
        Ok(())
    }

    /// Timestamp of the most recent point for a measurement within `lookback`
    pub async fn last_point_time(
        &self,
        measurement: &str,
        lookback: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let query = format!(
            "from(bucket: \"{}\") |> range(start: -{}s) \
             |> filter(fn: (r) => r._measurement == \"{}\") \
             |> group() |> last(column: \"_time\") |> keep(columns: [\"_time\"])",
            self.bucket,
            lookback.num_seconds(),
            measurement
        );
        let body = self.run_query(&query).await?;
        match csv_column_value(&body, "_time") {
            Some(raw) => {
                let ts = DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| GridfluxError::sink(format!("Unparseable _time column: {}", e)))?;
                Ok(Some(ts.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }

    /// Sum of a field over a range, filtered by measurement and one tag
    pub async fn sum_field(
        &self,
        measurement: &str,
        field: &str,
        tag_key: &str,
        tag_value: &str,
        start: DateTime<Utc>,
    ) -> Result<f64> {
        let query = format!(
            "from(bucket: \"{}\") |> range(start: {}) \
             |> filter(fn: (r) => r._measurement == \"{}\" and r._field == \"{}\" and r.{} == \"{}\") \
             |> group() |> sum()",
            self.bucket,
            start.to_rfc3339(),
            measurement,
            field,
            tag_key,
            tag_value
        );
        let body = self.run_query(&query).await?;
        match csv_column_value(&body, "_value") {
            Some(raw) => raw
                .parse::<f64>()
                .map_err(|e| GridfluxError::sink(format!("Unparseable _value column: {}", e))),
            None => Ok(0.0),
        }
    }

    async fn run_query(&self, flux: &str) -> Result<String> {
        let url = format!("{}/api/v2/query?org={}", self.base_url, self.org);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.token))
            .header("Accept", "application/csv")
            .json(&serde_json::json!({ "query": flux, "type": "flux" }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(GridfluxError::sink(format!(
                "Query rejected with status {}: {}",
                status, detail
            )));
        }

        Ok(resp.text().await?)
    }
}

/// Pull the first data-row value of `column` out of an annotated CSV response
fn csv_column_value(body: &str, column: &str) -> Option<String> {
    let mut column_index: Option<usize> = None;
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let cells: Vec<&str> = line.split(',').collect();
        match column_index {
            None => {
                column_index = cells.iter().position(|c| *c == column);
                // A response without the column has no matching data
                column_index?;
            }
            Some(idx) => {
                let value = cells.get(idx)?.trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}
