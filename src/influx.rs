//! InfluxDB v2 points, Line Protocol and the HTTP client used to store them.
//!
//! Line Protocol format:
//! ```text
//! measurement,tag1=val1 field1=val1,field2=val2 timestamp_s
//! ```
//!
//! See: <https://docs.influxdata.com/influxdb/v2/reference/syntax/line-protocol/>
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use thiserror::Error;

use crate::config::InfluxDbParams;
use crate::record::SensorReading;

pub const LOCATION_TAG: &str = "location";
pub const TEMPERATURE_FIELD: &str = "Temperature";
pub const HUMIDITY_FIELD: &str = "Humidity";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("unexpected query response: {0}")]
    Response(String),
}

#[derive(Debug, Clone, PartialEq)]
/// One point of the `sample` series: the location tag plus temperature and humidity.
pub struct TimeSeriesPoint {
    pub measurement: String,
    pub location: String,
    pub temperature: f64,
    pub humidity: f64,
    pub time: DateTime<Utc>,
}

impl TimeSeriesPoint {
    pub fn from_reading(measurement: &str, location: &str, reading: &SensorReading) -> Self {
        TimeSeriesPoint {
            measurement: measurement.to_string(),
            location: location.to_string(),
            temperature: reading.temperature_c,
            humidity: reading.humidity,
            time: reading.time,
        }
    }

    /// Formats the point as one Line Protocol line with second precision.
    pub fn to_line_protocol(&self) -> String {
        format!(
            "{},{}={} {}={},{}={} {}",
            escape_measurement(&self.measurement),
            escape_key(LOCATION_TAG),
            escape_key(&self.location),
            escape_key(TEMPERATURE_FIELD),
            format_float(self.temperature),
            escape_key(HUMIDITY_FIELD),
            format_float(self.humidity),
            self.time.timestamp()
        )
    }
}

/// Destination of Line Protocol batches.
pub trait PointSink: Send + Sync {
    fn write_lines(&self, lines: &[String]) -> Result<(), StoreError>;
}

/// Floats are always written with a fractional part so InfluxDB keeps the field a float.
fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

/// Spaces and commas must be escaped with backslash.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Tag keys, tag values and field keys additionally escape equals signs.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

/// Blocking client for the write and query endpoints of an InfluxDB v2 server.
pub struct InfluxClient {
    http: Client,
    url: String,
    org: String,
    bucket: String,
    token: String,
}

impl InfluxClient {
    pub fn new(params: &InfluxDbParams) -> Result<Self, StoreError> {
        let http = Client::builder().timeout(params.request_timeout()).build()?;
        Ok(InfluxClient {
            http,
            url: params.url.trim_end_matches('/').to_string(),
            org: params.org.clone(),
            bucket: params.bucket.clone(),
            token: params.token.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Runs a Flux query and returns the annotated CSV answer.
    pub fn query(&self, flux: &str) -> Result<String, StoreError> {
        let response = self
            .http
            .post(format!("{}/api/v2/query", self.url))
            .query(&[("org", self.org.as_str())])
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "application/vnd.flux")
            .header(ACCEPT, "application/csv")
            .body(flux.to_string())
            .send()?;
        let response = check_status(response)?;
        Ok(response.text()?)
    }
}

impl PointSink for InfluxClient {
    fn write_lines(&self, lines: &[String]) -> Result<(), StoreError> {
        if lines.is_empty() {
            return Ok(());
        }
        let response = self
            .http
            .post(format!("{}/api/v2/write", self.url))
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "s"),
            ])
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(lines.join("\n"))
            .send()?;
        check_status(response)?;
        log::trace!(target: "tempfilterd::db", "Wrote {} points", lines.len());
        Ok(())
    }
}

fn check_status(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(StoreError::Rejected {
        status: status.as_u16(),
        body,
    })
}

/// Reads the first `_value` of an annotated CSV query answer.
///
/// Returns `Ok(None)` when the answer has no rows.
pub fn first_value(csv: &str) -> Result<Option<f64>, StoreError> {
    let mut value_column = None;
    for line in csv.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let columns: Vec<&str> = line.split(',').collect();
        match value_column {
            None => {
                value_column = columns.iter().position(|c| *c == "_value");
                if value_column.is_none() {
                    return Err(StoreError::Response(format!("no _value column in header '{}'", line)));
                }
            }
            Some(index) => {
                let cell = columns
                    .get(index)
                    .ok_or_else(|| StoreError::Response(format!("short row '{}'", line)))?;
                return cell
                    .parse::<f64>()
                    .map(Some)
                    .map_err(|err| StoreError::Response(format!("'{}' is not a number: {}", cell, err)));
            }
        }
    }
    Ok(None)
}
