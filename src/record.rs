//! Module that contains the sensor record published by the radio receiver and its decoder.
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Textual format of the `time` field in a published record.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
/// Reasons a payload cannot be turned into a [`SensorReading`].
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload does not match the sensor record: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Struct representing one reading broadcast by an AcuRite sensor.
pub struct SensorReading {
    /// Timestamp the reading was received by the radio, interpreted as UTC.
    #[serde(with = "record_time")]
    pub time: DateTime<Utc>,
    /// Device model name.
    pub model: String,
    /// Identity of the sensor.
    pub id: u32,
    /// Channel label set on the device.
    pub channel: String,
    /// 1 while the battery is fine.
    pub battery_ok: u8,
    /// Temperature value in celsius.
    #[serde(rename = "temperature_C")]
    pub temperature_c: f64,
    /// Relative humidity value.
    pub humidity: f64,
    /// Integrity check reported by the receiver.
    pub mic: String,
}

impl SensorReading {
    pub fn battery_ok(&self) -> bool {
        self.battery_ok != 0
    }
}

/// A payload parsed as JSON but not yet checked against the sensor record.
///
/// The receiver publishes every device it hears on the same topic tree, in
/// whatever shape that device has, so the identity is looked at before the rest.
#[derive(Debug, Clone)]
pub struct RawRecord {
    value: serde_json::Value,
}

impl RawRecord {
    /// Parses a payload. Trailing whitespace is ignored.
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(payload)?;
        let value = serde_json::from_str(text.trim_end())?;
        Ok(RawRecord { value })
    }

    /// The `id` field, if the payload is an object with an id that fits a sensor identity.
    pub fn sensor_id(&self) -> Option<u32> {
        self.value
            .get("id")
            .and_then(serde_json::Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
    }

    pub fn into_reading(self) -> Result<SensorReading, DecodeError> {
        Ok(serde_json::from_value(self.value)?)
    }
}

/// Decodes one raw payload into a [`SensorReading`].
///
/// Trailing whitespace is ignored, as are fields the record does not know.
pub fn decode(payload: &[u8]) -> Result<SensorReading, DecodeError> {
    RawRecord::parse(payload)?.into_reading()
}

/// Formats a timestamp the way the receiver publishes it.
pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}

/// Parses a timestamp in the receiver's format.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let naive = NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)?;
    Ok(Utc.from_utc_datetime(&naive))
}

mod record_time {
    use super::*;

    pub fn serialize<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timestamp(time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_timestamp(&text).map_err(serde::de::Error::custom)
    }
}
