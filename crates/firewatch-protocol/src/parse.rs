//! Lenient decoding of sensor reading records.
//!
//! Sensors in the field send each parameter as a text-convertible scalar:
//! `"temperature": "45.0"` and `"temperature": 45.0` are both accepted.
//! Decoding is separate from deserialization so a record with a bad field
//! is still recognised as a reading and can be skipped on its own.

use firewatch_core::{ReadingValues, SensorId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A reading record as it appears on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    #[serde(rename = "sensorId", alias = "sensor_id", default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smoke: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub co2: Option<Value>,
}

impl RawReading {
    /// Builds a record with every scalar encoded as text.
    pub fn from_values(sensor_id: &SensorId, values: &ReadingValues) -> Self {
        Self {
            sensor_id: Some(sensor_id.to_string()),
            temperature: Some(Value::String(values.temperature_c.to_string())),
            battery: Some(Value::String(values.battery_pct.to_string())),
            smoke: Some(Value::String(values.smoke_level.to_string())),
            co2: Some(Value::String(values.co2_ppm.to_string())),
        }
    }

    /// Decodes the record into a sensor id and validated-type values.
    ///
    /// # Errors
    ///
    /// - `ParseError::MissingField` if any field is absent or null
    /// - `ParseError::EmptySensorId` if the id is blank
    /// - `ParseError::InvalidScalar` if a value cannot be converted
    pub fn decode(&self) -> Result<(SensorId, ReadingValues), ParseError> {
        let sensor_id = self
            .sensor_id
            .as_deref()
            .map(str::trim)
            .ok_or(ParseError::MissingField("sensorId"))?;
        if sensor_id.is_empty() {
            return Err(ParseError::EmptySensorId);
        }

        let values = ReadingValues::new(
            decode_float("temperature", self.temperature.as_ref())?,
            decode_integer("battery", self.battery.as_ref())?,
            decode_integer("smoke", self.smoke.as_ref())?,
            decode_float("co2", self.co2.as_ref())?,
        );

        Ok((SensorId::new(sensor_id), values))
    }
}

/// Errors produced while decoding a reading record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("sensor id is empty")]
    EmptySensorId,

    #[error("invalid {field} value {value}: {reason}")]
    InvalidScalar {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("malformed message: {0}")]
    Json(String),
}

impl ParseError {
    fn invalid(field: &'static str, value: &Value, reason: impl Into<String>) -> Self {
        Self::InvalidScalar {
            field,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

fn decode_float(field: &'static str, value: Option<&Value>) -> Result<f64, ParseError> {
    let value = value.ok_or(ParseError::MissingField(field))?;
    let parsed = match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ParseError::invalid(field, value, "not representable as f64"))?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| ParseError::invalid(field, value, e.to_string()))?,
        _ => return Err(ParseError::invalid(field, value, "expected number or text")),
    };

    if !parsed.is_finite() {
        return Err(ParseError::invalid(field, value, "not a finite number"));
    }
    Ok(parsed)
}

fn decode_integer(field: &'static str, value: Option<&Value>) -> Result<i64, ParseError> {
    let value = value.ok_or(ParseError::MissingField(field))?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| ParseError::invalid(field, value, "expected an integer")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| ParseError::invalid(field, value, e.to_string())),
        _ => Err(ParseError::invalid(field, value, "expected integer or text")),
    }
}
