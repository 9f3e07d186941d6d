//! Sensor reading entities and value objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::validate::{self, Finding};

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Identifier reported by a fire sensor.
///
/// Sensors conventionally use a "floor-zone" pair (e.g., "3-12"), but the
/// daemon treats the id as an opaque key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(String);

impl SensorId {
    /// Creates a new SensorId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SensorId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SensorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SensorId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Reading Values
// ============================================================================

/// The four parameters carried by one sensor report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReadingValues {
    /// Temperature in degrees Celsius
    pub temperature_c: f64,
    /// Battery level in percent
    pub battery_pct: i64,
    /// Smoke level on a 1-10 scale
    pub smoke_level: i64,
    /// CO2 concentration in parts per million
    pub co2_ppm: f64,
}

impl ReadingValues {
    pub fn new(temperature_c: f64, battery_pct: i64, smoke_level: i64, co2_ppm: f64) -> Self {
        Self {
            temperature_c,
            battery_pct,
            smoke_level,
            co2_ppm,
        }
    }
}

// ============================================================================
// Sensor Reading
// ============================================================================

/// A sensor's most recent report, annotated with its validation errors.
///
/// No history is kept: a later report for the same sensor overwrites the
/// values in place and recomputes `errors` from scratch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: SensorId,
    pub temperature_c: f64,
    pub battery_pct: i64,
    pub smoke_level: i64,
    pub co2_ppm: f64,

    /// Validation messages for the current values; empty when healthy.
    pub errors: Vec<String>,

    /// Set on every write, cleared when the delta consumer drains it.
    /// Only the registry actor touches this flag.
    #[serde(skip)]
    pub unflushed: bool,

    pub last_update: DateTime<Utc>,
}

impl SensorReading {
    /// Creates a reading from a first report, validated and marked unflushed.
    pub fn new(sensor_id: SensorId, values: ReadingValues) -> Self {
        Self::validated(sensor_id, values).0
    }

    /// Like [`SensorReading::new`], also returning the findings `errors`
    /// was built from.
    pub fn validated(sensor_id: SensorId, values: ReadingValues) -> (Self, Vec<Finding>) {
        let findings = validate::validate(&sensor_id, &values);
        let reading = Self {
            sensor_id,
            temperature_c: values.temperature_c,
            battery_pct: values.battery_pct,
            smoke_level: values.smoke_level,
            co2_ppm: values.co2_ppm,
            errors: messages(&findings),
            unflushed: true,
            last_update: Utc::now(),
        };
        (reading, findings)
    }

    /// Overwrites the values with a newer report.
    ///
    /// Re-validates, marks the reading unflushed and returns the findings
    /// behind the fresh error list.
    pub fn apply(&mut self, values: ReadingValues) -> Vec<Finding> {
        let findings = validate::validate(&self.sensor_id, &values);
        self.temperature_c = values.temperature_c;
        self.battery_pct = values.battery_pct;
        self.smoke_level = values.smoke_level;
        self.co2_ppm = values.co2_ppm;
        self.errors = messages(&findings);
        self.unflushed = true;
        self.last_update = Utc::now();
        findings
    }

    /// Returns the four measured values.
    pub fn values(&self) -> ReadingValues {
        ReadingValues::new(
            self.temperature_c,
            self.battery_pct,
            self.smoke_level,
            self.co2_ppm,
        )
    }

    /// Returns true if no parameter was flagged.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.errors.is_empty()
    }

    /// Formats the values alone: `"<id> : <temperature> <battery> <smoke> <co2>"`.
    pub fn summary_line(&self) -> String {
        format!(
            "{} : {} {} {} {}",
            self.sensor_id,
            format_decimal(self.temperature_c),
            self.battery_pct,
            self.smoke_level,
            format_decimal(self.co2_ppm)
        )
    }

    /// Formats the reading as one display line.
    ///
    /// The summary line followed by one `" | <error>"` segment per
    /// validation error.
    pub fn display_line(&self) -> String {
        let mut line = self.summary_line();
        for error in &self.errors {
            line.push_str(" | ");
            line.push_str(error);
        }
        line
    }
}

/// Formats a float so integral values keep one decimal place ("89.0").
pub fn format_decimal(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

fn messages(findings: &[Finding]) -> Vec<String> {
    findings.iter().map(|f| f.message.clone()).collect()
}
