//! Reading validation against fire-safety thresholds.
//!
//! Every parameter is checked independently; a reading can carry up to
//! four findings at once. Validation is pure and never fails: an
//! out-of-range value is a domain alert, not an error.

use std::fmt;

use crate::reading::{format_decimal, ReadingValues, SensorId};

/// Lowest physically possible temperature.
pub const ABSOLUTE_ZERO_C: f64 = -273.15;

/// Temperatures above this are dangerous.
pub const MAX_SAFE_TEMPERATURE_C: f64 = 50.0;

/// Valid battery range, inclusive.
pub const BATTERY_RANGE_PCT: (i64, i64) = (0, 100);

/// Battery levels above zero and at or below this are low.
pub const LOW_BATTERY_PCT: i64 = 30;

/// Valid smoke scale, inclusive.
pub const SMOKE_RANGE: (i64, i64) = (1, 10);

/// Smoke levels above this are dangerous.
pub const MAX_SAFE_SMOKE: i64 = 7;

/// The only CO2 concentration considered healthy.
pub const NOMINAL_CO2_PPM: f64 = 300.0;

/// Which measured parameter a finding refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameter {
    Temperature,
    Battery,
    Smoke,
    Co2,
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temperature => write!(f, "temperature"),
            Self::Battery => write!(f, "battery"),
            Self::Smoke => write!(f, "smoke"),
            Self::Co2 => write!(f, "co2"),
        }
    }
}

/// How serious a finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// The value is physically impossible; the sensor is faulty.
    Malfunction,
    /// The value indicates a fire hazard.
    Danger,
    /// The sensor needs attention (low battery).
    Warning,
}

/// One flagged parameter of a reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub parameter: Parameter,
    pub severity: Severity,
    pub message: String,
}

impl Finding {
    fn new(parameter: Parameter, severity: Severity, message: String) -> Self {
        Self {
            parameter,
            severity,
            message,
        }
    }
}

/// Validates all four parameters of a report.
///
/// Findings are returned in parameter order: temperature, battery, smoke,
/// co2.
pub fn validate(sensor_id: &SensorId, values: &ReadingValues) -> Vec<Finding> {
    [
        check_temperature(sensor_id, values.temperature_c),
        check_battery(sensor_id, values.battery_pct),
        check_smoke(sensor_id, values.smoke_level),
        check_co2(sensor_id, values.co2_ppm),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Validates a report and returns only the human-readable messages.
pub fn error_messages(sensor_id: &SensorId, values: &ReadingValues) -> Vec<String> {
    validate(sensor_id, values)
        .into_iter()
        .map(|finding| finding.message)
        .collect()
}

pub fn check_temperature(sensor_id: &SensorId, celsius: f64) -> Option<Finding> {
    if celsius < ABSOLUTE_ZERO_C {
        Some(Finding::new(
            Parameter::Temperature,
            Severity::Malfunction,
            format!(
                "{sensor_id} : Sensor is malfunctioning; a temperature of {} celsius is below absolute zero.",
                format_decimal(celsius)
            ),
        ))
    } else if celsius > MAX_SAFE_TEMPERATURE_C {
        Some(Finding::new(
            Parameter::Temperature,
            Severity::Danger,
            format!(
                "{sensor_id} : Temperature is reaching a dangerous level at {} celsius.",
                format_decimal(celsius)
            ),
        ))
    } else {
        None
    }
}

pub fn check_battery(sensor_id: &SensorId, percent: i64) -> Option<Finding> {
    let (min, max) = BATTERY_RANGE_PCT;
    if percent < min || percent > max {
        Some(Finding::new(
            Parameter::Battery,
            Severity::Malfunction,
            format!("{sensor_id} : Battery malfunction ({percent}%)."),
        ))
    } else if percent > 0 && percent <= LOW_BATTERY_PCT {
        Some(Finding::new(
            Parameter::Battery,
            Severity::Warning,
            format!("{sensor_id} : Battery low at {percent}%."),
        ))
    } else {
        None
    }
}

pub fn check_smoke(sensor_id: &SensorId, level: i64) -> Option<Finding> {
    let (min, max) = SMOKE_RANGE;
    if level < min || level > max {
        Some(Finding::new(
            Parameter::Smoke,
            Severity::Malfunction,
            format!("{sensor_id} : Smoke sensor malfunction (level {level})."),
        ))
    } else if level > MAX_SAFE_SMOKE {
        Some(Finding::new(
            Parameter::Smoke,
            Severity::Danger,
            format!("{sensor_id} : Smoke is at a dangerous level of {level}."),
        ))
    } else {
        None
    }
}

// Exact match is intentional: there is no tolerance band around nominal.
#[allow(clippy::float_cmp)]
pub fn check_co2(sensor_id: &SensorId, ppm: f64) -> Option<Finding> {
    if ppm == NOMINAL_CO2_PPM {
        None
    } else {
        Some(Finding::new(
            Parameter::Co2,
            Severity::Danger,
            format!(
                "{sensor_id} : CO2 is at a dangerous level of {} ppm.",
                format_decimal(ppm)
            ),
        ))
    }
}
