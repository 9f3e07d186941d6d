//! firewatch client library
//!
//! - [`client`]: `MonitorClient`, a reconnecting monitor that registers with
//!   the daemon and forwards pushed readings and counts, plus one-shot
//!   query helpers
//! - [`sensor`]: `SensorSimulator`, a stand-in field device reporting
//!   randomized readings

pub mod client;
pub mod error;
pub mod sensor;

pub use client::{MonitorClient, MonitorConfig, MonitorUpdate};
pub use error::{ClientError, Result};
pub use sensor::{random_values, SensorConfig, SensorSimulator};
