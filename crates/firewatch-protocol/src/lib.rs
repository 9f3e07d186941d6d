//! firewatch protocol - wire messages for sensors, monitors and the daemon
//!
//! Every message is one line of JSON terminated by `\n`:
//! - sensors send [`SensorMessage`] and receive [`SensorReply`]
//! - monitors send [`MonitorMessage`] and receive [`DaemonMessage`]
//!
//! Reading records are decoded leniently through [`RawReading`], which
//! accepts each scalar either as a JSON number or as text.

pub mod message;
pub mod parse;
pub mod version;

pub use message::{
    DaemonMessage, MonitorMessage, MonitorRequest, SensorMessage, SensorMessageType, SensorReply,
};
pub use parse::{ParseError, RawReading};
pub use version::ProtocolVersion;

/// Maximum length of a single protocol line (64 KiB).
pub const MAX_LINE_LENGTH: usize = 64 * 1024;
