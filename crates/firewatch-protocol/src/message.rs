//! Protocol message types for sensor and monitor connections.

use crate::parse::{ParseError, RawReading};
use crate::version::ProtocolVersion;
use firewatch_core::{ReadingValues, SensorId};
use serde::{Deserialize, Serialize};

// ============================================================================
// Sensor connection
// ============================================================================

/// Message types a sensor sends to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensorMessageType {
    /// First frame of every connection
    Authenticate {
        /// Shared sensor secret in clear text
        token: String,
    },

    /// One periodic report
    Reading(RawReading),
}

/// Messages sent from a sensor to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorMessage {
    /// Protocol version (assumed current when omitted)
    #[serde(default)]
    pub protocol_version: ProtocolVersion,

    /// Message payload
    #[serde(flatten)]
    pub message: SensorMessageType,
}

impl SensorMessage {
    /// Creates a new sensor message with current protocol version.
    pub fn new(message: SensorMessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    /// Creates an authentication frame.
    pub fn authenticate(token: impl Into<String>) -> Self {
        Self::new(SensorMessageType::Authenticate {
            token: token.into(),
        })
    }

    /// Creates a reading frame with text-encoded scalars.
    pub fn reading(sensor_id: &SensorId, values: &ReadingValues) -> Self {
        Self::new(SensorMessageType::Reading(RawReading::from_values(
            sensor_id, values,
        )))
    }

    /// Decodes one protocol line.
    pub fn from_line(line: &str) -> Result<Self, ParseError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Replies sent from the daemon to a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensorReply {
    /// Token accepted; readings may follow
    Authenticated { protocol_version: ProtocolVersion },

    /// Token refused or handshake invalid; the daemon closes the connection
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },
}

impl SensorReply {
    pub fn authenticated() -> Self {
        Self::Authenticated {
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }
}

// ============================================================================
// Monitor connection
// ============================================================================

/// Requests a monitor sends to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorRequest {
    /// Register this connection for pushed events
    AddMonitor {
        /// Shared monitor secret in clear text
        secret: String,
    },

    /// Stop receiving pushed events (the connection stays open)
    RemoveMonitor,

    /// Number of sensors currently connected
    GetSensorCount,

    /// Number of monitors currently registered
    GetMonitorCount,

    /// Latest reading of every sensor as display text
    GetAllReadings,

    /// Ping to check connection
    Ping {
        /// Sequence number for matching pong response
        seq: u64,
    },

    /// Monitor disconnecting gracefully
    Disconnect,
}

/// Messages sent from a monitor to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorMessage {
    /// Protocol version (assumed current when omitted)
    #[serde(default)]
    pub protocol_version: ProtocolVersion,

    /// Request payload
    #[serde(flatten)]
    pub request: MonitorRequest,
}

impl MonitorMessage {
    pub fn new(request: MonitorRequest) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            request,
        }
    }

    pub fn add_monitor(secret: impl Into<String>) -> Self {
        Self::new(MonitorRequest::AddMonitor {
            secret: secret.into(),
        })
    }

    pub fn remove_monitor() -> Self {
        Self::new(MonitorRequest::RemoveMonitor)
    }

    pub fn get_sensor_count() -> Self {
        Self::new(MonitorRequest::GetSensorCount)
    }

    pub fn get_monitor_count() -> Self {
        Self::new(MonitorRequest::GetMonitorCount)
    }

    pub fn get_all_readings() -> Self {
        Self::new(MonitorRequest::GetAllReadings)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MonitorRequest::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MonitorRequest::Disconnect)
    }
}

/// Messages sent from the daemon to a monitor.
///
/// `Data`, `SensorCountChanged` and `MonitorCountChanged` are pushed
/// unprompted to registered monitors; the rest answer a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Registration accepted
    MonitorAdded {
        monitor_id: String,
        protocol_version: ProtocolVersion,
    },

    /// Registration refused; the daemon closes the connection
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    /// Reply to `get_sensor_count`
    SensorCount { count: usize },

    /// Reply to `get_monitor_count`
    MonitorCount { count: usize },

    /// Reply to `get_all_readings`
    AllReadings { text: String },

    /// Pushed reading batch, validation alert or stale-sensor warning
    Data { text: String },

    /// Pushed when a sensor connects or disconnects
    SensorCountChanged { count: usize },

    /// Pushed when a monitor is added or removed
    MonitorCountChanged { count: usize },

    /// Pong response to ping
    Pong { seq: u64 },

    /// Error response
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl DaemonMessage {
    pub fn monitor_added(monitor_id: impl Into<String>) -> Self {
        Self::MonitorAdded {
            monitor_id: monitor_id.into(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn data(text: impl Into<String>) -> Self {
        Self::Data { text: text.into() }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }

    /// Returns true for messages pushed without a request.
    pub fn is_push(&self) -> bool {
        matches!(
            self,
            Self::Data { .. } | Self::SensorCountChanged { .. } | Self::MonitorCountChanged { .. }
        )
    }
}
