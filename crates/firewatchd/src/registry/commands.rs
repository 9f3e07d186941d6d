//! Registry actor commands, errors, and events.
//!
//! - `RegistryCommand`: commands sent to the actor
//! - `RegistryError`: errors that can occur during registry operations
//! - `SensorEvent`: events published by the registry for subscribers

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use firewatch_core::{ReadingValues, SensorId, SensorReading};
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// Connection Identity
// ============================================================================

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies the sensor connection that last wrote a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates a process-unique connection id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each command carries a oneshot channel for the response, except
/// `RaiseAlert` which is fire-and-forget.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Validate and store a report, creating the entry on first sight.
    ///
    /// # Errors
    /// - `RegistryError::RegistryFull` if the id is new and capacity is reached
    Upsert {
        owner: ConnectionId,
        sensor_id: SensorId,
        values: ReadingValues,
        respond_to: oneshot::Sender<Result<Vec<String>, RegistryError>>,
    },

    /// Copy of every stored reading, ordered by sensor id.
    SnapshotAll {
        respond_to: oneshot::Sender<Vec<SensorReading>>,
    },

    /// Copy of every stored reading plus the current revision.
    Snapshot {
        respond_to: oneshot::Sender<RegistrySnapshot>,
    },

    /// Take every unflushed reading and clear its flag.
    DrainUnflushed {
        respond_to: oneshot::Sender<Vec<SensorReading>>,
    },

    /// Remove an entry regardless of owner.
    Remove {
        sensor_id: SensorId,
        respond_to: oneshot::Sender<bool>,
    },

    /// Remove an entry only if `owner` still owns it.
    Release {
        sensor_id: SensorId,
        owner: ConnectionId,
        respond_to: oneshot::Sender<bool>,
    },

    Size {
        respond_to: oneshot::Sender<usize>,
    },

    /// Queue a free-form warning for the next delta.
    RaiseAlert { message: String },

    /// Take every queued alert.
    DrainAlerts {
        respond_to: oneshot::Sender<Vec<String>>,
    },
}

/// A consistent copy of the registry contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    /// Incremented on every mutation of the stored readings.
    pub revision: u64,
    pub readings: Vec<SensorReading>,
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry has reached its maximum sensor capacity.
    #[error("registry is full (max: {max} sensors)")]
    RegistryFull { max: usize },

    /// The actor shut down before answering.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Sensor Events
// ============================================================================

/// Events published by the registry to subscribers.
#[derive(Debug, Clone)]
pub enum SensorEvent {
    /// A sensor id was seen for the first time.
    Registered {
        sensor_id: SensorId,
        /// Sensor count after the insert
        count: usize,
    },

    /// A stored reading was overwritten (boxed for size optimization).
    Updated { reading: Box<SensorReading> },

    /// A sensor entry was removed.
    Removed {
        sensor_id: SensorId,
        /// Sensor count after the removal
        count: usize,
        reason: RemovalReason,
    },

    /// A warning was queued with `raise_alert`.
    Alert { message: String },
}

/// Reason why a sensor was removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Removed through `remove`.
    Explicit,

    /// The owning connection ended.
    ConnectionClosed,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicitly removed"),
            Self::ConnectionClosed => write!(f, "sensor connection closed"),
        }
    }
}
