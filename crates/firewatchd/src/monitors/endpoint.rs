//! Push capability for registered monitors.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use firewatch_protocol::DaemonMessage;

static NEXT_MONITOR_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a monitor endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonitorId(String);

impl MonitorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocates a process-unique id such as `monitor-7`.
    pub fn generate() -> Self {
        Self(format!(
            "monitor-{}",
            NEXT_MONITOR_ID.fetch_add(1, Ordering::Relaxed)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Events pushed to monitors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Reading batch, validation alert or stale-sensor warning
    Data { text: String },
    SensorCountChanged(usize),
    MonitorCountChanged(usize),
    /// Sent only to an endpoint whose registration failed
    Rejected { reason: String },
}

/// Broadcast category of a `MonitorEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ReadingBatch,
    SensorCount,
    MonitorCount,
    Rejected,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadingBatch => write!(f, "reading_batch"),
            Self::SensorCount => write!(f, "sensor_count"),
            Self::MonitorCount => write!(f, "monitor_count"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl MonitorEvent {
    pub fn data(text: impl Into<String>) -> Self {
        Self::Data { text: text.into() }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Data { .. } => EventKind::ReadingBatch,
            Self::SensorCountChanged(_) => EventKind::SensorCount,
            Self::MonitorCountChanged(_) => EventKind::MonitorCount,
            Self::Rejected { .. } => EventKind::Rejected,
        }
    }
}

impl From<MonitorEvent> for DaemonMessage {
    fn from(event: MonitorEvent) -> Self {
        match event {
            MonitorEvent::Data { text } => DaemonMessage::Data { text },
            MonitorEvent::SensorCountChanged(count) => DaemonMessage::SensorCountChanged { count },
            MonitorEvent::MonitorCountChanged(count) => {
                DaemonMessage::MonitorCountChanged { count }
            }
            MonitorEvent::Rejected { reason } => DaemonMessage::rejected(&reason),
        }
    }
}

/// Why a push did not reach its endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("endpoint closed")]
    Closed,

    #[error("endpoint backlog full")]
    Backlogged,
}

/// Something that can receive pushed monitor events.
///
/// `deliver` must not block: slow endpoints report `Backlogged` instead
/// of stalling the broadcast.
pub trait PushTarget: Send + Sync {
    fn id(&self) -> &MonitorId;

    fn deliver(&self, event: MonitorEvent) -> Result<(), DeliveryError>;
}

/// A `PushTarget` backed by a bounded mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelEndpoint {
    id: MonitorId,
    sender: mpsc::Sender<MonitorEvent>,
}

impl ChannelEndpoint {
    pub fn new(id: MonitorId, capacity: usize) -> (Self, mpsc::Receiver<MonitorEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { id, sender }, receiver)
    }
}

impl PushTarget for ChannelEndpoint {
    fn id(&self) -> &MonitorId {
        &self.id
    }

    fn deliver(&self, event: MonitorEvent) -> Result<(), DeliveryError> {
        self.sender.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Backlogged,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}
