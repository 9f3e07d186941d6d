//! State handoff between the ingesting side and the monitor-serving side.
//!
//! Two views are exposed with independent freshness:
//! - the **delta**: readings changed since the last read, returned at most
//!   once each
//! - the **snapshot**: every current reading, re-readable at will
//!
//! `RegistryHandoff` reads the registry directly when both sides share a
//! process. `FileHandoffWriter` / `FileHandoffReader` carry the same views
//! across processes through a directory of JSON documents.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use firewatch_core::SensorReading;

use crate::registry::RegistryError;

mod document;
mod file;
mod memory;

pub use document::{AckDocument, DeltaBatch, DeltaDocument, SensorRecord, SnapshotDocument};
pub use file::{
    run_publisher, FileHandoffReader, FileHandoffWriter, ACK_FILE, DEFAULT_POLL, DELTA_FILE,
    SNAPSHOT_FILE,
};
pub use memory::RegistryHandoff;

/// Readings and alerts not yet seen by the consumer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaView {
    /// Highest batch sequence included in this view
    pub sequence: u64,
    pub readings: Vec<SensorReading>,
    pub alerts: Vec<String>,
}

impl DeltaView {
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty() && self.alerts.is_empty()
    }
}

/// Every sensor not yet removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotView {
    /// Changes whenever the set of readings changes
    pub version: u64,
    pub readings: Vec<SensorReading>,
}

impl SnapshotView {
    pub fn count(&self) -> usize {
        self.readings.len()
    }
}

/// Errors raised while reading or writing handoff state.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A document exists but cannot be decoded; the next cycle retries.
    #[error("corrupt handoff document {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("registry unavailable: {0}")]
    Registry(#[from] RegistryError),

    /// The source will never produce more changes.
    #[error("handoff source closed")]
    Closed,
}

/// Consumer side of a handoff.
pub trait HandoffSource: Send {
    /// Waits until new state may be available.
    ///
    /// Returns `HandoffError::Closed` once no further change can occur.
    fn changed(&mut self) -> impl Future<Output = Result<(), HandoffError>> + Send;

    /// Takes the pending delta, or `None` if nothing changed.
    fn read_delta(&mut self)
        -> impl Future<Output = Result<Option<DeltaView>, HandoffError>> + Send;

    /// Reads the full current state without consuming anything.
    fn read_snapshot(&mut self) -> impl Future<Output = Result<SnapshotView, HandoffError>> + Send;
}

/// Last snapshot seen by the relay, shared with query handlers.
#[derive(Debug, Clone, Default)]
pub struct SnapshotMirror {
    inner: Arc<RwLock<SnapshotView>>,
}

impl SnapshotMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update(&self, view: SnapshotView) {
        *self.inner.write().await = view;
    }

    pub async fn version(&self) -> u64 {
        self.inner.read().await.version
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.count()
    }

    pub async fn readings(&self) -> Vec<SensorReading> {
        self.inner.read().await.readings.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firewatch_core::{ReadingValues, SensorId};

    #[tokio::test]
    async fn test_mirror_update() {
        let mirror = SnapshotMirror::new();
        assert_eq!(mirror.count().await, 0);
        assert_eq!(mirror.version().await, 0);

        let reading = SensorReading::new(SensorId::new("1-1"), ReadingValues::new(20.0, 80, 2, 300.0));
        mirror
            .update(SnapshotView {
                version: 3,
                readings: vec![reading],
            })
            .await;

        let clone = mirror.clone();
        assert_eq!(clone.count().await, 1);
        assert_eq!(clone.version().await, 3);
    }

    #[test]
    fn test_handoff_error_display() {
        let err = HandoffError::Corrupt {
            path: PathBuf::from("/tmp/delta.json"),
            reason: "EOF while parsing".to_string(),
        };
        assert!(err.to_string().contains("delta.json"));
        assert!(err.to_string().contains("EOF"));
    }

    #[test]
    fn test_delta_view_empty() {
        assert!(DeltaView::default().is_empty());
        let view = DeltaView {
            sequence: 1,
            readings: Vec::new(),
            alerts: vec!["x".to_string()],
        };
        assert!(!view.is_empty());
    }
}
