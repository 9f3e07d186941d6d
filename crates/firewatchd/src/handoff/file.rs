//! File-backed handoff for running ingestion and monitor serving as
//! separate processes.
//!
//! The directory holds three documents:
//!
//! | file | written by | content |
//! |---|---|---|
//! | `snapshot.json` | writer | every current sensor plus a version |
//! | `delta.json` | writer | unacknowledged delta batches |
//! | `delta.ack` | reader | highest batch sequence consumed |
//!
//! Each file has exactly one writer, so consuming the delta can never
//! disturb the snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use firewatch_core::SensorReading;

use crate::registry::RegistryHandle;

use super::document::{
    read_document, write_document, AckDocument, DeltaBatch, DeltaDocument, SensorRecord,
    SnapshotDocument,
};
use super::{DeltaView, HandoffError, HandoffSource, SnapshotView};

pub const SNAPSHOT_FILE: &str = "snapshot.json";
pub const DELTA_FILE: &str = "delta.json";
pub const ACK_FILE: &str = "delta.ack";

async fn ensure_dir(dir: &Path) -> Result<(), HandoffError> {
    fs::create_dir_all(dir)
        .await
        .map_err(|source| HandoffError::Io {
            path: dir.to_path_buf(),
            source,
        })
}

// ============================================================================
// Writer
// ============================================================================

/// Publishes registry state into a handoff directory.
pub struct FileHandoffWriter {
    dir: PathBuf,
    registry: RegistryHandle,
    next_sequence: u64,
    /// Batches not yet acknowledged, authoritative over `delta.json`
    delta: DeltaDocument,
    /// Set while `delta` holds changes `delta.json` does not
    delta_dirty: bool,
    snapshot_version: u64,
    /// Registry revision last written to `snapshot.json`
    published_revision: Option<u64>,
}

impl FileHandoffWriter {
    /// Opens a handoff directory, continuing numbering from any documents
    /// left by a previous run.
    pub async fn open(dir: impl Into<PathBuf>, registry: RegistryHandle) -> Result<Self, HandoffError> {
        let dir = dir.into();
        ensure_dir(&dir).await?;

        let ack = read_or_default::<AckDocument>(&dir.join(ACK_FILE)).await;
        let snapshot = read_or_default::<SnapshotDocument>(&dir.join(SNAPSHOT_FILE)).await;
        let mut delta = match read_document::<DeltaDocument>(&dir.join(DELTA_FILE)).await {
            Ok(doc) => doc.unwrap_or_default(),
            Err(e) => {
                warn!(
                    error = %e,
                    acknowledged = ack.sequence,
                    "Unreadable delta document; batches after the acknowledgment are lost"
                );
                DeltaDocument::default()
            }
        };
        let delta_dirty = delta.prune(ack.sequence);

        let next_sequence = delta.last_sequence().max(ack.sequence) + 1;
        info!(
            dir = %dir.display(),
            next_sequence,
            snapshot_version = snapshot.version,
            "Handoff writer opened"
        );

        Ok(Self {
            dir,
            registry,
            next_sequence,
            delta,
            delta_dirty,
            snapshot_version: snapshot.version,
            published_revision: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Moves the registry delta into `delta.json` and refreshes
    /// `snapshot.json` if the registry changed.
    ///
    /// Returns true if any document was written.
    pub async fn publish(&mut self) -> Result<bool, HandoffError> {
        let wrote_delta = self.publish_delta().await?;
        let wrote_snapshot = self.publish_snapshot().await?;
        Ok(wrote_delta || wrote_snapshot)
    }

    /// A drained batch stays in memory until `delta.json` holding it has
    /// been written, so a failed write is retried on the next publish.
    async fn publish_delta(&mut self) -> Result<bool, HandoffError> {
        let readings = self.registry.drain_unflushed().await;
        let alerts = self.registry.drain_alerts().await;

        if !readings.is_empty() || !alerts.is_empty() {
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            debug!(
                sequence,
                readings = readings.len(),
                alerts = alerts.len(),
                "Appending delta batch"
            );
            self.delta.batches.push(DeltaBatch {
                sequence,
                sensors: readings.iter().map(SensorRecord::from).collect(),
                alerts,
            });
            self.delta_dirty = true;
        }

        let ack = read_or_default::<AckDocument>(&self.dir.join(ACK_FILE)).await;
        if self.delta.prune(ack.sequence) {
            self.delta_dirty = true;
        }

        if !self.delta_dirty {
            return Ok(false);
        }
        write_document(&self.dir.join(DELTA_FILE), &self.delta).await?;
        self.delta_dirty = false;
        Ok(true)
    }

    /// Number of batches written or pending that the reader has not
    /// acknowledged.
    pub fn pending_batches(&self) -> usize {
        self.delta.batches.len()
    }

    async fn publish_snapshot(&mut self) -> Result<bool, HandoffError> {
        let snapshot = self.registry.snapshot().await?;
        if self.published_revision == Some(snapshot.revision) {
            return Ok(false);
        }

        self.snapshot_version += 1;
        let doc = SnapshotDocument::new(self.snapshot_version, &snapshot.readings);
        write_document(&self.dir.join(SNAPSHOT_FILE), &doc).await?;

        self.published_revision = Some(snapshot.revision);
        debug!(
            version = self.snapshot_version,
            count = doc.count,
            "Snapshot published"
        );
        Ok(true)
    }
}

async fn read_or_default<T>(path: &Path) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    match read_document::<T>(path).await {
        Ok(doc) => doc.unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "Ignoring unreadable handoff document");
            T::default()
        }
    }
}

/// Publishes on every registry event, plus every `interval` so acknowledged
/// batches get pruned even when sensors are quiet.
pub async fn run_publisher(
    mut writer: FileHandoffWriter,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut events = writer.registry.subscribe();
    let mut ticker = tokio::time::interval(interval);
    info!(dir = %writer.dir.display(), "Handoff publisher started");

    loop {
        if let Err(e) = writer.publish().await {
            error!(error = %e, "Handoff publish failed");
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            result = events.recv() => match result {
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Publisher lagged behind registry events");
                }
                Err(RecvError::Closed) => {
                    debug!("Registry event channel closed");
                    break;
                }
            },
        }
    }

    // Final flush so nothing drained on the way out is lost
    if let Err(e) = writer.publish().await {
        warn!(error = %e, "Final handoff publish failed");
    }
    info!("Handoff publisher stopped");
}

// ============================================================================
// Reader
// ============================================================================

/// Default polling interval for `FileHandoffReader`.
pub const DEFAULT_POLL: Duration = Duration::from_millis(500);

/// Consumes a handoff directory written by another process.
pub struct FileHandoffReader {
    dir: PathBuf,
    poll: Duration,
    acknowledged: u64,
    primed: bool,
}

impl FileHandoffReader {
    pub async fn open(dir: impl Into<PathBuf>, poll: Duration) -> Result<Self, HandoffError> {
        let dir = dir.into();
        ensure_dir(&dir).await?;
        let ack = read_or_default::<AckDocument>(&dir.join(ACK_FILE)).await;

        info!(dir = %dir.display(), acknowledged = ack.sequence, "Handoff reader opened");
        Ok(Self {
            dir,
            poll,
            acknowledged: ack.sequence,
            primed: false,
        })
    }

    pub fn acknowledged(&self) -> u64 {
        self.acknowledged
    }
}

impl HandoffSource for FileHandoffReader {
    async fn changed(&mut self) -> Result<(), HandoffError> {
        if self.primed {
            tokio::time::sleep(self.poll).await;
        }
        self.primed = true;
        Ok(())
    }

    async fn read_delta(&mut self) -> Result<Option<DeltaView>, HandoffError> {
        let Some(doc) = read_document::<DeltaDocument>(&self.dir.join(DELTA_FILE)).await? else {
            return Ok(None);
        };

        let mut batches: Vec<DeltaBatch> = doc
            .batches
            .into_iter()
            .filter(|b| b.sequence > self.acknowledged)
            .collect();
        if batches.is_empty() {
            return Ok(None);
        }
        batches.sort_by_key(|b| b.sequence);

        // Later batches supersede earlier readings of the same sensor
        let mut latest: BTreeMap<String, SensorRecord> = BTreeMap::new();
        let mut alerts = Vec::new();
        let mut sequence = self.acknowledged;
        for batch in batches {
            sequence = sequence.max(batch.sequence);
            alerts.extend(batch.alerts);
            for record in batch.sensors {
                latest.insert(record.id.clone(), record);
            }
        }

        write_document(&self.dir.join(ACK_FILE), &AckDocument { sequence }).await?;
        self.acknowledged = sequence;

        Ok(Some(DeltaView {
            sequence,
            readings: latest.into_values().map(SensorReading::from).collect(),
            alerts,
        }))
    }

    async fn read_snapshot(&mut self) -> Result<SnapshotView, HandoffError> {
        let doc = read_document::<SnapshotDocument>(&self.dir.join(SNAPSHOT_FILE))
            .await?
            .unwrap_or_default();

        Ok(SnapshotView {
            version: doc.version,
            readings: doc.sensors.into_iter().map(SensorReading::from).collect(),
        })
    }
}
