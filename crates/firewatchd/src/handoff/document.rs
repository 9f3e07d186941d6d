//! On-disk JSON documents for the file-backed handoff.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;

use firewatch_core::{SensorId, SensorReading};

use super::HandoffError;

/// One sensor as stored in `snapshot.json` and `delta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRecord {
    pub id: String,
    pub temperature: f64,
    pub battery: i64,
    pub smoke: i64,
    pub co2: f64,
    #[serde(default)]
    pub errors: Vec<String>,
    pub last_update: DateTime<Utc>,
}

impl From<&SensorReading> for SensorRecord {
    fn from(reading: &SensorReading) -> Self {
        Self {
            id: reading.sensor_id.to_string(),
            temperature: reading.temperature_c,
            battery: reading.battery_pct,
            smoke: reading.smoke_level,
            co2: reading.co2_ppm,
            errors: reading.errors.clone(),
            last_update: reading.last_update,
        }
    }
}

impl From<SensorRecord> for SensorReading {
    fn from(record: SensorRecord) -> Self {
        SensorReading {
            sensor_id: SensorId::new(record.id),
            temperature_c: record.temperature,
            battery_pct: record.battery,
            smoke_level: record.smoke,
            co2_ppm: record.co2,
            errors: record.errors,
            unflushed: false,
            last_update: record.last_update,
        }
    }
}

/// `snapshot.json`: every sensor currently registered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub version: u64,
    pub count: usize,
    pub sensors: Vec<SensorRecord>,
}

impl SnapshotDocument {
    pub fn new(version: u64, readings: &[SensorReading]) -> Self {
        Self {
            version,
            count: readings.len(),
            sensors: readings.iter().map(SensorRecord::from).collect(),
        }
    }
}

/// One drained delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaBatch {
    pub sequence: u64,
    pub sensors: Vec<SensorRecord>,
    #[serde(default)]
    pub alerts: Vec<String>,
}

/// `delta.json`: batches not yet acknowledged by the reader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaDocument {
    pub batches: Vec<DeltaBatch>,
}

impl DeltaDocument {
    pub fn last_sequence(&self) -> u64 {
        self.batches.iter().map(|b| b.sequence).max().unwrap_or(0)
    }

    /// Drops batches the reader has already consumed. Returns true if any
    /// were dropped.
    pub fn prune(&mut self, acknowledged: u64) -> bool {
        let before = self.batches.len();
        self.batches.retain(|b| b.sequence > acknowledged);
        self.batches.len() != before
    }
}

/// `delta.ack`: highest batch sequence consumed by the reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckDocument {
    pub sequence: u64,
}

/// Reads and decodes a document. A missing file yields `None`.
pub(crate) async fn read_document<T: DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, HandoffError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(HandoffError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| HandoffError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Writes a document through a temporary file and an atomic rename.
pub(crate) async fn write_document<T: Serialize>(path: &Path, doc: &T) -> Result<(), HandoffError> {
    let json = serde_json::to_vec_pretty(doc).map_err(|e| HandoffError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let tmp = temp_path(path);
    let io_err = |source: std::io::Error| HandoffError::Io {
        path: path.to_path_buf(),
        source,
    };

    fs::write(&tmp, &json).await.map_err(io_err)?;
    fs::rename(&tmp, path).await.map_err(io_err)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
