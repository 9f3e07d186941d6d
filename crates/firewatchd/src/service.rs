//! Transport-independent monitor-facing operations.

use std::sync::Arc;

use firewatch_core::SensorReading;

use crate::dispatch::readings_text;
use crate::handoff::SnapshotMirror;
use crate::monitors::{MonitorError, MonitorId, MonitorRegistry, PushTarget};
use crate::registry::RegistryHandle;

/// Where sensor queries are answered from.
#[derive(Debug, Clone)]
pub enum SensorSource {
    /// The registry actor in this process
    Live(RegistryHandle),
    /// The relay's copy of the last snapshot read from a handoff
    Mirrored(SnapshotMirror),
}

impl SensorSource {
    async fn readings(&self) -> Vec<SensorReading> {
        match self {
            Self::Live(registry) => registry.snapshot_all().await,
            Self::Mirrored(mirror) => mirror.readings().await,
        }
    }

    async fn count(&self) -> usize {
        match self {
            Self::Live(registry) => registry.size().await,
            Self::Mirrored(mirror) => mirror.count().await,
        }
    }
}

/// The fire alarm service as seen by monitors.
#[derive(Debug, Clone)]
pub struct FireAlarmService {
    sensors: SensorSource,
    monitors: Arc<MonitorRegistry>,
}

impl FireAlarmService {
    pub fn new(sensors: SensorSource, monitors: Arc<MonitorRegistry>) -> Self {
        Self { sensors, monitors }
    }

    pub async fn get_sensor_count(&self) -> usize {
        self.sensors.count().await
    }

    pub async fn get_monitor_count(&self) -> usize {
        self.monitors.count().await
    }

    /// Every sensor's latest reading, one display line each.
    pub async fn get_all_readings(&self) -> String {
        readings_text(&self.sensors.readings().await)
    }

    pub async fn add_monitor(
        &self,
        endpoint: Arc<dyn PushTarget>,
        secret: &str,
    ) -> Result<usize, MonitorError> {
        self.monitors.add(endpoint, secret).await
    }

    pub async fn remove_monitor(&self, id: &MonitorId) -> bool {
        self.monitors.remove(id).await
    }

    pub fn monitors(&self) -> &Arc<MonitorRegistry> {
        &self.monitors
    }
}
