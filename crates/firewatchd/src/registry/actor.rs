//! Registry actor - owns all sensor state and processes commands.
//!
//! The RegistryActor is the single owner of sensor state in the daemon.
//! Every read-modify-write of a reading, including its `unflushed` flag,
//! happens inside `handle_command`, so no caller can observe a reading
//! whose `errors` do not match its values.

use std::collections::{BTreeMap, VecDeque};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use firewatch_core::{ReadingValues, SensorId, SensorReading, Severity};

use super::commands::{
    ConnectionId, RegistryCommand, RegistryError, RegistrySnapshot, RemovalReason, SensorEvent,
};

// ============================================================================
// Resource Limits
// ============================================================================

/// Maximum number of sensors the registry can hold.
pub const MAX_SENSORS: usize = 1000;

/// Maximum number of undrained alerts; the oldest is dropped beyond this.
pub const MAX_PENDING_ALERTS: usize = 256;

// ============================================================================
// Registry Actor
// ============================================================================

struct SensorEntry {
    reading: SensorReading,
    owner: ConnectionId,
}

/// The registry actor - owns all sensor state.
///
/// Receives commands via mpsc channel, processes them sequentially and
/// publishes events to subscribers.
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Latest reading per sensor, ordered by id for stable snapshots
    sensors: BTreeMap<SensorId, SensorEntry>,

    /// Warnings waiting for the next delta
    alerts: VecDeque<String>,

    /// Bumped on every change to `sensors`
    revision: u64,

    capacity: usize,

    event_publisher: broadcast::Sender<SensorEvent>,
}

impl RegistryActor {
    /// Creates a new registry actor holding at most `MAX_SENSORS` sensors.
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<SensorEvent>,
    ) -> Self {
        Self::with_capacity(receiver, event_publisher, MAX_SENSORS)
    }

    pub fn with_capacity(
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<SensorEvent>,
        capacity: usize,
    ) -> Self {
        Self {
            receiver,
            sensors: BTreeMap::new(),
            alerts: VecDeque::new(),
            revision: 0,
            capacity,
            event_publisher,
        }
    }

    /// Runs the actor event loop until every sender is dropped.
    pub async fn run(mut self) {
        info!(capacity = self.capacity, "Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(sensors = self.sensors.len(), "Registry actor stopped");
    }

    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Upsert {
                owner,
                sensor_id,
                values,
                respond_to,
            } => {
                let result = self.handle_upsert(owner, sensor_id, values);
                // Ignore send error - the session may have gone away
                let _ = respond_to.send(result);
            }
            RegistryCommand::SnapshotAll { respond_to } => {
                let _ = respond_to.send(self.readings());
            }
            RegistryCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(RegistrySnapshot {
                    revision: self.revision,
                    readings: self.readings(),
                });
            }
            RegistryCommand::DrainUnflushed { respond_to } => {
                let _ = respond_to.send(self.handle_drain_unflushed());
            }
            RegistryCommand::Remove {
                sensor_id,
                respond_to,
            } => {
                let removed = self.handle_remove(&sensor_id, None, RemovalReason::Explicit);
                let _ = respond_to.send(removed);
            }
            RegistryCommand::Release {
                sensor_id,
                owner,
                respond_to,
            } => {
                let removed =
                    self.handle_remove(&sensor_id, Some(owner), RemovalReason::ConnectionClosed);
                let _ = respond_to.send(removed);
            }
            RegistryCommand::Size { respond_to } => {
                let _ = respond_to.send(self.sensors.len());
            }
            RegistryCommand::RaiseAlert { message } => {
                self.handle_raise_alert(message);
            }
            RegistryCommand::DrainAlerts { respond_to } => {
                let _ = respond_to.send(self.alerts.drain(..).collect());
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_upsert(
        &mut self,
        owner: ConnectionId,
        sensor_id: SensorId,
        values: ReadingValues,
    ) -> Result<Vec<String>, RegistryError> {
        let findings = match self.sensors.get_mut(&sensor_id) {
            Some(entry) => {
                if entry.owner != owner {
                    debug!(
                        sensor_id = %sensor_id,
                        previous = %entry.owner,
                        current = %owner,
                        "Sensor reassigned to a new connection"
                    );
                    entry.owner = owner;
                }
                let findings = entry.reading.apply(values);
                let _ = self.event_publisher.send(SensorEvent::Updated {
                    reading: Box::new(entry.reading.clone()),
                });
                findings
            }
            None => {
                if self.sensors.len() >= self.capacity {
                    warn!(
                        sensor_id = %sensor_id,
                        current = self.sensors.len(),
                        max = self.capacity,
                        "Registry is full, dropping reading"
                    );
                    return Err(RegistryError::RegistryFull { max: self.capacity });
                }

                let (reading, findings) = SensorReading::validated(sensor_id.clone(), values);
                self.sensors.insert(
                    sensor_id.clone(),
                    SensorEntry {
                        reading: reading.clone(),
                        owner,
                    },
                );

                info!(
                    sensor_id = %sensor_id,
                    owner = %owner,
                    total_sensors = self.sensors.len(),
                    "Sensor registered"
                );

                let _ = self.event_publisher.send(SensorEvent::Registered {
                    sensor_id: sensor_id.clone(),
                    count: self.sensors.len(),
                });
                let _ = self.event_publisher.send(SensorEvent::Updated {
                    reading: Box::new(reading),
                });
                findings
            }
        };

        self.revision += 1;

        Ok(findings
            .into_iter()
            .map(|finding| {
                log_finding(finding.severity, &finding.message);
                finding.message
            })
            .collect())
    }

    fn handle_drain_unflushed(&mut self) -> Vec<SensorReading> {
        let drained: Vec<SensorReading> = self
            .sensors
            .values_mut()
            .filter(|entry| entry.reading.unflushed)
            .map(|entry| {
                entry.reading.unflushed = false;
                entry.reading.clone()
            })
            .collect();

        if !drained.is_empty() {
            debug!(count = drained.len(), "Drained unflushed readings");
        }
        drained
    }

    fn handle_remove(
        &mut self,
        sensor_id: &SensorId,
        owner: Option<ConnectionId>,
        reason: RemovalReason,
    ) -> bool {
        let owned = match (self.sensors.get(sensor_id), owner) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(entry), Some(owner)) => entry.owner == owner,
        };

        if !owned {
            debug!(sensor_id = %sensor_id, reason = %reason, "Nothing to remove");
            return false;
        }

        self.sensors.remove(sensor_id);
        self.revision += 1;

        info!(
            sensor_id = %sensor_id,
            reason = %reason,
            remaining_sensors = self.sensors.len(),
            "Sensor removed"
        );

        let _ = self.event_publisher.send(SensorEvent::Removed {
            sensor_id: sensor_id.clone(),
            count: self.sensors.len(),
            reason,
        });
        true
    }

    fn handle_raise_alert(&mut self, message: String) {
        warn!(alert = %message, "Alert raised");

        if self.alerts.len() >= MAX_PENDING_ALERTS {
            self.alerts.pop_front();
        }
        self.alerts.push_back(message.clone());

        let _ = self.event_publisher.send(SensorEvent::Alert { message });
    }

    fn readings(&self) -> Vec<SensorReading> {
        self.sensors
            .values()
            .map(|entry| entry.reading.clone())
            .collect()
    }

    /// Returns the number of sensors currently registered.
    #[cfg(test)]
    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }
}

fn log_finding(severity: Severity, message: &str) {
    match severity {
        Severity::Danger | Severity::Malfunction => warn!(severity = ?severity, "{message}"),
        Severity::Warning => info!(severity = ?severity, "{message}"),
    }
}
