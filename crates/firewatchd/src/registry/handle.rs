//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` is cheap to clone. Query methods degrade to empty
//! results when the actor is gone; mutating methods surface
//! `RegistryError::ChannelClosed` instead.

use tokio::sync::{broadcast, mpsc, oneshot};

use firewatch_core::{ReadingValues, SensorId, SensorReading};

use super::commands::{
    ConnectionId, RegistryCommand, RegistryError, RegistrySnapshot, SensorEvent,
};

/// Handle for interacting with the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
    event_sender: broadcast::Sender<SensorEvent>,
}

impl RegistryHandle {
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<SensorEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Validates and stores a report, returning its validation errors.
    ///
    /// The reading is attributed to `owner`, so only that connection's
    /// `release` can remove it later.
    ///
    /// # Errors
    ///
    /// - `RegistryError::RegistryFull` if the id is new and the registry is full
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn upsert(
        &self,
        owner: ConnectionId,
        sensor_id: SensorId,
        values: ReadingValues,
    ) -> Result<Vec<String>, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Upsert {
                owner,
                sensor_id,
                values,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Every stored reading, flushed or not, ordered by sensor id.
    pub async fn snapshot_all(&self) -> Vec<SensorReading> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::SnapshotAll { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Every stored reading together with the registry revision.
    ///
    /// # Errors
    ///
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn snapshot(&self) -> Result<RegistrySnapshot, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Snapshot { respond_to: tx })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Takes the readings changed since the previous drain.
    ///
    /// Each change is returned at most once; the readings themselves stay
    /// in the registry.
    pub async fn drain_unflushed(&self) -> Vec<SensorReading> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::DrainUnflushed { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Removes a sensor. Returns false if it was not present.
    pub async fn remove(&self, sensor_id: SensorId) -> bool {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::Remove {
                sensor_id,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return false;
        }

        rx.await.unwrap_or(false)
    }

    /// Removes a sensor only if `owner` wrote it last.
    pub async fn release(&self, sensor_id: SensorId, owner: ConnectionId) -> bool {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::Release {
                sensor_id,
                owner,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return false;
        }

        rx.await.unwrap_or(false)
    }

    /// Number of stored sensors (0 if the actor is gone).
    pub async fn size(&self) -> usize {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::Size { respond_to: tx })
            .await
            .is_err()
        {
            return 0;
        }

        rx.await.unwrap_or(0)
    }

    /// Queues a warning for monitors.
    ///
    /// # Errors
    ///
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn raise_alert(&self, message: impl Into<String>) -> Result<(), RegistryError> {
        self.sender
            .send(RegistryCommand::RaiseAlert {
                message: message.into(),
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)
    }

    /// Takes every queued warning.
    pub async fn drain_alerts(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::DrainAlerts { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Subscribe to registry events.
    ///
    /// Events published before subscribing are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<SensorEvent> {
        self.event_sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_sender.receiver_count()
    }
}

impl std::fmt::Debug for RegistryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryHandle")
            .field("subscribers", &self.event_sender.receiver_count())
            .finish()
    }
}
