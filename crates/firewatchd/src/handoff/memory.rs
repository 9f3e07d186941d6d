use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};

use crate::registry::{RegistryHandle, SensorEvent};

use super::{DeltaView, HandoffError, HandoffSource, SnapshotView};

/// In-process handoff reading straight from the registry actor.
///
/// `changed` is driven by registry events, so the relay wakes exactly when
/// something happened.
pub struct RegistryHandoff {
    registry: RegistryHandle,
    events: broadcast::Receiver<SensorEvent>,
    sequence: u64,
}

impl RegistryHandoff {
    pub fn new(registry: RegistryHandle) -> Self {
        let events = registry.subscribe();
        Self {
            registry,
            events,
            sequence: 0,
        }
    }
}

impl HandoffSource for RegistryHandoff {
    async fn changed(&mut self) -> Result<(), HandoffError> {
        match self.events.recv().await {
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Handoff lagged behind registry events");
            }
            Err(RecvError::Closed) => return Err(HandoffError::Closed),
        }

        // Coalesce a burst of events into one wake-up
        loop {
            match self.events.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Closed) => return Ok(()),
            }
        }
    }

    async fn read_delta(&mut self) -> Result<Option<DeltaView>, HandoffError> {
        let readings = self.registry.drain_unflushed().await;
        let alerts = self.registry.drain_alerts().await;

        if readings.is_empty() && alerts.is_empty() {
            return Ok(None);
        }

        self.sequence += 1;
        debug!(
            sequence = self.sequence,
            readings = readings.len(),
            alerts = alerts.len(),
            "Read in-process delta"
        );
        Ok(Some(DeltaView {
            sequence: self.sequence,
            readings,
            alerts,
        }))
    }

    async fn read_snapshot(&mut self) -> Result<SnapshotView, HandoffError> {
        let snapshot = self.registry.snapshot().await?;
        Ok(SnapshotView {
            version: snapshot.revision,
            readings: snapshot.readings,
        })
    }
}
