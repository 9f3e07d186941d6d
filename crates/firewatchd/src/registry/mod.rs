//! Sensor registry using the actor pattern.
//!
//! The registry holds the latest reading of every connected sensor. It
//! receives commands via a tokio mpsc channel and is the only place a
//! reading or its unflushed flag is ever mutated.
//!
//! ```text
//! ┌──────────────────┐     ┌─────────────────┐     ┌───────────────────┐
//! │ IngestionSession │────▶│  RegistryActor  │────▶│ Broadcast Channel │
//! └──────────────────┘     └─────────────────┘     └───────────────────┘
//!          │                        │                        │
//!          │  RegistryCommand       │  SensorEvent           │
//!          ▼                        ▼                        ▼
//!    upsert / release       BTreeMap<SensorId,       handoff publisher,
//!                            SensorEntry>            relay
//! ```

use tokio::sync::{broadcast, mpsc};

mod actor;
mod commands;
mod handle;

pub use actor::{RegistryActor, MAX_PENDING_ALERTS, MAX_SENSORS};
pub use commands::{
    ConnectionId, RegistryCommand, RegistryError, RegistrySnapshot, RemovalReason, SensorEvent,
};
pub use handle::RegistryHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 1024;

/// Spawn the registry actor and return a handle for interaction.
pub fn spawn_registry() -> RegistryHandle {
    spawn_registry_with_capacity(MAX_SENSORS)
}

/// Spawn a registry actor that holds at most `capacity` sensors.
pub fn spawn_registry_with_capacity(capacity: usize) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = RegistryActor::with_capacity(cmd_rx, event_tx.clone(), capacity);
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx, event_tx)
}
