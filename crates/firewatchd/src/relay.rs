//! The relay task: turns handoff views into monitor broadcasts.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::NotificationDispatcher;
use crate::handoff::{HandoffError, HandoffSource, SnapshotMirror};
use crate::monitors::MonitorEvent;

/// What the relay last told monitors.
#[derive(Debug, Default)]
struct RelayState {
    snapshot_version: Option<u64>,
    sensor_count: Option<usize>,
}

/// Runs until cancelled or until the handoff source closes.
///
/// Each pass pushes the pending delta (one batch plus one push per alert),
/// refreshes the mirror when the snapshot version moves and announces the
/// sensor count whenever it differs from the last one announced.
pub async fn run_relay<H: HandoffSource>(
    mut handoff: H,
    dispatcher: NotificationDispatcher,
    mirror: SnapshotMirror,
    cancel: CancellationToken,
) {
    info!("Relay started");
    let mut state = RelayState::default();

    loop {
        relay_pass(&mut handoff, &dispatcher, &mirror, &mut state).await;

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Relay shutdown requested");
                break;
            }
            result = handoff.changed() => {
                if let Err(HandoffError::Closed) = result {
                    debug!("Handoff source closed");
                    break;
                }
            }
        }
    }

    info!("Relay stopped");
}

async fn relay_pass<H: HandoffSource>(
    handoff: &mut H,
    dispatcher: &NotificationDispatcher,
    mirror: &SnapshotMirror,
    state: &mut RelayState,
) {
    match handoff.read_delta().await {
        Ok(Some(delta)) => {
            debug!(
                sequence = delta.sequence,
                readings = delta.readings.len(),
                alerts = delta.alerts.len(),
                "Relaying delta"
            );
            dispatcher.broadcast_readings(&delta.readings).await;
            for alert in delta.alerts {
                dispatcher.broadcast(MonitorEvent::data(alert)).await;
            }
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Failed to read delta, retrying next cycle"),
    }

    match handoff.read_snapshot().await {
        Ok(snapshot) => {
            if state.snapshot_version == Some(snapshot.version) {
                return;
            }
            let count = snapshot.count();
            state.snapshot_version = Some(snapshot.version);
            mirror.update(snapshot).await;

            if state.sensor_count != Some(count) {
                info!(count, "Sensor count changed");
                dispatcher.broadcast_sensor_count(count).await;
                state.sensor_count = Some(count);
            }
        }
        Err(e) => warn!(error = %e, "Failed to read snapshot, retrying next cycle"),
    }
}
