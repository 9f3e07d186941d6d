//! Authenticated set of monitor endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use firewatch_core::SecretHash;

use super::endpoint::{MonitorEvent, MonitorId, PushTarget};

/// Default cap on registered monitors.
pub const DEFAULT_MAX_MONITORS: usize = 64;

/// Errors returned by `MonitorRegistry::add`.
///
/// These are for logging only; the remote side learns about the failure
/// through the `Rejected` event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("monitor {0} failed authentication")]
    AuthenticationFailed(MonitorId),

    #[error("monitor registry is full (max: {max} monitors)")]
    Full { max: usize },
}

/// Result of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Endpoints that accepted the original event
    pub delivered: usize,
    /// Endpoints dropped because a delivery failed
    pub removed: Vec<MonitorId>,
}

type MonitorMap = BTreeMap<MonitorId, Arc<dyn PushTarget>>;

/// Registry of monitors that passed authentication.
///
/// Membership changes and the count broadcast they trigger happen under
/// the same lock, so every monitor sees counts in the order they occurred.
pub struct MonitorRegistry {
    secret: SecretHash,
    max_monitors: usize,
    monitors: Mutex<MonitorMap>,
}

impl MonitorRegistry {
    pub fn new(secret: SecretHash) -> Self {
        Self::with_capacity(secret, DEFAULT_MAX_MONITORS)
    }

    pub fn with_capacity(secret: SecretHash, max_monitors: usize) -> Self {
        Self {
            secret,
            max_monitors,
            monitors: Mutex::new(BTreeMap::new()),
        }
    }

    /// Authenticates and registers an endpoint, returning the new count.
    ///
    /// On failure the endpoint receives exactly one `Rejected` event and is
    /// not registered. Re-adding a registered id succeeds without a
    /// broadcast.
    pub async fn add(
        &self,
        endpoint: Arc<dyn PushTarget>,
        provided_secret: &str,
    ) -> Result<usize, MonitorError> {
        let id = endpoint.id().clone();

        if !self.secret.matches(provided_secret) {
            warn!(monitor_id = %id, "Monitor authentication failed");
            let _ = endpoint.deliver(MonitorEvent::rejected("authentication failed"));
            return Err(MonitorError::AuthenticationFailed(id));
        }

        let mut monitors = self.monitors.lock().await;

        if monitors.contains_key(&id) {
            debug!(monitor_id = %id, "Monitor already registered");
            return Ok(monitors.len());
        }

        if monitors.len() >= self.max_monitors {
            warn!(
                monitor_id = %id,
                max = self.max_monitors,
                "Monitor registry is full, rejecting"
            );
            let _ = endpoint.deliver(MonitorEvent::rejected(format!(
                "too many monitors (max: {})",
                self.max_monitors
            )));
            return Err(MonitorError::Full {
                max: self.max_monitors,
            });
        }

        monitors.insert(id.clone(), endpoint);
        info!(monitor_id = %id, total_monitors = monitors.len(), "Monitor added");

        let count = monitors.len();
        broadcast_locked(&mut monitors, MonitorEvent::MonitorCountChanged(count));
        Ok(monitors.len())
    }

    /// Unregisters a monitor. Returns false if it was not registered.
    pub async fn remove(&self, id: &MonitorId) -> bool {
        let mut monitors = self.monitors.lock().await;

        if monitors.remove(id).is_none() {
            return false;
        }
        info!(monitor_id = %id, remaining_monitors = monitors.len(), "Monitor removed");

        let count = monitors.len();
        broadcast_locked(&mut monitors, MonitorEvent::MonitorCountChanged(count));
        true
    }

    pub async fn count(&self) -> usize {
        self.monitors.lock().await.len()
    }

    pub async fn contains(&self, id: &MonitorId) -> bool {
        self.monitors.lock().await.contains_key(id)
    }

    /// Pushes an event to every registered monitor.
    ///
    /// Endpoints whose delivery fails are dropped once the pass completes,
    /// and the remaining monitors are told the new count.
    pub async fn broadcast(&self, event: MonitorEvent) -> BroadcastOutcome {
        let mut monitors = self.monitors.lock().await;
        broadcast_locked(&mut monitors, event)
    }
}

impl std::fmt::Debug for MonitorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorRegistry")
            .field("max_monitors", &self.max_monitors)
            .finish_non_exhaustive()
    }
}

fn broadcast_locked(monitors: &mut MonitorMap, event: MonitorEvent) -> BroadcastOutcome {
    let mut outcome = BroadcastOutcome::default();
    let mut event = event;
    let mut first_pass = true;

    loop {
        let mut failed = Vec::new();
        for (id, endpoint) in monitors.iter() {
            match endpoint.deliver(event.clone()) {
                Ok(()) => {
                    if first_pass {
                        outcome.delivered += 1;
                    }
                }
                Err(e) => {
                    debug!(monitor_id = %id, kind = %event.kind(), error = %e, "Delivery failed");
                    failed.push(id.clone());
                }
            }
        }

        if failed.is_empty() {
            break;
        }

        for id in failed {
            monitors.remove(&id);
            warn!(monitor_id = %id, remaining_monitors = monitors.len(), "Dropped unreachable monitor");
            outcome.removed.push(id);
        }

        event = MonitorEvent::MonitorCountChanged(monitors.len());
        first_pass = false;
    }

    outcome
}
