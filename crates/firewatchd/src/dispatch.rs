//! Fan-out of reading batches and counts to registered monitors.

use std::sync::Arc;

use tracing::{debug, info};

use firewatch_core::SensorReading;

use crate::monitors::{BroadcastOutcome, MonitorEvent, MonitorRegistry};

/// Broadcasts events to every monitor in a `MonitorRegistry`.
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    monitors: Arc<MonitorRegistry>,
}

impl NotificationDispatcher {
    pub fn new(monitors: Arc<MonitorRegistry>) -> Self {
        Self { monitors }
    }

    pub fn monitors(&self) -> &Arc<MonitorRegistry> {
        &self.monitors
    }

    /// Delivers `event` to all registered monitors without waiting on any
    /// of them.
    pub async fn broadcast(&self, event: MonitorEvent) -> BroadcastOutcome {
        let kind = event.kind();
        let outcome = self.monitors.broadcast(event).await;

        if outcome.removed.is_empty() {
            debug!(kind = %kind, delivered = outcome.delivered, "Broadcast complete");
        } else {
            info!(
                kind = %kind,
                delivered = outcome.delivered,
                removed = outcome.removed.len(),
                "Broadcast complete, dropped unreachable monitors"
            );
        }
        outcome
    }

    pub async fn broadcast_readings(&self, readings: &[SensorReading]) -> Option<BroadcastOutcome> {
        if readings.is_empty() {
            return None;
        }
        Some(self.broadcast(MonitorEvent::data(batch_text(readings))).await)
    }

    pub async fn broadcast_sensor_count(&self, count: usize) -> BroadcastOutcome {
        self.broadcast(MonitorEvent::SensorCountChanged(count)).await
    }
}

/// Formats a reading batch: each sensor's summary line followed by one
/// line per validation error.
pub fn batch_text(readings: &[SensorReading]) -> String {
    let mut lines = Vec::with_capacity(readings.len());
    for reading in readings {
        lines.push(reading.summary_line());
        lines.extend(reading.errors.iter().cloned());
    }
    lines.join("\n")
}

/// Formats the `get_all_readings` reply: one display line per sensor.
pub fn readings_text(readings: &[SensorReading]) -> String {
    readings
        .iter()
        .map(SensorReading::display_line)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitors::{ChannelEndpoint, MonitorId};
    use firewatch_core::{ReadingValues, SecretHash, SensorId};

    fn reading(id: &str, t: f64) -> SensorReading {
        SensorReading::new(SensorId::new(id), ReadingValues::new(t, 100, 3, 300.0))
    }

    #[test]
    fn test_batch_text_lists_errors_after_sensor() {
        let text = batch_text(&[reading("1-1", 95.0), reading("1-2", 20.0)]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "1-1 : 95.0 100 3 300.0",
                "1-1 : Temperature is reaching a dangerous level at 95.0 celsius.",
                "1-2 : 20.0 100 3 300.0",
            ]
        );
    }

    #[test]
    fn test_readings_text_inlines_errors() {
        let text = readings_text(&[reading("1-1", 95.0)]);
        assert!(text.starts_with("1-1 : 95.0 100 3 300.0 | 1-1 : Temperature"));
        assert_eq!(readings_text(&[]), "");
    }

    #[tokio::test]
    async fn test_empty_batch_not_broadcast() {
        let monitors = Arc::new(MonitorRegistry::new(SecretHash::of("s")));
        let (endpoint, mut rx) = ChannelEndpoint::new(MonitorId::new("m"), 8);
        monitors.add(Arc::new(endpoint), "s").await.unwrap();
        let _ = rx.try_recv();

        let dispatcher = NotificationDispatcher::new(monitors);
        assert!(dispatcher.broadcast_readings(&[]).await.is_none());
        assert!(rx.try_recv().is_err());

        dispatcher.broadcast_sensor_count(4).await;
        assert_eq!(rx.recv().await, Some(MonitorEvent::SensorCountChanged(4)));
    }
}
