//! Integration tests for split-process operation.
//!
//! The ingest side (registry + `run_publisher`) and the relay side
//! (`FileHandoffReader` + `run_relay`) share nothing but a temp directory.

use std::sync::Arc;
use std::time::Duration;

use firewatch_core::{ReadingValues, SecretHash, SensorId};
use firewatchd::dispatch::NotificationDispatcher;
use firewatchd::handoff::{
    run_publisher, FileHandoffReader, FileHandoffWriter, HandoffSource, SnapshotMirror,
    DELTA_FILE,
};
use firewatchd::monitors::{ChannelEndpoint, MonitorEvent, MonitorId, MonitorRegistry};
use firewatchd::registry::{spawn_registry, ConnectionId, RegistryHandle};
use firewatchd::relay::run_relay;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const POLL: Duration = Duration::from_millis(20);
const WAIT: Duration = Duration::from_secs(3);

// ============================================================================
// Test Helpers
// ============================================================================

struct SplitDaemon {
    registry: RegistryHandle,
    mirror: SnapshotMirror,
    events: mpsc::Receiver<MonitorEvent>,
    cancel_token: CancellationToken,
    _dir: tempfile::TempDir,
}

impl SplitDaemon {
    async fn spawn() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let cancel_token = CancellationToken::new();

        // Ingest side
        let registry = spawn_registry();
        let writer = FileHandoffWriter::open(dir.path(), registry.clone())
            .await
            .expect("open writer");
        tokio::spawn(run_publisher(writer, POLL, cancel_token.clone()));

        // Relay side
        let monitors = Arc::new(MonitorRegistry::new(SecretHash::of("m")));
        let (endpoint, mut events) = ChannelEndpoint::new(MonitorId::new("watcher"), 256);
        monitors.add(Arc::new(endpoint), "m").await.expect("add monitor");
        let _ = events.recv().await;

        let reader = FileHandoffReader::open(dir.path(), POLL)
            .await
            .expect("open reader");
        let mirror = SnapshotMirror::new();
        tokio::spawn(run_relay(
            reader,
            NotificationDispatcher::new(monitors),
            mirror.clone(),
            cancel_token.clone(),
        ));

        Self {
            registry,
            mirror,
            events,
            cancel_token,
            _dir: dir,
        }
    }

    async fn expect_event<F>(&mut self, mut matches: F) -> MonitorEvent
    where
        F: FnMut(&MonitorEvent) -> bool,
    {
        timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.expect("monitor channel open");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected monitor event never arrived")
    }
}

impl Drop for SplitDaemon {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_reading_crosses_process_boundary() {
    let mut daemon = SplitDaemon::spawn().await;
    let owner = ConnectionId::next();

    daemon
        .registry
        .upsert(owner, SensorId::new("1-1"), ReadingValues::new(89.0, 100, 3, 300.0))
        .await
        .unwrap();

    let event = daemon
        .expect_event(|e| matches!(e, MonitorEvent::Data { .. }))
        .await;
    match event {
        MonitorEvent::Data { text } => {
            assert!(text.starts_with("1-1 : 89.0 100 3 300.0"));
            assert!(text.contains("1-1 : Temperature is reaching a dangerous level at 89.0 celsius."));
        }
        other => panic!("Expected Data, got {other:?}"),
    }

    daemon
        .expect_event(|e| matches!(e, MonitorEvent::SensorCountChanged(1)))
        .await;
    assert_eq!(daemon.mirror.count().await, 1);

    daemon.registry.release(SensorId::new("1-1"), owner).await;
    daemon
        .expect_event(|e| matches!(e, MonitorEvent::SensorCountChanged(0)))
        .await;
    assert_eq!(daemon.mirror.count().await, 0);
}

#[tokio::test]
async fn test_alert_crosses_process_boundary() {
    let mut daemon = SplitDaemon::spawn().await;

    daemon
        .registry
        .raise_alert("7-7 : No reading received for 3600 seconds; the sensor may be faulty.")
        .await
        .unwrap();

    daemon
        .expect_event(|e| matches!(e, MonitorEvent::Data { text } if text.starts_with("7-7 :")))
        .await;
}

#[tokio::test]
async fn test_each_change_delivered_once() {
    let mut daemon = SplitDaemon::spawn().await;
    let owner = ConnectionId::next();

    daemon
        .registry
        .upsert(owner, SensorId::new("once"), ReadingValues::new(20.0, 80, 2, 300.0))
        .await
        .unwrap();
    daemon
        .expect_event(|e| matches!(e, MonitorEvent::Data { .. }))
        .await;

    // Several quiet poll cycles must not repeat the batch
    tokio::time::sleep(POLL * 10).await;
    while let Ok(event) = daemon.events.try_recv() {
        assert!(
            !matches!(event, MonitorEvent::Data { .. }),
            "batch delivered twice: {event:?}"
        );
    }
}

#[tokio::test]
async fn test_acknowledged_batches_pruned() {
    let dir = tempfile::tempdir().unwrap();
    let registry = spawn_registry();
    let mut writer = FileHandoffWriter::open(dir.path(), registry.clone()).await.unwrap();
    let mut reader = FileHandoffReader::open(dir.path(), POLL).await.unwrap();

    registry
        .upsert(ConnectionId::next(), SensorId::new("p"), ReadingValues::new(20.0, 80, 2, 300.0))
        .await
        .unwrap();
    writer.publish().await.unwrap();

    let delta = reader.read_delta().await.unwrap().expect("pending delta");
    assert_eq!(delta.readings.len(), 1);
    assert_eq!(reader.acknowledged(), delta.sequence);

    writer.publish().await.unwrap();
    let text = std::fs::read_to_string(dir.path().join(DELTA_FILE)).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(doc["batches"].as_array().map(Vec::len), Some(0));

    // The snapshot survives delta consumption
    assert_eq!(reader.read_snapshot().await.unwrap().count(), 1);
}

#[tokio::test]
async fn test_reader_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let registry = spawn_registry();
    let mut writer = FileHandoffWriter::open(dir.path(), registry.clone()).await.unwrap();
    let owner = ConnectionId::next();

    registry
        .upsert(owner, SensorId::new("a"), ReadingValues::new(20.0, 80, 2, 300.0))
        .await
        .unwrap();
    writer.publish().await.unwrap();
    {
        let mut reader = FileHandoffReader::open(dir.path(), POLL).await.unwrap();
        assert!(reader.read_delta().await.unwrap().is_some());
    }

    registry
        .upsert(owner, SensorId::new("b"), ReadingValues::new(20.0, 80, 2, 300.0))
        .await
        .unwrap();
    writer.publish().await.unwrap();

    let mut reader = FileHandoffReader::open(dir.path(), POLL).await.unwrap();
    let delta = reader.read_delta().await.unwrap().expect("pending delta");
    let ids: Vec<&str> = delta.readings.iter().map(|r| r.sensor_id.as_str()).collect();
    assert_eq!(ids, vec!["b"]);
}

#[tokio::test]
async fn test_corrupt_delta_reported_then_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let registry = spawn_registry();
    let mut reader = FileHandoffReader::open(dir.path(), POLL).await.unwrap();

    std::fs::write(dir.path().join(DELTA_FILE), b"{\"batches\": [").unwrap();
    assert!(reader.read_delta().await.is_err());

    // The writer replaces the unreadable document on its next publish
    let mut writer = FileHandoffWriter::open(dir.path(), registry.clone()).await.unwrap();
    registry
        .upsert(ConnectionId::next(), SensorId::new("c"), ReadingValues::new(20.0, 80, 2, 300.0))
        .await
        .unwrap();
    writer.publish().await.unwrap();

    let delta = reader.read_delta().await.unwrap().expect("pending delta");
    assert_eq!(delta.readings.len(), 1);
}
