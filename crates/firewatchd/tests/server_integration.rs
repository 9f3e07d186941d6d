//! End-to-end tests for the combined daemon: sensor server, registry,
//! in-process relay and monitor server on real TCP sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use firewatch_core::{ReadingValues, SecretHash, SensorId};
use firewatch_protocol::{DaemonMessage, MonitorMessage, SensorMessage, SensorReply};
use firewatchd::dispatch::NotificationDispatcher;
use firewatchd::handoff::{RegistryHandoff, SnapshotMirror};
use firewatchd::monitors::MonitorRegistry;
use firewatchd::registry::{spawn_registry, RegistryHandle};
use firewatchd::relay::run_relay;
use firewatchd::server::{MonitorServer, SensorServer};
use firewatchd::service::{FireAlarmService, SensorSource};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

const SENSOR_SECRET: &str = "sensor-secret";
const MONITOR_SECRET: &str = "monitor-secret";

/// Upper bound for any single expected message
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Test Helpers
// ============================================================================

/// A running daemon in "all" mode on ephemeral ports.
struct TestDaemon {
    sensor_addr: SocketAddr,
    monitor_addr: SocketAddr,
    registry: RegistryHandle,
    cancel_token: CancellationToken,
}

impl TestDaemon {
    async fn spawn() -> Self {
        let registry = spawn_registry();
        let cancel_token = CancellationToken::new();
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let monitors = Arc::new(MonitorRegistry::new(SecretHash::of(MONITOR_SECRET)));
        let service = FireAlarmService::new(SensorSource::Live(registry.clone()), Arc::clone(&monitors));

        let sensor_server = SensorServer::bind(
            any,
            registry.clone(),
            SecretHash::of(SENSOR_SECRET),
            cancel_token.clone(),
        )
        .await
        .expect("bind sensor server");
        let monitor_server = MonitorServer::bind(any, service, cancel_token.clone())
            .await
            .expect("bind monitor server");

        let sensor_addr = sensor_server.local_addr();
        let monitor_addr = monitor_server.local_addr();

        tokio::spawn(sensor_server.run());
        tokio::spawn(monitor_server.run());
        tokio::spawn(run_relay(
            RegistryHandoff::new(registry.clone()),
            NotificationDispatcher::new(monitors),
            SnapshotMirror::new(),
            cancel_token.clone(),
        ));

        Self {
            sensor_addr,
            monitor_addr,
            registry,
            cancel_token,
        }
    }

    async fn wait_for_size(&self, expected: usize) {
        let result = timeout(RECV_TIMEOUT, async {
            while self.registry.size().await != expected {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "registry size never reached {expected}");
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

struct LineClient {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl LineClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send<T: serde::Serialize>(&mut self, msg: &T) {
        let json = serde_json::to_string(msg).unwrap();
        self.writer.write_all(json.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv<T: serde::de::DeserializeOwned>(&mut self) -> T {
        let line = timeout(RECV_TIMEOUT, self.reader.next_line())
            .await
            .expect("timed out waiting for a line")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    /// Reads daemon messages until one matches, skipping the rest.
    async fn recv_until<F>(&mut self, mut matches: F) -> DaemonMessage
    where
        F: FnMut(&DaemonMessage) -> bool,
    {
        loop {
            let msg: DaemonMessage = self.recv().await;
            if matches(&msg) {
                return msg;
            }
        }
    }
}

async fn authenticated_sensor(daemon: &TestDaemon) -> LineClient {
    let mut sensor = LineClient::connect(daemon.sensor_addr).await;
    sensor.send(&SensorMessage::authenticate(SENSOR_SECRET)).await;
    let reply: SensorReply = sensor.recv().await;
    assert!(matches!(reply, SensorReply::Authenticated { .. }));
    sensor
}

async fn registered_monitor(daemon: &TestDaemon) -> LineClient {
    let mut monitor = LineClient::connect(daemon.monitor_addr).await;
    monitor.send(&MonitorMessage::add_monitor(MONITOR_SECRET)).await;
    monitor
        .recv_until(|m| matches!(m, DaemonMessage::MonitorAdded { .. }))
        .await;
    monitor
}

fn data_text(msg: DaemonMessage) -> String {
    match msg {
        DaemonMessage::Data { text } => text,
        other => panic!("Expected Data, got {other:?}"),
    }
}

// ============================================================================
// End-to-end
// ============================================================================

#[tokio::test]
async fn test_end_to_end_reading_flow() {
    let daemon = TestDaemon::spawn().await;
    let mut monitor = registered_monitor(&daemon).await;
    let mut sensor = authenticated_sensor(&daemon).await;

    // First reading reaches the monitor
    let id = SensorId::new("1-1");
    sensor
        .send(&SensorMessage::reading(&id, &ReadingValues::new(89.0, 100, 3, 300.0)))
        .await;
    let text = data_text(
        monitor
            .recv_until(|m| matches!(m, DaemonMessage::Data { .. }))
            .await,
    );
    assert!(text.starts_with("1-1 : 89.0 100 3 300.0"));
    // 89.0 is already above the 50.0 limit
    assert!(text.contains("1-1 : Temperature is reaching a dangerous level at 89.0 celsius."));
    daemon.wait_for_size(1).await;

    // Dangerous temperature is flagged on the update
    sensor
        .send(&SensorMessage::reading(&id, &ReadingValues::new(95.0, 100, 3, 300.0)))
        .await;
    let text = data_text(
        monitor
            .recv_until(|m| matches!(m, DaemonMessage::Data { text } if text.contains("95.0")))
            .await,
    );
    assert!(text.contains("1-1 : Temperature is reaching a dangerous level at 95.0 celsius."));
    assert_eq!(daemon.registry.size().await, 1);

    let stored = daemon.registry.snapshot_all().await;
    assert_eq!(stored.len(), 1);
    assert!(stored[0].errors.iter().any(|e| e.contains("dangerous level at 95.0")));

    // Dropping the sensor connection removes it and tells the monitor
    drop(sensor);
    monitor
        .recv_until(|m| matches!(m, DaemonMessage::SensorCountChanged { count: 0 }))
        .await;
    daemon.wait_for_size(0).await;
}

#[tokio::test]
async fn test_sensor_count_pushed_on_connect() {
    let daemon = TestDaemon::spawn().await;
    let mut monitor = registered_monitor(&daemon).await;

    let mut sensor = authenticated_sensor(&daemon).await;
    sensor
        .send(&SensorMessage::reading(
            &SensorId::new("2-1"),
            &ReadingValues::new(20.0, 80, 2, 300.0),
        ))
        .await;

    monitor
        .recv_until(|m| matches!(m, DaemonMessage::SensorCountChanged { count: 1 }))
        .await;
}

#[tokio::test]
async fn test_queries_answer_from_live_registry() {
    let daemon = TestDaemon::spawn().await;
    let mut sensor = authenticated_sensor(&daemon).await;
    sensor
        .send(&SensorMessage::reading(
            &SensorId::new("3-1"),
            &ReadingValues::new(20.0, 80, 2, 300.0),
        ))
        .await;
    daemon.wait_for_size(1).await;

    // Queries need no registration
    let mut client = LineClient::connect(daemon.monitor_addr).await;
    client.send(&MonitorMessage::get_sensor_count()).await;
    assert_eq!(client.recv::<DaemonMessage>().await, DaemonMessage::SensorCount { count: 1 });

    client.send(&MonitorMessage::get_monitor_count()).await;
    assert_eq!(client.recv::<DaemonMessage>().await, DaemonMessage::MonitorCount { count: 0 });

    client.send(&MonitorMessage::get_all_readings()).await;
    assert_eq!(
        client.recv::<DaemonMessage>().await,
        DaemonMessage::AllReadings {
            text: "3-1 : 20.0 80 2 300.0".to_string()
        }
    );
}

#[tokio::test]
async fn test_monitor_count_broadcast_on_add_and_leave() {
    let daemon = TestDaemon::spawn().await;
    let mut first = registered_monitor(&daemon).await;

    let mut second = LineClient::connect(daemon.monitor_addr).await;
    second.send(&MonitorMessage::add_monitor(MONITOR_SECRET)).await;
    first
        .recv_until(|m| matches!(m, DaemonMessage::MonitorCountChanged { count: 2 }))
        .await;

    second.send(&MonitorMessage::disconnect()).await;
    first
        .recv_until(|m| matches!(m, DaemonMessage::MonitorCountChanged { count: 1 }))
        .await;
}

#[tokio::test]
async fn test_two_sensors_one_connection_drop() {
    let daemon = TestDaemon::spawn().await;
    let mut a = authenticated_sensor(&daemon).await;
    let mut b = authenticated_sensor(&daemon).await;
    let values = ReadingValues::new(20.0, 80, 2, 300.0);

    a.send(&SensorMessage::reading(&SensorId::new("a"), &values)).await;
    b.send(&SensorMessage::reading(&SensorId::new("b"), &values)).await;
    daemon.wait_for_size(2).await;

    drop(a);
    daemon.wait_for_size(1).await;
    let remaining = daemon.registry.snapshot_all().await;
    assert_eq!(remaining[0].sensor_id.as_str(), "b");
}

#[tokio::test]
async fn test_duplicate_connection_keeps_sensor() {
    let daemon = TestDaemon::spawn().await;
    let mut old = authenticated_sensor(&daemon).await;
    let mut new = authenticated_sensor(&daemon).await;
    let values = ReadingValues::new(20.0, 80, 2, 300.0);
    let id = SensorId::new("flaky");

    old.send(&SensorMessage::reading(&id, &values)).await;
    daemon.wait_for_size(1).await;
    new.send(&SensorMessage::reading(&id, &values)).await;

    // Give the newer write time to take ownership
    sleep(Duration::from_millis(100)).await;
    drop(old);
    sleep(Duration::from_millis(100)).await;

    assert_eq!(daemon.registry.size().await, 1);

    drop(new);
    daemon.wait_for_size(0).await;
}

#[tokio::test]
async fn test_graceful_shutdown_clears_sensors() {
    let daemon = TestDaemon::spawn().await;
    let mut sensor = authenticated_sensor(&daemon).await;
    sensor
        .send(&SensorMessage::reading(
            &SensorId::new("s"),
            &ReadingValues::new(20.0, 80, 2, 300.0),
        ))
        .await;
    daemon.wait_for_size(1).await;

    daemon.cancel_token.cancel();
    daemon.wait_for_size(0).await;

    // The session closed its side of the stream
    let closed = timeout(RECV_TIMEOUT, sensor.reader.next_line()).await;
    assert!(matches!(closed, Ok(Ok(None)) | Ok(Err(_))));
}
