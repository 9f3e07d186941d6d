//! Connection handler for monitor clients.
//!
//! Each monitor connection gets a `MonitorConnection` that answers request
//! lines and, once registered, carries pushed events on the same stream.
//! Replies and pushes share one outbox drained by a writer task, so they
//! never interleave mid-line.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use firewatch_protocol::{
    DaemonMessage, MonitorMessage, MonitorRequest, ProtocolVersion, MAX_LINE_LENGTH,
};

use crate::monitors::{DeliveryError, MonitorEvent, MonitorId, PushTarget};
use crate::service::FireAlarmService;

/// Messages queued for one connection before pushes count as backlogged.
pub const OUTBOX_CAPACITY: usize = 256;

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that end a monitor connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("connection outbox closed")]
    Closed,

    #[error("write timeout")]
    WriteTimeout,
}

/// `PushTarget` writing into a connection's outbox.
#[derive(Debug, Clone)]
pub struct SocketEndpoint {
    id: MonitorId,
    outbox: mpsc::Sender<DaemonMessage>,
}

impl SocketEndpoint {
    pub fn new(id: MonitorId, outbox: mpsc::Sender<DaemonMessage>) -> Self {
        Self { id, outbox }
    }
}

impl PushTarget for SocketEndpoint {
    fn id(&self) -> &MonitorId {
        &self.id
    }

    fn deliver(&self, event: MonitorEvent) -> Result<(), DeliveryError> {
        self.outbox.try_send(event.into()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Backlogged,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

enum Flow {
    Continue,
    Close,
}

/// One monitor connection.
pub struct MonitorConnection<R, W> {
    peer: String,
    lines: FramedRead<R, LinesCodec>,
    writer: W,
    service: FireAlarmService,
    cancel: CancellationToken,
    /// Set while this connection is registered for pushes
    monitor_id: Option<MonitorId>,
}

impl<R, W> MonitorConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        reader: R,
        writer: W,
        service: FireAlarmService,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            peer: String::from("monitor"),
            lines: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            writer,
            service,
            cancel,
            monitor_id: None,
        }
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    /// Serves requests until the monitor leaves, is rejected, or the daemon
    /// shuts down. A registered monitor is removed on the way out.
    pub async fn run(self) -> Result<(), ConnectionError> {
        let Self {
            peer,
            mut lines,
            writer,
            service,
            cancel,
            monitor_id,
        } = self;

        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let writer_task = tokio::spawn(write_outbox(writer, outbox_rx));

        let mut handler = RequestHandler {
            peer,
            service,
            outbox,
            monitor_id,
        };
        debug!(peer = %handler.peer, "Monitor connected");

        let result = handler.serve(&mut lines, &cancel).await;

        if let Some(id) = handler.monitor_id.take() {
            handler.service.remove_monitor(&id).await;
        }
        let peer = handler.peer.clone();
        drop(handler);

        // The outbox closes once every sender is gone; let queued lines drain
        match timeout(WRITE_TIMEOUT, writer_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => debug!(peer = %peer, error = %e, "Writer stopped early"),
            Ok(Err(e)) => warn!(peer = %peer, error = %e, "Writer task failed"),
            Err(_) => warn!(peer = %peer, "Timed out draining monitor outbox"),
        }

        info!(peer = %peer, "Monitor disconnected");
        result
    }
}

struct RequestHandler {
    peer: String,
    service: FireAlarmService,
    outbox: mpsc::Sender<DaemonMessage>,
    monitor_id: Option<MonitorId>,
}

impl RequestHandler {
    async fn serve<R>(
        &mut self,
        lines: &mut FramedRead<R, LinesCodec>,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = lines.next() => frame,
            };

            let line = match frame {
                None => return Ok(()),
                Some(Ok(line)) => line,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    self.reply(DaemonMessage::error_with_code(
                        "request too long",
                        "line_too_long",
                    ))
                    .await?;
                    continue;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    return Err(ConnectionError::Io(e.to_string()))
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            let msg: MonitorMessage = match serde_json::from_str(&line) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "Invalid monitor request");
                    self.reply(DaemonMessage::error_with_code(
                        &format!("invalid request: {e}"),
                        "invalid_request",
                    ))
                    .await?;
                    continue;
                }
            };

            if !msg.protocol_version.is_compatible_with(&ProtocolVersion::CURRENT) {
                warn!(
                    peer = %self.peer,
                    client_version = %msg.protocol_version,
                    server_version = %ProtocolVersion::CURRENT,
                    "Protocol version mismatch"
                );
                self.reply(DaemonMessage::rejected(&format!(
                    "protocol version {} not compatible with server version {}",
                    msg.protocol_version,
                    ProtocolVersion::CURRENT
                )))
                .await?;
                return Err(ConnectionError::VersionMismatch {
                    client: msg.protocol_version,
                    server: ProtocolVersion::CURRENT,
                });
            }

            match self.handle_request(msg.request).await? {
                Flow::Continue => {}
                Flow::Close => return Ok(()),
            }
        }
    }

    async fn handle_request(&mut self, request: MonitorRequest) -> Result<Flow, ConnectionError> {
        match request {
            MonitorRequest::AddMonitor { secret } => return self.handle_add(&secret).await,
            MonitorRequest::RemoveMonitor => match self.monitor_id.take() {
                Some(id) if self.service.remove_monitor(&id).await => {
                    let count = self.service.get_monitor_count().await;
                    self.reply(DaemonMessage::MonitorCount { count }).await?;
                }
                _ => {
                    self.reply(DaemonMessage::error_with_code(
                        "monitor not registered",
                        "not_registered",
                    ))
                    .await?;
                }
            },
            MonitorRequest::GetSensorCount => {
                let count = self.service.get_sensor_count().await;
                self.reply(DaemonMessage::SensorCount { count }).await?;
            }
            MonitorRequest::GetMonitorCount => {
                let count = self.service.get_monitor_count().await;
                self.reply(DaemonMessage::MonitorCount { count }).await?;
            }
            MonitorRequest::GetAllReadings => {
                let text = self.service.get_all_readings().await;
                self.reply(DaemonMessage::AllReadings { text }).await?;
            }
            MonitorRequest::Ping { seq } => {
                self.reply(DaemonMessage::Pong { seq }).await?;
            }
            MonitorRequest::Disconnect => {
                debug!(peer = %self.peer, "Monitor requested disconnect");
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_add(&mut self, secret: &str) -> Result<Flow, ConnectionError> {
        if let Some(id) = &self.monitor_id {
            if self.service.monitors().contains(id).await {
                let reply = DaemonMessage::monitor_added(id.as_str());
                self.reply(reply).await?;
                return Ok(Flow::Continue);
            }
            // Dropped by a broadcast while its outbox was full
            info!(peer = %self.peer, monitor_id = %id, "Re-registering dropped monitor");
        }

        let id = self.monitor_id.take().unwrap_or_else(MonitorId::generate);
        let endpoint = Arc::new(SocketEndpoint::new(id.clone(), self.outbox.clone()));

        match self.service.add_monitor(endpoint, secret).await {
            Ok(count) => {
                info!(peer = %self.peer, monitor_id = %id, total_monitors = count, "Monitor registered");
                self.reply(DaemonMessage::monitor_added(id.as_str())).await?;
                self.monitor_id = Some(id);
                self.send_current_state().await?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                // The Rejected push is already queued; close after it drains
                warn!(peer = %self.peer, error = %e, "Monitor registration refused");
                Ok(Flow::Close)
            }
        }
    }

    /// Brings a newly registered monitor up to date: the readings it would
    /// otherwise only see on the next change, then the sensor count.
    async fn send_current_state(&self) -> Result<(), ConnectionError> {
        let text = self.service.get_all_readings().await;
        if !text.is_empty() {
            self.reply(DaemonMessage::Data { text }).await?;
        }
        let count = self.service.get_sensor_count().await;
        self.reply(DaemonMessage::SensorCountChanged { count }).await
    }

    async fn reply(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        match timeout(WRITE_TIMEOUT, self.outbox.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }
}

/// Drains the outbox onto the socket, one JSON line per message.
async fn write_outbox<W>(
    writer: W,
    mut outbox: mpsc::Receiver<DaemonMessage>,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);

    while let Some(msg) = outbox.recv().await {
        let json = serde_json::to_string(&msg).map_err(|e| ConnectionError::Io(e.to_string()))?;

        let write = async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        };

        match timeout(WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ConnectionError::Io(e.to_string())),
            Err(_) => return Err(ConnectionError::WriteTimeout),
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::{SnapshotMirror, SnapshotView};
    use crate::monitors::MonitorRegistry;
    use crate::service::SensorSource;
    use firewatch_core::{ReadingValues, SecretHash, SensorId, SensorReading};
    use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream, Lines};

    const SECRET: &str = "monitor-secret";

    struct Harness {
        to_conn: DuplexStream,
        from_conn: Lines<BufReader<DuplexStream>>,
        handle: tokio::task::JoinHandle<Result<(), ConnectionError>>,
    }

    fn service() -> FireAlarmService {
        FireAlarmService::new(
            SensorSource::Mirrored(SnapshotMirror::new()),
            Arc::new(MonitorRegistry::new(SecretHash::of(SECRET))),
        )
    }

    fn start(service: FireAlarmService) -> Harness {
        start_with_buffer(service, 64 * 1024)
    }

    /// `output` bounds how much the connection can write before the test reads.
    fn start_with_buffer(service: FireAlarmService, output: usize) -> Harness {
        let (to_conn, conn_in) = duplex(64 * 1024);
        let (conn_out, from_conn) = duplex(output);
        let conn = MonitorConnection::new(conn_in, conn_out, service, CancellationToken::new());
        Harness {
            to_conn,
            from_conn: BufReader::new(from_conn).lines(),
            handle: tokio::spawn(conn.run()),
        }
    }

    async fn send(h: &mut Harness, msg: &MonitorMessage) {
        let line = serde_json::to_string(msg).unwrap();
        h.to_conn.write_all(line.as_bytes()).await.unwrap();
        h.to_conn.write_all(b"\n").await.unwrap();
    }

    async fn recv(h: &mut Harness) -> DaemonMessage {
        let line = h.from_conn.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn recv_until<F>(h: &mut Harness, mut matches: F) -> DaemonMessage
    where
        F: FnMut(&DaemonMessage) -> bool,
    {
        loop {
            let msg = timeout(Duration::from_secs(2), recv(h))
                .await
                .expect("timed out waiting for a message");
            if matches(&msg) {
                return msg;
            }
        }
    }

    /// Registers, then floods pushes while the test is not reading until the
    /// registry drops the backlogged monitor. Leaves the stream drained.
    async fn register_then_backlog(h: &mut Harness, service: &FireAlarmService) {
        send(h, &MonitorMessage::add_monitor(SECRET)).await;
        recv_until(h, |m| matches!(m, DaemonMessage::SensorCountChanged { .. })).await;

        for i in 0..OUTBOX_CAPACITY + 10 {
            service.monitors().broadcast(MonitorEvent::data(format!("burst {i}"))).await;
        }
        assert_eq!(service.get_monitor_count().await, 0);

        while let Ok(line) = timeout(Duration::from_millis(200), h.from_conn.next_line()).await {
            assert!(line.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_queries_before_registration() {
        let mut h = start(service());

        send(&mut h, &MonitorMessage::get_sensor_count()).await;
        assert_eq!(recv(&mut h).await, DaemonMessage::SensorCount { count: 0 });

        send(&mut h, &MonitorMessage::ping(7)).await;
        assert_eq!(recv(&mut h).await, DaemonMessage::Pong { seq: 7 });

        send(&mut h, &MonitorMessage::disconnect()).await;
        assert!(h.handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_register_and_remove() {
        let service = service();
        let mut h = start(service.clone());

        send(&mut h, &MonitorMessage::add_monitor(SECRET)).await;
        // Count push is queued under the registry lock, before the reply
        assert_eq!(recv(&mut h).await, DaemonMessage::MonitorCountChanged { count: 1 });
        assert!(matches!(recv(&mut h).await, DaemonMessage::MonitorAdded { .. }));
        // No readings yet, so no Data before the count
        assert_eq!(recv(&mut h).await, DaemonMessage::SensorCountChanged { count: 0 });
        assert_eq!(service.get_monitor_count().await, 1);

        send(&mut h, &MonitorMessage::remove_monitor()).await;
        assert_eq!(recv(&mut h).await, DaemonMessage::MonitorCount { count: 0 });

        send(&mut h, &MonitorMessage::remove_monitor()).await;
        assert!(matches!(recv(&mut h).await, DaemonMessage::Error { .. }));
    }

    #[tokio::test]
    async fn test_new_monitor_receives_current_readings() {
        let mirror = SnapshotMirror::new();
        mirror
            .update(SnapshotView {
                version: 1,
                readings: vec![SensorReading::new(
                    SensorId::new("1-1"),
                    ReadingValues::new(20.0, 80, 2, 300.0),
                )],
            })
            .await;
        let service = FireAlarmService::new(
            SensorSource::Mirrored(mirror),
            Arc::new(MonitorRegistry::new(SecretHash::of(SECRET))),
        );
        let mut h = start(service);

        send(&mut h, &MonitorMessage::add_monitor(SECRET)).await;
        assert_eq!(recv(&mut h).await, DaemonMessage::MonitorCountChanged { count: 1 });
        assert!(matches!(recv(&mut h).await, DaemonMessage::MonitorAdded { .. }));
        match recv(&mut h).await {
            DaemonMessage::Data { text } => assert!(text.starts_with("1-1 : 20.0 80 2 300.0")),
            other => panic!("Expected Data, got {other:?}"),
        }
        assert_eq!(recv(&mut h).await, DaemonMessage::SensorCountChanged { count: 1 });
    }

    #[tokio::test]
    async fn test_dropped_monitor_can_register_again() {
        let service = service();
        let mut h = start_with_buffer(service.clone(), 32);
        register_then_backlog(&mut h, &service).await;

        send(&mut h, &MonitorMessage::add_monitor(SECRET)).await;
        recv_until(&mut h, |m| matches!(m, DaemonMessage::MonitorAdded { .. })).await;
        assert_eq!(service.get_monitor_count().await, 1);

        service.monitors().broadcast(MonitorEvent::data("after")).await;
        recv_until(&mut h, |m| matches!(m, DaemonMessage::Data { text } if text == "after")).await;
    }

    #[tokio::test]
    async fn test_remove_after_drop_reports_not_registered() {
        let service = service();
        let mut h = start_with_buffer(service.clone(), 32);
        register_then_backlog(&mut h, &service).await;

        send(&mut h, &MonitorMessage::remove_monitor()).await;
        match recv_until(&mut h, |m| !m.is_push()).await {
            DaemonMessage::Error { code, .. } => assert_eq!(code.as_deref(), Some("not_registered")),
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected_and_closed() {
        let service = service();
        let mut h = start(service.clone());

        send(&mut h, &MonitorMessage::add_monitor("nope")).await;
        assert!(matches!(recv(&mut h).await, DaemonMessage::Rejected { .. }));
        assert!(h.from_conn.next_line().await.unwrap().is_none());
        assert!(h.handle.await.unwrap().is_ok());
        assert_eq!(service.get_monitor_count().await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_removes_monitor() {
        let service = service();
        let mut h = start(service.clone());

        send(&mut h, &MonitorMessage::add_monitor(SECRET)).await;
        let _ = recv(&mut h).await;
        let _ = recv(&mut h).await;

        drop(h.to_conn);
        assert!(h.handle.await.unwrap().is_ok());
        assert_eq!(service.get_monitor_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_request_keeps_connection() {
        let mut h = start(service());

        h.to_conn.write_all(b"{\"type\":\"launch\"}\n").await.unwrap();
        match recv(&mut h).await {
            DaemonMessage::Error { code, .. } => assert_eq!(code.as_deref(), Some("invalid_request")),
            other => panic!("Expected Error, got {other:?}"),
        }

        send(&mut h, &MonitorMessage::get_monitor_count()).await;
        assert_eq!(recv(&mut h).await, DaemonMessage::MonitorCount { count: 0 });
    }

    #[tokio::test]
    async fn test_socket_endpoint_reports_closed() {
        let (tx, rx) = mpsc::channel(1);
        let endpoint = SocketEndpoint::new(MonitorId::new("m"), tx);

        assert_eq!(endpoint.deliver(MonitorEvent::data("a")), Ok(()));
        assert_eq!(
            endpoint.deliver(MonitorEvent::data("b")),
            Err(DeliveryError::Backlogged)
        );
        drop(rx);
        assert_eq!(
            endpoint.deliver(MonitorEvent::data("c")),
            Err(DeliveryError::Closed)
        );
    }
}
