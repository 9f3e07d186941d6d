//! Monitor client for the firewatch daemon.
//!
//! This module provides the `MonitorClient` which handles:
//! - Connection to the daemon's monitor port over TCP
//! - Automatic reconnection with exponential backoff
//! - Registration with the shared monitor secret
//! - Forwarding pushed readings and counts to an mpsc channel
//!
//! It also provides one-shot query helpers (`sensor_count`,
//! `monitor_count`, `all_readings`) that need no registration.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()` outside tests.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ClientError, Result};
use firewatch_protocol::{DaemonMessage, MonitorMessage, ProtocolVersion};

/// Default daemon monitor address.
pub const DEFAULT_MONITOR_ADDR: &str = "127.0.0.1:9002";

/// Time allowed for a one-shot query round trip.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the monitor client.
///
/// # Example
///
/// ```rust
/// use firewatch_client::client::MonitorConfig;
/// use std::time::Duration;
///
/// let config = MonitorConfig {
///     secret: "monitor-secret".to_string(),
///     retry_initial_delay: Duration::from_millis(500),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Address of the daemon's monitor listener.
    pub addr: SocketAddr,

    /// Shared monitor secret, sent in clear text with `add_monitor`.
    pub secret: String,

    /// Initial delay before first retry after connection failure.
    pub retry_initial_delay: Duration,

    /// Maximum delay between retry attempts.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry).
    pub retry_multiplier: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 9002)),
            secret: String::new(),
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            retry_multiplier: 2.0,
        }
    }
}

/// Next backoff delay, capped at `max`.
fn next_delay(delay: Duration, multiplier: f64, max: Duration) -> Duration {
    let next_ms = (delay.as_millis() as f64 * multiplier) as u64;
    Duration::from_millis(next_ms).min(max)
}

// ============================================================================
// Updates
// ============================================================================

/// What a registered monitor learns from the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorUpdate {
    /// Registration accepted.
    Registered { monitor_id: String },

    /// Reading batch, validation alert or stale-sensor warning.
    Data(String),

    /// A sensor connected or disconnected.
    SensorCountChanged(usize),

    /// A monitor registered or left.
    MonitorCountChanged(usize),

    /// The connection dropped; the client will reconnect.
    Disconnected,
}

// ============================================================================
// Monitor Client
// ============================================================================

/// Long-running monitor connection.
///
/// # Connection Lifecycle
///
/// 1. Connect to the daemon, retrying with exponential backoff
/// 2. Send `add_monitor` with the configured secret
/// 3. Forward pushes to the update channel until the connection drops
/// 4. Emit `Disconnected` and go back to step 1
///
/// A `Rejected` reply ends `run` with an error instead of retrying.
///
/// # Example
///
/// ```rust,ignore
/// use firewatch_client::client::{MonitorClient, MonitorConfig};
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
///
/// let (tx, mut rx) = mpsc::unbounded_channel();
/// let client = MonitorClient::new(MonitorConfig::default(), tx, CancellationToken::new());
/// tokio::spawn(async move { client.run().await });
/// while let Some(update) = rx.recv().await {
///     println!("{update:?}");
/// }
/// ```
pub struct MonitorClient {
    /// Configuration for connection behavior.
    config: MonitorConfig,

    /// Channel to send updates to the caller.
    update_tx: mpsc::UnboundedSender<MonitorUpdate>,

    /// Cancellation token for graceful shutdown.
    cancel_token: CancellationToken,
}

impl MonitorClient {
    /// Creates a new monitor client.
    #[must_use]
    pub fn new(
        config: MonitorConfig,
        update_tx: mpsc::UnboundedSender<MonitorUpdate>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            update_tx,
            cancel_token,
        }
    }

    /// Main loop that maintains the registration.
    ///
    /// Returns `Ok(())` when cancelled or when the update receiver is
    /// dropped, and `Err` on a permanent failure such as a rejected secret.
    pub async fn run(&self) -> Result<()> {
        info!(addr = %self.config.addr, "Monitor client starting");

        loop {
            if self.cancel_token.is_cancelled() {
                info!("Monitor client shutting down (cancelled)");
                return Ok(());
            }

            match self.connect_with_retry().await {
                Ok(stream) => {
                    info!(addr = %self.config.addr, "Connected to daemon");
                    let result = self.handle_connection(stream).await;

                    if self.update_tx.send(MonitorUpdate::Disconnected).is_err() {
                        debug!("Update receiver dropped");
                        return Ok(());
                    }

                    match result {
                        Ok(()) => {}
                        Err(ClientError::Cancelled) => return Ok(()),
                        Err(e) if e.is_permanent() => {
                            error!(error = %e, "Monitor client giving up");
                            return Err(e);
                        }
                        Err(e) => warn!(error = %e, "Connection ended with error"),
                    }
                }
                Err(ClientError::Cancelled) => return Ok(()),
                Err(e) => error!(error = %e, "Failed to connect to daemon"),
            }
        }
    }

    /// Attempts to connect with exponential backoff until connected or cancelled.
    async fn connect_with_retry(&self) -> Result<TcpStream> {
        let mut delay = self.config.retry_initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);
            debug!(attempt, addr = %self.config.addr, "Attempting to connect to daemon");

            match TcpStream::connect(self.config.addr).await {
                Ok(stream) => {
                    debug!(attempt, "Connection successful");
                    return Ok(stream);
                }
                Err(e) => {
                    if attempt == 1 {
                        warn!(addr = %self.config.addr, error = %e, "Daemon not reachable, will retry");
                    } else {
                        debug!(attempt, error = %e, "Connection attempt failed");
                    }
                }
            }

            tokio::select! {
                _ = sleep(delay) => {
                    delay = next_delay(delay, self.config.retry_multiplier, self.config.retry_max_delay);
                }
                _ = self.cancel_token.cancelled() => {
                    info!("Connection retry cancelled");
                    return Err(ClientError::Cancelled);
                }
            }
        }
    }

    /// Registers on an established connection and forwards pushes until EOF.
    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        send_message(&mut writer, &MonitorMessage::add_monitor(self.config.secret.clone())).await?;

        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::select! {
                read = reader.read_line(&mut line) => read?,
                _ = self.cancel_token.cancelled() => {
                    let _ = send_message(&mut writer, &MonitorMessage::disconnect()).await;
                    return Err(ClientError::Cancelled);
                }
            };

            if read == 0 {
                info!("Daemon closed connection");
                return Ok(());
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<DaemonMessage>(trimmed) {
                Ok(message) => {
                    if !self.handle_message(message)? {
                        return Ok(());
                    }
                }
                Err(e) => warn!(error = %e, line = %trimmed, "Failed to parse daemon message"),
            }
        }
    }

    /// Handles one daemon message. Returns false once the caller is gone.
    fn handle_message(&self, message: DaemonMessage) -> Result<bool> {
        let update = match message {
            DaemonMessage::MonitorAdded {
                monitor_id,
                protocol_version,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        daemon_version: protocol_version.to_string(),
                    });
                }
                info!(monitor_id = %monitor_id, "Registered with daemon");
                MonitorUpdate::Registered { monitor_id }
            }
            DaemonMessage::Rejected { reason, .. } => return Err(ClientError::Rejected(reason)),
            DaemonMessage::Data { text } => MonitorUpdate::Data(text),
            DaemonMessage::SensorCountChanged { count } => MonitorUpdate::SensorCountChanged(count),
            DaemonMessage::MonitorCountChanged { count } => {
                MonitorUpdate::MonitorCountChanged(count)
            }
            DaemonMessage::Error { message, code } => {
                warn!(error_message = %message, error_code = ?code, "Received error from daemon");
                return Ok(true);
            }
            other => {
                debug!(message = ?other, "Ignoring reply");
                return Ok(true);
            }
        };

        Ok(self.update_tx.send(update).is_ok())
    }
}

async fn send_message<W: AsyncWriteExt + Unpin>(writer: &mut W, message: &MonitorMessage) -> Result<()> {
    let json = serde_json::to_string(message)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    debug!(request = ?message.request, "Sent message to daemon");
    Ok(())
}

// ============================================================================
// One-shot queries
// ============================================================================

/// Sends one request on a fresh connection and returns the first reply.
///
/// Pushes that arrive first are skipped.
pub async fn query(addr: SocketAddr, request: MonitorMessage) -> Result<DaemonMessage> {
    let round_trip = async {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ClientError::Connection(format!("{addr}: {e}")))?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        send_message(&mut writer, &request).await?;

        let mut line = String::new();
        let reply = loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Err(ClientError::Closed);
            }
            let message: DaemonMessage = serde_json::from_str(line.trim())?;
            if !message.is_push() {
                break message;
            }
        };

        let _ = send_message(&mut writer, &MonitorMessage::disconnect()).await;
        Ok(reply)
    };

    timeout(QUERY_TIMEOUT, round_trip)
        .await
        .map_err(|_| ClientError::Connection(format!("{addr}: query timed out")))?
}

/// Number of sensors the daemon currently holds.
pub async fn sensor_count(addr: SocketAddr) -> Result<usize> {
    match query(addr, MonitorMessage::get_sensor_count()).await? {
        DaemonMessage::SensorCount { count } => Ok(count),
        other => Err(unexpected(other)),
    }
}

/// Number of monitors currently registered.
pub async fn monitor_count(addr: SocketAddr) -> Result<usize> {
    match query(addr, MonitorMessage::get_monitor_count()).await? {
        DaemonMessage::MonitorCount { count } => Ok(count),
        other => Err(unexpected(other)),
    }
}

/// Every sensor's latest reading as display text.
pub async fn all_readings(addr: SocketAddr) -> Result<String> {
    match query(addr, MonitorMessage::get_all_readings()).await? {
        DaemonMessage::AllReadings { text } => Ok(text),
        other => Err(unexpected(other)),
    }
}

fn unexpected(message: DaemonMessage) -> ClientError {
    match message {
        DaemonMessage::Error { message, .. } => ClientError::Protocol(message),
        DaemonMessage::Rejected { reason, .. } => ClientError::Rejected(reason),
        other => ClientError::Protocol(format!("unexpected reply: {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts one connection, reads one request line, writes `replies`.
    async fn scripted_daemon(replies: Vec<DaemonMessage>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();

            for reply in replies {
                let json = serde_json::to_string(&reply).unwrap();
                writer.write_all(json.as_bytes()).await.unwrap();
                writer.write_all(b"\n").await.unwrap();
            }
            // Hold the connection until the client hangs up
            let _ = reader.read_line(&mut line).await;
        });

        addr
    }

    #[test]
    fn test_backoff_caps() {
        let max = Duration::from_secs(30);
        assert_eq!(next_delay(Duration::from_secs(1), 2.0, max), Duration::from_secs(2));
        assert_eq!(next_delay(Duration::from_secs(20), 2.0, max), max);
    }

    #[tokio::test]
    async fn test_query_skips_pushes() {
        let addr = scripted_daemon(vec![
            DaemonMessage::data("1-1 : 20.0 80 2 300.0"),
            DaemonMessage::SensorCount { count: 4 },
        ])
        .await;
        assert_eq!(sensor_count(addr).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_query_error_reply() {
        let addr = scripted_daemon(vec![DaemonMessage::error("nope")]).await;
        assert!(matches!(
            all_readings(addr).await,
            Err(ClientError::Protocol(msg)) if msg == "nope"
        ));
    }

    #[tokio::test]
    async fn test_client_forwards_updates() {
        let addr = scripted_daemon(vec![
            DaemonMessage::MonitorCountChanged { count: 1 },
            DaemonMessage::monitor_added("monitor-1"),
            DaemonMessage::data("1-1 : 89.0 100 3 300.0"),
            DaemonMessage::SensorCountChanged { count: 1 },
        ])
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let client = MonitorClient::new(
            MonitorConfig {
                addr,
                secret: "s".to_string(),
                ..MonitorConfig::default()
            },
            tx,
            cancel.clone(),
        );
        let handle = tokio::spawn(async move { client.run().await });

        assert_eq!(rx.recv().await, Some(MonitorUpdate::MonitorCountChanged(1)));
        assert_eq!(
            rx.recv().await,
            Some(MonitorUpdate::Registered {
                monitor_id: "monitor-1".to_string()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(MonitorUpdate::Data("1-1 : 89.0 100 3 300.0".to_string()))
        );
        assert_eq!(rx.recv().await, Some(MonitorUpdate::SensorCountChanged(1)));

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_client_stops_on_rejection() {
        let addr = scripted_daemon(vec![DaemonMessage::rejected("authentication failed")]).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = MonitorClient::new(
            MonitorConfig {
                addr,
                secret: "wrong".to_string(),
                ..MonitorConfig::default()
            },
            tx,
            CancellationToken::new(),
        );

        let result = client.run().await;
        assert!(matches!(result, Err(ClientError::Rejected(_))));
        assert_eq!(rx.recv().await, Some(MonitorUpdate::Disconnected));
    }

    #[tokio::test]
    async fn test_retry_cancelled() {
        // Reserve a port, then free it so nothing is listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let client = MonitorClient::new(
            MonitorConfig {
                addr,
                retry_initial_delay: Duration::from_millis(10),
                ..MonitorConfig::default()
            },
            tx,
            cancel.clone(),
        );
        let handle = tokio::spawn(async move { client.run().await });

        sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }
}
