//! TCP servers for sensors and monitors.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐          ┌─────────────────┐
//! │  SensorServer   │          │  MonitorServer  │
//! │  TcpListener    │          │  TcpListener    │
//! └───────┬─────────┘          └───────┬─────────┘
//!         │ accept()                   │ accept()
//!         ▼                            ▼
//! ┌─────────────────┐          ┌─────────────────┐
//! │IngestionSession │          │MonitorConnection│
//! │ (per sensor)    │          │ (per monitor)   │
//! └───────┬─────────┘          └───────┬─────────┘
//!         │ upsert / release           │ queries, add/remove
//!         ▼                            ▼
//! ┌─────────────────┐          ┌─────────────────┐
//! │ RegistryHandle  │          │FireAlarmService │
//! └─────────────────┘          └─────────────────┘
//! ```
//!
//! Both servers stop accepting when their `CancellationToken` fires and
//! give open connections a short grace period to clean up.

mod connection;
mod session;

pub use connection::{ConnectionError, MonitorConnection, SocketEndpoint, OUTBOX_CAPACITY};
pub use session::{
    IngestionSession, SensorLease, SessionConfig, SessionError, SessionState,
    MAX_CONSECUTIVE_MALFORMED,
};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use firewatch_core::SecretHash;
use firewatch_protocol::SensorReply;

use crate::registry::RegistryHandle;
use crate::service::FireAlarmService;

/// Default listen address for sensors
pub const DEFAULT_SENSOR_ADDR: &str = "0.0.0.0:9001";

/// Default listen address for monitors
pub const DEFAULT_MONITOR_ADDR: &str = "127.0.0.1:9002";

/// Default cap on connections waiting to authenticate
pub const DEFAULT_MAX_PENDING_AUTH: usize = 64;

/// How long open connections get to finish after shutdown is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

async fn bind(addr: SocketAddr) -> Result<(TcpListener, SocketAddr), ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::Bind { addr, source })?;
    Ok((listener, local_addr))
}

/// Waits for connection tasks to end, aborting stragglers after the grace period.
async fn drain(mut tasks: JoinSet<()>) {
    let remaining = tasks.len();
    if remaining == 0 {
        return;
    }
    debug!(remaining, "Waiting for connections to close");

    let finished = timeout(SHUTDOWN_GRACE, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    if finished.is_err() {
        warn!(remaining = tasks.len(), "Aborting connections after grace period");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

// ============================================================================
// Sensor Server
// ============================================================================

/// Accepts sensor connections and runs one `IngestionSession` each.
pub struct SensorServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: RegistryHandle,
    secret: SecretHash,
    session_config: SessionConfig,
    pending_auth: Arc<Semaphore>,
    cancel_token: CancellationToken,
}

impl SensorServer {
    pub async fn bind(
        addr: SocketAddr,
        registry: RegistryHandle,
        secret: SecretHash,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let (listener, local_addr) = bind(addr).await?;
        Ok(Self {
            listener,
            local_addr,
            registry,
            secret,
            session_config: SessionConfig::default(),
            pending_auth: Arc::new(Semaphore::new(DEFAULT_MAX_PENDING_AUTH)),
            cancel_token,
        })
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    pub fn with_max_pending_auth(mut self, max: usize) -> Self {
        self.pending_auth = Arc::new(Semaphore::new(max));
        self
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the server.
    ///
    /// Does not return until the cancellation token is triggered.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(addr = %self.local_addr, "Sensor server listening");
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Sensor server shutdown requested");
                    break;
                }

                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.handle_connection(&mut sessions, stream, peer),
                        Err(e) => error!(error = %e, "Failed to accept sensor connection"),
                    }
                }
            }
        }

        drain(sessions).await;
        info!("Sensor server stopped");
        Ok(())
    }

    fn handle_connection(&self, sessions: &mut JoinSet<()>, stream: TcpStream, peer: SocketAddr) {
        let permit = match Arc::clone(&self.pending_auth).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(peer = %peer, "Too many connections awaiting authentication, rejecting");
                sessions.spawn(reject(stream, "too many pending connections"));
                return;
            }
        };

        let (reader, writer) = stream.into_split();
        let session = IngestionSession::new(
            reader,
            writer,
            self.registry.clone(),
            self.secret.clone(),
            self.session_config,
            self.cancel_token.child_token(),
        )
        .with_peer(peer.to_string())
        .with_auth_permit(permit);

        sessions.spawn(async move {
            // Outcome is logged by the session itself
            let _ = session.run().await;
        });
    }
}

/// Sends one `rejected` line and closes the stream.
async fn reject(mut stream: TcpStream, reason: &str) {
    let json = match serde_json::to_string(&SensorReply::rejected(reason)) {
        Ok(json) => json,
        Err(e) => {
            error!(error = %e, "Failed to serialize rejection");
            return;
        }
    };
    let write = async {
        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.shutdown().await
    };
    if let Ok(Err(e)) = timeout(Duration::from_secs(1), write).await {
        debug!(error = %e, "Failed to send rejection");
    }
}

// ============================================================================
// Monitor Server
// ============================================================================

/// Accepts monitor connections and runs one `MonitorConnection` each.
pub struct MonitorServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    service: FireAlarmService,
    cancel_token: CancellationToken,
}

impl MonitorServer {
    pub async fn bind(
        addr: SocketAddr,
        service: FireAlarmService,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let (listener, local_addr) = bind(addr).await?;
        Ok(Self {
            listener,
            local_addr,
            service,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the server until the cancellation token is triggered.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(addr = %self.local_addr, "Monitor server listening");
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Monitor server shutdown requested");
                    break;
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {}

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let (reader, writer) = stream.into_split();
                            let connection = MonitorConnection::new(
                                reader,
                                writer,
                                self.service.clone(),
                                self.cancel_token.child_token(),
                            )
                            .with_peer(peer.to_string());

                            connections.spawn(async move {
                                if let Err(e) = connection.run().await {
                                    debug!(peer = %peer, error = %e, "Monitor connection ended with error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Failed to accept monitor connection"),
                    }
                }
            }
        }

        drain(connections).await;
        info!("Monitor server stopped");
        Ok(())
    }
}
