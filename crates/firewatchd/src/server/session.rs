//! Per-connection sensor intake.
//!
//! Each sensor connection runs one `IngestionSession`:
//!
//! ```text
//! Connected ──▶ Authenticating ──▶ Active ──▶ Closed
//!                     │                          ▲
//!                     └──── rejected ────────────┘
//! ```
//!
//! The session owns a `SensorLease` recording every sensor id it wrote.
//! The lease is released exactly once whichever way the session ends.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use firewatch_core::{SecretHash, SensorId};
use firewatch_protocol::{
    ProtocolVersion, SensorMessage, SensorMessageType, SensorReply, MAX_LINE_LENGTH,
};

use crate::registry::{ConnectionId, RegistryError, RegistryHandle};

/// Consecutive undecodable frames tolerated before the session is closed.
pub const MAX_CONSECUTIVE_MALFORMED: u32 = 32;

/// Write timeout for replies.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline used when a silence timeout cannot be represented.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn silence_deadline(silence_timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(silence_timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

/// Timing limits for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub auth_timeout: Duration,
    pub silence_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            silence_timeout: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authenticating,
    Active,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Authenticating => write!(f, "authenticating"),
            Self::Active => write!(f, "active"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Why a session ended abnormally.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("authentication timed out")]
    AuthTimeout,

    #[error("protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("connection closed before authentication")]
    ClosedBeforeAuth,

    #[error("invalid UTF-8 on the wire")]
    InvalidUtf8,

    #[error("too many consecutive malformed frames ({count})")]
    TooManyMalformed { count: u32 },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("write timeout")]
    WriteTimeout,

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

// ============================================================================
// Sensor Lease
// ============================================================================

/// Sensor ids a connection must remove from the registry when it ends.
///
/// `release` is the normal path. If the session task is cancelled or
/// panics first, `Drop` hands the ids to a background task instead.
pub struct SensorLease {
    owner: ConnectionId,
    registry: RegistryHandle,
    ids: BTreeSet<SensorId>,
}

impl SensorLease {
    pub fn new(owner: ConnectionId, registry: RegistryHandle) -> Self {
        Self {
            owner,
            registry,
            ids: BTreeSet::new(),
        }
    }

    pub fn track(&mut self, sensor_id: SensorId) {
        self.ids.insert(sensor_id);
    }

    pub fn ids(&self) -> impl Iterator<Item = &SensorId> {
        self.ids.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Removes every leased sensor this connection still owns.
    ///
    /// Returns the number actually removed. Later calls are no-ops.
    pub async fn release(&mut self) -> usize {
        let ids = std::mem::take(&mut self.ids);
        release_all(&self.registry, self.owner, ids).await
    }
}

impl Drop for SensorLease {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        let ids = std::mem::take(&mut self.ids);
        let registry = self.registry.clone();
        let owner = self.owner;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(owner = %owner, count = ids.len(), "Releasing lease from drop");
                runtime.spawn(async move {
                    release_all(&registry, owner, ids).await;
                });
            }
            Err(_) => warn!(owner = %owner, "No runtime to release sensor lease"),
        }
    }
}

async fn release_all(
    registry: &RegistryHandle,
    owner: ConnectionId,
    ids: BTreeSet<SensorId>,
) -> usize {
    let mut removed = 0;
    for id in ids {
        if registry.release(id, owner).await {
            removed += 1;
        }
    }
    removed
}

// ============================================================================
// Ingestion Session
// ============================================================================

enum Step {
    Shutdown,
    Silent,
    Frame(Option<Result<String, LinesCodecError>>),
}

/// Lifecycle of one sensor connection.
pub struct IngestionSession<R, W> {
    id: ConnectionId,
    peer: String,
    lines: FramedRead<R, LinesCodec>,
    writer: W,
    registry: RegistryHandle,
    secret: SecretHash,
    config: SessionConfig,
    state: SessionState,
    lease: SensorLease,
    cancel: CancellationToken,
    /// Held while authenticating, released once the session leaves that state
    auth_permit: Option<OwnedSemaphorePermit>,
}

impl<R, W> IngestionSession<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        reader: R,
        writer: W,
        registry: RegistryHandle,
        secret: SecretHash,
        config: SessionConfig,
        cancel: CancellationToken,
    ) -> Self {
        let id = ConnectionId::next();
        Self {
            id,
            peer: id.to_string(),
            lines: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            writer,
            lease: SensorLease::new(id, registry.clone()),
            registry,
            secret,
            config,
            state: SessionState::Connected,
            cancel,
            auth_permit: None,
        }
    }

    /// Labels log lines with the remote address.
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    pub fn with_auth_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.auth_permit = Some(permit);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runs the session to completion.
    ///
    /// `Ok` means the sensor disconnected cleanly or the daemon shut down.
    pub async fn run(mut self) -> Result<(), SessionError> {
        debug!(peer = %self.peer, conn = %self.id, "Sensor connected");

        let result = match self.authenticate().await {
            Ok(()) => self.process_readings().await,
            Err(e) => Err(e),
        };

        self.transition(SessionState::Closed);
        self.auth_permit = None;
        let released = self.lease.release().await;

        match &result {
            Ok(()) => info!(peer = %self.peer, released, "Sensor disconnected"),
            Err(e) => info!(peer = %self.peer, released, error = %e, "Sensor session ended"),
        }
        result
    }

    fn transition(&mut self, next: SessionState) {
        debug!(peer = %self.peer, from = %self.state, to = %next, "Session state change");
        self.state = next;
    }

    async fn authenticate(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Authenticating);

        let frame = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SessionError::ClosedBeforeAuth),
            frame = timeout(self.config.auth_timeout, self.lines.next()) => frame,
        };

        let line = match frame {
            Err(_) => {
                warn!(peer = %self.peer, "Sensor did not authenticate in time");
                self.reject("authentication timed out").await?;
                return Err(SessionError::AuthTimeout);
            }
            Ok(None) => return Err(SessionError::ClosedBeforeAuth),
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                self.reject("authentication frame too long").await?;
                return Err(SessionError::AuthenticationFailed(
                    "frame too long".to_string(),
                ));
            }
            Ok(Some(Err(LinesCodecError::Io(e)))) => return Err(io_error(e)),
            Ok(Some(Ok(line))) => line,
        };

        let msg = match SensorMessage::from_line(&line) {
            Ok(msg) => msg,
            Err(e) => {
                self.reject("malformed authentication frame").await?;
                return Err(SessionError::AuthenticationFailed(e.to_string()));
            }
        };

        if !msg.protocol_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                peer = %self.peer,
                client_version = %msg.protocol_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            self.reject(&format!(
                "protocol version {} not compatible with server version {}",
                msg.protocol_version,
                ProtocolVersion::CURRENT
            ))
            .await?;
            return Err(SessionError::VersionMismatch {
                client: msg.protocol_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            SensorMessageType::Authenticate { token } => {
                if !self.secret.matches(&token) {
                    warn!(peer = %self.peer, "Sensor presented an invalid token");
                    self.reject("invalid token").await?;
                    return Err(SessionError::AuthenticationFailed(
                        "invalid token".to_string(),
                    ));
                }
            }
            SensorMessageType::Reading(_) => {
                self.reject("expected authenticate frame").await?;
                return Err(SessionError::AuthenticationFailed(
                    "reading before authentication".to_string(),
                ));
            }
        }

        self.send_reply(&SensorReply::authenticated()).await?;
        self.auth_permit = None;
        self.transition(SessionState::Active);
        info!(peer = %self.peer, conn = %self.id, "Sensor authenticated");
        Ok(())
    }

    async fn process_readings(&mut self) -> Result<(), SessionError> {
        let silence = sleep_until(silence_deadline(self.config.silence_timeout));
        tokio::pin!(silence);
        let mut malformed: u32 = 0;

        loop {
            let step = tokio::select! {
                _ = self.cancel.cancelled() => Step::Shutdown,
                _ = &mut silence => Step::Silent,
                frame = self.lines.next() => Step::Frame(frame),
            };

            let accepted = match step {
                Step::Shutdown => {
                    debug!(peer = %self.peer, "Session shutdown requested");
                    return Ok(());
                }
                Step::Silent => {
                    self.report_silence().await?;
                    silence.as_mut().reset(silence_deadline(self.config.silence_timeout));
                    continue;
                }
                Step::Frame(None) => return Ok(()),
                Step::Frame(Some(Ok(line))) => self.handle_line(&line).await?,
                Step::Frame(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                    warn!(peer = %self.peer, max = MAX_LINE_LENGTH, "Skipping over-long frame");
                    false
                }
                Step::Frame(Some(Err(LinesCodecError::Io(e)))) => return Err(io_error(e)),
            };

            if accepted {
                malformed = 0;
                silence.as_mut().reset(silence_deadline(self.config.silence_timeout));
            } else {
                malformed += 1;
                if malformed > MAX_CONSECUTIVE_MALFORMED {
                    warn!(peer = %self.peer, count = malformed, "Closing session after repeated malformed frames");
                    return Err(SessionError::TooManyMalformed { count: malformed });
                }
            }
        }
    }

    /// Handles one frame in the Active state.
    ///
    /// Returns false if the frame was skipped as malformed.
    async fn handle_line(&mut self, line: &str) -> Result<bool, SessionError> {
        let msg = match SensorMessage::from_line(line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Skipping malformed frame");
                return Ok(false);
            }
        };

        let raw = match msg.message {
            SensorMessageType::Reading(raw) => raw,
            SensorMessageType::Authenticate { .. } => {
                debug!(peer = %self.peer, "Ignoring repeated authenticate frame");
                return Ok(false);
            }
        };

        let (sensor_id, values) = match raw.decode() {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Skipping malformed reading");
                return Ok(false);
            }
        };

        match self
            .registry
            .upsert(self.id, sensor_id.clone(), values)
            .await
        {
            Ok(errors) => {
                debug!(
                    peer = %self.peer,
                    sensor_id = %sensor_id,
                    errors = errors.len(),
                    "Reading stored"
                );
                self.lease.track(sensor_id);
                Ok(true)
            }
            Err(RegistryError::RegistryFull { max }) => {
                warn!(sensor_id = %sensor_id, max, "Reading dropped, registry full");
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn report_silence(&mut self) -> Result<(), SessionError> {
        let label = if self.lease.is_empty() {
            self.peer.clone()
        } else {
            self.lease
                .ids()
                .map(SensorId::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        };
        let secs = self.config.silence_timeout.as_secs();
        warn!(peer = %self.peer, sensors = %label, secs, "Sensor went silent");

        self.registry
            .raise_alert(format!(
                "{label} : No reading received for {secs} seconds; the sensor may be faulty."
            ))
            .await?;
        Ok(())
    }

    async fn reject(&mut self, reason: &str) -> Result<(), SessionError> {
        self.send_reply(&SensorReply::rejected(reason)).await
    }

    async fn send_reply(&mut self, reply: &SensorReply) -> Result<(), SessionError> {
        let json = serde_json::to_string(reply).map_err(|e| SessionError::Io(e.to_string()))?;

        let write = async {
            self.writer.write_all(json.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
            self.writer.flush().await?;
            Ok::<(), std::io::Error>(())
        };

        match timeout(WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::Io(e.to_string())),
            Err(_) => Err(SessionError::WriteTimeout),
        }
    }
}

fn io_error(e: std::io::Error) -> SessionError {
    if e.kind() == std::io::ErrorKind::InvalidData {
        SessionError::InvalidUtf8
    } else {
        SessionError::Io(e.to_string())
    }
}
