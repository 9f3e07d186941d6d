//! Error types for the firewatch clients.
//!
//! Covers connecting to the daemon, the registration and authentication
//! handshakes, and decoding daemon replies.

use std::io;
use thiserror::Error;

// ============================================================================
// Client Error Type
// ============================================================================

/// Errors raised by `MonitorClient`, `SensorSimulator` and the query helpers.
///
/// # Error Handling
///
/// `Rejected` is permanent: the daemon refused the credentials and
/// retrying with the same secret cannot succeed. Everything else is
/// treated as transient by the reconnecting monitor client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Failed to connect to the daemon.
    #[error("Failed to connect to daemon: {0}")]
    Connection(String),

    /// The daemon refused the secret or the protocol version.
    #[error("Rejected by daemon: {0}")]
    Rejected(String),

    /// Protocol version mismatch with daemon
    #[error("Protocol version mismatch (client: {client_version}, daemon: {daemon_version})")]
    VersionMismatch {
        /// The protocol version this client speaks.
        client_version: String,
        /// The protocol version the daemon reported.
        daemon_version: String,
    },

    /// The daemon sent something this client did not expect.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The daemon closed the connection.
    #[error("Connection closed by daemon")]
    Closed,

    /// Shutdown was requested while waiting.
    #[error("Cancelled")]
    Cancelled,

    /// Socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization or parsing failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Returns true if retrying cannot help.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Rejected(_) | Self::VersionMismatch { .. } | Self::Cancelled
        )
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
