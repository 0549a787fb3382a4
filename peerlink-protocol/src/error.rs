//! Error handling for the peerlink protocol engine
//!
//! Every fallible operation in this crate returns [`Result`], whose error type
//! is [`ProtocolError`]. Errors from the underlying libraries convert
//! automatically through `thiserror`'s `#[from]` attribute.
//!
//! ## Error Categories
//!
//! ### Wire errors
//! - `MalformedPacket`: a record that is not valid JSON or lacks `id`, `type`
//!   or `body`. The record is dropped and the channel stays open.
//! - `PacketSizeExceeded`: a record larger than the configured limit. The
//!   channel carrying it is closed.
//!
//! ### Handshake errors
//! - `HandshakeTimeout` / `HandshakeFailed`: the connection attempt is
//!   abandoned and reported. Nothing retries automatically.
//! - `TrustViolation`: a paired device id presented a different certificate.
//!   The channel is closed and the device is never re-paired implicitly.
//!
//! ### Dispatch errors
//! - `Handler`: a capability handler failed on one packet. Logged, isolated.
//! - `CapabilityMismatch`: no active handler for a packet type. Logged, dropped.
//!
//! ## Example
//!
//! ```rust
//! use peerlink_protocol::{Packet, ProtocolError};
//!
//! match Packet::from_bytes(b"not json\n") {
//!     Err(ProtocolError::MalformedPacket(reason)) => println!("dropped: {}", reason),
//!     other => panic!("unexpected: {:?}", other),
//! }
//! ```

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
///
/// # Examples
///
/// ```rust
/// use peerlink_protocol::ProtocolError;
///
/// let error = ProtocolError::DeviceNotFound("device-123".to_string());
/// assert_eq!(error.to_string(), "Device not found: device-123");
///
/// let error = ProtocolError::NotPaired;
/// assert_eq!(error.to_string(), "Not paired");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    ///
    /// Decoding never surfaces this variant; failures to parse an incoming
    /// record become [`ProtocolError::MalformedPacket`].
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS error raised by rustls while configuring or running a session
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate or private key could not be loaded or parsed
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Record is not valid JSON or lacks `id`, `type` or `body`
    ///
    /// ```rust
    /// use peerlink_protocol::ProtocolError;
    ///
    /// let error = ProtocolError::MalformedPacket("missing field `type`".to_string());
    /// assert_eq!(error.to_string(), "Malformed packet: missing field `type`");
    /// ```
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Record exceeds the maximum allowed size
    #[error("Packet size exceeded: {0} bytes (max: {1})")]
    PacketSizeExceeded(usize, usize),

    /// Channel establishment did not finish within the handshake timeout
    #[error("Handshake timed out: {0}")]
    HandshakeTimeout(String),

    /// Channel establishment failed (reset, bad identity exchange, TLS failure)
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// A paired device presented a certificate whose fingerprint differs from
    /// the stored one
    #[error("Trust violation for {device_id}: expected fingerprint {expected}, got {actual}")]
    TrustViolation {
        device_id: String,
        expected: String,
        actual: String,
    },

    /// A capability handler failed while processing a packet
    #[error("Handler error in {plugin}: {message}")]
    Handler { plugin: String, message: String },

    /// No active handler for the packet type on this device
    #[error("Capability mismatch: no handler for {0}")]
    CapabilityMismatch(String),

    /// Device not found in the registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Operation requires a paired and connected device
    #[error("Not paired")]
    NotPaired,

    /// Operation is not valid in the device's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Plugin registration or lifecycle error
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// A listening socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Network connection error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Connection refused by the remote device
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation was cancelled, usually by shutdown
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl ProtocolError {
    /// Convert a generic I/O error into a more specific network error
    ///
    /// ```rust
    /// use peerlink_protocol::ProtocolError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::TimedOut, "connection timeout");
    /// let error = ProtocolError::from_io_error(io_error, "connecting to device");
    ///
    /// assert!(matches!(error, ProtocolError::HandshakeTimeout(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::HandshakeTimeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionRefused => {
                ProtocolError::ConnectionRefused(format!("{}: {}", context, error))
            }
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ProtocolError::NetworkError(format!("{}: connection interrupted ({})", context, error))
            }
            ErrorKind::UnexpectedEof => {
                ProtocolError::HandshakeFailed(format!("{}: peer closed the connection", context))
            }
            _ => ProtocolError::Io(error),
        }
    }

    /// Check if this error is transient
    ///
    /// ```rust
    /// use peerlink_protocol::ProtocolError;
    ///
    /// assert!(ProtocolError::HandshakeTimeout("10s".to_string()).is_recoverable());
    /// assert!(!ProtocolError::NotPaired.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::HandshakeTimeout(_)
                | ProtocolError::HandshakeFailed(_)
                | ProtocolError::NetworkError(_)
                | ProtocolError::ConnectionRefused(_)
                | ProtocolError::MalformedPacket(_)
                | ProtocolError::Handler { .. }
                | ProtocolError::CapabilityMismatch(_)
                | ProtocolError::Io(_)
        )
    }

    /// Check if this error should be surfaced to the user
    ///
    /// Only trust violations and a permanent loss of connectivity are worth
    /// interrupting someone for. Everything else is logged.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            ProtocolError::TrustViolation { .. }
                | ProtocolError::HandshakeTimeout(_)
                | ProtocolError::ConnectionRefused(_)
        )
    }

    /// Get a user-friendly error message suitable for display
    ///
    /// ```rust
    /// use peerlink_protocol::ProtocolError;
    ///
    /// let error = ProtocolError::NotPaired;
    /// assert_eq!(error.user_message(), "Device not paired. Please pair the device first.");
    /// ```
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::TrustViolation { device_id, .. } => format!(
                "Device {} presented an unexpected certificate. The connection was refused.",
                device_id
            ),
            ProtocolError::HandshakeTimeout(_) => {
                "Connection timed out. Please check that the device is reachable.".to_string()
            }
            ProtocolError::ConnectionRefused(_) => {
                "Connection refused. Please check that the device is running.".to_string()
            }
            ProtocolError::NotPaired => "Device not paired. Please pair the device first.".to_string(),
            ProtocolError::DeviceNotFound(_) => "Device not found.".to_string(),
            ProtocolError::Bind { addr, .. } => {
                format!("Could not listen on {}. Is another instance running?", addr)
            }
            ProtocolError::Certificate(_) => {
                "The device certificate could not be loaded.".to_string()
            }
            _ => self.to_string(),
        }
    }
}
