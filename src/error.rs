//! # Error Types
//!
//! Error handling for the CoT client engine.
//!
//! This module defines every error variant the engine can surface, from
//! low-level socket failures to enrollment rejections.
//!
//! ## Error Categories
//! - **Transport Errors**: connect failures, timeouts, sends on a closed socket
//! - **Protocol Errors**: malformed CoT messages (logged and skipped by the receive loop)
//! - **TLS Errors**: handshake failures, missing client identity
//! - **Enrollment Errors**: invalid URL, network, authentication, server status
//! - **Identity Errors**: failures persisting or loading certificate material
//!
//! Authentication failures are kept separate from network failures so callers
//! can prompt for new credentials instead of retrying blindly.
//!
//! ## Example Usage
//! ```rust
//! use takstream::error::{ProtocolError, Result};
//! use tracing::{error, info};
//!
//! fn check(status: u16) -> Result<()> {
//!     match status {
//!         200..=299 => Ok(()),
//!         401 | 403 => Err(ProtocolError::AuthenticationFailed("rejected".into())),
//!         _ => Err(ProtocolError::ServerError { status, body: String::new() }),
//!     }
//! }
//!
//! match check(401) {
//!     Ok(()) => info!("accepted"),
//!     Err(e) if e.is_authentication_failure() => error!(error=%e, "Ask for new credentials"),
//!     Err(e) => error!(error=%e, "Enrollment failed"),
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants for the common error paths.
pub mod constants {
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_NOT_CONNECTED: &str = "Channel is not connected";
    pub const ERR_CONNECT_TIMEOUT: &str = "Connection attempt timed out";
    pub const ERR_WRITER_FULL: &str = "Outbound writer queue is full";

    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    pub const ERR_NO_SIGNED_CERT: &str = "Signing response did not contain signedCert";
    pub const ERR_NO_PRIVATE_KEY: &str = "No private key found";
    pub const ERR_NO_CERTIFICATE: &str = "No certificate found";
}

// ProtocolError is the primary error type for all engine operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel is not connected")]
    NotConnected,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Malformed message: {0}")]
    Parse(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Server requested a client certificate but no identity is configured")]
    ClientCertificateRequired,

    #[error("Identity '{0}' is not available in the identity store")]
    IdentityUnavailable(String),

    #[error("Identity storage error: {0}")]
    IdentityStorage(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Server error {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("Invalid enrollment response: {0}")]
    EnrollmentResponse(String),

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Server already registered: {0}")]
    DuplicateServer(String),

    #[error("Server is disabled: {0}")]
    ServerDisabled(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// True when the failure came from rejected credentials (enrollment or mTLS).
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            ProtocolError::AuthenticationFailed(_)
                | ProtocolError::ClientCertificateRequired
                | ProtocolError::IdentityUnavailable(_)
        )
    }

    /// True for failures a caller may reasonably retry unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            ProtocolError::Io(_)
            | ProtocolError::ConnectFailed(_)
            | ProtocolError::SendFailed(_)
            | ProtocolError::ConnectionClosed
            | ProtocolError::NotConnected
            | ProtocolError::Timeout
            | ProtocolError::Network(_) => true,
            ProtocolError::ServerError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
