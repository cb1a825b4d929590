//! # Error Types
//!
//! Error handling for the remote-object protocol.
//!
//! Every failure a caller can observe is a [`ProtocolError`]. The variants fall
//! into the categories returned by [`ProtocolError::category`]:
//!
//! ## Error Categories
//! - **Connectivity**: transport closed or failed; pending requests fail, nothing is retried
//! - **Protocol**: malformed or undecodable frames; fatal for the affected connection
//! - **Remote operation**: the peer's handler raised; carried back as an EXCEPTION message
//! - **Policy denial**: the peer's exposure policy refused the operation
//! - **Timeout**: a local wait elapsed (the remote call may still complete)
//! - **Local**: configuration and argument errors raised before anything hits the wire
//!
//! `ProtocolError` is `Clone` so one failure can be handed to an
//! [`AsyncResult`](crate::protocol::async_result::AsyncResult) reader and to all
//! of its callbacks.
//!
//! ## Example Usage
//! ```rust
//! use netref_protocol::error::{ErrorCategory, ProtocolError};
//!
//! let err = ProtocolError::ConnectionClosed;
//! assert_eq!(err.category(), ErrorCategory::Connectivity);
//! assert!(err.is_connectivity());
//! ```

use crate::protocol::object::RemoteError;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_WRITER_GONE: &str = "Connection writer has stopped";
    pub const ERR_HANDSHAKE_FAILED: &str = "Handshake failed";

    /// Object errors
    pub const ERR_MALFORMED_ARGS: &str = "Malformed request arguments";
    pub const ERR_NOT_AN_OBJECT: &str = "Request target is not an exposed object";
    pub const ERR_FOREIGN_PROXY: &str = "Proxy belongs to a different connection";
}

/// Coarse classification of a [`ProtocolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Transport closed or failed
    Connectivity,
    /// Malformed frame or message; the connection is torn down
    Protocol,
    /// The peer's handler raised a failure
    RemoteOperation,
    /// The peer's exposure policy refused the operation
    PolicyDenied,
    /// A local wait elapsed
    Timeout,
    /// Raised locally before any message was exchanged
    Local,
}

// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("Serialization error: {0}")]
    Serialization(Arc<bincode::Error>),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid protocol header")]
    InvalidHeader,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Unexpected message type")]
    UnexpectedMessage,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Result expired before a reply arrived")]
    Expired,

    #[error("Remote error: {0}")]
    Remote(RemoteError),

    #[error("Operation denied by remote policy: {0}")]
    PolicyDenied(RemoteError),

    #[error("Unknown object id: {0}")]
    UnknownObject(u64),

    #[error("Proxy belongs to a different connection")]
    ForeignProxy,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(Arc::new(err))
    }
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(Arc::new(err))
    }
}

impl ProtocolError {
    /// Classify this error into the protocol's error taxonomy
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProtocolError::Io(_)
            | ProtocolError::TransportError(_)
            | ProtocolError::ConnectionClosed => ErrorCategory::Connectivity,
            ProtocolError::Serialization(_)
            | ProtocolError::DeserializeError(_)
            | ProtocolError::InvalidHeader
            | ProtocolError::UnsupportedVersion(_)
            | ProtocolError::OversizedPacket(_)
            | ProtocolError::HandshakeError(_)
            | ProtocolError::UnexpectedMessage
            | ProtocolError::ProtocolViolation(_) => ErrorCategory::Protocol,
            ProtocolError::Remote(_) => ErrorCategory::RemoteOperation,
            ProtocolError::PolicyDenied(_) => ErrorCategory::PolicyDenied,
            ProtocolError::Timeout | ProtocolError::Expired => ErrorCategory::Timeout,
            ProtocolError::SerializeError(_)
            | ProtocolError::UnknownObject(_)
            | ProtocolError::ForeignProxy
            | ProtocolError::ConfigError(_)
            | ProtocolError::Custom(_) => ErrorCategory::Local,
        }
    }

    /// True for transport-level failures
    pub fn is_connectivity(&self) -> bool {
        self.category() == ErrorCategory::Connectivity
    }

    /// The remote failure carried by this error, if any (operation errors and denials)
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            ProtocolError::Remote(err) | ProtocolError::PolicyDenied(err) => Some(err),
            _ => None,
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
