//! Error types for the LiteConn runtime

use liteconn_core::CoreError;
use std::fmt;
use thiserror::Error;

/// Result type for LiteConn operations
pub type Result<T> = std::result::Result<T, LiteError>;

/// Errors surfaced to application code.
///
/// Expected network conditions (loss, silence, rejected requests) never show
/// up here; they are `None` results and state transitions instead.
#[derive(Error, Debug)]
pub enum LiteError {
    /// I/O related errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed framing surfaced from `liteconn-core` (via `?`)
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Connection-related errors
    #[error("Connection error: {kind}")]
    Connection { kind: ConnectionError },

    /// Timeout errors
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Payload does not fit in one datagram
    #[error("Buffer error: {message}")]
    Buffer { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Manager lifecycle errors
    #[error("Manager error: {message}")]
    Manager { message: String },
}

/// Specific connection error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    /// Handshake has not completed yet
    NotConnected,
    /// Connection already closed
    Closed,
    /// Every slot of the manager holds a live connection
    NoFreeSlot,
    /// Manager is not accepting and nothing is queued
    NotListening,
    /// Handshake ended without reaching Connected
    HandshakeFailed,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::NotConnected => write!(f, "not connected"),
            ConnectionError::Closed => write!(f, "connection closed"),
            ConnectionError::NoFreeSlot => write!(f, "no free connection slot"),
            ConnectionError::NotListening => write!(f, "manager is not listening"),
            ConnectionError::HandshakeFailed => write!(f, "handshake failed"),
        }
    }
}

impl From<CoreError> for LiteError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Protocol { message } => LiteError::Protocol { message },
            CoreError::Buffer { message } => LiteError::Buffer { message },
            CoreError::Config { message } => LiteError::Config { message },
        }
    }
}

impl LiteError {
    /// Create a connection error
    pub fn connection(kind: ConnectionError) -> Self {
        LiteError::Connection { kind }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        LiteError::Timeout { timeout_ms }
    }

    /// Create a buffer error
    pub fn buffer(message: impl Into<String>) -> Self {
        LiteError::Buffer {
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        LiteError::Config {
            message: message.into(),
        }
    }

    /// Create a manager error
    pub fn manager(message: impl Into<String>) -> Self {
        LiteError::Manager {
            message: message.into(),
        }
    }

    /// Check if retrying the same call later can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            LiteError::Io(e) => {
                matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                )
            }
            LiteError::Timeout { .. } => true,
            LiteError::Connection { kind } => {
                matches!(
                    kind,
                    ConnectionError::NotConnected | ConnectionError::NoFreeSlot
                )
            }
            _ => false,
        }
    }

    /// Check if this is a connection-related error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, LiteError::Connection { .. })
    }

    /// Check if this error indicates the connection is closed
    pub fn is_closed(&self) -> bool {
        match self {
            LiteError::Connection { kind } => {
                matches!(kind, ConnectionError::Closed | ConnectionError::HandshakeFailed)
            }
            LiteError::Io(e) => {
                matches!(
                    e.kind(),
                    std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::NotConnected
                )
            }
            _ => false,
        }
    }
}
