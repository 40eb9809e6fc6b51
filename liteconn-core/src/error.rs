//! Error types for the LiteConn protocol layer

use std::fmt;

/// Result type for core protocol operations
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Error types produced by the protocol layer.
///
/// Only covers what pure framing and configuration checks can detect; socket
/// and session failures live in the runtime crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Malformed datagram or payload framing
    Protocol { message: String },
    /// Payload does not fit the datagram budget
    Buffer { message: String },
    /// Invalid timeout configuration
    Config { message: String },
}

impl CoreError {
    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        CoreError::Protocol {
            message: message.into(),
        }
    }

    /// Create a buffer error
    pub fn buffer(message: impl Into<String>) -> Self {
        CoreError::Buffer {
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        CoreError::Config {
            message: message.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Protocol { message } => write!(f, "Protocol error: {message}"),
            CoreError::Buffer { message } => write!(f, "Buffer error: {message}"),
            CoreError::Config { message } => write!(f, "Configuration error: {message}"),
        }
    }
}

impl std::error::Error for CoreError {}
