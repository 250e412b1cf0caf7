//! Error types for the transport layer.

use thiserror::Error;

/// Transport-level error.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("address in use: {0}")]
    AddressInUse(String),

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("bad connection description: {0}")]
    BadDescription(String),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("packet too large: {size} bytes exceeds maximum {max}")]
    PacketTooLarge { size: u64, max: u64 },

    #[error("data stream underflow: {needed} bytes requested, {remaining} remaining")]
    StreamUnderflow { needed: usize, remaining: usize },

    #[error("unknown multicast group: {0}")]
    UnknownGroup(String),
}

impl NetError {
    /// Check if this error represents a normal connection close
    /// (EOF, connection reset, etc.)
    pub fn is_connection_closed(&self) -> bool {
        match self {
            NetError::ConnectionClosed => true,
            NetError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
