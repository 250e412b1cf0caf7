//! Error types for the object layer.
//!
//! Expected failures are typed results; invariant violations go through
//! [`crate::fatal`] and are never mixed into this enum's recoverable
//! variants except as [`Error::Fatal`] in robust mode.

use distnet::NetError;
use thiserror::Error;

/// Object-layer error.
#[derive(Debug, Error)]
pub enum Error {
    /// Connect refused, unreachable, connection reset mid-stream.
    #[error("network error: {0}")]
    Network(#[from] NetError),

    /// Malformed packet, unknown command, version mismatch.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The master node for an identifier cannot be located.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate master or registration of an already-attached object.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation invoked in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    State(String),

    /// A request did not receive a reply within the deadline.
    #[error("timeout")]
    Timeout,

    /// Cache full of pinned entries, send queue overflow.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// Invariant violation surfaced in robust mode.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Report an invariant violation: assert in debug builds, log and carry on
/// (the caller closes the affected scope) when robustness is enabled.
macro_rules! fatal {
    ($robust:expr, $($arg:tt)*) => {{
        if $robust {
            tracing::error!($($arg)*);
        } else {
            debug_assert!(false, $($arg)*);
            tracing::error!($($arg)*);
        }
    }};
}

pub(crate) use fatal;
