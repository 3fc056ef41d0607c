//! Server error types.
//!
//! Hand-rolled `Display`/`Error` impls (not `thiserror`) for the top-level,
//! process-wide aggregating errors, mirroring the split the teacher itself
//! carries between `lockframe-server::error::ServerError` (hand-rolled) and
//! `lockframe-core::error::ConnectionError` (`thiserror`, see
//! `booster-core::error`): local aggregation by hand, layered domain errors
//! via `thiserror`.

use std::fmt;

use booster_core::{CacheError, ConnectionError};

/// Errors that can occur in the server process.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, bad cache dir, etc.).
    ///
    /// Fatal at startup; fix configuration and restart.
    Config(String),

    /// Transport/network error (bind failure, accept failure, I/O error).
    ///
    /// May be transient (a single accept failing) or fatal (bind address in
    /// use).
    Transport(String),

    /// Stream/session-level protocol or lifecycle error.
    ///
    /// Wraps `ConnectionError` from the domain core. Stream-level fatal per
    /// SPEC_FULL.md §7: close the stream, log, continue serving others.
    Connection(ConnectionError),

    /// Cache-artifact generation or integrity error.
    ///
    /// Wraps `CacheError` from the domain core.
    Cache(CacheError),

    /// A requested program or session was not found in the data manager.
    NotFound {
        /// What kind of entity was missing (`"program"` or `"session"`).
        kind: &'static str,
        /// Its id, formatted for logging.
        id: String,
    },

    /// Internal error (unexpected state, logic bug).
    ///
    /// Should never happen in a correct implementation.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Connection(err) => write!(f, "connection error: {err}"),
            Self::Cache(err) => write!(f, "cache error: {err}"),
            Self::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connection(err) => Some(err),
            Self::Cache(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConnectionError> for ServerError {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

impl From<CacheError> for ServerError {
    fn from(err: CacheError) -> Self {
        Self::Cache(err)
    }
}

impl From<booster_proto::ProtocolError> for ServerError {
    fn from(err: booster_proto::ProtocolError) -> Self {
        Self::Connection(ConnectionError::from(err))
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("io error: {err}"))
    }
}

/// Errors from action execution against a live stream.
#[derive(Debug)]
pub enum ExecutorError {
    /// Writing a message to a stream failed.
    SendFailed {
        /// Stream that failed.
        stream_id: u32,
        /// Error message.
        reason: String,
    },

    /// A cache-artifact publish or compiler invocation failed.
    TaskFailed(String),

    /// Low-level transport error.
    Transport(String),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SendFailed { stream_id, reason } => {
                write!(f, "send failed for stream {stream_id}: {reason}")
            },
            Self::TaskFailed(msg) => write!(f, "task failed: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

impl std::error::Error for ExecutorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_display() {
        let err = ServerError::NotFound { kind: "session", id: "7".to_string() };
        assert_eq!(err.to_string(), "session not found: 7");
    }

    #[test]
    fn executor_error_display() {
        let err = ExecutorError::SendFailed { stream_id: 3, reason: "closed".to_string() };
        assert_eq!(err.to_string(), "send failed for stream 3: closed");
    }
}
