//! Error types for the booster protocol core.
//!
//! Strongly-typed errors for different layers: connection errors (handshake,
//! timeout, state transitions) and cache errors (artifact generation,
//! tamper detection). We avoid `std::io::Error` for protocol logic to keep
//! error handling exhaustive and recoverable at the right boundary.

use std::{io, time::Duration};

use thiserror::Error;

use crate::connection::StreamState;

/// Errors that can occur during stream handshake/lifecycle operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state when the error occurred.
        state: StreamState,
        /// Operation that was attempted.
        operation: String,
    },

    /// Received an unexpected message type for the current stream state.
    #[error("unexpected message: received type {msg_type:#06x} in state {state:?}")]
    UnexpectedFrame {
        /// Current state when the message was received.
        state: StreamState,
        /// Wire `MessageType` discriminant of the unexpected message.
        msg_type: u16,
    },

    /// Session or stream handshake did not complete within the configured
    /// socket timeout (`BoosterTimeout`, default 4 s).
    #[error("handshake timeout after {elapsed:?}")]
    HandshakeTimeout {
        /// How long the peer was waited on.
        elapsed: Duration,
    },

    /// A daemon stream missed 4 consecutive heartbeats (SPEC_FULL.md §4.6).
    #[error("heartbeat timeout after {misses} consecutive misses")]
    HeartbeatTimeout {
        /// Number of consecutive heartbeat failures observed.
        misses: u32,
    },

    /// Wire-compatibility magic mismatch (SPEC_FULL.md §4.1, §8 "Magic
    /// check"). Carries the client's magic for the `UnsupportedClient`
    /// diagnostic.
    #[error("incompatible rpc: client magic {client_magic:#010x} != server magic {server_magic:#010x}")]
    IncompatibleRpc {
        /// Magic number presented by the client.
        client_magic: u32,
        /// Magic number expected by the server.
        server_magic: u32,
    },

    /// Program identity failed server policy (cpu-arch, runtime-version,
    /// runtime build-info, or `UseG1GC` mismatch per §4.2).
    #[error("unsupported client: {reason}")]
    UnsupportedClient {
        /// Human-readable mismatch description, echoed on the wire.
        reason: String,
    },

    /// A message body failed to decode as the type its `MessageType`
    /// implies.
    #[error("invalid payload: expected {expected} for type {msg_type:#06x}")]
    InvalidPayload {
        /// Expected payload shape.
        expected: &'static str,
        /// `MessageType` discriminant the payload was declared as.
        msg_type: u16,
    },

    /// Protocol error surfaced from the wire-framing layer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Underlying transport error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Unsupported wire-compatibility magic, retained for callers that only
    /// have the raw magic and no server-side counterpart to compare against
    /// (e.g. pre-handshake logging).
    #[error("unsupported protocol magic: {0:#010x}")]
    UnsupportedVersion(u32),
}

impl ConnectionError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Transient errors are timeouts. Protocol violations and policy
    /// rejections are never transient — they indicate a broken, stale, or
    /// disallowed peer and retrying without a handshake redo will not help.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::HandshakeTimeout { .. } | Self::HeartbeatTimeout { .. })
    }
}

/// Converts `ConnectionError` to `io::Error` for compatibility with async
/// I/O APIs at the transport boundary. Only used there — internally we
/// propagate `ConnectionError`.
impl From<ConnectionError> for io::Error {
    fn from(err: ConnectionError) -> Self {
        let kind = match &err {
            ConnectionError::HandshakeTimeout { .. } | ConnectionError::HeartbeatTimeout { .. } => {
                io::ErrorKind::TimedOut
            },
            ConnectionError::InvalidState { .. }
            | ConnectionError::UnexpectedFrame { .. }
            | ConnectionError::IncompatibleRpc { .. }
            | ConnectionError::UnsupportedClient { .. }
            | ConnectionError::UnsupportedVersion(_)
            | ConnectionError::Protocol(_)
            | ConnectionError::InvalidPayload { .. } => io::ErrorKind::InvalidData,
            ConnectionError::Transport(_) => io::ErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

/// Converts `booster-proto` errors to `ConnectionError`.
impl From<booster_proto::ProtocolError> for ConnectionError {
    fn from(err: booster_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Converts `io::Error` to `ConnectionError` (for transport errors).
impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Errors from the cache-artifact state machine (SPEC_FULL.md §4.4).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Another producer already holds `BeingGenerated` for this slot.
    #[error("cache slot already being generated")]
    AlreadyGenerating,

    /// The slot is not in the state the caller's transition requires.
    #[error("invalid cache state transition: cannot {operation} from {state:?}")]
    InvalidTransition {
        /// Current state when the error occurred.
        state: crate::cache_state::ArtifactState,
        /// Operation that was attempted.
        operation: String,
    },

    /// The tmp-file producer lock (`O_EXCL`) could not be acquired and the
    /// target file did not appear within the wait window.
    #[error("tmp-file lock contention: target did not appear within {waited:?}")]
    LockContention {
        /// How long the caller waited for the sibling producer.
        waited: Duration,
    },

    /// The on-disk artifact's mtime no longer matches the snapshot taken at
    /// publish time; the slot is demoted and the file removed.
    #[error("cache artifact tampered: {path}")]
    Tampered {
        /// Path of the artifact whose mtime mismatched.
        path: String,
    },

    /// A filesystem operation failed while generating or reading an
    /// artifact.
    #[error("cache io error: {0}")]
    Io(String),
}

impl CacheError {
    /// Cache errors are not, as a rule, transient: lock contention resolves
    /// by the caller's own 2 s poll loop rather than by a caller-level
    /// retry, and all other variants indicate a state the caller must
    /// react to (skip, demote, or surface) rather than blindly repeat.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        false
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_errors_are_transient() {
        assert!(
            ConnectionError::HandshakeTimeout { elapsed: Duration::from_secs(4) }.is_transient()
        );
        assert!(ConnectionError::HeartbeatTimeout { misses: 4 }.is_transient());
    }

    #[test]
    fn protocol_violations_are_fatal() {
        assert!(
            !ConnectionError::InvalidState { state: StreamState::Init, operation: "send".into() }
                .is_transient()
        );
        assert!(
            !ConnectionError::IncompatibleRpc { client_magic: 1, server_magic: 2 }.is_transient()
        );
        assert!(
            !ConnectionError::UnsupportedClient { reason: "cpu-arch mismatch".into() }
                .is_transient()
        );
    }

    #[test]
    fn cache_errors_are_never_transient() {
        assert!(!CacheError::AlreadyGenerating.is_transient());
        assert!(!CacheError::LockContention { waited: Duration::from_secs(2) }.is_transient());
    }
}
