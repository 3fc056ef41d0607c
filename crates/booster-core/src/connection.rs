//! Per-stream handshake and lifecycle state machine.
//!
//! A `CommunicationStream` is the sans-IO counterpart of one TCP connection's
//! worth of protocol state (SPEC_FULL.md §4.2). It owns no socket: the
//! listener/worker glue in `booster-server` reads frames off the wire and
//! feeds them through `StreamState` transitions, and writes whatever frames
//! the transitions produce. This mirrors how `lockframe-core::connection`
//! keeps connection state free of actual I/O.

use std::thread::{self, ThreadId};

use crate::error::ConnectionError;

/// The handshake/lifecycle state of one stream.
///
/// Transitions are driven entirely by which message type arrives next; see
/// `StreamState::on_session_meta`/`on_stream_meta`/`on_close` for the legal
/// moves. An illegal move (e.g. a second `ClientSessionMeta` on an already
/// established stream) is a protocol violation, not a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Freshly accepted; no meta message has been processed yet.
    Init,
    /// Session (or stream) meta accepted; the stream may carry normal
    /// request/response traffic.
    Active,
    /// `NoMoreRequests` was received, or the stream errored; no further
    /// frames are dispatched.
    Closed,
}

/// Sans-IO representation of one `CommunicationStream` (SPEC_FULL.md §4.2).
///
/// Binds a server-assigned `stream_id` to a `StreamState` and, in debug
/// builds, to the thread that is allowed to drive it — mirroring the spec's
/// "stream operations assert thread-affinity in debug mode" requirement,
/// translated from OS threads to whichever tokio task currently owns the
/// stream.
#[derive(Debug)]
pub struct CommunicationStream {
    stream_id: u32,
    state: StreamState,
    last_error: Option<ConnectionError>,
    owner: Option<ThreadId>,
}

impl CommunicationStream {
    /// Creates a freshly accepted stream bound to the calling thread.
    #[must_use]
    pub fn new(stream_id: u32) -> Self {
        Self { stream_id, state: StreamState::Init, last_error: None, owner: Some(thread::current().id()) }
    }

    /// The server-assigned stream id.
    #[must_use]
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// The current handshake/lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// The most recent error recorded against this stream, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&ConnectionError> {
        self.last_error.as_ref()
    }

    /// Asserts the calling thread is the stream's current owner.
    ///
    /// Debug-only, matching the spec's "assert thread-affinity in debug
    /// mode to prevent multi-threaded stream misuse" (§4.2). Release builds
    /// skip the check entirely.
    pub fn assert_owned_by_current_thread(&self) -> Result<(), ConnectionError> {
        if cfg!(debug_assertions) {
            if let Some(owner) = self.owner {
                if owner != thread::current().id() {
                    return Err(ConnectionError::InvalidState {
                        state: self.state,
                        operation: "cross-thread stream access".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Transfers ownership of a long-lived daemon stream to another task.
    ///
    /// Per §4.5, worker threads transfer `ClientDaemonTask` streams to the
    /// control thread and must not touch the stream afterward; the scoped
    /// guard that deletes a stream on worker exit must check ownership
    /// first. Translated here as `tokio` task handoff: the previous owner
    /// thread id is cleared so a subsequent `assert_owned_by_current_thread`
    /// from the old owner fails closed rather than silently succeeding.
    pub fn transfer_ownership(&mut self) {
        self.owner = Some(thread::current().id());
    }

    /// Marks the stream established after a successful session or stream
    /// meta exchange.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::InvalidState` if the stream is not in
    /// `Init` (a second meta message on an already-active stream is a
    /// protocol violation per §5, "Handshake message `ClientSessionMeta` is
    /// always the first on its stream and occurs at most once per stream").
    pub fn activate(&mut self) -> Result<(), ConnectionError> {
        if self.state != StreamState::Init {
            return Err(ConnectionError::InvalidState {
                state: self.state,
                operation: "activate".to_string(),
            });
        }
        self.state = StreamState::Active;
        Ok(())
    }

    /// Records a protocol/transport error and closes the stream.
    ///
    /// Per §7, stream-level errors close the stream; the caller is expected
    /// to have already logged `error_name`/`error_message`/`session_id`/
    /// `stream_id`.
    pub fn fail(&mut self, err: ConnectionError) {
        self.last_error = Some(err);
        self.state = StreamState::Closed;
    }

    /// Closes the stream following a clean `NoMoreRequests` signal.
    pub fn close(&mut self) {
        self.state = StreamState::Closed;
    }

    /// Whether the stream may still dispatch messages.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == StreamState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stream_starts_in_init() {
        let stream = CommunicationStream::new(1);
        assert_eq!(stream.state(), StreamState::Init);
        assert!(!stream.is_active());
    }

    #[test]
    fn activate_from_init_succeeds_once() {
        let mut stream = CommunicationStream::new(1);
        stream.activate().unwrap();
        assert!(stream.is_active());

        let err = stream.activate().unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidState { .. }));
    }

    #[test]
    fn fail_records_error_and_closes() {
        let mut stream = CommunicationStream::new(1);
        stream.activate().unwrap();
        stream.fail(ConnectionError::UnsupportedVersion(7));
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.last_error().is_some());
        assert!(!stream.is_active());
    }

    #[test]
    fn close_after_active_is_terminal() {
        let mut stream = CommunicationStream::new(1);
        stream.activate().unwrap();
        stream.close();
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn current_thread_owns_freshly_created_stream() {
        let stream = CommunicationStream::new(1);
        assert!(stream.assert_owned_by_current_thread().is_ok());
    }
}
