//! Client-facing error type.

use thiserror::Error;

use booster_core::ConnectionError;

/// Errors this crate surfaces to its embedder.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A protocol/connection-layer failure (bad state, magic mismatch,
    /// malformed frame).
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Wire framing/codec error.
    #[error(transparent)]
    Protocol(#[from] booster_proto::ProtocolError),

    /// Underlying transport (socket) error.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The server rejected this client outright (SPEC_FULL.md §4.2, §7).
    #[error("rejected by server: {reason}")]
    Rejected {
        /// Reason the server gave, as sent in `UnsupportedClient`.
        reason: String,
    },
}
