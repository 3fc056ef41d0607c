//! Protocol-level error types.
//!
//! Covers framing and codec failures: malformed headers, oversized or
//! undersized messages, and argument-level decode errors. Two "soft markers"
//! (`DeserTermination`, `AbortCurPhase`) are deliberately *not* part of this
//! error enum — they are control-flow outcomes, not failures, and are modeled
//! by [`crate::buffer::DecodeOutcome`] instead so they can never leak to a
//! caller as an `Err`.

use thiserror::Error;

/// Errors produced while framing or decoding a message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The 6-byte header declared a `size` smaller than the header itself.
    #[error("bad message size: {size} (minimum is {min})")]
    BadMsgSize {
        /// Declared size.
        size: u32,
        /// Minimum legal size (header length).
        min: u32,
    },

    /// The declared `size` exceeds the configured maximum buffer capacity.
    #[error("message size {size} exceeds maximum {max}")]
    MessageTooLarge {
        /// Declared size.
        size: u32,
        /// Configured maximum.
        max: u32,
    },

    /// The `type` field did not map to a known [`crate::message_type::MessageType`].
    #[error("bad message type: {0:#06x}")]
    BadMsgType(u16),

    /// The buffer ended before a complete header could be read.
    #[error("truncated header: got {got} bytes, need {need}")]
    TruncatedHeader {
        /// Bytes available.
        got: usize,
        /// Bytes required.
        need: usize,
    },

    /// The buffer ended before the declared payload was fully available.
    #[error("truncated payload: declared {declared}, got {got}")]
    TruncatedPayload {
        /// Declared payload length.
        declared: u32,
        /// Bytes available.
        got: usize,
    },

    /// A composite argument's inner decoder consumed more bytes than its
    /// `arg_size` meta declared.
    #[error("bad argument size: declared {declared}, consumed {consumed}")]
    BadArgSize {
        /// Declared argument size.
        declared: u32,
        /// Bytes actually consumed.
        consumed: u32,
    },

    /// An argument's bytes could not be interpreted as the expected type.
    #[error("bad argument data: {0}")]
    BadArgData(String),

    /// Client/server compile-time wire-compatibility magic did not match.
    #[error("incompatible rpc: {reason}")]
    IncompatibleRpc {
        /// Human-readable mismatch reason.
        reason: String,
    },
}

impl ProtocolError {
    /// Whether this error is a peer-protocol violation that should close the
    /// owning stream (true for everything except (currently) nothing — every
    /// `ProtocolError` variant is stream-fatal by construction; the soft
    /// markers that are *not* fatal are represented outside this enum).
    #[must_use]
    pub fn is_stream_fatal(&self) -> bool {
        true
    }
}

/// Convenience alias used throughout the wire-format layer.
pub type Result<T> = std::result::Result<T, ProtocolError>;
