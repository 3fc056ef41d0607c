//! Wire framing and serialization for the booster client/server protocol.
//!
//! This crate has no knowledge of sessions, programs, or cache artifacts — it
//! only knows how to frame, pad, and chunk bytes. `booster-core` builds the
//! domain model on top of it, the same way `lockframe-core` builds session
//! semantics on top of `lockframe-proto`'s frame/header split.

pub mod buffer;
pub mod errors;
pub mod message;
pub mod message_type;
pub mod wrappers;

pub use buffer::{DecodeOutcome, MessageBuffer, NULL_PTR};
pub use errors::{ProtocolError, Result};
pub use message::{Message, MessageReader, HEADER_LEN, MAX_MESSAGE_SIZE};
pub use message_type::MessageType;
pub use wrappers::{ArrayWrapper, FileWrapper, MemoryWrapper, StringWrapper, MAX_CHUNK, TMP_LOCK_WAIT};
