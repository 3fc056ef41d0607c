//! Domain model for the booster accelerator: program identity, class-loader
//! reconstruction, the cache-artifact state machine, and session/program
//! lifecycle (SPEC_FULL.md §3, §4.2-§4.4).
//!
//! Built on `booster-proto`'s wire layer the way `lockframe-core` builds
//! session semantics on `lockframe-proto`'s frame/header split: this crate
//! owns no sockets, only state machines and data that `booster-server`/
//! `booster-client` drive from I/O.

pub mod cache_state;
pub mod class_loader;
pub mod connection;
pub mod env;
pub mod error;
pub mod identity;
pub mod program_data;
pub mod session_data;
pub mod wire;

pub use cache_state::{ArtifactState, CacheSlot};
pub use class_loader::{ClassLoaderChain, ClassLoaderKey, ClassLoaderLink, Interner};
pub use connection::{CommunicationStream, StreamState};
pub use env::Environment;
pub use error::{CacheError, ConnectionError};
pub use identity::{BoostFlags, CpuArch, ProgramIdentity, RuntimeFlagSnapshot};
pub use program_data::{ArtifactKind, ClassLoaderHandle, ProgramData, RefCount};
pub use session_data::{AddressMap, SessionData};
pub use wire::{
    HeartbeatPayload, SessionHandshakeReply, SessionHandshakeRequest, StreamHandshakeReply,
    StreamHandshakeRequest, UnsupportedClientPayload,
};
