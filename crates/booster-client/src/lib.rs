//! Client-side program identity, boost-flag resolution, and session/daemon
//! transport for the booster accelerator (SPEC_FULL.md §4.8).
//!
//! # Architecture
//!
//! Unlike `booster-server`'s action-returning [`booster_core::Environment`]-
//! parameterized state machine, this crate has no long-lived many-connection
//! loop to drive: one process runs one session handshake, one daemon stream,
//! and a handful of short-lived fetch/sync streams. [`session::BoosterClient`]
//! is a linear async orchestration over [`transport::MessageStream`] rather
//! than a sans-IO driver with its own event/action pair.
//!
//! # Components
//!
//! - [`session::BoosterClient`]: top-level handshake/fetch/daemon/shutdown
//!   orchestration for one client run
//! - [`config::ClientConfig`]: the flag surface an embedder resolves and
//!   passes in (this crate parses no CLI/environment flags itself)
//! - [`boost`]: `BoostStopAtLevel`/`UseBoostPackages` resolution and
//!   per-artifact fetch-vs-generate selection
//! - [`data_manager::ClientDataManager`]: the process-wide singleton holding
//!   program identity, cache directory, and in-flight artifact usage
//! - [`startup::StartupGate`]: the end-of-startup latch that gates CLR/CDS
//!   contribution and AOT fetch
//! - [`transport`]: framed TCP connection plus the session/stream handshake
//! - [`daemon`]: the heartbeat-echo loop run on the daemon stream
//! - [`sync`]: the `Get*Cache`/`CacheFilesSyncTask` fetch and upload
//!   exchanges, built on `booster-proto::FileWrapper`
//! - [`system_env::ClientSystemEnv`]: the production [`Environment`]
//!   implementation

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod boost;
pub mod config;
pub mod daemon;
pub mod data_manager;
pub mod error;
pub mod session;
pub mod startup;
pub mod sync;
pub mod system_env;
pub mod transport;

pub use boost::{artifact_action, parse_use_boost_packages, ArtifactAction, BoostPolicy, StopAtLevel};
pub use booster_core::Environment;
pub use config::ClientConfig;
pub use data_manager::{ClientDataManager, UsingFlags};
pub use error::ClientError;
pub use session::BoosterClient;
pub use startup::{StartupGate, StartupSignal};
pub use system_env::ClientSystemEnv;
