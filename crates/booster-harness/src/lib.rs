//! Deterministic turmoil-based simulation harness for the booster
//! accelerator's end-to-end scenarios (SPEC_FULL.md §8).
//!
//! Wraps the production `booster-server::ServerDriver`/`ServerDataManager`
//! Sans-IO core with a virtualized clock and network, so scenarios that
//! depend on real concurrent task scheduling and timing (a client
//! reconnecting after a simulated server restart, two clients racing to
//! generate the same cache artifact, a daemon stream going silent) run
//! deterministically and fast rather than against a real clock and OS
//! sockets.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod sim_env;
pub mod sim_server;

pub use sim_env::SimEnv;
pub use sim_server::SimServer;
