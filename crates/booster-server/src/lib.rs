//! Booster accelerator server.
//!
//! # Architecture
//!
//! This crate provides production "glue" that wraps [`booster_core`]'s
//! action-based logic with real I/O. [`ServerDriver`] follows the Sans-IO
//! pattern (see [`booster_core`] for details): `process_event` is pure,
//! synchronous, and does no I/O of its own. [`Server`] is the production
//! runtime that drives it — a TCP accept loop
//! ([`listener`], SPEC_FULL.md §4.5) feeding the driver, and a control loop
//! ([`control`], SPEC_FULL.md §4.6) ticking it on a timer and owning
//! handed-off daemon streams.
//!
//! # Components
//!
//! - [`ServerDriver`]: action-based orchestrator (pure logic, no I/O)
//! - [`Server`]: production runtime that binds a socket and runs both loops
//! - [`SystemEnv`]: production environment (real time, crypto RNG)
//! - [`data_manager::ServerDataManager`]: program/session registry

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod compiler;
mod control;
pub mod data_manager;
mod driver;
mod handlers;
mod listener;
mod server_error;
mod system_env;

use std::{net::SocketAddr, sync::Arc};

pub use compiler::{CompilationInputSource, CompilerDriver, StubCompilationInputSource, StubCompilerDriver};
pub use data_manager::ServerDataManager;
pub use driver::{LogLevel, ServerAction, ServerConfig as DriverConfig, ServerDriver, ServerEvent};
pub use listener::SharedState;
pub use server_error::{ExecutorError, ServerError};
pub use system_env::SystemEnv;
use tokio::sync::{mpsc, Mutex};

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:7420").
    pub bind_address: SocketAddr,
    /// Directory cache artifacts are stored under (`cache-<id>-<kind>`).
    pub cache_dir: std::path::PathBuf,
    /// Maximum concurrent connections the accept loop admits.
    pub max_connections: usize,
    /// Driver configuration (timeouts, limits, expected program identity).
    pub driver: DriverConfig,
}

/// Production Booster server.
///
/// Wraps [`ServerDriver`] and [`ServerDataManager`] with a TCP listener and
/// control loop built on [`SystemEnv`].
pub struct Server {
    listener: tokio::net::TcpListener,
    driver: Arc<Mutex<ServerDriver<SystemEnv>>>,
    data: Arc<ServerDataManager<SystemEnv>>,
    env: SystemEnv,
    max_connections: usize,
}

impl Server {
    /// Binds a new server at `config.bind_address`.
    ///
    /// # Errors
    ///
    /// Returns a [`ServerError::Transport`] if the bind fails.
    pub fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        let listener = listener::bind(config.bind_address)?;
        let env = SystemEnv::new();
        let data = Arc::new(ServerDataManager::new(config.cache_dir, env.clone()));
        let driver = Arc::new(Mutex::new(ServerDriver::new(Arc::clone(&data), config.driver, env.clone())));
        Ok(Self { listener, driver, data, env, max_connections: config.max_connections })
    }

    /// Local address the server is bound to.
    ///
    /// # Errors
    ///
    /// Returns a [`ServerError::Transport`] if the socket's address cannot be
    /// queried.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(|e| ServerError::Transport(format!("local_addr: {e}")))
    }

    /// Runs the server: the accept loop and the control loop, both forever.
    ///
    /// Uses [`StubCompilerDriver`]/[`StubCompilationInputSource`] for lazy-AOT
    /// tasks (SPEC_FULL.md §9(iii) — no out-of-process compiler backend is
    /// wired in yet).
    ///
    /// Runs until the process is torn down; the accept loop never returns.
    pub async fn run(self) {
        let shared = Arc::new(SharedState::default());
        let (daemon_tx, daemon_rx) = mpsc::unbounded_channel();
        let compiler: Arc<dyn CompilerDriver> = Arc::new(StubCompilerDriver);
        let input_source: Arc<dyn CompilationInputSource> = Arc::new(StubCompilationInputSource);

        tokio::spawn(control::run(
            Arc::clone(&self.driver),
            Arc::clone(&self.data),
            self.env.clone(),
            Arc::clone(&shared),
            daemon_rx,
            daemon_tx.clone(),
            Arc::clone(&compiler),
            Arc::clone(&input_source),
        ));

        listener::run(
            self.listener,
            self.driver,
            self.data,
            self.env,
            shared,
            daemon_tx,
            compiler,
            input_source,
            self.max_connections,
        )
        .await;
    }
}
