//! Turmoil-backed stand-in for the production accept/control loop
//! (SPEC_FULL.md §4.5, §4.6), reusing the real Sans-IO [`ServerDriver`] and
//! [`ServerDataManager`] behind a deterministic network.
//!
//! `booster-server`'s own listener and control loop are private to that
//! crate and built on real `tokio::net::TcpStream`, so this mirrors their
//! shape rather than reusing them directly — the same relationship
//! `lockframe-harness::sim_server` has to `lockframe-server`'s listener.
//! Unlike the production loop, one task serves a connection end-to-end
//! (read and write both); there is no separate control loop a daemon
//! stream gets handed off to, since a single turmoil host has no need to
//! split that work across tasks to stay responsive.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use booster_proto::MessageReader;
use booster_server::{data_manager::ServerDataManager, DriverConfig, ServerAction, ServerDriver, ServerEvent};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{mpsc, Mutex},
};
use turmoil::net::{TcpListener, TcpStream};

use crate::sim_env::SimEnv;

/// Per-stream outbound channel, so a `Tick`-driven heartbeat (fired from the
/// ticker task) can reach a connection owned by a different task.
#[derive(Default)]
struct Outbound {
    senders: StdMutex<HashMap<u32, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Outbound {
    fn register(&self, stream_id: u32) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().expect("outbound mutex poisoned").insert(stream_id, tx);
        rx
    }

    fn deregister(&self, stream_id: u32) {
        self.senders.lock().expect("outbound mutex poisoned").remove(&stream_id);
    }

    fn send(&self, stream_id: u32, bytes: Vec<u8>) {
        if let Some(tx) = self.senders.lock().expect("outbound mutex poisoned").get(&stream_id) {
            let _ = tx.send(bytes);
        }
    }
}

/// A `booster-server` instance running inside a turmoil host.
pub struct SimServer {
    listener: TcpListener,
    driver: Arc<Mutex<ServerDriver<SimEnv>>>,
    data: Arc<ServerDataManager<SimEnv>>,
    env: SimEnv,
    outbound: Arc<Outbound>,
    tick_interval: Duration,
}

impl SimServer {
    /// Binds a simulated server at `addr` with `config`, seeded by `seed`,
    /// ticking every `tick_interval` (much shorter than the production
    /// default so heartbeat/eviction scenarios run in a handful of
    /// simulated seconds rather than the real 30s sweep).
    ///
    /// # Errors
    ///
    /// Returns an error if the turmoil listener cannot bind `addr`.
    pub async fn bind(
        addr: &str,
        config: DriverConfig,
        seed: u64,
        tick_interval: Duration,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let env = SimEnv::with_seed(seed);
        let cache_dir = std::env::temp_dir().join(format!("booster-harness-{seed}"));
        let data = Arc::new(ServerDataManager::new(cache_dir, env.clone()));
        let driver = Arc::new(Mutex::new(ServerDriver::new(Arc::clone(&data), config, env.clone())));
        Ok(Self { listener, driver, data, env, outbound: Arc::new(Outbound::default()), tick_interval })
    }

    /// The data manager backing this server, for tests that want to inspect
    /// or directly manipulate program/session state (SPEC_FULL.md §8
    /// scenario 5's concurrent `CacheSlot` race does not need a live
    /// connection at all).
    #[must_use]
    pub fn data(&self) -> &Arc<ServerDataManager<SimEnv>> {
        &self.data
    }

    /// This server's simulation environment (its seed, for constructing a
    /// second `SimServer` that shares no state — the "restart" shape of
    /// SPEC_FULL.md §8 scenario 3).
    #[must_use]
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Runs the accept loop and the tick loop forever. Spawn this, then
    /// drive client connections from the same turmoil simulation.
    ///
    /// A stream a `Tick` sweep evicts for missed heartbeats is not forcibly
    /// unblocked out of its pending read here (the harness has no
    /// `SharedState`-style kill channel, SPEC_FULL.md §4.6's production
    /// concern): `ServerDriver::handle_tick` has already dropped the
    /// stream's session/program bookkeeping by the time this returns, which
    /// is what scenario assertions observe.
    pub async fn run(self) {
        let driver = Arc::clone(&self.driver);
        let outbound = Arc::clone(&self.outbound);
        let tick_interval = self.tick_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick_interval).await;
                let actions = {
                    let mut guard = driver.lock().await;
                    match guard.process_event(ServerEvent::Tick) {
                        Ok(actions) => actions,
                        Err(err) => {
                            tracing::error!(error = %err, "tick failed");
                            continue;
                        },
                    }
                };
                dispatch(&actions, &outbound);
            }
        });

        let mut next_stream_id: u32 = 0;
        loop {
            let Ok((socket, _peer)) = self.listener.accept().await else {
                continue;
            };
            let stream_id = next_stream_id;
            next_stream_id += 1;

            let driver = Arc::clone(&self.driver);
            let outbound = Arc::clone(&self.outbound);

            tokio::spawn(async move {
                handle_connection(stream_id, socket, driver, outbound).await;
            });
        }
    }
}

/// Applies `Send`/`Log` actions; ignores `CloseStream`/`TransferToControlLoop`
/// (no task is waiting on those outside a connection's own event loop) and
/// `RunLazyAot` (unsimulated, see [`run_event`]).
fn dispatch(actions: &[ServerAction], outbound: &Outbound) {
    for action in actions {
        match action {
            ServerAction::Send { stream_id, message } => match message.encode_to_vec() {
                Ok(bytes) => outbound.send(*stream_id, bytes),
                Err(err) => tracing::error!(error = %err, "encode failed"),
            },
            ServerAction::Log { level, message } => tracing::debug!(?level, message),
            ServerAction::CloseStream { .. }
            | ServerAction::TransferToControlLoop { .. }
            | ServerAction::RunLazyAot { .. } => {},
        }
    }
}

async fn handle_connection(
    stream_id: u32,
    socket: TcpStream,
    driver: Arc<Mutex<ServerDriver<SimEnv>>>,
    outbound: Arc<Outbound>,
) {
    let (mut read_half, mut write_half) = tokio::io::split(socket);
    let mut writer_rx = outbound.register(stream_id);

    tokio::spawn(async move {
        while let Some(bytes) = writer_rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    if !run_event(&driver, &outbound, ServerEvent::StreamOpened { stream_id }).await {
        outbound.deregister(stream_id);
        return;
    }

    let mut reader = MessageReader::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        reader.push(&buf[..n]);

        loop {
            let message = match reader.next_message() {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%stream_id, error = %err, "malformed frame");
                    let _ = run_event(&driver, &outbound, ServerEvent::StreamClosed { stream_id }).await;
                    outbound.deregister(stream_id);
                    return;
                },
            };

            if !run_event(&driver, &outbound, ServerEvent::MessageReceived { stream_id, message }).await {
                outbound.deregister(stream_id);
                return;
            }
        }
    }

    let _ = run_event(&driver, &outbound, ServerEvent::StreamClosed { stream_id }).await;
    outbound.deregister(stream_id);
}

/// Runs one event through the driver and applies the resulting actions.
/// Returns `false` if a `CloseStream` action for this stream ended things.
async fn run_event(
    driver: &Arc<Mutex<ServerDriver<SimEnv>>>,
    outbound: &Arc<Outbound>,
    event: ServerEvent,
) -> bool {
    let actions = {
        let mut guard = driver.lock().await;
        match guard.process_event(event) {
            Ok(actions) => actions,
            Err(err) => {
                tracing::error!(error = %err, "driver error");
                return false;
            },
        }
    };

    let mut keep_going = true;
    for action in &actions {
        match action {
            ServerAction::CloseStream { .. } => keep_going = false,
            ServerAction::TransferToControlLoop { .. } => {
                // No separate control loop in the harness: the same task
                // keeps serving this stream's daemon heartbeat traffic.
            },
            ServerAction::RunLazyAot { .. } => {
                tracing::warn!("lazy-AOT compilation is not simulated by the harness");
            },
            ServerAction::Send { .. } | ServerAction::Log { .. } => {},
        }
    }
    dispatch(&actions, outbound);
    keep_going
}
