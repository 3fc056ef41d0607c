//! TCP listener and per-connection dispatch loop (SPEC_FULL.md §4.5).
//!
//! One listener task accepts connections; each accepted socket gets its own
//! worker task, bounded by a [`Semaphore`] permit so an overload doesn't
//! spawn unbounded tasks. A connection's outbound direction is a small
//! per-stream writer fed through [`SharedState::outbound`] so any task
//! (this connection's own read loop, the control loop, a lazy-AOT
//! completion callback) can push bytes to a stream without owning its
//! socket half. Only the *read* half ever changes owning task, via
//! [`ServerAction::TransferToControlLoop`].

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use booster_core::env::Environment;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{mpsc, oneshot, Mutex, Semaphore},
};

use booster_proto::MessageReader;

use crate::{
    compiler::{CompilationInputSource, CompilerDriver},
    data_manager::ServerDataManager,
    driver::{LazyAotResult, LogLevel, ServerAction, ServerDriver, ServerEvent},
    server_error::ServerError,
};

/// `BoosterTimeout`'s default: the ceiling on any single socket read or
/// write (SPEC_FULL.md §6).
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_millis(4000);

/// A stream handed from the accept loop to the control loop once its
/// connection runs `ClientDaemonTask` (SPEC_FULL.md §4.6). The control loop
/// owns `read_half` from this point on; the write side stays reachable
/// through [`SharedState::send`], which every task shares.
pub struct DaemonTransfer {
    /// The stream id the driver tracks this connection under.
    pub stream_id: u32,
    /// The session the daemon stream belongs to.
    pub session_id: u32,
    /// The read half the control loop now owns exclusively.
    pub read_half: OwnedReadHalf,
    /// This stream's kill switch, so the control loop's reader can be woken
    /// the same way the accept loop's worker could have been.
    pub kill_rx: oneshot::Receiver<()>,
}

/// Per-stream outbound channels, shared by every task that might need to
/// write to a connection without owning its socket (the worker that opened
/// it, the control loop once it owns the read half, a lazy-AOT completion
/// callback running after the requesting worker moved on). Also carries a
/// per-stream kill switch: the task that currently owns a stream's read half
/// is usually the one that notices the stream should close (EOF, malformed
/// frame), but a `Tick`-driven eviction decides this from the driver's own
/// state with no such task on its call stack — `request_close` is how it
/// wakes whichever task is blocked reading that stream.
#[derive(Default)]
pub struct SharedState {
    outbound: DashMap<u32, mpsc::UnboundedSender<Bytes>>,
    kill: DashMap<u32, oneshot::Sender<()>>,
}

impl SharedState {
    /// Registers a fresh stream's outbound sender, spawning the small task
    /// that drains it onto `write_half`, and returns the receiving half of
    /// its kill switch for the caller to select on alongside its reads.
    fn register(&self, stream_id: u32, mut write_half: OwnedWriteHalf) -> oneshot::Receiver<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if tokio::time::timeout(DEFAULT_SOCKET_TIMEOUT, write_half.write_all(&bytes))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        self.outbound.insert(stream_id, tx);

        let (kill_tx, kill_rx) = oneshot::channel();
        self.kill.insert(stream_id, kill_tx);
        kill_rx
    }

    pub(crate) fn deregister(&self, stream_id: u32) {
        self.outbound.remove(&stream_id);
        self.kill.remove(&stream_id);
    }

    /// Sends `bytes` to `stream_id`'s writer task, if it is still registered.
    pub fn send(&self, stream_id: u32, bytes: Bytes) {
        if let Some(tx) = self.outbound.get(&stream_id) {
            let _ = tx.send(bytes);
        }
    }

    /// Wakes whatever task owns `stream_id`'s read half out of its blocking
    /// read, if that stream is still registered. A no-op if the stream
    /// already closed itself (the common case) or was never registered.
    pub(crate) fn request_close(&self, stream_id: u32) {
        if let Some((_, kill_tx)) = self.kill.remove(&stream_id) {
            let _ = kill_tx.send(());
        }
    }
}

/// Binds `bind_addr` with `SO_REUSEADDR`/`SO_KEEPALIVE` set before the
/// kernel begins queuing connections — options tokio's `TcpListener` does
/// not expose directly, hence building the raw socket with `socket2` first.
///
/// # Errors
///
/// Returns a [`ServerError::Transport`] if socket creation, option-setting,
/// binding, or listening fails.
pub fn bind(bind_addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let domain = socket2::Domain::for_address(bind_addr);
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
        .map_err(|e| ServerError::Transport(format!("socket create: {e}")))?;
    socket.set_reuse_address(true).map_err(|e| ServerError::Transport(format!("SO_REUSEADDR: {e}")))?;
    socket.set_keepalive(true).map_err(|e| ServerError::Transport(format!("SO_KEEPALIVE: {e}")))?;
    socket.set_nonblocking(true).map_err(|e| ServerError::Transport(format!("nonblocking: {e}")))?;
    // Rely on the OS backlog (SOMAXCONN) rather than a tuned value.
    socket.bind(&bind_addr.into()).map_err(|e| ServerError::Transport(format!("bind: {e}")))?;
    socket.listen(1024).map_err(|e| ServerError::Transport(format!("listen: {e}")))?;
    TcpListener::from_std(socket.into()).map_err(|e| ServerError::Transport(format!("from_std: {e}")))
}

/// Accepts connections on `listener` until the process is torn down,
/// dispatching each to its own worker task gated by `max_connections`
/// concurrent permits (beyond that, a new connection is accepted and
/// immediately closed rather than left to queue in-process).
#[allow(clippy::too_many_arguments)]
pub async fn run<E>(
    listener: TcpListener,
    driver: Arc<Mutex<ServerDriver<E>>>,
    data: Arc<ServerDataManager<E>>,
    env: E,
    shared: Arc<SharedState>,
    daemon_tx: mpsc::UnboundedSender<DaemonTransfer>,
    compiler: Arc<dyn CompilerDriver>,
    input_source: Arc<dyn CompilationInputSource>,
    max_connections: usize,
) where
    E: Environment,
{
    let next_stream_id = Arc::new(AtomicU32::new(0));
    let permits = Arc::new(Semaphore::new(max_connections));

    loop {
        let (socket, _peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                continue;
            },
        };

        let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
            // At capacity: refuse and close rather than queue in-process
            // (SPEC_FULL.md §4.5 "bounded worker pool").
            drop(socket);
            continue;
        };

        let stream_id = next_stream_id.fetch_add(1, Ordering::Relaxed);
        let driver = Arc::clone(&driver);
        let data = Arc::clone(&data);
        let env = env.clone();
        let shared = Arc::clone(&shared);
        let daemon_tx = daemon_tx.clone();
        let compiler = Arc::clone(&compiler);
        let input_source = Arc::clone(&input_source);

        tokio::spawn(async move {
            let _permit = permit;
            handle_connection(stream_id, socket, driver, data, env, shared, daemon_tx, compiler, input_source)
                .await;
        });
    }
}

/// What the caller should do next after applying a batch of actions against
/// one stream it owns the read half of.
pub(crate) enum ConnectionOutcome {
    /// Keep serving this stream; here is its read half and kill switch back.
    Continue(OwnedReadHalf, oneshot::Receiver<()>),
    /// The stream was closed; the caller must stop touching it.
    Closed,
    /// The read half was moved into the daemon-transfer channel; the caller
    /// must return without touching the stream again.
    Transferred,
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection<E>(
    stream_id: u32,
    socket: TcpStream,
    driver: Arc<Mutex<ServerDriver<E>>>,
    data: Arc<ServerDataManager<E>>,
    env: E,
    shared: Arc<SharedState>,
    daemon_tx: mpsc::UnboundedSender<DaemonTransfer>,
    compiler: Arc<dyn CompilerDriver>,
    input_source: Arc<dyn CompilationInputSource>,
) where
    E: Environment,
{
    let _ = socket.set_nodelay(true);
    let (mut read_half, write_half) = socket.into_split();
    let mut kill_rx = shared.register(stream_id, write_half);

    if !run_lifecycle_event(&driver, &shared, ServerEvent::StreamOpened { stream_id }).await {
        shared.deregister(stream_id);
        return;
    }

    let mut reader = MessageReader::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = tokio::select! {
            read = tokio::time::timeout(DEFAULT_SOCKET_TIMEOUT, read_half.read(&mut buf)) => match read {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => n,
            },
            _ = &mut kill_rx => break,
        };
        reader.push(&buf[..n]);

        loop {
            let message = match reader.next_message() {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%stream_id, error = %err, "malformed frame, closing stream");
                    let _ = run_lifecycle_event(&driver, &shared, ServerEvent::StreamClosed { stream_id }).await;
                    shared.deregister(stream_id);
                    return;
                },
            };

            let actions = {
                let mut guard = driver.lock().await;
                match guard.process_event(ServerEvent::MessageReceived { stream_id, message }) {
                    Ok(actions) => actions,
                    Err(err) => {
                        tracing::error!(%stream_id, error = %err, "driver error, closing stream");
                        shared.deregister(stream_id);
                        return;
                    },
                }
            };

            match apply_actions(
                actions,
                &driver,
                &data,
                &env,
                &shared,
                &daemon_tx,
                read_half,
                kill_rx,
                &compiler,
                &input_source,
            )
            .await
            {
                ConnectionOutcome::Continue(half, rx) => {
                    read_half = half;
                    kill_rx = rx;
                },
                ConnectionOutcome::Closed => {
                    shared.deregister(stream_id);
                    return;
                },
                ConnectionOutcome::Transferred => return,
            }
        }
    }

    let _ = run_lifecycle_event(&driver, &shared, ServerEvent::StreamClosed { stream_id }).await;
    shared.deregister(stream_id);
}

/// Applies one batch of [`ServerAction`]s against a live stream, consuming
/// and (usually) returning its read half. Shared by the listener's
/// per-connection worker and the control loop's per-daemon read loop, since
/// both drive the same state machine and the same [`SharedState`] outbound
/// registry.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn apply_actions<E>(
    actions: Vec<ServerAction>,
    driver: &Arc<Mutex<ServerDriver<E>>>,
    data: &Arc<ServerDataManager<E>>,
    env: &E,
    shared: &Arc<SharedState>,
    daemon_tx: &mpsc::UnboundedSender<DaemonTransfer>,
    read_half: OwnedReadHalf,
    kill_rx: oneshot::Receiver<()>,
    compiler: &Arc<dyn CompilerDriver>,
    input_source: &Arc<dyn CompilationInputSource>,
) -> ConnectionOutcome
where
    E: Environment,
{
    for action in actions {
        match action {
            ServerAction::Send { stream_id: target, message } => match message.encode_to_vec() {
                Ok(bytes) => shared.send(target, Bytes::from(bytes)),
                Err(err) => tracing::error!(%target, error = %err, "failed to encode message"),
            },
            ServerAction::CloseStream { stream_id: target } => {
                let _ =
                    run_lifecycle_event(driver, shared, ServerEvent::StreamClosed { stream_id: target }).await;
                return ConnectionOutcome::Closed;
            },
            ServerAction::TransferToControlLoop { stream_id: target, session_id } => {
                if daemon_tx
                    .send(DaemonTransfer { stream_id: target, session_id, read_half, kill_rx })
                    .is_err()
                {
                    tracing::error!(%target, "control loop channel closed, dropping daemon stream");
                }
                return ConnectionOutcome::Transferred;
            },
            ServerAction::RunLazyAot { stream_id: target, session_id, program_id: _, pgo } => {
                spawn_lazy_aot(
                    target,
                    session_id,
                    pgo,
                    Arc::clone(driver),
                    Arc::clone(data),
                    env.clone(),
                    Arc::clone(shared),
                    Arc::clone(compiler),
                    Arc::clone(input_source),
                );
            },
            ServerAction::Log { level, message } => log_action(level, &message),
        }
    }
    ConnectionOutcome::Continue(read_half, kill_rx)
}

fn log_action(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!("{message}"),
        LogLevel::Info => tracing::info!("{message}"),
        LogLevel::Warn => tracing::warn!("{message}"),
        LogLevel::Error => tracing::error!("{message}"),
    }
}

/// Sends one lifecycle event (`StreamOpened`/`StreamClosed`/`Tick`) into the
/// driver and applies the resulting actions against `shared` only — those
/// events never yield `CloseStream`/`TransferToControlLoop` for a stream
/// this caller still owns a read half of, so no half is threaded through.
pub(crate) async fn run_lifecycle_event<E>(
    driver: &Arc<Mutex<ServerDriver<E>>>,
    shared: &Arc<SharedState>,
    event: ServerEvent,
) -> bool
where
    E: Environment,
{
    let actions = {
        let mut guard = driver.lock().await;
        match guard.process_event(event) {
            Ok(actions) => actions,
            Err(err) => {
                tracing::error!(error = %err, "driver error processing lifecycle event");
                return false;
            },
        }
    };
    for action in actions {
        match action {
            ServerAction::Send { stream_id, message } => match message.encode_to_vec() {
                Ok(bytes) => shared.send(stream_id, Bytes::from(bytes)),
                Err(err) => tracing::error!(error = %err, "failed to encode message"),
            },
            ServerAction::Log { level, message } => log_action(level, &message),
            ServerAction::CloseStream { stream_id } => {
                shared.request_close(stream_id);
                shared.deregister(stream_id);
            },
            ServerAction::TransferToControlLoop { .. } | ServerAction::RunLazyAot { .. } => {
                tracing::error!("unexpected action from a lifecycle-only event");
            },
        }
    }
    true
}

#[allow(clippy::too_many_arguments)]
fn spawn_lazy_aot<E>(
    stream_id: u32,
    session_id: u32,
    pgo: bool,
    driver: Arc<Mutex<ServerDriver<E>>>,
    data: Arc<ServerDataManager<E>>,
    env: E,
    shared: Arc<SharedState>,
    compiler: Arc<dyn CompilerDriver>,
    input_source: Arc<dyn CompilationInputSource>,
) where
    E: Environment,
{
    tokio::spawn(async move {
        let Some(session) = data.get_session(session_id) else {
            return;
        };
        let program = std::sync::Arc::clone(session.program_data());
        // `get_session` incremented the ref-count on our behalf; we only
        // needed it to reach `program`, so release it immediately rather
        // than holding it for this task's lifetime.
        session.ref_count().dec(env.wall_clock_secs());

        let slot_kind =
            if pgo { booster_core::ArtifactKind::AotPgo } else { booster_core::ArtifactKind::AotStatic };

        let outcome = tokio::task::spawn_blocking(move || {
            let slot = program.slot(slot_kind);
            crate::compiler::run_lazy_aot(slot, session_id, pgo, input_source.as_ref(), compiler.as_ref())
        })
        .await;

        let result = match outcome {
            Ok(Ok(true)) => LazyAotResult::Published,
            Ok(Ok(false)) => LazyAotResult::Skipped,
            Ok(Err(err)) => LazyAotResult::Failed(err.to_string()),
            Err(join_err) => LazyAotResult::Failed(join_err.to_string()),
        };

        let _ = run_lifecycle_event(
            &driver,
            &shared,
            ServerEvent::LazyAotCompleted { stream_id, outcome: result },
        )
        .await;
    });
}
