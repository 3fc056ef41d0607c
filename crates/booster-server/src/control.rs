//! Control loop: periodic ticks plus the post-handoff daemon-stream read
//! loop (SPEC_FULL.md §4.6).
//!
//! Two halves share this module:
//!
//! - a ticker that fires [`ServerEvent::Tick`] on a fixed interval, driving
//!   the heartbeat sweep and the unused-session/unused-program eviction
//!   sweep ([`ServerDriver::process_event`]'s `handle_tick`);
//! - a per-daemon-stream reader that takes ownership of a
//!   [`DaemonTransfer`]'s read half once `listener` hands it off, and keeps
//!   decoding frames from it (heartbeat acks, in practice) for as long as the
//!   stream stays open.
//!
//! Both route through [`listener::apply_actions`]/[`listener::run_lifecycle_event`]
//! so the two loops share one encode/dispatch path with the accept loop.

use std::{sync::Arc, time::Duration};

use booster_core::env::Environment;
use tokio::{
    io::AsyncReadExt,
    sync::{mpsc, Mutex},
};

use booster_proto::MessageReader;

use crate::{
    compiler::{CompilationInputSource, CompilerDriver},
    data_manager::ServerDataManager,
    driver::{ServerDriver, ServerEvent},
    listener::{self, ConnectionOutcome, DaemonTransfer, SharedState},
};

/// How often the ticker fires (SPEC_FULL.md §4.6 control loop wake).
///
/// Chosen well below `ServerConfig::max_heartbeat_misses *` any reasonable
/// heartbeat interval so a daemon stream's miss counter advances in fine
/// enough steps to actually bound eviction latency.
pub const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Runs the control loop until `daemon_rx`'s sender side (owned by the
/// listener) is dropped, i.e. for the lifetime of the process.
///
/// Spawns the ticker as its own task and then drives the daemon-transfer
/// intake loop on the calling task, spawning one reader per transferred
/// stream.
#[allow(clippy::too_many_arguments)]
pub async fn run<E>(
    driver: Arc<Mutex<ServerDriver<E>>>,
    data: Arc<ServerDataManager<E>>,
    env: E,
    shared: Arc<SharedState>,
    mut daemon_rx: mpsc::UnboundedReceiver<DaemonTransfer>,
    daemon_tx: mpsc::UnboundedSender<DaemonTransfer>,
    compiler: Arc<dyn CompilerDriver>,
    input_source: Arc<dyn CompilationInputSource>,
) where
    E: Environment,
{
    {
        let driver = Arc::clone(&driver);
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            // The first tick fires immediately; skip it so a freshly started
            // server doesn't evict anything before any session exists.
            interval.tick().await;
            loop {
                interval.tick().await;
                let _ = listener::run_lifecycle_event(&driver, &shared, ServerEvent::Tick).await;
            }
        });
    }

    while let Some(transfer) = daemon_rx.recv().await {
        let driver = Arc::clone(&driver);
        let data = Arc::clone(&data);
        let env = env.clone();
        let shared = Arc::clone(&shared);
        let daemon_tx = daemon_tx.clone();
        let compiler = Arc::clone(&compiler);
        let input_source = Arc::clone(&input_source);

        tokio::spawn(async move {
            run_daemon_stream(transfer, driver, data, env, shared, daemon_tx, compiler, input_source).await;
        });
    }
}

/// Reads frames from one transferred daemon stream until it closes,
/// dispatching each through the same driver the accept loop uses.
#[allow(clippy::too_many_arguments)]
async fn run_daemon_stream<E>(
    transfer: DaemonTransfer,
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
    let DaemonTransfer { stream_id, session_id: _, mut read_half, mut kill_rx } = transfer;
    let mut reader = MessageReader::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = tokio::select! {
            read = tokio::time::timeout(listener::DEFAULT_SOCKET_TIMEOUT, read_half.read(&mut buf)) => match read {
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
                    tracing::warn!(%stream_id, error = %err, "malformed frame on daemon stream, closing");
                    let _ = listener::run_lifecycle_event(&driver, &shared, ServerEvent::StreamClosed { stream_id })
                        .await;
                    shared.deregister(stream_id);
                    return;
                },
            };

            let actions = {
                let mut guard = driver.lock().await;
                match guard.process_event(ServerEvent::MessageReceived { stream_id, message }) {
                    Ok(actions) => actions,
                    Err(err) => {
                        tracing::error!(%stream_id, error = %err, "driver error on daemon stream, closing");
                        shared.deregister(stream_id);
                        return;
                    },
                }
            };

            match listener::apply_actions(
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
                // A daemon stream has already been transferred once; a
                // second `TransferToControlLoop` would just hand the read
                // half to an already-running reader for the same stream id,
                // so treat it the same as a close.
                ConnectionOutcome::Closed | ConnectionOutcome::Transferred => {
                    shared.deregister(stream_id);
                    return;
                },
            }
        }
    }

    let _ = listener::run_lifecycle_event(&driver, &shared, ServerEvent::StreamClosed { stream_id }).await;
    shared.deregister(stream_id);
}
