//! Sans-IO server protocol logic: the `ServerDriver` state machine.
//!
//! This module owns no sockets. It consumes [`ServerEvent`]s (a message
//! arrived, a stream opened/closed, a background task completed, a control
//! loop tick) and returns
//! [`ServerAction`]s (send this, close that, run this blocking task) for the
//! async executor to carry out. Every `handle_*` method is synchronous and
//! infallible beyond `Result<_, ServerError>` — no `.await` appears anywhere
//! in this file.

use std::collections::HashMap;

use booster_core::{
    env::Environment, identity::ProgramIdentity, program_data::ArtifactKind,
    session_data::SessionData, ConnectionError, HeartbeatPayload, SessionHandshakeReply,
    SessionHandshakeRequest, StreamHandshakeReply, StreamHandshakeRequest,
    UnsupportedClientPayload,
};
use booster_proto::{Message, MessageType};
use std::sync::Arc;

use crate::{
    data_manager::ServerDataManager,
    handlers::{self, FileReceiveStep, IncrementalFileReceiver},
    server_error::ServerError,
};

/// Policy the session handshake checks a client's [`ProgramIdentity`]
/// against (SPEC_FULL.md §4.2: "cpu-arch, runtime-version, runtime build-info,
/// and `UseG1GC=true` must agree").
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Wire-compatibility magic this server build expects from clients.
    pub magic: u32,
    /// Expected `ProgramIdentity::cpu_arch`.
    pub expected_cpu_arch: booster_core::identity::CpuArch,
    /// Expected `ProgramIdentity::runtime_version`.
    pub expected_runtime_version: u64,
    /// Expected `ProgramIdentity::runtime_build_info`.
    pub expected_runtime_build_info: String,
    /// Session eviction timeout in seconds (`session_no_ref_timeout`).
    pub session_no_ref_timeout_secs: u64,
    /// Program eviction timeout in seconds (`unused_shared_data_timeout`).
    pub unused_shared_data_timeout_secs: u64,
    /// Consecutive heartbeat misses tolerated before a daemon stream is
    /// torn down (SPEC_FULL.md §4.6: "After 4 consecutive failures").
    pub max_heartbeat_misses: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            magic: 0xB005_7AC0,
            expected_cpu_arch: booster_core::identity::CpuArch::Aarch64,
            expected_runtime_version: 17_000_700,
            expected_runtime_build_info: "bishengjdk-17+7".to_string(),
            session_no_ref_timeout_secs: 300,
            unused_shared_data_timeout_secs: 600,
            max_heartbeat_misses: 4,
        }
    }
}

impl ServerConfig {
    /// Checks a client's program identity against this server's policy
    /// (SPEC_FULL.md §4.2). Returns the rejection reason on mismatch.
    fn check_policy(&self, identity: &ProgramIdentity) -> Result<(), String> {
        if identity.cpu_arch != self.expected_cpu_arch {
            return Err(format!(
                "cpu-arch mismatch: client {:?} != server {:?}",
                identity.cpu_arch, self.expected_cpu_arch
            ));
        }
        if identity.runtime_version != self.expected_runtime_version {
            return Err(format!(
                "runtime-version mismatch: client {} != server {}",
                identity.runtime_version, self.expected_runtime_version
            ));
        }
        if identity.runtime_build_info != self.expected_runtime_build_info {
            return Err(format!(
                "runtime-build-info mismatch: client {} != server {}",
                identity.runtime_build_info, self.expected_runtime_build_info
            ));
        }
        let use_g1gc = identity
            .runtime_flags
            .as_slice()
            .iter()
            .any(|(name, value)| name == "UseG1GC" && value == "true");
        if !use_g1gc {
            return Err("UseG1GC=true is required".to_string());
        }
        Ok(())
    }
}

/// Severity of a [`ServerAction::Log`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Low-signal, high-volume detail.
    Debug,
    /// Routine lifecycle events.
    Info,
    /// Recoverable anomalies (stale reconnect, tampered artifact).
    Warn,
    /// Stream- or session-fatal conditions.
    Error,
}

/// Outcome of an out-of-band `RunLazyAot` action, fed back as
/// [`ServerEvent::LazyAotCompleted`] once `booster-server`'s executor has run
/// it on a blocking thread (SPEC_FULL.md §4.7 "Lazy-AOT task").
#[derive(Debug, Clone)]
pub enum LazyAotResult {
    /// The artifact was compiled and published.
    Published,
    /// Compilation produced nothing (e.g. no hot methods); generation was
    /// aborted.
    Skipped,
    /// Compilation or publishing failed; generation was aborted.
    Failed(String),
}

/// Inputs the driver reacts to. `stream_id` identifies the
/// [`booster_core::connection::CommunicationStream`] the event concerns.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A fresh TCP connection was accepted and assigned `stream_id`.
    StreamOpened {
        /// The newly assigned stream id.
        stream_id: u32,
    },
    /// A complete [`Message`] was decoded off `stream_id`.
    MessageReceived {
        /// The stream the message arrived on.
        stream_id: u32,
        /// The decoded message.
        message: Message,
    },
    /// The underlying connection for `stream_id` closed (cleanly or not).
    StreamClosed {
        /// The stream that closed.
        stream_id: u32,
    },
    /// The executor finished a previously issued `RunLazyAot` action.
    LazyAotCompleted {
        /// The stream that requested the compilation.
        stream_id: u32,
        /// What happened.
        outcome: LazyAotResult,
    },
    /// The control loop's periodic wake (SPEC_FULL.md §4.6: "wakes every
    /// `heartbeat_interval / 4`"). Drives the daemon-stream heartbeat sweep
    /// and the unused-session/unused-program eviction sweep; carries no
    /// payload since both read their inputs from driver-owned state.
    Tick,
}

/// Side effects the driver asks the executor to perform. None of these are
/// executed by the driver itself.
#[derive(Debug, Clone)]
pub enum ServerAction {
    /// Write `message` to `stream_id`.
    Send {
        /// Target stream.
        stream_id: u32,
        /// Message to send.
        message: Message,
    },
    /// Close `stream_id` and drop its server-side state.
    CloseStream {
        /// The stream to close.
        stream_id: u32,
    },
    /// Hand `stream_id` off to the control loop for heartbeat lifetime
    /// (SPEC_FULL.md §4.5, §4.6). The executor must move the owning
    /// `TcpStream` half through its daemon channel and must not let the
    /// worker task touch the stream again.
    TransferToControlLoop {
        /// The stream being transferred.
        stream_id: u32,
        /// The session it belongs to.
        session_id: u32,
    },
    /// Run the lazy-AOT compiler pipeline out-of-band (on a blocking
    /// thread) and report back via [`ServerEvent::LazyAotCompleted`].
    RunLazyAot {
        /// The stream that requested this compilation.
        stream_id: u32,
        /// The session compiling on behalf of.
        session_id: u32,
        /// The owning program's id.
        program_id: u32,
        /// Whether profile-guided optimization is enabled.
        pgo: bool,
    },
    /// A log line at the given severity.
    Log {
        /// Severity.
        level: LogLevel,
        /// Message text.
        message: String,
    },
}

/// Which in-flight, multi-message task (if any) a stream is currently
/// running. `ServerDriver::process_event` keeps exactly one of these per
/// active stream so a `CacheFilesSyncTask`'s `FileSegment` replies can be
/// routed back to the right accumulator.
enum PendingTask {
    /// No multi-message task in flight on this stream.
    None,
    /// Pulling client-sourced artifacts one slot at a time
    /// (SPEC_FULL.md §4.7 "Cache-files-sync task").
    CacheSync {
        /// Slots still to request, in order.
        queue: Vec<ArtifactKind>,
        /// The slot currently being received, if any.
        current: Option<ArtifactKind>,
        /// Accumulates `FileSegment` records for `current`.
        receiver: IncrementalFileReceiver,
    },
}

/// Per-stream bookkeeping the driver needs beyond
/// [`booster_core::connection::CommunicationStream`]'s own state.
struct StreamContext {
    session_id: Option<u32>,
    task: PendingTask,
    /// Set once `ClientDaemonTask` hands this stream to the control loop
    /// (SPEC_FULL.md §4.6). Only daemon streams are heartbeat-polled on
    /// `ServerEvent::Tick`.
    is_daemon: bool,
    /// Heartbeats sent since the last ack, reset to 0 whenever an echoed
    /// `Heartbeat` arrives on a daemon stream.
    heartbeat_misses: u32,
}

/// Result of advancing a stream's in-flight [`PendingTask::CacheSync`] by one
/// `FileSegment`, computed while `self.streams` is still mutably borrowed.
/// Kept as plain data (no [`ServerAction`]) so the borrow ends before
/// `handle_file_segment` calls back into `self` to build actions.
enum FileSegmentOutcome {
    /// The segment didn't belong to any in-flight task; just log it.
    Warn(String),
    /// The segment advanced (or completed) the in-flight task.
    Advanced(Option<String>),
}

impl StreamContext {
    fn fresh() -> Self {
        Self { session_id: None, task: PendingTask::None, is_daemon: false, heartbeat_misses: 0 }
    }
}

/// The server's Sans-IO protocol state machine.
///
/// Generic over [`Environment`] only: this crate's persistence is the
/// filesystem-backed [`booster_core::cache_state::CacheSlot`], not a
/// pluggable storage backend.
pub struct ServerDriver<E: Environment> {
    data: Arc<ServerDataManager<E>>,
    streams: HashMap<u32, StreamContext>,
    config: ServerConfig,
    env: E,
}

impl<E: Environment> ServerDriver<E> {
    /// Creates a driver over a shared data manager.
    #[must_use]
    pub fn new(data: Arc<ServerDataManager<E>>, config: ServerConfig, env: E) -> Self {
        Self { data, streams: HashMap::new(), config, env }
    }

    /// Processes one event, returning the actions the executor must perform.
    ///
    /// # Errors
    ///
    /// Returns a [`ServerError`] only for internal bugs (an event referencing
    /// a stream the driver never opened, or a task whose in-memory state
    /// went missing); protocol-level problems are reported as actions
    /// (`CloseStream`, `Log`), not errors, matching SPEC_FULL.md §7's
    /// "stream-level fatal: close, log, continue serving others".
    pub fn process_event(&mut self, event: ServerEvent) -> Result<Vec<ServerAction>, ServerError> {
        match event {
            ServerEvent::StreamOpened { stream_id } => {
                self.streams.insert(stream_id, StreamContext::fresh());
                Ok(vec![self.log(LogLevel::Debug, format!("stream {stream_id} opened"))])
            },
            ServerEvent::MessageReceived { stream_id, message } => {
                self.handle_message(stream_id, message)
            },
            ServerEvent::StreamClosed { stream_id } => self.handle_stream_closed(stream_id),
            ServerEvent::LazyAotCompleted { stream_id, outcome } => {
                self.handle_lazy_aot_completed(stream_id, outcome)
            },
            ServerEvent::Tick => self.handle_tick(),
        }
    }

    /// Heartbeat-sweeps every daemon stream and evicts unreferenced
    /// sessions/programs past their timeout (SPEC_FULL.md §4.6). Streams
    /// that have missed `max_heartbeat_misses` consecutive heartbeats are
    /// closed and their session ref dropped, same as a clean
    /// `ServerEvent::StreamClosed`.
    fn handle_tick(&mut self) -> Result<Vec<ServerAction>, ServerError> {
        // Built directly as `ServerAction`s (not via `self.send`/`self.log`)
        // while `self.streams` is mutably borrowed by the loop below — those
        // helpers borrow all of `self`, which would conflict.
        let mut actions = Vec::new();
        let mut timed_out = Vec::new();
        let magic = self.config.magic;
        let max_misses = self.config.max_heartbeat_misses;
        for (stream_id, ctx) in &mut self.streams {
            if !ctx.is_daemon {
                continue;
            }
            ctx.heartbeat_misses += 1;
            if ctx.heartbeat_misses >= max_misses {
                timed_out.push(*stream_id);
            } else {
                let payload = HeartbeatPayload { magic };
                actions.push(ServerAction::Send {
                    stream_id: *stream_id,
                    message: Message::new(MessageType::Heartbeat, payload.encode_to_vec()),
                });
            }
        }

        for stream_id in timed_out {
            actions.push(self.log(
                LogLevel::Warn,
                format!(
                    "stream {stream_id}: daemon exceeded {} consecutive heartbeat misses, evicting",
                    self.config.max_heartbeat_misses
                ),
            ));
            actions.push(ServerAction::CloseStream { stream_id });
            actions.extend(self.handle_stream_closed(stream_id)?);
        }

        let evicted_sessions = self.data.evict_unused_sessions(self.config.session_no_ref_timeout_secs);
        if evicted_sessions > 0 {
            actions.push(self.log(LogLevel::Info, format!("evicted {evicted_sessions} unused session(s)")));
        }
        let evicted_programs =
            self.data.evict_unused_programs(self.config.unused_shared_data_timeout_secs);
        if evicted_programs > 0 {
            actions.push(self.log(LogLevel::Info, format!("evicted {evicted_programs} unused program(s)")));
        }

        Ok(actions)
    }

    fn handle_message(
        &mut self,
        stream_id: u32,
        message: Message,
    ) -> Result<Vec<ServerAction>, ServerError> {
        match message.msg_type {
            MessageType::ClientSessionMeta => self.handle_session_meta(stream_id, &message),
            MessageType::ClientStreamMeta => self.handle_stream_meta(stream_id, &message),
            MessageType::NoMoreRequests => Ok(self.close_stream_clean(stream_id)),
            MessageType::ClientDaemonTask => self.handle_daemon_task(stream_id),
            MessageType::CacheFilesSyncTask => self.handle_cache_sync_task(stream_id),
            MessageType::FileSegment => self.handle_file_segment(stream_id, &message),
            MessageType::LazyAotCompilationTask => self.handle_lazy_aot_task(stream_id, &message),
            MessageType::GetClassLoaderResourceCache => {
                self.handle_get_cache(stream_id, ArtifactKind::Clr)
            },
            MessageType::GetAggressiveCdsCache => {
                self.handle_get_cache(stream_id, ArtifactKind::AggressiveCds)
            },
            MessageType::GetLazyAotCache => self.handle_get_lazy_aot_cache(stream_id),
            MessageType::Heartbeat => self.handle_heartbeat(stream_id, &message),
            MessageType::EndOfCurrentPhase => {
                Ok(vec![self.log(LogLevel::Debug, format!("stream {stream_id}: end of phase"))])
            },
            other => self.fail_stream(
                stream_id,
                ConnectionError::UnexpectedFrame {
                    state: booster_core::StreamState::Active,
                    msg_type: other.to_u16(),
                },
            ),
        }
    }

    fn handle_session_meta(
        &mut self,
        stream_id: u32,
        message: &Message,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let request = SessionHandshakeRequest::decode(&message.body)?;

        if request.magic != self.config.magic {
            return Ok(self.reject_client(
                stream_id,
                format!(
                    "incompatible rpc: client magic {:#010x} != server magic {:#010x}",
                    request.magic, self.config.magic
                ),
            ));
        }

        if let Err(reason) = self.config.check_policy(&request.program_identity) {
            return Ok(self.reject_client(stream_id, reason));
        }

        let program = self.data.get_or_create_program(request.program_identity);
        let has_remote_clr = program.slot(ArtifactKind::Clr).is_cached();
        let has_remote_cds = program.slot(ArtifactKind::AggressiveCds).is_cached();
        let has_remote_aot = program.slot(ArtifactKind::AotStatic).is_cached()
            || program.slot(ArtifactKind::AotPgo).is_cached();
        let program_id = program.program_id();

        let server_random_id = self.env.random_u64();
        let session = self.data.create_session(request.client_random_id, server_random_id, program);
        let session_id = session.session_id();

        let ctx = self.streams.entry(stream_id).or_insert_with(StreamContext::fresh);
        ctx.session_id = Some(session_id);

        let reply = SessionHandshakeReply {
            stream_id,
            server_random_id,
            session_id,
            program_id,
            has_remote_clr,
            has_remote_cds,
            has_remote_aot,
        };
        Ok(vec![self.send(stream_id, MessageType::ClientSessionMeta, reply.encode_to_vec())])
    }

    fn handle_stream_meta(
        &mut self,
        stream_id: u32,
        message: &Message,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let request = StreamHandshakeRequest::decode(&message.body)?;

        let Some(session) = self.data.get_session(request.session_id) else {
            return Ok(vec![self.send(
                stream_id,
                MessageType::ClientSessionMetaAgain,
                Vec::new(),
            )]);
        };

        if !session.matches_stream_meta(request.client_random_id, request.server_random_id) {
            session.ref_count().dec(self.env.wall_clock_secs());
            return Ok(vec![self.send(
                stream_id,
                MessageType::ClientSessionMetaAgain,
                Vec::new(),
            )]);
        }

        let ctx = self.streams.entry(stream_id).or_insert_with(StreamContext::fresh);
        ctx.session_id = Some(session.session_id());

        let reply = StreamHandshakeReply { stream_id };
        Ok(vec![self.send(stream_id, MessageType::ClientStreamMeta, reply.encode_to_vec())])
    }

    fn handle_daemon_task(&mut self, stream_id: u32) -> Result<Vec<ServerAction>, ServerError> {
        let Some(session_id) = self.session_id_for(stream_id) else {
            return Ok(self.fail_stream(
                stream_id,
                ConnectionError::InvalidState {
                    state: booster_core::StreamState::Init,
                    operation: "ClientDaemonTask before handshake".to_string(),
                },
            )?);
        };
        if let Some(ctx) = self.streams.get_mut(&stream_id) {
            ctx.is_daemon = true;
            ctx.heartbeat_misses = 0;
        }
        Ok(vec![
            self.log(LogLevel::Info, format!("stream {stream_id}: transferred to control loop")),
            ServerAction::TransferToControlLoop { stream_id, session_id },
        ])
    }

    fn handle_cache_sync_task(&mut self, stream_id: u32) -> Result<Vec<ServerAction>, ServerError> {
        let Some(session) = self.session_for_stream(stream_id) else {
            return self.fail_stream(
                stream_id,
                ConnectionError::InvalidState {
                    state: booster_core::StreamState::Init,
                    operation: "CacheFilesSyncTask before handshake".to_string(),
                },
            );
        };

        let program = session.program_data();
        let queue: Vec<ArtifactKind> = handlers::CLIENT_SOURCED_KINDS
            .into_iter()
            .filter(|kind| {
                matches!(
                    handlers::try_start_cache_sync(program.slot(*kind)),
                    Ok(true)
                )
            })
            .collect();

        let mut actions = Vec::new();
        let mut ctx_task = PendingTask::CacheSync { queue, current: None, receiver: IncrementalFileReceiver::new() };
        self.advance_cache_sync(stream_id, &mut ctx_task, &mut actions)?;
        if let Some(ctx) = self.streams.get_mut(&stream_id) {
            ctx.task = ctx_task;
        }
        Ok(actions)
    }

    /// Requests the next queued slot, or does nothing if the queue is empty
    /// (the task naturally ends once every eligible slot has been pulled).
    fn advance_cache_sync(
        &self,
        stream_id: u32,
        task: &mut PendingTask,
        actions: &mut Vec<ServerAction>,
    ) -> Result<(), ServerError> {
        let PendingTask::CacheSync { queue, current, receiver } = task else {
            return Ok(());
        };
        if current.is_some() {
            return Ok(());
        }
        let Some(kind) = queue.pop() else {
            return Ok(());
        };
        *current = Some(kind);
        *receiver = IncrementalFileReceiver::new();
        let request_type = match kind {
            ArtifactKind::Clr => MessageType::CacheClassLoaderResource,
            ArtifactKind::AggressiveCds => MessageType::CacheAggressiveCds,
            _ => {
                return Err(ServerError::Internal(format!(
                    "cache sync requested for non-client-sourced slot {kind:?}"
                )))
            },
        };
        actions.push(ServerAction::Send {
            stream_id,
            message: Message::new(request_type, Vec::new()),
        });
        Ok(())
    }

    fn handle_file_segment(
        &mut self,
        stream_id: u32,
        message: &Message,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let Some(session) = self.session_for_stream(stream_id) else {
            return self.fail_stream(
                stream_id,
                ConnectionError::InvalidState {
                    state: booster_core::StreamState::Init,
                    operation: "FileSegment before handshake".to_string(),
                },
            );
        };
        let program = Arc::clone(session.program_data());

        // Advance the in-flight slot transfer, collecting plain strings (not
        // `ServerAction`s) while `ctx` holds its mutable borrow of
        // `self.streams`, then build actions only after the block ends —
        // `self.log`/`self.advance_cache_sync` must never run while that
        // borrow is alive.
        let Some(ctx) = self.streams.get_mut(&stream_id) else {
            return Err(ServerError::Internal(format!("no stream context for {stream_id}")));
        };
        let outcome: FileSegmentOutcome = match &mut ctx.task {
            PendingTask::None => FileSegmentOutcome::Warn(format!(
                "stream {stream_id}: unexpected FileSegment, no task in flight"
            )),
            PendingTask::CacheSync { current, receiver } => {
                if let Some(kind) = *current {
                    let step = receiver.push(&message.body)?;
                    match step {
                        FileReceiveStep::Continue => FileSegmentOutcome::Advanced(None),
                        FileReceiveStep::NoSuchFile => {
                            let _ = program.slot(kind).abort_generation();
                            *current = None;
                            FileSegmentOutcome::Advanced(Some(format!(
                                "stream {stream_id}: client had no {kind:?} artifact"
                            )))
                        },
                        FileReceiveStep::Complete => {
                            let bytes = std::mem::take(receiver).into_bytes();
                            program.slot(kind).publish(|path| std::fs::write(path, &bytes))?;
                            *current = None;
                            FileSegmentOutcome::Advanced(Some(format!(
                                "stream {stream_id}: published {kind:?} artifact"
                            )))
                        },
                    }
                } else {
                    FileSegmentOutcome::Warn(format!(
                        "stream {stream_id}: FileSegment with no slot selected"
                    ))
                }
            },
        };

        let mut actions = Vec::new();
        let log_line = match outcome {
            FileSegmentOutcome::Warn(line) => {
                actions.push(self.log(LogLevel::Warn, line));
                return Ok(actions);
            },
            FileSegmentOutcome::Advanced(line) => line,
        };
        if let Some(line) = log_line {
            actions.push(self.log(LogLevel::Info, line));
        }

        let slot_still_pending = matches!(
            self.streams.get(&stream_id).map(|ctx| &ctx.task),
            Some(PendingTask::CacheSync { current: Some(_), .. })
        );
        if !slot_still_pending {
            let mut task = std::mem::replace(&mut self.streams.get_mut(&stream_id).unwrap().task, PendingTask::None);
            self.advance_cache_sync(stream_id, &mut task, &mut actions)?;
            self.streams.get_mut(&stream_id).unwrap().task = task;
        }
        Ok(actions)
    }

    fn handle_lazy_aot_task(
        &mut self,
        stream_id: u32,
        _message: &Message,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let Some(session) = self.session_for_stream(stream_id) else {
            return self.fail_stream(
                stream_id,
                ConnectionError::InvalidState {
                    state: booster_core::StreamState::Init,
                    operation: "LazyAotCompilationTask before handshake".to_string(),
                },
            );
        };
        let program = session.program_data();
        let pgo = program.identity().boost_flags.pgo;
        let slot_kind = if pgo { ArtifactKind::AotPgo } else { ArtifactKind::AotStatic };
        let slot = program.slot(slot_kind);

        if !slot.is_allowed() || slot.is_cached() || slot.try_begin_generation().is_err() {
            return Ok(vec![self.log(
                LogLevel::Debug,
                format!("stream {stream_id}: lazy-AOT skipped (already cached or in progress)"),
            )]);
        }

        Ok(vec![ServerAction::RunLazyAot {
            stream_id,
            session_id: session.session_id(),
            program_id: program.program_id(),
            pgo,
        }])
    }

    fn handle_lazy_aot_completed(
        &mut self,
        stream_id: u32,
        outcome: LazyAotResult,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let message = match &outcome {
            LazyAotResult::Published => {
                format!("stream {stream_id}: lazy-AOT compilation published")
            },
            LazyAotResult::Skipped => {
                format!("stream {stream_id}: lazy-AOT compilation skipped")
            },
            LazyAotResult::Failed(reason) => {
                format!("stream {stream_id}: lazy-AOT compilation failed: {reason}")
            },
        };
        let level = match outcome {
            LazyAotResult::Published | LazyAotResult::Skipped => LogLevel::Info,
            LazyAotResult::Failed(_) => LogLevel::Warn,
        };
        Ok(vec![self.log(level, message)])
    }

    fn handle_get_cache(
        &mut self,
        stream_id: u32,
        kind: ArtifactKind,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let Some(session) = self.session_for_stream(stream_id) else {
            return self.fail_stream(
                stream_id,
                ConnectionError::InvalidState {
                    state: booster_core::StreamState::Init,
                    operation: "Get*Cache before handshake".to_string(),
                },
            );
        };
        let records = handlers::serve_cache_file(session.program_data().slot(kind))?;
        Ok(records
            .into_iter()
            .map(|body| ServerAction::Send { stream_id, message: Message::new(MessageType::FileSegment, body) })
            .collect())
    }

    fn handle_get_lazy_aot_cache(
        &mut self,
        stream_id: u32,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let Some(session) = self.session_for_stream(stream_id) else {
            return self.fail_stream(
                stream_id,
                ConnectionError::InvalidState {
                    state: booster_core::StreamState::Init,
                    operation: "GetLazyAotCache before handshake".to_string(),
                },
            );
        };
        let program = session.program_data();
        let kind =
            if program.identity().boost_flags.pgo { ArtifactKind::AotPgo } else { ArtifactKind::AotStatic };
        let records = handlers::serve_cache_file(program.slot(kind))?;
        Ok(records
            .into_iter()
            .map(|body| ServerAction::Send { stream_id, message: Message::new(MessageType::FileSegment, body) })
            .collect())
    }

    /// On a daemon stream this is the client's echo of a driver-initiated
    /// `Tick` heartbeat: it resets the miss counter and needs no reply. On
    /// any other stream it is treated as a simple ping and echoed back.
    fn handle_heartbeat(
        &mut self,
        stream_id: u32,
        message: &Message,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let payload = HeartbeatPayload::decode(&message.body)?;
        if let Some(ctx) = self.streams.get_mut(&stream_id) {
            if ctx.is_daemon {
                ctx.heartbeat_misses = 0;
                return Ok(Vec::new());
            }
        }
        Ok(vec![self.send(stream_id, MessageType::Heartbeat, payload.encode_to_vec())])
    }

    fn handle_stream_closed(&mut self, stream_id: u32) -> Result<Vec<ServerAction>, ServerError> {
        let Some(ctx) = self.streams.remove(&stream_id) else {
            return Ok(Vec::new());
        };
        let mut actions = vec![self.log(LogLevel::Debug, format!("stream {stream_id} closed"))];
        if let Some(session_id) = ctx.session_id {
            if self.data.try_remove_session(session_id) {
                actions.push(self.log(
                    LogLevel::Debug,
                    format!("session {session_id}: removed (unreferenced at stream close)"),
                ));
            }
        }
        Ok(actions)
    }

    /// Looks up the session owning `stream_id` for the duration of this
    /// call only.
    ///
    /// `ServerDataManager::get_session` increments the ref-count so a
    /// concurrent eviction sweep can't tear the entry down mid-lookup
    /// (SPEC_FULL.md §4.3); since the returned `Arc` keeps the value alive
    /// regardless, and no other code runs between the increment and this
    /// function returning (this whole call is synchronous, sans-IO), it is
    /// immediately released again rather than held for the RAII-guard
    /// lifetime a long-lived reference would need.
    fn session_for_stream(&self, stream_id: u32) -> Option<Arc<SessionData>> {
        let session_id = self.streams.get(&stream_id)?.session_id?;
        let session = self.data.get_session(session_id)?;
        session.ref_count().dec(self.env.wall_clock_secs());
        Some(session)
    }

    fn session_id_for(&self, stream_id: u32) -> Option<u32> {
        self.streams.get(&stream_id)?.session_id
    }

    fn reject_client(&mut self, stream_id: u32, reason: String) -> Vec<ServerAction> {
        let payload = UnsupportedClientPayload { reason: reason.clone() };
        vec![
            self.log(LogLevel::Warn, format!("stream {stream_id}: rejected client: {reason}")),
            self.send(stream_id, MessageType::UnsupportedClient, payload.encode_to_vec()),
            ServerAction::CloseStream { stream_id },
        ]
    }

    fn fail_stream(
        &mut self,
        stream_id: u32,
        err: ConnectionError,
    ) -> Result<Vec<ServerAction>, ServerError> {
        Ok(vec![
            self.log(LogLevel::Error, format!("stream {stream_id}: {err}")),
            ServerAction::CloseStream { stream_id },
        ])
    }

    fn close_stream_clean(&mut self, stream_id: u32) -> Vec<ServerAction> {
        vec![
            self.log(LogLevel::Debug, format!("stream {stream_id}: clean close (NoMoreRequests)")),
            ServerAction::CloseStream { stream_id },
        ]
    }

    fn send(&self, stream_id: u32, msg_type: MessageType, body: Vec<u8>) -> ServerAction {
        ServerAction::Send { stream_id, message: Message::new(msg_type, body) }
    }

    fn log(&self, level: LogLevel, message: String) -> ServerAction {
        ServerAction::Log { level, message }
    }
}

impl<E: Environment> std::fmt::Debug for ServerDriver<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDriver")
            .field("streams", &self.streams.len())
            .field("programs", &self.data.program_count())
            .field("sessions", &self.data.session_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use booster_core::identity::{BoostFlags, CpuArch, RuntimeFlagSnapshot};

    use super::*;

    #[derive(Clone)]
    struct TestEnv;

    impl Environment for TestEnv {
        type Instant = std::time::Instant;

        fn now(&self) -> Self::Instant {
            std::time::Instant::now()
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(0x42);
        }

        fn wall_clock_secs(&self) -> u64 {
            1_000
        }
    }

    fn identity(pgo: bool) -> ProgramIdentity {
        ProgramIdentity {
            cpu_arch: CpuArch::Aarch64,
            runtime_version: 17_000_700,
            runtime_build_info: "bishengjdk-17+7".to_string(),
            program_name: "HelloWorld".to_string(),
            program_entry: "HelloWorld".to_string(),
            is_jar: false,
            classpath_names_hash: 1,
            classpath_mtimes_hash: 2,
            agent_names_hash: 0,
            strict_command_line: None,
            boost_flags: BoostFlags { clr: true, cds: true, aot: true, pgo },
            runtime_flags: RuntimeFlagSnapshot::new([("UseG1GC".to_string(), "true".to_string())]),
        }
    }

    fn new_driver() -> (ServerDriver<TestEnv>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let data = Arc::new(ServerDataManager::new(dir.path().to_path_buf(), TestEnv));
        (ServerDriver::new(data, ServerConfig::default(), TestEnv), dir)
    }

    fn session_meta_message(pgo: bool) -> Message {
        let req = SessionHandshakeRequest {
            magic: ServerConfig::default().magic,
            client_random_id: 0xAAAA,
            program_identity: identity(pgo),
        };
        Message::new(MessageType::ClientSessionMeta, req.encode_to_vec())
    }

    #[test]
    fn session_handshake_succeeds_and_creates_program_and_session() {
        let (mut driver, _dir) = new_driver();
        driver.process_event(ServerEvent::StreamOpened { stream_id: 1 }).unwrap();
        let actions = driver
            .process_event(ServerEvent::MessageReceived { stream_id: 1, message: session_meta_message(false) })
            .unwrap();

        let ServerAction::Send { message, .. } = &actions[0] else { panic!("expected Send") };
        let reply = SessionHandshakeReply::decode(&message.body).unwrap();
        assert_eq!(reply.session_id, 0);
        assert!(!reply.has_remote_clr);
        assert_eq!(driver.data.program_count(), 1);
        assert_eq!(driver.data.session_count(), 1);
    }

    #[test]
    fn session_handshake_rejects_bad_magic() {
        let (mut driver, _dir) = new_driver();
        driver.process_event(ServerEvent::StreamOpened { stream_id: 1 }).unwrap();
        let mut message = session_meta_message(false);
        let mut req = SessionHandshakeRequest::decode(&message.body).unwrap();
        req.magic = 0xDEAD_BEEF;
        message = Message::new(MessageType::ClientSessionMeta, req.encode_to_vec());

        let actions =
            driver.process_event(ServerEvent::MessageReceived { stream_id: 1, message }).unwrap();
        assert!(matches!(actions[1], ServerAction::Send { .. }));
        let ServerAction::Send { message, .. } = &actions[1] else { panic!() };
        assert_eq!(message.msg_type, MessageType::UnsupportedClient);
        assert!(matches!(actions[2], ServerAction::CloseStream { .. }));
    }

    #[test]
    fn session_handshake_rejects_policy_mismatch() {
        let (mut driver, _dir) = new_driver();
        driver.process_event(ServerEvent::StreamOpened { stream_id: 1 }).unwrap();
        let mut req = SessionHandshakeRequest {
            magic: ServerConfig::default().magic,
            client_random_id: 1,
            program_identity: identity(false),
        };
        req.program_identity.cpu_arch = CpuArch::X86;
        let message = Message::new(MessageType::ClientSessionMeta, req.encode_to_vec());

        let actions =
            driver.process_event(ServerEvent::MessageReceived { stream_id: 1, message }).unwrap();
        let ServerAction::Send { message, .. } = &actions[1] else { panic!() };
        assert_eq!(message.msg_type, MessageType::UnsupportedClient);
    }

    #[test]
    fn stream_meta_for_unknown_session_requests_resync() {
        let (mut driver, _dir) = new_driver();
        driver.process_event(ServerEvent::StreamOpened { stream_id: 2 }).unwrap();
        let req = StreamHandshakeRequest { session_id: 999, client_random_id: 1, server_random_id: 2 };
        let message = Message::new(MessageType::ClientStreamMeta, req.encode_to_vec());

        let actions =
            driver.process_event(ServerEvent::MessageReceived { stream_id: 2, message }).unwrap();
        assert_eq!(actions.len(), 1);
        let ServerAction::Send { message, .. } = &actions[0] else { panic!() };
        assert_eq!(message.msg_type, MessageType::ClientSessionMetaAgain);
    }

    #[test]
    fn heartbeat_is_echoed() {
        let (mut driver, _dir) = new_driver();
        driver.process_event(ServerEvent::StreamOpened { stream_id: 1 }).unwrap();
        let payload = HeartbeatPayload { magic: 7 };
        let message = Message::new(MessageType::Heartbeat, payload.encode_to_vec());

        let actions =
            driver.process_event(ServerEvent::MessageReceived { stream_id: 1, message }).unwrap();
        let ServerAction::Send { message, .. } = &actions[0] else { panic!() };
        assert_eq!(HeartbeatPayload::decode(&message.body).unwrap(), payload);
    }

    #[test]
    fn unexpected_message_before_handshake_closes_stream() {
        let (mut driver, _dir) = new_driver();
        driver.process_event(ServerEvent::StreamOpened { stream_id: 1 }).unwrap();
        let message = Message::new(MessageType::CacheFilesSyncTask, Vec::new());

        let actions =
            driver.process_event(ServerEvent::MessageReceived { stream_id: 1, message }).unwrap();
        assert!(matches!(actions.last().unwrap(), ServerAction::Log { .. } | ServerAction::CloseStream { .. }));
    }

    #[test]
    fn daemon_task_transfers_ownership_after_handshake() {
        let (mut driver, _dir) = new_driver();
        driver.process_event(ServerEvent::StreamOpened { stream_id: 1 }).unwrap();
        driver
            .process_event(ServerEvent::MessageReceived { stream_id: 1, message: session_meta_message(false) })
            .unwrap();

        let actions = driver
            .process_event(ServerEvent::MessageReceived {
                stream_id: 1,
                message: Message::new(MessageType::ClientDaemonTask, Vec::new()),
            })
            .unwrap();
        assert!(actions.iter().any(|a| matches!(a, ServerAction::TransferToControlLoop { .. })));
    }

    #[test]
    fn lazy_aot_task_skipped_when_not_allowed() {
        let (mut driver, _dir) = new_driver();
        driver.process_event(ServerEvent::StreamOpened { stream_id: 1 }).unwrap();
        let mut req = SessionHandshakeRequest {
            magic: ServerConfig::default().magic,
            client_random_id: 1,
            program_identity: identity(false),
        };
        req.program_identity.boost_flags.aot = false;
        driver
            .process_event(ServerEvent::MessageReceived {
                stream_id: 1,
                message: Message::new(MessageType::ClientSessionMeta, req.encode_to_vec()),
            })
            .unwrap();

        let actions = driver
            .process_event(ServerEvent::MessageReceived {
                stream_id: 1,
                message: Message::new(MessageType::LazyAotCompilationTask, Vec::new()),
            })
            .unwrap();
        assert!(matches!(actions[0], ServerAction::Log { .. }));
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn lazy_aot_task_requests_run_when_allowed() {
        let (mut driver, _dir) = new_driver();
        driver.process_event(ServerEvent::StreamOpened { stream_id: 1 }).unwrap();
        driver
            .process_event(ServerEvent::MessageReceived { stream_id: 1, message: session_meta_message(false) })
            .unwrap();

        let actions = driver
            .process_event(ServerEvent::MessageReceived {
                stream_id: 1,
                message: Message::new(MessageType::LazyAotCompilationTask, Vec::new()),
            })
            .unwrap();
        assert!(matches!(actions[0], ServerAction::RunLazyAot { .. }));
    }

    #[test]
    fn cache_sync_task_requests_clr_and_cds_then_completes_on_null_records() {
        let (mut driver, _dir) = new_driver();
        driver.process_event(ServerEvent::StreamOpened { stream_id: 1 }).unwrap();
        driver
            .process_event(ServerEvent::MessageReceived { stream_id: 1, message: session_meta_message(false) })
            .unwrap();

        let actions = driver
            .process_event(ServerEvent::MessageReceived {
                stream_id: 1,
                message: Message::new(MessageType::CacheFilesSyncTask, Vec::new()),
            })
            .unwrap();
        assert_eq!(actions.len(), 1);
        let ServerAction::Send { message, .. } = &actions[0] else { panic!() };
        let first_request_type = message.msg_type;
        assert!(matches!(
            first_request_type,
            MessageType::CacheClassLoaderResource | MessageType::CacheAggressiveCds
        ));

        // Client reports "no such file" for the first slot: driver should
        // move on to the second slot.
        let null_record = handlers::null_file_record();
        let actions = driver
            .process_event(ServerEvent::MessageReceived {
                stream_id: 1,
                message: Message::new(MessageType::FileSegment, null_record),
            })
            .unwrap();
        let sends: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                ServerAction::Send { message, .. } => Some(message.msg_type),
                _ => None,
            })
            .collect();
        assert_eq!(sends.len(), 1);
        assert_ne!(sends[0], first_request_type);
    }

    #[test]
    fn stream_closed_removes_unreferenced_session() {
        let (mut driver, _dir) = new_driver();
        driver.process_event(ServerEvent::StreamOpened { stream_id: 1 }).unwrap();
        driver
            .process_event(ServerEvent::MessageReceived { stream_id: 1, message: session_meta_message(false) })
            .unwrap();
        assert_eq!(driver.data.session_count(), 1);

        driver.process_event(ServerEvent::StreamClosed { stream_id: 1 }).unwrap();
        assert_eq!(driver.data.session_count(), 0);
        assert_eq!(driver.data.program_count(), 0);
    }

    #[test]
    fn no_more_requests_closes_stream() {
        let (mut driver, _dir) = new_driver();
        driver.process_event(ServerEvent::StreamOpened { stream_id: 1 }).unwrap();
        let actions = driver
            .process_event(ServerEvent::MessageReceived {
                stream_id: 1,
                message: Message::new(MessageType::NoMoreRequests, Vec::new()),
            })
            .unwrap();
        assert!(matches!(actions.last().unwrap(), ServerAction::CloseStream { stream_id: 1 }));
    }

    #[test]
    fn tick_heartbeats_daemon_streams_only() {
        let (mut driver, _dir) = new_driver();
        driver.process_event(ServerEvent::StreamOpened { stream_id: 1 }).unwrap();
        driver
            .process_event(ServerEvent::MessageReceived { stream_id: 1, message: session_meta_message(false) })
            .unwrap();
        driver
            .process_event(ServerEvent::MessageReceived {
                stream_id: 1,
                message: Message::new(MessageType::ClientDaemonTask, Vec::new()),
            })
            .unwrap();

        let actions = driver.process_event(ServerEvent::Tick).unwrap();
        let sent: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                ServerAction::Send { stream_id, message } => Some((*stream_id, message.msg_type)),
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![(1, MessageType::Heartbeat)]);
    }

    #[test]
    fn tick_evicts_daemon_stream_after_max_consecutive_misses() {
        let (mut driver, _dir) = new_driver();
        driver.process_event(ServerEvent::StreamOpened { stream_id: 1 }).unwrap();
        driver
            .process_event(ServerEvent::MessageReceived { stream_id: 1, message: session_meta_message(false) })
            .unwrap();
        driver
            .process_event(ServerEvent::MessageReceived {
                stream_id: 1,
                message: Message::new(MessageType::ClientDaemonTask, Vec::new()),
            })
            .unwrap();

        let misses = ServerConfig::default().max_heartbeat_misses;
        let mut last_actions = Vec::new();
        for _ in 0..misses {
            last_actions = driver.process_event(ServerEvent::Tick).unwrap();
        }
        assert!(last_actions.iter().any(|a| matches!(a, ServerAction::CloseStream { stream_id: 1 })));
        assert_eq!(driver.data.session_count(), 0);
    }

    #[test]
    fn heartbeat_ack_on_daemon_stream_resets_misses_and_sends_nothing() {
        let (mut driver, _dir) = new_driver();
        driver.process_event(ServerEvent::StreamOpened { stream_id: 1 }).unwrap();
        driver
            .process_event(ServerEvent::MessageReceived { stream_id: 1, message: session_meta_message(false) })
            .unwrap();
        driver
            .process_event(ServerEvent::MessageReceived {
                stream_id: 1,
                message: Message::new(MessageType::ClientDaemonTask, Vec::new()),
            })
            .unwrap();
        driver.process_event(ServerEvent::Tick).unwrap();

        let payload = HeartbeatPayload { magic: ServerConfig::default().magic };
        let actions = driver
            .process_event(ServerEvent::MessageReceived {
                stream_id: 1,
                message: Message::new(MessageType::Heartbeat, payload.encode_to_vec()),
            })
            .unwrap();
        assert!(actions.is_empty());

        // Misses were reset, so it takes a full fresh run to evict again.
        let misses = ServerConfig::default().max_heartbeat_misses;
        let mut last_actions = Vec::new();
        for _ in 0..misses - 1 {
            last_actions = driver.process_event(ServerEvent::Tick).unwrap();
        }
        assert!(!last_actions.iter().any(|a| matches!(a, ServerAction::CloseStream { .. })));
    }

    #[test]
    fn tick_sweeps_unused_sessions_and_programs() {
        let (mut driver, _dir) = new_driver();
        driver.process_event(ServerEvent::StreamOpened { stream_id: 1 }).unwrap();
        driver
            .process_event(ServerEvent::MessageReceived { stream_id: 1, message: session_meta_message(false) })
            .unwrap();
        driver.process_event(ServerEvent::StreamClosed { stream_id: 1 }).unwrap();
        // `StreamClosed` already removed the now-unreferenced session; its
        // owning program is ref-counted to zero but not yet swept. With the
        // test clock's fixed `wall_clock_secs() == 1_000`, a zero timeout
        // makes it immediately eligible for the next `Tick`'s sweep.
        assert_eq!(driver.data.session_count(), 0);
        assert_eq!(driver.data.program_count(), 1);
        driver.config.session_no_ref_timeout_secs = 0;
        driver.config.unused_shared_data_timeout_secs = 0;

        let actions = driver.process_event(ServerEvent::Tick).unwrap();
        assert_eq!(driver.data.program_count(), 0);
        assert!(actions.iter().any(|a| matches!(a, ServerAction::Log { .. })));
    }

    #[test]
    fn lazy_aot_completed_produces_log_action() {
        let (mut driver, _dir) = new_driver();
        let actions = driver
            .process_event(ServerEvent::LazyAotCompleted {
                stream_id: 1,
                outcome: LazyAotResult::Published,
            })
            .unwrap();
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ServerAction::Log { level: LogLevel::Info, .. }));
    }
}
