//! Top-level orchestration facade (SPEC_FULL.md §4.8).
//!
//! Coroutine-like flow is absent here: a client process runs one session
//! handshake, opens one daemon stream, and makes a handful of short-lived
//! fetch/sync streams, so a linear async function plays the role
//! `booster-server::driver::ServerDriver`'s action-returning state machine
//! plays on the long-lived, many-connections-at-once server side.

use booster_core::{ArtifactKind, Environment, ProgramIdentity};

use crate::{
    boost::{artifact_action, ArtifactAction},
    config::ClientConfig,
    data_manager::ClientDataManager,
    error::ClientError,
    startup::StartupSignal,
    sync, transport,
    transport::MessageStream,
};

/// Runs this process's boost lifecycle: handshake, artifact fetch, and a
/// background daemon task, all against one session.
pub struct BoosterClient<E: Environment> {
    env: E,
    config: ClientConfig,
    session_id: u32,
    client_random_id: u64,
    server_random_id: u64,
    remote: RemoteAvailability,
}

#[derive(Debug, Clone, Copy)]
struct RemoteAvailability {
    clr: bool,
    cds: bool,
    aot: bool,
}

impl<E: Environment> BoosterClient<E> {
    /// Performs the session handshake and initializes [`ClientDataManager`].
    ///
    /// Returns `Ok(None)` rather than an error when the embedder should fall
    /// back to an unboosted run: `local_mode` is set, or the handshake
    /// failed and `crash_if_no_server` is false (SPEC_FULL.md §7 "escape").
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if the handshake fails and
    /// `crash_if_no_server` is true.
    pub async fn connect(
        env: E,
        config: ClientConfig,
        identity: ProgramIdentity,
    ) -> Result<Option<Self>, ClientError> {
        if !config.use_booster || config.local_mode {
            let _ = ClientDataManager::init(
                identity,
                config.cache_dir.clone(),
                config.boost_policy.resolve(),
                true,
            );
            return Ok(None);
        }

        let client_random_id = env.random_u64();
        let allowed = config.boost_policy.resolve();
        let attempt =
            transport::open_session(config.server_address, config.timeout, client_random_id, identity.clone())
                .await;

        let (stream, reply) = match attempt {
            Ok(pair) => pair,
            Err(err) => {
                let _ = ClientDataManager::init(identity, config.cache_dir.clone(), allowed, true);
                ClientDataManager::get().escape(err.to_string());
                if config.crash_if_no_server {
                    return Err(err);
                }
                tracing::warn!(error = %err, "booster handshake failed, running unboosted");
                return Ok(None);
            },
        };
        drop(stream);

        let _ = ClientDataManager::init(identity, config.cache_dir.clone(), allowed, false);

        Ok(Some(Self {
            env,
            config,
            session_id: reply.session_id,
            client_random_id,
            server_random_id: reply.server_random_id,
            remote: RemoteAvailability {
                clr: reply.has_remote_clr,
                cds: reply.has_remote_cds,
                aot: reply.has_remote_aot,
            },
        }))
    }

    /// Fetches every remotely cached artifact this run is allowed to use,
    /// writing each to its [`ClientDataManager::slot_path`].
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] on protocol or transport failure opening
    /// the fetch stream.
    pub async fn fetch_available_artifacts(&self) -> Result<(), ClientError> {
        let manager = ClientDataManager::get();
        let allowed = manager.allowed();

        for (kind, is_allowed, has_remote) in [
            (ArtifactKind::Clr, allowed.clr, self.remote.clr),
            (ArtifactKind::AggressiveCds, allowed.cds, self.remote.cds),
        ] {
            if artifact_action(is_allowed, has_remote) != ArtifactAction::Fetch {
                continue;
            }
            let mut stream = self.open_new_stream().await?;
            let target = manager.slot_path(kind);
            if sync::fetch_artifact(&mut stream, kind, &target).await? {
                manager.set_using(|using| mark_used(using, kind));
            }
        }

        if artifact_action(allowed.aot, self.remote.aot) == ArtifactAction::Fetch {
            let kind = if allowed.pgo { ArtifactKind::AotPgo } else { ArtifactKind::AotStatic };
            let mut stream = self.open_new_stream().await?;
            let target = manager.slot_path(kind);
            if sync::fetch_artifact(&mut stream, kind, &target).await? {
                manager.set_using(|using| using.aot = true);
            }
        }
        Ok(())
    }

    /// Opens the session's daemon stream and runs its heartbeat-echo loop
    /// until the connection closes.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] on protocol or transport failure.
    pub async fn run_daemon(&self) -> Result<(), ClientError> {
        let stream = self.open_new_stream().await?;
        crate::daemon::run(stream).await
    }

    /// The [`Environment`] this client was constructed with.
    #[must_use]
    pub fn environment(&self) -> &E {
        &self.env
    }

    /// Signals end-of-startup, unblocking anything waiting on the startup
    /// gate (SPEC_FULL.md §4.8).
    pub fn signal_startup_end(&self, reason: impl Into<String>) {
        ClientDataManager::get().startup_gate().fire(&StartupSignal(reason.into()));
    }

    /// Runs the `CacheFilesSyncTask` exchange at process shutdown, offering
    /// whichever client-sourced artifacts this run used and the server does
    /// not already have (SPEC_FULL.md §4.7, §4.8).
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] on protocol or transport failure.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let manager = ClientDataManager::get();
        let allowed = manager.allowed();
        let using = manager.using();

        let mut offered = Vec::new();
        if using.clr && artifact_action(allowed.clr, self.remote.clr) == ArtifactAction::Generate {
            offered.push((ArtifactKind::Clr, manager.slot_path(ArtifactKind::Clr)));
        }
        if using.cds && artifact_action(allowed.cds, self.remote.cds) == ArtifactAction::Generate {
            offered.push((ArtifactKind::AggressiveCds, manager.slot_path(ArtifactKind::AggressiveCds)));
        }
        if offered.is_empty() {
            return Ok(());
        }

        let mut stream = self.open_new_stream().await?;
        sync::run_cache_files_sync(&mut stream, offered).await
    }

    /// Opens a fresh stream against this session, rejecting a
    /// [`transport::StreamOpenOutcome::SessionStale`] outcome as an error —
    /// none of this crate's callers currently redo the session handshake
    /// mid-run (SPEC_FULL.md §8 scenario 3 is a fresh-process reconnect, not
    /// a live one).
    async fn open_new_stream(&self) -> Result<MessageStream, ClientError> {
        let outcome = transport::open_stream(
            self.config.server_address,
            self.config.timeout,
            self.session_id,
            self.client_random_id,
            self.server_random_id,
        )
        .await?;
        match outcome {
            transport::StreamOpenOutcome::Ready(stream, _) => Ok(stream),
            transport::StreamOpenOutcome::SessionStale(_) => {
                Err(ClientError::Connection(booster_core::ConnectionError::InvalidState {
                    state: booster_core::StreamState::Init,
                    operation: "stream opened against a stale session".to_string(),
                }))
            },
        }
    }
}

fn mark_used(using: &mut crate::data_manager::UsingFlags, kind: ArtifactKind) {
    match kind {
        ArtifactKind::Clr => using.clr = true,
        ArtifactKind::AggressiveCds => using.cds = true,
        ArtifactKind::AotStatic | ArtifactKind::AotPgo | ArtifactKind::DynamicCds => {},
    }
}
