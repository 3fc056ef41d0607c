//! `ServerDataManager`: concurrent lifecycle of `ProgramData` and
//! `SessionData` (SPEC_FULL.md §4.3).
//!
//! No teacher counterpart — `lockframe-server::registry::ConnectionRegistry`
//! is a plain `HashMap`-backed session/room registry with no ref-counted
//! shared-ownership lifecycle. This module reuses the same two-map shape
//! (session registry + secondary index) but backs it with `dashmap::DashMap`
//! so `try_remove`'s "under the map's internal lock" contract (§4.3) is a
//! property of the map itself, not a lock the caller has to remember to
//! take. `DashMap::entry`/`remove_if` make the spec's "loser of an insert
//! race deletes its candidate" race structurally impossible rather than
//! something callers must get right — recorded as a deliberate simplification
//! in DESIGN.md.

use std::{
    path::PathBuf,
    sync::atomic::{AtomicU32, Ordering},
};

use booster_core::{env::Environment, identity::ProgramIdentity, program_data::ProgramData, session_data::SessionData};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;

/// Owns the two concurrent maps `ServerDriver` consults on every message:
/// `programs` (keyed by identity) and `sessions` (keyed by server-assigned
/// id).
pub struct ServerDataManager<E: Environment> {
    programs: DashMap<ProgramIdentity, Arc<ProgramData>>,
    sessions: DashMap<u32, Arc<SessionData>>,
    next_program_id: AtomicU32,
    next_session_id: AtomicU32,
    cache_dir: PathBuf,
    env: E,
}

impl<E: Environment> ServerDataManager<E> {
    /// Creates an empty data manager rooted at `cache_dir`
    /// (`BoosterCachePath`, default `$HOME/.booster/server`).
    #[must_use]
    pub fn new(cache_dir: PathBuf, env: E) -> Self {
        Self {
            programs: DashMap::new(),
            sessions: DashMap::new(),
            next_program_id: AtomicU32::new(0),
            next_session_id: AtomicU32::new(0),
            cache_dir,
            env,
        }
    }

    /// Looks up a program by identity, incrementing its ref-count on
    /// success. Returns `None` if absent, or if the entry is mid-teardown
    /// (ref-count locked).
    #[must_use]
    pub fn get_program(&self, identity: &ProgramIdentity) -> Option<Arc<ProgramData>> {
        let entry = self.programs.get(identity)?;
        let data = Arc::clone(entry.value());
        drop(entry);
        data.ref_count().try_inc().then_some(data)
    }

    /// Installs a new `ProgramData` for `identity` if absent, or returns the
    /// existing one, with the ref-count incremented on the caller's behalf
    /// either way (SPEC_FULL.md §4.3 `get_or_create`).
    pub fn get_or_create_program(&self, identity: ProgramIdentity) -> Arc<ProgramData> {
        match self.programs.entry(identity.clone()) {
            Entry::Occupied(e) => {
                let data = Arc::clone(e.get());
                data.ref_count().try_inc();
                data
            },
            Entry::Vacant(e) => {
                let program_id = self.next_program_id.fetch_add(1, Ordering::Relaxed);
                let data = Arc::new(ProgramData::new(program_id, identity, &self.cache_dir));
                data.ref_count().try_inc();
                e.insert(Arc::clone(&data));
                data
            },
        }
    }

    /// Removes a program iff its ref-count is zero (SPEC_FULL.md §4.3
    /// `try_remove`). The entry's own `RefCount::try_lock_for_removal`
    /// combined with `DashMap`'s per-shard write lock during `remove_if`
    /// guarantees no racing `get_program` can resurrect it mid-removal.
    pub fn try_remove_program(&self, identity: &ProgramIdentity) -> bool {
        self.programs.remove_if(identity, |_, data| data.ref_count().try_lock_for_removal()).is_some()
    }

    /// Looks up a session by id, incrementing its ref-count on success.
    #[must_use]
    pub fn get_session(&self, session_id: u32) -> Option<Arc<SessionData>> {
        let entry = self.sessions.get(&session_id)?;
        let data = Arc::clone(entry.value());
        drop(entry);
        data.ref_count().try_inc().then_some(data)
    }

    /// Creates a fresh session bound to `program`. The caller must already
    /// have incremented `program`'s ref-count on this session's behalf
    /// (i.e. typically via `get_or_create_program`).
    pub fn create_session(
        &self,
        client_random_id: u64,
        server_random_id: u64,
        program: Arc<ProgramData>,
    ) -> Arc<SessionData> {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(SessionData::new(session_id, client_random_id, server_random_id, program));
        self.sessions.insert(session_id, Arc::clone(&session));
        session
    }

    /// Removes a session iff its ref-count is zero. On success, decrements
    /// the owning `ProgramData`'s ref-count (SPEC_FULL.md §4.3:
    /// "`SessionData::drop` decrements its parent `ProgramData` ref-count").
    pub fn try_remove_session(&self, session_id: u32) -> bool {
        let Some((_, session)) =
            self.sessions.remove_if(&session_id, |_, s| s.ref_count().try_lock_for_removal())
        else {
            return false;
        };
        session.program_data().ref_count().dec(self.env.wall_clock_secs());
        true
    }

    /// Sweeps sessions whose ref-count is zero and whose "no reference
    /// since" timestamp exceeds `timeout_secs` (SPEC_FULL.md §4.6 item 2).
    /// Returns the number of sessions removed.
    pub fn evict_unused_sessions(&self, timeout_secs: u64) -> usize {
        let now = self.env.wall_clock_secs();
        let stale: Vec<u32> = self
            .sessions
            .iter()
            .filter_map(|entry| {
                let rc = entry.value().ref_count();
                match rc.count() {
                    Some(0) if now.saturating_sub(rc.no_ref_since()) >= timeout_secs => {
                        Some(*entry.key())
                    },
                    _ => None,
                }
            })
            .collect();

        stale.into_iter().filter(|id| self.try_remove_session(*id)).count()
    }

    /// Sweeps programs whose ref-count is zero and whose "no reference
    /// since" timestamp exceeds `timeout_secs` (`unused_shared_data_timeout`,
    /// SPEC_FULL.md §4.6 item 2). Returns the number of programs removed.
    ///
    /// Releasing a program's reconstructed class loaders is the external
    /// collaborator's job (SPEC_FULL.md §1); here that is simply dropping
    /// the last `Arc<ProgramData>`, which drops its `class_loaders` map.
    pub fn evict_unused_programs(&self, timeout_secs: u64) -> usize {
        let now = self.env.wall_clock_secs();
        let stale: Vec<ProgramIdentity> = self
            .programs
            .iter()
            .filter_map(|entry| {
                let rc = entry.value().ref_count();
                match rc.count() {
                    Some(0) if now.saturating_sub(rc.no_ref_since()) >= timeout_secs => {
                        Some(entry.key().clone())
                    },
                    _ => None,
                }
            })
            .collect();

        stale.into_iter().filter(|identity| self.try_remove_program(identity)).count()
    }

    /// Number of programs currently tracked.
    #[must_use]
    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    /// Number of sessions currently tracked.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use booster_core::identity::{BoostFlags, CpuArch, RuntimeFlagSnapshot};

    use super::*;

    #[derive(Clone)]
    struct TestEnv;

    impl Environment for TestEnv {
        type Instant = std::time::Instant;

        fn now(&self) -> Self::Instant {
            std::time::Instant::now()
        }

        fn sleep(&self, _duration: std::time::Duration) -> impl std::future::Future<Output = ()> + Send {
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(7);
        }

        fn wall_clock_secs(&self) -> u64 {
            1_000
        }
    }

    fn identity() -> ProgramIdentity {
        ProgramIdentity {
            cpu_arch: CpuArch::X86,
            runtime_version: 1,
            runtime_build_info: String::new(),
            program_name: "p".to_string(),
            program_entry: "p".to_string(),
            is_jar: false,
            classpath_names_hash: 0,
            classpath_mtimes_hash: 0,
            agent_names_hash: 0,
            strict_command_line: None,
            boost_flags: BoostFlags::default(),
            runtime_flags: RuntimeFlagSnapshot::default(),
        }
    }

    #[test]
    fn get_or_create_is_idempotent_per_identity() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ServerDataManager::new(dir.path().to_path_buf(), TestEnv);
        let first = manager.get_or_create_program(identity());
        let second = manager.get_or_create_program(identity());
        assert_eq!(first.program_id(), second.program_id());
        assert_eq!(manager.program_count(), 1);
        assert_eq!(first.ref_count().count(), Some(2));
    }

    #[test]
    fn session_removal_decrements_program_ref_count() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ServerDataManager::new(dir.path().to_path_buf(), TestEnv);
        let program = manager.get_or_create_program(identity());
        let session = manager.create_session(0xAA, 0xBB, Arc::clone(&program));
        assert_eq!(program.ref_count().count(), Some(1));

        assert!(manager.try_remove_session(session.session_id()));
        assert_eq!(program.ref_count().count(), Some(0));
    }

    #[test]
    fn try_remove_program_fails_while_referenced() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ServerDataManager::new(dir.path().to_path_buf(), TestEnv);
        let program = manager.get_or_create_program(identity());
        assert!(!manager.try_remove_program(program.identity()));
    }

    #[test]
    fn eviction_sweeps_unreferenced_entries_past_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ServerDataManager::new(dir.path().to_path_buf(), TestEnv);
        let program = manager.get_or_create_program(identity());
        program.ref_count().dec(0); // drop to zero, no_ref_since = 0
        assert_eq!(manager.evict_unused_programs(500), 1);
        assert_eq!(manager.program_count(), 0);
    }
}
