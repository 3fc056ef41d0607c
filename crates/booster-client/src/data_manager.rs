//! Process-wide client state (SPEC_FULL.md §9 "Global singletons"): one
//! `ProgramIdentity`, one cache directory, one boost policy per process,
//! initialized once at startup and read from everywhere else.

use std::{
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
};

use booster_core::{ArtifactKind, BoostFlags, ProgramIdentity};

use crate::startup::StartupGate;

/// Which artifact kinds this run actually ended up using, as opposed to
/// [`ClientDataManager::allowed`] (what the flag surface permits). Starts
/// all-`false` and is updated as the handshake/fetch/generate decisions
/// land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsingFlags {
    /// Class-loader resource index in use.
    pub clr: bool,
    /// Shared class archive in use.
    pub cds: bool,
    /// AOT native library in use.
    pub aot: bool,
}

struct Inner {
    identity: ProgramIdentity,
    cache_dir: PathBuf,
    allowed: BoostFlags,
    local_mode: bool,
    using: Mutex<UsingFlags>,
    escaped: Mutex<Option<String>>,
    startup_gate: StartupGate,
}

/// The process-wide singleton (SPEC_FULL.md §9). Constructed once via
/// [`ClientDataManager::init`]; every later call reads the same instance.
pub struct ClientDataManager {
    inner: Inner,
}

static INSTANCE: OnceLock<ClientDataManager> = OnceLock::new();

impl ClientDataManager {
    /// Initializes the singleton. Returns `Err` with the already-installed
    /// instance's identity if called more than once — matches the "explicit
    /// init, not lazy" singleton pattern used elsewhere in this workspace.
    ///
    /// # Errors
    ///
    /// Returns `Err(())` if the singleton was already initialized.
    pub fn init(
        identity: ProgramIdentity,
        cache_dir: PathBuf,
        allowed: BoostFlags,
        local_mode: bool,
    ) -> Result<(), ()> {
        let manager = Self {
            inner: Inner {
                identity,
                cache_dir,
                allowed,
                local_mode,
                using: Mutex::new(UsingFlags::default()),
                escaped: Mutex::new(None),
                startup_gate: StartupGate::new(),
            },
        };
        INSTANCE.set(manager).map_err(|_| ())
    }

    /// Fetches the singleton.
    ///
    /// # Panics
    ///
    /// Panics if [`Self::init`] has not yet been called; this mirrors an
    /// embedder bug, not a runtime condition this crate can recover from.
    #[must_use]
    pub fn get() -> &'static Self {
        INSTANCE.get().expect("ClientDataManager::init must run before ClientDataManager::get")
    }

    /// This process's program identity.
    #[must_use]
    pub fn identity(&self) -> &ProgramIdentity {
        &self.inner.identity
    }

    /// The derived string id used for cache file naming, matching the
    /// server's `cache-<id>-<suffix>` convention.
    #[must_use]
    pub fn derived_string_id(&self) -> String {
        self.inner.identity.derived_string_id()
    }

    /// Local path this kind's artifact would be stored at or read from.
    #[must_use]
    pub fn slot_path(&self, kind: ArtifactKind) -> PathBuf {
        self.inner
            .cache_dir
            .join(format!("cache-{}-{}", self.derived_string_id(), kind.file_suffix()))
    }

    /// The cache directory this manager was initialized with.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.inner.cache_dir
    }

    /// The boost packages this process is allowed to use, per its resolved
    /// policy.
    #[must_use]
    pub fn allowed(&self) -> BoostFlags {
        self.inner.allowed
    }

    /// Whether this process runs in local-only mode (no server contact).
    #[must_use]
    pub fn local_mode(&self) -> bool {
        self.inner.local_mode
    }

    /// Snapshot of which artifacts are actually in use right now.
    #[must_use]
    pub fn using(&self) -> UsingFlags {
        *self.inner.using.lock().expect("using flags mutex poisoned")
    }

    /// Records that a given artifact kind just became active.
    pub fn set_using(&self, mark: impl FnOnce(&mut UsingFlags)) {
        let mut guard = self.inner.using.lock().expect("using flags mutex poisoned");
        mark(&mut guard);
    }

    /// Marks this run as having escaped the boost path (SPEC_FULL.md §7:
    /// handshake failure under `BoosterCrashIfNoServer=false` falls back to
    /// an unboosted run rather than aborting).
    pub fn escape(&self, reason: impl Into<String>) {
        let mut guard = self.inner.escaped.lock().expect("escape mutex poisoned");
        if guard.is_none() {
            *guard = Some(reason.into());
        }
    }

    /// Whether this run has escaped the boost path.
    #[must_use]
    pub fn is_escaped(&self) -> bool {
        self.inner.escaped.lock().expect("escape mutex poisoned").is_some()
    }

    /// The reason escape was triggered, if it was.
    #[must_use]
    pub fn escape_reason(&self) -> Option<String> {
        self.inner.escaped.lock().expect("escape mutex poisoned").clone()
    }

    /// The startup-end gate embedders fire via [`crate::startup::StartupSignal`].
    #[must_use]
    pub fn startup_gate(&self) -> &StartupGate {
        &self.inner.startup_gate
    }
}

#[cfg(test)]
mod tests {
    use booster_core::{CpuArch, RuntimeFlagSnapshot};

    use super::*;

    fn sample_identity() -> ProgramIdentity {
        ProgramIdentity {
            cpu_arch: CpuArch::X86,
            runtime_version: 1,
            runtime_build_info: "test".to_string(),
            program_name: "App".to_string(),
            program_entry: "App".to_string(),
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
    fn slot_path_matches_server_naming_convention() {
        let cache_dir = PathBuf::from("/tmp/booster-test-cache");
        let allowed = BoostFlags { clr: true, cds: true, aot: false, pgo: false };
        // Initialization is process-global and OnceLock-guarded; only the
        // first test to run this gets to install it, so assert on shape
        // rather than requiring a fresh instance.
        let _ = ClientDataManager::init(sample_identity(), cache_dir.clone(), allowed, false);
        let manager = ClientDataManager::get();
        let path = manager.slot_path(ArtifactKind::Clr);
        assert!(path.starts_with(&cache_dir));
        assert!(path.to_string_lossy().ends_with("clr.log"));
    }

    #[test]
    fn escape_records_first_reason_only() {
        // `ClientDataManager` is a process-wide `OnceLock` singleton, so this
        // test shares it with the others in this module; it only exercises
        // `escape`'s first-reason-wins behaviour, not which process-wide
        // instance won initialization.
        let cache_dir = PathBuf::from("/tmp/booster-test-cache-2");
        let allowed = BoostFlags::default();
        let _ = ClientDataManager::init(sample_identity(), cache_dir, allowed, false);
        let manager = ClientDataManager::get();
        manager.escape("first reason");
        let reason_after_first = manager.escape_reason();
        manager.escape("second reason");
        assert_eq!(manager.escape_reason(), reason_after_first);
        assert!(manager.is_escaped());
    }
}
