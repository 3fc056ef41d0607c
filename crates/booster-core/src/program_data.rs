//! `ProgramData`: server-side record shared across sessions with the same
//! program identity (SPEC_FULL.md §3, §4.3).
//!
//! No teacher counterpart — `lockframe-server` has no equivalent of a
//! shared, ref-counted, lazily-evicted per-identity record. Grounded on the
//! spec text; the ref-count-with-timestamp and `LOCKED` sentinel are
//! implemented with the same atomics-first style the teacher uses in
//! `lockframe-core::env` for its `Clone + Send + Sync` primitives.

use std::{
    path::PathBuf,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
};

use dashmap::DashMap;

use crate::{
    cache_state::CacheSlot,
    class_loader::{ClassLoaderKey, Interner},
    identity::ProgramIdentity,
};

/// Sentinel value for `RefCount`'s internal counter meaning "teardown has
/// begun, do not resurrect" (SPEC_FULL.md §5 "Shared-resource policy").
const LOCKED: i64 = i64::MIN;

/// A CAS-guarded reference count with a "no reference since" timestamp.
///
/// Mirrors the spec's `RefCnt`/`RefCntWithTime` (§3, §5): `inc`/`dec` are
/// atomic, and once the count reaches zero a timestamp is recorded so the
/// control loop can evaluate `now - no_ref_since > timeout` without a lock.
/// `lock()` is the sole path by which `try_remove` claims exclusive teardown
/// rights, after which further `try_inc` calls fail rather than resurrect
/// an entry mid-removal.
#[derive(Debug, Default)]
pub struct RefCount {
    count: AtomicI64,
    no_ref_since: AtomicU64,
}

impl RefCount {
    /// A fresh, unreferenced counter.
    #[must_use]
    pub fn new() -> Self {
        Self { count: AtomicI64::new(0), no_ref_since: AtomicU64::new(0) }
    }

    /// The current count, or `None` if the entry is locked for teardown.
    #[must_use]
    pub fn count(&self) -> Option<i64> {
        let raw = self.count.load(Ordering::Acquire);
        if raw == LOCKED {
            None
        } else {
            Some(raw)
        }
    }

    /// Attempts to increment. Fails if the entry is locked for teardown.
    pub fn try_inc(&self) -> bool {
        loop {
            let current = self.count.load(Ordering::Acquire);
            if current == LOCKED {
                return false;
            }
            if self
                .count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Decrements the count. If it reaches zero, records `now_secs` as the
    /// "no reference since" timestamp.
    pub fn dec(&self, now_secs: u64) {
        loop {
            let current = self.count.load(Ordering::Acquire);
            if current == LOCKED {
                return;
            }
            let next = current - 1;
            if self
                .count
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if next <= 0 {
                    self.no_ref_since.store(now_secs, Ordering::Release);
                }
                return;
            }
        }
    }

    /// Seconds-since-epoch timestamp of when the count last reached zero.
    /// Meaningless while `count() > Some(0)`.
    #[must_use]
    pub fn no_ref_since(&self) -> u64 {
        self.no_ref_since.load(Ordering::Acquire)
    }

    /// Claims exclusive teardown rights: succeeds only if the count is
    /// exactly zero, matching the spec's `try_remove(key, eval)` contract
    /// ("removes iff `eval(entry)` returns true *under the map's internal
    /// lock*").
    pub fn try_lock_for_removal(&self) -> bool {
        self.count.compare_exchange(0, LOCKED, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Whether this entry is currently locked for teardown.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.count.load(Ordering::Acquire) == LOCKED
    }
}

/// Which of the five cache slots a `ProgramData` owns (glossary: "Artifact /
/// cache slot").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Class-loader resource index.
    Clr,
    /// Dynamic (per-run) shared class archive.
    DynamicCds,
    /// Aggressive (cross-run) shared class archive.
    AggressiveCds,
    /// Statically compiled AOT native library.
    AotStatic,
    /// Profile-guided AOT native library.
    AotPgo,
}

impl ArtifactKind {
    /// All five kinds, in the order `ProgramData` stores its slots.
    pub const ALL: [Self; 5] =
        [Self::Clr, Self::DynamicCds, Self::AggressiveCds, Self::AotStatic, Self::AotPgo];

    /// The cache-file suffix for this kind (SPEC_FULL.md §6 "Persisted
    /// state layout").
    #[must_use]
    pub fn file_suffix(self) -> &'static str {
        match self {
            Self::Clr => "clr.log",
            Self::DynamicCds | Self::AggressiveCds => "cds.jsa",
            Self::AotStatic => "aot.so",
            Self::AotPgo => "aot-pgo.so",
        }
    }
}

/// An opaque handle to a reconstructed class-loader object.
///
/// The actual class-loader reconstruction is an external collaborator (the
/// managed runtime, SPEC_FULL.md §1 "Explicitly out of scope"); this type is
/// the identity token `ProgramData` tracks on its behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassLoaderHandle(pub u64);

/// One program identity's server-side shared record (SPEC_FULL.md §3).
#[derive(Debug)]
pub struct ProgramData {
    program_id: u32,
    derived_string_id: String,
    identity: ProgramIdentity,
    class_loader_interner: Interner,
    class_loaders: DashMap<ClassLoaderKey, ClassLoaderHandle>,
    cache_slots: [CacheSlot; 5],
    ref_count: RefCount,
}

impl ProgramData {
    /// Creates a fresh record for `identity`, with every cache slot starting
    /// `NotGenerated` at the conventional cache-directory paths.
    #[must_use]
    pub fn new(program_id: u32, identity: ProgramIdentity, cache_dir: &std::path::Path) -> Self {
        let derived_string_id = identity.derived_string_id();
        let boost = identity.boost_flags;
        let allowed = |kind: ArtifactKind| match kind {
            ArtifactKind::Clr => boost.clr,
            ArtifactKind::DynamicCds | ArtifactKind::AggressiveCds => boost.cds,
            ArtifactKind::AotStatic => boost.aot && !boost.pgo,
            ArtifactKind::AotPgo => boost.aot && boost.pgo,
        };
        let path_for = |kind: ArtifactKind| -> PathBuf {
            cache_dir.join(format!("cache-{derived_string_id}-{}", kind.file_suffix()))
        };
        let cache_slots = ArtifactKind::ALL.map(|kind| CacheSlot::new(path_for(kind), allowed(kind)));

        Self {
            program_id,
            derived_string_id,
            identity,
            class_loader_interner: Interner::new(),
            class_loaders: DashMap::new(),
            cache_slots,
            ref_count: RefCount::new(),
        }
    }

    /// The server-assigned, monotone program id.
    #[must_use]
    pub fn program_id(&self) -> u32 {
        self.program_id
    }

    /// The derived human-readable string id (`<name>-<entry>-<hash-hex>`).
    #[must_use]
    pub fn derived_string_id(&self) -> &str {
        &self.derived_string_id
    }

    /// The program identity this record was created for.
    #[must_use]
    pub fn identity(&self) -> &ProgramIdentity {
        &self.identity
    }

    /// The interner backing this program's class-loader keys.
    #[must_use]
    pub fn class_loader_interner(&self) -> &Interner {
        &self.class_loader_interner
    }

    /// The cache slot for `kind`.
    #[must_use]
    pub fn slot(&self, kind: ArtifactKind) -> &CacheSlot {
        &self.cache_slots[kind as usize]
    }

    /// All cache slots paired with their kind.
    pub fn slots(&self) -> impl Iterator<Item = (ArtifactKind, &CacheSlot)> {
        ArtifactKind::ALL.into_iter().map(move |kind| (kind, self.slot(kind)))
    }

    /// The reference count tracking live sessions against this record.
    #[must_use]
    pub fn ref_count(&self) -> &RefCount {
        &self.ref_count
    }

    /// Resolves `key`'s parent-first chain into reconstructed loader
    /// handles, inserting any still-missing parents via `resolve_parent`
    /// (SPEC_FULL.md §4.3: "Parent resolution is required to precede child
    /// insertion").
    ///
    /// `boot`/`platform` keys are never reconstructed — callers must not
    /// pass them here; doing so is a caller bug, not a recoverable error,
    /// since the spec treats them as always-present built-ins.
    pub fn get_or_reconstruct_class_loader(
        &self,
        key: &ClassLoaderKey,
        resolve: impl FnOnce() -> ClassLoaderHandle,
    ) -> ClassLoaderHandle {
        if let Some(existing) = self.class_loaders.get(key) {
            return *existing;
        }
        let handle = resolve();
        *self.class_loaders.entry(key.clone()).or_insert(handle)
    }

    /// The number of reconstructed class loaders currently tracked.
    #[must_use]
    pub fn class_loader_count(&self) -> usize {
        self.class_loaders.len()
    }
}
