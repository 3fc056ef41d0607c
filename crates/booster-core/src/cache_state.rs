//! The per-artifact cache state machine (SPEC_FULL.md §4.4).
//!
//! No teacher counterpart: `lockframe-server::storage::redb` persists state
//! through ACID transactions, not a tmp-then-rename filesystem convention.
//! This module is new code, grounded directly on the spec text and on
//! promoting the teacher's `tempfile` dev-dependency (used only for test
//! tempdirs there) to a genuine runtime dependency here.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex,
    },
    time::{Instant, SystemTime},
};

use booster_proto::TMP_LOCK_WAIT;

use crate::error::CacheError;

const NOT_GENERATED: u8 = 0;
const BEING_GENERATED: u8 = 1;
const GENERATED: u8 = 2;

/// The three legal states of a cache artifact (SPEC_FULL.md §3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactState {
    /// No artifact exists yet; any agent may attempt generation.
    NotGenerated,
    /// Exactly one agent currently holds the right to generate.
    BeingGenerated,
    /// A verified artifact exists at `file_path`.
    Generated,
}

impl ArtifactState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            BEING_GENERATED => Self::BeingGenerated,
            GENERATED => Self::Generated,
            _ => Self::NotGenerated,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::NotGenerated => NOT_GENERATED,
            Self::BeingGenerated => BEING_GENERATED,
            Self::Generated => GENERATED,
        }
    }
}

/// One cache-artifact slot: `(is_allowed, state, file_path, mtime snapshot)`.
///
/// `state` is an atomic `u8`; every legal transition is CAS-guarded, so
/// concurrent callers racing `try_begin_generation` see exactly one winner
/// (SPEC_FULL.md §8 "State monotonicity per attempt").
#[derive(Debug)]
pub struct CacheSlot {
    is_allowed: bool,
    state: AtomicU8,
    file_path: PathBuf,
    mtime_snapshot: Mutex<Option<SystemTime>>,
}

impl CacheSlot {
    /// Creates a slot for `file_path`, initially `NotGenerated`.
    #[must_use]
    pub fn new(file_path: PathBuf, is_allowed: bool) -> Self {
        Self {
            is_allowed,
            state: AtomicU8::new(NOT_GENERATED),
            file_path,
            mtime_snapshot: Mutex::new(None),
        }
    }

    /// Whether this boost package is enabled for the owning program
    /// (`BoostStopAtLevel`/`UseBoostPackages`, SPEC_FULL.md §6).
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.is_allowed
    }

    /// The path the artifact is published to.
    #[must_use]
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> ArtifactState {
        ArtifactState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether a cached artifact is already known good, i.e. eligible to
    /// skip re-generation (SPEC_FULL.md §4.7 "already cached").
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.state() == ArtifactState::Generated
    }

    /// Attempts to win the single-producer race: `NotGenerated ⇢
    /// BeingGenerated`. Exactly one caller succeeds.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::AlreadyGenerating` if another agent already
    /// holds the slot, or if the slot is already `Generated`.
    pub fn try_begin_generation(&self) -> Result<(), CacheError> {
        self.state
            .compare_exchange(NOT_GENERATED, BEING_GENERATED, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| CacheError::AlreadyGenerating)
    }

    /// Aborts an in-progress generation: `BeingGenerated ⇢ NotGenerated`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidTransition` if the slot is not currently
    /// `BeingGenerated` (the caller does not hold the producer role).
    pub fn abort_generation(&self) -> Result<(), CacheError> {
        self.state
            .compare_exchange(BEING_GENERATED, NOT_GENERATED, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| CacheError::InvalidTransition {
                state: self.state(),
                operation: "abort_generation".to_string(),
            })
    }

    /// Publishes a newly generated artifact: writes via `write` into a
    /// `<file_path>.tmp` lock file, `chmod`s it read-only, renames it into
    /// place, and records the post-rename mtime as the tamper-detection
    /// snapshot. On any failure the tmp file is removed and the slot
    /// reverts to `NotGenerated`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidTransition` if the caller does not
    /// currently hold `BeingGenerated`, `CacheError::LockContention` if a
    /// sibling process's tmp lock does not resolve within the wait window,
    /// or `CacheError::Io` for filesystem failures.
    pub fn publish(&self, write: impl FnOnce(&Path) -> io::Result<()>) -> Result<(), CacheError> {
        if self.state() != ArtifactState::BeingGenerated {
            return Err(CacheError::InvalidTransition {
                state: self.state(),
                operation: "publish".to_string(),
            });
        }

        match self.publish_inner(write) {
            Ok(()) => {
                self.state.store(GENERATED, Ordering::Release);
                Ok(())
            },
            Err(err) => {
                let _ = fs::remove_file(self.tmp_path());
                self.state.store(NOT_GENERATED, Ordering::Release);
                Err(err)
            },
        }
    }

    fn publish_inner(&self, write: impl FnOnce(&Path) -> io::Result<()>) -> Result<(), CacheError> {
        let tmp_path = self.tmp_path();
        acquire_tmp_lock(&tmp_path, &self.file_path)?;
        write(&tmp_path)?;
        make_readonly(&tmp_path)?;
        let mtime = fs::metadata(&tmp_path)?.modified()?;
        fs::rename(&tmp_path, &self.file_path)?;
        *self.mtime_snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(mtime);
        Ok(())
    }

    /// Before vending a `Generated` artifact, checks its on-disk mtime
    /// against the publish-time snapshot. A mismatch (or missing file)
    /// demotes the slot to `NotGenerated` and removes the file.
    ///
    /// Returns `Ok(true)` if the artifact is intact and safe to serve,
    /// `Ok(false)` if it was demoted (the caller should treat the artifact
    /// as absent), and leaves non-`Generated` slots untouched (`Ok(false)`).
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Io` only for filesystem errors other than "not
    /// found", which is itself treated as tamper evidence.
    pub fn check_integrity(&self) -> Result<bool, CacheError> {
        if self.state() != ArtifactState::Generated {
            return Ok(false);
        }

        let on_disk_mtime = match fs::metadata(&self.file_path).and_then(|m| m.modified()) {
            Ok(mtime) => Some(mtime),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        let snapshot = *self.mtime_snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if on_disk_mtime == snapshot && on_disk_mtime.is_some() {
            return Ok(true);
        }

        self.demote_tampered();
        Ok(false)
    }

    fn demote_tampered(&self) {
        let _ = self.state.compare_exchange(
            GENERATED,
            BEING_GENERATED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = fs::remove_file(&self.file_path);
        let _ = self.mtime_snapshot.lock().map(|mut g| *g = None);
        let _ = self.state.compare_exchange(
            BEING_GENERATED,
            NOT_GENERATED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn tmp_path(&self) -> PathBuf {
        let mut os = self.file_path.clone().into_os_string();
        os.push(".tmp");
        PathBuf::from(os)
    }
}

/// Acquires the tmp-file producer lock for `tmp_path`, guarding `target`.
///
/// `O_CREAT|O_EXCL` semantics via `create_new`: on success the caller is the
/// sole producer. On `AlreadyExists`, another producer (possibly in a
/// different process sharing the cache directory) holds it; we poll for
/// `target` to appear for up to [`TMP_LOCK_WAIT`] before giving up.
fn acquire_tmp_lock(tmp_path: &Path, target: &Path) -> Result<(), CacheError> {
    match fs::OpenOptions::new().write(true).create_new(true).open(tmp_path) {
        Ok(_file) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let deadline = Instant::now() + TMP_LOCK_WAIT;
            while Instant::now() < deadline {
                if target.exists() {
                    return Ok(());
                }
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
            Err(CacheError::LockContention { waited: TMP_LOCK_WAIT })
        },
        Err(err) => Err(err.into()),
    }
}

fn make_readonly(path: &Path) -> Result<(), CacheError> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_slot_starts_not_generated_and_uncached() {
        let dir = tempfile::tempdir().unwrap();
        let slot = CacheSlot::new(dir.path().join("cache-x-cds.jsa"), true);
        assert_eq!(slot.state(), ArtifactState::NotGenerated);
        assert!(!slot.is_cached());
    }

    #[test]
    fn only_one_concurrent_begin_wins() {
        let dir = tempfile::tempdir().unwrap();
        let slot = CacheSlot::new(dir.path().join("cache-x-cds.jsa"), true);
        assert!(slot.try_begin_generation().is_ok());
        assert!(matches!(slot.try_begin_generation(), Err(CacheError::AlreadyGenerating)));
    }

    #[test]
    fn publish_writes_file_and_marks_generated() {
        let dir = tempfile::tempdir().unwrap();
        let slot = CacheSlot::new(dir.path().join("cache-x-cds.jsa"), true);
        slot.try_begin_generation().unwrap();
        slot.publish(|path| fs::write(path, b"archive bytes")).unwrap();

        assert_eq!(slot.state(), ArtifactState::Generated);
        assert!(slot.is_cached());
        assert_eq!(fs::read(slot.file_path()).unwrap(), b"archive bytes");
        assert!(fs::metadata(slot.file_path()).unwrap().permissions().readonly());
    }

    #[test]
    fn publish_failure_reverts_to_not_generated_and_removes_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let slot = CacheSlot::new(dir.path().join("cache-x-cds.jsa"), true);
        slot.try_begin_generation().unwrap();

        let err = slot
            .publish(|_path| Err(io::Error::new(io::ErrorKind::Other, "compiler failed")))
            .unwrap_err();
        assert!(matches!(err, CacheError::Io(_)));
        assert_eq!(slot.state(), ArtifactState::NotGenerated);
        assert!(!slot.tmp_path().exists());
    }

    #[test]
    fn integrity_check_passes_for_untouched_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let slot = CacheSlot::new(dir.path().join("cache-x-cds.jsa"), true);
        slot.try_begin_generation().unwrap();
        slot.publish(|path| fs::write(path, b"bytes")).unwrap();

        assert!(slot.check_integrity().unwrap());
        assert_eq!(slot.state(), ArtifactState::Generated);
    }

    #[test]
    fn integrity_check_demotes_on_tamper() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache-x-cds.jsa");
        let slot = CacheSlot::new(path.clone(), true);
        slot.try_begin_generation().unwrap();
        slot.publish(|p| fs::write(p, b"bytes")).unwrap();

        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_readonly(false);
        fs::set_permissions(&path, perms).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        fs::write(&path, b"tampered bytes!!").unwrap();

        assert!(!slot.check_integrity().unwrap());
        assert_eq!(slot.state(), ArtifactState::NotGenerated);
        assert!(!path.exists());
    }

    #[test]
    fn cannot_publish_without_holding_being_generated() {
        let dir = tempfile::tempdir().unwrap();
        let slot = CacheSlot::new(dir.path().join("cache-x-cds.jsa"), true);
        let err = slot.publish(|path| fs::write(path, b"bytes")).unwrap_err();
        assert!(matches!(err, CacheError::InvalidTransition { .. }));
    }
}
