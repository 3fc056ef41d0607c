//! Cache-files-sync and lazy-AOT task orchestration (SPEC_FULL.md §4.7).
//!
//! The `FileSegment` exchange is in scope and implemented here directly on
//! top of `booster-proto::FileWrapper`'s chunk framing. The class-loader,
//! klass, and method-profile locator exchange that a real lazy-AOT
//! compilation needs (`ClassLoaderLocators`/`DataOfClassLoaders`/
//! `KlassLocators`/`DataOfKlasses`/`MethodLocators`/`ProfilingInfo`/
//! `ArrayKlasses`) is explicitly out of scope (SPEC_FULL.md §1: "referenced
//! only by interface"); [`CompilationInputSource`] is that interface —
//! `booster-server::driver` drives it without this crate ever encoding the
//! JVM-specific wire shapes those message types carry.

use std::path::Path;

use booster_core::{ArtifactKind, CacheError, CacheSlot};
use booster_proto::{FileWrapper, ProtocolError};

use crate::server_error::ServerError;

/// Splits the concatenated record stream [`FileWrapper::send_file`] produces
/// into one `Vec<u8>` per `{file_size, chunk_size, bytes}` record, i.e. one
/// `FileSegment` message body per record.
///
/// # Errors
///
/// Returns a [`ServerError`] if `path` exists but could not be read.
pub fn file_segments_for(path: &Path) -> Result<Vec<Vec<u8>>, ServerError> {
    let mut out = Vec::new();
    FileWrapper::send_file(path, &mut out)?;

    let mut records = Vec::new();
    let mut rest = out.as_slice();
    loop {
        let (parsed, remainder) = FileWrapper::decode_chunk(rest)?;
        let consumed = rest.len() - remainder.len();
        records.push(rest[..consumed].to_vec());
        rest = remainder;
        if parsed.is_none() || rest.is_empty() {
            break;
        }
    }
    Ok(records)
}

/// The single-record `{file_size: NULL_PTR, chunk_size: 0}` body signalling
/// "no such file" (SPEC_FULL.md §4.1).
#[must_use]
pub fn null_file_record() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&booster_proto::NULL_PTR.to_ne_bytes());
    out.extend_from_slice(&0u32.to_ne_bytes());
    out
}

/// Builds the `FileSegment` records serving `slot`'s artifact to a
/// requesting client (`Get*Cache` handlers, SPEC_FULL.md §4.7).
///
/// Checks integrity before vending: a tampered or missing artifact is
/// reported as "no such file" rather than served.
///
/// # Errors
///
/// Returns a [`ServerError`] if the artifact exists but could not be read.
pub fn serve_cache_file(slot: &CacheSlot) -> Result<Vec<Vec<u8>>, ServerError> {
    if slot.is_cached() && slot.check_integrity()? {
        return file_segments_for(slot.file_path());
    }
    Ok(vec![null_file_record()])
}

/// Accumulates `FileSegment` records received from a client into `slot`,
/// publishing through [`CacheSlot::publish`] so the slot's own tamper
/// snapshot and atomic-publish discipline apply (rather than
/// `FileWrapper::receive_into`'s own tmp-lock, which would duplicate it).
///
/// The caller must already hold the producer role
/// (`slot.try_begin_generation()` succeeded) before calling this. Returns
/// `Ok(false)` and aborts generation if the first record signals "no such
/// file" on the client.
///
/// # Errors
///
/// Returns a [`ServerError`] if a record is malformed, the transfer ends
/// early, or publishing fails.
pub fn receive_cache_file(
    slot: &CacheSlot,
    records: &mut impl Iterator<Item = Vec<u8>>,
) -> Result<bool, ServerError> {
    let first = records.next().ok_or_else(|| {
        ServerError::Internal("cache file transfer ended before any record arrived".to_string())
    })?;
    let (parsed, _) = FileWrapper::decode_chunk(&first)?;
    let Some((file_size, first_bytes)) = parsed else {
        slot.abort_generation()?;
        return Ok(false);
    };

    let mut accumulated = first_bytes;
    while (accumulated.len() as u64) < u64::from(file_size) {
        let record = records.next().ok_or_else(|| {
            ServerError::Internal("cache file transfer ended early".to_string())
        })?;
        let (parsed, _) = FileWrapper::decode_chunk(&record)?;
        let (_, bytes) = parsed
            .ok_or_else(|| ServerError::from(ProtocolError::BadArgData("transfer ended early".into())))?;
        accumulated.extend_from_slice(&bytes);
    }

    slot.publish(|path| std::fs::write(path, &accumulated))?;
    Ok(true)
}

/// Step result of feeding one more `FileSegment` record into an
/// [`IncrementalFileReceiver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileReceiveStep {
    /// More records are expected before the transfer completes.
    Continue,
    /// The first record signalled "no such file" on the sender's side.
    NoSuchFile,
    /// Every declared byte has arrived.
    Complete,
}

/// Accumulates `FileSegment` records arriving one message at a time, across
/// however many `ServerDriver::process_event` calls it takes, without
/// blocking on an iterator the way [`receive_cache_file`] does.
///
/// This is the per-stream state machine's building block: `booster-server`'s
/// `driver` module holds one of these per in-flight cache-sync transfer.
#[derive(Debug, Default)]
pub struct IncrementalFileReceiver {
    total: Option<u64>,
    accumulated: Vec<u8>,
}

impl IncrementalFileReceiver {
    /// A fresh receiver expecting the first record next.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one more `FileSegment` message body into the transfer.
    ///
    /// # Errors
    ///
    /// Returns a [`ServerError`] if `record` is malformed.
    pub fn push(&mut self, record: &[u8]) -> Result<FileReceiveStep, ServerError> {
        let (parsed, _) = FileWrapper::decode_chunk(record)?;
        let Some((file_size, bytes)) = parsed else {
            return Ok(FileReceiveStep::NoSuchFile);
        };
        if self.total.is_none() {
            self.total = Some(u64::from(file_size));
        }
        self.accumulated.extend_from_slice(&bytes);
        if self.accumulated.len() as u64 >= self.total.unwrap_or(u64::MAX) {
            Ok(FileReceiveStep::Complete)
        } else {
            Ok(FileReceiveStep::Continue)
        }
    }

    /// Consumes the receiver, returning the fully accumulated bytes. Only
    /// meaningful after [`Self::push`] has returned
    /// [`FileReceiveStep::Complete`].
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.accumulated
    }
}

/// Artifact kinds `CacheFilesSyncTask` pulls from the client: CLR and
/// aggressive CDS only (SPEC_FULL.md §4.7 — the dynamic CDS and AOT slots
/// are server-generated, not client-sourced).
pub const CLIENT_SOURCED_KINDS: [ArtifactKind; 2] = [ArtifactKind::Clr, ArtifactKind::AggressiveCds];

/// Per-slot outcome of one `CacheFilesSyncTask` pull attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSyncOutcome {
    /// Not requested: disallowed by boost flags, or already cached.
    Skipped,
    /// This slot's CAS lost the race to another producer; nothing to do.
    AlreadyGenerating,
    /// The client had no such file; generation was aborted.
    ClientHadNone,
    /// The client's file was received and published.
    Received,
}

/// Decides, and if appropriate begins, generation for one client-sourced
/// slot. Returns `Ok(Some(()))` (a begun generation the caller must now
/// request the file for) only when the CAS was won; other outcomes are
/// terminal and returned directly.
///
/// Mirrors `CacheSlot::try_begin_generation`'s single-producer CAS
/// (`booster_core::cache_state`); kept as a thin helper so
/// `booster-server::driver`'s per-stream state machine doesn't repeat the
/// "is this slot eligible" policy at every call site.
pub fn try_start_cache_sync(slot: &CacheSlot) -> Result<bool, CacheSyncOutcome> {
    if !slot.is_allowed() || slot.is_cached() {
        return Err(CacheSyncOutcome::Skipped);
    }
    match slot.try_begin_generation() {
        Ok(()) => Ok(true),
        Err(CacheError::AlreadyGenerating) => Err(CacheSyncOutcome::AlreadyGenerating),
        Err(_) => Err(CacheSyncOutcome::Skipped),
    }
}

// Compiler-driver invocation (`CompileRequest`/`CompileOutcome`/
// `CompilerDriver`/`CompilationInputSource`/`run_lazy_aot`) lives in
// `crate::compiler` and is re-exported here so existing call sites in
// `driver.rs` keep working.
pub use crate::compiler::{
    run_lazy_aot, CompilationInputSource, CompileOutcome, CompileRequest, CompilerDriver,
};

#[cfg(test)]
mod tests {
    use booster_core::CacheSlot;

    use super::*;

    #[test]
    fn file_segments_for_missing_file_is_one_null_record() {
        let dir = tempfile::tempdir().unwrap();
        let records = file_segments_for(&dir.path().join("missing.bin")).unwrap();
        assert_eq!(records, vec![null_file_record()]);
    }

    #[test]
    fn file_segments_round_trip_through_receive_cache_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.bin");
        std::fs::write(&src, b"cached artifact bytes").unwrap();
        let records = file_segments_for(&src).unwrap();

        let slot = CacheSlot::new(dir.path().join("cache-x-clr.log"), true);
        slot.try_begin_generation().unwrap();
        let mut iter = records.into_iter();
        assert!(receive_cache_file(&slot, &mut iter).unwrap());
        assert_eq!(std::fs::read(slot.file_path()).unwrap(), b"cached artifact bytes");
        assert!(slot.is_cached());
    }

    #[test]
    fn receive_cache_file_aborts_when_client_has_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let slot = CacheSlot::new(dir.path().join("cache-x-clr.log"), true);
        slot.try_begin_generation().unwrap();
        let mut iter = vec![null_file_record()].into_iter();
        assert!(!receive_cache_file(&slot, &mut iter).unwrap());
        assert_eq!(slot.state(), booster_core::ArtifactState::NotGenerated);
    }

    #[test]
    fn serve_cache_file_on_uncached_slot_is_null_record() {
        let dir = tempfile::tempdir().unwrap();
        let slot = CacheSlot::new(dir.path().join("cache-x-clr.log"), true);
        assert_eq!(serve_cache_file(&slot).unwrap(), vec![null_file_record()]);
    }

    #[test]
    fn try_start_cache_sync_skips_disallowed_slots() {
        let dir = tempfile::tempdir().unwrap();
        let slot = CacheSlot::new(dir.path().join("cache-x-clr.log"), false);
        assert_eq!(try_start_cache_sync(&slot), Err(CacheSyncOutcome::Skipped));
    }

    // `run_lazy_aot`'s own behavior is exercised in `crate::compiler`'s test
    // module, alongside the traits it depends on.
}
