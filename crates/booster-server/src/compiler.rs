//! The out-of-process (or in-process stub) AOT compiler invocation surface
//! and the collaborator that feeds it locator/data-exchange inputs
//! (SPEC_FULL.md §1 "explicitly out of scope... referenced only by
//! interface", §5 "any number of compiler-driver threads").

use std::path::Path;

use booster_core::CacheSlot;

use crate::server_error::ServerError;

/// Compiler-driver invocation request (SPEC_FULL.md §4.7 `LazyAotCompilationTask`).
#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// The session this compilation is running on behalf of.
    pub session_id: u32,
    /// Where the produced artifact should be written.
    pub output_path: std::path::PathBuf,
    /// Class-file bytes collected via [`CompilationInputSource`].
    pub classes: Vec<Vec<u8>>,
    /// Fully-qualified method names the runtime profiled as hot.
    pub methods_to_compile: Vec<String>,
    /// Method-profile blobs, one per entry in `methods_to_compile`.
    pub profiling_info: Vec<Vec<u8>>,
    /// Whether to fold in profile-guided optimization (`BoostFlags::pgo`).
    pub pgo: bool,
}

/// Outcome of one compiler-driver invocation.
#[derive(Debug, Clone)]
pub enum CompileOutcome {
    /// Compilation succeeded; the artifact is at `output_path` already
    /// (written by the driver, not yet published through `CacheSlot`).
    Success,
    /// Compilation failed for a non-fatal reason (e.g. no hot methods);
    /// the caller should abort generation, not retry.
    Skipped {
        /// Why compilation produced nothing.
        reason: String,
    },
}

/// Runs one compilation, blocking until it completes or fails.
///
/// Implementations run synchronously and may block for the duration of a
/// real compilation; the server invokes this from a blocking worker
/// context (`tokio::task::spawn_blocking`), mirroring the spec's
/// thread-per-connection model.
pub trait CompilerDriver: Send + Sync {
    /// Runs one compilation, blocking until it completes or fails.
    ///
    /// # Errors
    ///
    /// Returns a [`ServerError`] on any compiler-side failure.
    fn compile(&self, request: CompileRequest) -> Result<CompileOutcome, ServerError>;
}

/// Collaborator abstracting the locator/data-exchange round trip a real
/// lazy-AOT compilation needs from the client (SPEC_FULL.md §1, §4.7). Each
/// method corresponds to one pair of message types in the directionality
/// table; a production implementation sends the `*Locators` request over
/// the stream and blocks for the matching `DataOf*`/`ProfilingInfo`/
/// `ArrayKlasses` reply.
pub trait CompilationInputSource: Send + Sync {
    /// `ClassLoaderLocators` → `DataOfClassLoaders`: resolves the session's
    /// known class loaders into reconstructable chains.
    ///
    /// # Errors
    ///
    /// Returns a [`ServerError`] if the client fails to answer.
    fn collect_classes(&self, session_id: u32) -> Result<Vec<Vec<u8>>, ServerError>;

    /// `MethodLocators`: the fully-qualified names of methods the runtime
    /// profiled as hot enough to compile.
    ///
    /// # Errors
    ///
    /// Returns a [`ServerError`] if the client fails to answer.
    fn collect_methods_to_compile(&self, session_id: u32) -> Result<Vec<String>, ServerError>;

    /// `ProfilingInfo`: per-method profile blobs, in the same order as
    /// `methods`.
    ///
    /// # Errors
    ///
    /// Returns a [`ServerError`] if the client fails to answer.
    fn collect_profiling_info(
        &self,
        session_id: u32,
        methods: &[String],
    ) -> Result<Vec<Vec<u8>>, ServerError>;
}

/// Runs the lazy-AOT compilation pipeline: pulls inputs via `source`,
/// invokes `compiler`, and publishes through `slot` on success.
///
/// The caller must already hold the producer role on `slot`
/// (`slot.try_begin_generation()` succeeded) before calling this.
///
/// # Errors
///
/// Returns a [`ServerError`] if input collection, compilation, or
/// publishing fails. On any error the slot's generation is aborted so a
/// future attempt is not permanently blocked.
pub fn run_lazy_aot(
    slot: &CacheSlot,
    session_id: u32,
    pgo: bool,
    source: &dyn CompilationInputSource,
    compiler: &dyn CompilerDriver,
) -> Result<bool, ServerError> {
    let result = (|| -> Result<bool, ServerError> {
        let classes = source.collect_classes(session_id)?;
        let methods_to_compile = source.collect_methods_to_compile(session_id)?;
        let profiling_info = source.collect_profiling_info(session_id, &methods_to_compile)?;

        let scratch = tempfile::Builder::new()
            .prefix("booster-aot-")
            .tempfile_in(slot.file_path().parent().unwrap_or_else(|| Path::new(".")))
            .map_err(|e| ServerError::Internal(format!("scratch file: {e}")))?;
        let scratch_path = scratch.path().to_path_buf();

        let request = CompileRequest {
            session_id,
            output_path: scratch_path.clone(),
            classes,
            methods_to_compile,
            profiling_info,
            pgo,
        };
        match compiler.compile(request)? {
            CompileOutcome::Success => {
                slot.publish(|path| std::fs::copy(&scratch_path, path).map(|_| ()))?;
                Ok(true)
            },
            CompileOutcome::Skipped { .. } => {
                slot.abort_generation()?;
                Ok(false)
            },
        }
    })();

    if result.is_err() {
        let _ = slot.abort_generation();
    }
    result
}

/// An in-process [`CompilerDriver`] stand-in: writes a marker payload
/// instead of invoking a real AOT compiler backend. Resolves the open
/// question of how the external compiler driver is modeled (SPEC_FULL.md
/// §9(iii)) until an out-of-process driver is wired in as a second impl of
/// this trait.
#[derive(Debug, Default)]
pub struct StubCompilerDriver;

impl CompilerDriver for StubCompilerDriver {
    fn compile(&self, request: CompileRequest) -> Result<CompileOutcome, ServerError> {
        if request.methods_to_compile.is_empty() {
            return Ok(CompileOutcome::Skipped { reason: "no hot methods to compile".to_string() });
        }
        std::fs::write(&request.output_path, b"booster-stub-aot-artifact")?;
        Ok(CompileOutcome::Success)
    }
}

/// An in-process [`CompilationInputSource`] stand-in: the real locator/
/// data-exchange round trip over the wire is explicitly out of scope (no
/// JVM-specific class/method/profile encoding lives in this crate), so this
/// always reports nothing collected. Fed through [`run_lazy_aot`], it makes
/// every lazy-AOT task resolve to [`CompileOutcome::Skipped`] rather than
/// leaving the pipeline's wiring untested.
#[derive(Debug, Default)]
pub struct StubCompilationInputSource;

impl CompilationInputSource for StubCompilationInputSource {
    fn collect_classes(&self, _session_id: u32) -> Result<Vec<Vec<u8>>, ServerError> {
        Ok(Vec::new())
    }

    fn collect_methods_to_compile(&self, _session_id: u32) -> Result<Vec<String>, ServerError> {
        Ok(Vec::new())
    }

    fn collect_profiling_info(
        &self,
        _session_id: u32,
        _methods: &[String],
    ) -> Result<Vec<Vec<u8>>, ServerError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use booster_core::CacheSlot;

    use super::*;

    struct StubCompiler {
        bytes: &'static [u8],
    }

    impl CompilerDriver for StubCompiler {
        fn compile(&self, request: CompileRequest) -> Result<CompileOutcome, ServerError> {
            std::fs::write(&request.output_path, self.bytes)?;
            Ok(CompileOutcome::Success)
        }
    }

    struct StubSource;

    impl CompilationInputSource for StubSource {
        fn collect_classes(&self, _session_id: u32) -> Result<Vec<Vec<u8>>, ServerError> {
            Ok(vec![vec![0xCA, 0xFE]])
        }

        fn collect_methods_to_compile(&self, _session_id: u32) -> Result<Vec<String>, ServerError> {
            Ok(vec!["com.example.Foo.bar".to_string()])
        }

        fn collect_profiling_info(
            &self,
            _session_id: u32,
            methods: &[String],
        ) -> Result<Vec<Vec<u8>>, ServerError> {
            Ok(methods.iter().map(|_| vec![1, 2, 3]).collect())
        }
    }

    #[test]
    fn run_lazy_aot_publishes_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let slot = CacheSlot::new(dir.path().join("cache-x-aot.so"), true);
        slot.try_begin_generation().unwrap();
        let published =
            run_lazy_aot(&slot, 1, false, &StubSource, &StubCompiler { bytes: b"native lib" }).unwrap();
        assert!(published);
        assert!(slot.is_cached());
        assert_eq!(std::fs::read(slot.file_path()).unwrap(), b"native lib");
    }

    #[test]
    fn stub_compiler_driver_skips_when_no_hot_methods() {
        let dir = tempfile::tempdir().unwrap();
        let slot = CacheSlot::new(dir.path().join("cache-x-aot.so"), true);
        slot.try_begin_generation().unwrap();
        struct EmptySource;
        impl CompilationInputSource for EmptySource {
            fn collect_classes(&self, _session_id: u32) -> Result<Vec<Vec<u8>>, ServerError> {
                Ok(vec![])
            }

            fn collect_methods_to_compile(&self, _session_id: u32) -> Result<Vec<String>, ServerError> {
                Ok(vec![])
            }

            fn collect_profiling_info(
                &self,
                _session_id: u32,
                _methods: &[String],
            ) -> Result<Vec<Vec<u8>>, ServerError> {
                Ok(vec![])
            }
        }
        let published = run_lazy_aot(&slot, 1, false, &EmptySource, &StubCompilerDriver).unwrap();
        assert!(!published);
        assert!(!slot.is_cached());
    }
}
