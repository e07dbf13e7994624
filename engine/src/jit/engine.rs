//! The per-request build state machine.
//!
//! ```text
//! POS_CACHE_HIT  -> done
//! NEG_CACHE_HIT  -> skipped
//! DISK_CACHE_HIT -> LOAD -> done | LOAD_FAILED
//! MISS -> WRITE_SOURCE -> COMPILE -> WRITE_METADATA -> LOAD -> done
//! ```
//!
//! Every failure edge records its [`FailureClass`] in the negative cache and
//! hands the error back so the caller can fall back to the interpreter.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::warn;
use veckern::{CompilerPref, DType, FpMode, IrProgram, Reserved, fingerprint};

use super::cache::{JitCache, KeyParts};
use super::compiled::{Backend, CodeOwner, LoadedKernel};
use super::config::JitConfig;
use super::disk::{self, KernelPaths};
use super::error::{FailureClass, JitError, JitErrorKind};
use super::loader::load_kernel;
use super::metadata::KernelMetadata;
use super::toolchain::{CcToolchain, Toolchain};
use crate::codegen::{self, CodegenOptions, Generated};

/// Per-request events go to `info` when tracing is on, else `debug`.
macro_rules! jit_event {
    ($trace:expr, $($arg:tt)+) => {
        if $trace {
            tracing::info!(target: "veckern::jit", $($arg)+)
        } else {
            tracing::debug!(target: "veckern::jit", $($arg)+)
        }
    };
}

/// Builds, caches and loads native kernels.
#[derive(Clone)]
pub struct JitEngine {
    config: JitConfig,
    cache: Arc<JitCache>,
    toolchain: Arc<dyn Toolchain>,
}

impl JitEngine {
    /// An engine using the process-wide cache and the configured compiler.
    pub fn new(config: JitConfig) -> Self {
        let toolchain =
            CcToolchain::discover(config.cc.as_deref()).with_flags(config.cflags.clone());
        JitEngine {
            config,
            cache: JitCache::global(),
            toolchain: Arc::new(toolchain),
        }
    }

    pub fn with_cache(mut self, cache: Arc<JitCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_toolchain(mut self, toolchain: Arc<dyn Toolchain>) -> Self {
        self.toolchain = toolchain;
        self
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<JitCache> {
        &self.cache
    }

    pub fn toolchain(&self) -> &dyn Toolchain {
        self.toolchain.as_ref()
    }

    /// The embedded compiler is compiled in and allowed.
    pub fn embedded_available(&self) -> bool {
        self.config.embedded && cfg!(feature = "llvm")
    }

    /// Backend for a kernel, or `None` when nothing can compile it.
    pub fn select_backend(&self, pref: CompilerPref, fp_mode: FpMode) -> Option<Backend> {
        let embedded = self.embedded_available();
        if self.config.force_embedded {
            return embedded.then_some(Backend::Embedded);
        }
        let native = self.toolchain.available();
        match pref {
            CompilerPref::Cc if native => Some(Backend::Native),
            CompilerPref::Cc => (embedded && fp_mode == FpMode::Strict).then_some(Backend::Embedded),
            CompilerPref::Tcc if embedded => Some(Backend::Embedded),
            CompilerPref::Tcc => native.then_some(Backend::Native),
        }
    }

    /// Kernels the JIT skips by design.
    pub fn check_eligible(&self, ir: &IrProgram) -> Result<(), JitError> {
        if !self.config.enabled {
            return Err(JitError::ineligible("JIT disabled by configuration"));
        }
        if ir.params.is_empty() {
            return Err(JitError::ineligible("kernel has no parameters"));
        }
        let options = self.config.codegen_options();
        for (name, _) in &ir.params {
            if let Some(reserved) = Reserved::parse(name) {
                let supplied = if reserved.is_per_dimension() {
                    options.nd_synth
                } else {
                    options.index_vars_synth
                };
                if !supplied {
                    return Err(JitError::ineligible(format!(
                        "'{name}' needs synthesis that is disabled"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Composite key of `ir` compiled for `output` with `backend`.
    pub fn key_for(&self, ir: &IrProgram, output: DType, backend: Option<Backend>) -> u64 {
        let params = ir.param_dtypes();
        let options = self.config.codegen_options();
        KeyParts {
            fingerprint: fingerprint(ir),
            output,
            fp_mode: ir.fp_mode,
            params: &params,
            backend,
            options: &options,
        }
        .key()
    }

    /// Produce a loaded kernel for `ir`, or the reason there is none.
    pub fn build(
        &self,
        ir: &IrProgram,
        output: DType,
        pref: CompilerPref,
    ) -> Result<Arc<LoadedKernel>, JitError> {
        let trace = self.config.trace;
        self.check_eligible(ir)?;

        let backend = self.select_backend(pref, ir.fp_mode);
        let key = self.key_for(ir, output, backend);

        if self.config.cache.positive {
            if let Some(kernel) = self.cache.get(key) {
                jit_event!(trace, kernel = %ir.name, key = format_args!("{key:016x}"), "positive cache hit");
                return Ok(kernel);
            }
        }
        if let Some((entry, left)) = self.cache.blocked(key, &self.config.cache) {
            jit_event!(
                trace,
                kernel = %ir.name,
                key = format_args!("{key:016x}"),
                class = %entry.class,
                failures = entry.failures,
                "negative cache hit"
            );
            return Err(JitError::build(entry.class, "skipped after a recent build failure")
                .with_context(format!("retry in {}ms", left.as_millis())));
        }

        let Some(backend) = backend else {
            let err = JitError::build(FailureClass::NoBackend, "no usable compiler backend")
                .with_suggestion("install a C compiler or enable the embedded backend");
            return Err(self.fail(key, &ir.name, err));
        };
        jit_event!(trace, kernel = %ir.name, key = format_args!("{key:016x}"), %backend, "cache miss");

        let options = self.config.codegen_options();
        let result = match backend {
            Backend::Native => {
                let generated = codegen::generate(ir, output, &options).map_err(|e| {
                    JitError::codegen(e.message).with_context(format!("{}:{}", e.line, e.column))
                })?;
                self.build_native(key, ir, output, &generated, &options)
            }
            Backend::Embedded => self.build_embedded(key, ir, output, &options),
        };

        match result {
            Ok(kernel) => {
                self.cache.clear_failure(key);
                let kernel = Arc::new(kernel);
                if self.config.cache.positive {
                    self.cache.insert(key, Arc::clone(&kernel));
                }
                jit_event!(
                    trace,
                    kernel = %ir.name,
                    key = format_args!("{key:016x}"),
                    %backend,
                    lowering = %kernel.trace().mode,
                    "kernel ready"
                );
                Ok(kernel)
            }
            Err(err) if err.kind == JitErrorKind::Codegen => Err(err),
            Err(err) => Err(self.fail(key, &ir.name, err)),
        }
    }

    fn fail(&self, key: u64, kernel: &str, err: JitError) -> JitError {
        if let Some(class) = err.failure_class() {
            let failures = self.cache.record_failure(key, class);
            warn!(
                target: "veckern::jit",
                kernel,
                key = format_args!("{key:016x}"),
                %class,
                failures,
                error = %err,
                "kernel build failed; falling back to the interpreter"
            );
        }
        err
    }

    fn build_native(
        &self,
        key: u64,
        ir: &IrProgram,
        output: DType,
        generated: &Generated,
        options: &CodegenOptions,
    ) -> Result<LoadedKernel, JitError> {
        let trace = self.config.trace;
        let dir = &self.config.cache_dir;
        disk::ensure_dir(dir)?;
        let paths = KernelPaths::new(dir, key)?;
        let metadata = KernelMetadata {
            key,
            fingerprint: fingerprint(ir),
            output,
            dialect: ir.dialect,
            fp_mode: ir.fp_mode,
            params: ir.param_dtypes(),
            toolchain_hash: self.toolchain.invocation_hash(ir.fp_mode),
        };

        let stored = fs::read(&paths.metadata).ok();
        match &stored {
            Some(bytes) if metadata.matches(bytes) && paths.library.is_file() => {
                jit_event!(trace, kernel = %ir.name, path = %paths.library.display(), "disk cache hit");
                self.cache.note_disk_hit();
                return self.load(&paths.library, key, generated, options);
            }
            Some(_) => {
                jit_event!(trace, kernel = %ir.name, "disk metadata mismatch; rebuilding");
            }
            None => {}
        }

        disk::write_atomic(
            &paths.source,
            generated.source.as_bytes(),
            FailureClass::WriteFailed,
        )?;
        let staged = disk::temp_path(&paths.library);
        self.cache.note_compilation();
        jit_event!(trace, kernel = %ir.name, compiler = self.toolchain.name(), "compiling");
        if let Err(err) = self.toolchain.compile(&paths.source, &staged, ir.fp_mode) {
            let _ = fs::remove_file(&staged);
            return Err(err);
        }
        disk::publish(&staged, &paths.library, FailureClass::CompileFailed)?;
        disk::write_atomic(
            &paths.metadata,
            &metadata.to_bytes(),
            FailureClass::MetadataWriteFailed,
        )?;
        self.load(&paths.library, key, generated, options)
    }

    fn load(
        &self,
        library: &Path,
        key: u64,
        generated: &Generated,
        options: &CodegenOptions,
    ) -> Result<LoadedKernel, JitError> {
        let (library, func) = load_kernel(library, &options.entry_symbol, generated.bridge)?;
        Ok(LoadedKernel {
            func,
            key,
            backend: Backend::Native,
            nd_descriptor: generated.nd_descriptor,
            trace: generated.trace.clone(),
            _owner: CodeOwner::Library(library),
        })
    }

    #[cfg(feature = "llvm")]
    fn build_embedded(
        &self,
        key: u64,
        ir: &IrProgram,
        output: DType,
        options: &CodegenOptions,
    ) -> Result<LoadedKernel, JitError> {
        self.cache.note_compilation();
        super::llvm::compile(key, ir, output, options)
    }

    #[cfg(not(feature = "llvm"))]
    fn build_embedded(
        &self,
        _key: u64,
        _ir: &IrProgram,
        _output: DType,
        _options: &CodegenOptions,
    ) -> Result<LoadedKernel, JitError> {
        Err(JitError::build(
            FailureClass::NoBackend,
            "embedded backend not compiled in",
        )
        .with_suggestion("rebuild with the `llvm` feature"))
    }
}

impl std::fmt::Debug for JitEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitEngine")
            .field("config", &self.config)
            .field("toolchain", &self.toolchain.name())
            .finish()
    }
}
