//! Native compiler abstraction.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;
use veckern::FpMode;
use veckern::ir::Fnv1a;

use super::error::{FailureClass, JitError};

/// A C compiler that turns one translation unit into a shared library.
pub trait Toolchain: Send + Sync {
    /// Name for diagnostics.
    fn name(&self) -> &str;

    /// The compiler can be run at all.
    fn available(&self) -> bool;

    /// Hash of the full command line used for `fp_mode`, stored in metadata.
    fn invocation_hash(&self, fp_mode: FpMode) -> u64;

    fn compile(&self, source: &Path, library: &Path, fp_mode: FpMode) -> Result<(), JitError>;
}

/// Subprocess-backed `cc`-compatible compiler.
#[derive(Debug, Clone)]
pub struct CcToolchain {
    program: String,
    /// Configured explicitly rather than discovered; trusted without a `PATH` probe
    explicit: bool,
    extra_flags: Vec<String>,
}

const DEFAULT_COMPILERS: [&str; 3] = ["cc", "gcc", "clang"];

impl CcToolchain {
    /// Use `program`, trusting it exists.
    pub fn new(program: impl Into<String>) -> Self {
        CcToolchain {
            program: program.into(),
            explicit: true,
            extra_flags: Vec::new(),
        }
    }

    /// The configured compiler, or the first of `cc`, `gcc`, `clang` on `PATH`.
    pub fn discover(configured: Option<&str>) -> Self {
        if let Some(program) = configured {
            return Self::new(program);
        }
        let program = DEFAULT_COMPILERS
            .iter()
            .find(|c| find_in_path(c).is_some())
            .copied()
            .unwrap_or("cc");
        CcToolchain {
            program: program.to_string(),
            explicit: false,
            extra_flags: Vec::new(),
        }
    }

    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.extra_flags = flags;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments preceding the output and source paths.
    pub fn flags(&self, fp_mode: FpMode) -> Vec<String> {
        let mut flags: Vec<String> = ["-std=c99", "-O2", "-fPIC", "-shared", "-fwrapv"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let fp: &[&str] = match fp_mode {
            FpMode::Strict => &["-fno-fast-math", "-ffp-contract=off"],
            FpMode::Contract => &["-fno-fast-math", "-ffp-contract=fast"],
            FpMode::Fast => &["-ffast-math"],
        };
        flags.extend(fp.iter().map(|s| s.to_string()));
        flags.extend(self.extra_flags.iter().cloned());
        flags
    }

    fn link_flags() -> &'static [&'static str] {
        if cfg!(target_os = "macos") { &[] } else { &["-lm"] }
    }
}

impl Toolchain for CcToolchain {
    fn name(&self) -> &str {
        &self.program
    }

    fn available(&self) -> bool {
        self.explicit || find_in_path(&self.program).is_some()
    }

    fn invocation_hash(&self, fp_mode: FpMode) -> u64 {
        let mut h = Fnv1a::new();
        h.write_str(&self.program);
        for flag in self.flags(fp_mode) {
            h.write_str(&flag);
        }
        for flag in Self::link_flags() {
            h.write_str(flag);
        }
        h.finish()
    }

    fn compile(&self, source: &Path, library: &Path, fp_mode: FpMode) -> Result<(), JitError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.flags(fp_mode))
            .arg("-o")
            .arg(library)
            .arg(source)
            .args(Self::link_flags());
        debug!(target: "veckern::jit", command = ?cmd, "invoking compiler");

        let output = cmd.output().map_err(|e| {
            JitError::build(
                FailureClass::CompileFailed,
                format!("could not run compiler '{}': {e}", self.program),
            )
            .with_suggestion("set VECKERN_JIT_CC or CC to an installed C compiler")
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let mut err = JitError::build(
                FailureClass::CompileFailed,
                format!("compiler '{}' exited with {}", self.program, output.status),
            );
            if !stderr.is_empty() {
                err = err.with_context(stderr);
            }
            return Err(err);
        }
        Ok(())
    }
}

/// Resolve `program` against `PATH`; paths with a separator are checked as given.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .flat_map(|dir| {
            let plain = dir.join(program);
            let exe = dir.join(format!("{program}{}", env::consts::EXE_SUFFIX));
            [plain, exe]
        })
        .find(|p| p.is_file())
}
