//! On-disk artifact layout and crash-safe writes.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::{FailureClass, JitError};

/// Longest artifact path accepted.
pub const MAX_PATH_LEN: usize = 4096;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn library_extension() -> &'static str {
    if cfg!(target_os = "macos") {
        "dylib"
    } else if cfg!(windows) {
        "dll"
    } else {
        "so"
    }
}

/// The three artifacts of one cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelPaths {
    pub source: PathBuf,
    pub library: PathBuf,
    pub metadata: PathBuf,
}

impl KernelPaths {
    pub fn new(dir: &Path, key: u64) -> Result<Self, JitError> {
        let stem = format!("kernel_{key:016x}");
        let paths = KernelPaths {
            source: dir.join(format!("{stem}.c")),
            library: dir.join(format!("{stem}.{}", library_extension())),
            metadata: dir.join(format!("{stem}.meta")),
        };
        // temp names add a suffix of at most this many bytes
        const TEMP_SUFFIX: usize = 48;
        for p in [&paths.source, &paths.library, &paths.metadata] {
            if p.as_os_str().len() + TEMP_SUFFIX > MAX_PATH_LEN {
                return Err(JitError::build(
                    FailureClass::PathTooLong,
                    format!("artifact path exceeds {MAX_PATH_LEN} bytes"),
                )
                .with_context(p.display().to_string()));
            }
        }
        Ok(paths)
    }
}

/// Create the cache directory if needed.
pub fn ensure_dir(dir: &Path) -> Result<(), JitError> {
    fs::create_dir_all(dir).map_err(|e| {
        JitError::build(
            FailureClass::CacheDirUnavailable,
            format!("cannot create cache directory: {e}"),
        )
        .with_context(dir.display().to_string())
        .with_suggestion("set VECKERN_JIT_CACHE_DIR to a writable directory")
    })?;
    if !dir.is_dir() {
        return Err(JitError::build(
            FailureClass::CacheDirUnavailable,
            "cache path is not a directory",
        )
        .with_context(dir.display().to_string()));
    }
    Ok(())
}

/// A sibling name unique to this process and call.
pub fn temp_path(target: &Path) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = target
        .file_name()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp.{}.{n}", std::process::id()));
    target.with_file_name(name)
}

/// Move `from` over `to`, removing `from` if that fails.
pub fn publish(from: &Path, to: &Path, class: FailureClass) -> Result<(), JitError> {
    fs::rename(from, to).map_err(|e| {
        let _ = fs::remove_file(from);
        JitError::build(class, format!("cannot rename into place: {e}"))
            .with_context(to.display().to_string())
    })
}

/// Write `bytes` to a temporary sibling, then rename it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8], class: FailureClass) -> Result<(), JitError> {
    let tmp = temp_path(path);
    let written = fs::File::create(&tmp).and_then(|mut f| {
        f.write_all(bytes)?;
        f.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(JitError::build(class, format!("cannot write file: {e}"))
            .with_context(path.display().to_string()));
    }
    publish(&tmp, path, class)
}
