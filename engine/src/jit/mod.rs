//! Kernel compilation, caching and loading.
//!
//! ## Backends
//!
//! - `Native`: C source from [`crate::codegen`] built by a system `cc` into a
//!   shared library under the cache directory, then loaded with `libloading`
//! - `Embedded`: typed IR lowered straight to LLVM in memory (feature `llvm`)
//!
//! ## Caching
//!
//! Every build request is keyed by the IR fingerprint, output dtype, fp mode,
//! parameter dtypes, backend, codegen options and target. Three layers sit in
//! front of the compiler:
//! - a positive cache of loaded kernels shared across the process
//! - a negative cache of recent failures with a retry budget and cooldowns
//! - the disk cache, where a library is reused only if its metadata record
//!   matches byte for byte
//!
//! ## Failure classes
//!
//! Build failures carry a [`FailureClass`]; the negative cache records it and
//! the kernel falls back to the interpreter.

mod cache;
mod compiled;
mod config;
mod disk;
mod engine;
mod error;
#[cfg(feature = "llvm")]
mod llvm;
mod loader;
mod metadata;
mod toolchain;

pub use cache::{CacheConfig, CacheStats, JitCache, NegativeEntry, target_tag};
pub use compiled::{Backend, KernelFn, LoadedKernel};
pub use config::{CACHE_SUBDIR, JitConfig};
pub use disk::{KernelPaths, MAX_PATH_LEN, library_extension};
pub use engine::JitEngine;
pub use error::{FailureClass, JitError, JitErrorKind};
pub use metadata::{META_FORMAT_VERSION, META_MAGIC, KernelMetadata};
pub use toolchain::{CcToolchain, Toolchain, find_in_path};
