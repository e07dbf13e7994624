//! In-process kernel caches and the composite cache key.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use veckern::ir::Fnv1a;
use veckern::{DType, FpMode};

use super::compiled::{Backend, LoadedKernel};
use super::error::FailureClass;
use crate::codegen::{CODEGEN_VERSION, CodegenOptions};

/// Configuration for kernel caching.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Keep loaded kernels in the in-process table
    pub positive: bool,
    /// Failures tolerated with the short cooldown before the long one applies
    pub retry_budget: u32,
    pub short_cooldown: Duration,
    pub long_cooldown: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            positive: true,
            retry_budget: 3,
            short_cooldown: Duration::from_secs(10),
            long_cooldown: Duration::from_secs(300),
        }
    }
}

/// Statistics about kernel cache usage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Requests served from the in-process table
    pub hits: usize,
    /// Requests that missed the in-process table
    pub misses: usize,
    /// Kernels loaded from validated disk artifacts
    pub disk_hits: usize,
    /// Backend compilations run
    pub compilations: usize,
    /// Requests skipped because of a recent failure
    pub negative_hits: usize,
    /// Build or load failures recorded
    pub failures: usize,
}

/// A recent failure for one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NegativeEntry {
    pub last_failure: Instant,
    pub failures: u32,
    pub class: FailureClass,
}

impl NegativeEntry {
    pub fn cooldown(&self, config: &CacheConfig) -> Duration {
        if self.failures < config.retry_budget {
            config.short_cooldown
        } else {
            config.long_cooldown
        }
    }

    /// Time left before a retry is allowed, if any.
    pub fn remaining(&self, config: &CacheConfig, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.last_failure);
        self.cooldown(config)
            .checked_sub(elapsed)
            .filter(|left| !left.is_zero())
    }
}

/// Positive and negative kernel caches shared by every engine that holds them.
///
/// Loaded kernels are never evicted: their code stays mapped for as long as
/// the cache lives.
#[derive(Default)]
pub struct JitCache {
    positive: Mutex<FxHashMap<u64, Arc<LoadedKernel>>>,
    negative: Mutex<FxHashMap<u64, NegativeEntry>>,
    stats: Mutex<CacheStats>,
}

static GLOBAL: Lazy<Arc<JitCache>> = Lazy::new(|| Arc::new(JitCache::new()));

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JitCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache.
    pub fn global() -> Arc<JitCache> {
        Arc::clone(&GLOBAL)
    }

    pub fn get(&self, key: u64) -> Option<Arc<LoadedKernel>> {
        let found = lock(&self.positive).get(&key).cloned();
        let mut stats = lock(&self.stats);
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        found
    }

    pub fn insert(&self, key: u64, kernel: Arc<LoadedKernel>) {
        lock(&self.positive).insert(key, kernel);
    }

    /// The failure blocking `key`, while its cooldown lasts.
    pub fn blocked(&self, key: u64, config: &CacheConfig) -> Option<(NegativeEntry, Duration)> {
        let negative = lock(&self.negative);
        let entry = negative.get(&key)?;
        let left = entry.remaining(config, Instant::now())?;
        lock(&self.stats).negative_hits += 1;
        Some((entry.clone(), left))
    }

    /// Record a failure, returning the updated failure count.
    pub fn record_failure(&self, key: u64, class: FailureClass) -> u32 {
        let mut negative = lock(&self.negative);
        let entry = negative.entry(key).or_insert(NegativeEntry {
            last_failure: Instant::now(),
            failures: 0,
            class,
        });
        entry.last_failure = Instant::now();
        entry.failures = entry.failures.saturating_add(1);
        entry.class = class;
        lock(&self.stats).failures += 1;
        entry.failures
    }

    pub fn clear_failure(&self, key: u64) {
        lock(&self.negative).remove(&key);
    }

    pub fn negative_entry(&self, key: u64) -> Option<NegativeEntry> {
        lock(&self.negative).get(&key).cloned()
    }

    pub(crate) fn note_disk_hit(&self) {
        lock(&self.stats).disk_hits += 1;
    }

    pub(crate) fn note_compilation(&self) {
        lock(&self.stats).compilations += 1;
    }

    pub fn stats(&self) -> CacheStats {
        lock(&self.stats).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.positive).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop both tables. Kernels still referenced elsewhere stay loaded.
    pub fn clear(&self) {
        lock(&self.positive).clear();
        lock(&self.negative).clear();
    }
}

// ============================================================================
// Cache Key
// ============================================================================

/// Platform tag folded into keys and metadata.
pub fn target_tag() -> String {
    format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
}

/// Everything that distinguishes one built kernel from another.
#[derive(Clone, Debug)]
pub struct KeyParts<'a> {
    pub fingerprint: u64,
    pub output: DType,
    pub fp_mode: FpMode,
    pub params: &'a [DType],
    pub backend: Option<Backend>,
    pub options: &'a CodegenOptions,
}

impl KeyParts<'_> {
    pub fn key(&self) -> u64 {
        let mut h = Fnv1a::new();
        h.write_u64(self.fingerprint);
        h.write_u8(self.output.code());
        h.write_u8(self.fp_mode.code());
        h.write_u64(self.params.len() as u64);
        for p in self.params {
            h.write_u8(p.code());
        }
        h.write_u8(std::mem::size_of::<usize>() as u8);
        h.write_u64(u64::from(CODEGEN_VERSION));
        h.write_str(&target_tag());
        h.write_u8(self.backend.map_or(0, Backend::code));
        let bits = [
            self.options.math_bridge,
            self.options.vec_math,
            self.options.index_vars_synth,
            self.options.nd_synth,
        ]
        .iter()
        .enumerate()
        .fold(0u8, |acc, (i, on)| acc | (u8::from(*on) << i));
        h.write_u8(bits);
        h.write_str(&self.options.entry_symbol);
        h.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts<'a>(params: &'a [DType], options: &'a CodegenOptions) -> KeyParts<'a> {
        KeyParts {
            fingerprint: 0x1234,
            output: DType::F64,
            fp_mode: FpMode::Strict,
            params,
            backend: Some(Backend::Native),
            options,
        }
    }

    #[test]
    fn test_key_is_stable() {
        let options = CodegenOptions::default();
        let a = parts(&[DType::F64], &options).key();
        let b = parts(&[DType::F64], &options).key();
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_covers_every_part() {
        let options = CodegenOptions::default();
        let base = parts(&[DType::F64], &options).key();

        let mut p = parts(&[DType::F64], &options);
        p.fp_mode = FpMode::Fast;
        assert_ne!(p.key(), base);

        let mut p = parts(&[DType::F64], &options);
        p.output = DType::F32;
        assert_ne!(p.key(), base);

        assert_ne!(parts(&[DType::F32], &options).key(), base);
        assert_ne!(parts(&[DType::F64, DType::F64], &options).key(), base);

        let mut p = parts(&[DType::F64], &options);
        p.backend = Some(Backend::Embedded);
        assert_ne!(p.key(), base);

        let no_vec = CodegenOptions {
            vec_math: false,
            ..CodegenOptions::default()
        };
        assert_ne!(parts(&[DType::F64], &no_vec).key(), base);
    }

    #[test]
    fn test_negative_cooldown_escalates() {
        let config = CacheConfig {
            retry_budget: 2,
            short_cooldown: Duration::from_secs(1),
            long_cooldown: Duration::from_secs(60),
            ..CacheConfig::default()
        };
        let cache = JitCache::new();
        assert_eq!(cache.record_failure(7, FailureClass::CompileFailed), 1);
        let entry = cache.negative_entry(7).unwrap();
        assert_eq!(entry.cooldown(&config), Duration::from_secs(1));
        assert_eq!(cache.record_failure(7, FailureClass::LoadFailed), 2);
        let entry = cache.negative_entry(7).unwrap();
        assert_eq!(entry.cooldown(&config), Duration::from_secs(60));
        assert_eq!(entry.class, FailureClass::LoadFailed);
        assert!(cache.blocked(7, &config).is_some());
        cache.clear_failure(7);
        assert!(cache.blocked(7, &config).is_none());
    }

    #[test]
    fn test_zero_cooldown_never_blocks() {
        let config = CacheConfig {
            short_cooldown: Duration::ZERO,
            ..CacheConfig::default()
        };
        let cache = JitCache::new();
        cache.record_failure(1, FailureClass::WriteFailed);
        assert!(cache.blocked(1, &config).is_none());
        assert_eq!(cache.stats().failures, 1);
    }
}
