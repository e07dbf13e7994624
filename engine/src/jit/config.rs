//! JIT configuration, from code or from `VECKERN_JIT*` environment variables.

use std::env;
use std::path::PathBuf;

use super::cache::CacheConfig;
use crate::codegen::CodegenOptions;

/// Subdirectory of the system temp dir holding persisted kernels.
pub const CACHE_SUBDIR: &str = "veckern-jit";

/// Runtime JIT settings.
#[derive(Clone, Debug)]
pub struct JitConfig {
    /// Master switch; when off every kernel is interpreted
    pub enabled: bool,
    /// The embedded in-memory compiler may be used
    pub embedded: bool,
    /// Use the embedded compiler even when a native one is available
    pub force_embedded: bool,
    /// Log per-request cache events at `info` instead of `debug`
    pub trace: bool,
    /// Native compiler executable; discovered on `PATH` when unset
    pub cc: Option<String>,
    /// Extra flags appended to every native compile
    pub cflags: Vec<String>,
    pub math_bridge: bool,
    pub vec_math: bool,
    pub index_vars_synth: bool,
    pub nd_synth: bool,
    /// Directory for `kernel_<key>.*` artifacts
    pub cache_dir: PathBuf,
    pub cache: CacheConfig,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            enabled: true,
            embedded: true,
            force_embedded: false,
            trace: false,
            cc: None,
            cflags: Vec::new(),
            math_bridge: true,
            vec_math: true,
            index_vars_synth: true,
            nd_synth: true,
            cache_dir: env::temp_dir().join(CACHE_SUBDIR),
            cache: CacheConfig::default(),
        }
    }
}

fn flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "off" | "no"
    )
}

impl JitConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overridden by `lookup`, which maps variable names to values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = JitConfig::default();
        let set = |target: &mut bool, key: &str| {
            if let Some(v) = lookup(key) {
                *target = flag(&v);
            }
        };
        set(&mut config.enabled, "VECKERN_JIT");
        set(&mut config.cache.positive, "VECKERN_JIT_POS_CACHE");
        set(&mut config.embedded, "VECKERN_JIT_EMBEDDED");
        set(&mut config.force_embedded, "VECKERN_JIT_FORCE_EMBEDDED");
        set(&mut config.trace, "VECKERN_JIT_TRACE");
        set(&mut config.math_bridge, "VECKERN_JIT_MATH_BRIDGE");
        set(&mut config.vec_math, "VECKERN_JIT_VEC_MATH");
        set(&mut config.index_vars_synth, "VECKERN_JIT_INDEX_VARS_SYNTH");
        set(&mut config.nd_synth, "VECKERN_JIT_ND_SYNTH");

        config.cc = lookup("VECKERN_JIT_CC")
            .or_else(|| lookup("CC"))
            .filter(|cc| !cc.trim().is_empty());
        if let Some(flags) = lookup("VECKERN_JIT_CFLAGS") {
            config.cflags = flags.split_whitespace().map(str::to_string).collect();
        }
        if let Some(dir) = lookup("VECKERN_JIT_CACHE_DIR").filter(|d| !d.is_empty()) {
            config.cache_dir = PathBuf::from(dir);
        }
        config
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_embedded(mut self, embedded: bool) -> Self {
        self.embedded = embedded;
        self
    }

    pub fn with_force_embedded(mut self, force: bool) -> Self {
        self.force_embedded = force;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_cc(mut self, cc: impl Into<String>) -> Self {
        self.cc = Some(cc.into());
        self
    }

    pub fn with_cflags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cflags = flags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_math_bridge(mut self, on: bool) -> Self {
        self.math_bridge = on;
        self
    }

    pub fn with_vec_math(mut self, on: bool) -> Self {
        self.vec_math = on;
        self
    }

    pub fn with_index_vars_synth(mut self, on: bool) -> Self {
        self.index_vars_synth = on;
        self
    }

    pub fn with_nd_synth(mut self, on: bool) -> Self {
        self.nd_synth = on;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Code generator options implied by this configuration.
    pub fn codegen_options(&self) -> CodegenOptions {
        CodegenOptions {
            math_bridge: self.math_bridge,
            vec_math: self.vec_math,
            index_vars_synth: self.index_vars_synth,
            nd_synth: self.nd_synth,
            ..CodegenOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: FxHashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = JitConfig::from_lookup(|_| None);
        assert!(config.enabled);
        assert!(config.cache.positive);
        assert!(config.cc.is_none());
        assert!(config.cache_dir.ends_with(CACHE_SUBDIR));
    }

    #[test]
    fn test_env_overrides() {
        let config = JitConfig::from_lookup(lookup(&[
            ("VECKERN_JIT", "0"),
            ("VECKERN_JIT_POS_CACHE", "off"),
            ("VECKERN_JIT_VEC_MATH", "false"),
            ("VECKERN_JIT_CFLAGS", "-O3  -march=native"),
            ("VECKERN_JIT_CACHE_DIR", "/var/tmp/kernels"),
        ]));
        assert!(!config.enabled);
        assert!(!config.cache.positive);
        assert!(!config.vec_math);
        assert!(config.math_bridge);
        assert_eq!(config.cflags, vec!["-O3", "-march=native"]);
        assert_eq!(config.cache_dir, PathBuf::from("/var/tmp/kernels"));
    }

    #[test]
    fn test_cc_falls_back_to_cc_variable() {
        let config = JitConfig::from_lookup(lookup(&[("CC", "clang")]));
        assert_eq!(config.cc.as_deref(), Some("clang"));
        let config = JitConfig::from_lookup(lookup(&[("CC", "clang"), ("VECKERN_JIT_CC", "gcc-13")]));
        assert_eq!(config.cc.as_deref(), Some("gcc-13"));
    }

    #[test]
    fn test_codegen_options() {
        let options = JitConfig::default()
            .with_nd_synth(false)
            .with_math_bridge(false)
            .codegen_options();
        assert!(!options.nd_synth);
        assert!(!options.math_bridge);
        assert!(options.index_vars_synth);
    }
}
