//! Runtime configuration for the JIT context and its profiler.
//!
//! Defaults match the budgets a single inference process typically needs.
//! `JitConfig::from_env()` layers `NEURAL_JIT_*` environment overrides on
//! top, and the whole struct round-trips through serde for config files.

use serde::{Deserialize, Serialize};

/// Hotspot detection thresholds and table sizing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Minimum calls before a signature may become a JIT candidate.
    pub threshold_calls: u64,
    /// Minimum accumulated cycles before a signature may become a candidate.
    pub threshold_cycles: u64,
    /// Minimum share of all profiled cycles for `jit_candidates()` listings.
    pub threshold_time_share: f64,
    /// Number of 8-way buckets. Rounded up to a power of two.
    pub bucket_count: usize,
    /// Profiling starts enabled.
    pub enabled: bool,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            threshold_calls: 100,
            threshold_cycles: 1_000_000,
            threshold_time_share: 0.01,
            bucket_count: 16384,
            enabled: true,
        }
    }
}

/// Budgets for one `NeuralJit` context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Size of the executable pool mapped at creation.
    pub exec_memory_bytes: usize,
    /// Total kernel slots in the code cache.
    pub cache_capacity: usize,
    /// Consecutive transient compile failures before a signature is parked
    /// on the fallback path.
    pub max_compile_failures: u32,
    pub profiler: ProfilerConfig,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            exec_memory_bytes: 16 * 1024 * 1024,
            cache_capacity: 1024,
            max_compile_failures: 3,
            profiler: ProfilerConfig::default(),
        }
    }
}

impl JitConfig {
    /// Defaults plus any `NEURAL_JIT_*` environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env(|key| std::env::var(key).ok());
        cfg
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>, slot: &mut T) {
            let Some(raw) = raw else { return };
            match raw.trim().parse() {
                Ok(v) => *slot = v,
                Err(_) => log::warn!("ignoring {key}={raw:?}: not a valid value"),
            }
        }

        const EXEC: &str = "NEURAL_JIT_EXEC_MEMORY";
        const CACHE: &str = "NEURAL_JIT_CACHE_CAPACITY";
        const FAILS: &str = "NEURAL_JIT_MAX_COMPILE_FAILURES";
        const CALLS: &str = "NEURAL_JIT_THRESHOLD_CALLS";
        const CYCLES: &str = "NEURAL_JIT_THRESHOLD_CYCLES";
        const SHARE: &str = "NEURAL_JIT_THRESHOLD_SHARE";
        const PROFILE: &str = "NEURAL_JIT_PROFILE";

        parse(EXEC, lookup(EXEC), &mut self.exec_memory_bytes);
        parse(CACHE, lookup(CACHE), &mut self.cache_capacity);
        parse(FAILS, lookup(FAILS), &mut self.max_compile_failures);
        parse(CALLS, lookup(CALLS), &mut self.profiler.threshold_calls);
        parse(CYCLES, lookup(CYCLES), &mut self.profiler.threshold_cycles);
        parse(SHARE, lookup(SHARE), &mut self.profiler.threshold_time_share);
        parse(PROFILE, lookup(PROFILE), &mut self.profiler.enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = JitConfig::default();
        assert_eq!(cfg.profiler.threshold_calls, 100);
        assert_eq!(cfg.profiler.threshold_cycles, 1_000_000);
        assert_eq!(cfg.cache_capacity, 1024);
        assert!(cfg.profiler.enabled);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("NEURAL_JIT_THRESHOLD_CALLS", "7"),
            ("NEURAL_JIT_EXEC_MEMORY", "4096"),
            ("NEURAL_JIT_PROFILE", "false"),
            ("NEURAL_JIT_THRESHOLD_CYCLES", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut cfg = JitConfig::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.profiler.threshold_calls, 7);
        assert_eq!(cfg.exec_memory_bytes, 4096);
        assert!(!cfg.profiler.enabled);
        // Unparseable values leave the default in place.
        assert_eq!(cfg.profiler.threshold_cycles, 1_000_000);
    }

    #[test]
    fn test_json_partial() {
        let cfg = JitConfig::from_json_str(
            r#"{ "cache_capacity": 16, "profiler": { "threshold_calls": 5 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.cache_capacity, 16);
        assert_eq!(cfg.profiler.threshold_calls, 5);
        assert_eq!(cfg.profiler.bucket_count, 16384);
        assert_eq!(cfg.exec_memory_bytes, JitConfig::default().exec_memory_bytes);
    }
}
