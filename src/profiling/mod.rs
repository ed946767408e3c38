//! Per-signature call profiler.
//!
//! Every high-level call is keyed by its [`KernelSignature`] and counted in
//! a bucketed hash table (power-of-two buckets, 8 ways each). A signature
//! becomes a JIT candidate once it has been called at least
//! `threshold_calls` times *and* has spent at least `threshold_cycles` in
//! total.
//!
//! ```rust,no_run
//! use neural_jit::config::ProfilerConfig;
//! use neural_jit::profiling::{ExecPath, NeuralProfiler};
//! use neural_jit::types::KernelSignature;
//!
//! let mut profiler = NeuralProfiler::new(ProfilerConfig::default());
//! let sig = KernelSignature::gemm(64, 64, 64);
//!
//! let ctx = profiler.begin(&sig);
//! // ... run kernel ...
//! profiler.end(ctx, ExecPath::Fallback);
//!
//! profiler.analyze_hotspots();
//! profiler.print_hotspots(10);
//! profiler.export("/tmp/profile.csv").unwrap();
//! ```

pub mod report;
pub mod timer;

use serde::Serialize;

use crate::config::ProfilerConfig;
use crate::types::{KernelSignature, OpKind};
use timer::CycleTimer;

/// Entries per bucket.
pub const BUCKET_WAYS: usize = 8;
/// Length of the hotspot list.
pub const MAX_HOTSPOTS: usize = 32;

/// Which implementation served a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecPath {
    Fallback,
    Compiled,
}

/// Everything the profiler knows about one signature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProfileEntry {
    pub signature: KernelSignature,
    pub hash: u64,
    pub call_count: u64,
    /// Calls that contributed a cycle sample.
    pub timed_calls: u64,
    pub total_cycles: u64,
    pub min_cycles: u64,
    pub max_cycles: u64,
    pub last_cycles: u64,
    pub fallback_calls: u64,
    pub fallback_cycles: u64,
    pub compiled_calls: u64,
    pub compiled_cycles: u64,
    pub jit_candidate: bool,
    pub jit_compiled: bool,
    /// Profiler tick of the last call; bucket eviction picks the oldest.
    pub last_seen: u64,
}

impl ProfileEntry {
    fn new(signature: KernelSignature, hash: u64, tick: u64) -> Self {
        Self {
            signature,
            hash,
            call_count: 0,
            timed_calls: 0,
            total_cycles: 0,
            min_cycles: 0,
            max_cycles: 0,
            last_cycles: 0,
            fallback_calls: 0,
            fallback_cycles: 0,
            compiled_calls: 0,
            compiled_cycles: 0,
            jit_candidate: false,
            jit_compiled: false,
            last_seen: tick,
        }
    }

    pub fn avg_cycles(&self) -> f64 {
        if self.timed_calls == 0 {
            0.0
        } else {
            self.total_cycles as f64 / self.timed_calls as f64
        }
    }

    /// Average cycles per output element (per multiply-add for GEMM).
    pub fn cycles_per_element(&self) -> f64 {
        match self.signature.work_elements() {
            0 => 0.0,
            w => self.avg_cycles() / w as f64,
        }
    }

    /// Fallback average ÷ compiled average, once both paths have run.
    pub fn speedup(&self) -> Option<f64> {
        if self.fallback_calls == 0 || self.compiled_calls == 0 || self.compiled_cycles == 0 {
            return None;
        }
        let fallback = self.fallback_cycles as f64 / self.fallback_calls as f64;
        let compiled = self.compiled_cycles as f64 / self.compiled_calls as f64;
        Some(fallback / compiled)
    }

    fn add_sample(&mut self, cycles: u64, path: Option<ExecPath>) {
        if self.timed_calls == 0 || cycles < self.min_cycles {
            self.min_cycles = cycles;
        }
        self.max_cycles = self.max_cycles.max(cycles);
        self.last_cycles = cycles;
        self.timed_calls += 1;
        self.total_cycles = self.total_cycles.saturating_add(cycles);
        match path {
            Some(ExecPath::Fallback) => {
                self.fallback_calls += 1;
                self.fallback_cycles = self.fallback_cycles.saturating_add(cycles);
            }
            Some(ExecPath::Compiled) => {
                self.compiled_calls += 1;
                self.compiled_cycles = self.compiled_cycles.saturating_add(cycles);
            }
            None => {}
        }
    }

    /// Promote when both thresholds are met. Returns true on the promoting call.
    fn check_candidate(&mut self, config: &ProfilerConfig) -> bool {
        if self.jit_candidate {
            return false;
        }
        if self.call_count >= config.threshold_calls && self.total_cycles >= config.threshold_cycles {
            self.jit_candidate = true;
            return true;
        }
        false
    }
}

/// Per-operation aggregates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OpStats {
    pub calls: u64,
    pub cycles: u64,
    pub candidates: u64,
    pub compiled: u64,
}

/// Token returned by [`NeuralProfiler::begin`], consumed by `end`.
#[derive(Debug)]
#[must_use = "pass the context to NeuralProfiler::end"]
pub struct ProfileContext {
    signature: KernelSignature,
    timer: Option<CycleTimer>,
    candidate: bool,
}

impl ProfileContext {
    pub fn signature(&self) -> &KernelSignature {
        &self.signature
    }

    /// Whether the signature was a JIT candidate after this call was counted.
    pub fn is_candidate(&self) -> bool {
        self.candidate
    }

    /// False when the profiler was disabled at `begin`: the call was not counted.
    pub fn is_recorded(&self) -> bool {
        self.timer.is_some()
    }

    /// Restart the timer, excluding work done since `begin` from the sample.
    pub fn restart(&mut self) {
        if self.timer.is_some() {
            self.timer = Some(CycleTimer::start());
        }
    }
}

pub struct NeuralProfiler {
    config: ProfilerConfig,
    buckets: Vec<Vec<ProfileEntry>>,
    mask: usize,
    tick: u64,
    op_stats: [OpStats; OpKind::COUNT],
    hotspots: Vec<ProfileEntry>,
    total_cycles: u64,
    entries_evicted: u64,
    /// Signatures dropped from full buckets since the last `take_dropped`.
    dropped: Vec<KernelSignature>,
}

/// Dropped signatures kept for the owner; older drops beyond this are only counted.
const DROPPED_BACKLOG: usize = 1024;

impl NeuralProfiler {
    pub fn new(config: ProfilerConfig) -> Self {
        let bucket_count = config.bucket_count.max(1).next_power_of_two();
        let mut buckets = Vec::with_capacity(bucket_count);
        buckets.resize_with(bucket_count, Vec::new);
        Self {
            config,
            buckets,
            mask: bucket_count - 1,
            tick: 0,
            op_stats: [OpStats::default(); OpKind::COUNT],
            hotspots: Vec::new(),
            total_cycles: 0,
            entries_evicted: 0,
            dropped: Vec::new(),
        }
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// Change the promotion thresholds. Already promoted entries stay promoted.
    pub fn set_thresholds(&mut self, calls: u64, cycles: u64) {
        self.config.threshold_calls = calls;
        self.config.threshold_cycles = cycles;
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn enable(&mut self) {
        self.config.enabled = true;
    }

    pub fn disable(&mut self) {
        self.config.enabled = false;
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Entries dropped from full buckets.
    pub fn entries_evicted(&self) -> u64 {
        self.entries_evicted
    }

    /// Signatures whose entries were dropped from full buckets since the
    /// last call, oldest first.
    pub fn take_dropped(&mut self) -> Vec<KernelSignature> {
        std::mem::take(&mut self.dropped)
    }

    /// Count a call to `sig` and start timing it.
    pub fn begin(&mut self, sig: &KernelSignature) -> ProfileContext {
        if !self.config.enabled {
            return ProfileContext { signature: *sig, timer: None, candidate: false };
        }
        let candidate = self.count_call(sig);
        ProfileContext { signature: *sig, timer: Some(CycleTimer::start()), candidate }
    }

    /// Stop timing and record the sample under `path`. Returns the cycles
    /// measured (0 if profiling was disabled at `begin`).
    pub fn end(&mut self, ctx: ProfileContext, path: ExecPath) -> u64 {
        let Some(timer) = ctx.timer else {
            return 0;
        };
        let cycles = timer.elapsed();
        self.add_sample(&ctx.signature, cycles, Some(path));
        cycles
    }

    /// Record an externally measured call. Returns whether `sig` is a
    /// candidate afterwards.
    pub fn record(&mut self, sig: &KernelSignature, cycles: u64) -> bool {
        if !self.config.enabled {
            return false;
        }
        self.count_call(sig);
        self.add_sample(sig, cycles, None);
        self.entry(sig).is_some_and(|e| e.jit_candidate)
    }

    fn count_call(&mut self, sig: &KernelSignature) -> bool {
        self.tick += 1;
        self.op_stats[sig.op.index()].calls += 1;
        let config = self.config;
        let entry = self.slot(sig);
        entry.call_count += 1;
        let promoted = entry.check_candidate(&config);
        let candidate = entry.jit_candidate;
        if promoted {
            self.on_promoted(sig);
        }
        candidate
    }

    fn add_sample(&mut self, sig: &KernelSignature, cycles: u64, path: Option<ExecPath>) {
        self.tick += 1;
        self.total_cycles = self.total_cycles.saturating_add(cycles);
        let stats = &mut self.op_stats[sig.op.index()];
        stats.cycles = stats.cycles.saturating_add(cycles);
        let config = self.config;
        let entry = self.slot(sig);
        entry.add_sample(cycles, path);
        if entry.check_candidate(&config) {
            self.on_promoted(sig);
        }
    }

    fn on_promoted(&mut self, sig: &KernelSignature) {
        self.op_stats[sig.op.index()].candidates += 1;
        log::debug!("profiler: {sig} is a JIT candidate");
    }

    /// The entry for `sig`, inserted if absent. A full bucket drops its least
    /// recently seen entry first.
    fn slot(&mut self, sig: &KernelSignature) -> &mut ProfileEntry {
        let hash = sig.hash64();
        let tick = self.tick;
        let bucket = &mut self.buckets[hash as usize & self.mask];
        if let Some(i) = bucket.iter().position(|e| e.signature == *sig) {
            bucket[i].last_seen = tick;
            return &mut bucket[i];
        }
        if bucket.len() >= BUCKET_WAYS {
            let victim = bucket
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_seen)
                .map_or(0, |(i, _)| i);
            let old = bucket.swap_remove(victim);
            self.entries_evicted += 1;
            if self.dropped.len() < DROPPED_BACKLOG {
                self.dropped.push(old.signature);
            }
            log::debug!("profiler: bucket full, dropped {} ({} calls)", old.signature, old.call_count);
        }
        bucket.push(ProfileEntry::new(*sig, hash, tick));
        let last = bucket.len() - 1;
        &mut bucket[last]
    }

    fn find_mut(&mut self, sig: &KernelSignature) -> Option<&mut ProfileEntry> {
        let bucket = &mut self.buckets[sig.hash64() as usize & self.mask];
        bucket.iter_mut().find(|e| e.signature == *sig)
    }

    pub fn entry(&self, sig: &KernelSignature) -> Option<&ProfileEntry> {
        self.buckets[sig.hash64() as usize & self.mask]
            .iter()
            .find(|e| e.signature == *sig)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ProfileEntry> {
        self.buckets.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    /// Note that a kernel for `sig` is now resident.
    pub fn mark_compiled(&mut self, sig: &KernelSignature) {
        let Some(entry) = self.find_mut(sig) else {
            return;
        };
        if !entry.jit_compiled {
            entry.jit_compiled = true;
            self.op_stats[sig.op.index()].compiled += 1;
        }
    }

    /// Note that the kernel for `sig` left the cache.
    pub fn mark_evicted(&mut self, sig: &KernelSignature) {
        if let Some(entry) = self.find_mut(sig) {
            entry.jit_compiled = false;
        }
    }

    /// Share of all profiled cycles spent in `entry`.
    pub fn time_share(&self, entry: &ProfileEntry) -> f64 {
        if self.total_cycles == 0 {
            0.0
        } else {
            entry.total_cycles as f64 / self.total_cycles as f64
        }
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Uncompiled candidates holding at least the minimum time share,
    /// hottest first.
    pub fn jit_candidates(&self) -> Vec<ProfileEntry> {
        let mut out: Vec<ProfileEntry> = self
            .entries()
            .filter(|e| e.jit_candidate && !e.jit_compiled)
            .filter(|e| self.time_share(e) >= self.config.threshold_time_share)
            .copied()
            .collect();
        out.sort_by(|a, b| b.total_cycles.cmp(&a.total_cycles));
        out
    }

    /// Rebuild the hotspot list: top entries by total cycles.
    pub fn analyze_hotspots(&mut self) {
        let mut all: Vec<ProfileEntry> = self.entries().filter(|e| e.call_count > 0).copied().collect();
        all.sort_by(|a, b| b.total_cycles.cmp(&a.total_cycles).then(b.call_count.cmp(&a.call_count)));
        all.truncate(MAX_HOTSPOTS);
        self.hotspots = all;
    }

    /// Snapshot from the last [`analyze_hotspots`](Self::analyze_hotspots).
    pub fn hotspots(&self) -> &[ProfileEntry] {
        &self.hotspots
    }

    pub fn op_stats(&self, op: OpKind) -> OpStats {
        self.op_stats[op.index()]
    }

    /// Drop every entry and aggregate. Thresholds and the enabled flag stay.
    pub fn reset(&mut self) {
        self.buckets.iter_mut().for_each(Vec::clear);
        self.op_stats = [OpStats::default(); OpKind::COUNT];
        self.hotspots.clear();
        self.total_cycles = 0;
        self.entries_evicted = 0;
        self.dropped.clear();
        self.tick = 0;
        log::debug!("profiler: reset");
    }
}

impl Default for NeuralProfiler {
    fn default() -> Self {
        Self::new(ProfilerConfig::default())
    }
}
