//! `NeuralJit`: the public context tying profiler, compiler, cache and
//! executable pool together.
//!
//! ```rust,no_run
//! use neural_jit::NeuralJit;
//!
//! let mut jit = NeuralJit::create(16 << 20, 1024).unwrap();
//! let (m, n, k) = (64, 64, 64);
//! let a = vec![1.0f32; m * k];
//! let b = vec![1.0f32; k * n];
//! let mut c = vec![0.0f32; m * n];
//! for _ in 0..200 {
//!     jit.gemm_f32(&a, &b, &mut c, m, n, k, 1.0, 0.0);
//! }
//! jit.print_stats();
//! ```
//!
//! Every call is dispatched as:
//!
//! ```text
//! profiler.begin ─► state update ─► cache lookup ─┬─ hit ──────────────► compiled kernel
//!                                                 ├─ miss, Candidate ─► compile ─► compiled kernel
//!                                                 └─ otherwise ────────────────► fallback
//!                                                 ─► profiler.end(path)
//! ```

use std::fmt::Write as _;
use std::path::Path;

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};
use serde::Serialize;

use crate::compiler::{
    ActivationKernelFn, CachedKernel, CodeBlock, ExecutablePool, GemmKernelFn, KernelCache, KernelCompiler,
};
use crate::config::JitConfig;
use crate::dispatch::{CpuFeatures, DispatchTable, SignatureState};
use crate::profiling::timer::{cycles_to_ms, CycleTimer};
use crate::profiling::{ExecPath, NeuralProfiler};
use crate::scalar_ops::{scalar_gemm_f32, scalar_relu_f32, scalar_sigmoid_f32, scalar_tanh_f32};
use crate::types::{JitError, JitResult, KernelSignature, OpKind};

/// Aggregate counters for one context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JitStats {
    pub compilations: u64,
    pub compile_failures: u64,
    /// Cycles spent generating and installing kernels.
    pub compile_cycles: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Resident kernels displaced by an unrelated signature.
    pub evictions: u64,
    pub compiled_calls: u64,
    pub fallback_calls: u64,
    pub pool_used: usize,
    pub pool_capacity: usize,
    pub cached_kernels: usize,
    /// Signatures with dispatch state (profiled, parked or resident).
    pub tracked_signatures: usize,
}

impl JitStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    compilations: u64,
    compile_failures: u64,
    compile_cycles: u64,
    compiled_calls: u64,
    fallback_calls: u64,
}

pub struct NeuralJit {
    config: JitConfig,
    compiler: KernelCompiler,
    // Field order matters: cached blocks point into the pool.
    cache: KernelCache,
    pool: ExecutablePool,
    profiler: NeuralProfiler,
    dispatch: DispatchTable,
    counters: Counters,
}

impl NeuralJit {
    /// Context with the given executable memory and cache budgets and
    /// default profiler thresholds.
    pub fn create(exec_memory_bytes: usize, cache_capacity: usize) -> JitResult<Self> {
        Self::new(JitConfig { exec_memory_bytes, cache_capacity, ..JitConfig::default() })
    }

    pub fn new(config: JitConfig) -> JitResult<Self> {
        Self::with_cpu_features(config, crate::dispatch::detect_features())
    }

    /// Context that believes the CPU supports exactly `features`.
    ///
    /// Narrowing the host's real features is safe; claiming features the
    /// host lacks makes compiled kernels fault with SIGILL.
    pub fn with_cpu_features(config: JitConfig, features: CpuFeatures) -> JitResult<Self> {
        let pool = ExecutablePool::new(config.exec_memory_bytes)?;
        log::info!(
            "neural-jit: {} KB executable pool, {}-kernel cache, CPU {features}",
            pool.capacity() / 1024,
            config.cache_capacity
        );
        Ok(Self {
            compiler: KernelCompiler::new(features),
            cache: KernelCache::new(config.cache_capacity),
            pool,
            profiler: NeuralProfiler::new(config.profiler),
            dispatch: DispatchTable::new(config.max_compile_failures),
            counters: Counters::default(),
            config,
        })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn cpu_features(&self) -> &CpuFeatures {
        self.compiler.features()
    }

    pub fn profiler(&self) -> &NeuralProfiler {
        &self.profiler
    }

    pub fn profiler_mut(&mut self) -> &mut NeuralProfiler {
        &mut self.profiler
    }

    pub fn cache(&self) -> &KernelCache {
        &self.cache
    }

    pub fn pool(&self) -> &ExecutablePool {
        &self.pool
    }

    pub fn state(&self, op: OpKind, m: u32, n: u32, k: u32) -> SignatureState {
        self.dispatch.state(&KernelSignature::new(op, m, n, k))
    }

    /// Feed an externally measured sample for a signature.
    pub fn profile(&mut self, op: OpKind, m: u32, n: u32, k: u32, cycles: u64) -> SignatureState {
        let sig = KernelSignature::new(op, m, n, k);
        if !self.profiler.is_enabled() {
            return self.dispatch.state(&sig);
        }
        let candidate = self.profiler.record(&sig, cycles);
        self.forget_dropped_profiles();
        self.dispatch.on_call(&sig, candidate)
    }

    /// Compile a kernel for the signature now, regardless of its profile.
    /// An already resident kernel is returned as is.
    pub fn compile(&mut self, op: OpKind, m: u32, n: u32, k: u32) -> JitResult<&CodeBlock> {
        let sig = KernelSignature::new(op, m, n, k);
        let slot = match self.cache.lookup_slot(&sig) {
            Some(slot) => slot,
            None => {
                self.dispatch.promote(&sig);
                self.install(&sig)?
            }
        };
        self.cache
            .slot(slot)
            .map(|kernel| &kernel.block)
            .ok_or_else(|| JitError::overflow(format!("{sig}: cache slot {slot} empty after insert")))
    }

    /// Generate, install and cache the kernel for `sig`. Returns its slot.
    fn install(&mut self, sig: &KernelSignature) -> JitResult<usize> {
        let timer = CycleTimer::start();
        let block = match self.compiler.compile(sig, &mut self.pool) {
            Ok(block) => block,
            Err(err) => {
                self.counters.compile_failures += 1;
                self.dispatch.on_compile_failed(sig, &err);
                return Err(err);
            }
        };
        self.counters.compilations += 1;
        self.counters.compile_cycles += timer.elapsed();

        let (slot, displaced) = self.cache.insert(CachedKernel::new(*sig, block));
        if let Some(old) = displaced.filter(|old| old.signature != *sig) {
            if self.profiler.entry(&old.signature).is_some() {
                // stays Compiled in the dispatch table; its next call sees the miss
                self.profiler.mark_evicted(&old.signature);
            } else {
                self.dispatch.forget(&old.signature);
            }
        }
        self.dispatch.on_compiled(sig);
        self.profiler.mark_compiled(sig);
        Ok(slot)
    }

    /// Cache slot of a runnable kernel for `sig`, compiling it if the
    /// signature has just become (or remains) a candidate.
    fn resident_slot(&mut self, sig: &KernelSignature, state: SignatureState) -> Option<usize> {
        if !matches!(state, SignatureState::Candidate | SignatureState::Compiled) {
            return None;
        }
        if let Some(slot) = self.cache.lookup_slot(sig) {
            return Some(slot);
        }
        if state.is_compiled() {
            log::debug!("neural-jit: {sig} was evicted, using fallback until recompiled");
            self.dispatch.on_evicted(sig);
            return None;
        }
        self.install(sig).ok()
    }

    /// The profiler only keeps a bounded number of signatures. Dispatch state
    /// follows it, except for signatures whose kernel is still resident.
    fn forget_dropped_profiles(&mut self) {
        for sig in self.profiler.take_dropped() {
            if self.cache.get(&sig).is_none() {
                self.dispatch.forget(&sig);
            }
        }
    }

    /// Run one call of `sig`. `exec` receives the compiled block, or `None`
    /// for the fallback.
    fn dispatch_call(&mut self, sig: &KernelSignature, exec: impl FnOnce(Option<&CodeBlock>)) {
        let mut ctx = self.profiler.begin(sig);
        let state = if ctx.is_recorded() {
            self.forget_dropped_profiles();
            self.dispatch.on_call(sig, ctx.is_candidate())
        } else {
            self.dispatch.state(sig)
        };
        let slot = self.resident_slot(sig, state);
        ctx.restart();

        let path = match slot.and_then(|slot| self.cache.slot_mut(slot)) {
            Some(kernel) => {
                let timer = CycleTimer::start();
                exec(Some(&kernel.block));
                kernel.block.record_exec(timer.elapsed());
                self.counters.compiled_calls += 1;
                ExecPath::Compiled
            }
            None => {
                exec(None);
                self.counters.fallback_calls += 1;
                ExecPath::Fallback
            }
        };
        self.profiler.end(ctx, path);
    }

    /// `C = alpha * A * B + beta * C` for row-major A [m,k], B [k,n], C [m,n].
    ///
    /// # Panics
    /// If a slice is shorter than its shape implies.
    #[allow(clippy::too_many_arguments)]
    pub fn gemm_f32(
        &mut self,
        a: &[f32],
        b: &[f32],
        c: &mut [f32],
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        beta: f32,
    ) {
        assert!(a.len() >= m * k, "A has {} elements, need {}", a.len(), m * k);
        assert!(b.len() >= k * n, "B has {} elements, need {}", b.len(), k * n);
        assert!(c.len() >= m * n, "C has {} elements, need {}", c.len(), m * n);

        let dims = (u32::try_from(m), u32::try_from(n), u32::try_from(k));
        let (Ok(m32), Ok(n32), Ok(k32)) = dims else {
            crate::scalar_ops::gemm(a, b, c, m, n, k, alpha, beta);
            return;
        };
        if m == 0 || n == 0 || k == 0 {
            crate::scalar_ops::gemm(a, b, c, m, n, k, alpha, beta);
            return;
        }
        let sig = KernelSignature::gemm(m32, n32, k32);
        self.dispatch_call(&sig, |block| {
            let kernel: GemmKernelFn = match block {
                // SAFETY: blocks are cached under their signature, so this is a GEMM kernel.
                Some(block) => unsafe { block.as_gemm() },
                None => scalar_gemm_f32,
            };
            // SAFETY: slice lengths were checked against the baked-in shape above.
            unsafe { kernel(a.as_ptr(), b.as_ptr(), c.as_mut_ptr(), m32, n32, k32, alpha, beta) }
        });
    }

    fn activation(&mut self, op: OpKind, fallback: ActivationKernelFn, input: &[f32], output: &mut [f32]) {
        assert!(
            output.len() >= input.len(),
            "output has {} elements, input has {}",
            output.len(),
            input.len()
        );
        if input.is_empty() {
            return;
        }
        let Ok(count) = u32::try_from(input.len()) else {
            for (x, y) in input.chunks(u32::MAX as usize).zip(output.chunks_mut(u32::MAX as usize)) {
                // SAFETY: each chunk fits the count argument and `y` is as long as `x`.
                unsafe { fallback(x.as_ptr(), y.as_mut_ptr(), x.len() as u32) };
            }
            return;
        };
        let sig = KernelSignature::activation(op, count);
        self.dispatch_call(&sig, |block| {
            let kernel: ActivationKernelFn = match block {
                // SAFETY: blocks are cached under their signature.
                Some(block) => unsafe { block.as_activation() },
                None => fallback,
            };
            // SAFETY: `output` holds at least `count` elements.
            unsafe { kernel(input.as_ptr(), output.as_mut_ptr(), count) }
        });
    }

    /// `output[i] = tanh(input[i])`.
    pub fn tanh_f32(&mut self, input: &[f32], output: &mut [f32]) {
        self.activation(OpKind::Tanh, scalar_tanh_f32, input, output);
    }

    /// `output[i] = 1 / (1 + exp(-input[i]))`.
    pub fn sigmoid_f32(&mut self, input: &[f32], output: &mut [f32]) {
        self.activation(OpKind::Sigmoid, scalar_sigmoid_f32, input, output);
    }

    /// `output[i] = max(input[i], 0)`.
    pub fn relu_f32(&mut self, input: &[f32], output: &mut [f32]) {
        self.activation(OpKind::Relu, scalar_relu_f32, input, output);
    }

    /// Drop every cached kernel. Executable memory is not reclaimed; see
    /// [`reset_executable_memory`](Self::reset_executable_memory).
    pub fn clear_cache(&mut self) {
        for kernel in self.cache.iter() {
            self.profiler.mark_evicted(&kernel.signature);
        }
        self.cache.clear();
        self.dispatch.on_cache_cleared();
        log::debug!("neural-jit: cache cleared");
    }

    /// Clear the cache and rewind the executable pool. Signatures that gave
    /// up for lack of executable memory become candidates again.
    pub fn reset_executable_memory(&mut self) {
        self.clear_cache();
        // SAFETY: the cache held the only CodeBlocks and is now empty; `&mut
        // self` rules out outstanding borrows from `compile`.
        unsafe { self.pool.reset() };
        let revived = self.dispatch.revive_out_of_memory();
        log::info!("neural-jit: executable memory reset, {revived} signatures may compile again");
    }

    /// Bytes of generated code held by resident kernels.
    pub fn cache_size_bytes(&self) -> usize {
        self.cache.iter().map(|k| k.block.size()).sum()
    }

    pub fn stats(&self) -> JitStats {
        let cache = self.cache.stats();
        JitStats {
            compilations: self.counters.compilations,
            compile_failures: self.counters.compile_failures,
            compile_cycles: self.counters.compile_cycles,
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            evictions: cache.evictions,
            compiled_calls: self.counters.compiled_calls,
            fallback_calls: self.counters.fallback_calls,
            pool_used: self.pool.used(),
            pool_capacity: self.pool.capacity(),
            cached_kernels: self.cache.len(),
            tracked_signatures: self.dispatch.len(),
        }
    }

    pub fn stats_string(&self) -> String {
        let st = self.stats();
        let mut s = String::with_capacity(1024);
        let _ = writeln!(s, "\n=== neural-jit statistics ===");
        let _ = writeln!(s, "CPU:               {}", self.cpu_features());
        let _ = writeln!(s, "Compilations:      {} ({} failed)", st.compilations, st.compile_failures);
        let _ = writeln!(s, "Cache hits:        {}", st.cache_hits);
        let _ = writeln!(s, "Cache misses:      {}", st.cache_misses);
        let _ = writeln!(s, "Hit rate:          {:.2}%", st.hit_rate() * 100.0);
        let _ = writeln!(s, "Evictions:         {}", st.evictions);
        let _ = writeln!(s, "Calls:             {} compiled, {} fallback", st.compiled_calls, st.fallback_calls);
        let _ = writeln!(
            s,
            "Executable memory: {} KB / {} KB",
            st.pool_used / 1024,
            st.pool_capacity / 1024
        );
        if st.compilations > 0 {
            let _ = writeln!(
                s,
                "Average JIT time:  {:.3} ms",
                cycles_to_ms(st.compile_cycles / st.compilations)
            );
        }
        let parked = self
            .dispatch
            .iter()
            .filter(|(_, state)| matches!(state, SignatureState::PermanentFallback(_)))
            .count();
        let _ = writeln!(s, "Signatures:        {} tracked, {} on permanent fallback", self.dispatch.len(), parked);

        let mut kernels: Vec<&CachedKernel> = self.cache.iter().collect();
        kernels.sort_by(|a, b| b.block.exec_count().cmp(&a.block.exec_count()));
        if !kernels.is_empty() {
            let _ = writeln!(s, "\nTop compiled kernels:");
        }
        for kernel in kernels.iter().take(10) {
            let _ = writeln!(
                s,
                "  [{}]: {} bytes, {} executions, {:.3} ms total",
                kernel.signature,
                kernel.block.size(),
                kernel.block.exec_count(),
                cycles_to_ms(kernel.block.total_cycles())
            );
        }
        s
    }

    pub fn print_stats(&self) {
        eprintln!("{}", self.stats_string());
    }

    /// Write the profiler's per-signature table to `path` (CSV, or JSON for
    /// a `.json` path).
    pub fn export_stats(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        self.profiler.export(path)
    }
}

/// Write the raw bytes of `block` to `path`.
pub fn dump_assembly(block: &CodeBlock, path: impl AsRef<Path>) -> std::io::Result<()> {
    let path = path.as_ref();
    std::fs::write(path, block.bytes())?;
    log::info!(
        "dumped {} bytes of machine code to {}; disassemble with: objdump -D -b binary -m i386:x86-64 {}",
        block.size(),
        path.display(),
        path.display()
    );
    Ok(())
}

/// Intel-syntax listing of x86-64 machine code, one instruction per line:
/// offset, encoded bytes, mnemonic and operands.
pub fn disassemble(code: &[u8]) -> String {
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut instruction = Instruction::default();
    let mut text = String::new();
    let mut out = String::with_capacity(code.len() * 8);
    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        text.clear();
        formatter.format(&instruction, &mut text);
        let start = instruction.ip() as usize;
        let bytes: String = code[start..start + instruction.len()]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        let _ = writeln!(out, "{start:08x}  {bytes:<30} {text}");
    }
    out
}
