//! neural-jit: a profiling JIT for the numeric kernels of an inference engine.
//!
//! Every call to a high-level op (`gemm_f32`, `tanh_f32`, `sigmoid_f32`,
//! `relu_f32`) is profiled by its `(operation, shape)` signature. Once a
//! signature is hot, specialized x86-64 AVX2/FMA machine code with the shape
//! baked in is emitted into a W^X executable pool, cached, and called
//! directly. Until then, or wherever the CPU cannot run generated code, a
//! portable reference kernel produces the result.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use neural_jit::{JitConfig, NeuralJit};
//!
//! let mut jit = NeuralJit::new(JitConfig::from_env()).unwrap();
//! let x = vec![0.5f32; 1024];
//! let mut y = vec![0.0f32; 1024];
//! for _ in 0..1000 {
//!     jit.tanh_f32(&x, &mut y);
//! }
//! jit.print_stats();
//! jit.export_stats("/tmp/neural_jit_profile.csv").unwrap();
//! ```
//!
//! # Layout
//!
//! - [`dispatch`]: CPU feature detection and the per-signature state machine
//! - [`compiler`]: instruction encoders, kernel generators, executable pool, kernel cache
//! - [`profiling`]: cycle timer, per-signature profile table, reports
//! - [`scalar_ops`]: fallback kernels
//! - [`jit`]: the [`NeuralJit`] context

pub mod compiler;
pub mod config;
pub mod dispatch;
pub mod jit;
pub mod profiling;
pub mod scalar_ops;
pub mod types;

pub use compiler::{CodeBlock, ExecutablePool, KernelCache};
pub use config::{JitConfig, ProfilerConfig};
pub use dispatch::{CpuFeatures, FallbackReason, SignatureState};
pub use jit::{disassemble, dump_assembly, JitStats, NeuralJit};
pub use profiling::{ExecPath, NeuralProfiler, ProfileEntry};
pub use types::{JitError, JitResult, KernelSignature, OpKind};

/// Detect the host's instruction-set features (cached per process).
pub fn detect_cpu_features() -> CpuFeatures {
    dispatch::detect_features()
}
