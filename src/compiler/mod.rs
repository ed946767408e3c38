//! Kernel compiler: feature gate → code generation → executable install.
//!
//! ```text
//! KernelSignature ──► check CPU features ──► check pool footprint
//!                                                  │
//!                 codegen::generate (bounded) ◄────┘
//!                          │
//!   ExecutablePool::allocate ─► WritableRegion::write ─► seal ─► CodeBlock
//! ```
//!
//! Every kernel kind has a fixed code capacity. The pool must have that
//! much room before any code is emitted, and emission may not exceed it, so
//! a failed compile never leaves half-written pages behind. Only the pages
//! the emitted code actually covers are committed.

pub mod cache;
pub mod codegen;
pub mod executable;

pub use cache::{CacheStats, CachedKernel, KernelCache};
pub use codegen::CodegenOutput;
pub use executable::{ActivationKernelFn, CodeBlock, ExecutablePool, GemmKernelFn};

use crate::dispatch::hw_info::CpuFeatures;
use crate::types::{JitError, JitResult, KernelSignature, OpKind};

/// Code buffer reserved for one GEMM kernel.
pub const GEMM_CODE_CAPACITY: usize = 8 * 1024;
/// Code buffer reserved for one activation kernel.
pub const ACTIVATION_CODE_CAPACITY: usize = 4 * 1024;

/// Upper bound on the code size of a kernel of kind `op`.
pub fn code_capacity(op: OpKind) -> usize {
    match op {
        OpKind::Gemm => GEMM_CODE_CAPACITY,
        OpKind::Tanh | OpKind::Sigmoid | OpKind::Relu => ACTIVATION_CODE_CAPACITY,
    }
}

/// Generated kernels follow the System V calling convention.
const HOST_ABI_SUPPORTED: bool = cfg!(all(target_arch = "x86_64", unix));

/// Turns signatures into sealed, executable code blocks.
#[derive(Debug, Clone)]
pub struct KernelCompiler {
    features: CpuFeatures,
}

impl KernelCompiler {
    pub fn new(features: CpuFeatures) -> Self {
        Self { features }
    }

    pub fn features(&self) -> &CpuFeatures {
        &self.features
    }

    /// Whether this host may run generated code for `op` at all.
    pub fn check_supported(&self, op: OpKind) -> JitResult<()> {
        if !HOST_ABI_SUPPORTED {
            return Err(JitError::UnsupportedCpu { op, required: "an x86-64 System V host" });
        }
        let f = &self.features;
        let (ok, required) = match op {
            OpKind::Gemm | OpKind::Tanh | OpKind::Sigmoid => (f.has_avx2_fma(), "AVX2+FMA"),
            OpKind::Relu => (f.avx, "AVX"),
        };
        if ok {
            Ok(())
        } else {
            Err(JitError::UnsupportedCpu { op, required })
        }
    }

    /// Compile `sig` into `pool`.
    pub fn compile(&self, sig: &KernelSignature, pool: &mut ExecutablePool) -> JitResult<CodeBlock> {
        self.check_supported(sig.op)?;

        let capacity = code_capacity(sig.op);
        let footprint = capacity.div_ceil(pool.page_size()) * pool.page_size();
        if pool.remaining() < footprint {
            return Err(JitError::OutOfExecutableMemory {
                requested: footprint,
                remaining: pool.remaining(),
            });
        }

        let out = codegen::generate(sig, capacity)?;
        let mut region = pool.allocate(out.code.len())?;
        region.write(&out.code)?;
        let block = region.seal()?;
        log::info!(
            "compiled {sig}: {} bytes at {:p} ({} KB pool left)",
            block.size(),
            block.as_ptr(),
            pool.remaining() / 1024
        );
        Ok(block)
    }
}
