//! Operation kinds, kernel signatures, and the JIT error taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A high-level numeric operation the JIT knows how to specialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    /// `C = alpha * A * B + beta * C`, row-major f32.
    Gemm,
    /// Elementwise hyperbolic tangent.
    Tanh,
    /// Elementwise logistic sigmoid.
    Sigmoid,
    /// Elementwise `max(x, 0)`.
    Relu,
}

impl OpKind {
    pub const ALL: [OpKind; 4] = [OpKind::Gemm, OpKind::Tanh, OpKind::Sigmoid, OpKind::Relu];
    pub const COUNT: usize = Self::ALL.len();

    /// Dense index into per-op tables.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            OpKind::Gemm => "GEMM",
            OpKind::Tanh => "TANH",
            OpKind::Sigmoid => "SIGMOID",
            OpKind::Relu => "RELU",
        }
    }

    /// True for the single-input elementwise kernels.
    pub fn is_activation(self) -> bool {
        !matches!(self, OpKind::Gemm)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One `(operation, shape)` pair. Activations store their element count in
/// `m` and leave `n`/`k` at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelSignature {
    pub op: OpKind,
    pub m: u32,
    pub n: u32,
    pub k: u32,
}

impl KernelSignature {
    pub fn new(op: OpKind, m: u32, n: u32, k: u32) -> Self {
        Self { op, m, n, k }
    }

    pub fn gemm(m: u32, n: u32, k: u32) -> Self {
        Self::new(OpKind::Gemm, m, n, k)
    }

    pub fn activation(op: OpKind, count: u32) -> Self {
        debug_assert!(op.is_activation());
        Self::new(op, count, 0, 0)
    }

    /// 64-bit signature hash used for bucket and set indexing.
    ///
    /// Every field participates at full width, then the murmur3 finalizer
    /// spreads the bits so low-order set indices stay uniform.
    pub fn hash64(&self) -> u64 {
        let mut h = (self.op as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        h ^= (self.m as u64) | ((self.n as u64) << 32);
        h = fmix64(h);
        h ^= (self.k as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
        fmix64(h)
    }

    /// Work units the op touches: `m*n*k` multiply-adds for GEMM, element
    /// count for activations.
    pub fn work_elements(&self) -> u64 {
        match self.op {
            OpKind::Gemm => self.m as u64 * self.n as u64 * self.k as u64,
            _ => self.m as u64,
        }
    }
}

impl fmt::Display for KernelSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            OpKind::Gemm => write!(f, "GEMM {}x{}x{}", self.m, self.n, self.k),
            op => write!(f, "{} [{}]", op, self.m),
        }
    }
}

#[inline]
fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    h ^= h >> 33;
    h = h.wrapping_mul(0xC4CE_B9FE_1A85_EC53);
    h ^= h >> 33;
    h
}

/// Why a kernel could not be produced.
///
/// Every variant is recovered inside dispatch: the public compute entry
/// points fall back to the reference kernels and never surface these.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("{op} kernel requires {required}, not available on this CPU")]
    UnsupportedCpu { op: OpKind, required: &'static str },
    #[error("out of executable memory: requested {requested} bytes, {remaining} remaining")]
    OutOfExecutableMemory { requested: usize, remaining: usize },
    #[error("code generation overflow: {reason}")]
    CodeGenOverflow { reason: String },
    #[error("cannot specialize {signature}: {reason}")]
    InvalidShape { signature: KernelSignature, reason: &'static str },
    #[error("executable mapping failed: {0}")]
    Mmap(#[from] std::io::Error),
}

impl JitError {
    pub(crate) fn overflow(reason: impl Into<String>) -> Self {
        JitError::CodeGenOverflow { reason: reason.into() }
    }

    /// Failures that can clear up later (pool reset, different emission).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            JitError::OutOfExecutableMemory { .. } | JitError::CodeGenOverflow { .. }
        )
    }
}

pub type JitResult<T> = Result<T, JitError>;
