//! x86-64 code generation for specialized kernels.
//!
//! `x86_64` holds the pure instruction encoders, `emitter` the bounded
//! output buffer with labels and a constant pool, and `gemm`/`activation`
//! the per-operation generators built on top of them.

pub mod activation;
pub mod emitter;
pub mod gemm;
pub mod math_approx;
pub mod x86_64;

use crate::types::{JitResult, KernelSignature, OpKind};
use emitter::CodeEmitter;

/// Output of code generation: raw machine code bytes.
#[derive(Debug, Clone)]
pub struct CodegenOutput {
    /// Function body followed by its constant pool.
    pub code: Vec<u8>,
    pub signature: KernelSignature,
}

/// Generate the machine code for `sig` into a buffer of at most `capacity`
/// bytes. Overflow, unencodable displacements and unusable shapes are
/// reported as errors; partial output is dropped.
pub fn generate(sig: &KernelSignature, capacity: usize) -> JitResult<CodegenOutput> {
    let mut e = CodeEmitter::with_capacity(capacity);
    match sig.op {
        OpKind::Gemm => gemm::emit_gemm(&mut e, sig)?,
        OpKind::Tanh | OpKind::Sigmoid | OpKind::Relu => activation::emit_activation(&mut e, sig)?,
    }
    let code = e.finish()?;
    Ok(CodegenOutput { code, signature: *sig })
}
