//! Elementwise activation kernels (tanh, sigmoid, relu).
//!
//! ```text
//! extern "C" fn(input: *const f32, output: *mut f32, count: u32)
//!   rdi=input  rsi=output  edx=count (ignored: count is baked in)
//! ```
//!
//! The main loop handles 8 floats per iteration; the remaining `count % 8`
//! elements run through the same instruction sequence at xmm width after a
//! scalar load, so both paths produce bit-identical results per element.

use super::emitter::CodeEmitter;
use super::math_approx;
use super::x86_64::{self as enc, Cond, Gpr, Mem, VReg, VecLen};
use crate::types::{JitError, JitResult, KernelSignature, OpKind};

const X: VReg = VReg(0);
const Y: VReg = VReg(1);
const SCRATCH: [VReg; 4] = [VReg(2), VReg(3), VReg(4), VReg(5)];

/// Emit a complete activation function body for `sig`.
pub fn emit_activation(e: &mut CodeEmitter, sig: &KernelSignature) -> JitResult<()> {
    let count = sig.m;
    if count == 0 {
        return Err(JitError::InvalidShape { signature: *sig, reason: "empty input" });
    }
    let total_bytes = i32::try_from(count as u64 * 4)
        .map_err(|_| JitError::overflow(format!("{sig}: element count exceeds disp32")))?;
    let body: fn(&mut CodeEmitter, VecLen) = match sig.op {
        OpKind::Tanh => |e, len| math_approx::emit_tanh(e, len, Y, X, SCRATCH),
        OpKind::Sigmoid => {
            |e, len| math_approx::emit_sigmoid(e, len, Y, X, [SCRATCH[0], SCRATCH[1], SCRATCH[2]])
        }
        OpKind::Relu => |e, len| math_approx::emit_relu(e, len, Y, X, SCRATCH[0]),
        OpKind::Gemm => {
            return Err(JitError::InvalidShape { signature: *sig, reason: "not an activation" })
        }
    };

    e.emit(enc::push(Gpr::RBP));
    e.emit(enc::mov_rr(Gpr::RBP, Gpr::RSP));
    e.emit(enc::xor_r32(Gpr::RCX, Gpr::RCX));

    let src = Mem::indexed(Gpr::RDI, Gpr::RCX, 0);
    let dst = Mem::indexed(Gpr::RSI, Gpr::RCX, 0);

    let vec_bytes = (count / 8 * 32) as i32;
    if vec_bytes > 0 {
        let top = e.new_label();
        e.bind(top);
        e.emit(enc::vmovups_load(VecLen::Y256, X, src));
        body(e, VecLen::Y256);
        e.emit(enc::vmovups_store(VecLen::Y256, dst, Y));
        e.emit(enc::add_ri(Gpr::RCX, 32));
        e.emit(enc::cmp_ri(Gpr::RCX, vec_bytes));
        e.jcc(Cond::B, top);
    }
    if vec_bytes < total_bytes {
        let top = e.new_label();
        e.bind(top);
        e.emit(enc::vmovss_load(X, src));
        body(e, VecLen::X128);
        e.emit(enc::vmovss_store(dst, Y));
        e.emit(enc::add_ri(Gpr::RCX, 4));
        e.emit(enc::cmp_ri(Gpr::RCX, total_bytes));
        e.jcc(Cond::B, top);
    }

    e.emit(enc::vzeroupper());
    e.emit(enc::pop(Gpr::RBP));
    e.emit(enc::ret());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    /// Decode up to and including the first `ret`; the constant pool follows.
    fn mnemonics(code: &[u8]) -> Vec<Mnemonic> {
        let mut decoder = Decoder::new(64, code, DecoderOptions::NONE);
        let mut out = Vec::new();
        while decoder.can_decode() {
            let inst = decoder.decode();
            assert!(!inst.is_invalid());
            out.push(inst.mnemonic());
            if inst.mnemonic() == Mnemonic::Ret {
                break;
            }
        }
        out
    }

    fn generate(op: OpKind, count: u32) -> Vec<u8> {
        let mut e = CodeEmitter::with_capacity(crate::compiler::ACTIVATION_CODE_CAPACITY);
        emit_activation(&mut e, &KernelSignature::activation(op, count)).unwrap();
        e.finish().unwrap()
    }

    #[test]
    fn test_vector_and_tail_loops() {
        let ops = mnemonics(&generate(OpKind::Tanh, 19));
        assert!(ops.contains(&Mnemonic::Vmovups));
        assert!(ops.contains(&Mnemonic::Vmovss));
        assert_eq!(ops.iter().filter(|m| **m == Mnemonic::Vdivps).count(), 2);
        assert_eq!(ops.last(), Some(&Mnemonic::Ret));
    }

    #[test]
    fn test_multiple_of_eight_has_no_tail() {
        let ops = mnemonics(&generate(OpKind::Sigmoid, 1024));
        assert!(!ops.contains(&Mnemonic::Vmovss));
        assert_eq!(ops.iter().filter(|m| **m == Mnemonic::Vrcpps).count(), 1);
    }

    #[test]
    fn test_short_input_is_tail_only() {
        let ops = mnemonics(&generate(OpKind::Relu, 3));
        assert!(!ops.contains(&Mnemonic::Vmovups));
        assert_eq!(ops.iter().filter(|m| **m == Mnemonic::Vmaxps).count(), 1);
    }

    #[test]
    fn test_rejects_bad_signatures() {
        let mut e = CodeEmitter::with_capacity(4096);
        assert!(emit_activation(&mut e, &KernelSignature::activation(OpKind::Tanh, 0)).is_err());
        assert!(emit_activation(&mut e, &KernelSignature::gemm(8, 8, 8)).is_err());
    }
}
