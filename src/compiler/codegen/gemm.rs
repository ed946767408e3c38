//! Shape-specialized f32 GEMM generator: `C = alpha * A * B + beta * C`.
//!
//! All three dimensions are baked into the code as immediates and
//! displacements; the dimension arguments the ABI passes are ignored.
//!
//! ```text
//! extern "C" fn(a: *const f32, b: *const f32, c: *mut f32,
//!               m: u32, n: u32, k: u32, alpha: f32, beta: f32)
//!   rdi=A  rsi=B  rdx=C  ecx=m  r8d=n  r9d=k  xmm0=alpha  xmm1=beta
//! ```
//!
//! Blocking: rows are processed 8 at a time (one accumulator register per
//! row), columns 8 at a time in ymm tiles. Every accumulator consumes one
//! broadcast of `A[i][p]` and one shared load of `B[p][j..j+8]` per step of
//! the K loop, so an 8x8 tile is 8 FMAs per B load. A partial final row
//! block and a scalar column tail cover shapes that are not multiples of 8.
//!
//! Register map:
//!
//! | reg   | role                                  |
//! |-------|---------------------------------------|
//! | r10   | A row-block base                      |
//! | r11   | C row-block base                      |
//! | rbx   | full row-block counter                |
//! | rax   | column byte offset `j*4`              |
//! | rcx   | A cursor inside the K loop            |
//! | r8    | B cursor inside the K loop            |
//! | r9    | K loop counter                        |
//! | r12   | C tile base (`r11 + rax`)             |
//! | v0-7  | row accumulators                      |
//! | v8    | B row slice                           |
//! | v9    | broadcast A element                   |
//! | v14   | alpha broadcast                       |
//! | v15   | beta broadcast                        |

use super::emitter::CodeEmitter;
use super::x86_64::{self as enc, Cond, Gpr, Mem, VReg, VecLen, VFMADD231PS, VFMADD231SS,
    VMULPS, VMULSS, VXORPS};
use crate::types::{JitError, JitResult, KernelSignature};

/// Rows per register block.
pub const MR: u32 = 8;
/// f32 lanes per ymm register.
pub const NR: u32 = 8;

const B_VEC: VReg = VReg(8);
const A_BCAST: VReg = VReg(9);
const ALPHA: VReg = VReg(14);
const BETA: VReg = VReg(15);

/// Byte strides and loop bounds for one specialized shape.
#[derive(Debug, Clone, Copy)]
struct GemmLayout {
    m: u32,
    n: u32,
    k: u32,
    /// Row stride of A in bytes (`k * 4`).
    lda: i32,
    /// Row stride of B and C in bytes (`n * 4`).
    ldn: i32,
}

impl GemmLayout {
    fn new(sig: &KernelSignature) -> JitResult<Self> {
        let (m, n, k) = (sig.m, sig.n, sig.k);
        if m == 0 || n == 0 || k == 0 {
            return Err(JitError::InvalidShape { signature: *sig, reason: "zero dimension" });
        }
        // Largest displacement/immediate the generator emits is one full
        // row block of A or C.
        let stride = |elems: u32| -> JitResult<i32> {
            (elems as u64 * 4 * MR as u64)
                .try_into()
                .map(|span: i32| span / MR as i32)
                .map_err(|_| JitError::overflow(format!("{sig}: row block exceeds disp32")))
        };
        Ok(Self { m, n, k, lda: stride(k)?, ldn: stride(n)? })
    }
}

/// Emit a complete GEMM function body for `sig` (System V ABI).
pub fn emit_gemm(e: &mut CodeEmitter, sig: &KernelSignature) -> JitResult<()> {
    let layout = GemmLayout::new(sig)?;

    // prologue: rbx/rbp/r12 are callee-saved
    e.emit(enc::push(Gpr::RBP));
    e.emit(enc::mov_rr(Gpr::RBP, Gpr::RSP));
    e.emit(enc::push(Gpr::RBX));
    e.emit(enc::push(Gpr::R12));

    e.emit(enc::vbroadcastss(VecLen::Y256, ALPHA, VReg(0)));
    e.emit(enc::vbroadcastss(VecLen::Y256, BETA, VReg(1)));
    e.emit(enc::mov_rr(Gpr::R10, Gpr::RDI));
    e.emit(enc::mov_rr(Gpr::R11, Gpr::RDX));

    let full_blocks = layout.m / MR;
    if full_blocks > 0 {
        e.emit(enc::mov_r32_imm(Gpr::RBX, full_blocks));
        let row_loop = e.new_label();
        e.bind(row_loop);
        emit_row_block(e, &layout, MR);
        e.emit(enc::add_ri(Gpr::R10, layout.lda * MR as i32));
        e.emit(enc::add_ri(Gpr::R11, layout.ldn * MR as i32));
        e.emit(enc::dec(Gpr::RBX));
        e.jcc(Cond::Ne, row_loop);
    }
    let tail_rows = layout.m % MR;
    if tail_rows > 0 {
        emit_row_block(e, &layout, tail_rows);
    }

    e.emit(enc::vzeroupper());
    e.emit(enc::pop(Gpr::R12));
    e.emit(enc::pop(Gpr::RBX));
    e.emit(enc::pop(Gpr::RBP));
    e.emit(enc::ret());
    Ok(())
}

/// Which column path a tile loop takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tile {
    /// 8 columns per iteration in ymm registers.
    Vector,
    /// 1 column per iteration in the low lane of xmm registers.
    Scalar,
}

/// All columns of `rows` rows starting at r10 (A) / r11 (C).
fn emit_row_block(e: &mut CodeEmitter, l: &GemmLayout, rows: u32) {
    let vec_cols = l.n / NR * NR;
    e.emit(enc::xor_r32(Gpr::RAX, Gpr::RAX));

    if vec_cols > 0 {
        let top = e.new_label();
        e.bind(top);
        emit_tile(e, l, rows, Tile::Vector);
        e.emit(enc::add_ri(Gpr::RAX, (NR * 4) as i32));
        e.emit(enc::cmp_ri(Gpr::RAX, (vec_cols * 4) as i32));
        e.jcc(Cond::B, top);
    }
    if vec_cols < l.n {
        let top = e.new_label();
        e.bind(top);
        emit_tile(e, l, rows, Tile::Scalar);
        e.emit(enc::add_ri(Gpr::RAX, 4));
        e.emit(enc::cmp_ri(Gpr::RAX, l.ldn));
        e.jcc(Cond::B, top);
    }
}

/// One `rows x 8` (or `rows x 1`) tile of C at column offset rax.
fn emit_tile(e: &mut CodeEmitter, l: &GemmLayout, rows: u32, tile: Tile) {
    let len = match tile {
        Tile::Vector => VecLen::Y256,
        Tile::Scalar => VecLen::X128,
    };
    for r in 0..rows as u8 {
        e.emit(enc::vop3(VXORPS, len, VReg(r), VReg(r), VReg(r)));
    }

    e.emit(enc::mov_rr(Gpr::RCX, Gpr::R10));
    e.emit(enc::lea(Gpr::R8, Mem::indexed(Gpr::RSI, Gpr::RAX, 0)));
    e.emit(enc::mov_r32_imm(Gpr::R9, l.k));

    let k_loop = e.new_label();
    e.bind(k_loop);
    match tile {
        Tile::Vector => {
            e.emit(enc::vmovups_load(len, B_VEC, Mem::base(Gpr::R8, 0)));
            for r in 0..rows {
                let a = Mem::base(Gpr::RCX, r as i32 * l.lda);
                e.emit(enc::vbroadcastss(len, A_BCAST, a));
                e.emit(enc::vop3(VFMADD231PS, len, VReg(r as u8), A_BCAST, B_VEC));
            }
        }
        Tile::Scalar => {
            e.emit(enc::vmovss_load(B_VEC, Mem::base(Gpr::R8, 0)));
            for r in 0..rows {
                let a = Mem::base(Gpr::RCX, r as i32 * l.lda);
                e.emit(enc::vmovss_load(A_BCAST, a));
                e.emit(enc::vop3(VFMADD231SS, len, VReg(r as u8), A_BCAST, B_VEC));
            }
        }
    }
    e.emit(enc::add_ri(Gpr::RCX, 4));
    e.emit(enc::add_ri(Gpr::R8, l.ldn));
    e.emit(enc::dec(Gpr::R9));
    e.jcc(Cond::Ne, k_loop);

    // C = alpha * acc + beta * C
    e.emit(enc::lea(Gpr::R12, Mem::indexed(Gpr::R11, Gpr::RAX, 0)));
    for r in 0..rows {
        let acc = VReg(r as u8);
        let c = Mem::base(Gpr::R12, r as i32 * l.ldn);
        match tile {
            Tile::Vector => {
                e.emit(enc::vop3(VMULPS, len, acc, acc, ALPHA));
                e.emit(enc::vop3(VFMADD231PS, len, acc, BETA, c));
                e.emit(enc::vmovups_store(len, c, acc));
            }
            Tile::Scalar => {
                e.emit(enc::vop3(VMULSS, len, acc, acc, ALPHA));
                e.emit(enc::vop3(VFMADD231SS, len, acc, BETA, c));
                e.emit(enc::vmovss_store(c, acc));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    fn generate(m: u32, n: u32, k: u32) -> Vec<u8> {
        let mut e = CodeEmitter::with_capacity(64 * 1024);
        emit_gemm(&mut e, &KernelSignature::gemm(m, n, k)).unwrap();
        e.finish().unwrap()
    }

    fn mnemonics(code: &[u8]) -> Vec<Mnemonic> {
        let mut decoder = Decoder::new(64, code, DecoderOptions::NONE);
        let mut out = Vec::new();
        while decoder.can_decode() {
            let inst = decoder.decode();
            assert!(!inst.is_invalid(), "invalid instruction at {:#x}", inst.ip());
            out.push(inst.mnemonic());
        }
        out
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let mut e = CodeEmitter::with_capacity(4096);
        let err = emit_gemm(&mut e, &KernelSignature::gemm(0, 8, 8)).unwrap_err();
        assert!(matches!(err, JitError::InvalidShape { .. }));
    }

    #[test]
    fn test_8x8x8_shape() {
        let ops = mnemonics(&generate(8, 8, 8));
        // one vector tile: 8 broadcasts + 8 FMAs in K, 8 FMAs in the epilogue
        assert_eq!(ops.iter().filter(|m| **m == Mnemonic::Vbroadcastss).count(), 2 + 8);
        assert_eq!(ops.iter().filter(|m| **m == Mnemonic::Vfmadd231ps).count(), 16);
        assert!(!ops.contains(&Mnemonic::Vfmadd231ss), "no scalar tail expected");
        assert_eq!(ops.last(), Some(&Mnemonic::Ret));
        assert!(ops.contains(&Mnemonic::Vzeroupper));
    }

    #[test]
    fn test_tails_emit_scalar_path() {
        let ops = mnemonics(&generate(11, 13, 5));
        assert!(ops.contains(&Mnemonic::Vfmadd231ss));
        assert!(ops.contains(&Mnemonic::Vfmadd231ps));
        // pushes and pops stay balanced
        let pushes = ops.iter().filter(|m| **m == Mnemonic::Push).count();
        let pops = ops.iter().filter(|m| **m == Mnemonic::Pop).count();
        assert_eq!(pushes, pops);
    }

    #[test]
    fn test_code_size_fits_capacity() {
        use crate::compiler::GEMM_CODE_CAPACITY;
        for (m, n, k) in [(1, 1, 1), (8, 8, 8), (15, 15, 15), (64, 100, 300), (4096, 4096, 4096)] {
            let code = generate(m, n, k);
            assert!(code.len() <= GEMM_CODE_CAPACITY, "{m}x{n}x{k}: {} bytes", code.len());
        }
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(generate(9, 17, 3), generate(9, 17, 3));
    }
}
