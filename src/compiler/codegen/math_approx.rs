//! Shared math approximations for the activation kernels.
//!
//! Coefficients plus emit functions that append the vector instruction
//! sequence for exp, tanh, and sigmoid to a [`CodeEmitter`]. Every sequence
//! works for either vector length: the 8-wide main loop uses `Y256`, the
//! scalar tail reruns the same code with `X128`.
//!
//! Constants live in the emitter's RIP-relative pool and are broadcast into
//! a scratch register right before use, so no register stays pinned across
//! the loop.
//!
//! The scalar `*_ref` functions evaluate the same formulas in plain Rust and
//! pin down the approximation error in the tests.

use super::emitter::CodeEmitter;
use super::x86_64::{self as enc, VReg, VecLen, VADDPS, VDIVPS, VFMADD213PS, VFMADD231PS,
    VMAXPS, VMINPS, VMULPS, VPADDD, VRCPPS, VSUBPS, VXORPS, VCVTPS2DQ};

// ── Exp coefficients (Cephes degree-5 polynomial) ───────────────────────────

/// Input clamp for exp. Keeps `round(x * log2e)` within [-127, 127] so the
/// biased exponent never reaches the infinity encoding.
pub const EXP_CLAMP_LO: f32 = -88.0;
pub const EXP_CLAMP_HI: f32 = 88.0;
/// log2(e) for range reduction.
pub const EXP_LOG2E: f32 = 1.442_695;
/// Cody-Waite split of -ln(2).
pub const EXP_C1: f32 = -0.693_359_4;
pub const EXP_C2: f32 = 2.121_944_4e-4;
/// Horner polynomial coefficients (degree 5).
pub const EXP_P0: f32 = 1.987_569_1e-4;
pub const EXP_P1: f32 = 1.398_199_9e-3;
pub const EXP_P2: f32 = 8.333_452e-3;
pub const EXP_P3: f32 = 4.166_579_6e-2;
pub const EXP_P4: f32 = 1.666_666_5e-1;
pub const EXP_P5: f32 = 5.000_000_1e-1;
/// IEEE-754 single exponent bias, added as an integer.
pub const EXP_BIAS: u32 = 127;

/// `vroundps` immediate: round to nearest even.
const ROUND_NEAREST: u8 = 0x00;

// ── Tanh coefficients (Padé [7/6], normalized by 135135) ────────────────────

/// Beyond this magnitude the rational form drifts; tanh is 1 - 1e-4 here.
pub const TANH_CLAMP: f32 = 4.97;
pub const TANH_A1: f32 = 17325.0 / 135135.0;
pub const TANH_A2: f32 = 378.0 / 135135.0;
pub const TANH_A3: f32 = 1.0 / 135135.0;
pub const TANH_B1: f32 = 62370.0 / 135135.0;
pub const TANH_B2: f32 = 3150.0 / 135135.0;
pub const TANH_B3: f32 = 28.0 / 135135.0;

/// Absolute error bound the generated tanh/sigmoid kernels are held to.
pub const ACTIVATION_TOLERANCE: f32 = 1e-3;

// ── Emitters ────────────────────────────────────────────────────────────────

fn op3(e: &mut CodeEmitter, op: enc::VexOp, len: VecLen, dst: VReg, a: VReg, b: VReg) {
    e.emit(enc::vop3(op, len, dst, a, b));
}

/// Emit `dst = exp(src)`.
///
/// 1. clamp x to [EXP_CLAMP_LO, EXP_CLAMP_HI]
/// 2. k = round(x * log2e)
/// 3. r = x - k*ln2 (two-constant Cody-Waite)
/// 4. y = P(r) * r^2 + r + 1
/// 5. dst = y * 2^k, with 2^k built as `(k + 127) << 23`
///
/// `src` may alias `s[0]`; `s[0..3]` are clobbered.
pub fn emit_exp(e: &mut CodeEmitter, len: VecLen, dst: VReg, src: VReg, s: [VReg; 3]) {
    // min/max return their second source when either is NaN: keep x second
    // so NaN flows through the clamps.
    e.broadcast_const(len, s[1], EXP_CLAMP_LO);
    op3(e, VMAXPS, len, s[0], s[1], src);
    e.broadcast_const(len, s[1], EXP_CLAMP_HI);
    op3(e, VMINPS, len, s[0], s[1], s[0]);

    e.broadcast_const(len, s[1], EXP_LOG2E);
    op3(e, VMULPS, len, s[1], s[0], s[1]);
    e.emit(enc::vroundps(len, s[2], s[1], ROUND_NEAREST));

    e.broadcast_const(len, s[1], EXP_C1);
    op3(e, VFMADD231PS, len, s[0], s[2], s[1]);
    e.broadcast_const(len, s[1], EXP_C2);
    op3(e, VFMADD231PS, len, s[0], s[2], s[1]);

    e.broadcast_const(len, dst, EXP_P0);
    for c in [EXP_P1, EXP_P2, EXP_P3, EXP_P4, EXP_P5] {
        e.broadcast_const(len, s[1], c);
        op3(e, VFMADD213PS, len, dst, s[0], s[1]);
    }
    op3(e, VMULPS, len, s[1], s[0], s[0]);
    // dst = r^2 * dst + r
    op3(e, VFMADD213PS, len, dst, s[1], s[0]);
    e.broadcast_const(len, s[1], 1.0);
    op3(e, VADDPS, len, dst, dst, s[1]);

    e.emit(enc::vop2(VCVTPS2DQ, len, s[2], s[2]));
    e.broadcast_bits(len, s[1], EXP_BIAS);
    op3(e, VPADDD, len, s[2], s[2], s[1]);
    e.emit(enc::vpslld_imm(len, s[2], s[2], 23));
    op3(e, VMULPS, len, dst, dst, s[2]);
}

/// Emit `dst = 1 / (1 + exp(-src))` with a `vrcpps` estimate refined by one
/// Newton-Raphson step: `r1 = r0 * (2 - d*r0)`.
///
/// `dst` must differ from `src` and `s`; `s[0..3]` are clobbered.
pub fn emit_sigmoid(e: &mut CodeEmitter, len: VecLen, dst: VReg, src: VReg, s: [VReg; 3]) {
    op3(e, VXORPS, len, s[1], s[1], s[1]);
    op3(e, VSUBPS, len, s[0], s[1], src);
    emit_exp(e, len, dst, s[0], s);

    e.broadcast_const(len, s[1], 1.0);
    op3(e, VADDPS, len, dst, dst, s[1]);

    e.emit(enc::vop2(VRCPPS, len, s[0], dst));
    op3(e, VMULPS, len, s[2], dst, s[0]);
    e.broadcast_const(len, s[1], 2.0);
    op3(e, VSUBPS, len, s[2], s[1], s[2]);
    op3(e, VMULPS, len, dst, s[0], s[2]);
}

/// Emit `dst = tanh(src)` as the Padé [7/6] rational
/// `x(1 + a1 x² + a2 x⁴ + a3 x⁶) / (1 + b1 x² + b2 x⁴ + b3 x⁶)` on an input
/// clamped to ±TANH_CLAMP, with the result clamped to [-1, 1].
///
/// `dst` must differ from `src` and `s`; `s[0..4]` are clobbered.
pub fn emit_tanh(e: &mut CodeEmitter, len: VecLen, dst: VReg, src: VReg, s: [VReg; 4]) {
    e.broadcast_const(len, s[1], TANH_CLAMP);
    op3(e, VMINPS, len, s[0], s[1], src);
    e.broadcast_const(len, s[1], -TANH_CLAMP);
    op3(e, VMAXPS, len, s[0], s[1], s[0]);
    op3(e, VMULPS, len, s[2], s[0], s[0]);

    // numerator
    e.broadcast_const(len, dst, TANH_A3);
    for c in [TANH_A2, TANH_A1, 1.0] {
        e.broadcast_const(len, s[1], c);
        op3(e, VFMADD213PS, len, dst, s[2], s[1]);
    }
    op3(e, VMULPS, len, dst, dst, s[0]);

    // denominator
    e.broadcast_const(len, s[3], TANH_B3);
    for c in [TANH_B2, TANH_B1, 1.0] {
        e.broadcast_const(len, s[1], c);
        op3(e, VFMADD213PS, len, s[3], s[2], s[1]);
    }
    op3(e, VDIVPS, len, dst, dst, s[3]);

    e.broadcast_const(len, s[1], 1.0);
    op3(e, VMINPS, len, dst, s[1], dst);
    e.broadcast_const(len, s[1], -1.0);
    op3(e, VMAXPS, len, dst, s[1], dst);
}

/// Emit `dst = max(src, 0)`.
pub fn emit_relu(e: &mut CodeEmitter, len: VecLen, dst: VReg, src: VReg, zero: VReg) {
    op3(e, VXORPS, len, zero, zero, zero);
    op3(e, VMAXPS, len, dst, src, zero);
}

// ── Scalar mirrors ──────────────────────────────────────────────────────────

/// Scalar evaluation of the sequence `emit_exp` generates.
pub fn exp_ref(x: f32) -> f32 {
    let x = x.clamp(EXP_CLAMP_LO, EXP_CLAMP_HI);
    let k = (x * EXP_LOG2E).round_ties_even();
    let r = k.mul_add(EXP_C2, k.mul_add(EXP_C1, x));
    let mut y = EXP_P0;
    for c in [EXP_P1, EXP_P2, EXP_P3, EXP_P4, EXP_P5] {
        y = y.mul_add(r, c);
    }
    let y = y.mul_add(r * r, r) + 1.0;
    let pow2k = f32::from_bits(((k as i32 + EXP_BIAS as i32) as u32) << 23);
    y * pow2k
}

/// Scalar evaluation of the rational form `emit_tanh` generates.
pub fn tanh_ref(x: f32) -> f32 {
    let x = x.clamp(-TANH_CLAMP, TANH_CLAMP);
    let x2 = x * x;
    let p = x * TANH_A3.mul_add(x2, TANH_A2).mul_add(x2, TANH_A1).mul_add(x2, 1.0);
    let q = TANH_B3.mul_add(x2, TANH_B2).mul_add(x2, TANH_B1).mul_add(x2, 1.0);
    (p / q).clamp(-1.0, 1.0)
}
