//! x86-64 instruction encoders.
//!
//! Every encoder is a pure function returning an [`Inst`]: a small inline
//! byte array plus, for RIP-relative operands, the position of the disp32
//! field so the emitter can patch it once the constant pool is placed.
//! Nothing here touches emitter state, so each encoding is checked in
//! isolation by the tests at the bottom of this file.
//!
//! Covered: the handful of general-purpose forms the kernels need for loop
//! control and pointer arithmetic, and a generic VEX builder (2- and 3-byte
//! forms) for the AVX/AVX2/FMA vector instructions.

/// General-purpose 64-bit register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gpr(u8);

impl Gpr {
    pub const RAX: Gpr = Gpr(0);
    pub const RCX: Gpr = Gpr(1);
    pub const RDX: Gpr = Gpr(2);
    pub const RBX: Gpr = Gpr(3);
    pub const RSP: Gpr = Gpr(4);
    pub const RBP: Gpr = Gpr(5);
    pub const RSI: Gpr = Gpr(6);
    pub const RDI: Gpr = Gpr(7);
    pub const R8: Gpr = Gpr(8);
    pub const R9: Gpr = Gpr(9);
    pub const R10: Gpr = Gpr(10);
    pub const R11: Gpr = Gpr(11);
    pub const R12: Gpr = Gpr(12);
    pub const R13: Gpr = Gpr(13);
    pub const R14: Gpr = Gpr(14);
    pub const R15: Gpr = Gpr(15);

    #[inline]
    pub fn id(self) -> u8 {
        self.0
    }

    #[inline]
    fn low(self) -> u8 {
        self.0 & 7
    }

    #[inline]
    fn ext(self) -> u8 {
        (self.0 >> 3) & 1
    }
}

/// Vector register index: xmm/ymm 0..15.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VReg(pub u8);

/// Vector length selected by VEX.L.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VecLen {
    /// 128-bit xmm (also used for the scalar `ss` forms).
    X128,
    /// 256-bit ymm.
    Y256,
}

impl VecLen {
    #[inline]
    fn l_bit(self) -> u8 {
        match self {
            VecLen::X128 => 0,
            VecLen::Y256 => 1,
        }
    }
}

/// Memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mem {
    /// `[base + disp]`
    Base { base: Gpr, disp: i32 },
    /// `[base + index*scale + disp]`
    BaseIndex { base: Gpr, index: Gpr, scale: u8, disp: i32 },
    /// `[rip + disp]`, disp measured from the end of the instruction.
    Rip { disp: i32 },
}

impl Mem {
    pub fn base(base: Gpr, disp: i32) -> Self {
        Mem::Base { base, disp }
    }

    /// `[base + index + disp]` with unit scale.
    pub fn indexed(base: Gpr, index: Gpr, disp: i32) -> Self {
        debug_assert_ne!(index, Gpr::RSP, "rsp cannot be an index register");
        Mem::BaseIndex { base, index, scale: 1, disp }
    }

    pub fn rip() -> Self {
        Mem::Rip { disp: 0 }
    }
}

/// The r/m side of a ModRM byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rm {
    Reg(u8),
    Mem(Mem),
}

impl From<VReg> for Rm {
    fn from(v: VReg) -> Self {
        Rm::Reg(v.0)
    }
}

impl From<Gpr> for Rm {
    fn from(g: Gpr) -> Self {
        Rm::Reg(g.0)
    }
}

impl From<Mem> for Rm {
    fn from(m: Mem) -> Self {
        Rm::Mem(m)
    }
}

/// Condition codes for `jcc` (low nibble of the opcode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    /// Unsigned below (CF=1).
    B = 0x2,
    /// Unsigned above or equal (CF=0).
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    L = 0xC,
    Ge = 0xD,
}

pub const JCC_REL8_LEN: usize = 2;
pub const JCC_REL32_LEN: usize = 6;
pub const JMP_REL8_LEN: usize = 2;
pub const JMP_REL32_LEN: usize = 5;

/// One encoded instruction (x86 caps instructions at 15 bytes).
#[derive(Clone, Copy)]
pub struct Inst {
    bytes: [u8; 15],
    len: u8,
    rip_disp_at: Option<u8>,
}

impl Inst {
    fn new() -> Self {
        Self { bytes: [0; 15], len: 0, rip_disp_at: None }
    }

    #[inline]
    fn push(&mut self, b: u8) {
        self.bytes[self.len as usize] = b;
        self.len += 1;
    }

    #[inline]
    fn push_i32(&mut self, v: i32) {
        for b in v.to_le_bytes() {
            self.push(b);
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of the RIP-relative disp32 field within this instruction.
    #[inline]
    pub fn rip_disp_offset(&self) -> Option<usize> {
        self.rip_disp_at.map(usize::from)
    }
}

impl std::fmt::Debug for Inst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Inst({:02X?})", self.as_bytes())
    }
}

fn from_bytes(bytes: &[u8]) -> Inst {
    let mut inst = Inst::new();
    for &b in bytes {
        inst.push(b);
    }
    inst
}

// ── ModRM / SIB ─────────────────────────────────────────────────────────────

#[inline]
fn fits_i8(v: i32) -> bool {
    (i8::MIN as i32..=i8::MAX as i32).contains(&v)
}

/// Mod bits for a memory operand. `[rbp]`/`[r13]` have no disp-less form.
fn disp_mode(disp: i32, base_low: u8) -> u8 {
    if disp == 0 && base_low != 5 {
        0x00
    } else if fits_i8(disp) {
        0x40
    } else {
        0x80
    }
}

fn push_disp(inst: &mut Inst, mode: u8, disp: i32) {
    match mode {
        0x40 => inst.push(disp as i8 as u8),
        0x80 => inst.push_i32(disp),
        _ => {}
    }
}

fn scale_bits(scale: u8) -> u8 {
    match scale {
        1 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        _ => unreachable!("invalid SIB scale {scale}"),
    }
}

fn push_modrm(inst: &mut Inst, reg: u8, rm: Rm) {
    let reg = (reg & 7) << 3;
    match rm {
        Rm::Reg(r) => inst.push(0xC0 | reg | (r & 7)),
        Rm::Mem(Mem::Rip { disp }) => {
            inst.push(reg | 0x05);
            inst.rip_disp_at = Some(inst.len);
            inst.push_i32(disp);
        }
        Rm::Mem(Mem::Base { base, disp }) => {
            let mode = disp_mode(disp, base.low());
            if base.low() == 4 {
                // rsp/r12 as base always needs a SIB byte
                inst.push(mode | reg | 0x04);
                inst.push(0x24);
            } else {
                inst.push(mode | reg | base.low());
            }
            push_disp(inst, mode, disp);
        }
        Rm::Mem(Mem::BaseIndex { base, index, scale, disp }) => {
            let mode = disp_mode(disp, base.low());
            inst.push(mode | reg | 0x04);
            inst.push((scale_bits(scale) << 6) | (index.low() << 3) | base.low());
            push_disp(inst, mode, disp);
        }
    }
}

/// REX.X and REX.B contributions of an r/m operand.
fn rm_ext(rm: Rm) -> (u8, u8) {
    match rm {
        Rm::Reg(r) => (0, (r >> 3) & 1),
        Rm::Mem(Mem::Base { base, .. }) => (0, base.ext()),
        Rm::Mem(Mem::BaseIndex { base, index, .. }) => (index.ext(), base.ext()),
        Rm::Mem(Mem::Rip { .. }) => (0, 0),
    }
}

fn push_rex(inst: &mut Inst, w: bool, r: u8, rm: Rm) {
    let (x, b) = rm_ext(rm);
    let rex = 0x40 | ((w as u8) << 3) | (r << 2) | (x << 1) | b;
    if rex != 0x40 {
        inst.push(rex);
    }
}

// ── General-purpose instructions ────────────────────────────────────────────

pub fn push(r: Gpr) -> Inst {
    let mut inst = Inst::new();
    if r.ext() != 0 {
        inst.push(0x41);
    }
    inst.push(0x50 + r.low());
    inst
}

pub fn pop(r: Gpr) -> Inst {
    let mut inst = Inst::new();
    if r.ext() != 0 {
        inst.push(0x41);
    }
    inst.push(0x58 + r.low());
    inst
}

/// `mov dst, src` (64-bit).
pub fn mov_rr(dst: Gpr, src: Gpr) -> Inst {
    let mut inst = Inst::new();
    push_rex(&mut inst, true, src.ext(), dst.into());
    inst.push(0x89);
    push_modrm(&mut inst, src.low(), dst.into());
    inst
}

/// `mov dst32, imm32` (zero-extends into the full register).
pub fn mov_r32_imm(dst: Gpr, imm: u32) -> Inst {
    let mut inst = Inst::new();
    if dst.ext() != 0 {
        inst.push(0x41);
    }
    inst.push(0xB8 + dst.low());
    inst.push_i32(imm as i32);
    inst
}

/// `xor dst32, src32`
pub fn xor_r32(dst: Gpr, src: Gpr) -> Inst {
    let mut inst = Inst::new();
    push_rex(&mut inst, false, src.ext(), dst.into());
    inst.push(0x31);
    push_modrm(&mut inst, src.low(), dst.into());
    inst
}

fn alu_ri(ext: u8, dst: Gpr, imm: i32) -> Inst {
    let mut inst = Inst::new();
    push_rex(&mut inst, true, 0, dst.into());
    if fits_i8(imm) {
        inst.push(0x83);
        push_modrm(&mut inst, ext, dst.into());
        inst.push(imm as i8 as u8);
    } else {
        inst.push(0x81);
        push_modrm(&mut inst, ext, dst.into());
        inst.push_i32(imm);
    }
    inst
}

/// `add dst, imm` (64-bit, imm8 form when it fits).
pub fn add_ri(dst: Gpr, imm: i32) -> Inst {
    alu_ri(0, dst, imm)
}

/// `sub dst, imm` (64-bit).
pub fn sub_ri(dst: Gpr, imm: i32) -> Inst {
    alu_ri(5, dst, imm)
}

/// `cmp dst, imm` (64-bit).
pub fn cmp_ri(dst: Gpr, imm: i32) -> Inst {
    alu_ri(7, dst, imm)
}

/// `dec r` (64-bit).
pub fn dec(r: Gpr) -> Inst {
    let mut inst = Inst::new();
    push_rex(&mut inst, true, 0, r.into());
    inst.push(0xFF);
    push_modrm(&mut inst, 1, r.into());
    inst
}

/// `lea dst, [mem]`
pub fn lea(dst: Gpr, mem: Mem) -> Inst {
    let mut inst = Inst::new();
    push_rex(&mut inst, true, dst.ext(), mem.into());
    inst.push(0x8D);
    push_modrm(&mut inst, dst.low(), mem.into());
    inst
}

pub fn jcc_rel8(cc: Cond, rel: i8) -> Inst {
    from_bytes(&[0x70 | cc as u8, rel as u8])
}

pub fn jcc_rel32(cc: Cond, rel: i32) -> Inst {
    let mut inst = from_bytes(&[0x0F, 0x80 | cc as u8]);
    inst.push_i32(rel);
    inst
}

pub fn jmp_rel8(rel: i8) -> Inst {
    from_bytes(&[0xEB, rel as u8])
}

pub fn jmp_rel32(rel: i32) -> Inst {
    let mut inst = from_bytes(&[0xE9]);
    inst.push_i32(rel);
    inst
}

pub fn ret() -> Inst {
    from_bytes(&[0xC3])
}

pub fn int3() -> Inst {
    from_bytes(&[0xCC])
}

pub fn vzeroupper() -> Inst {
    from_bytes(&[0xC5, 0xF8, 0x77])
}

// ── VEX-encoded vector instructions ─────────────────────────────────────────

/// Opcode map selected by VEX.mmmmm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Map {
    M0F = 1,
    M0F38 = 2,
    M0F3A = 3,
}

/// Implied legacy prefix selected by VEX.pp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Pp {
    None = 0,
    P66 = 1,
    PF3 = 2,
    PF2 = 3,
}

/// Static description of one VEX opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VexOp {
    pub map: Map,
    pub pp: Pp,
    pub w: bool,
    pub opcode: u8,
}

const fn op(map: Map, pp: Pp, opcode: u8) -> VexOp {
    VexOp { map, pp, w: false, opcode }
}

pub const VMOVUPS_LOAD: VexOp = op(Map::M0F, Pp::None, 0x10);
pub const VMOVUPS_STORE: VexOp = op(Map::M0F, Pp::None, 0x11);
pub const VMOVSS_LOAD: VexOp = op(Map::M0F, Pp::PF3, 0x10);
pub const VMOVSS_STORE: VexOp = op(Map::M0F, Pp::PF3, 0x11);
pub const VADDPS: VexOp = op(Map::M0F, Pp::None, 0x58);
pub const VMULPS: VexOp = op(Map::M0F, Pp::None, 0x59);
pub const VMULSS: VexOp = op(Map::M0F, Pp::PF3, 0x59);
pub const VSUBPS: VexOp = op(Map::M0F, Pp::None, 0x5C);
pub const VMINPS: VexOp = op(Map::M0F, Pp::None, 0x5D);
pub const VDIVPS: VexOp = op(Map::M0F, Pp::None, 0x5E);
pub const VMAXPS: VexOp = op(Map::M0F, Pp::None, 0x5F);
pub const VXORPS: VexOp = op(Map::M0F, Pp::None, 0x57);
pub const VRCPPS: VexOp = op(Map::M0F, Pp::None, 0x53);
pub const VCVTPS2DQ: VexOp = op(Map::M0F, Pp::P66, 0x5B);
pub const VPADDD: VexOp = op(Map::M0F, Pp::P66, 0xFE);
pub const VPSLLD_IMM: VexOp = op(Map::M0F, Pp::P66, 0x72);
pub const VBROADCASTSS: VexOp = op(Map::M0F38, Pp::P66, 0x18);
pub const VFMADD213PS: VexOp = op(Map::M0F38, Pp::P66, 0xA8);
pub const VFMADD231PS: VexOp = op(Map::M0F38, Pp::P66, 0xB8);
pub const VFMADD231SS: VexOp = op(Map::M0F38, Pp::P66, 0xB9);
pub const VROUNDPS: VexOp = op(Map::M0F3A, Pp::P66, 0x08);

/// Generic VEX encoder: `reg` goes in ModRM.reg, `vvvv` names the extra
/// source (pass 0 when unused), `rm` is the ModRM r/m operand.
///
/// Uses the 2-byte C5 form whenever the opcode lives in map 0F with W=0 and
/// neither X nor B extension is needed.
pub fn vex(op: VexOp, len: VecLen, reg: u8, vvvv: u8, rm: Rm) -> Inst {
    let mut inst = Inst::new();
    let r = (reg >> 3) & 1;
    let (x, b) = rm_ext(rm);
    let tail = ((!vvvv & 0x0F) << 3) | (len.l_bit() << 2) | op.pp as u8;
    if op.map == Map::M0F && !op.w && x == 0 && b == 0 {
        inst.push(0xC5);
        inst.push(((r ^ 1) << 7) | tail);
    } else {
        inst.push(0xC4);
        inst.push(((r ^ 1) << 7) | ((x ^ 1) << 6) | ((b ^ 1) << 5) | op.map as u8);
        inst.push(((op.w as u8) << 7) | tail);
    }
    inst.push(op.opcode);
    push_modrm(&mut inst, reg, rm);
    inst
}

/// Three-operand form `dst = src1 <op> src2`.
pub fn vop3(op: VexOp, len: VecLen, dst: VReg, src1: VReg, src2: impl Into<Rm>) -> Inst {
    vex(op, len, dst.0, src1.0, src2.into())
}

/// Two-operand form `dst = op(src)` (vvvv unused).
pub fn vop2(op: VexOp, len: VecLen, dst: VReg, src: impl Into<Rm>) -> Inst {
    vex(op, len, dst.0, 0, src.into())
}

pub fn vmovups_load(len: VecLen, dst: VReg, src: Mem) -> Inst {
    vop2(VMOVUPS_LOAD, len, dst, src)
}

pub fn vmovups_store(len: VecLen, dst: Mem, src: VReg) -> Inst {
    vex(VMOVUPS_STORE, len, src.0, 0, dst.into())
}

pub fn vmovss_load(dst: VReg, src: Mem) -> Inst {
    vop2(VMOVSS_LOAD, VecLen::X128, dst, src)
}

pub fn vmovss_store(dst: Mem, src: VReg) -> Inst {
    vex(VMOVSS_STORE, VecLen::X128, src.0, 0, dst.into())
}

/// `vbroadcastss dst, m32` (AVX) or `vbroadcastss dst, xmm` (AVX2).
pub fn vbroadcastss(len: VecLen, dst: VReg, src: impl Into<Rm>) -> Inst {
    vop2(VBROADCASTSS, len, dst, src)
}

/// `vroundps dst, src, imm8`
pub fn vroundps(len: VecLen, dst: VReg, src: VReg, mode: u8) -> Inst {
    let mut inst = vop2(VROUNDPS, len, dst, src);
    inst.push(mode);
    inst
}

/// `vpslld dst, src, imm8` (VEX.NDD: destination travels in vvvv).
pub fn vpslld_imm(len: VecLen, dst: VReg, src: VReg, shift: u8) -> Inst {
    let mut inst = vex(VPSLLD_IMM, len, 6, dst.0, src.into());
    inst.push(shift);
    inst
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(inst: Inst) -> Vec<u8> {
        inst.as_bytes().to_vec()
    }

    #[test]
    fn test_push_pop() {
        assert_eq!(bytes(push(Gpr::RBP)), [0x55]);
        assert_eq!(bytes(push(Gpr::R12)), [0x41, 0x54]);
        assert_eq!(bytes(pop(Gpr::R13)), [0x41, 0x5D]);
        assert_eq!(bytes(pop(Gpr::RBX)), [0x5B]);
    }

    #[test]
    fn test_mov_xor() {
        assert_eq!(bytes(mov_rr(Gpr::RBP, Gpr::RSP)), [0x48, 0x89, 0xE5]);
        assert_eq!(bytes(mov_rr(Gpr::R10, Gpr::RDI)), [0x49, 0x89, 0xFA]);
        assert_eq!(bytes(mov_r32_imm(Gpr::RBX, 5)), [0xBB, 5, 0, 0, 0]);
        assert_eq!(bytes(mov_r32_imm(Gpr::R9, 8)), [0x41, 0xB9, 8, 0, 0, 0]);
        assert_eq!(bytes(xor_r32(Gpr::RAX, Gpr::RAX)), [0x31, 0xC0]);
        assert_eq!(bytes(xor_r32(Gpr::RCX, Gpr::RCX)), [0x31, 0xC9]);
    }

    #[test]
    fn test_alu_imm_forms() {
        assert_eq!(bytes(add_ri(Gpr::RCX, 4)), [0x48, 0x83, 0xC1, 0x04]);
        assert_eq!(bytes(add_ri(Gpr::R8, 0x100)), [0x49, 0x81, 0xC0, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(bytes(cmp_ri(Gpr::RAX, 64)), [0x48, 0x83, 0xF8, 0x40]);
        assert_eq!(bytes(cmp_ri(Gpr::RAX, 4096)), [0x48, 0x81, 0xF8, 0x00, 0x10, 0x00, 0x00]);
        assert_eq!(bytes(sub_ri(Gpr::RSP, 8)), [0x48, 0x83, 0xEC, 0x08]);
        assert_eq!(bytes(dec(Gpr::R9)), [0x49, 0xFF, 0xC9]);
        assert_eq!(bytes(dec(Gpr::RBX)), [0x48, 0xFF, 0xCB]);
    }

    #[test]
    fn test_lea_sib() {
        assert_eq!(bytes(lea(Gpr::R8, Mem::indexed(Gpr::RSI, Gpr::RAX, 0))), [0x4C, 0x8D, 0x04, 0x06]);
        assert_eq!(bytes(lea(Gpr::R12, Mem::indexed(Gpr::R11, Gpr::RAX, 0))), [0x4D, 0x8D, 0x24, 0x03]);
    }

    #[test]
    fn test_jumps() {
        assert_eq!(bytes(jcc_rel8(Cond::B, -10)), [0x72, 0xF6]);
        assert_eq!(bytes(jcc_rel32(Cond::Ne, 0x100)), [0x0F, 0x85, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(bytes(jmp_rel8(2)), [0xEB, 0x02]);
        assert_eq!(jcc_rel8(Cond::Ne, 0).len(), JCC_REL8_LEN);
        assert_eq!(jcc_rel32(Cond::Ne, 0).len(), JCC_REL32_LEN);
        assert_eq!(jmp_rel32(0).len(), JMP_REL32_LEN);
    }

    #[test]
    fn test_vex2_forms() {
        let y = VecLen::Y256;
        assert_eq!(bytes(vop3(VADDPS, y, VReg(0), VReg(1), VReg(2))), [0xC5, 0xF4, 0x58, 0xC2]);
        assert_eq!(bytes(vmovups_load(y, VReg(0), Mem::base(Gpr::RDI, 0))), [0xC5, 0xFC, 0x10, 0x07]);
        assert_eq!(bytes(vpslld_imm(y, VReg(3), VReg(3), 23)), [0xC5, 0xE5, 0x72, 0xF3, 0x17]);
        assert_eq!(bytes(vop2(VCVTPS2DQ, y, VReg(3), VReg(3))), [0xC5, 0xFD, 0x5B, 0xDB]);
        assert_eq!(bytes(vop2(VRCPPS, y, VReg(3), VReg(2))), [0xC5, 0xFC, 0x53, 0xDA]);
        assert_eq!(bytes(vzeroupper()), [0xC5, 0xF8, 0x77]);
        // R extension still fits the 2-byte form.
        assert_eq!(
            bytes(vmovss_load(VReg(9), Mem::base(Gpr::RCX, 64))),
            [0xC5, 0x7A, 0x10, 0x49, 0x40]
        );
    }

    #[test]
    fn test_vex3_forms() {
        let y = VecLen::Y256;
        assert_eq!(
            bytes(vop3(VFMADD231PS, y, VReg(0), VReg(1), VReg(2))),
            [0xC4, 0xE2, 0x75, 0xB8, 0xC2]
        );
        assert_eq!(
            bytes(vbroadcastss(y, VReg(0), Mem::base(Gpr::RDI, 0))),
            [0xC4, 0xE2, 0x7D, 0x18, 0x07]
        );
        assert_eq!(bytes(vbroadcastss(y, VReg(14), VReg(0))), [0xC4, 0x62, 0x7D, 0x18, 0xF0]);
        assert_eq!(
            bytes(vmovups_store(y, Mem::base(Gpr::R12, 32), VReg(1))),
            [0xC4, 0xC1, 0x7C, 0x11, 0x4C, 0x24, 0x20]
        );
        assert_eq!(bytes(vroundps(y, VReg(3), VReg(1), 0)), [0xC4, 0xE3, 0x7D, 0x08, 0xD9, 0x00]);
    }

    #[test]
    fn test_rbp_r13_base_needs_disp8() {
        assert_eq!(
            bytes(vmovups_load(VecLen::Y256, VReg(0), Mem::base(Gpr::R13, 0))),
            [0xC4, 0xC1, 0x7C, 0x10, 0x45, 0x00]
        );
    }

    #[test]
    fn test_rip_relative_marks_disp() {
        let inst = vbroadcastss(VecLen::Y256, VReg(1), Mem::Rip { disp: 0x100 });
        assert_eq!(bytes(inst), [0xC4, 0xE2, 0x7D, 0x18, 0x0D, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(inst.rip_disp_offset(), Some(5));
        assert_eq!(mov_rr(Gpr::RAX, Gpr::RBX).rip_disp_offset(), None);
    }

    #[test]
    fn test_iced_agrees_on_mnemonics() {
        use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter, MemorySizeOptions};

        let cases: Vec<(Inst, &str)> = vec![
            (vop3(VFMADD213PS, VecLen::Y256, VReg(3), VReg(2), VReg(4)), "vfmadd213ps ymm3,ymm2,ymm4"),
            (vop3(VFMADD231SS, VecLen::X128, VReg(5), VReg(15), Mem::base(Gpr::R12, 8)), "vfmadd231ss xmm5,xmm15,[r12+8]"),
            (vop3(VMAXPS, VecLen::X128, VReg(0), VReg(0), VReg(1)), "vmaxps xmm0,xmm0,xmm1"),
            (vop3(VPADDD, VecLen::Y256, VReg(3), VReg(3), VReg(1)), "vpaddd ymm3,ymm3,ymm1"),
            (vmovups_store(VecLen::Y256, Mem::indexed(Gpr::RSI, Gpr::RCX, 0), VReg(0)), "vmovups [rsi+rcx],ymm0"),
            (vmovss_store(Mem::base(Gpr::RBP, -4), VReg(2)), "vmovss [rbp-4],xmm2"),
            (lea(Gpr::R12, Mem::indexed(Gpr::R11, Gpr::RAX, 0)), "lea r12,[r11+rax]"),
        ];

        let mut formatter = IntelFormatter::new();
        formatter.options_mut().set_space_after_operand_separator(false);
        formatter.options_mut().set_memory_size_options(MemorySizeOptions::Never);
        for (inst, expected) in cases {
            let mut decoder = Decoder::new(64, inst.as_bytes(), DecoderOptions::NONE);
            let decoded = decoder.decode();
            assert_eq!(decoded.len(), inst.len(), "{expected}");
            let mut out = String::new();
            formatter.format(&decoded, &mut out);
            assert_eq!(out, expected);
        }
    }
}
