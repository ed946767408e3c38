//! Bounded code buffer with labels and a RIP-relative constant pool.
//!
//! The emitter owns a growable byte vector with a hard capacity. Writes past
//! the capacity are dropped and latch an overflow flag, so generators can
//! emit straight-line without checking every call; `finish()` turns the
//! flag into `CodeGenOverflow` and the partial bytes are discarded.
//!
//! Jumps to bound labels (backward) use the rel8 form when the displacement
//! `target - (offset + len)` fits, else rel32. Jumps to unbound labels
//! (forward) are emitted as rel32 and patched in `finish()`.

use super::x86_64::{self as enc, Cond, Inst, Mem, VReg, VecLen};
use crate::types::{JitError, JitResult};

/// A jump target inside the buffer being emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

/// Pending rel32 displacement: `at` is the disp32 position, `end` the
/// offset of the next instruction.
#[derive(Debug, Clone, Copy)]
struct Patch {
    at: usize,
    end: usize,
    target: PatchTarget,
}

#[derive(Debug, Clone, Copy)]
enum PatchTarget {
    Label(Label),
    Const(usize),
}

pub struct CodeEmitter {
    buf: Vec<u8>,
    limit: usize,
    overflowed: bool,
    labels: Vec<Option<usize>>,
    patches: Vec<Patch>,
    consts: Vec<u32>,
    error: Option<String>,
}

/// Constant pool entries are 4-byte scalars, aligned to this boundary.
const POOL_ALIGN: usize = 16;

impl CodeEmitter {
    /// Emitter that refuses to grow beyond `limit` bytes (code + constants).
    pub fn with_capacity(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(64 * 1024)),
            limit,
            overflowed: false,
            labels: Vec::new(),
            patches: Vec::new(),
            consts: Vec::new(),
            error: None,
        }
    }

    /// Current write offset.
    #[inline]
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.limit
    }

    #[inline]
    pub fn has_overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn emit_byte(&mut self, b: u8) {
        if self.buf.len() < self.limit {
            self.buf.push(b);
        } else {
            self.overflowed = true;
        }
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        if bytes.len() <= room {
            self.buf.extend_from_slice(bytes);
        } else {
            self.buf.extend_from_slice(&bytes[..room]);
            self.overflowed = true;
        }
    }

    pub fn emit_u32(&mut self, v: u32) {
        self.emit_bytes(&v.to_le_bytes());
    }

    /// Append one encoded instruction, returning its start offset.
    pub fn emit(&mut self, inst: Inst) -> usize {
        let start = self.offset();
        self.emit_bytes(inst.as_bytes());
        start
    }

    pub fn new_label(&mut self) -> Label {
        let id = self.labels.len() as u32;
        self.labels.push(None);
        Label(id)
    }

    /// Bind `label` to the current offset.
    pub fn bind(&mut self, label: Label) {
        let slot = &mut self.labels[label.0 as usize];
        debug_assert!(slot.is_none(), "label bound twice");
        *slot = Some(self.buf.len());
    }

    pub fn jcc(&mut self, cc: Cond, label: Label) {
        self.branch(
            label,
            |rel| enc::jcc_rel8(cc, rel),
            |rel| enc::jcc_rel32(cc, rel),
            enc::JCC_REL8_LEN,
            enc::JCC_REL32_LEN,
        );
    }

    pub fn jmp(&mut self, label: Label) {
        self.branch(label, enc::jmp_rel8, enc::jmp_rel32, enc::JMP_REL8_LEN, enc::JMP_REL32_LEN);
    }

    fn branch(
        &mut self,
        label: Label,
        short: impl Fn(i8) -> Inst,
        long: impl Fn(i32) -> Inst,
        short_len: usize,
        long_len: usize,
    ) {
        let here = self.offset();
        match self.labels[label.0 as usize] {
            Some(target) => {
                let rel8 = target as i64 - (here + short_len) as i64;
                if let Ok(rel) = i8::try_from(rel8) {
                    self.emit(short(rel));
                    return;
                }
                let rel32 = target as i64 - (here + long_len) as i64;
                match i32::try_from(rel32) {
                    Ok(rel) => {
                        self.emit(long(rel));
                    }
                    Err(_) => self.fail(format!("backward jump of {rel32} bytes exceeds rel32")),
                }
            }
            None => {
                self.emit(long(0));
                self.patches.push(Patch {
                    at: here + long_len - 4,
                    end: here + long_len,
                    target: PatchTarget::Label(label),
                });
            }
        }
    }

    /// `vbroadcastss dst, [rip + const]` with `value` placed in the pool.
    pub fn broadcast_const(&mut self, len: VecLen, dst: VReg, value: f32) {
        self.broadcast_bits(len, dst, value.to_bits());
    }

    /// Same as [`broadcast_const`](Self::broadcast_const) for a raw 32-bit
    /// pattern (integer constants for the exponent tricks).
    pub fn broadcast_bits(&mut self, len: VecLen, dst: VReg, bits: u32) {
        let slot = match self.consts.iter().position(|&c| c == bits) {
            Some(slot) => slot,
            None => {
                self.consts.push(bits);
                self.consts.len() - 1
            }
        };
        let inst = enc::vbroadcastss(len, dst, Mem::rip());
        let start = self.emit(inst);
        if let Some(at) = inst.rip_disp_offset() {
            self.patches.push(Patch {
                at: start + at,
                end: start + inst.len(),
                target: PatchTarget::Const(slot),
            });
        }
    }

    fn fail(&mut self, reason: String) {
        if self.error.is_none() {
            self.error = Some(reason);
        }
    }

    /// Lay out the constant pool, resolve every patch, and hand back the
    /// finished bytes.
    pub fn finish(mut self) -> JitResult<Vec<u8>> {
        if let Some(reason) = self.error.take() {
            return Err(JitError::overflow(reason));
        }

        let pool_start = if self.consts.is_empty() {
            self.offset()
        } else {
            while self.offset() % POOL_ALIGN != 0 {
                self.emit(enc::int3());
            }
            let start = self.offset();
            for i in 0..self.consts.len() {
                let bits = self.consts[i];
                self.emit_u32(bits);
            }
            start
        };

        if self.overflowed {
            return Err(JitError::overflow(format!(
                "kernel exceeds {}-byte code buffer",
                self.limit
            )));
        }

        for patch in &self.patches {
            let target = match patch.target {
                PatchTarget::Label(label) => self.labels[label.0 as usize]
                    .ok_or_else(|| JitError::overflow(format!("jump to unbound label {}", label.0)))?,
                PatchTarget::Const(slot) => pool_start + slot * 4,
            };
            let rel = target as i64 - patch.end as i64;
            let rel = i32::try_from(rel)
                .map_err(|_| JitError::overflow(format!("displacement {rel} exceeds rel32")))?;
            self.buf[patch.at..patch.at + 4].copy_from_slice(&rel.to_le_bytes());
        }

        Ok(self.buf)
    }
}
