// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! A small DWARF expression evaluator, used only to compute the CFA when
//! a CIE/FDE describes it with `DW_CFA_def_cfa_expression` instead of
//! register + offset.
//!
//! It is a postfix stack machine over 64-bit words with a fixed operand
//! stack: values and literals push, operators pop their inputs and push
//! their result, and a valid expression leaves exactly one value behind.
//! Register operands read from the *callee's* not-yet-unwound frame;
//! `deref` goes through the injected memory capability and a faulting
//! read aborts evaluation rather than producing a made-up value.

use std::convert::TryFrom;
use tracing::debug;

use crate::context::{MemoryAccess, RegisterLayout, RegisterSnapshot};
use crate::encoding::Cursor;
use crate::UnwindError;

const DW_OP_DEREF: u8 = 0x06;
const DW_OP_CONST1U: u8 = 0x08;
const DW_OP_CONST1S: u8 = 0x09;
const DW_OP_CONST2U: u8 = 0x0a;
const DW_OP_CONST2S: u8 = 0x0b;
const DW_OP_CONST4U: u8 = 0x0c;
const DW_OP_CONST4S: u8 = 0x0d;
const DW_OP_CONST8U: u8 = 0x0e;
const DW_OP_CONST8S: u8 = 0x0f;
const DW_OP_CONSTU: u8 = 0x10;
const DW_OP_CONSTS: u8 = 0x11;
const DW_OP_DUP: u8 = 0x12;
const DW_OP_DROP: u8 = 0x13;
const DW_OP_OVER: u8 = 0x14;
const DW_OP_PICK: u8 = 0x15;
const DW_OP_SWAP: u8 = 0x16;
const DW_OP_ROT: u8 = 0x17;
const DW_OP_ABS: u8 = 0x19;
const DW_OP_AND: u8 = 0x1a;
const DW_OP_DIV: u8 = 0x1b;
const DW_OP_MINUS: u8 = 0x1c;
const DW_OP_MOD: u8 = 0x1d;
const DW_OP_MUL: u8 = 0x1e;
const DW_OP_NEG: u8 = 0x1f;
const DW_OP_NOT: u8 = 0x20;
const DW_OP_OR: u8 = 0x21;
const DW_OP_PLUS: u8 = 0x22;
const DW_OP_PLUS_UCONST: u8 = 0x23;
const DW_OP_SHL: u8 = 0x24;
const DW_OP_SHR: u8 = 0x25;
const DW_OP_SHRA: u8 = 0x26;
const DW_OP_XOR: u8 = 0x27;
const DW_OP_BRA: u8 = 0x28;
const DW_OP_EQ: u8 = 0x29;
const DW_OP_GE: u8 = 0x2a;
const DW_OP_GT: u8 = 0x2b;
const DW_OP_LE: u8 = 0x2c;
const DW_OP_LT: u8 = 0x2d;
const DW_OP_NE: u8 = 0x2e;
const DW_OP_SKIP: u8 = 0x2f;
const DW_OP_LIT0: u8 = 0x30;
const DW_OP_LIT31: u8 = 0x4f;
const DW_OP_BREG0: u8 = 0x70;
const DW_OP_BREG31: u8 = 0x8f;
const DW_OP_BREGX: u8 = 0x92;

/// Operand stack depth. CFA expressions in the wild are shallow; hitting
/// this bound means the expression is wrong for this use, not that the
/// bound is too small.
const MAX_EXPR_STACK: usize = 8;

/// Ceiling on executed operations. `skip`/`bra` may branch backwards
/// within the expression, so the byte extent alone does not bound the
/// instruction count.
const MAX_EXPR_OPS: u32 = 1 << 12;

struct Stack {
    slots: [u64; MAX_EXPR_STACK],
    depth: usize,
}

impl Stack {
    fn new() -> Stack {
        Stack {
            slots: [0; MAX_EXPR_STACK],
            depth: 0,
        }
    }

    fn push(&mut self, value: u64) -> Result<(), UnwindError> {
        if self.depth >= MAX_EXPR_STACK {
            debug!("expression stack overflow");
            return Err(UnwindError::MalformedData);
        }
        self.slots[self.depth] = value;
        self.depth += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<u64, UnwindError> {
        if self.depth == 0 {
            debug!("expression stack underflow");
            return Err(UnwindError::MalformedData);
        }
        self.depth -= 1;
        Ok(self.slots[self.depth])
    }

    /// The value `index` entries below the top, without popping.
    fn pick(&self, index: usize) -> Result<u64, UnwindError> {
        if index >= self.depth {
            debug!("pick past the bottom of the expression stack");
            return Err(UnwindError::MalformedData);
        }
        Ok(self.slots[self.depth - 1 - index])
    }
}

/// Evaluate the expression in `window` of `frame`, returning the single
/// value a well-formed expression leaves on the stack.
pub(crate) fn evaluate(
    frame: &[u8],
    frame_base: u64,
    window: std::ops::Range<usize>,
    snapshot: &RegisterSnapshot<'_>,
    layout: &RegisterLayout,
    memory: Option<&dyn MemoryAccess>,
) -> Result<u64, UnwindError> {
    let start = window.start;
    let end = window.end;
    let mut cur = Cursor::with_window(frame, frame_base, window)?;
    let mut stack = Stack::new();
    let mut ops = MAX_EXPR_OPS;
    let word = layout.word_size();

    let read_breg = |reg: u64, offset: i64| -> Result<u64, UnwindError> {
        let idx = usize::try_from(reg)
            .ok()
            .filter(|&r| r < layout.num_registers() && layout.is_present(r))
            .ok_or_else(|| {
                debug!("expression reads unknown register {}", reg);
                UnwindError::MalformedData
            })?;
        if layout.slot(idx).width != word {
            debug!("expression reads non-word-sized register {}", idx);
            return Err(UnwindError::MalformedData);
        }
        let value = snapshot
            .get(layout, idx)
            .ok_or(UnwindError::MalformedData)?;
        Ok(value.wrapping_add(offset as u64))
    };

    while !cur.at_end() {
        ops = ops.checked_sub(1).ok_or_else(|| {
            debug!("expression operation budget exhausted");
            UnwindError::MalformedData
        })?;
        let op = cur.read_u8()?;
        match op {
            DW_OP_LIT0..=DW_OP_LIT31 => stack.push(u64::from(op - DW_OP_LIT0))?,
            DW_OP_CONST1U => {
                let v = cur.read_u8()?;
                stack.push(u64::from(v))?;
            }
            DW_OP_CONST1S => {
                let v = cur.read_u8()?;
                stack.push(v as i8 as i64 as u64)?;
            }
            DW_OP_CONST2U => {
                let v = cur.read_u16()?;
                stack.push(u64::from(v))?;
            }
            DW_OP_CONST2S => {
                let v = cur.read_u16()?;
                stack.push(v as i16 as i64 as u64)?;
            }
            DW_OP_CONST4U => {
                let v = cur.read_u32()?;
                stack.push(u64::from(v))?;
            }
            DW_OP_CONST4S => {
                let v = cur.read_u32()?;
                stack.push(v as i32 as i64 as u64)?;
            }
            DW_OP_CONST8U | DW_OP_CONST8S => {
                let v = cur.read_u64()?;
                stack.push(v)?;
            }
            DW_OP_CONSTU => {
                let v = cur.read_uleb128();
                stack.push(v)?;
            }
            DW_OP_CONSTS => {
                let v = cur.read_sleb128();
                stack.push(v as u64)?;
            }
            DW_OP_DUP => {
                let v = stack.pick(0)?;
                stack.push(v)?;
            }
            DW_OP_DROP => {
                stack.pop()?;
            }
            DW_OP_OVER => {
                let v = stack.pick(1)?;
                stack.push(v)?;
            }
            DW_OP_PICK => {
                let index = cur.read_u8()?;
                let v = stack.pick(index as usize)?;
                stack.push(v)?;
            }
            DW_OP_SWAP => {
                let a = stack.pop()?;
                let b = stack.pop()?;
                stack.push(a)?;
                stack.push(b)?;
            }
            DW_OP_ROT => {
                let a = stack.pop()?;
                let b = stack.pop()?;
                let c = stack.pop()?;
                stack.push(a)?;
                stack.push(c)?;
                stack.push(b)?;
            }
            DW_OP_DEREF => {
                let addr = stack.pop()?;
                let memory = memory.ok_or(UnwindError::Fault)?;
                let value = memory.safe_read(addr, word).ok_or(UnwindError::Fault)?;
                stack.push(value)?;
            }
            DW_OP_ABS => {
                let v = stack.pop()?;
                stack.push((v as i64).unsigned_abs())?;
            }
            DW_OP_NEG => {
                let v = stack.pop()?;
                stack.push((v as i64).wrapping_neg() as u64)?;
            }
            DW_OP_NOT => {
                let v = stack.pop()?;
                stack.push(!v)?;
            }
            DW_OP_PLUS_UCONST => {
                let v = stack.pop()?;
                stack.push(v.wrapping_add(cur.read_uleb128()))?;
            }
            DW_OP_AND => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs & rhs)?;
            }
            DW_OP_OR => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs | rhs)?;
            }
            DW_OP_XOR => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs ^ rhs)?;
            }
            DW_OP_PLUS => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs.wrapping_add(rhs))?;
            }
            DW_OP_MINUS => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs.wrapping_sub(rhs))?;
            }
            DW_OP_MUL => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs.wrapping_mul(rhs))?;
            }
            DW_OP_DIV => {
                // Signed, per DWARF.
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                if rhs == 0 {
                    debug!("expression divides by zero");
                    return Err(UnwindError::MalformedData);
                }
                stack.push((lhs as i64).wrapping_div(rhs as i64) as u64)?;
            }
            DW_OP_MOD => {
                // Unsigned, per DWARF.
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                if rhs == 0 {
                    debug!("expression takes a modulus by zero");
                    return Err(UnwindError::MalformedData);
                }
                stack.push(lhs % rhs)?;
            }
            DW_OP_SHL => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs.checked_shl(rhs.min(64) as u32).unwrap_or(0))?;
            }
            DW_OP_SHR => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs.checked_shr(rhs.min(64) as u32).unwrap_or(0))?;
            }
            DW_OP_SHRA => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(((lhs as i64) >> rhs.min(63)) as u64)?;
            }
            DW_OP_EQ | DW_OP_GE | DW_OP_GT | DW_OP_LE | DW_OP_LT | DW_OP_NE => {
                // Comparisons are signed, per DWARF.
                let rhs = stack.pop()? as i64;
                let lhs = stack.pop()? as i64;
                let result = match op {
                    DW_OP_EQ => lhs == rhs,
                    DW_OP_GE => lhs >= rhs,
                    DW_OP_GT => lhs > rhs,
                    DW_OP_LE => lhs <= rhs,
                    DW_OP_LT => lhs < rhs,
                    _ => lhs != rhs,
                };
                stack.push(result as u64)?;
            }
            DW_OP_BRA | DW_OP_SKIP => {
                let displacement = cur.read_u16()? as i16;
                let taken = op == DW_OP_SKIP || stack.pop()? != 0;
                if taken {
                    let to = cur.pos() as i64 + i64::from(displacement);
                    if to < start as i64 || to > end as i64 {
                        debug!("expression branch escapes its extent");
                        return Err(UnwindError::MalformedData);
                    }
                    cur.set_pos(to as usize)?;
                }
            }
            DW_OP_BREG0..=DW_OP_BREG31 => {
                let offset = cur.read_sleb128();
                stack.push(read_breg(u64::from(op - DW_OP_BREG0), offset)?)?;
            }
            DW_OP_BREGX => {
                let reg = cur.read_uleb128();
                let offset = cur.read_sleb128();
                stack.push(read_breg(reg, offset)?)?;
            }
            _ => {
                debug!("unsupported expression opcode 0x{:02x}", op);
                return Err(UnwindError::MalformedData);
            }
        }
    }

    if stack.depth != 1 {
        debug!(
            "expression finished with {} values on the stack",
            stack.depth
        );
        return Err(UnwindError::MalformedData);
    }
    stack.pop()
}
