// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The CFI instruction interpreter.
//!
//! A CIE and FDE together describe a table: one row per program-counter
//! range, one column per register, plus the CFA column. The encoding is a
//! bytecode that builds that table row by row, and unwinding one frame
//! means executing the CIE's instructions and then the FDE's until the row
//! covering the queried pc is complete. The interpreter below keeps only
//! the current row: a [`CfaRule`] and one [`RegisterRule`] per tracked
//! column.
//!
//! `remember_state`/`restore_state` do not snapshot the whole row onto the
//! state stack. Instead the stack holds the *byte position* of each
//! `remember_state` instruction, and `restore_state` rewinds by clearing
//! the row and re-running the CIE and FDE streams from the top with that
//! position armed as a one-shot label; the replay terminates when it
//! reaches the matching `remember_state`, leaving exactly the rules that
//! were in force there. Positions are offsets into the full table slice,
//! so labels are stable across the nested replays this produces.

use std::convert::TryFrom;
use std::ops::Range;
use tracing::{debug, trace};

use crate::context::{MemoryAccess, RegisterLayout, MAX_REGISTERS};
use crate::encoding::{Cursor, PointerCtx};
use crate::entry::{CieInfo, FdeInfo};
use crate::UnwindError;

// High-two-bit packed opcodes.
pub(crate) const DW_CFA_ADVANCE_LOC: u8 = 0x40;
pub(crate) const DW_CFA_OFFSET: u8 = 0x80;
pub(crate) const DW_CFA_RESTORE: u8 = 0xc0;

// Full-byte opcodes.
pub(crate) const DW_CFA_NOP: u8 = 0x00;
pub(crate) const DW_CFA_SET_LOC: u8 = 0x01;
pub(crate) const DW_CFA_ADVANCE_LOC1: u8 = 0x02;
pub(crate) const DW_CFA_ADVANCE_LOC2: u8 = 0x03;
pub(crate) const DW_CFA_ADVANCE_LOC4: u8 = 0x04;
pub(crate) const DW_CFA_OFFSET_EXTENDED: u8 = 0x05;
pub(crate) const DW_CFA_RESTORE_EXTENDED: u8 = 0x06;
pub(crate) const DW_CFA_UNDEFINED: u8 = 0x07;
pub(crate) const DW_CFA_SAME_VALUE: u8 = 0x08;
pub(crate) const DW_CFA_REGISTER: u8 = 0x09;
pub(crate) const DW_CFA_REMEMBER_STATE: u8 = 0x0a;
pub(crate) const DW_CFA_RESTORE_STATE: u8 = 0x0b;
pub(crate) const DW_CFA_DEF_CFA: u8 = 0x0c;
pub(crate) const DW_CFA_DEF_CFA_REGISTER: u8 = 0x0d;
pub(crate) const DW_CFA_DEF_CFA_OFFSET: u8 = 0x0e;
pub(crate) const DW_CFA_DEF_CFA_EXPRESSION: u8 = 0x0f;
pub(crate) const DW_CFA_EXPRESSION: u8 = 0x10;
pub(crate) const DW_CFA_OFFSET_EXTENDED_SF: u8 = 0x11;
pub(crate) const DW_CFA_DEF_CFA_SF: u8 = 0x12;
pub(crate) const DW_CFA_DEF_CFA_OFFSET_SF: u8 = 0x13;
pub(crate) const DW_CFA_VAL_OFFSET: u8 = 0x14;
pub(crate) const DW_CFA_VAL_OFFSET_SF: u8 = 0x15;
pub(crate) const DW_CFA_VAL_EXPRESSION: u8 = 0x16;
pub(crate) const DW_CFA_GNU_WINDOW_SAVE: u8 = 0x2d;
pub(crate) const DW_CFA_GNU_ARGS_SIZE: u8 = 0x2e;
pub(crate) const DW_CFA_GNU_NEGATIVE_OFFSET_EXTENDED: u8 = 0x2f;

/// Depth of the `remember_state` stack. A fixed DWARF-practice bound, not
/// an arbitrary limit; overflow is a malformed-data error.
pub(crate) const MAX_STATE_STACK: usize = 8;

/// Hard ceiling on instructions executed per unwind attempt, counting
/// `restore_state` replays. Real streams are a few dozen instructions;
/// this exists so pathological remember/restore nesting cannot consume
/// unbounded time.
const MAX_CFI_OPS: u32 = 1 << 16;

/// How to recover one register of the caller's frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RegisterRule {
    /// No rule. The stack pointer recovers as the CFA (that is the CFA's
    /// defining property); everything else is left untouched.
    Unset,
    /// Saved in memory at CFA + offset (offset already factored by the
    /// data alignment).
    AtCfaOffset(i64),
    /// The value *is* CFA + offset, no memory involved.
    ValCfaOffset(i64),
    /// A copy of another register of the callee's frame.
    InRegister(u64),
}

/// How to compute the canonical frame address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CfaRule {
    Unset,
    RegOffset { reg: u64, offset: i64 },
    /// Window of a DWARF expression in the table bytes.
    Expression(Range<usize>),
}

/// The interpreter's working row, plus the remember/restore machinery.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct UnwindState {
    /// Current virtual location; rules below apply from here on.
    pub loc: u64,
    pub cfa: CfaRule,
    pub regs: [RegisterRule; MAX_REGISTERS],
    /// Byte positions of pending `remember_state` instructions.
    stack: [usize; MAX_STATE_STACK],
    depth: usize,
    /// One-shot replay terminator; see the module docs.
    label: Option<usize>,
    /// Remaining instruction budget.
    ops: u32,
}

impl UnwindState {
    pub fn new(loc: u64) -> UnwindState {
        UnwindState {
            loc,
            cfa: CfaRule::Unset,
            regs: [RegisterRule::Unset; MAX_REGISTERS],
            stack: [0; MAX_STATE_STACK],
            depth: 0,
            label: None,
            ops: MAX_CFI_OPS,
        }
    }
}

/// One decoded CFI instruction. Packed and extended encodings of the same
/// operation collapse into a single variant; offsets arrive raw and are
/// factored by the interpreter.
#[derive(Clone, Debug, PartialEq, Eq)]
enum CfiInsn {
    Nop,
    SetLoc(u64),
    AdvanceLoc(u64),
    Offset { reg: u64, offset: u64 },
    OffsetSf { reg: u64, offset: i64 },
    NegOffset { reg: u64, offset: u64 },
    ValOffset { reg: u64, offset: u64 },
    ValOffsetSf { reg: u64, offset: i64 },
    Restore(u64),
    Undefined(u64),
    SameValue(u64),
    Register { reg: u64, src: u64 },
    RememberState,
    RestoreState,
    DefCfa { reg: u64, offset: u64 },
    DefCfaSf { reg: u64, offset: i64 },
    DefCfaRegister(u64),
    DefCfaOffset(u64),
    DefCfaOffsetSf(i64),
    DefCfaExpression(Range<usize>),
    ArgsSize(u64),
}

impl CfiInsn {
    /// Decode the instruction at the cursor. Anything outside the
    /// supported set -- per-register expression rules, `GNU_window_save`,
    /// vendor opcodes -- is a hard failure: its operands cannot be skipped
    /// safely.
    fn decode(cur: &mut Cursor<'_>, cie: &CieInfo, ctx: &PointerCtx<'_>) -> Result<CfiInsn, UnwindError> {
        let op = cur.read_u8()?;
        let low = u64::from(op & 0x3f);
        match op & 0xc0 {
            DW_CFA_ADVANCE_LOC => return Ok(CfiInsn::AdvanceLoc(low)),
            DW_CFA_OFFSET => {
                let offset = cur.read_uleb128();
                return Ok(CfiInsn::Offset { reg: low, offset });
            }
            DW_CFA_RESTORE => return Ok(CfiInsn::Restore(low)),
            _ => {}
        }
        let insn = match op {
            DW_CFA_NOP => CfiInsn::Nop,
            DW_CFA_SET_LOC => CfiInsn::SetLoc(cur.read_encoded_pointer(cie.ptr_encoding, ctx)?),
            DW_CFA_ADVANCE_LOC1 => CfiInsn::AdvanceLoc(u64::from(cur.read_u8()?)),
            DW_CFA_ADVANCE_LOC2 => CfiInsn::AdvanceLoc(u64::from(cur.read_u16()?)),
            DW_CFA_ADVANCE_LOC4 => CfiInsn::AdvanceLoc(u64::from(cur.read_u32()?)),
            DW_CFA_OFFSET_EXTENDED => CfiInsn::Offset {
                reg: cur.read_uleb128(),
                offset: cur.read_uleb128(),
            },
            DW_CFA_RESTORE_EXTENDED => CfiInsn::Restore(cur.read_uleb128()),
            DW_CFA_UNDEFINED => CfiInsn::Undefined(cur.read_uleb128()),
            DW_CFA_SAME_VALUE => CfiInsn::SameValue(cur.read_uleb128()),
            DW_CFA_REGISTER => CfiInsn::Register {
                reg: cur.read_uleb128(),
                src: cur.read_uleb128(),
            },
            DW_CFA_REMEMBER_STATE => CfiInsn::RememberState,
            DW_CFA_RESTORE_STATE => CfiInsn::RestoreState,
            DW_CFA_DEF_CFA => CfiInsn::DefCfa {
                reg: cur.read_uleb128(),
                offset: cur.read_uleb128(),
            },
            DW_CFA_DEF_CFA_SF => CfiInsn::DefCfaSf {
                reg: cur.read_uleb128(),
                offset: cur.read_sleb128(),
            },
            DW_CFA_DEF_CFA_REGISTER => CfiInsn::DefCfaRegister(cur.read_uleb128()),
            DW_CFA_DEF_CFA_OFFSET => CfiInsn::DefCfaOffset(cur.read_uleb128()),
            DW_CFA_DEF_CFA_OFFSET_SF => CfiInsn::DefCfaOffsetSf(cur.read_sleb128()),
            DW_CFA_DEF_CFA_EXPRESSION => {
                let length = cur.read_uleb128();
                if length == 0 {
                    debug!("def_cfa_expression with an empty expression");
                    return Err(UnwindError::MalformedData);
                }
                let length = usize::try_from(length).map_err(|_| UnwindError::MalformedData)?;
                let start = cur.pos();
                cur.skip(length)?;
                CfiInsn::DefCfaExpression(start..start + length)
            }
            DW_CFA_OFFSET_EXTENDED_SF => CfiInsn::OffsetSf {
                reg: cur.read_uleb128(),
                offset: cur.read_sleb128(),
            },
            DW_CFA_VAL_OFFSET => CfiInsn::ValOffset {
                reg: cur.read_uleb128(),
                offset: cur.read_uleb128(),
            },
            DW_CFA_VAL_OFFSET_SF => CfiInsn::ValOffsetSf {
                reg: cur.read_uleb128(),
                offset: cur.read_sleb128(),
            },
            DW_CFA_GNU_ARGS_SIZE => CfiInsn::ArgsSize(cur.read_uleb128()),
            DW_CFA_GNU_NEGATIVE_OFFSET_EXTENDED => CfiInsn::NegOffset {
                reg: cur.read_uleb128(),
                offset: cur.read_uleb128(),
            },
            DW_CFA_EXPRESSION | DW_CFA_VAL_EXPRESSION | DW_CFA_GNU_WINDOW_SAVE => {
                debug!("unsupported CFI opcode 0x{:02x}", op);
                return Err(UnwindError::MalformedData);
            }
            _ => {
                debug!("unknown CFI opcode 0x{:02x}", op);
                return Err(UnwindError::MalformedData);
            }
        };
        Ok(insn)
    }
}

/// One CIE/FDE pair bound to its table bytes, ready to execute.
pub(crate) struct CfiProgram<'a> {
    pub frame: &'a [u8],
    pub frame_base: u64,
    pub cie: &'a CieInfo,
    pub fde: &'a FdeInfo,
    pub layout: &'a RegisterLayout,
    pub memory: Option<&'a dyn MemoryAccess>,
}

impl<'a> CfiProgram<'a> {
    /// Execute the CIE's instructions in full, then the FDE's up to
    /// `target`. A zero target stops after the CIE (the defaults row).
    ///
    /// The FDE stream stops early once the location advances past
    /// `target`; running off the end of the stream without reaching it is
    /// fine, because compilers routinely omit rows after the prologue and
    /// the last row stays in force for the rest of the range.
    pub fn run(&self, state: &mut UnwindState, target: u64) -> Result<(), UnwindError> {
        self.run_stream(state, self.cie.instructions.clone(), 0)?;
        if target == 0 {
            return Ok(());
        }
        self.run_stream(state, self.fde.instructions.clone(), target)
    }

    fn run_stream(
        &self,
        state: &mut UnwindState,
        window: Range<usize>,
        target: u64,
    ) -> Result<(), UnwindError> {
        let ctx = PointerCtx {
            word_size: self.layout.word_size(),
            data_base: None,
            memory: self.memory,
        };
        let data_align = self.cie.data_align;
        let mut cur = Cursor::with_window(self.frame, self.frame_base, window)?;
        while !cur.at_end() {
            state.ops = state.ops.checked_sub(1).ok_or_else(|| {
                debug!("CFI instruction budget exhausted");
                UnwindError::MalformedData
            })?;
            let insn_pos = cur.pos();
            match CfiInsn::decode(&mut cur, self.cie, &ctx)? {
                CfiInsn::Nop | CfiInsn::ArgsSize(_) => {}
                CfiInsn::SetLoc(loc) => {
                    if loc == 0 {
                        debug!("set_loc to a null location");
                        return Err(UnwindError::MalformedData);
                    }
                    state.loc = loc;
                    if target != 0 && target < state.loc {
                        return Ok(());
                    }
                }
                CfiInsn::AdvanceLoc(delta) => {
                    state.loc = state
                        .loc
                        .wrapping_add(delta.wrapping_mul(self.cie.code_align));
                    if target != 0 && target < state.loc {
                        return Ok(());
                    }
                }
                CfiInsn::Offset { reg, offset } => {
                    let offset = (offset as i64).wrapping_mul(data_align);
                    self.set_rule(state, reg, RegisterRule::AtCfaOffset(offset))?;
                }
                CfiInsn::OffsetSf { reg, offset } => {
                    let offset = offset.wrapping_mul(data_align);
                    self.set_rule(state, reg, RegisterRule::AtCfaOffset(offset))?;
                }
                CfiInsn::NegOffset { reg, offset } => {
                    let offset = (offset as i64).wrapping_neg().wrapping_mul(data_align);
                    self.set_rule(state, reg, RegisterRule::AtCfaOffset(offset))?;
                }
                CfiInsn::ValOffset { reg, offset } => {
                    let offset = (offset as i64).wrapping_mul(data_align);
                    self.set_rule(state, reg, RegisterRule::ValCfaOffset(offset))?;
                }
                CfiInsn::ValOffsetSf { reg, offset } => {
                    let offset = offset.wrapping_mul(data_align);
                    self.set_rule(state, reg, RegisterRule::ValCfaOffset(offset))?;
                }
                CfiInsn::Restore(reg) | CfiInsn::Undefined(reg) | CfiInsn::SameValue(reg) => {
                    self.set_rule(state, reg, RegisterRule::Unset)?;
                }
                CfiInsn::Register { reg, src } => {
                    self.set_rule(state, reg, RegisterRule::InRegister(src))?;
                }
                CfiInsn::RememberState => {
                    if state.label == Some(insn_pos) {
                        // The replay has caught up with the remembered
                        // position; the current row is the restored one.
                        state.label = None;
                        return Ok(());
                    }
                    if state.depth >= MAX_STATE_STACK {
                        debug!("remember_state stack overflow");
                        return Err(UnwindError::MalformedData);
                    }
                    state.stack[state.depth] = insn_pos;
                    state.depth += 1;
                }
                CfiInsn::RestoreState => {
                    if state.depth == 0 {
                        debug!("restore_state with no remembered state");
                        return Err(UnwindError::MalformedData);
                    }
                    state.depth -= 1;
                    let restore_to = state.stack[state.depth];
                    let saved_loc = state.loc;
                    let saved_label = state.label;
                    state.cfa = CfaRule::Unset;
                    state.regs = [RegisterRule::Unset; MAX_REGISTERS];
                    // The replay rebuilds the remembered-position stack as
                    // it re-encounters earlier remember_states.
                    state.depth = 0;
                    state.label = Some(restore_to);
                    self.run_stream(state, self.cie.instructions.clone(), 0)?;
                    if state.label.is_some() {
                        self.run_stream(state, self.fde.instructions.clone(), 0)?;
                    }
                    if state.label.is_some() {
                        debug!("restore_state replay never reached its label");
                        return Err(UnwindError::MalformedData);
                    }
                    state.loc = saved_loc;
                    state.label = saved_label;
                }
                CfiInsn::DefCfa { reg, offset } => {
                    state.cfa = CfaRule::RegOffset {
                        reg,
                        offset: offset as i64,
                    };
                }
                CfiInsn::DefCfaSf { reg, offset } => {
                    state.cfa = CfaRule::RegOffset {
                        reg,
                        offset: offset.wrapping_mul(data_align),
                    };
                }
                CfiInsn::DefCfaRegister(reg) => match state.cfa {
                    CfaRule::RegOffset { offset, .. } => {
                        state.cfa = CfaRule::RegOffset { reg, offset };
                    }
                    _ => {
                        debug!("def_cfa_register without a register+offset CFA rule");
                        return Err(UnwindError::MalformedData);
                    }
                },
                CfiInsn::DefCfaOffset(offset) => match state.cfa {
                    CfaRule::RegOffset { reg, .. } => {
                        state.cfa = CfaRule::RegOffset {
                            reg,
                            offset: offset as i64,
                        };
                    }
                    _ => {
                        debug!("def_cfa_offset without a register+offset CFA rule");
                        return Err(UnwindError::MalformedData);
                    }
                },
                CfiInsn::DefCfaOffsetSf(offset) => match state.cfa {
                    CfaRule::RegOffset { reg, .. } => {
                        state.cfa = CfaRule::RegOffset {
                            reg,
                            offset: offset.wrapping_mul(data_align),
                        };
                    }
                    _ => {
                        debug!("def_cfa_offset_sf without a register+offset CFA rule");
                        return Err(UnwindError::MalformedData);
                    }
                },
                CfiInsn::DefCfaExpression(window) => {
                    state.cfa = CfaRule::Expression(window);
                }
            }
        }
        Ok(())
    }

    /// Attach a rule to a register column.
    ///
    /// Columns the layout does not describe at all are ignored (tables
    /// routinely carry rules for registers an embedder does not track);
    /// attaching a real rule to a column the architecture marks absent is
    /// an error, so absent slots provably stay `Unset`.
    fn set_rule(&self, state: &mut UnwindState, reg: u64, rule: RegisterRule) -> Result<(), UnwindError> {
        let idx = match usize::try_from(reg) {
            Ok(idx) if idx < self.layout.num_registers() => idx,
            _ => {
                trace!("ignoring rule for untracked register {}", reg);
                return Ok(());
            }
        };
        if !self.layout.is_present(idx) {
            if rule == RegisterRule::Unset {
                return Ok(());
            }
            debug!("rule attached to architecturally absent register {}", idx);
            return Err(UnwindError::MalformedData);
        }
        state.regs[idx] = rule;
        Ok(())
    }
}
