// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The frame walker: applies the rules the CFI interpreter produced to a
//! register snapshot, turning the callee's frame into the caller's.
//!
//! The order of operations matters and is fixed:
//!
//! 1. compute the CFA (register + offset, or evaluate the expression
//!    against the callee's registers);
//! 2. derive the memory window saved-register loads are allowed to touch
//!    (between the old stack pointer and the CFA, clamped to the stack
//!    window containing the CFA if those straddle a boundary -- a wild
//!    CFA must not let the table read arbitrary memory);
//! 3. read every register-copy source *before* writing anything, since
//!    rules may alias (two registers swapping through each other);
//! 4. apply the rules;
//! 5. reject the result if the new pc/sp are misaligned or nothing moved.
//!
//! Failure at any step leaves the snapshot unspecified and reports a typed
//! error; a partially updated frame is never reported as success.

use std::convert::TryFrom;
use tracing::trace;

use crate::cfi::{CfaRule, CfiProgram, RegisterRule, UnwindState};
use crate::context::{MemoryAccess, RegisterLayout, RegisterSnapshot, MAX_REGISTERS};
use crate::expr::evaluate;
use crate::table::TableResolver;
use crate::UnwindError;

/// The deliverable: one-frame-at-a-time DWARF unwinding over injected
/// capabilities.
///
/// Construction wires up the three things the embedder owns: table
/// resolution, the architecture's register layout, and fault-isolated
/// memory access. The unwinder itself is stateless; one instance serves
/// any number of concurrent walks.
pub struct DwarfUnwinder<'a, 'data> {
    resolver: &'a dyn TableResolver<'data>,
    layout: &'a RegisterLayout,
    memory: &'a dyn MemoryAccess,
}

impl<'a, 'data> DwarfUnwinder<'a, 'data> {
    pub fn new(
        resolver: &'a dyn TableResolver<'data>,
        layout: &'a RegisterLayout,
        memory: &'a dyn MemoryAccess,
    ) -> DwarfUnwinder<'a, 'data> {
        DwarfUnwinder {
            resolver,
            layout,
            memory,
        }
    }

    /// Rewrite `snapshot` in place into the caller's frame.
    ///
    /// `is_call_frame` says whether the snapshot's pc is a return address
    /// (true for every frame reached by unwinding through a call) or the
    /// exact interrupted instruction (the innermost frame of a fault or a
    /// signal delivery). Return addresses point one instruction past the
    /// call, which with half-open FDE ranges would attribute the frame to
    /// the wrong function at function boundaries, so lookup backs the pc
    /// up by one byte first.
    ///
    /// On success the snapshot's [`call_frame`](RegisterSnapshot::call_frame)
    /// flag is refreshed from the located CIE (a signal-frame CIE means
    /// the *caller's* pc is exact), ready to be passed back in for the
    /// next frame. On error the snapshot contents are unspecified.
    pub fn unwind_one_frame(
        &self,
        snapshot: &mut RegisterSnapshot<'_>,
        is_call_frame: bool,
    ) -> Result<(), UnwindError> {
        let layout = self.layout;
        if snapshot.capacity() < layout.snapshot_len() {
            return Err(UnwindError::MalformedData);
        }
        let word = u64::from(layout.word_size());

        let old_pc = snapshot
            .get(layout, layout.pc_register())
            .ok_or(UnwindError::MalformedData)?;
        let old_sp = snapshot
            .get(layout, layout.sp_register())
            .ok_or(UnwindError::MalformedData)?;
        if old_pc == 0 {
            // End of the call chain, not an error in the table.
            return Err(UnwindError::NotFound);
        }
        let query_pc = old_pc - u64::from(is_call_frame);

        trace!("unwinding frame at pc {:#x} sp {:#x}", old_pc, old_sp);
        let table = self.resolver.resolve(query_pc).ok_or(UnwindError::NotFound)?;
        trace!("  ...resolved table {}", table.name());
        let (fde, cie) = table.lookup_fde(query_pc, Some(self.memory))?;
        trace!(
            "  ...found FDE covering {:#x}..{:#x}",
            fde.pc_begin,
            fde.pc_end
        );

        let mut state = UnwindState::new(fde.pc_begin);
        let program = CfiProgram {
            frame: table.frame(),
            frame_base: table.frame_base(),
            cie: &cie,
            fde: &fde,
            layout,
            memory: Some(self.memory),
        };
        program.run(&mut state, query_pc)?;

        // Step 1: the CFA.
        let cfa = match &state.cfa {
            CfaRule::Unset => {
                trace!("  ...no CFA rule was established");
                return Err(UnwindError::MalformedData);
            }
            CfaRule::RegOffset { reg, offset } => {
                let reg = usize::try_from(*reg)
                    .ok()
                    .filter(|&r| r < layout.num_registers() && layout.is_present(r))
                    .ok_or(UnwindError::MalformedData)?;
                if u64::from(layout.slot(reg).width) != word {
                    return Err(UnwindError::MalformedData);
                }
                let base = snapshot.get(layout, reg).ok_or(UnwindError::MalformedData)?;
                if base % word != 0 || offset % word as i64 != 0 {
                    trace!("  ...unaligned CFA base {:#x} + {}", base, offset);
                    return Err(UnwindError::MalformedData);
                }
                base.wrapping_add(*offset as u64)
            }
            CfaRule::Expression(window) => evaluate(
                table.frame(),
                table.frame_base(),
                window.clone(),
                snapshot,
                layout,
                Some(self.memory),
            )?,
        };
        trace!("  ...cfa {:#x}", cfa);

        // Step 2: the window saved-register reads may touch.
        let (mut low, mut high) = if old_sp < cfa { (old_sp, cfa) } else { (cfa, old_sp) };
        let window_mask = !(layout.stack_window() - 1);
        if low & window_mask != high & window_mask {
            low = cfa & window_mask;
            high = cfa;
        }

        // Step 3: snapshot every register-copy source before any write.
        let count = layout.num_registers();
        let mut copied = [0u64; MAX_REGISTERS];
        for reg in 0..count {
            if let RegisterRule::InRegister(src) = state.regs[reg] {
                let src = usize::try_from(src)
                    .ok()
                    .filter(|&s| s < count && layout.is_present(s))
                    .ok_or(UnwindError::MalformedData)?;
                if layout.slot(reg).width > layout.slot(src).width {
                    // A wider destination would invent bytes.
                    return Err(UnwindError::MalformedData);
                }
                copied[reg] = snapshot.get(layout, src).ok_or(UnwindError::MalformedData)?;
            }
        }

        // Step 4: apply.
        for reg in 0..count {
            if !layout.is_present(reg) {
                continue;
            }
            match state.regs[reg] {
                RegisterRule::Unset => {
                    // The CFA *is* the caller's stack pointer; that is its
                    // definition. Other untouched registers stay as the
                    // callee left them.
                    if reg == layout.sp_register() {
                        snapshot.set(layout, reg, cfa).ok_or(UnwindError::MalformedData)?;
                    }
                }
                RegisterRule::InRegister(_) => {
                    snapshot
                        .set(layout, reg, copied[reg])
                        .ok_or(UnwindError::MalformedData)?;
                }
                RegisterRule::ValCfaOffset(offset) => {
                    snapshot
                        .set(layout, reg, cfa.wrapping_add(offset as u64))
                        .ok_or(UnwindError::MalformedData)?;
                }
                RegisterRule::AtCfaOffset(offset) => {
                    let addr = cfa.wrapping_add(offset as u64);
                    let width = layout.slot(reg).width;
                    if addr % word != 0 {
                        trace!("  ...unaligned saved-register slot {:#x}", addr);
                        return Err(UnwindError::MalformedData);
                    }
                    let end = addr
                        .checked_add(u64::from(width))
                        .ok_or(UnwindError::MalformedData)?;
                    if addr < low || end > high {
                        trace!(
                            "  ...saved-register slot {:#x} outside the frame {:#x}..{:#x}",
                            addr,
                            low,
                            high
                        );
                        return Err(UnwindError::MalformedData);
                    }
                    let value = self
                        .memory
                        .safe_read(addr, width)
                        .ok_or(UnwindError::Fault)?;
                    snapshot
                        .set(layout, reg, value)
                        .ok_or(UnwindError::MalformedData)?;
                }
            }
        }

        // Steps 5 and 6: sanity of the produced frame.
        let new_pc = snapshot
            .get(layout, layout.pc_register())
            .ok_or(UnwindError::MalformedData)?;
        let new_sp = snapshot
            .get(layout, layout.sp_register())
            .ok_or(UnwindError::MalformedData)?;
        if new_pc % cie.code_align != 0 || new_sp % cie.data_align.unsigned_abs() != 0 {
            trace!(
                "  ...caller pc {:#x} / sp {:#x} misaligned for this CIE",
                new_pc,
                new_sp
            );
            return Err(UnwindError::AlignmentOrProgress);
        }
        if new_pc == old_pc && new_sp == old_sp {
            trace!("  ...unwind made no progress");
            return Err(UnwindError::AlignmentOrProgress);
        }

        snapshot.set_call_frame(!cie.signal_frame);
        trace!("  ...caller pc {:#x} sp {:#x}", new_pc, new_sp);
        Ok(())
    }
}
