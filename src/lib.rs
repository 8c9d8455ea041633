// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! A stack unwinder driven by DWARF call frame information (CFI).
//!
//! This library consumes the de facto GCC/LLVM `.eh_frame` and
//! `.eh_frame_hdr` byte layouts and answers one question: given a snapshot
//! of a thread's registers, what were the caller's registers? Everything
//! else a backtracer needs -- the per-architecture register layout, a
//! fault-isolated memory read, the bookkeeping that maps program counters
//! to loaded code regions -- is injected by the embedder through small
//! capability traits, so the core itself never blocks, allocates, or takes
//! a lock while unwinding and can run from arbitrary contexts.
//!
//! The moving parts, leaf first:
//!
//! * the encoding layer -- LEB128 decoding and the `DW_EH_PE_*`
//!   encoded-pointer reader over a bounds-checked cursor.
//! * [`CieInfo`]/[`FdeInfo`] -- transient views of the Common Information
//!   Entries and Frame Description Entries parsed out of a table's bytes.
//! * [`UnwindTable`] -- one registered `.eh_frame` image, with FDE lookup
//!   by sorted index (a supplied `.eh_frame_hdr`, or one the registry
//!   builds itself) and by linear scan as the fallback.
//! * The CFI interpreter -- executes the CIE's and FDE's instruction
//!   streams up to the queried program counter, producing a rule for every
//!   tracked register plus the rule for the canonical frame address (CFA).
//! * The DWARF expression evaluator -- a small fixed-depth stack machine,
//!   used when the CFA is described by an expression instead of
//!   register + offset.
//! * [`DwarfUnwinder`] -- ties the above together and rewrites a
//!   [`RegisterSnapshot`] in place into the caller's frame.
//!
//! Unwinding a whole stack is a loop the embedder owns: seed a snapshot
//! from the crashed/interrupted context, call
//! [`DwarfUnwinder::unwind_one_frame`] until it fails, and decide per the
//! returned [`UnwindError`] whether a frame-pointer heuristic should take
//! over ([`UnwindError::allows_frame_pointer_fallback`]) or the backtrace
//! should end there with an "unreliable" marker.

mod cfi;
mod context;
mod encoding;
mod entry;
mod expr;
mod table;
mod walker;

#[cfg(test)]
mod testutil;
#[cfg(test)]
mod walker_unittest;

pub use crate::context::{
    LayoutError, MemoryAccess, MemoryImage, RegisterLayout, RegisterSlot, RegisterSnapshot,
    MAX_REGISTERS,
};
pub use crate::entry::{CieInfo, FdeInfo};
pub use crate::table::{TableHandle, TableRegistry, TableResolver, UnwindTable};
pub use crate::walker::DwarfUnwinder;

/// Errors produced while unwinding one frame.
///
/// The variants are deliberately coarse: they are the distinctions a
/// backtrace driver acts on, not a parse diagnostic. Fine-grained causes
/// are reported through `tracing` at `debug` level as they are rejected.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum UnwindError {
    /// No unwind table covers the program counter, or the covering table
    /// has no FDE for it. The usual cause is code without unwind info
    /// (JITs, hand-written assembly), so a frame-pointer heuristic is a
    /// reasonable next step.
    #[error("no unwind table or FDE covers the program counter")]
    NotFound,
    /// A parse or bounds violation anywhere in the CIE/FDE/CFI data, the
    /// search index, or an expression. The table is not trustworthy for
    /// this frame.
    #[error("malformed unwind information")]
    MalformedData,
    /// A [`MemoryAccess::safe_read`] failed while dereferencing a saved
    /// register or an expression operand.
    #[error("memory read fault while unwinding")]
    Fault,
    /// The computed frame was rejected after the fact: the new program
    /// counter or stack pointer is misaligned, or the unwind made no
    /// progress. Kept distinct from [`UnwindError::MalformedData`] for
    /// diagnostics; callers should treat it the same way.
    #[error("computed frame violates alignment or progress invariants")]
    AlignmentOrProgress,
}

impl UnwindError {
    /// A stable, programmatic name for this error.
    pub fn name(&self) -> &'static str {
        match self {
            UnwindError::NotFound => "NotFound",
            UnwindError::MalformedData => "MalformedData",
            UnwindError::Fault => "Fault",
            UnwindError::AlignmentOrProgress => "AlignmentOrProgress",
        }
    }

    /// Whether a frame-pointer-based fallback is an appropriate response.
    ///
    /// Only missing coverage qualifies. A malformed table or a faulting
    /// read means the frame's description was found and is wrong, and the
    /// caller should surface that instead of silently guessing.
    pub fn allows_frame_pointer_fallback(&self) -> bool {
        matches!(self, UnwindError::NotFound)
    }
}

// Init logging for all tests in the crate.
#[cfg(test)]
#[ctor::ctor]
fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}
