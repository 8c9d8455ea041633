// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! End-to-end tests for [`DwarfUnwinder::unwind_one_frame`]: synthesized
//! `.eh_frame` images, a stack image assembled with `test_assembler`, and
//! a register snapshot walked one frame at a time.

use std::sync::Arc;
use test_assembler::Section;

use crate::cfi::*;
use crate::context::{MemoryImage, RegisterLayout, RegisterSlot, RegisterSnapshot};
use crate::table::{TableRegistry, TableResolver, UnwindTable};
use crate::testutil::*;
use crate::walker::DwarfUnwinder;
use crate::UnwindError;

const FRAME_BASE: u64 = 0x1000;
const CODE_BASE: u64 = 0x4000_1000;
const FUNC_SIZE: u64 = 0x40;
const STACK_BASE: u64 = 0x8000_0100;
const RETURN_ADDRESS: u64 = 0x4000_2004;

struct TestFixture {
    layout: RegisterLayout,
    frame: Vec<u8>,
    regs: Vec<u8>,
}

impl TestFixture {
    /// One CIE (code align 1, data align -8, return address column 16)
    /// and one FDE covering [CODE_BASE, CODE_BASE + FUNC_SIZE).
    fn new(cie_instructions: &[u8], fde_instructions: &[u8]) -> TestFixture {
        let mut frame = Vec::new();
        let cie_off = push_record(
            &mut frame,
            cie_body(b"", 1, -8, 16, &[], cie_instructions),
        );
        let id_offset = frame.len() + 4;
        push_record(
            &mut frame,
            fde_body_native(cie_off, id_offset, CODE_BASE, FUNC_SIZE, fde_instructions),
        );
        frame.extend_from_slice(&[0, 0, 0, 0]);
        TestFixture::with_frame(frame)
    }

    fn with_frame(frame: Vec<u8>) -> TestFixture {
        let layout = test_layout();
        let regs = vec![0u8; layout.snapshot_len()];
        let mut fixture = TestFixture {
            layout,
            frame,
            regs,
        };
        fixture.set_reg(TEST_PC, CODE_BASE + 0x10);
        fixture.set_reg(TEST_SP, STACK_BASE);
        fixture
    }

    fn set_reg(&mut self, reg: usize, value: u64) {
        let mut snap = RegisterSnapshot::new(&mut self.regs);
        snap.set(&self.layout, reg, value).unwrap();
    }

    fn get_reg(&mut self, reg: usize) -> u64 {
        RegisterSnapshot::new(&mut self.regs)
            .get(&self.layout, reg)
            .unwrap()
    }

    /// Unwind one frame against the given stack image. Returns the
    /// snapshot's refreshed call-frame flag.
    fn unwind(&mut self, stack: Section, is_call_frame: bool) -> Result<bool, UnwindError> {
        let stack_base = stack.start().value().unwrap();
        let contents = stack.get_contents().unwrap();
        let memory = MemoryImage::new(stack_base, &contents);

        let table = Arc::new(UnwindTable::new(
            "test",
            CODE_BASE..CODE_BASE + 0x1000,
            None,
            &self.frame,
            FRAME_BASE,
            8,
            None,
        ));
        let unwinder = DwarfUnwinder::new(&table, &self.layout, &memory);
        let mut snapshot = RegisterSnapshot::new(&mut self.regs);
        unwinder.unwind_one_frame(&mut snapshot, is_call_frame)?;
        Ok(snapshot.call_frame())
    }
}

/// A stack with the caller's frame pointer and return address saved at
/// the conventional slots: [STACK_BASE] = saved rbp, [STACK_BASE+8] = ra.
fn conventional_stack() -> Section {
    let stack = Section::new();
    stack.start().set_const(STACK_BASE);
    stack.D64(0x8000_0200u64).D64(RETURN_ADDRESS)
}

/// CIE instructions every scenario shares: cfa = r7 + 8, ra saved at
/// cfa - 8.
fn standard_cie() -> Vec<u8> {
    vec![DW_CFA_DEF_CFA, 7, 8, DW_CFA_OFFSET | 16, 1]
}

#[test]
fn walks_a_conventional_frame() {
    // Prologue finished: cfa = rsp + 16, rbp saved at cfa - 16.
    let fde = vec![DW_CFA_DEF_CFA_OFFSET, 16, DW_CFA_OFFSET | 6, 2];
    let mut f = TestFixture::new(&standard_cie(), &fde);
    f.set_reg(6, 0x1111_2222_3333_4444);

    let call_frame = f.unwind(conventional_stack(), false).unwrap();
    assert!(call_frame);
    assert_eq!(f.get_reg(TEST_PC), RETURN_ADDRESS);
    assert_eq!(f.get_reg(TEST_SP), STACK_BASE + 16);
    assert_eq!(f.get_reg(6), 0x8000_0200);
}

#[test]
fn untouched_registers_keep_their_callee_values() {
    let fde = vec![DW_CFA_DEF_CFA_OFFSET, 16];
    let mut f = TestFixture::new(&standard_cie(), &fde);
    f.set_reg(3, 0xaaaa_bbbb_cccc_dddd);

    f.unwind(conventional_stack(), false).unwrap();
    assert_eq!(f.get_reg(3), 0xaaaa_bbbb_cccc_dddd);
}

#[test]
fn lookup_honors_the_half_open_range() {
    let mut f = TestFixture::new(&standard_cie(), &[]);

    // Exactly pc_begin: found.
    f.set_reg(TEST_PC, CODE_BASE);
    f.set_reg(TEST_SP, STACK_BASE);
    assert!(f.unwind(conventional_stack(), false).is_ok());

    // Exactly pc_end: not covered.
    f.set_reg(TEST_PC, CODE_BASE + FUNC_SIZE);
    f.set_reg(TEST_SP, STACK_BASE);
    assert_eq!(
        f.unwind(conventional_stack(), false),
        Err(UnwindError::NotFound)
    );

    // ...unless the pc is a return address, which backs up one byte into
    // the covered range.
    f.set_reg(TEST_PC, CODE_BASE + FUNC_SIZE);
    f.set_reg(TEST_SP, STACK_BASE);
    assert!(f.unwind(conventional_stack(), true).is_ok());
}

#[test]
fn memory_fault_is_reported_as_fault() {
    // The ra slot at cfa - 8 = STACK_BASE lies outside this stack image.
    let mut f = TestFixture::new(&standard_cie(), &[]);
    let stack = Section::new();
    stack.start().set_const(STACK_BASE + 0x40);
    let stack = stack.D64(0u64);

    assert_eq!(f.unwind(stack, false), Err(UnwindError::Fault));
}

#[test]
fn saved_register_reads_outside_the_frame_are_rejected() {
    // cfa = rsp + 8 and a "saved" slot at cfa + 16, above the frame.
    let mut fde = vec![DW_CFA_OFFSET_EXTENDED_SF, 6];
    push_sleb128(&mut fde, -2); // -2 * -8 = +16
    let mut f = TestFixture::new(&standard_cie(), &fde);
    assert_eq!(
        f.unwind(conventional_stack(), false),
        Err(UnwindError::MalformedData)
    );
}

#[test]
fn straddling_stack_windows_clamps_to_the_cfa_window() {
    // sp sits just below a 64 KiB window boundary, the CFA just above it;
    // slots below the boundary become unreadable.
    let sp = 0x8000_fff0u64;
    let cfa = 0x8001_0010u64;
    let stack = || {
        let stack = Section::new();
        stack.start().set_const(sp);
        stack
            .D64(0x8000_0200u64) // sp+0: saved rbp slot (cfa - 32)
            .D64(0u64)
            .D64(0u64)
            .D64(RETURN_ADDRESS) // sp+24 == cfa - 8
    };

    // cfa = rsp + 32, ra at cfa-8 (fine), rbp at cfa-32 (clamped away).
    let fde = vec![DW_CFA_DEF_CFA_OFFSET, 32, DW_CFA_OFFSET | 6, 4];
    let mut f = TestFixture::new(&standard_cie(), &fde);
    f.set_reg(TEST_SP, sp);
    assert_eq!(f.unwind(stack(), false), Err(UnwindError::MalformedData));

    // Without the out-of-window rule the same frame unwinds.
    let fde = vec![DW_CFA_DEF_CFA_OFFSET, 32];
    let mut f = TestFixture::new(&standard_cie(), &fde);
    f.set_reg(TEST_SP, sp);
    f.unwind(stack(), false).unwrap();
    assert_eq!(f.get_reg(TEST_SP), cfa);
    assert_eq!(f.get_reg(TEST_PC), RETURN_ADDRESS);
}

#[test]
fn register_copies_read_the_pre_update_values() {
    // r3 and r4 swap through each other; both must see pre-update values.
    let mut fde = vec![DW_CFA_DEF_CFA_OFFSET, 16];
    fde.extend_from_slice(&[DW_CFA_REGISTER, 3, 4]);
    fde.extend_from_slice(&[DW_CFA_REGISTER, 4, 3]);
    let mut f = TestFixture::new(&standard_cie(), &fde);
    f.set_reg(3, 0x3333);
    f.set_reg(4, 0x4444);

    f.unwind(conventional_stack(), false).unwrap();
    assert_eq!(f.get_reg(3), 0x4444);
    assert_eq!(f.get_reg(4), 0x3333);
}

#[test]
fn copy_from_an_untracked_register_is_rejected() {
    let mut fde = vec![DW_CFA_DEF_CFA_OFFSET, 16];
    fde.extend_from_slice(&[DW_CFA_REGISTER, 3, 60]); // column 60 untracked
    let mut f = TestFixture::new(&standard_cie(), &fde);
    assert_eq!(
        f.unwind(conventional_stack(), false),
        Err(UnwindError::MalformedData)
    );
}

#[test]
fn value_rules_compute_without_memory() {
    // r3's caller value *is* cfa - 16; no read happens.
    let fde = vec![DW_CFA_DEF_CFA_OFFSET, 16, DW_CFA_VAL_OFFSET, 3, 2];
    let mut f = TestFixture::new(&standard_cie(), &fde);
    f.unwind(conventional_stack(), false).unwrap();
    assert_eq!(f.get_reg(3), STACK_BASE);
}

#[test]
fn expression_cfa_is_evaluated_against_the_callee_frame() {
    // DW_CFA_def_cfa_expression { breg7 + 16 }.
    let mut expr = vec![0x70 + 7]; // DW_OP_breg7
    push_sleb128(&mut expr, 16);
    let mut fde = vec![DW_CFA_DEF_CFA_EXPRESSION, expr.len() as u8];
    fde.extend_from_slice(&expr);
    let mut f = TestFixture::new(&standard_cie(), &fde);

    f.unwind(conventional_stack(), false).unwrap();
    assert_eq!(f.get_reg(TEST_SP), STACK_BASE + 16);
    assert_eq!(f.get_reg(TEST_PC), RETURN_ADDRESS);
}

#[test]
fn no_progress_is_a_violation() {
    // cfa = rsp + 0 and pc copied from itself: nothing changes.
    let fde = vec![DW_CFA_DEF_CFA, 7, 0, DW_CFA_REGISTER, 16, 16];
    let mut f = TestFixture::new(&standard_cie(), &fde);
    assert_eq!(
        f.unwind(conventional_stack(), false),
        Err(UnwindError::AlignmentOrProgress)
    );
}

#[test]
fn misaligned_caller_pc_is_a_violation() {
    // A CIE with code alignment 4 (RISC style): the recovered return
    // address must be 4-aligned, and RETURN_ADDRESS | 2 is not.
    let mut frame = Vec::new();
    let cie_off = push_record(&mut frame, cie_body(b"", 4, -8, 16, &[], &standard_cie()));
    let id_offset = frame.len() + 4;
    push_record(
        &mut frame,
        fde_body_native(cie_off, id_offset, CODE_BASE, FUNC_SIZE, &[]),
    );
    frame.extend_from_slice(&[0, 0, 0, 0]);

    let mut f = TestFixture::with_frame(frame);
    let stack = Section::new();
    stack.start().set_const(STACK_BASE);
    let stack = stack.D64(RETURN_ADDRESS | 2);
    assert_eq!(
        f.unwind(stack, false),
        Err(UnwindError::AlignmentOrProgress)
    );
}

#[test]
fn signal_frame_cies_clear_the_call_frame_flag() {
    let mut frame = Vec::new();
    let cie_off = push_record(
        &mut frame,
        cie_body(b"zS", 1, -8, 16, &[], &standard_cie()),
    );
    let id_offset = frame.len() + 4;
    push_record(
        &mut frame,
        fde_body_z(cie_off, id_offset, CODE_BASE, FUNC_SIZE, &[DW_CFA_DEF_CFA_OFFSET, 16]),
    );
    frame.extend_from_slice(&[0, 0, 0, 0]);

    let mut f = TestFixture::with_frame(frame);
    let call_frame = f.unwind(conventional_stack(), false).unwrap();
    assert!(!call_frame);
    assert_eq!(f.get_reg(TEST_SP), STACK_BASE + 16);
}

#[test]
fn pc_of_zero_ends_the_walk() {
    let mut f = TestFixture::new(&standard_cie(), &[]);
    f.set_reg(TEST_PC, 0);
    assert_eq!(
        f.unwind(conventional_stack(), false),
        Err(UnwindError::NotFound)
    );
}

#[test]
fn unknown_pc_reports_not_found() {
    let mut f = TestFixture::new(&standard_cie(), &[]);
    f.set_reg(TEST_PC, 0x9999_0000);
    assert_eq!(
        f.unwind(conventional_stack(), false),
        Err(UnwindError::NotFound)
    );
    assert!(UnwindError::NotFound.allows_frame_pointer_fallback());
    assert!(!UnwindError::MalformedData.allows_frame_pointer_fallback());
}

#[test]
fn narrowing_register_copies_are_allowed_widening_are_not() {
    // Column 5 is 4 bytes wide in this layout.
    let mut slots: Vec<RegisterSlot> = (0..17).map(|i| RegisterSlot::new(i * 8, 8)).collect();
    slots[5] = RegisterSlot::new(5 * 8, 4);
    let layout = RegisterLayout::new(slots, 16, 7, 8, 0x10000).unwrap();

    let build = |fde: &[u8]| -> Vec<u8> {
        let mut frame = Vec::new();
        let cie_off = push_record(&mut frame, cie_body(b"", 1, -8, 16, &[], &standard_cie()));
        let id_offset = frame.len() + 4;
        push_record(
            &mut frame,
            fde_body_native(cie_off, id_offset, CODE_BASE, FUNC_SIZE, fde),
        );
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame
    };

    let run = |frame: &[u8]| -> Result<(), UnwindError> {
        let mut regs = vec![0u8; layout.snapshot_len()];
        {
            let mut snap = RegisterSnapshot::new(&mut regs);
            snap.set(&layout, 16, CODE_BASE + 0x10).unwrap();
            snap.set(&layout, 7, STACK_BASE).unwrap();
            snap.set(&layout, 3, 0x1234_5678_9abc_def0).unwrap();
        }
        let stack = conventional_stack();
        let contents = stack.get_contents().unwrap();
        let memory = MemoryImage::new(STACK_BASE, &contents);
        let table = Arc::new(UnwindTable::new(
            "widths",
            CODE_BASE..CODE_BASE + 0x1000,
            None,
            frame,
            FRAME_BASE,
            8,
            None,
        ));
        let unwinder = DwarfUnwinder::new(&table, &layout, &memory);
        let mut snapshot = RegisterSnapshot::new(&mut regs);
        unwinder.unwind_one_frame(&mut snapshot, false)
    };

    // Narrow (4-byte) destination from a word source: fine.
    let frame = build(&[DW_CFA_DEF_CFA_OFFSET, 16, DW_CFA_REGISTER, 5, 3]);
    assert!(run(&frame).is_ok());

    // Word destination from the narrow source: rejected.
    let frame = build(&[DW_CFA_DEF_CFA_OFFSET, 16, DW_CFA_REGISTER, 3, 5]);
    assert_eq!(run(&frame), Err(UnwindError::MalformedData));
}

#[test]
fn walks_two_frames_through_the_registry() {
    // Frame 0 (a leaf, prologue not yet run) returns into frame 1, whose
    // own frame is conventional. Exercises the registry resolver and the
    // call-frame flag handoff across steps.
    let mut frame = Vec::new();
    let cie_off = push_record(&mut frame, cie_body(b"", 1, -8, 16, &[], &standard_cie()));
    // Leaf function at CODE_BASE.
    let id_offset = frame.len() + 4;
    push_record(
        &mut frame,
        fde_body_native(cie_off, id_offset, CODE_BASE, FUNC_SIZE, &[]),
    );
    // Its caller at CODE_BASE + FUNC_SIZE, with a pushed frame.
    let id_offset = frame.len() + 4;
    push_record(
        &mut frame,
        fde_body_native(
            cie_off,
            id_offset,
            CODE_BASE + FUNC_SIZE,
            FUNC_SIZE,
            &[DW_CFA_DEF_CFA_OFFSET, 16, DW_CFA_OFFSET | 6, 2],
        ),
    );
    frame.extend_from_slice(&[0, 0, 0, 0]);

    // The leaf's ra lands inside the caller's FDE.
    let ra_in_caller = CODE_BASE + FUNC_SIZE + 0x10;
    let stack = Section::new();
    stack.start().set_const(STACK_BASE);
    let stack = stack
        .D64(ra_in_caller) // leaf's ra at leaf cfa - 8 = STACK_BASE
        .D64(0x8000_0300u64) // caller's saved rbp at caller cfa - 16
        .D64(RETURN_ADDRESS); // caller's ra at caller cfa - 8
    let contents = stack.get_contents().unwrap();
    let memory = MemoryImage::new(STACK_BASE, &contents);

    let registry = TableRegistry::new();
    registry.register_table(UnwindTable::new(
        "kernel",
        CODE_BASE..CODE_BASE + 0x1000,
        None,
        &frame,
        FRAME_BASE,
        8,
        None,
    ));
    assert!(registry.resolve(CODE_BASE + 5).is_some());

    let layout = test_layout();
    let mut regs = vec![0u8; layout.snapshot_len()];
    {
        let mut snap = RegisterSnapshot::new(&mut regs);
        // Interrupted mid-leaf: exact pc.
        snap.set(&layout, TEST_PC, CODE_BASE + 4).unwrap();
        snap.set(&layout, TEST_SP, STACK_BASE).unwrap();
    }

    let unwinder = DwarfUnwinder::new(&registry, &layout, &memory);
    let mut snapshot = RegisterSnapshot::new(&mut regs);

    // Frame 0 -> 1: leaf frame, cfa = sp + 8, ra at cfa - 8.
    unwinder.unwind_one_frame(&mut snapshot, false).unwrap();
    assert_eq!(snapshot.get(&layout, TEST_PC), Some(ra_in_caller));
    assert_eq!(snapshot.get(&layout, TEST_SP), Some(STACK_BASE + 8));
    assert!(snapshot.call_frame());

    // Frame 1 -> 2: conventional frame; the pc is now a return address.
    unwinder.unwind_one_frame(&mut snapshot, true).unwrap();
    assert_eq!(snapshot.get(&layout, TEST_PC), Some(RETURN_ADDRESS));
    assert_eq!(snapshot.get(&layout, TEST_SP), Some(STACK_BASE + 8 + 16));
    assert_eq!(snapshot.get(&layout, 6), Some(0x8000_0300));
}
