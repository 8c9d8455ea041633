// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Builders for synthesizing `.eh_frame` images in tests.

use crate::context::{RegisterLayout, RegisterSlot};

pub fn push_uleb128(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn push_sleb128(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        out.push(if done { byte } else { byte | 0x80 });
        if done {
            return;
        }
    }
}

/// Append a length-prefixed record, padding the body with `DW_CFA_nop` to
/// the 4-byte length unit. Returns the record's offset.
pub fn push_record(out: &mut Vec<u8>, mut body: Vec<u8>) -> usize {
    let offset = out.len();
    while body.len() % 4 != 0 {
        body.push(0);
    }
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    offset
}

/// A version-1 CIE body with the given augmentation string and data.
pub fn cie_body(
    augmentation: &[u8],
    code_align: u64,
    data_align: i64,
    ret_addr_reg: u8,
    aug_data: &[u8],
    instructions: &[u8],
) -> Vec<u8> {
    let mut body = vec![0, 0, 0, 0]; // CIE id
    body.push(1); // version
    body.extend_from_slice(augmentation);
    body.push(0);
    push_uleb128(&mut body, code_align);
    push_sleb128(&mut body, data_align);
    body.push(ret_addr_reg);
    if !augmentation.is_empty() {
        push_uleb128(&mut body, aug_data.len() as u64);
        body.extend_from_slice(aug_data);
    }
    body.extend_from_slice(instructions);
    body
}

/// An FDE body for a CIE with an empty augmentation string and native
/// absolute pointer encoding (word size 8).
///
/// `id_offset` is the offset the FDE's id field will land at once the
/// record is appended: record offset + 4.
pub fn fde_body_native(
    cie_offset: usize,
    id_offset: usize,
    pc_begin: u64,
    pc_range: u64,
    instructions: &[u8],
) -> Vec<u8> {
    let back = (id_offset - cie_offset) as u32;
    let mut body = back.to_le_bytes().to_vec();
    body.extend_from_slice(&pc_begin.to_le_bytes());
    body.extend_from_slice(&pc_range.to_le_bytes());
    body.extend_from_slice(instructions);
    body
}

/// Like [`fde_body_native`], for a CIE whose augmentation string starts
/// with `'z'`: the FDE carries a (zero-length) augmentation data block.
pub fn fde_body_z(
    cie_offset: usize,
    id_offset: usize,
    pc_begin: u64,
    pc_range: u64,
    instructions: &[u8],
) -> Vec<u8> {
    let back = (id_offset - cie_offset) as u32;
    let mut body = back.to_le_bytes().to_vec();
    body.extend_from_slice(&pc_begin.to_le_bytes());
    body.extend_from_slice(&pc_range.to_le_bytes());
    body.push(0); // augmentation data length
    body.extend_from_slice(instructions);
    body
}

/// A layout shaped like x86-64's call-frame columns: 17 word-sized
/// registers at consecutive offsets, column 7 the stack pointer and
/// column 16 the return address / program counter.
pub fn test_layout() -> RegisterLayout {
    let slots = (0..17).map(|i| RegisterSlot::new(i * 8, 8)).collect();
    RegisterLayout::new(slots, 16, 7, 8, 0x10000).unwrap()
}

pub const TEST_PC: usize = 16;
pub const TEST_SP: usize = 7;
