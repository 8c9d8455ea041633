// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Parsing of the two record kinds inside an `.eh_frame` image: Common
//! Information Entries and Frame Description Entries.
//!
//! Both are transient views: a lookup re-parses them from the table bytes
//! on every unwind attempt, and nothing here outlives the call. Positions
//! are kept as offsets into the table slice (not borrowed sub-slices) so
//! the same values can serve as interpreter labels and expression windows.

use std::convert::TryFrom;
use std::ops::Range;
use tracing::debug;

use crate::encoding::{Cursor, PointerCtx, DW_EH_PE_NATIVE};
use crate::UnwindError;

/// `.eh_frame` records are length-prefixed in 4-byte units; a CIE
/// back-pointer that is not a multiple of this is corrupt.
const LENGTH_UNIT: u32 = 4;

/// One length-prefixed record, before we know whether it is a CIE or FDE.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RawRecord {
    /// Offset of the record (its length field) in the table.
    pub offset: usize,
    /// The record body: everything after the length field.
    pub body: Range<usize>,
    /// The CIE id field: 0 for a CIE, a back-distance for an FDE.
    pub id: u32,
    /// Offset of the next record.
    pub next: usize,
}

/// Read the record at `offset`. `Ok(None)` is the clean end of the table:
/// either a zero terminator or exactly running out of bytes.
pub(crate) fn read_record(frame: &[u8], offset: usize) -> Result<Option<RawRecord>, UnwindError> {
    if offset == frame.len() {
        return Ok(None);
    }
    let mut cur = Cursor::with_window(frame, 0, offset..frame.len())?;
    let length = cur.read_u32()?;
    if length == 0 {
        return Ok(None);
    }
    if length == 0xffff_ffff {
        debug!("64-bit DWARF record at offset {:#x} is not supported", offset);
        return Err(UnwindError::MalformedData);
    }
    if length < 4 {
        debug!("runt record of {} bytes at offset {:#x}", length, offset);
        return Err(UnwindError::MalformedData);
    }
    let body_start = offset + 4;
    let body_end = body_start
        .checked_add(length as usize)
        .filter(|&end| end <= frame.len())
        .ok_or_else(|| {
            debug!("record at offset {:#x} overruns the table", offset);
            UnwindError::MalformedData
        })?;
    let id = cur.read_u32()?;
    Ok(Some(RawRecord {
        offset,
        body: body_start..body_end,
        id,
        next: body_end,
    }))
}

/// A parsed Common Information Entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CieInfo {
    /// CIE version; only version 1 is accepted.
    pub version: u8,
    /// Factor applied to `advance_loc` deltas. Never zero.
    pub code_align: u64,
    /// Factor applied to register offsets. Never zero.
    pub data_align: i64,
    /// DWARF column holding the return address.
    pub ret_addr_reg: u64,
    /// Pointer encoding for this CIE's FDEs (the `'R'` augmentation),
    /// defaulting to native absolute.
    pub ptr_encoding: u8,
    /// LSDA pointer encoding (the `'L'` augmentation); parsed so FDE
    /// augmentation data can be skipped, otherwise unused here.
    pub lsda_encoding: Option<u8>,
    /// The `'S'` augmentation: the pc of a frame below this one is the
    /// exact interrupted instruction, not a return address.
    pub signal_frame: bool,
    /// Whether the augmentation string began with `'z'`, i.e. FDEs carry
    /// size-prefixed augmentation data of their own.
    pub has_augmentation: bool,
    /// Window of the initial instruction stream in the table bytes.
    pub instructions: Range<usize>,
}

/// Parse the CIE record at `offset`.
pub(crate) fn parse_cie(
    frame: &[u8],
    frame_base: u64,
    offset: usize,
    ctx: &PointerCtx<'_>,
) -> Result<CieInfo, UnwindError> {
    let record = read_record(frame, offset)?.ok_or(UnwindError::MalformedData)?;
    if record.id != 0 {
        debug!("record at offset {:#x} is not a CIE", offset);
        return Err(UnwindError::MalformedData);
    }
    // Skip the id field.
    let mut cur = Cursor::with_window(frame, frame_base, record.body.start + 4..record.body.end)?;

    let version = cur.read_u8()?;
    if version != 1 {
        debug!("unsupported CIE version {}", version);
        return Err(UnwindError::MalformedData);
    }

    let augmentation = cur.read_cstr()?;
    if !augmentation.is_empty() && augmentation[0] != b'z' {
        // Without the 'z' size prefix there is no safe way to skip
        // augmentation data we do not understand.
        debug!(
            "unprefixed augmentation string {:?}",
            String::from_utf8_lossy(augmentation)
        );
        return Err(UnwindError::MalformedData);
    }
    let has_augmentation = !augmentation.is_empty();

    let code_align = cur.read_uleb128();
    let data_align = cur.read_sleb128();
    if code_align == 0 || data_align == 0 {
        debug!(
            "zero alignment factor (code {}, data {})",
            code_align, data_align
        );
        return Err(UnwindError::MalformedData);
    }
    // Version 1 encodes the return-address column as a single byte.
    let ret_addr_reg = u64::from(cur.read_u8()?);

    let mut ptr_encoding = DW_EH_PE_NATIVE;
    let mut lsda_encoding = None;
    let mut signal_frame = false;
    let mut instructions_start = cur.pos();

    if has_augmentation {
        let aug_len = cur.read_uleb128();
        let aug_end = cur
            .pos()
            .checked_add(usize::try_from(aug_len).map_err(|_| UnwindError::MalformedData)?)
            .filter(|&end| end <= record.body.end)
            .ok_or(UnwindError::MalformedData)?;
        for &code in &augmentation[1..] {
            match code {
                b'L' => {
                    lsda_encoding = Some(cur.read_u8()?);
                }
                b'P' => {
                    let personality_encoding = cur.read_u8()?;
                    cur.read_encoded_pointer(personality_encoding, ctx)?;
                }
                b'R' => {
                    ptr_encoding = cur.read_u8()?;
                }
                b'S' => {
                    signal_frame = true;
                }
                _ => {
                    debug!("unknown augmentation code {:?}", code as char);
                    return Err(UnwindError::MalformedData);
                }
            }
            if cur.pos() > aug_end {
                debug!("augmentation data overran its declared length");
                return Err(UnwindError::MalformedData);
            }
        }
        instructions_start = aug_end;
    }

    Ok(CieInfo {
        version,
        code_align,
        data_align,
        ret_addr_reg,
        ptr_encoding,
        lsda_encoding,
        signal_frame,
        has_augmentation,
        instructions: instructions_start..record.body.end,
    })
}

/// A parsed Frame Description Entry, covering `[pc_begin, pc_end)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FdeInfo {
    pub pc_begin: u64,
    pub pc_end: u64,
    /// Window of the FDE's instruction stream in the table bytes.
    pub instructions: Range<usize>,
}

impl FdeInfo {
    pub fn covers(&self, pc: u64) -> bool {
        self.pc_begin <= pc && pc < self.pc_end
    }
}

/// Resolve and parse the CIE an FDE record points back at.
pub(crate) fn cie_for_fde(
    frame: &[u8],
    frame_base: u64,
    record: &RawRecord,
    ctx: &PointerCtx<'_>,
) -> Result<CieInfo, UnwindError> {
    if record.id == 0 {
        return Err(UnwindError::MalformedData);
    }
    if record.id % LENGTH_UNIT != 0 {
        debug!("misaligned CIE back-pointer {:#x}", record.id);
        return Err(UnwindError::MalformedData);
    }
    // The distance is measured from the id field itself.
    let cie_offset = record
        .body
        .start
        .checked_sub(record.id as usize)
        .ok_or_else(|| {
            debug!("CIE back-pointer {:#x} underruns the table", record.id);
            UnwindError::MalformedData
        })?;
    parse_cie(frame, frame_base, cie_offset, ctx)
}

/// Parse an FDE record against its (already parsed) CIE.
pub(crate) fn parse_fde(
    frame: &[u8],
    frame_base: u64,
    record: &RawRecord,
    cie: &CieInfo,
    ctx: &PointerCtx<'_>,
) -> Result<FdeInfo, UnwindError> {
    let mut cur = Cursor::with_window(frame, frame_base, record.body.start + 4..record.body.end)?;

    let pc_begin = cur.read_encoded_pointer(cie.ptr_encoding, ctx)?;
    if pc_begin == 0 {
        debug!("FDE at offset {:#x} has a null pc_begin", record.offset);
        return Err(UnwindError::MalformedData);
    }
    // The range is a plain size: value format of the CIE's encoding,
    // absolute application.
    let pc_range = cur.read_encoded_pointer(cie.ptr_encoding & 0x0f, ctx)?;

    if cie.has_augmentation {
        let aug_len = cur.read_uleb128();
        cur.skip(usize::try_from(aug_len).map_err(|_| UnwindError::MalformedData)?)?;
    }

    Ok(FdeInfo {
        pc_begin,
        pc_end: pc_begin.wrapping_add(pc_range),
        instructions: cur.pos()..record.body.end,
    })
}
