// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Byte-stream primitives shared by every parser in the crate: a
//! bounds-checked cursor over a table's raw bytes, LEB128 decoding, and
//! the `DW_EH_PE_*` encoded-pointer reader.
//!
//! The cursor tracks positions as offsets into the *full* table slice so
//! that a position can double as a stable instruction label (the CFI
//! interpreter's `remember_state` replay depends on this), and carries the
//! virtual address of byte 0 so pc-relative pointer encodings resolve
//! without any raw pointer arithmetic.

use scroll::Pread;
use std::ops::Range;
use tracing::debug;

use crate::context::MemoryAccess;
use crate::UnwindError;

// DW_EH_PE value formats (low nibble of an encoding byte).
pub const DW_EH_PE_NATIVE: u8 = 0x00;
pub const DW_EH_PE_ULEB128: u8 = 0x01;
pub const DW_EH_PE_UDATA2: u8 = 0x02;
pub const DW_EH_PE_UDATA4: u8 = 0x03;
pub const DW_EH_PE_UDATA8: u8 = 0x04;
pub const DW_EH_PE_SLEB128: u8 = 0x09;
pub const DW_EH_PE_SDATA2: u8 = 0x0a;
pub const DW_EH_PE_SDATA4: u8 = 0x0b;
pub const DW_EH_PE_SDATA8: u8 = 0x0c;

// DW_EH_PE applications (bits 4..6).
pub const DW_EH_PE_ABS: u8 = 0x00;
pub const DW_EH_PE_PCREL: u8 = 0x10;
pub const DW_EH_PE_TEXTREL: u8 = 0x20;
pub const DW_EH_PE_DATAREL: u8 = 0x30;
pub const DW_EH_PE_FUNCREL: u8 = 0x40;
pub const DW_EH_PE_ALIGNED: u8 = 0x50;

pub const DW_EH_PE_INDIRECT: u8 = 0x80;
pub const DW_EH_PE_OMIT: u8 = 0xff;

const FORM_MASK: u8 = 0x0f;
const APPLICATION_MASK: u8 = 0x70;

/// Everything an encoded-pointer read might need beyond the bytes
/// themselves.
pub struct PointerCtx<'a> {
    /// Native pointer width of the table's architecture, 4 or 8.
    pub word_size: u8,
    /// Base for `DW_EH_PE_datarel` values, when the caller has one
    /// (the start of the `.eh_frame_hdr` section, for index entries).
    pub data_base: Option<u64>,
    /// Memory capability for `DW_EH_PE_indirect` reads. Absent means any
    /// indirect encoding reports a fault.
    pub memory: Option<&'a dyn MemoryAccess>,
}

/// Fixed decoded size of an encoding's value format, if it has one.
///
/// LEB-encoded values have no fixed size and yield `None`; the sorted
/// index format requires fixed-size fields throughout.
pub fn fixed_form_size(encoding: u8, word_size: u8) -> Option<usize> {
    match encoding & FORM_MASK {
        DW_EH_PE_NATIVE => Some(word_size as usize),
        DW_EH_PE_UDATA2 | DW_EH_PE_SDATA2 => Some(2),
        DW_EH_PE_UDATA4 | DW_EH_PE_SDATA4 => Some(4),
        DW_EH_PE_UDATA8 | DW_EH_PE_SDATA8 => Some(8),
        _ => None,
    }
}

/// A bounds-checked reader over a window of a table's bytes.
///
/// `pos` and the window bounds are offsets into the full `data` slice.
/// Reads never move `pos` past the window end; a failed read leaves the
/// cursor where it was.
pub struct Cursor<'data> {
    data: &'data [u8],
    base: u64,
    pos: usize,
    end: usize,
}

impl<'data> Cursor<'data> {
    pub fn new(data: &'data [u8], base: u64) -> Cursor<'data> {
        Cursor {
            data,
            base,
            pos: 0,
            end: data.len(),
        }
    }

    /// A cursor restricted to `window`, positioned at its start.
    pub fn with_window(
        data: &'data [u8],
        base: u64,
        window: Range<usize>,
    ) -> Result<Cursor<'data>, UnwindError> {
        if window.start > window.end || window.end > data.len() {
            return Err(UnwindError::MalformedData);
        }
        Ok(Cursor {
            data,
            base,
            pos: window.start,
            end: window.end,
        })
    }

    /// Current offset into the underlying slice.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Virtual address of the next byte to be read.
    pub fn vaddr(&self) -> u64 {
        self.base.wrapping_add(self.pos as u64)
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.end
    }

    /// Reposition inside the window (used by expression branches).
    pub fn set_pos(&mut self, pos: usize) -> Result<(), UnwindError> {
        if pos > self.end {
            return Err(UnwindError::MalformedData);
        }
        self.pos = pos;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, UnwindError> {
        if self.pos >= self.end {
            return Err(UnwindError::MalformedData);
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16, UnwindError> {
        if self.pos + 2 > self.end {
            return Err(UnwindError::MalformedData);
        }
        self.data
            .gread_with(&mut self.pos, scroll::LE)
            .map_err(|_| UnwindError::MalformedData)
    }

    pub fn read_u32(&mut self) -> Result<u32, UnwindError> {
        if self.pos + 4 > self.end {
            return Err(UnwindError::MalformedData);
        }
        self.data
            .gread_with(&mut self.pos, scroll::LE)
            .map_err(|_| UnwindError::MalformedData)
    }

    pub fn read_u64(&mut self) -> Result<u64, UnwindError> {
        if self.pos + 8 > self.end {
            return Err(UnwindError::MalformedData);
        }
        self.data
            .gread_with(&mut self.pos, scroll::LE)
            .map_err(|_| UnwindError::MalformedData)
    }

    /// One native-width unsigned value.
    pub fn read_word(&mut self, word_size: u8) -> Result<u64, UnwindError> {
        match word_size {
            4 => self.read_u32().map(u64::from),
            8 => self.read_u64(),
            _ => Err(UnwindError::MalformedData),
        }
    }

    pub fn skip(&mut self, count: usize) -> Result<(), UnwindError> {
        match self.pos.checked_add(count) {
            Some(next) if next <= self.end => {
                self.pos = next;
                Ok(())
            }
            _ => Err(UnwindError::MalformedData),
        }
    }

    /// The bytes up to (not including) the next NUL, consuming the NUL.
    pub fn read_cstr(&mut self) -> Result<&'data [u8], UnwindError> {
        let window = &self.data[self.pos..self.end];
        let nul = window
            .iter()
            .position(|&b| b == 0)
            .ok_or(UnwindError::MalformedData)?;
        let bytes = &window[..nul];
        self.pos += nul + 1;
        Ok(bytes)
    }

    /// Unsigned LEB128.
    ///
    /// A value that would overflow 64 bits, or one that runs off the
    /// window without a terminating byte, advances the cursor to the
    /// window end so every subsequent read fails, rather than wrapping
    /// silently.
    pub fn read_uleb128(&mut self) -> u64 {
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        while self.pos < self.end {
            let byte = self.data[self.pos];
            if shift >= 64 || (shift + 7 > 64 && u64::from(byte & 0x7f) >= 1 << (64 - shift)) {
                self.pos = self.end;
                break;
            }
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return value;
            }
            shift += 7;
        }
        value
    }

    /// Signed LEB128, with the same overflow sentinel as
    /// [`Cursor::read_uleb128`].
    pub fn read_sleb128(&mut self) -> i64 {
        let mut value: i64 = 0;
        let mut shift: u32 = 0;
        while self.pos < self.end {
            let byte = self.data[self.pos];
            if shift >= 64 || (shift + 7 > 64 && u64::from(byte & 0x7f) >= 1 << (64 - shift)) {
                self.pos = self.end;
                break;
            }
            self.pos += 1;
            value |= i64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    value |= -1i64 << shift;
                }
                return value;
            }
        }
        value
    }

    /// Decode one `DW_EH_PE`-encoded pointer.
    ///
    /// Handles the fixed, LEB, and native value formats, the absolute,
    /// pc-relative, data-relative and aligned applications, and one level
    /// of indirection through the injected memory capability. Unsupported
    /// applications (`textrel`, `funcrel`) and `omit` are malformed here.
    pub fn read_encoded_pointer(
        &mut self,
        encoding: u8,
        ctx: &PointerCtx<'_>,
    ) -> Result<u64, UnwindError> {
        if encoding == DW_EH_PE_OMIT {
            debug!("pointer encoding is DW_EH_PE_omit where a value is required");
            return Err(UnwindError::MalformedData);
        }

        let application = encoding & APPLICATION_MASK;
        if application == DW_EH_PE_ALIGNED {
            let word = u64::from(ctx.word_size);
            let vaddr = self.vaddr();
            let aligned = vaddr.wrapping_add(word - 1) & !(word - 1);
            self.skip(aligned.wrapping_sub(vaddr) as usize)?;
        }

        let value_vaddr = self.vaddr();
        let raw = match encoding & FORM_MASK {
            DW_EH_PE_NATIVE => self.read_word(ctx.word_size)?,
            DW_EH_PE_ULEB128 => self.read_uleb128(),
            DW_EH_PE_UDATA2 => u64::from(self.read_u16()?),
            DW_EH_PE_UDATA4 => u64::from(self.read_u32()?),
            DW_EH_PE_UDATA8 => self.read_u64()?,
            DW_EH_PE_SLEB128 => self.read_sleb128() as u64,
            DW_EH_PE_SDATA2 => self.read_u16()? as i16 as i64 as u64,
            DW_EH_PE_SDATA4 => self.read_u32()? as i32 as i64 as u64,
            DW_EH_PE_SDATA8 => self.read_u64()?,
            form => {
                debug!("unknown pointer value format 0x{:02x}", form);
                return Err(UnwindError::MalformedData);
            }
        };

        let value = match application {
            DW_EH_PE_ABS | DW_EH_PE_ALIGNED => raw,
            DW_EH_PE_PCREL => raw.wrapping_add(value_vaddr),
            DW_EH_PE_DATAREL => match ctx.data_base {
                Some(base) => raw.wrapping_add(base),
                None => {
                    debug!("datarel pointer with no data base available");
                    return Err(UnwindError::MalformedData);
                }
            },
            DW_EH_PE_TEXTREL | DW_EH_PE_FUNCREL => {
                debug!(
                    "unsupported pointer application 0x{:02x}",
                    application
                );
                return Err(UnwindError::MalformedData);
            }
            application => {
                debug!("unknown pointer application 0x{:02x}", application);
                return Err(UnwindError::MalformedData);
            }
        };

        if encoding & DW_EH_PE_INDIRECT != 0 {
            let memory = ctx.memory.ok_or(UnwindError::Fault)?;
            return memory
                .safe_read(value, ctx.word_size)
                .ok_or(UnwindError::Fault);
        }
        Ok(value)
    }
}
