// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The contracts the unwinder consumes from its embedder: a fault-isolated
//! memory read, the architecture's register layout, and the register
//! snapshot that gets rewritten into the caller's frame.
//!
//! None of these know anything about DWARF. The layout is a plain data
//! table -- one `{byte offset, width}` entry per DWARF register column --
//! validated once when it is built, so the unwind path can index it
//! without rechecking.

use std::convert::TryFrom;
use std::ops::Range;

/// Upper bound on the number of register columns a layout may describe.
///
/// The interpreter keeps a rule per column in a fixed array so that
/// unwinding never allocates; real architectures use well under this many
/// columns for call-frame purposes.
pub const MAX_REGISTERS: usize = 64;

/// A fault-isolated memory read.
///
/// This is the only way the unwinder touches memory outside the table
/// bytes it was registered with: saved-register loads, expression `deref`,
/// and indirect pointer encodings all come through here. Implementations
/// must never crash on a bad address -- `None` reports the fault.
pub trait MemoryAccess {
    /// Read `width` bytes (1, 2, 4 or 8) of little-endian data at `addr`.
    fn safe_read(&self, addr: u64, width: u8) -> Option<u64>;
}

/// A captured byte image of (part of) an address space, usable as
/// [`MemoryAccess`] in hosted settings: every read is a checked slice
/// index into the image rather than a live dereference.
pub struct MemoryImage<'a> {
    base: u64,
    bytes: &'a [u8],
}

impl<'a> MemoryImage<'a> {
    pub fn new(base: u64, bytes: &'a [u8]) -> MemoryImage<'a> {
        MemoryImage { base, bytes }
    }

    /// The address of the first byte of the image.
    pub fn base(&self) -> u64 {
        self.base
    }
}

impl MemoryAccess for MemoryImage<'_> {
    fn safe_read(&self, addr: u64, width: u8) -> Option<u64> {
        if !matches!(width, 1 | 2 | 4 | 8) {
            return None;
        }
        let start = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        let end = start.checked_add(width as usize)?;
        if end > self.bytes.len() {
            return None;
        }
        let mut value = 0u64;
        for (i, &byte) in self.bytes[start..end].iter().enumerate() {
            value |= u64::from(byte) << (8 * i);
        }
        Some(value)
    }
}

/// Where one DWARF register column lives inside a snapshot buffer.
///
/// A width of zero marks a column the architecture does not provide;
/// rules never attach to such columns and reads of them fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterSlot {
    pub offset: usize,
    pub width: u8,
}

impl RegisterSlot {
    pub const ABSENT: RegisterSlot = RegisterSlot { offset: 0, width: 0 };

    pub fn new(offset: usize, width: u8) -> RegisterSlot {
        RegisterSlot { offset, width }
    }
}

/// Errors from building a [`RegisterLayout`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("word size must be 4 or 8, got {0}")]
    BadWordSize(u8),
    #[error("{0} register columns exceeds the supported maximum")]
    TooManyRegisters(usize),
    #[error("register {0} has a width that is not a power of two within the word size")]
    BadWidth(usize),
    #[error("stack window must be a power of two no smaller than the word size")]
    BadStackWindow,
    #[error("the {0} register column is absent or not word-sized")]
    BadSpecialRegister(&'static str),
}

/// The architecture description the unwinder works against: per-column
/// snapshot locations plus which columns are the program counter and the
/// stack pointer.
///
/// Validated once here so the unwind path can trust every entry: widths
/// are powers of two no wider than the word, the pc/sp columns exist and
/// are word-sized, and the stack window (the span a frame's memory reads
/// are confined to when the CFA looks wild) is a power of two.
#[derive(Clone, Debug, PartialEq)]
pub struct RegisterLayout {
    slots: Vec<RegisterSlot>,
    pc: usize,
    sp: usize,
    word_size: u8,
    stack_window: u64,
    snapshot_len: usize,
}

impl RegisterLayout {
    pub fn new(
        slots: Vec<RegisterSlot>,
        pc: usize,
        sp: usize,
        word_size: u8,
        stack_window: u64,
    ) -> Result<RegisterLayout, LayoutError> {
        if !matches!(word_size, 4 | 8) {
            return Err(LayoutError::BadWordSize(word_size));
        }
        if slots.len() > MAX_REGISTERS {
            return Err(LayoutError::TooManyRegisters(slots.len()));
        }
        if !stack_window.is_power_of_two() || stack_window < u64::from(word_size) {
            return Err(LayoutError::BadStackWindow);
        }
        let mut snapshot_len = 0;
        for (i, slot) in slots.iter().enumerate() {
            if slot.width == 0 {
                continue;
            }
            if !slot.width.is_power_of_two() || slot.width > word_size {
                return Err(LayoutError::BadWidth(i));
            }
            snapshot_len = snapshot_len.max(slot.offset + slot.width as usize);
        }
        let word_sized = |reg: usize| {
            slots
                .get(reg)
                .map_or(false, |slot| slot.width == word_size)
        };
        if !word_sized(pc) {
            return Err(LayoutError::BadSpecialRegister("program counter"));
        }
        if !word_sized(sp) {
            return Err(LayoutError::BadSpecialRegister("stack pointer"));
        }
        Ok(RegisterLayout {
            slots,
            pc,
            sp,
            word_size,
            stack_window,
            snapshot_len,
        })
    }

    pub fn num_registers(&self) -> usize {
        self.slots.len()
    }

    /// Whether `reg` names a column this architecture actually has.
    pub fn is_present(&self, reg: usize) -> bool {
        self.slots.get(reg).map_or(false, |slot| slot.width != 0)
    }

    pub(crate) fn slot(&self, reg: usize) -> RegisterSlot {
        self.slots[reg]
    }

    /// DWARF column of the program counter.
    pub fn pc_register(&self) -> usize {
        self.pc
    }

    /// DWARF column of the stack pointer.
    pub fn sp_register(&self) -> usize {
        self.sp
    }

    pub fn word_size(&self) -> u8 {
        self.word_size
    }

    pub fn stack_window(&self) -> u64 {
        self.stack_window
    }

    /// Bytes a snapshot buffer must provide.
    pub fn snapshot_len(&self) -> usize {
        self.snapshot_len
    }
}

/// A thread's register values, owned by the embedder as a raw byte buffer
/// and interpreted through a [`RegisterLayout`].
///
/// [`DwarfUnwinder::unwind_one_frame`](crate::DwarfUnwinder::unwind_one_frame)
/// mutates the buffer in place into the caller's frame; on failure the
/// contents are unspecified. The snapshot also carries the call-frame
/// flag: whether the current pc is a return address (one past a call) or
/// the exact interrupted instruction (signal frames). The unwinder updates
/// the flag each successful step so a driver loop can feed it back in.
pub struct RegisterSnapshot<'a> {
    bytes: &'a mut [u8],
    call_frame: bool,
}

impl<'a> RegisterSnapshot<'a> {
    pub fn new(bytes: &'a mut [u8]) -> RegisterSnapshot<'a> {
        RegisterSnapshot {
            bytes,
            call_frame: true,
        }
    }

    /// Whether the snapshot's pc is a return address.
    pub fn call_frame(&self) -> bool {
        self.call_frame
    }

    pub(crate) fn set_call_frame(&mut self, call_frame: bool) {
        self.call_frame = call_frame;
    }

    pub(crate) fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn field(&self, layout: &RegisterLayout, reg: usize) -> Option<Range<usize>> {
        if !layout.is_present(reg) {
            return None;
        }
        let slot = layout.slot(reg);
        let end = slot.offset + slot.width as usize;
        if end > self.bytes.len() {
            return None;
        }
        Some(slot.offset..end)
    }

    /// Read register `reg`, zero-extended to 64 bits.
    pub fn get(&self, layout: &RegisterLayout, reg: usize) -> Option<u64> {
        let field = self.field(layout, reg)?;
        let mut value = 0u64;
        for (i, &byte) in self.bytes[field].iter().enumerate() {
            value |= u64::from(byte) << (8 * i);
        }
        Some(value)
    }

    /// Write register `reg`, truncating `value` to the column's width.
    pub fn set(&mut self, layout: &RegisterLayout, reg: usize, value: u64) -> Option<()> {
        let field = self.field(layout, reg)?;
        for (i, byte) in self.bytes[field].iter_mut().enumerate() {
            *byte = (value >> (8 * i)) as u8;
        }
        Some(())
    }
}
