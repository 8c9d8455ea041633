// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Unwind tables and the registry that maps program counters to them.
//!
//! An [`UnwindTable`] is one registered `.eh_frame` image: the raw bytes,
//! the virtual address they correspond to, the pc ranges the code region
//! occupies, and optionally a sorted search index in the `.eh_frame_hdr`
//! wire format. When no index is supplied, registration builds a synthetic
//! one in the same format (with native absolute encodings) so lookups can
//! binary-search either way; tables too small to be worth indexing fall
//! back to a linear record scan.
//!
//! The [`TableRegistry`] owns tables behind `Arc`s and hands out clones,
//! so unregistering a module never invalidates an unwind already in
//! flight, and the unwind path itself takes no lock: the only
//! synchronization it touches is the acquire-load of a table's built
//! index, paired with the release-store made at registration.

use std::convert::TryFrom;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use tracing::{debug, trace};

use crate::context::MemoryAccess;
use crate::encoding::{fixed_form_size, Cursor, PointerCtx, DW_EH_PE_NATIVE};
use crate::entry::{cie_for_fde, parse_fde, read_record, CieInfo, FdeInfo};
use crate::UnwindError;

/// Build a sorted index only when a table has at least this many FDEs;
/// below it a linear scan is cheap enough.
const MIN_INDEX_ENTRIES: usize = 32;

/// One registered `.eh_frame` image and the code ranges it covers.
pub struct UnwindTable<'data> {
    name: String,
    core_range: Range<u64>,
    init_range: Option<Range<u64>>,
    frame: &'data [u8],
    frame_base: u64,
    word_size: u8,
    hdr: Option<(&'data [u8], u64)>,
    built: OnceLock<Box<[u8]>>,
}

impl<'data> UnwindTable<'data> {
    /// Describe a code region and its unwind bytes.
    ///
    /// `frame_base` is the virtual address `frame[0]` corresponds to;
    /// pc-relative encodings inside the table resolve against it. A
    /// supplied `hdr` is a `.eh_frame_hdr` image with its own base
    /// address; without one, [`UnwindTable::ensure_index`] (or
    /// registration) builds an equivalent.
    pub fn new(
        name: impl Into<String>,
        core_range: Range<u64>,
        init_range: Option<Range<u64>>,
        frame: &'data [u8],
        frame_base: u64,
        word_size: u8,
        hdr: Option<(&'data [u8], u64)>,
    ) -> UnwindTable<'data> {
        debug_assert!(matches!(word_size, 4 | 8));
        UnwindTable {
            name: name.into(),
            core_range,
            init_range,
            frame,
            frame_base,
            word_size,
            hdr,
            built: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn frame(&self) -> &'data [u8] {
        self.frame
    }

    pub(crate) fn frame_base(&self) -> u64 {
        self.frame_base
    }

    /// Whether this table's code region covers `pc`.
    pub fn covers(&self, pc: u64) -> bool {
        self.core_range.contains(&pc)
            || self
                .init_range
                .as_ref()
                .map_or(false, |range| range.contains(&pc))
    }

    fn without_init_range(&self) -> UnwindTable<'data> {
        UnwindTable {
            name: self.name.clone(),
            core_range: self.core_range.clone(),
            init_range: None,
            frame: self.frame,
            frame_base: self.frame_base,
            word_size: self.word_size,
            hdr: self.hdr,
            built: self.built.clone(),
        }
    }

    fn pointer_ctx<'m>(&self, memory: Option<&'m dyn MemoryAccess>) -> PointerCtx<'m> {
        PointerCtx {
            word_size: self.word_size,
            data_base: None,
            memory,
        }
    }

    /// Build the synthetic sorted index if no header was supplied and the
    /// table is big enough to deserve one. Idempotent; the `OnceLock`
    /// publishes the result to concurrent lookups.
    pub fn ensure_index(&self) {
        if self.hdr.is_some() || self.built.get().is_some() {
            return;
        }
        if let Some(index) = self.build_sorted_index() {
            let bytes = index.len();
            if self.built.set(index).is_ok() {
                trace!("built {}-byte search index for table {}", bytes, self.name);
            }
        }
    }

    /// Scan the raw table and emit a `.eh_frame_hdr`-format index with
    /// native absolute encodings, or nothing if the table is too small or
    /// too damaged to index.
    fn build_sorted_index(&self) -> Option<Box<[u8]>> {
        let ctx = self.pointer_ctx(None);
        let mut entries: Vec<(u64, u64)> = Vec::new();
        let mut offset = 0;
        loop {
            let record = match read_record(self.frame, offset) {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(_) => {
                    debug!("not indexing damaged table {}", self.name);
                    return None;
                }
            };
            offset = record.next;
            if record.id == 0 {
                // A CIE, not a match candidate.
                continue;
            }
            let cie = match cie_for_fde(self.frame, self.frame_base, &record, &ctx) {
                Ok(cie) => cie,
                Err(_) => return None,
            };
            let fde = match parse_fde(self.frame, self.frame_base, &record, &cie, &ctx) {
                Ok(fde) => fde,
                Err(_) => return None,
            };
            entries.push((fde.pc_begin, self.frame_base + record.offset as u64));
        }
        if entries.len() < MIN_INDEX_ENTRIES {
            return None;
        }
        entries.sort_by_key(|&(pc_begin, _)| pc_begin);

        let word = self.word_size as usize;
        let mut index = Vec::with_capacity(4 + word * (2 + entries.len() * 2));
        index.push(1); // version
        index.push(DW_EH_PE_NATIVE); // eh_frame_ptr encoding
        index.push(DW_EH_PE_NATIVE); // fde_count encoding
        index.push(DW_EH_PE_NATIVE); // table encoding
        let mut push_word = |index: &mut Vec<u8>, value: u64| {
            if word == 4 {
                index.extend_from_slice(&(value as u32).to_le_bytes());
            } else {
                index.extend_from_slice(&value.to_le_bytes());
            }
        };
        push_word(&mut index, self.frame_base);
        push_word(&mut index, entries.len() as u64);
        for &(pc_begin, fde_addr) in &entries {
            push_word(&mut index, pc_begin);
            push_word(&mut index, fde_addr);
        }
        Some(index.into_boxed_slice())
    }

    /// Find the FDE covering `pc`, preferring the sorted index (supplied
    /// or built) and falling back to a linear scan only when the table has
    /// no index at all. A corrupt index fails the lookup rather than
    /// silently degrading.
    pub fn lookup_fde(
        &self,
        pc: u64,
        memory: Option<&dyn MemoryAccess>,
    ) -> Result<(FdeInfo, CieInfo), UnwindError> {
        if let Some((hdr, hdr_base)) = self.hdr {
            return self.lookup_fde_binary(hdr, hdr_base, pc, memory);
        }
        if let Some(index) = self.built.get() {
            return self.lookup_fde_binary(index, 0, pc, memory);
        }
        self.lookup_fde_linear(pc, memory)
    }

    /// Binary search over a `.eh_frame_hdr`-format index.
    fn lookup_fde_binary(
        &self,
        hdr: &[u8],
        hdr_base: u64,
        pc: u64,
        memory: Option<&dyn MemoryAccess>,
    ) -> Result<(FdeInfo, CieInfo), UnwindError> {
        let mut ctx = self.pointer_ctx(memory);
        ctx.data_base = Some(hdr_base);

        let mut cur = Cursor::new(hdr, hdr_base);
        let version = cur.read_u8()?;
        if version != 1 {
            debug!("search index version {} is not 1", version);
            return Err(UnwindError::MalformedData);
        }
        let frame_ptr_enc = cur.read_u8()?;
        let fde_count_enc = cur.read_u8()?;
        let table_enc = cur.read_u8()?;
        // All three fields must have fixed sizes for the pair table to be
        // seekable.
        fixed_form_size(frame_ptr_enc, self.word_size).ok_or(UnwindError::MalformedData)?;
        fixed_form_size(fde_count_enc, self.word_size).ok_or(UnwindError::MalformedData)?;
        let entry_size =
            fixed_form_size(table_enc, self.word_size).ok_or(UnwindError::MalformedData)?;

        let frame_ptr = cur.read_encoded_pointer(frame_ptr_enc, &ctx)?;
        if frame_ptr != self.frame_base {
            // A stale or relocated index would send every lookup to the
            // wrong record; reject it outright.
            debug!(
                "search index eh_frame_ptr {:#x} does not match table base {:#x}",
                frame_ptr, self.frame_base
            );
            return Err(UnwindError::MalformedData);
        }
        let count = usize::try_from(cur.read_encoded_pointer(fde_count_enc, &ctx)?)
            .map_err(|_| UnwindError::MalformedData)?;
        if count == 0 {
            return Err(UnwindError::NotFound);
        }
        let pairs_start = cur.pos();
        let pair_size = 2 * entry_size;
        if count.checked_mul(pair_size) != Some(hdr.len() - pairs_start) {
            debug!("search index pair table has the wrong size");
            return Err(UnwindError::MalformedData);
        }

        let read_pair = |k: usize| -> Result<(u64, u64), UnwindError> {
            let mut cur =
                Cursor::with_window(hdr, hdr_base, pairs_start + k * pair_size..hdr.len())?;
            let start_pc = cur.read_encoded_pointer(table_enc, &ctx)?;
            let fde_addr = cur.read_encoded_pointer(table_enc, &ctx)?;
            Ok((start_pc, fde_addr))
        };

        // Greatest start_pc <= pc.
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (start_pc, _) = read_pair(mid)?;
            if pc < start_pc {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        if lo == 0 {
            return Err(UnwindError::NotFound);
        }
        let (start_pc, fde_addr) = read_pair(lo - 1)?;

        let fde_offset = usize::try_from(fde_addr.wrapping_sub(self.frame_base))
            .map_err(|_| UnwindError::MalformedData)?;
        let record = read_record(self.frame, fde_offset)?.ok_or(UnwindError::MalformedData)?;
        if record.id == 0 {
            debug!("search index points at a CIE");
            return Err(UnwindError::MalformedData);
        }
        let ctx = self.pointer_ctx(memory);
        let cie = cie_for_fde(self.frame, self.frame_base, &record, &ctx)?;
        let fde = parse_fde(self.frame, self.frame_base, &record, &cie, &ctx)?;
        if fde.pc_begin != start_pc {
            // The index's cached start does not match the record it points
            // at: a stale index, not a missing FDE.
            debug!(
                "search index start {:#x} disagrees with FDE pc_begin {:#x}",
                start_pc, fde.pc_begin
            );
            return Err(UnwindError::MalformedData);
        }
        if !fde.covers(pc) {
            return Err(UnwindError::NotFound);
        }
        Ok((fde, cie))
    }

    /// Walk every record in the raw table looking for a covering FDE.
    fn lookup_fde_linear(
        &self,
        pc: u64,
        memory: Option<&dyn MemoryAccess>,
    ) -> Result<(FdeInfo, CieInfo), UnwindError> {
        let ctx = self.pointer_ctx(memory);
        let mut offset = 0;
        while let Some(record) = read_record(self.frame, offset)? {
            offset = record.next;
            if record.id == 0 {
                // A CIE; only FDEs cover code.
                continue;
            }
            let cie = cie_for_fde(self.frame, self.frame_base, &record, &ctx)?;
            let fde = parse_fde(self.frame, self.frame_base, &record, &cie, &ctx)?;
            if fde.covers(pc) {
                return Ok((fde, cie));
            }
        }
        Err(UnwindError::NotFound)
    }
}

/// Maps a program counter to the table covering it.
///
/// [`TableRegistry`] is the stock implementation; embedders with a single
/// static table (or their own bookkeeping) can implement this directly.
pub trait TableResolver<'data> {
    fn resolve(&self, pc: u64) -> Option<Arc<UnwindTable<'data>>>;
}

impl<'data> TableResolver<'data> for Arc<UnwindTable<'data>> {
    fn resolve(&self, pc: u64) -> Option<Arc<UnwindTable<'data>>> {
        if self.covers(pc) {
            Some(Arc::clone(self))
        } else {
            None
        }
    }
}

/// Identifies a registered table for later removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TableHandle(u64);

/// The registered set of unwind tables, ordered by registration (register
/// the permanent kernel/base image first, module tables as they load).
///
/// Registration and removal take the write lock; resolution takes the
/// read lock just long enough to clone out an `Arc`, so an unwind keeps
/// its table alive even if the module is unregistered mid-walk.
pub struct TableRegistry<'data> {
    tables: RwLock<Vec<(TableHandle, Arc<UnwindTable<'data>>)>>,
    next_handle: AtomicU64,
}

impl<'data> TableRegistry<'data> {
    pub fn new() -> TableRegistry<'data> {
        TableRegistry {
            tables: RwLock::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Register a table, building its search index if it needs one.
    pub fn register_table(&self, table: UnwindTable<'data>) -> TableHandle {
        table.ensure_index();
        let handle = TableHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        trace!("registering unwind table {}", table.name());
        self.tables
            .write()
            .unwrap()
            .push((handle, Arc::new(table)));
        handle
    }

    /// Remove a table. In-flight unwinds holding its `Arc` finish
    /// unharmed; new lookups no longer see it.
    pub fn unregister_table(&self, handle: TableHandle) -> bool {
        let mut tables = self.tables.write().unwrap();
        let before = tables.len();
        tables.retain(|(h, _)| *h != handle);
        before != tables.len()
    }

    /// Drop every table's init-code range, once that code has been
    /// released. Tables are replaced copy-on-write so concurrent lookups
    /// are undisturbed.
    pub fn revoke_init_ranges(&self) {
        let mut tables = self.tables.write().unwrap();
        for (_, table) in tables.iter_mut() {
            if table.init_range.is_some() {
                *table = Arc::new(table.without_init_range());
            }
        }
    }
}

impl<'data> Default for TableRegistry<'data> {
    fn default() -> TableRegistry<'data> {
        TableRegistry::new()
    }
}

impl<'data> TableResolver<'data> for TableRegistry<'data> {
    fn resolve(&self, pc: u64) -> Option<Arc<UnwindTable<'data>>> {
        let tables = self.tables.read().unwrap();
        tables
            .iter()
            .find(|(_, table)| table.covers(pc))
            .map(|(_, table)| Arc::clone(table))
    }
}
