//! The fixed pool: a paged allocator for records of one fixed size,
//! returning 32-bit atoms.
//!
//! Free records form an intrusive singly-linked list threaded through the
//! first word of the record bytes, head stored in the pool header.  `addr`
//! resolves an atom by two-level indexing (page table, then record slot)
//! and never traverses the free list.
//!
//! A pool is driven in one of two disciplines, never both: `alloc`/`free`
//! with the embedded free list, or `element_offset` direct indexing for
//! tables addressed by externally assigned ids.

use tracing::warn;

use parrotdb_error::{ParrotError, Result};
use parrotdb_types::{items_shift32, roundup32, Atom, Matom, PoolType, Shift};

use crate::segment::Segment;

/// Zero newly mapped pages before first use.
pub const PFF_INIT_ZERO: u32 = 1 << 0;

const INFO_BYTES: u32 = 32;
// Header field offsets.
const FI_RECORD_SIZE: usize = 0;
const FI_PAGE_SHIFT: usize = 4;
const FI_FLAGS: usize = 8;
const FI_MAX_ATOMS: usize = 12;
const FI_FREE: usize = 16;
const FI_PAGE_COUNT: usize = 20;
const FI_TABLE: usize = 24;

/// Handle to a fixed-size record pool inside a segment.
///
/// The handle caches the immutable shape; the free-list head, page count,
/// and page table live in the segment so reopening (or cloning the
/// handle) sees the same state.
#[derive(Debug, Clone)]
pub struct FixedPool {
    name: String,
    info: Matom,
    record_size: u32,
    page_shift: Shift,
    max_atoms: u32,
    flags: u32,
    table: Matom,
    table_entries: u32,
    pages_per_chunk: u32,
}

impl FixedPool {
    /// Open or create the pool named `name`.
    ///
    /// On first open the shape (record size, page shift, max atoms) is
    /// written into the header; reopening with a different shape fails.
    pub fn open(
        seg: &mut Segment,
        name: &str,
        page_shift: Shift,
        record_size: u32,
        max_atoms: u32,
        flags: u32,
    ) -> Result<Self> {
        // The free-list link needs the first word, and records stay
        // word-aligned.
        let record_size = roundup32(record_size.max(4), 4);
        let info = seg.header(name, PoolType::Fixed, INFO_BYTES)?;
        let info_off = seg.matom_offset(info);

        let table_entries = items_shift32(max_atoms, page_shift).max(1);
        let stored_size = seg.read_u32(info_off + FI_RECORD_SIZE);
        let table;
        if stored_size == 0 {
            let table_bytes = table_entries * 4;
            let table_pages = items_shift32(table_bytes, seg.page_shift()).max(1);
            table = seg.alloc_pages(table_pages)?;
            seg.write_u32(info_off + FI_RECORD_SIZE, record_size);
            seg.write_u32(info_off + FI_PAGE_SHIFT, u32::from(page_shift));
            seg.write_u32(info_off + FI_FLAGS, flags);
            seg.write_u32(info_off + FI_MAX_ATOMS, max_atoms);
            seg.write_u32(info_off + FI_FREE, 0);
            seg.write_u32(info_off + FI_PAGE_COUNT, 0);
            seg.write_u32(info_off + FI_TABLE, table.value());
        } else {
            if stored_size != record_size
                || seg.read_u32(info_off + FI_PAGE_SHIFT) != u32::from(page_shift)
                || seg.read_u32(info_off + FI_MAX_ATOMS) != max_atoms
            {
                return Err(ParrotError::Shape {
                    name: name.to_owned(),
                });
            }
            table = Matom::new(seg.read_u32(info_off + FI_TABLE));
        }

        let chunk_bytes = (1u32 << page_shift) * record_size;
        Ok(FixedPool {
            name: name.to_owned(),
            info,
            record_size,
            page_shift,
            max_atoms,
            flags,
            table,
            table_entries,
            pages_per_chunk: items_shift32(chunk_bytes, seg.page_shift()).max(1),
        })
    }

    /// Record size in bytes (rounded to a word).
    #[must_use]
    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    /// Exclusive upper bound on atom values this pool will issue.
    #[must_use]
    pub fn max_atoms(&self) -> u32 {
        self.max_atoms
    }

    fn info_off(&self, seg: &Segment) -> usize {
        seg.matom_offset(self.info)
    }

    fn free_head(&self, seg: &Segment) -> u32 {
        seg.read_u32(self.info_off(seg) + FI_FREE)
    }

    fn set_free_head(&self, seg: &mut Segment, value: u32) {
        let off = self.info_off(seg) + FI_FREE;
        seg.write_u32(off, value);
    }

    fn page_count(&self, seg: &Segment) -> u32 {
        seg.read_u32(self.info_off(seg) + FI_PAGE_COUNT)
    }

    fn set_page_count(&self, seg: &mut Segment, value: u32) {
        let off = self.info_off(seg) + FI_PAGE_COUNT;
        seg.write_u32(off, value);
    }

    fn table_slot(&self, seg: &Segment, page: u32) -> u32 {
        seg.read_u32(seg.matom_offset(self.table) + (page as usize) * 4)
    }

    fn set_table_slot(&self, seg: &mut Segment, page: u32, matom: Matom) {
        let off = seg.matom_offset(self.table) + (page as usize) * 4;
        seg.write_u32(off, matom.value());
    }

    /// Byte offset of a record, or `None` when the atom is null, out of
    /// range, or its page has never been mapped.
    #[must_use]
    pub fn offset_of(&self, seg: &Segment, atom: Atom) -> Option<usize> {
        let a = atom.value();
        if a == 0 || a >= self.max_atoms {
            return None;
        }
        let page = a >> self.page_shift;
        if page >= self.table_entries {
            return None;
        }
        let chunk = self.table_slot(seg, page);
        if chunk == 0 {
            return None;
        }
        let slot = a & ((1u32 << self.page_shift) - 1);
        Some(
            ((chunk as usize) << seg.page_shift())
                + (slot as usize) * (self.record_size as usize),
        )
    }

    /// Borrow a record's bytes; out-of-range atoms return `None` rather
    /// than aborting.
    #[must_use]
    pub fn addr<'s>(&self, seg: &'s Segment, atom: Atom) -> Option<&'s [u8]> {
        self.offset_of(seg, atom)
            .map(|off| seg.bytes(off, self.record_size as usize))
    }

    /// Mutably borrow a record's bytes.
    pub fn addr_mut<'s>(&self, seg: &'s mut Segment, atom: Atom) -> Option<&'s mut [u8]> {
        self.offset_of(seg, atom)
            .map(|off| seg.bytes_mut(off, self.record_size as usize))
    }

    /// Detach and return the head of the free list, mapping a new page
    /// when the list is empty.  Returns the null atom when the pool is at
    /// `max_atoms`; record bytes are not cleared on reuse.
    pub fn alloc(&self, seg: &mut Segment) -> Result<Atom> {
        if let Some(atom) = self.pop_free(seg) {
            return Ok(atom);
        }
        if !self.map_page(seg)? {
            warn!(pool = %self.name, max_atoms = self.max_atoms, "pool out of atoms");
            return Ok(Atom::NULL);
        }
        Ok(self.pop_free(seg).unwrap_or(Atom::NULL))
    }

    fn pop_free(&self, seg: &mut Segment) -> Option<Atom> {
        let head = self.free_head(seg);
        if head == 0 {
            return None;
        }
        let off = self
            .offset_of(seg, Atom::new(head))
            .expect("free-list head must resolve");
        let next = seg.read_u32(off);
        self.set_free_head(seg, next);
        Some(Atom::new(head))
    }

    /// Map one more record page and chain its records onto the free list.
    /// Returns false when `max_atoms` is exhausted.
    fn map_page(&self, seg: &mut Segment) -> Result<bool> {
        let page = self.page_count(seg);
        if page >= self.table_entries {
            return Ok(false);
        }
        let records_per_page = 1u32 << self.page_shift;
        let first = page << self.page_shift;
        let start = first.max(1); // atom 0 is never issued
        let end = (first + records_per_page).min(self.max_atoms);
        if start >= end {
            return Ok(false);
        }

        let chunk = seg.alloc_pages(self.pages_per_chunk)?;
        if self.flags & PFF_INIT_ZERO != 0 {
            let base = seg.matom_offset(chunk);
            let len = (self.pages_per_chunk as usize) << seg.page_shift();
            seg.bytes_mut(base, len).fill(0);
        }
        self.set_table_slot(seg, page, chunk);
        self.set_page_count(seg, page + 1);

        let base = seg.matom_offset(chunk);
        let mask = records_per_page - 1;
        for a in start..end {
            let off = base + ((a & mask) as usize) * (self.record_size as usize);
            let next = if a + 1 < end { a + 1 } else { self.free_head(seg) };
            seg.write_u32(off, next);
        }
        self.set_free_head(seg, start);
        Ok(true)
    }

    /// Push a record onto the head of the free list.
    ///
    /// Freeing an atom that was never issued is a programmer error and
    /// aborts.
    pub fn free(&self, seg: &mut Segment, atom: Atom) {
        let off = self
            .offset_of(seg, atom)
            .expect("freeing an atom that was never issued");
        let head = self.free_head(seg);
        seg.write_u32(off, head);
        self.set_free_head(seg, atom.value());
    }

    /// Byte offset of a directly indexed element, mapping its page on
    /// first touch.
    ///
    /// This is the access path for tables indexed by externally assigned
    /// ids (rule states); such a pool never uses `alloc`/`free`, so the
    /// mapped pages are not chained onto the free list.
    pub fn element_offset(&self, seg: &mut Segment, atom: Atom) -> Result<usize> {
        let a = atom.value();
        if a == 0 || a >= self.max_atoms {
            return Err(ParrotError::Full {
                name: self.name.clone(),
            });
        }
        let page = a >> self.page_shift;
        if page >= self.table_entries {
            return Err(ParrotError::Full {
                name: self.name.clone(),
            });
        }
        if self.table_slot(seg, page) == 0 {
            let chunk = seg.alloc_pages(self.pages_per_chunk)?;
            if self.flags & PFF_INIT_ZERO != 0 {
                let base = seg.matom_offset(chunk);
                let len = (self.pages_per_chunk as usize) << seg.page_shift();
                seg.bytes_mut(base, len).fill(0);
            }
            self.set_table_slot(seg, page, chunk);
            let count = self.page_count(seg);
            if page + 1 > count {
                self.set_page_count(seg, page + 1);
            }
        }
        Ok(self
            .offset_of(seg, atom)
            .expect("element page was just mapped"))
    }
}
