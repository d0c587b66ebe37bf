//! The segment allocator: a file mapped writable, carved into fixed-size
//! pages, with a small in-segment directory mapping header names to
//! (type, page, length) entries.
//!
//! Page 0 holds the superblock and the directory; pages are bump-allocated
//! and never returned.  Higher-level pools free and reuse their own atoms
//! inside the pages they own.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use parrotdb_error::{ParrotError, Result};
use parrotdb_types::{
    decode_native_u16, decode_native_u32, encode_native_u16, encode_native_u32, items_shift32,
    roundup32, Matom, PoolType, Shift,
};

/// Magic prefix of a segment file.
pub const SEGMENT_MAGIC: [u8; 4] = *b"PRDB";
/// On-disk format version.
pub const SEGMENT_VERSION: u8 = 1;
/// Byte-order marker, written native; reads back swapped on a foreign
/// machine and the open is rejected.
pub const BYTE_ORDER_MARK: u16 = 0x1234;

/// Log2 of the page size.
pub const PAGE_SHIFT: Shift = 13;
/// Bytes per page (8 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Maximum header name length in bytes (the directory slot holds 32
/// bytes including the NUL).
pub const HEADER_NAME_MAX: usize = 31;

const INITIAL_PAGES: u32 = 64;
const GROW_PAGES: u32 = 64;

// Superblock field offsets.
const SB_MAGIC: usize = 0;
const SB_VERSION: usize = 4;
const SB_PAGE_SHIFT: usize = 5;
const SB_BYTE_ORDER: usize = 6;
const SB_NUM_PAGES: usize = 8;
const SB_FREE_PAGE: usize = 12;
const SB_DIR_COUNT: usize = 16;

// Directory layout: fixed-width entries starting at DIR_OFFSET in page 0.
const DIR_OFFSET: usize = 64;
const DIR_ENTRY_BYTES: usize = 48;
const DIR_MAX_ENTRIES: u32 = 128;
const DE_NAME: usize = 0; // 32 bytes, NUL padded
const DE_TYPE: usize = 32;
const DE_PAGE: usize = 36;
const DE_LEN: usize = 40;

/// A file mapped into memory as a sequence of pages.
///
/// Every pool borrows the segment by reference; the segment outlives all
/// of them.  Pointers handed out by `bytes`/`bytes_mut` are only valid
/// until the next mutation that can grow the mapping.
#[derive(Debug)]
pub struct Segment {
    file: std::fs::File,
    map: MmapMut,
    path: PathBuf,
}

impl Segment {
    /// Open a segment file, reusing the existing directory if the magic
    /// matches, initializing a fresh superblock otherwise.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ParrotError::io(&path, e))?;

        let len = file
            .metadata()
            .map_err(|e| ParrotError::io(&path, e))?
            .len();
        let fresh = len == 0;
        if fresh {
            file.set_len(u64::from(INITIAL_PAGES) << PAGE_SHIFT)
                .map_err(|e| ParrotError::io(&path, e))?;
        } else if len < PAGE_SIZE as u64 {
            return Err(ParrotError::BadMagic { path });
        }

        let map = unsafe {
            MmapOptions::new()
                .map_mut(&file)
                .map_err(|e| ParrotError::io(&path, e))?
        };

        let mut seg = Segment { file, map, path };
        if fresh {
            seg.init_superblock();
            seg.flush_header_page()?;
        } else {
            seg.check_superblock()?;
        }
        Ok(seg)
    }

    fn init_superblock(&mut self) {
        self.map[SB_MAGIC..SB_MAGIC + 4].copy_from_slice(&SEGMENT_MAGIC);
        self.map[SB_VERSION] = SEGMENT_VERSION;
        self.map[SB_PAGE_SHIFT] = PAGE_SHIFT;
        self.write_u16(SB_BYTE_ORDER, BYTE_ORDER_MARK);
        let pages = (self.map.len() >> PAGE_SHIFT) as u32;
        self.write_u32(SB_NUM_PAGES, pages);
        self.write_u32(SB_FREE_PAGE, 1);
        self.write_u32(SB_DIR_COUNT, 0);
        debug!(path = %self.path.display(), pages, "initialized segment");
    }

    fn check_superblock(&self) -> Result<()> {
        if self.map[SB_MAGIC..SB_MAGIC + 4] != SEGMENT_MAGIC {
            return Err(ParrotError::BadMagic {
                path: self.path.clone(),
            });
        }
        if self.map[SB_VERSION] != SEGMENT_VERSION
            || self.map[SB_PAGE_SHIFT] != PAGE_SHIFT
            || self.read_u16(SB_BYTE_ORDER) != BYTE_ORDER_MARK
        {
            return Err(ParrotError::Incompatible {
                path: self.path.clone(),
            });
        }
        Ok(())
    }

    /// The page size of this segment in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    /// Log2 of the page size.
    #[must_use]
    pub fn page_shift(&self) -> Shift {
        PAGE_SHIFT
    }

    /// Byte offset of a page-granularity matom.
    #[must_use]
    pub fn matom_offset(&self, matom: Matom) -> usize {
        (matom.value() as usize) << PAGE_SHIFT
    }

    /// Bump-allocate `count` contiguous pages, growing the file as needed.
    pub fn alloc_pages(&mut self, count: u32) -> Result<Matom> {
        debug_assert!(count > 0, "page allocations are at least one page");
        let free = self.read_u32(SB_FREE_PAGE);
        let need = free + count;
        let have = self.read_u32(SB_NUM_PAGES);
        if need > have {
            self.grow(roundup32(need, GROW_PAGES))?;
        }
        self.write_u32(SB_FREE_PAGE, need);
        Ok(Matom::new(free))
    }

    fn grow(&mut self, new_pages: u32) -> Result<()> {
        self.file
            .set_len(u64::from(new_pages) << PAGE_SHIFT)
            .map_err(|e| ParrotError::io(&self.path, e))?;
        self.map = unsafe {
            MmapOptions::new()
                .map_mut(&self.file)
                .map_err(|e| ParrotError::io(&self.path, e))?
        };
        self.write_u32(SB_NUM_PAGES, new_pages);
        debug!(path = %self.path.display(), new_pages, "grew segment");
        Ok(())
    }

    /// Look up or allocate a named header region of `bytes` bytes.
    ///
    /// A fresh region is zero-filled.  An existing entry with the same
    /// name must match in type and declared size or the call fails with a
    /// shape error; duplicate names are therefore impossible within one
    /// segment.
    pub fn header(&mut self, name: &str, ty: PoolType, bytes: u32) -> Result<Matom> {
        if name.is_empty() || name.len() > HEADER_NAME_MAX {
            return Err(ParrotError::internal(format!(
                "header name {name:?} must be 1..={HEADER_NAME_MAX} bytes"
            )));
        }
        if let Some((found_ty, matom, len)) = self.find_header(name) {
            if found_ty != ty || len != bytes {
                return Err(ParrotError::Shape {
                    name: name.to_owned(),
                });
            }
            return Ok(matom);
        }

        let count = self.read_u32(SB_DIR_COUNT);
        if count >= DIR_MAX_ENTRIES {
            return Err(ParrotError::DirectoryFull);
        }
        let pages = items_shift32(bytes.max(1), PAGE_SHIFT);
        let matom = self.alloc_pages(pages)?;

        let entry = DIR_OFFSET + (count as usize) * DIR_ENTRY_BYTES;
        self.map[entry + DE_NAME..entry + DE_NAME + 32].fill(0);
        self.map[entry + DE_NAME..entry + DE_NAME + name.len()].copy_from_slice(name.as_bytes());
        self.map[entry + DE_TYPE] = ty as u8;
        self.write_u32(entry + DE_PAGE, matom.value());
        self.write_u32(entry + DE_LEN, bytes);
        self.write_u32(SB_DIR_COUNT, count + 1);
        // The directory is written eagerly so a crash after pool setup
        // still finds every name on reopen.
        self.flush_header_page()?;
        debug!(name, ?ty, page = matom.value(), bytes, "allocated header");
        Ok(matom)
    }

    /// Find a header by name without allocating.
    #[must_use]
    pub fn find_header(&self, name: &str) -> Option<(PoolType, Matom, u32)> {
        let count = self.read_u32(SB_DIR_COUNT);
        for i in 0..count as usize {
            let entry = DIR_OFFSET + i * DIR_ENTRY_BYTES;
            let stored = &self.map[entry + DE_NAME..entry + DE_NAME + 32];
            let end = stored.iter().position(|&b| b == 0).unwrap_or(32);
            if &stored[..end] == name.as_bytes() {
                return Some((
                    PoolType::from_u8(self.map[entry + DE_TYPE]),
                    Matom::new(self.read_u32(entry + DE_PAGE)),
                    self.read_u32(entry + DE_LEN),
                ));
            }
        }
        None
    }

    /// Borrow `len` bytes at `offset`.
    #[must_use]
    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.map[offset..offset + len]
    }

    /// Mutably borrow `len` bytes at `offset`.
    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.map[offset..offset + len]
    }

    /// Read a native-order u32 field.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.map[offset..offset + 4]);
        decode_native_u32(raw)
    }

    /// Write a native-order u32 field.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.map[offset..offset + 4].copy_from_slice(&encode_native_u32(value));
    }

    /// Read a native-order u16 field.
    #[must_use]
    pub fn read_u16(&self, offset: usize) -> u16 {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(&self.map[offset..offset + 2]);
        decode_native_u16(raw)
    }

    /// Write a native-order u16 field.
    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.map[offset..offset + 2].copy_from_slice(&encode_native_u16(value));
    }

    /// Read a single byte.
    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.map[offset]
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.map[offset] = value;
    }

    /// Flush all dirty pages to the backing file.
    pub fn flush(&self) -> Result<()> {
        self.map.flush().map_err(|e| ParrotError::io(&self.path, e))
    }

    /// Flush only the superblock/directory page.
    pub fn flush_header_page(&self) -> Result<()> {
        self.map
            .flush_range(0, PAGE_SIZE)
            .map_err(|e| ParrotError::io(&self.path, e))
    }

    /// Flush dirty pages and unmap.
    pub fn close(self) -> Result<()> {
        self.flush()
        // The map and file unmap/close on drop.
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let _ = self.map.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_segment_has_empty_directory() {
        let dir = tempdir().unwrap();
        let seg = Segment::open(dir.path().join("t.db")).unwrap();
        assert_eq!(seg.find_header("anything"), None);
        assert_eq!(seg.page_size(), PAGE_SIZE);
    }

    #[test]
    fn alloc_pages_is_contiguous_and_monotone() {
        let dir = tempdir().unwrap();
        let mut seg = Segment::open(dir.path().join("t.db")).unwrap();
        let a = seg.alloc_pages(2).unwrap();
        let b = seg.alloc_pages(1).unwrap();
        assert_eq!(a.value(), 1);
        assert_eq!(b.value(), 3);
    }

    #[test]
    fn alloc_pages_grows_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let mut seg = Segment::open(&path).unwrap();
        let m = seg.alloc_pages(INITIAL_PAGES * 2).unwrap();
        assert_eq!(m.value(), 1);
        // Writing into the tail of the allocation must not be out of
        // bounds.
        let off = seg.matom_offset(Matom::new(INITIAL_PAGES * 2));
        seg.write_u32(off, 0xDEAD_BEEF);
        assert_eq!(seg.read_u32(off), 0xDEAD_BEEF);
    }

    #[test]
    fn header_round_trips_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let first;
        {
            let mut seg = Segment::open(&path).unwrap();
            first = seg.header("pool.info", PoolType::Fixed, 32).unwrap();
            let off = seg.matom_offset(first);
            seg.write_u32(off, 42);
            seg.close().unwrap();
        }
        let mut seg = Segment::open(&path).unwrap();
        let again = seg.header("pool.info", PoolType::Fixed, 32).unwrap();
        assert_eq!(again.value(), first.value());
        assert_eq!(seg.read_u32(seg.matom_offset(again)), 42);
    }

    #[test]
    fn header_shape_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let mut seg = Segment::open(dir.path().join("t.db")).unwrap();
        seg.header("pool.info", PoolType::Fixed, 32).unwrap();
        let err = seg.header("pool.info", PoolType::Arb, 32).unwrap_err();
        assert!(matches!(err, ParrotError::Shape { .. }));
        let err = seg.header("pool.info", PoolType::Fixed, 64).unwrap_err();
        assert!(matches!(err, ParrotError::Shape { .. }));
    }

    #[test]
    fn fresh_header_is_zero_filled() {
        let dir = tempdir().unwrap();
        let mut seg = Segment::open(dir.path().join("t.db")).unwrap();
        let m = seg.header("zeros", PoolType::Opaque, 128).unwrap();
        let off = seg.matom_offset(m);
        assert!(seg.bytes(off, 128).iter().all(|&b| b == 0));
    }

    #[test]
    fn non_segment_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.db");
        std::fs::write(&path, vec![0x55u8; PAGE_SIZE * 2]).unwrap();
        let err = Segment::open(&path).unwrap_err();
        assert!(matches!(err, ParrotError::BadMagic { .. }));
    }

    #[test]
    fn overlong_header_name_is_rejected() {
        let dir = tempdir().unwrap();
        let mut seg = Segment::open(dir.path().join("t.db")).unwrap();
        let name = "x".repeat(HEADER_NAME_MAX + 1);
        assert!(seg.header(&name, PoolType::Opaque, 8).is_err());
    }
}
