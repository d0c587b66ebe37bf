//! The arbitrary pool: variable-size allocations with power-of-two size
//! classes over a segment.
//!
//! Every chunk starts with a one-word header whose first byte records the
//! size class, so `free` is O(1).  Atoms are the chunk's byte offset in
//! 16-byte granules; since page 0 holds the superblock, no arb atom is
//! ever below 512 and the range `1..=256` stays free for short strings.

use tracing::warn;

use parrotdb_error::Result;
use parrotdb_types::{Atom, Matom, PoolType, Shift};

use crate::segment::Segment;

/// Log2 of the atom granule (16 bytes).
pub const ARB_ATOM_SHIFT: Shift = 4;

const MIN_CLASS: Shift = 4;
const MAX_CLASS: Shift = 24;
const NUM_CLASSES: usize = (MAX_CLASS - MIN_CLASS + 1) as usize;
const CHUNK_HEADER: usize = 4;
const INFO_BYTES: u32 = (NUM_CLASSES as u32) * 4;

/// Handle to a size-classed variable allocator inside a segment.
///
/// Per-class free-list heads live in the header region; the handle itself
/// holds nothing but the header location.
#[derive(Debug, Clone)]
pub struct ArbPool {
    name: String,
    info: Matom,
}

impl ArbPool {
    /// Open or create the pool named `name`.
    pub fn open(seg: &mut Segment, name: &str) -> Result<Self> {
        let info = seg.header(name, PoolType::Arb, INFO_BYTES)?;
        Ok(ArbPool {
            name: name.to_owned(),
            info,
        })
    }

    /// Usable payload bytes of a chunk in class `class`.
    #[must_use]
    pub const fn class_capacity(class: Shift) -> usize {
        (1usize << class) - CHUNK_HEADER
    }

    /// Largest single allocation this pool supports.
    #[must_use]
    pub const fn max_alloc() -> usize {
        Self::class_capacity(MAX_CLASS)
    }

    fn class_for(len: usize) -> Option<Shift> {
        let needed = len + CHUNK_HEADER;
        let mut class = MIN_CLASS;
        while (1usize << class) < needed {
            class += 1;
            if class > MAX_CLASS {
                return None;
            }
        }
        Some(class)
    }

    fn head_off(&self, seg: &Segment, class: Shift) -> usize {
        seg.matom_offset(self.info) + ((class - MIN_CLASS) as usize) * 4
    }

    /// Allocate a chunk with at least `len` payload bytes.
    ///
    /// Returns the null atom (with a warning) when `len` exceeds the
    /// largest size class.  Freed chunks of the same class are reused
    /// first; payload bytes are not cleared on reuse.
    pub fn alloc(&self, seg: &mut Segment, len: usize) -> Result<Atom> {
        let Some(class) = Self::class_for(len) else {
            warn!(pool = %self.name, len, "allocation exceeds largest size class");
            return Ok(Atom::NULL);
        };

        let head_off = self.head_off(seg, class);
        let head = seg.read_u32(head_off);
        if head != 0 {
            let chunk_off = (head as usize) << ARB_ATOM_SHIFT;
            let next = seg.read_u32(chunk_off + CHUNK_HEADER);
            seg.write_u32(head_off, next);
            seg.write_u8(chunk_off, class);
            return Ok(Atom::new(head));
        }

        let chunk_bytes = 1usize << class;
        let base = if class <= seg.page_shift() {
            // Carve a fresh page into chunks of this class; the first is
            // returned, the rest go on the free list.
            let page = seg.alloc_pages(1)?;
            let base = seg.matom_offset(page);
            let count = seg.page_size() / chunk_bytes;
            let mut head = 0u32;
            for i in (1..count).rev() {
                let off = base + i * chunk_bytes;
                seg.write_u32(off + CHUNK_HEADER, head);
                head = (off >> ARB_ATOM_SHIFT) as u32;
            }
            seg.write_u32(head_off, head);
            base
        } else {
            let pages = 1u32 << (class - seg.page_shift());
            let page = seg.alloc_pages(pages)?;
            seg.matom_offset(page)
        };
        seg.write_u8(base, class);
        Ok(Atom::new((base >> ARB_ATOM_SHIFT) as u32))
    }

    /// Return a chunk to its class free list.
    pub fn free(&self, seg: &mut Segment, atom: Atom) {
        let chunk_off = (atom.value() as usize) << ARB_ATOM_SHIFT;
        let class = seg.read_u8(chunk_off);
        assert!(
            !atom.is_null() && class >= MIN_CLASS && class <= MAX_CLASS,
            "freeing an atom that was never issued"
        );
        let head_off = self.head_off(seg, class);
        let head = seg.read_u32(head_off);
        let link = chunk_off + CHUNK_HEADER;
        seg.write_u32(link, head);
        seg.write_u32(head_off, atom.value());
    }

    /// Byte offset of a chunk's payload.
    #[must_use]
    pub fn payload_offset(atom: Atom) -> usize {
        ((atom.value() as usize) << ARB_ATOM_SHIFT) + CHUNK_HEADER
    }

    /// Borrow a chunk's full payload (class capacity, which may exceed
    /// the originally requested length).
    #[must_use]
    pub fn payload<'s>(&self, seg: &'s Segment, atom: Atom) -> Option<&'s [u8]> {
        if atom.is_null() {
            return None;
        }
        let chunk_off = (atom.value() as usize) << ARB_ATOM_SHIFT;
        let class = seg.read_u8(chunk_off);
        if !(MIN_CLASS..=MAX_CLASS).contains(&class) {
            return None;
        }
        Some(seg.bytes(chunk_off + CHUNK_HEADER, Self::class_capacity(class)))
    }

    /// Mutably borrow a chunk's full payload.
    pub fn payload_mut<'s>(&self, seg: &'s mut Segment, atom: Atom) -> Option<&'s mut [u8]> {
        if atom.is_null() {
            return None;
        }
        let chunk_off = (atom.value() as usize) << ARB_ATOM_SHIFT;
        let class = seg.read_u8(chunk_off);
        if !(MIN_CLASS..=MAX_CLASS).contains(&class) {
            return None;
        }
        Some(seg.bytes_mut(chunk_off + CHUNK_HEADER, Self::class_capacity(class)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Segment, ArbPool) {
        let dir = tempdir().unwrap();
        let mut seg = Segment::open(dir.path().join("t.db")).unwrap();
        let pool = ArbPool::open(&mut seg, "t.arb").unwrap();
        (dir, seg, pool)
    }

    #[test]
    fn alloc_write_read_back() {
        let (_dir, mut seg, pool) = setup();
        let a = pool.alloc(&mut seg, 11).unwrap();
        assert!(!a.is_null());
        pool.payload_mut(&mut seg, a).unwrap()[..11].copy_from_slice(b"hello world");
        assert_eq!(&pool.payload(&seg, a).unwrap()[..11], b"hello world");
    }

    #[test]
    fn atoms_stay_above_short_string_range() {
        let (_dir, mut seg, pool) = setup();
        for len in [0usize, 1, 15, 100, 5000] {
            let a = pool.alloc(&mut seg, len).unwrap();
            assert!(a.value() > 256, "arb atom {a} collides with short strings");
        }
    }

    #[test]
    fn free_reuses_same_class() {
        let (_dir, mut seg, pool) = setup();
        let a = pool.alloc(&mut seg, 40).unwrap();
        pool.free(&mut seg, a);
        let b = pool.alloc(&mut seg, 33).unwrap(); // same 64-byte class
        assert_eq!(a, b);
        let c = pool.alloc(&mut seg, 200).unwrap(); // different class
        assert_ne!(a, c);
    }

    #[test]
    fn multi_page_class_allocations() {
        let (_dir, mut seg, pool) = setup();
        let big = seg.page_size() * 2;
        let a = pool.alloc(&mut seg, big).unwrap();
        assert!(!a.is_null());
        let payload = pool.payload_mut(&mut seg, a).unwrap();
        assert!(payload.len() >= big);
        payload[big - 1] = 0xAA;
        assert_eq!(pool.payload(&seg, a).unwrap()[big - 1], 0xAA);
    }

    #[test]
    fn oversize_allocation_returns_null() {
        let (_dir, mut seg, pool) = setup();
        let a = pool.alloc(&mut seg, ArbPool::max_alloc() + 1).unwrap();
        assert!(a.is_null());
    }

    #[test]
    fn distinct_allocations_do_not_overlap() {
        let (_dir, mut seg, pool) = setup();
        let a = pool.alloc(&mut seg, 20).unwrap();
        let b = pool.alloc(&mut seg, 20).unwrap();
        pool.payload_mut(&mut seg, a).unwrap()[..4].copy_from_slice(b"aaaa");
        pool.payload_mut(&mut seg, b).unwrap()[..4].copy_from_slice(b"bbbb");
        assert_eq!(&pool.payload(&seg, a).unwrap()[..4], b"aaaa");
    }
}
