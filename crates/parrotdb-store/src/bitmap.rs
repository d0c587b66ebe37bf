//! The bitmap pool: variable-sized bitmaps identified by atom.
//!
//! Each bitmap is a small info record (capacity, data chunk) in a fixed
//! pool; the bits themselves live in the arb pool and grow on demand,
//! rounded to a fixed stride.  Bits are addressed by an externally
//! provided integer; the rule engine feeds name atoms in.

use parrotdb_error::{ParrotError, Result};
use parrotdb_types::{roundup32, Atom};

use crate::arb::ArbPool;
use crate::fixed::{FixedPool, PFF_INIT_ZERO};
use crate::segment::Segment;

/// Growth stride in bits (64 bytes at a time).
pub const BITMAP_STRIDE_BITS: u32 = 512;

const INFO_RECORD_BYTES: u32 = 8;
const BI_BITS: usize = 0;
const BI_DATA: usize = 4;
const MAX_MAPS: u32 = 1 << 20;

/// Handle to a pool of growable bitmaps inside a segment.
#[derive(Debug, Clone)]
pub struct BitmapPool {
    maps: FixedPool,
    chunks: ArbPool,
}

impl BitmapPool {
    /// Open or create the pool named `name`.
    pub fn open(seg: &mut Segment, name: &str) -> Result<Self> {
        let maps = FixedPool::open(
            seg,
            &format!("{name}.info"),
            8,
            INFO_RECORD_BYTES,
            MAX_MAPS,
            PFF_INIT_ZERO,
        )?;
        let chunks = ArbPool::open(seg, &format!("{name}.chunks"))?;
        Ok(BitmapPool { maps, chunks })
    }

    /// Reserve a new, initially empty bitmap.
    pub fn alloc(&self, seg: &mut Segment) -> Result<Atom> {
        let atom = self.maps.alloc(seg)?;
        if atom.is_null() {
            return Ok(Atom::NULL);
        }
        let off = self
            .maps
            .offset_of(seg, atom)
            .expect("freshly allocated bitmap record must resolve");
        seg.write_u32(off + BI_BITS, 0);
        seg.write_u32(off + BI_DATA, 0);
        Ok(atom)
    }

    /// Release a bitmap and its backing storage.
    pub fn free(&self, seg: &mut Segment, map: Atom) {
        let off = self
            .maps
            .offset_of(seg, map)
            .expect("freeing a bitmap that was never allocated");
        let data = Atom::new(seg.read_u32(off + BI_DATA));
        if !data.is_null() {
            self.chunks.free(seg, data);
        }
        self.maps.free(seg, map);
    }

    /// Set `bit`, growing the backing storage as needed.
    pub fn set(&self, seg: &mut Segment, map: Atom, bit: u32) -> Result<()> {
        let info_off = self
            .maps
            .offset_of(seg, map)
            .expect("setting a bit in a bitmap that was never allocated");
        let bits = seg.read_u32(info_off + BI_BITS);
        let mut data = Atom::new(seg.read_u32(info_off + BI_DATA));

        if bit >= bits {
            let new_bits = roundup32(bit + 1, BITMAP_STRIDE_BITS);
            let new_bytes = (new_bits / 8) as usize;
            let grown = self.chunks.alloc(seg, new_bytes)?;
            if grown.is_null() {
                return Err(ParrotError::Full {
                    name: "bitmap".to_owned(),
                });
            }
            let old_bytes = (bits / 8) as usize;
            let mut carry = vec![0u8; old_bytes];
            if !data.is_null() {
                let old = self
                    .chunks
                    .payload(seg, data)
                    .expect("bitmap backing chunk must resolve");
                carry.copy_from_slice(&old[..old_bytes]);
            }
            let payload = self
                .chunks
                .payload_mut(seg, grown)
                .expect("fresh chunk must resolve");
            payload[..new_bytes].fill(0);
            payload[..old_bytes].copy_from_slice(&carry);
            if !data.is_null() {
                self.chunks.free(seg, data);
            }
            seg.write_u32(info_off + BI_BITS, new_bits);
            seg.write_u32(info_off + BI_DATA, grown.value());
            data = grown;
        }

        let byte_off = ArbPool::payload_offset(data) + (bit / 8) as usize;
        let byte = seg.read_u8(byte_off);
        seg.write_u8(byte_off, byte | (1 << (bit & 7)));
        Ok(())
    }

    /// Test `bit`; bits beyond the current capacity read as clear.
    #[must_use]
    pub fn test(&self, seg: &Segment, map: Atom, bit: u32) -> bool {
        let Some(info_off) = self.maps.offset_of(seg, map) else {
            return false;
        };
        let bits = seg.read_u32(info_off + BI_BITS);
        if bit >= bits {
            return false;
        }
        let data = Atom::new(seg.read_u32(info_off + BI_DATA));
        let byte_off = ArbPool::payload_offset(data) + (bit / 8) as usize;
        seg.read_u8(byte_off) & (1 << (bit & 7)) != 0
    }

    /// Smallest set bit at or above `from`, for iteration-order compares.
    #[must_use]
    pub fn next_set(&self, seg: &Segment, map: Atom, from: u32) -> Option<u32> {
        let info_off = self.maps.offset_of(seg, map)?;
        let bits = seg.read_u32(info_off + BI_BITS);
        if from >= bits {
            return None;
        }
        let data = Atom::new(seg.read_u32(info_off + BI_DATA));
        let base = ArbPool::payload_offset(data);
        for bit in from..bits {
            if seg.read_u8(base + (bit / 8) as usize) & (1 << (bit & 7)) != 0 {
                return Some(bit);
            }
        }
        None
    }
}
