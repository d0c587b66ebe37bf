//! The ParrotDB backing store: a memory-mapped segment plus the paged
//! allocators layered on it.
//!
//! A [`Segment`] maps a file and hands out page-granularity matoms; the
//! pools in this crate carve those pages into records ([`FixedPool`]),
//! size-classed chunks ([`ArbPool`]), and growable bitmaps
//! ([`BitmapPool`]).  Pool structs are lightweight handles: every byte of
//! durable state lives inside the segment, so cloning a handle or closing
//! and reopening the file yields the same atom-to-bytes mapping.

pub mod arb;
pub mod bitmap;
pub mod fixed;
pub mod segment;

pub use arb::ArbPool;
pub use bitmap::BitmapPool;
pub use fixed::FixedPool;
pub use segment::Segment;
