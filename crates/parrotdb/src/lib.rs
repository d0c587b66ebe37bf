//! ParrotDB: a persistent, memory-mapped object store and the streaming
//! XML ingestion engine built on it.
//!
//! Everything is addressed by 32-bit *atoms* rather than pointers, so a
//! segment file can be closed, reopened, and mapped at any address while
//! every handle stays valid.  The crates compose bottom-up: the
//! [`Segment`] maps the file and names sub-regions; fixed, arb, and
//! bitmap pools carve it into records, chunks, and bit sets; the
//! [`PatTree`] gives ordered search over atom-keyed byte strings; the
//! [`IstrTable`] interns strings; and the ingest layer tokenizes XML and
//! drives a rulebook to build persistent trees.

pub use parrotdb_error::{ParrotError, Result};
pub use parrotdb_types::{Atom, Matom, PoolType};

pub use parrotdb_store::{ArbPool, BitmapPool, FixedPool, Segment};

pub use parrotdb_istr::IstrTable;
pub use parrotdb_pat::{KeyFunc, PatTree, PAT_MAXKEY};

pub use parrotdb_ingest::{
    parse_document, Action, InsertPoint, Parser, Rulebook, Source, Token, TokenView, Tree, XmlType,
};
pub use parrotdb_ingest::source::{SF_IGNOREWS, SF_MMAP, SF_NOREAD, SF_READALL, SF_TRIMWS};
