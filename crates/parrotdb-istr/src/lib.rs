//! The immutable-string table: interns NUL-free byte strings, returning
//! stable atoms whose dereference yields the same bytes for the lifetime
//! of the segment.
//!
//! Strings of length zero or one never touch the pools: atoms `1..=256`
//! decode from the static short-string table.  Longer strings are copied
//! once into the arb pool (with a trailing NUL) and deduplicated through
//! a Patricia trie keyed on the stored bytes.  Arb atoms are page-offset
//! based and start above 512, so the two atom ranges cannot collide.

use tracing::debug;

use parrotdb_error::Result;
use parrotdb_pat::{KeyFunc, PatTree, PAT_MAXKEY};
use parrotdb_store::{ArbPool, Segment};
use parrotdb_types::{short_string, short_string_atom, Atom, SHORT_STRINGS_MAX};

/// Key function for the dedup trie: a data atom is an arb chunk holding
/// the string bytes plus the trailing NUL, and that whole run is the key.
#[derive(Debug, Clone)]
pub struct IstrKey {
    data: ArbPool,
}

impl KeyFunc for IstrKey {
    fn key<'s>(&self, seg: &'s Segment, datom: Atom) -> Option<&'s [u8]> {
        let payload = self.data.payload(seg, datom)?;
        let nul = payload.iter().position(|&b| b == 0)?;
        Some(&payload[..=nul])
    }
}

/// Handle to an immutable-string table inside a segment.
#[derive(Debug, Clone)]
pub struct IstrTable {
    data: ArbPool,
    index: PatTree<IstrKey>,
}

impl IstrTable {
    /// Open or create the table named `name` (sub-pools `<name>.data` and
    /// `<name>.pat`).
    pub fn open(seg: &mut Segment, name: &str) -> Result<Self> {
        let data = ArbPool::open(seg, &format!("{name}.data"))?;
        let index = PatTree::open(
            seg,
            &format!("{name}.pat"),
            IstrKey { data: data.clone() },
            0,
            8,
            1 << 24,
        )?;
        Ok(IstrTable { data, index })
    }

    /// Intern a byte string, returning its atom.
    ///
    /// A second `intern` of equal bytes returns the same atom.  Interior
    /// NULs are a contract violation.  Strings too long for the dedup
    /// trie's key bound are stored without deduplication; strings the arb
    /// pool cannot hold yield the null atom.
    pub fn intern(&self, seg: &mut Segment, bytes: &[u8]) -> Result<Atom> {
        assert!(
            !bytes.contains(&0),
            "interned strings cannot contain interior NULs"
        );
        if bytes.len() <= 1 {
            return Ok(short_string_atom(bytes));
        }

        let dedup = bytes.len() + 1 <= PAT_MAXKEY;
        if dedup {
            let mut key = [0u8; PAT_MAXKEY];
            key[..bytes.len()].copy_from_slice(bytes);
            let found = self.index.get_atom(seg, &key[..=bytes.len()]);
            if !found.is_null() {
                return Ok(found);
            }
        }

        let atom = self.data.alloc(seg, bytes.len() + 1)?;
        if atom.is_null() {
            return Ok(Atom::NULL);
        }
        let payload = self
            .data
            .payload_mut(seg, atom)
            .expect("fresh string chunk must resolve");
        payload[..bytes.len()].copy_from_slice(bytes);
        payload[bytes.len()] = 0;

        if dedup {
            self.index.add(seg, atom, (bytes.len() + 1) as u16)?;
        } else {
            debug!(len = bytes.len(), "string exceeds dedup key bound");
        }
        Ok(atom)
    }

    /// Look up a string's atom without interning it.
    #[must_use]
    pub fn find(&self, seg: &Segment, bytes: &[u8]) -> Atom {
        if bytes.contains(&0) {
            return Atom::NULL;
        }
        if bytes.len() <= 1 {
            return short_string_atom(bytes);
        }
        if bytes.len() + 1 > PAT_MAXKEY {
            return Atom::NULL;
        }
        let mut key = [0u8; PAT_MAXKEY];
        key[..bytes.len()].copy_from_slice(bytes);
        self.index.get_atom(seg, &key[..=bytes.len()])
    }

    /// Dereference an atom to its bytes (without the trailing NUL).
    ///
    /// The slice is borrowed from the segment (or the static short-string
    /// table) and must not outlive the next pool mutation.
    #[must_use]
    pub fn deref<'s>(&self, seg: &'s Segment, atom: Atom) -> Option<&'s [u8]> {
        if atom.is_null() {
            return None;
        }
        if atom.value() <= SHORT_STRINGS_MAX {
            return short_string(atom);
        }
        let payload = self.data.payload(seg, atom)?;
        let nul = payload.iter().position(|&b| b == 0)?;
        Some(&payload[..nul])
    }
}
