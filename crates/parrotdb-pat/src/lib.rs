//! Patricia trie over atom-addressed nodes.
//!
//! Ordered search over a non-overlapping keyspace of variable-length byte
//! keys (byte increments only).  The tree never copies or owns keys: a
//! key function supplied at open time maps a data atom to its key bytes,
//! and all comparisons go through it.  Variable-length keys are only
//! sound when no key is a prefix of another; NUL-terminated strings have
//! this property if the NUL is included in the key.
//!
//! A node's *bit index* packs the byte offset in the high 8 bits and a
//! complemented within-byte mask in the low 8 bits, so comparing bit
//! indices numerically walks deep-before-shallow and an in-order
//! traversal yields keys in lexicographic order.  Traversal terminates
//! when the next node's bit index does not strictly increase; nodes
//! reached that way are external arrivals, and a node's child links that
//! no walk can follow are inert.

use tracing::warn;

use parrotdb_error::{ParrotError, Result};
use parrotdb_store::{FixedPool, Segment};
use parrotdb_types::{Atom, Matom, PoolType, Shift};

/// The maximum length of a key, in bytes.
pub const PAT_MAXKEY: usize = 256;

/// Bit index meaning "no bit": smaller than every real bit index.
pub const PAT_NOBIT: u16 = 0;

const INFO_BYTES: u32 = 8;
const PI_ROOT: usize = 0;
const PI_KEY_BYTES: usize = 4;

const NODE_BYTES: u32 = 16;
const N_LENGTH: usize = 0;
const N_BIT: usize = 2;
const N_LEFT: usize = 4;
const N_RIGHT: usize = 8;
const N_DATA: usize = 12;

/// Convert a key length in bytes to the packed bit format.
#[must_use]
pub const fn length_to_bit(len: u16) -> u16 {
    if len == 0 {
        PAT_NOBIT
    } else {
        ((len - 1) << 8) | 0xff
    }
}

/// Key length in bytes encoded by a packed length.
#[must_use]
pub const fn bit_to_length(bit: u16) -> u16 {
    (bit >> 8) + 1
}

/// Pack a byte offset and a bit-within-byte (0 = MSB) into a bit index.
#[must_use]
pub const fn makebit(byte_off: u16, bit_in_byte: u8) -> u16 {
    ((byte_off & 0xff) << 8) | (!(0x80u16 >> bit_in_byte) & 0x00ff)
}

/// Test a key bit; bits beyond the key read as clear.
#[must_use]
pub fn key_test(key: &[u8], bit: u16) -> bool {
    let idx = (bit >> 8) as usize;
    idx < key.len() && key[idx] & !(bit as u8) != 0
}

/// Maps a data atom to its key bytes.
///
/// The returned slice must start with the key and be at least as long as
/// the key length recorded in the node; it is borrowed from the segment
/// and copied out before any mutation.
pub trait KeyFunc {
    fn key<'s>(&self, seg: &'s Segment, datom: Atom) -> Option<&'s [u8]>;
}

#[derive(Debug, Clone, Copy)]
struct Node {
    length: u16,
    bit: u16,
    left: Atom,
    right: Atom,
    data: Atom,
}

/// A link slot that can be re-pointed during splicing: the root link or a
/// child side of a node.
#[derive(Debug, Clone, Copy)]
enum Link {
    Root,
    Left(Atom),
    Right(Atom),
}

/// A Patricia trie rooted in a named segment header.
///
/// The handle caches nothing mutable; the root atom and fixed key length
/// live in the info header, the nodes in a fixed pool.
#[derive(Debug, Clone)]
pub struct PatTree<K> {
    name: String,
    info: Matom,
    nodes: FixedPool,
    key_func: K,
}

impl<K: KeyFunc> PatTree<K> {
    /// Open or create the trie named `name`.
    ///
    /// `key_bytes` is the fixed key length in bytes, or 0 for
    /// variable-length keys.
    pub fn open(
        seg: &mut Segment,
        name: &str,
        key_func: K,
        key_bytes: u16,
        page_shift: Shift,
        max_atoms: u32,
    ) -> Result<Self> {
        let info = seg.header(name, PoolType::Pat, INFO_BYTES)?;
        let nodes = FixedPool::open(
            seg,
            &format!("{name}.nodes"),
            page_shift,
            NODE_BYTES,
            max_atoms,
            0,
        )?;
        let info_off = seg.matom_offset(info);
        let stored = seg.read_u16(info_off + PI_KEY_BYTES);
        if stored == 0 && key_bytes != 0 {
            seg.write_u16(info_off + PI_KEY_BYTES, key_bytes);
        } else if stored != key_bytes {
            return Err(ParrotError::Shape {
                name: name.to_owned(),
            });
        }
        Ok(PatTree {
            name: name.to_owned(),
            info,
            nodes,
            key_func,
        })
    }

    /// The fixed key length declared at open, 0 for variable length.
    #[must_use]
    pub fn key_bytes(&self, seg: &Segment) -> u16 {
        seg.read_u16(seg.matom_offset(self.info) + PI_KEY_BYTES)
    }

    /// Atom of the top node, null for an empty tree.
    #[must_use]
    pub fn root(&self, seg: &Segment) -> Atom {
        Atom::new(seg.read_u32(seg.matom_offset(self.info) + PI_ROOT))
    }

    #[must_use]
    pub fn is_empty(&self, seg: &Segment) -> bool {
        self.root(seg).is_null()
    }

    /// Data atom recorded in a node, null for the null node.
    #[must_use]
    pub fn node_data(&self, seg: &Segment, node: Atom) -> Atom {
        self.load(seg, node).map_or(Atom::NULL, |n| n.data)
    }

    /// Key length of a node in bytes.
    #[must_use]
    pub fn node_key_len(&self, seg: &Segment, node: Atom) -> u16 {
        self.load(seg, node).map_or(0, |n| bit_to_length(n.length))
    }

    /// Tear down the root; the tree must be empty.
    pub fn root_delete(&self, seg: &Segment) {
        assert!(
            self.root(seg).is_null(),
            "patricia root deleted while tree is not empty"
        );
    }

    fn set_root(&self, seg: &mut Segment, atom: Atom) {
        let off = seg.matom_offset(self.info) + PI_ROOT;
        seg.write_u32(off, atom.value());
    }

    fn load(&self, seg: &Segment, atom: Atom) -> Option<Node> {
        let off = self.nodes.offset_of(seg, atom)?;
        Some(Node {
            length: seg.read_u16(off + N_LENGTH),
            bit: seg.read_u16(off + N_BIT),
            left: Atom::new(seg.read_u32(off + N_LEFT)),
            right: Atom::new(seg.read_u32(off + N_RIGHT)),
            data: Atom::new(seg.read_u32(off + N_DATA)),
        })
    }

    fn store(&self, seg: &mut Segment, atom: Atom, node: &Node) {
        let off = self
            .nodes
            .offset_of(seg, atom)
            .expect("storing through an atom that was never issued");
        seg.write_u16(off + N_LENGTH, node.length);
        seg.write_u16(off + N_BIT, node.bit);
        seg.write_u32(off + N_LEFT, node.left.value());
        seg.write_u32(off + N_RIGHT, node.right.value());
        seg.write_u32(off + N_DATA, node.data.value());
    }

    fn read_link(&self, seg: &Segment, link: Link) -> Atom {
        match link {
            Link::Root => self.root(seg),
            Link::Left(owner) => {
                let off = self.nodes.offset_of(seg, owner).expect("live link owner");
                Atom::new(seg.read_u32(off + N_LEFT))
            }
            Link::Right(owner) => {
                let off = self.nodes.offset_of(seg, owner).expect("live link owner");
                Atom::new(seg.read_u32(off + N_RIGHT))
            }
        }
    }

    fn write_link(&self, seg: &mut Segment, link: Link, value: Atom) {
        match link {
            Link::Root => self.set_root(seg, value),
            Link::Left(owner) => {
                let off = self.nodes.offset_of(seg, owner).expect("live link owner");
                seg.write_u32(off + N_LEFT, value.value());
            }
            Link::Right(owner) => {
                let off = self.nodes.offset_of(seg, owner).expect("live link owner");
                seg.write_u32(off + N_RIGHT, value.value());
            }
        }
    }

    /// Copy a data atom's key bytes into `buf`, returning the copied
    /// length.  Keys are copied out so walks can keep comparing while the
    /// node pool mutates.
    fn key_copy(&self, seg: &Segment, datom: Atom, buf: &mut [u8; PAT_MAXKEY]) -> usize {
        let Some(key) = self.key_func.key(seg, datom) else {
            return 0;
        };
        let len = key.len().min(PAT_MAXKEY);
        buf[..len].copy_from_slice(&key[..len]);
        len
    }

    /// Walk left to the smallest arrival below `cur`, entered with the
    /// last tested bit `bit`.
    fn leftmost(&self, seg: &Segment, mut bit: u16, mut cur: Atom) -> Atom {
        loop {
            let Some(n) = self.load(seg, cur) else {
                return Atom::NULL;
            };
            if bit >= n.bit {
                return cur;
            }
            bit = n.bit;
            cur = n.left;
        }
    }

    fn rightmost(&self, seg: &Segment, mut bit: u16, mut cur: Atom) -> Atom {
        loop {
            let Some(n) = self.load(seg, cur) else {
                return Atom::NULL;
            };
            if bit >= n.bit {
                return cur;
            }
            bit = n.bit;
            cur = n.right;
        }
    }

    /// Look up a node by exact key, returning its atom or null.
    ///
    /// `key` is the full key bytes (including the NUL for string keys).
    /// Zero-length keys are a contract violation.
    #[must_use]
    pub fn get(&self, seg: &Segment, key: &[u8]) -> Atom {
        assert!(!key.is_empty(), "zero-length patricia keys are not allowed");
        assert!(key.len() <= PAT_MAXKEY, "patricia keys are at most 256 bytes");
        let root = self.root(seg);
        if root.is_null() {
            return Atom::NULL;
        }
        let bit_len = length_to_bit(key.len() as u16);
        let mut bit = PAT_NOBIT;
        let mut cur = root;
        loop {
            let Some(n) = self.load(seg, cur) else {
                return Atom::NULL;
            };
            if bit >= n.bit {
                // External arrival; check for an exact match.
                if n.length != bit_len {
                    return Atom::NULL;
                }
                let mut kb = [0u8; PAT_MAXKEY];
                let klen = self.key_copy(seg, n.data, &mut kb);
                if klen >= key.len() && &kb[..key.len()] == key {
                    return cur;
                }
                return Atom::NULL;
            }
            bit = n.bit;
            cur = if bit < bit_len && key_test(key, bit) {
                n.right
            } else {
                n.left
            };
        }
    }

    /// Data atom of the node matching `key`, or null.
    #[must_use]
    pub fn get_atom(&self, seg: &Segment, key: &[u8]) -> Atom {
        self.node_data(seg, self.get(seg, key))
    }

    /// Exact lookup using the fixed key length declared at open.
    #[must_use]
    pub fn lookup(&self, seg: &Segment, key: &[u8]) -> Atom {
        let klen = self.key_bytes(seg) as usize;
        assert!(klen > 0, "lookup requires a fixed-length tree");
        self.get(seg, &key[..klen])
    }

    /// Least node at or above the fixed-length `key`; `return_eq`
    /// controls whether an exact match is returned or skipped.
    #[must_use]
    pub fn lookup_geq(&self, seg: &Segment, key: &[u8], return_eq: bool) -> Atom {
        let klen = self.key_bytes(seg) as usize;
        assert!(klen > 0, "lookup_geq requires a fixed-length tree");
        self.getnext(seg, &key[..klen], return_eq)
    }

    /// Insert `datom` under its key; `key_bytes` of 0 falls back to the
    /// fixed length declared at open.
    ///
    /// Fails with a duplicate error when the key equals, or
    /// prefix-overlaps, a key already in the tree.
    pub fn add(&self, seg: &mut Segment, datom: Atom, key_bytes: u16) -> Result<()> {
        let key_bytes = if key_bytes == 0 {
            self.key_bytes(seg)
        } else {
            key_bytes
        };
        assert!(
            key_bytes > 0 && key_bytes as usize <= PAT_MAXKEY,
            "patricia key length out of range"
        );
        let mut kb = [0u8; PAT_MAXKEY];
        let klen = self.key_copy(seg, datom, &mut kb);
        assert!(
            klen >= key_bytes as usize,
            "key function returned fewer bytes than the key length"
        );
        let key = &kb[..key_bytes as usize];
        let new_len = length_to_bit(key_bytes);

        let atom = self.nodes.alloc(seg)?;
        if atom.is_null() {
            warn!(tree = %self.name, "node pool out of atoms");
            return Err(ParrotError::Full {
                name: self.name.clone(),
            });
        }

        let root = self.root(seg);
        if root.is_null() {
            self.store(
                seg,
                atom,
                &Node {
                    length: new_len,
                    bit: PAT_NOBIT,
                    left: atom,
                    right: atom,
                    data: datom,
                },
            );
            self.set_root(seg, atom);
            return Ok(());
        }

        // Walk down to the closest matching arrival.
        let mut bit = PAT_NOBIT;
        let mut cur = root;
        let mut node = self.corrupt_check(self.load(seg, cur))?;
        while bit < node.bit {
            bit = node.bit;
            cur = if bit < new_len && key_test(key, bit) {
                node.right
            } else {
                node.left
            };
            node = self.corrupt_check(self.load(seg, cur))?;
        }

        // Find the first differing bit between the new key and the
        // arrival's key.
        let mut cb = [0u8; PAT_MAXKEY];
        let _ = self.key_copy(seg, node.data, &mut cb);
        let byte_len = bit_to_length(node.length.min(new_len)) as usize;
        let Some(off) = (0..byte_len).find(|&o| key[o] != cb[o]) else {
            // Same key, or one key is a prefix of the other.
            self.nodes.free(seg, atom);
            return Err(ParrotError::Duplicate);
        };
        let diff = key[off] ^ cb[off];
        let dbit = makebit(off as u16, diff.leading_zeros() as u8);

        // Walk down again to where the new bit belongs.
        let mut link = Link::Root;
        let mut b = PAT_NOBIT;
        let mut cur = root;
        let mut node = self.corrupt_check(self.load(seg, cur))?;
        while b < node.bit && node.bit < dbit {
            b = node.bit;
            if b < new_len && key_test(key, b) {
                link = Link::Right(cur);
                cur = node.right;
            } else {
                link = Link::Left(cur);
                cur = node.left;
            }
            node = self.corrupt_check(self.load(seg, cur))?;
        }

        // Splice in the new node with its self-link on the side of its
        // own bit.
        let new_node = if key_test(key, dbit) {
            Node {
                length: new_len,
                bit: dbit,
                left: cur,
                right: atom,
                data: datom,
            }
        } else {
            Node {
                length: new_len,
                bit: dbit,
                left: atom,
                right: cur,
                data: datom,
            }
        };
        self.store(seg, atom, &new_node);
        self.write_link(seg, link, atom);
        Ok(())
    }

    fn corrupt_check(&self, node: Option<Node>) -> Result<Node> {
        node.ok_or_else(|| {
            ParrotError::internal(format!("patricia tree {:?} has a dangling link", self.name))
        })
    }

    /// Remove `target` from the tree and free its node record.
    ///
    /// The two links incident to the removed node are re-spliced: the
    /// parent's other child replaces the parent, and the parent's record
    /// takes over the target's internal position.
    pub fn delete(&self, seg: &mut Segment, target: Atom) -> Result<()> {
        let root = self.root(seg);
        if root.is_null() {
            return Err(ParrotError::NotFound);
        }
        let tnode = self.load(seg, target).ok_or(ParrotError::NotFound)?;
        let mut kb = [0u8; PAT_MAXKEY];
        let klen = self.key_copy(seg, tnode.data, &mut kb);
        let bit_len = tnode.length;
        let kbytes = bit_to_length(bit_len) as usize;
        if klen < kbytes {
            return Err(ParrotError::NotFound);
        }
        let key = &kb[..kbytes];

        // Walk down to the arrival, tracking the arrival link and the
        // link into its owner.
        let mut bit = PAT_NOBIT;
        let mut upl = Link::Root;
        let mut downl = Link::Root;
        let mut parent = Atom::NULL;
        let mut cur = root;
        let mut node = self.load(seg, cur).ok_or(ParrotError::NotFound)?;
        while bit < node.bit {
            bit = node.bit;
            downl = upl;
            parent = cur;
            upl = if bit < bit_len && key_test(key, bit) {
                Link::Right(cur)
            } else {
                Link::Left(cur)
            };
            cur = self.read_link(seg, upl);
            node = self.load(seg, cur).ok_or(ParrotError::NotFound)?;
        }
        if cur != target {
            return Err(ParrotError::NotFound);
        }

        if parent.is_null() {
            // Only node in the tree.
            self.set_root(seg, Atom::NULL);
            self.nodes.free(seg, target);
            return Ok(());
        }

        let pn = self.corrupt_check(self.load(seg, parent))?;
        let sibling = match upl {
            Link::Right(_) => pn.left,
            Link::Left(_) => pn.right,
            Link::Root => unreachable!("arrival link owned by a node"),
        };
        // Bypass the parent: the link that pointed at it takes its other
        // child.
        self.write_link(seg, downl, sibling);

        if parent != target {
            // The parent record takes over the target's internal
            // position.  Find the link reaching the target mid-walk; the
            // bypass above cannot sit on that path.
            let mut l = Link::Root;
            let mut c = self.read_link(seg, Link::Root);
            while c != target {
                let n = self.corrupt_check(self.load(seg, c))?;
                l = if n.bit < bit_len && key_test(key, n.bit) {
                    Link::Right(c)
                } else {
                    Link::Left(c)
                };
                c = self.read_link(seg, l);
            }
            // Reload: the bypass may have rewritten one of the target's
            // child links.
            let t = self.corrupt_check(self.load(seg, target))?;
            let moved = Node {
                length: pn.length,
                bit: t.bit,
                left: t.left,
                right: t.right,
                data: pn.data,
            };
            self.store(seg, parent, &moved);
            self.write_link(seg, l, parent);
        }
        self.nodes.free(seg, target);
        Ok(())
    }

    /// Node with the next numerically larger key, the minimum for null.
    #[must_use]
    pub fn find_next(&self, seg: &Segment, node: Atom) -> Atom {
        let root = self.root(seg);
        if root.is_null() {
            return Atom::NULL;
        }
        if node.is_null() {
            return self.leftmost(seg, PAT_NOBIT, root);
        }
        let Some(n) = self.load(seg, node) else {
            return Atom::NULL;
        };
        let mut kb = [0u8; PAT_MAXKEY];
        let _ = self.key_copy(seg, n.data, &mut kb);
        let bit_len = n.length;
        let key = &kb[..bit_to_length(bit_len) as usize];

        let mut bit = PAT_NOBIT;
        let mut cur = root;
        let mut lastleft = Atom::NULL;
        loop {
            let Some(c) = self.load(seg, cur) else {
                return Atom::NULL;
            };
            if bit >= c.bit {
                break;
            }
            bit = c.bit;
            if bit < bit_len && key_test(key, bit) {
                cur = c.right;
            } else {
                lastleft = cur;
                cur = c.left;
            }
        }
        debug_assert_eq!(cur, node, "find_next walked to a different node");
        if lastleft.is_null() {
            return Atom::NULL;
        }
        let ln = self.load(seg, lastleft).expect("left turn owner is live");
        self.leftmost(seg, ln.bit, ln.right)
    }

    /// Node with the next numerically smaller key, the maximum for null.
    ///
    /// `find_prev(find_next(n)) == n` for any node in the tree or null.
    #[must_use]
    pub fn find_prev(&self, seg: &Segment, node: Atom) -> Atom {
        let root = self.root(seg);
        if root.is_null() {
            return Atom::NULL;
        }
        if node.is_null() {
            return self.rightmost(seg, PAT_NOBIT, root);
        }
        let Some(n) = self.load(seg, node) else {
            return Atom::NULL;
        };
        let mut kb = [0u8; PAT_MAXKEY];
        let _ = self.key_copy(seg, n.data, &mut kb);
        let bit_len = n.length;
        let key = &kb[..bit_to_length(bit_len) as usize];

        let mut bit = PAT_NOBIT;
        let mut cur = root;
        let mut lastright = Atom::NULL;
        loop {
            let Some(c) = self.load(seg, cur) else {
                return Atom::NULL;
            };
            if bit >= c.bit {
                break;
            }
            bit = c.bit;
            if bit < bit_len && key_test(key, bit) {
                lastright = cur;
                cur = c.right;
            } else {
                cur = c.left;
            }
        }
        debug_assert_eq!(cur, node, "find_prev walked to a different node");
        if lastright.is_null() {
            return Atom::NULL;
        }
        let rn = self.load(seg, lastright).expect("right turn owner is live");
        self.rightmost(seg, rn.bit, rn.left)
    }

    /// Least node whose key is at least `key`.
    ///
    /// With `return_eq` an exact match is returned; without it the next
    /// larger key is returned instead, a la SNMP getnext.
    #[must_use]
    pub fn getnext(&self, seg: &Segment, key: &[u8], return_eq: bool) -> Atom {
        assert!(!key.is_empty() && key.len() <= PAT_MAXKEY);
        let root = self.root(seg);
        if root.is_null() {
            return Atom::NULL;
        }
        let blen = length_to_bit(key.len() as u16);

        // Walk to the closest arrival.
        let mut bit = PAT_NOBIT;
        let mut cur = root;
        loop {
            let Some(n) = self.load(seg, cur) else {
                return Atom::NULL;
            };
            if bit >= n.bit {
                break;
            }
            bit = n.bit;
            cur = if bit < blen && key_test(key, bit) {
                n.right
            } else {
                n.left
            };
        }
        let Some(cn) = self.load(seg, cur) else {
            return Atom::NULL;
        };
        let mut cb = [0u8; PAT_MAXKEY];
        let _ = self.key_copy(seg, cn.data, &mut cb);
        let byte_len = bit_to_length(cn.length.min(blen)) as usize;

        let (dbit, key_is_less) = match (0..byte_len).find(|&o| key[o] != cb[o]) {
            None => {
                if blen == cn.length {
                    return if return_eq {
                        cur
                    } else {
                        self.find_next(seg, cur)
                    };
                }
                // One is a prefix of the other: the shorter sorts first,
                // and they diverge just past the shared bytes.
                debug_assert!(byte_len < PAT_MAXKEY);
                (makebit(byte_len as u16, 0), blen < cn.length)
            }
            Some(off) => {
                let diff = key[off] ^ cb[off];
                let i = diff.leading_zeros() as u8;
                (makebit(off as u16, i), key[off] & (0x80 >> i) == 0)
            }
        };

        if key_is_less {
            // Everything in the subtree at the divergence is larger than
            // the key; its leftmost arrival is the answer.
            let mut bit = PAT_NOBIT;
            let mut cur = root;
            loop {
                let Some(n) = self.load(seg, cur) else {
                    return Atom::NULL;
                };
                if bit >= n.bit || n.bit >= dbit {
                    break;
                }
                bit = n.bit;
                cur = if bit < blen && key_test(key, bit) {
                    n.right
                } else {
                    n.left
                };
            }
            self.leftmost(seg, bit, cur)
        } else {
            // Everything in the subtree at the divergence is smaller; the
            // answer follows the last left turn above it.
            let mut bit = PAT_NOBIT;
            let mut cur = root;
            let mut lastleft = Atom::NULL;
            loop {
                let Some(n) = self.load(seg, cur) else {
                    return Atom::NULL;
                };
                if bit >= n.bit || n.bit >= dbit {
                    break;
                }
                bit = n.bit;
                if bit < blen && key_test(key, bit) {
                    cur = n.right;
                } else {
                    lastleft = cur;
                    cur = n.left;
                }
            }
            if lastleft.is_null() {
                return Atom::NULL;
            }
            let ln = self.load(seg, lastleft).expect("left turn owner is live");
            self.leftmost(seg, ln.bit, ln.right)
        }
    }

    /// Smallest node whose key starts with the first `prefix_len` bits of
    /// `prefix`, or null when nothing matches.
    #[must_use]
    pub fn subtree_match(&self, seg: &Segment, prefix_len: u16, prefix: &[u8]) -> Atom {
        assert!(prefix_len > 0, "prefix must have at least one bit");
        assert!((prefix_len as usize) <= PAT_MAXKEY * 8);
        let root = self.root(seg);
        if root.is_null() {
            return Atom::NULL;
        }
        let last = prefix_len - 1;
        let pbit = makebit(last >> 3, (last & 7) as u8);

        // Descend by the prefix's bits; once a node tests past the
        // prefix, the minimum match (if any) is leftmost.
        let mut bit = PAT_NOBIT;
        let mut cur = root;
        loop {
            let Some(n) = self.load(seg, cur) else {
                return Atom::NULL;
            };
            if bit >= n.bit {
                break;
            }
            bit = n.bit;
            cur = if bit <= pbit && key_test(prefix, bit) {
                n.right
            } else {
                n.left
            };
        }

        if self.shares_prefix(seg, cur, prefix_len, prefix) {
            cur
        } else {
            Atom::NULL
        }
    }

    /// In-order successor of `node` restricted to nodes sharing its first
    /// `prefix_len` bits.
    #[must_use]
    pub fn subtree_next(&self, seg: &Segment, node: Atom, prefix_len: u16) -> Atom {
        let next = self.find_next(seg, node);
        if next.is_null() {
            return Atom::NULL;
        }
        let Some(n) = self.load(seg, node) else {
            return Atom::NULL;
        };
        let mut kb = [0u8; PAT_MAXKEY];
        let klen = self.key_copy(seg, n.data, &mut kb);
        if self.shares_prefix(seg, next, prefix_len, &kb[..klen]) {
            next
        } else {
            Atom::NULL
        }
    }

    fn shares_prefix(&self, seg: &Segment, node: Atom, prefix_len: u16, prefix: &[u8]) -> bool {
        let Some(n) = self.load(seg, node) else {
            return false;
        };
        let klen_bytes = bit_to_length(n.length) as usize;
        if klen_bytes * 8 < prefix_len as usize {
            return false;
        }
        let mut kb = [0u8; PAT_MAXKEY];
        let copied = self.key_copy(seg, n.data, &mut kb);
        let full = (prefix_len / 8) as usize;
        if copied < full || prefix.len() < full {
            return false;
        }
        if kb[..full] != prefix[..full] {
            return false;
        }
        let rem = prefix_len % 8;
        if rem == 0 {
            return true;
        }
        if copied <= full || prefix.len() <= full {
            return false;
        }
        let mask = 0xffu8 << (8 - rem);
        (kb[full] ^ prefix[full]) & mask == 0
    }

    /// Lexicographic comparison of two nodes' keys; with a shared prefix
    /// the shorter key sorts first.
    #[must_use]
    pub fn compare_nodes(&self, seg: &Segment, left: Atom, right: Atom) -> std::cmp::Ordering {
        let (ln, rn) = match (self.load(seg, left), self.load(seg, right)) {
            (Some(l), Some(r)) => (l, r),
            _ => return std::cmp::Ordering::Equal,
        };
        let mut lb = [0u8; PAT_MAXKEY];
        let mut rb = [0u8; PAT_MAXKEY];
        let _ = self.key_copy(seg, ln.data, &mut lb);
        let _ = self.key_copy(seg, rn.data, &mut rb);
        let llen = bit_to_length(ln.length) as usize;
        let rlen = bit_to_length(rn.length) as usize;
        lb[..llen].cmp(&rb[..rlen])
    }
}
