//! The persistent XML tree: nodes in a fixed pool, names and content in
//! an immutable-string table.
//!
//! Nodes link parent, next sibling, and first child by atom; insertion
//! order under a parent is document order, kept O(1) by a moving
//! last-child pointer on the in-memory insertion stack.  Every open node
//! is linked into its parent before the next token is pulled, so a
//! half-built tree is always well formed.

use tracing::warn;

use parrotdb_error::{ParrotError, Result};
use parrotdb_istr::IstrTable;
use parrotdb_store::{FixedPool, Segment};
use parrotdb_types::{Atom, Matom, PoolType};

use crate::XmlType;

const INFO_BYTES: u32 = 8;
const TI_ROOT: usize = 0;

const NODE_BYTES: u32 = 28;
const NT_TYPE: usize = 0;
const NT_DEPTH: usize = 1;
const NT_NAME: usize = 4;
const NT_NS: usize = 8;
const NT_PARENT: usize = 12;
const NT_NEXT: usize = 16;
const NT_CHILD: usize = 20;
const NT_CONTENT: usize = 24;

/// Decoded copy of one tree node.
#[derive(Debug, Clone, Copy)]
pub struct NodeView {
    pub ttype: XmlType,
    pub depth: u8,
    pub name: Atom,
    pub ns: Atom,
    pub parent: Atom,
    pub next: Atom,
    pub child: Atom,
    pub content: Atom,
}

/// Handle to a persistent XML tree inside a segment.
#[derive(Debug, Clone)]
pub struct Tree {
    info: Matom,
    nodes: FixedPool,
    strings: IstrTable,
}

/// In-memory insertion state: the stack of open nodes with their moving
/// last-child pointers.
#[derive(Debug)]
pub struct InsertPoint {
    stack: Vec<Frame>,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    node: Atom,
    last_child: Atom,
}

impl InsertPoint {
    /// Atom of the innermost open node.
    #[must_use]
    pub fn top(&self) -> Atom {
        self.stack.last().map_or(Atom::NULL, |f| f.node)
    }

    /// Number of open nodes above the root.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len() - 1
    }
}

impl Tree {
    /// Open or create the tree named `name` (sub-pools `<name>.info`,
    /// `<name>.nodes`, `<name>.strings`).
    pub fn open(seg: &mut Segment, name: &str) -> Result<Self> {
        let info = seg.header(&format!("{name}.info"), PoolType::Tree, INFO_BYTES)?;
        let nodes = FixedPool::open(seg, &format!("{name}.nodes"), 8, NODE_BYTES, 1 << 24, 0)?;
        let strings = IstrTable::open(seg, &format!("{name}.strings"))?;
        let tree = Tree {
            info,
            nodes,
            strings,
        };
        if tree.root(seg).is_null() {
            let root = tree.node_alloc(seg, XmlType::None, Atom::NULL, Atom::NULL, Atom::NULL)?;
            if root.is_null() {
                return Err(ParrotError::Full {
                    name: name.to_owned(),
                });
            }
            let off = seg.matom_offset(info) + TI_ROOT;
            seg.write_u32(off, root.value());
        }
        Ok(tree)
    }

    /// The tree's string table (shared by names and content).
    #[must_use]
    pub fn strings(&self) -> &IstrTable {
        &self.strings
    }

    /// Intern a string in the tree's table.
    pub fn intern(&self, seg: &mut Segment, bytes: &[u8]) -> Result<Atom> {
        self.strings.intern(seg, bytes)
    }

    /// Atom of the tree's root node.
    #[must_use]
    pub fn root(&self, seg: &Segment) -> Atom {
        Atom::new(seg.read_u32(seg.matom_offset(self.info) + TI_ROOT))
    }

    /// Decode a node, or `None` for null and out-of-range atoms.
    #[must_use]
    pub fn node(&self, seg: &Segment, atom: Atom) -> Option<NodeView> {
        let off = self.nodes.offset_of(seg, atom)?;
        Some(NodeView {
            ttype: XmlType::from_u8(seg.read_u8(off + NT_TYPE)),
            depth: seg.read_u8(off + NT_DEPTH),
            name: Atom::new(seg.read_u32(off + NT_NAME)),
            ns: Atom::new(seg.read_u32(off + NT_NS)),
            parent: Atom::new(seg.read_u32(off + NT_PARENT)),
            next: Atom::new(seg.read_u32(off + NT_NEXT)),
            child: Atom::new(seg.read_u32(off + NT_CHILD)),
            content: Atom::new(seg.read_u32(off + NT_CONTENT)),
        })
    }

    /// Allocate a detached node.  Returns the null atom when the node
    /// pool is exhausted.
    pub fn node_alloc(
        &self,
        seg: &mut Segment,
        ttype: XmlType,
        name: Atom,
        ns: Atom,
        content: Atom,
    ) -> Result<Atom> {
        let atom = self.nodes.alloc(seg)?;
        if atom.is_null() {
            return Ok(Atom::NULL);
        }
        let off = self
            .nodes
            .offset_of(seg, atom)
            .expect("freshly allocated node must resolve");
        seg.bytes_mut(off, NODE_BYTES as usize).fill(0);
        seg.write_u8(off + NT_TYPE, ttype as u8);
        seg.write_u32(off + NT_NAME, name.value());
        seg.write_u32(off + NT_NS, ns.value());
        seg.write_u32(off + NT_CONTENT, content.value());
        Ok(atom)
    }

    /// Start inserting at the root.
    #[must_use]
    pub fn insert_point(&self, seg: &Segment) -> InsertPoint {
        InsertPoint {
            stack: vec![Frame {
                node: self.root(seg),
                last_child: Atom::NULL,
            }],
        }
    }

    /// Link `atom` as the last child of the insertion point's top node.
    pub fn append(&self, seg: &mut Segment, insert: &mut InsertPoint, atom: Atom) {
        let frame = *insert.stack.last().expect("insert stack never empty");
        let parent_off = self
            .nodes
            .offset_of(seg, frame.node)
            .expect("open node must resolve");
        let depth = seg.read_u8(parent_off + NT_DEPTH).saturating_add(1);

        let off = self
            .nodes
            .offset_of(seg, atom)
            .expect("appending a node that was never allocated");
        seg.write_u32(off + NT_PARENT, frame.node.value());
        seg.write_u8(off + NT_DEPTH, depth);

        if frame.last_child.is_null() {
            seg.write_u32(parent_off + NT_CHILD, atom.value());
        } else {
            let prev_off = self
                .nodes
                .offset_of(seg, frame.last_child)
                .expect("sibling must resolve");
            seg.write_u32(prev_off + NT_NEXT, atom.value());
        }
        insert.stack.last_mut().expect("insert stack never empty").last_child = atom;
    }

    /// Make `atom` the new insertion point (after appending it).
    pub fn push(&self, insert: &mut InsertPoint, atom: Atom) {
        insert.stack.push(Frame {
            node: atom,
            last_child: Atom::NULL,
        });
    }

    /// Close the innermost open node, returning its atom.
    pub fn pop(&self, insert: &mut InsertPoint) -> Result<Atom> {
        if insert.stack.len() <= 1 {
            return Err(ParrotError::Unbalanced);
        }
        Ok(insert.stack.pop().expect("stack checked above").node)
    }

    /// Overwrite a node's content atom (the save-simple path).
    pub fn set_content(&self, seg: &mut Segment, atom: Atom, content: Atom) {
        let off = self
            .nodes
            .offset_of(seg, atom)
            .expect("setting content on a node that was never allocated");
        seg.write_u32(off + NT_CONTENT, content.value());
    }

    /// Value atom of the attribute `name_atom` on `elem`, if present.
    #[must_use]
    pub fn get_attrib(&self, seg: &Segment, elem: Atom, name_atom: Atom) -> Option<Atom> {
        let mut child = self.node(seg, elem)?.child;
        while !child.is_null() {
            let n = self.node(seg, child)?;
            if n.ttype == XmlType::Attr && n.name == name_atom {
                return Some(n.content);
            }
            child = n.next;
        }
        None
    }

    /// Attribute value bytes, dereferenced from the string table.
    #[must_use]
    pub fn attrib_bytes<'s>(&self, seg: &'s Segment, elem: Atom, name_atom: Atom) -> Option<&'s [u8]> {
        let content = self.get_attrib(seg, elem, name_atom)?;
        self.strings.deref(seg, content)
    }

    /// Document-order events over the whole tree: Open/Close pairs for
    /// open elements, single events for everything else.  The root node
    /// itself is not emitted.
    #[must_use]
    pub fn walk_events(&self, seg: &Segment) -> Vec<(XmlType, Atom)> {
        let mut events = Vec::new();
        let root = self.root(seg);
        let Some(rn) = self.node(seg, root) else {
            return events;
        };
        let mut open: Vec<Atom> = Vec::new();
        let mut cur = rn.child;
        loop {
            if cur.is_null() {
                match open.pop() {
                    Some(elem) => {
                        events.push((XmlType::Close, elem));
                        cur = self.node(seg, elem).map_or(Atom::NULL, |n| n.next);
                        continue;
                    }
                    None => break,
                }
            }
            let Some(n) = self.node(seg, cur) else {
                warn!(node = %cur, "dangling tree link");
                break;
            };
            if n.ttype == XmlType::Open {
                events.push((XmlType::Open, cur));
                open.push(cur);
                cur = n.child;
            } else {
                events.push((n.ttype, cur));
                cur = n.next;
            }
        }
        events
    }

    /// Walk the tree in document order, handing each event to `visit`.
    /// An error return from the visitor stops the walk and propagates.
    pub fn emit<F>(&self, seg: &Segment, mut visit: F) -> Result<()>
    where
        F: FnMut(EmitEvent<'_>) -> Result<()>,
    {
        for (ttype, node) in self.walk_events(seg) {
            let name = self
                .node(seg, node)
                .and_then(|n| self.strings.deref(seg, n.name));
            visit(EmitEvent { ttype, node, name })?;
        }
        Ok(())
    }
}

/// One event of a document-order tree walk.
#[derive(Debug)]
pub struct EmitEvent<'s> {
    pub ttype: XmlType,
    pub node: Atom,
    pub name: Option<&'s [u8]>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        seg: Segment,
        tree: Tree,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let mut seg = Segment::open(dir.path().join("t.db")).unwrap();
        let tree = Tree::open(&mut seg, "xml").unwrap();
        Fixture {
            _dir: dir,
            seg,
            tree,
        }
    }

    impl Fixture {
        fn elem(&mut self, insert: &mut InsertPoint, name: &[u8]) -> Atom {
            let name = self.tree.intern(&mut self.seg, name).unwrap();
            let node = self
                .tree
                .node_alloc(&mut self.seg, XmlType::Open, name, Atom::NULL, Atom::NULL)
                .unwrap();
            self.tree.append(&mut self.seg, insert, node);
            self.tree.push(insert, node);
            node
        }

        fn text(&mut self, insert: &mut InsertPoint, s: &[u8]) -> Atom {
            let content = self.tree.intern(&mut self.seg, s).unwrap();
            let node = self
                .tree
                .node_alloc(&mut self.seg, XmlType::Text, Atom::NULL, Atom::NULL, content)
                .unwrap();
            self.tree.append(&mut self.seg, insert, node);
            node
        }
    }

    #[test]
    fn build_and_walk_in_document_order() {
        let mut f = fixture();
        let mut insert = f.tree.insert_point(&f.seg);
        let doc = f.elem(&mut insert, b"doc");
        let p = f.elem(&mut insert, b"p");
        f.text(&mut insert, b"hi");
        f.tree.pop(&mut insert).unwrap();
        f.tree.pop(&mut insert).unwrap();

        let events = f.tree.walk_events(&f.seg);
        let shape: Vec<(XmlType, Atom)> = events;
        assert_eq!(shape.len(), 5);
        assert_eq!(shape[0], (XmlType::Open, doc));
        assert_eq!(shape[1], (XmlType::Open, p));
        assert_eq!(shape[2].0, XmlType::Text);
        assert_eq!(shape[3], (XmlType::Close, p));
        assert_eq!(shape[4], (XmlType::Close, doc));
    }

    #[test]
    fn nodes_record_parent_and_depth() {
        let mut f = fixture();
        let mut insert = f.tree.insert_point(&f.seg);
        let doc = f.elem(&mut insert, b"doc");
        let p = f.elem(&mut insert, b"p");
        let n = f.tree.node(&f.seg, p).unwrap();
        assert_eq!(n.parent, doc);
        assert_eq!(n.depth, 2);
        let d = f.tree.node(&f.seg, doc).unwrap();
        assert_eq!(d.depth, 1);
        assert_eq!(d.child, p);
    }

    #[test]
    fn siblings_link_in_insertion_order() {
        let mut f = fixture();
        let mut insert = f.tree.insert_point(&f.seg);
        f.elem(&mut insert, b"doc");
        let a = f.text(&mut insert, b"one");
        let b = f.text(&mut insert, b"two");
        let c = f.text(&mut insert, b"three");
        assert_eq!(f.tree.node(&f.seg, a).unwrap().next, b);
        assert_eq!(f.tree.node(&f.seg, b).unwrap().next, c);
        assert!(f.tree.node(&f.seg, c).unwrap().next.is_null());
    }

    #[test]
    fn attributes_resolve_by_name() {
        let mut f = fixture();
        let mut insert = f.tree.insert_point(&f.seg);
        let elem = f.elem(&mut insert, b"state");
        let id_name = f.tree.intern(&mut f.seg, b"id").unwrap();
        let id_val = f.tree.intern(&mut f.seg, b"17").unwrap();
        let attr = f
            .tree
            .node_alloc(&mut f.seg, XmlType::Attr, id_name, Atom::NULL, id_val)
            .unwrap();
        f.tree.append(&mut f.seg, &mut insert, attr);

        assert_eq!(f.tree.get_attrib(&f.seg, elem, id_name), Some(id_val));
        assert_eq!(f.tree.attrib_bytes(&f.seg, elem, id_name), Some(&b"17"[..]));
        let other = f.tree.intern(&mut f.seg, b"missing").unwrap();
        assert_eq!(f.tree.get_attrib(&f.seg, elem, other), None);
    }

    #[test]
    fn pop_below_root_is_unbalanced() {
        let f = fixture();
        let mut insert = f.tree.insert_point(&f.seg);
        assert!(matches!(
            f.tree.pop(&mut insert),
            Err(ParrotError::Unbalanced)
        ));
    }

    #[test]
    fn tree_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let doc;
        {
            let mut seg = Segment::open(&path).unwrap();
            let tree = Tree::open(&mut seg, "xml").unwrap();
            let mut insert = tree.insert_point(&seg);
            let name = tree.intern(&mut seg, b"doc").unwrap();
            doc = tree
                .node_alloc(&mut seg, XmlType::Open, name, Atom::NULL, Atom::NULL)
                .unwrap();
            tree.append(&mut seg, &mut insert, doc);
            seg.close().unwrap();
        }
        let mut seg = Segment::open(&path).unwrap();
        let tree = Tree::open(&mut seg, "xml").unwrap();
        let n = tree.node(&seg, doc).unwrap();
        assert_eq!(tree.strings().deref(&seg, n.name), Some(&b"doc"[..]));
        assert_eq!(tree.walk_events(&seg).len(), 2);
    }
}
