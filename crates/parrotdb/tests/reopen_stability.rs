//! Close/reopen stability: atom-to-bytes mappings and trie ordering must
//! be identical across an unmap/remap cycle.

use parrotdb::{Atom, IstrTable, Segment};
use tempfile::tempdir;

#[test]
fn interned_strings_and_ordering_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stable.db");

    let words: Vec<String> = (0..200).map(|i| format!("word-{i:03}")).collect();
    let mut atoms: Vec<Atom> = Vec::new();

    {
        let mut seg = Segment::open(&path).unwrap();
        let table = IstrTable::open(&mut seg, "strs").unwrap();
        for w in &words {
            atoms.push(table.intern(&mut seg, w.as_bytes()).unwrap());
        }
        seg.close().unwrap();
    }

    // First reopen: every mapping is intact and dedup still holds.
    {
        let mut seg = Segment::open(&path).unwrap();
        let table = IstrTable::open(&mut seg, "strs").unwrap();
        for (w, a) in words.iter().zip(&atoms) {
            assert_eq!(table.deref(&seg, *a), Some(w.as_bytes()));
            assert_eq!(table.intern(&mut seg, w.as_bytes()).unwrap(), *a);
        }
        // New strings keep working after the reopen.
        let fresh = table.intern(&mut seg, b"post-reopen").unwrap();
        assert!(!fresh.is_null());
        seg.close().unwrap();
    }

    // Second reopen: the addition persisted too.
    let mut seg = Segment::open(&path).unwrap();
    let table = IstrTable::open(&mut seg, "strs").unwrap();
    assert_eq!(table.find(&seg, b"post-reopen").value(), {
        table.intern(&mut seg, b"post-reopen").unwrap().value()
    });
}

#[test]
fn trees_survive_reopen() {
    use parrotdb::{parse_document, Source, XmlType};

    let dir = tempdir().unwrap();
    let path = dir.path().join("tree.db");

    {
        let mut seg = Segment::open(&path).unwrap();
        let source = Source::from_bytes(
            b"<config><host id=\"7\">alpha</host><host id=\"9\">beta</host></config>".to_vec(),
            0,
        );
        parse_document(&mut seg, "cfg", source).unwrap();
        seg.close().unwrap();
    }

    let mut seg = Segment::open(&path).unwrap();
    let tree = parrotdb::Tree::open(&mut seg, "cfg").unwrap();
    let events = tree.walk_events(&seg);
    let opens: Vec<Vec<u8>> = events
        .iter()
        .filter(|e| e.0 == XmlType::Open)
        .map(|e| {
            let n = tree.node(&seg, e.1).unwrap();
            tree.strings().deref(&seg, n.name).unwrap().to_vec()
        })
        .collect();
    assert_eq!(
        opens,
        vec![b"config".to_vec(), b"host".to_vec(), b"host".to_vec()]
    );

    let texts: Vec<Vec<u8>> = events
        .iter()
        .filter(|e| e.0 == XmlType::Text)
        .map(|e| {
            let n = tree.node(&seg, e.1).unwrap();
            tree.strings().deref(&seg, n.content).unwrap().to_vec()
        })
        .collect();
    assert_eq!(texts, vec![b"alpha".to_vec(), b"beta".to_vec()]);
}
