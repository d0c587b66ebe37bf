//! The parse driver: pulls tokens, consults the rulebook, and executes
//! actions against the persistent tree.
//!
//! Without a rulebook every token is saved with its attributes, which is
//! how rule scripts themselves get parsed.  With a rulebook, each token
//! is matched against the current state's rule list; a rule's `new-state`
//! on an open tag pushes a state that pops again when the matching close
//! tag arrives, and the `return` action pops explicitly.  The drive runs
//! to EOF or FAIL, and the state stack must be back at its initial entry
//! at EOF.

use tracing::warn;

use parrotdb_error::{ParrotError, Result};
use parrotdb_store::Segment;
use parrotdb_types::Atom;

use crate::rules::{Action, Rulebook};
use crate::source::Source;
use crate::tree::{InsertPoint, Tree};
use crate::XmlType;

/// Reserved tag name matched by rules against text tokens.
pub const TEXT_TAG: &[u8] = b"#text";
/// Reserved tag name for comment tokens.
pub const COMMENT_TAG: &[u8] = b"#comment";
/// Reserved tag name for processing-instruction tokens.
pub const PI_TAG: &[u8] = b"#pi";
/// Reserved tag name for document-type tokens.
pub const DTD_TAG: &[u8] = b"#dtd";

/// A borrowed view of the current token, handed to emit visitors.
#[derive(Debug)]
pub struct TokenView<'a> {
    pub ttype: XmlType,
    pub data: Option<&'a [u8]>,
    pub rest: Option<&'a [u8]>,
}

/// Drives one source into one tree under an optional rulebook.
pub struct Parser {
    tree: Tree,
    source: Source,
    rulebook: Option<Rulebook>,
    initial_state: u16,
}

impl Parser {
    /// A driver with no rulebook: every token is saved with attributes.
    #[must_use]
    pub fn new(tree: Tree, source: Source) -> Self {
        Parser {
            tree,
            source,
            rulebook: None,
            initial_state: 1,
        }
    }

    /// A driver consulting `rulebook`, starting in `initial_state`.
    #[must_use]
    pub fn with_rulebook(
        tree: Tree,
        source: Source,
        rulebook: Rulebook,
        initial_state: u16,
    ) -> Self {
        Parser {
            tree,
            source,
            rulebook: Some(rulebook),
            initial_state,
        }
    }

    /// Run to EOF or FAIL with no emit visitor.
    pub fn run(&mut self, seg: &mut Segment) -> Result<()> {
        self.run_with(seg, |_, _| Ok(()))
    }

    /// Run to EOF or FAIL, handing emitted tokens to `visitor`.  An error
    /// return from the visitor aborts the drive.
    pub fn run_with<F>(&mut self, seg: &mut Segment, mut visitor: F) -> Result<()>
    where
        F: FnMut(&Segment, TokenView<'_>) -> Result<()>,
    {
        let Parser {
            tree,
            source,
            rulebook,
            initial_state,
        } = self;

        let mut insert = tree.insert_point(seg);
        // (element depth at push, state id); entry 0 is the initial state
        // and never pops.
        let mut stack: Vec<(u32, u16)> = vec![(0, *initial_state)];
        let mut depth: u32 = 0;

        // Match atoms live in the rule script's string table, not the
        // output tree's.
        let text_match = rulebook
            .as_ref()
            .map_or(Atom::NULL, |b| b.tag_atom(seg, TEXT_TAG));
        let comment_match = rulebook
            .as_ref()
            .map_or(Atom::NULL, |b| b.tag_atom(seg, COMMENT_TAG));
        let pi_match = rulebook
            .as_ref()
            .map_or(Atom::NULL, |b| b.tag_atom(seg, PI_TAG));
        let dtd_match = rulebook
            .as_ref()
            .map_or(Atom::NULL, |b| b.tag_atom(seg, DTD_TAG));

        loop {
            let token = source.next_token();
            let ttype = token.ttype;
            match ttype {
                XmlType::Eof => break,
                XmlType::Fail => {
                    return Err(ParrotError::ParseFail {
                        lineno: source.lineno(),
                    });
                }
                _ => {}
            }
            let data = token.data;
            let rest = token.rest;

            let (action, new_state, use_tag) = match rulebook {
                Some(book) => {
                    let tag = match ttype {
                        XmlType::Open | XmlType::Close | XmlType::Empty => {
                            book.tag_atom(seg, data.unwrap_or(b""))
                        }
                        XmlType::Text => text_match,
                        XmlType::Comment => comment_match,
                        XmlType::Pi => pi_match,
                        XmlType::Dtd => dtd_match,
                        _ => Atom::NULL,
                    };
                    let sid = stack.last().expect("state stack never empty").1;
                    match book.find(seg, sid, tag) {
                        Some(rule) => (rule.action, rule.new_state, rule.use_tag),
                        None => {
                            let action = book
                                .state(seg, sid)
                                .map_or(Action::Discard, |s| s.action);
                            (action, 0, Atom::NULL)
                        }
                    }
                }
                None => (Action::SaveAttrib, 0, Atom::NULL),
            };

            match action {
                Action::None | Action::Discard => {}
                Action::Save | Action::SaveSimple | Action::SaveAttrib => {
                    // The saved name is interned in the output tree; a
                    // rule's use-tag (a script-table atom) is re-interned
                    // there too.
                    let name = match ttype {
                        XmlType::Open | XmlType::Close | XmlType::Empty => {
                            let renamed = rulebook
                                .as_ref()
                                .filter(|_| !use_tag.is_null())
                                .and_then(|b| b.script_strings())
                                .and_then(|s| s.deref(seg, use_tag))
                                .map(<[u8]>::to_vec);
                            match renamed {
                                Some(bytes) => tree.intern(seg, &bytes)?,
                                None => intern_checked(tree, seg, data.unwrap_or(b""))?,
                            }
                        }
                        _ => Atom::NULL,
                    };
                    save_token(tree, seg, &mut insert, ttype, name, data, rest, action)?;
                }
                Action::Emit => {
                    let view = TokenView { ttype, data, rest };
                    if visitor(seg, view).is_err() {
                        return Err(ParrotError::Aborted);
                    }
                }
                Action::Return => {
                    if stack.len() <= 1 {
                        return Err(ParrotError::Unbalanced);
                    }
                    stack.pop();
                }
            }

            match ttype {
                XmlType::Open => {
                    depth += 1;
                    if new_state != 0 {
                        stack.push((depth, new_state));
                    }
                }
                XmlType::Close => {
                    if depth == 0 {
                        return Err(ParrotError::Unbalanced);
                    }
                    depth -= 1;
                    while stack.len() > 1
                        && stack.last().expect("state stack never empty").0 > depth
                    {
                        stack.pop();
                    }
                }
                _ => {}
            }
        }

        if depth != 0 || stack.len() != 1 {
            return Err(ParrotError::Unbalanced);
        }
        Ok(())
    }
}

/// Execute a save-family action for one token.  `name` is already
/// resolved into the output tree's string table.
#[allow(clippy::too_many_arguments)]
fn save_token(
    tree: &Tree,
    seg: &mut Segment,
    insert: &mut InsertPoint,
    ttype: XmlType,
    name: Atom,
    data: Option<&[u8]>,
    rest: Option<&[u8]>,
    action: Action,
) -> Result<()> {
    match ttype {
        XmlType::Open => {
            let node = tree.node_alloc(seg, XmlType::Open, name, Atom::NULL, Atom::NULL)?;
            if node.is_null() {
                warn!("node pool exhausted; dropping element");
                return Ok(());
            }
            tree.append(seg, insert, node);
            tree.push(insert, node);
            if action == Action::SaveAttrib {
                save_attributes(tree, seg, insert, rest.unwrap_or(b""))?;
            }
        }
        XmlType::Empty => {
            let node = tree.node_alloc(seg, XmlType::Empty, name, Atom::NULL, Atom::NULL)?;
            if node.is_null() {
                warn!("node pool exhausted; dropping element");
                return Ok(());
            }
            tree.append(seg, insert, node);
            if action == Action::SaveAttrib {
                tree.push(insert, node);
                save_attributes(tree, seg, insert, rest.unwrap_or(b""))?;
                tree.pop(insert)?;
            }
        }
        XmlType::Close => {
            let closed = tree.pop(insert)?;
            if let Some(view) = tree.node(seg, closed) {
                if view.name != name {
                    warn!(node = %closed, "close tag does not match open tag");
                }
            }
        }
        XmlType::Text => {
            let content = intern_checked(tree, seg, data.unwrap_or(b""))?;
            if action == Action::SaveSimple {
                // Inline: the text lands as a string atom on the parent.
                let parent = insert.top();
                tree.set_content(seg, parent, content);
            } else {
                let node = tree.node_alloc(seg, XmlType::Text, Atom::NULL, Atom::NULL, content)?;
                if !node.is_null() {
                    tree.append(seg, insert, node);
                }
            }
        }
        XmlType::Comment | XmlType::Dtd => {
            let content = intern_checked(tree, seg, data.unwrap_or(b""))?;
            let node = tree.node_alloc(seg, ttype, Atom::NULL, Atom::NULL, content)?;
            if !node.is_null() {
                tree.append(seg, insert, node);
            }
        }
        XmlType::Pi => {
            let target = intern_checked(tree, seg, data.unwrap_or(b""))?;
            let content = intern_checked(tree, seg, rest.unwrap_or(b""))?;
            let node = tree.node_alloc(seg, XmlType::Pi, target, Atom::NULL, content)?;
            if !node.is_null() {
                tree.append(seg, insert, node);
            }
        }
        _ => {}
    }
    Ok(())
}

/// Split an attribute substring into nodes under the insertion point.
/// `xmlns` attributes become namespace nodes.
fn save_attributes(
    tree: &Tree,
    seg: &mut Segment,
    insert: &mut InsertPoint,
    rest: &[u8],
) -> Result<()> {
    for (name, value) in parse_attributes(rest) {
        let is_ns = name == b"xmlns" || name.starts_with(b"xmlns:");
        let name_atom = intern_checked(tree, seg, name)?;
        let value_atom = intern_checked(tree, seg, value)?;
        let ttype = if is_ns { XmlType::Ns } else { XmlType::Attr };
        let node = tree.node_alloc(seg, ttype, name_atom, Atom::NULL, value_atom)?;
        if !node.is_null() {
            tree.append(seg, insert, node);
        }
    }
    Ok(())
}

/// Parse `name="value"` pairs out of an attribute substring.  Values may
/// be single- or double-quoted (or bare, leniently); a malformed tail is
/// dropped with a warning.
#[must_use]
pub fn parse_attributes(rest: &[u8]) -> Vec<(&[u8], &[u8])> {
    let mut out = Vec::new();
    let mut i = 0;
    let len = rest.len();
    loop {
        while i < len && rest[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= len {
            break;
        }
        let name_start = i;
        while i < len && rest[i] != b'=' && !rest[i].is_ascii_whitespace() {
            i += 1;
        }
        let name = &rest[name_start..i];
        while i < len && rest[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= len || rest[i] != b'=' || name.is_empty() {
            warn!("malformed attribute list");
            break;
        }
        i += 1;
        while i < len && rest[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= len {
            warn!("malformed attribute list");
            break;
        }
        let value = if rest[i] == b'"' || rest[i] == b'\'' {
            let quote = rest[i];
            i += 1;
            let value_start = i;
            while i < len && rest[i] != quote {
                i += 1;
            }
            if i >= len {
                warn!("unterminated attribute value");
                break;
            }
            let value = &rest[value_start..i];
            i += 1;
            value
        } else {
            let value_start = i;
            while i < len && !rest[i].is_ascii_whitespace() {
                i += 1;
            }
            &rest[value_start..i]
        };
        out.push((name, value));
    }
    out
}

fn intern_checked(tree: &Tree, seg: &mut Segment, bytes: &[u8]) -> Result<Atom> {
    if bytes.contains(&0) {
        warn!("NUL byte in token; not interned");
        return Ok(Atom::NULL);
    }
    tree.intern(seg, bytes)
}

/// Parse a whole document into a fresh tree named `name`, saving every
/// token with its attributes.
pub fn parse_document(seg: &mut Segment, name: &str, source: Source) -> Result<Tree> {
    let tree = Tree::open(seg, name)?;
    let mut parser = Parser::new(tree.clone(), source);
    parser.run(seg)?;
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Source, SF_IGNOREWS};
    use tempfile::tempdir;

    fn segment() -> (tempfile::TempDir, Segment) {
        let dir = tempdir().unwrap();
        let seg = Segment::open(dir.path().join("t.db")).unwrap();
        (dir, seg)
    }

    fn compile_rulebook(seg: &mut Segment, script: &str) -> Rulebook {
        let source = Source::from_bytes(script.as_bytes().to_vec(), SF_IGNOREWS);
        let tree = parse_document(seg, "script", source).unwrap();
        Rulebook::prep(seg, &tree, "rb").unwrap()
    }

    #[test]
    fn attribute_splitting() {
        let rest = br#"a="1" b='two' c=bare"#;
        let attrs = parse_attributes(rest);
        assert_eq!(
            attrs,
            vec![
                (&b"a"[..], &b"1"[..]),
                (&b"b"[..], &b"two"[..]),
                (&b"c"[..], &b"bare"[..]),
            ]
        );
        assert!(parse_attributes(b"").is_empty());
        assert!(parse_attributes(b"   ").is_empty());
    }

    #[test]
    fn document_parse_builds_the_full_tree() {
        let (_dir, mut seg) = segment();
        let source = Source::from_bytes(
            br#"<doc version="3"><p>hi</p><br/></doc>"#.to_vec(),
            0,
        );
        let tree = parse_document(&mut seg, "xml", source).unwrap();

        let events = tree.walk_events(&seg);
        let types: Vec<XmlType> = events.iter().map(|e| e.0).collect();
        assert_eq!(
            types,
            vec![
                XmlType::Open,   // doc
                XmlType::Attr,   // version
                XmlType::Open,   // p
                XmlType::Text,   // hi
                XmlType::Close,  // p
                XmlType::Empty,  // br
                XmlType::Close,  // doc
            ]
        );

        let doc = events[0].1;
        let version = tree.strings().find(&seg, b"version");
        assert_eq!(
            tree.attrib_bytes(&seg, doc, version),
            Some(&b"3"[..])
        );
    }

    #[test]
    fn rulebook_drive_matches_the_contract() {
        let (_dir, mut seg) = segment();
        let book = compile_rulebook(
            &mut seg,
            r#"<script>
                 <state id="1" action="discard">
                   <rule tag="doc" action="save" new-state="2"/>
                 </state>
                 <state id="2" action="save"/>
               </script>"#,
        );

        let tree = Tree::open(&mut seg, "out").unwrap();
        let source = Source::from_bytes(b"<junk/><doc><p>hi</p></doc><junk2/>".to_vec(), 0);
        let mut parser = Parser::with_rulebook(tree.clone(), source, book, 1);
        parser.run(&mut seg).unwrap();

        // junk and junk2 were discarded in state 1; doc/p/hi saved.
        let events = tree.walk_events(&seg);
        let names: Vec<Vec<u8>> = events
            .iter()
            .filter(|e| e.0 == XmlType::Open)
            .map(|e| {
                let n = tree.node(&seg, e.1).unwrap();
                tree.strings().deref(&seg, n.name).unwrap().to_vec()
            })
            .collect();
        assert_eq!(names, vec![b"doc".to_vec(), b"p".to_vec()]);

        let text: Vec<Vec<u8>> = events
            .iter()
            .filter(|e| e.0 == XmlType::Text)
            .map(|e| {
                let n = tree.node(&seg, e.1).unwrap();
                tree.strings().deref(&seg, n.content).unwrap().to_vec()
            })
            .collect();
        assert_eq!(text, vec![b"hi".to_vec()]);
    }

    #[test]
    fn use_tag_renames_on_save() {
        let (_dir, mut seg) = segment();
        let book = compile_rulebook(
            &mut seg,
            r#"<script>
                 <state id="1" action="discard">
                   <rule tag="old-name" action="save" use-tag="renamed"/>
                 </state>
               </script>"#,
        );
        let tree = Tree::open(&mut seg, "out").unwrap();
        let source = Source::from_bytes(b"<old-name></old-name>".to_vec(), 0);
        let mut parser = Parser::with_rulebook(tree.clone(), source, book, 1);
        parser.run(&mut seg).unwrap();

        let events = tree.walk_events(&seg);
        let n = tree.node(&seg, events[0].1).unwrap();
        assert_eq!(tree.strings().deref(&seg, n.name), Some(&b"renamed"[..]));
    }

    #[test]
    fn save_simple_inlines_text_on_the_parent() {
        let (_dir, mut seg) = segment();
        let book = compile_rulebook(
            &mut seg,
            r##"<script>
                 <state id="1" action="save">
                   <rule tag="#text" action="save-simple"/>
                 </state>
               </script>"##,
        );
        let tree = Tree::open(&mut seg, "out").unwrap();
        let source = Source::from_bytes(b"<host>router7</host>".to_vec(), 0);
        let mut parser = Parser::with_rulebook(tree.clone(), source, book, 1);
        parser.run(&mut seg).unwrap();

        let events = tree.walk_events(&seg);
        // No text node was created; the content atom sits on <host>.
        assert_eq!(events.len(), 2);
        let host = tree.node(&seg, events[0].1).unwrap();
        assert_eq!(
            tree.strings().deref(&seg, host.content),
            Some(&b"router7"[..])
        );
    }

    #[test]
    fn emit_hands_tokens_to_the_visitor() {
        let (_dir, mut seg) = segment();
        let book = compile_rulebook(
            &mut seg,
            r#"<script>
                 <state id="1" action="discard">
                   <rule tag="ping" action="emit"/>
                 </state>
               </script>"#,
        );
        let tree = Tree::open(&mut seg, "out").unwrap();
        let source = Source::from_bytes(b"<ping a=\"1\"></ping><other/>".to_vec(), 0);
        let mut parser = Parser::with_rulebook(tree, source, book, 1);
        let mut seen = Vec::new();
        parser
            .run_with(&mut seg, |_seg, tok| {
                seen.push((tok.ttype, tok.data.map(<[u8]>::to_vec)));
                Ok(())
            })
            .unwrap();
        // Both the open and close of <ping> match the rule.
        assert_eq!(
            seen,
            vec![
                (XmlType::Open, Some(b"ping".to_vec())),
                (XmlType::Close, Some(b"ping".to_vec())),
            ]
        );
    }

    #[test]
    fn visitor_error_aborts_the_drive() {
        let (_dir, mut seg) = segment();
        let book = compile_rulebook(
            &mut seg,
            r#"<script>
                 <state id="1" action="discard">
                   <rule tag="stop" action="emit"/>
                 </state>
               </script>"#,
        );
        let tree = Tree::open(&mut seg, "out").unwrap();
        let source = Source::from_bytes(b"<stop/><more/>".to_vec(), 0);
        let mut parser = Parser::with_rulebook(tree, source, book, 1);
        let err = parser
            .run_with(&mut seg, |_, _| Err(ParrotError::internal("stop")))
            .unwrap_err();
        assert!(matches!(err, ParrotError::Aborted));
    }

    #[test]
    fn unbalanced_input_is_reported() {
        let (_dir, mut seg) = segment();
        let tree = Tree::open(&mut seg, "out").unwrap();
        let source = Source::from_bytes(b"<a><b></b>".to_vec(), 0);
        let mut parser = Parser::new(tree, source);
        assert!(matches!(
            parser.run(&mut seg),
            Err(ParrotError::Unbalanced)
        ));

        let tree = Tree::open(&mut seg, "out2").unwrap();
        let source = Source::from_bytes(b"<a></a></x>".to_vec(), 0);
        let mut parser = Parser::new(tree, source);
        assert!(matches!(
            parser.run(&mut seg),
            Err(ParrotError::Unbalanced)
        ));
    }

    #[test]
    fn malformed_input_surfaces_parse_fail() {
        let (_dir, mut seg) = segment();
        let tree = Tree::open(&mut seg, "out").unwrap();
        let source = Source::from_bytes(b"<a><=bad".to_vec(), 0);
        let mut parser = Parser::new(tree, source);
        assert!(matches!(
            parser.run(&mut seg),
            Err(ParrotError::ParseFail { .. })
        ));
    }

    #[test]
    fn return_action_pops_the_state_stack() {
        let (_dir, mut seg) = segment();
        // Text in state 2 pops back to state 1, where everything is
        // discarded.
        let book = compile_rulebook(
            &mut seg,
            r##"<script>
                 <state id="1" action="discard">
                   <rule tag="keep" action="save" new-state="2"/>
                 </state>
                 <state id="2" action="save">
                   <rule tag="#text" action="return"/>
                 </state>
               </script>"##,
        );
        let tree = Tree::open(&mut seg, "out").unwrap();
        // After "pop" text returns to state 1, <inner/> is discarded, and
        // the close of <keep> is discarded too; the tree keeps only
        // <keep>.
        let source = Source::from_bytes(b"<keep>pop<inner/></keep>".to_vec(), 0);
        let mut parser = Parser::with_rulebook(tree.clone(), source, book, 1);
        parser.run(&mut seg).unwrap();
        let events = tree.walk_events(&seg);
        assert_eq!(events.len(), 2);
        let n = tree.node(&seg, events[0].1).unwrap();
        assert_eq!(tree.strings().deref(&seg, n.name), Some(&b"keep"[..]));
    }
}
