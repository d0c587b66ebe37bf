//! The rulebook: a compiled token-to-action state machine.
//!
//! A rule script is itself an XML document, previously parsed into a
//! persistent tree by this same engine.  One pass over that tree builds
//! the rulebook: a state table indexed by externally assigned 16-bit ids,
//! a pool of rules chained per state, and a bitmap per rule holding the
//! name atoms it matches.  At run time lookup scans a state's rule list
//! in order; the first rule whose tag bitmap contains the token's name
//! atom wins, else the state's default action applies.

use tracing::{debug, warn};

use parrotdb_error::{ParrotError, Result};
use parrotdb_istr::IstrTable;
use parrotdb_store::{BitmapPool, FixedPool, Segment, fixed::PFF_INIT_ZERO};
use parrotdb_types::{Atom, Matom, PoolType};

use crate::tree::Tree;
use crate::XmlType;

/// Script-shape limit on nesting inside a rule script.
pub const RULE_SCRIPT_MAX_DEPTH: usize = 4;

const INFO_BYTES: u32 = 8;
const RI_MAX_STATE: usize = 0;

const RULE_BYTES: u32 = 24;
const R_NEXT: usize = 0; // first word doubles as the free-list link
const R_FLAGS: usize = 4;
const R_ACTION: usize = 8;
const R_USE_TAG: usize = 12;
const R_NEW_STATE: usize = 16;
const R_BITMAP: usize = 20;

const STATE_BYTES: u32 = 12;
const S_FLAGS: usize = 0;
const S_ACTION: usize = 4;
const S_FIRST_RULE: usize = 8;

const MAX_RULES: u32 = 1 << 20;
const MAX_STATES: u32 = 1 << 16;

/// What to do with a matched token.  Unknown action names compile to
/// `None` with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Action {
    /// Do nothing with the token.
    #[default]
    None = 0,
    /// Drop the token.
    Discard = 1,
    /// Save the token into the tree.
    Save = 2,
    /// Save text content inline as a string atom on the parent.
    SaveSimple = 3,
    /// Save the token and its attributes.
    SaveAttrib = 4,
    /// Hand the token to the caller-registered visitor.
    Emit = 5,
    /// Pop one state from the driver's state stack.
    Return = 6,
}

impl Action {
    /// Parse an action name from a rule script.
    #[must_use]
    pub fn from_name(name: &[u8]) -> Self {
        match name {
            b"none" => Action::None,
            b"discard" => Action::Discard,
            b"save" => Action::Save,
            b"save-simple" => Action::SaveSimple,
            b"save-with-attributes" => Action::SaveAttrib,
            b"emit" => Action::Emit,
            b"return" => Action::Return,
            _ => {
                warn!(action = %String::from_utf8_lossy(name), "unknown action");
                Action::None
            }
        }
    }

    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        match value {
            1 => Action::Discard,
            2 => Action::Save,
            3 => Action::SaveSimple,
            4 => Action::SaveAttrib,
            5 => Action::Emit,
            6 => Action::Return,
            _ => Action::None,
        }
    }
}

/// Decoded copy of one state record.
#[derive(Debug, Clone, Copy)]
pub struct StateView {
    pub flags: u32,
    pub action: Action,
    pub first_rule: Atom,
}

/// Decoded copy of one rule record.
#[derive(Debug, Clone, Copy)]
pub struct RuleView {
    pub atom: Atom,
    pub flags: u32,
    pub action: Action,
    pub use_tag: Atom,
    pub new_state: u16,
    pub bitmap: Atom,
    pub next: Atom,
}

/// Handle to a compiled rulebook inside a segment.
///
/// Tag bitmaps are keyed by name atoms in the rule script's string
/// table, so the rulebook keeps a reference to it; a rulebook reopened
/// without its script must have one re-attached before it can resolve
/// tag names.
#[derive(Debug, Clone)]
pub struct Rulebook {
    info: Matom,
    rules: FixedPool,
    states: FixedPool,
    bitmaps: BitmapPool,
    script: Option<IstrTable>,
}

/// The moving tail of the rule list under construction for one state.
#[derive(Debug, Clone, Copy)]
enum Tail {
    None,
    StateFirst(u16),
    Rule(Atom),
}

impl Rulebook {
    /// Open or create the rulebook's pools under `name`.
    pub fn setup(seg: &mut Segment, name: &str) -> Result<Self> {
        let info = seg.header(&format!("{name}.info"), PoolType::Opaque, INFO_BYTES)?;
        let rules = FixedPool::open(seg, &format!("{name}.set"), 8, RULE_BYTES, MAX_RULES, 0)?;
        let states = FixedPool::open(
            seg,
            &format!("{name}.states"),
            8,
            STATE_BYTES,
            MAX_STATES,
            PFF_INIT_ZERO,
        )?;
        let bitmaps = BitmapPool::open(seg, &format!("{name}.bitmaps"))?;
        Ok(Rulebook {
            info,
            rules,
            states,
            bitmaps,
            script: None,
        })
    }

    /// Re-attach the rule script's string table after a reopen.
    pub fn attach_script(&mut self, strings: IstrTable) {
        self.script = Some(strings);
    }

    /// The rule script's string table, if attached.
    #[must_use]
    pub fn script_strings(&self) -> Option<&IstrTable> {
        self.script.as_ref()
    }

    /// Resolve a tag name to the atom the rule bitmaps are keyed by;
    /// null when the name never appears in the script.
    #[must_use]
    pub fn tag_atom(&self, seg: &Segment, name: &[u8]) -> Atom {
        self.script
            .as_ref()
            .map_or(Atom::NULL, |s| s.find(seg, name))
    }

    /// Compile a parsed rule script into a rulebook.
    ///
    /// The script's grammar is `<script>` containing `<state id=N
    /// action=A>` elements, each containing `<rule tag=T action=A
    /// new-state=M use-tag=U/>` children.  Ids are decimal and 16-bit;
    /// out-of-range ids are rejected with a warning.
    pub fn prep(seg: &mut Segment, script: &Tree, name: &str) -> Result<Self> {
        let mut book = Rulebook::setup(seg, name)?;
        book.script = Some(script.strings().clone());

        // Name atoms for the elements and attributes the pass cares
        // about, interned once up front.
        let atom_action = script.intern(seg, b"action")?;
        let atom_id = script.intern(seg, b"id")?;
        let atom_new_state = script.intern(seg, b"new-state")?;
        let atom_rule = script.intern(seg, b"rule")?;
        let atom_script = script.intern(seg, b"script")?;
        let atom_state = script.intern(seg, b"state")?;
        let atom_tag = script.intern(seg, b"tag")?;
        let atom_use_tag = script.intern(seg, b"use-tag")?;

        let mut stack: Vec<Tail> = Vec::new();
        for (ttype, node) in script.walk_events(seg) {
            match ttype {
                XmlType::Open | XmlType::Empty => {
                    let Some(n) = script.node(seg, node) else {
                        continue;
                    };
                    let mut tail = Tail::None;
                    if n.name == atom_script {
                        // Nothing to record for the wrapper element.
                    } else if n.name == atom_state {
                        tail = book.prep_state(seg, script, node, atom_id, atom_action)?;
                    } else if n.name == atom_rule {
                        book.prep_rule(
                            seg,
                            script,
                            node,
                            stack.last_mut(),
                            atom_tag,
                            atom_action,
                            atom_new_state,
                            atom_use_tag,
                        )?;
                    } else {
                        warn!(node = %node, "unknown element in rule script");
                    }
                    if ttype == XmlType::Open {
                        if stack.len() >= RULE_SCRIPT_MAX_DEPTH {
                            return Err(ParrotError::internal(format!(
                                "rule script nests deeper than {RULE_SCRIPT_MAX_DEPTH}"
                            )));
                        }
                        stack.push(tail);
                    }
                }
                XmlType::Close => {
                    stack.pop();
                }
                _ => {}
            }
        }
        Ok(book)
    }

    fn prep_state(
        &self,
        seg: &mut Segment,
        script: &Tree,
        node: Atom,
        atom_id: Atom,
        atom_action: Atom,
    ) -> Result<Tail> {
        let id = script.attrib_bytes(seg, node, atom_id).map(<[u8]>::to_vec);
        let action = script
            .attrib_bytes(seg, node, atom_action)
            .map(<[u8]>::to_vec);
        let Some(sid) = id.as_deref().and_then(parse_state_id) else {
            warn!("state id missing or out of range");
            return Ok(Tail::None);
        };

        let off = self.states.element_offset(seg, Atom::new(u32::from(sid)))?;
        seg.bytes_mut(off, STATE_BYTES as usize).fill(0);
        let act = action.as_deref().map_or(Action::None, Action::from_name);
        seg.write_u32(off + S_ACTION, act as u32);

        let info_off = seg.matom_offset(self.info) + RI_MAX_STATE;
        if u32::from(sid) > seg.read_u32(info_off) {
            seg.write_u32(info_off, u32::from(sid));
        }
        Ok(Tail::StateFirst(sid))
    }

    #[allow(clippy::too_many_arguments)]
    fn prep_rule(
        &self,
        seg: &mut Segment,
        script: &Tree,
        node: Atom,
        tail: Option<&mut Tail>,
        atom_tag: Atom,
        atom_action: Atom,
        atom_new_state: Atom,
        atom_use_tag: Atom,
    ) -> Result<()> {
        let Some(tail) = tail else {
            warn!("rule outside of a state");
            return Ok(());
        };
        if matches!(tail, Tail::None) {
            warn!("rule outside of a state");
            return Ok(());
        }

        let tag = script
            .attrib_bytes(seg, node, atom_tag)
            .map(<[u8]>::to_vec);
        let action = script
            .attrib_bytes(seg, node, atom_action)
            .map(<[u8]>::to_vec);
        let new_state = script
            .attrib_bytes(seg, node, atom_new_state)
            .map(<[u8]>::to_vec);
        let use_tag = script
            .attrib_bytes(seg, node, atom_use_tag)
            .map(<[u8]>::to_vec);

        let rid = self.rules.alloc(seg)?;
        if rid.is_null() {
            warn!("rule pool out of atoms");
            return Ok(());
        }
        let off = self
            .rules
            .offset_of(seg, rid)
            .expect("freshly allocated rule must resolve");
        seg.bytes_mut(off, RULE_BYTES as usize).fill(0);

        if let Some(tag) = tag {
            let tag_atom = script.intern(seg, &tag)?;
            if !tag_atom.is_null() {
                let map = self.bitmaps.alloc(seg)?;
                if !map.is_null() {
                    self.bitmaps.set(seg, map, tag_atom.value())?;
                    let off = self
                        .rules
                        .offset_of(seg, rid)
                        .expect("rule record is live");
                    seg.write_u32(off + R_BITMAP, map.value());
                }
            }
        }
        if let Some(action) = action {
            let off = self.rules.offset_of(seg, rid).expect("rule record is live");
            seg.write_u32(off + R_ACTION, Action::from_name(&action) as u32);
        }
        if let Some(use_tag) = use_tag {
            let atom = script.intern(seg, &use_tag)?;
            let off = self.rules.offset_of(seg, rid).expect("rule record is live");
            seg.write_u32(off + R_USE_TAG, atom.value());
        }
        if let Some(new_state) = new_state {
            match parse_state_id(&new_state) {
                Some(sid) => {
                    let off = self.rules.offset_of(seg, rid).expect("rule record is live");
                    seg.write_u32(off + R_NEW_STATE, u32::from(sid));
                }
                None => warn!("new-state out of range"),
            }
        }

        // Append to the state's rule list through the moving tail.
        match *tail {
            Tail::StateFirst(sid) => {
                let soff = self.states.element_offset(seg, Atom::new(u32::from(sid)))?;
                seg.write_u32(soff + S_FIRST_RULE, rid.value());
            }
            Tail::Rule(prev) => {
                let poff = self
                    .rules
                    .offset_of(seg, prev)
                    .expect("previous rule is live");
                seg.write_u32(poff + R_NEXT, rid.value());
            }
            Tail::None => unreachable!("checked above"),
        }
        *tail = Tail::Rule(rid);
        Ok(())
    }

    /// Decode a state record; unmapped state pages read as `None`.
    #[must_use]
    pub fn state(&self, seg: &Segment, sid: u16) -> Option<StateView> {
        let off = self.states.offset_of(seg, Atom::new(u32::from(sid)))?;
        Some(StateView {
            flags: seg.read_u32(off + S_FLAGS),
            action: Action::from_u32(seg.read_u32(off + S_ACTION)),
            first_rule: Atom::new(seg.read_u32(off + S_FIRST_RULE)),
        })
    }

    /// Decode a rule record.
    #[must_use]
    pub fn rule(&self, seg: &Segment, atom: Atom) -> Option<RuleView> {
        let off = self.rules.offset_of(seg, atom)?;
        Some(RuleView {
            atom,
            flags: seg.read_u32(off + R_FLAGS),
            action: Action::from_u32(seg.read_u32(off + R_ACTION)),
            use_tag: Atom::new(seg.read_u32(off + R_USE_TAG)),
            new_state: seg.read_u32(off + R_NEW_STATE) as u16,
            bitmap: Atom::new(seg.read_u32(off + R_BITMAP)),
            next: Atom::new(seg.read_u32(off + R_NEXT)),
        })
    }

    /// Scan the state's rule list in order; the first rule whose tag
    /// bitmap has `tag` set wins.
    #[must_use]
    pub fn find(&self, seg: &Segment, sid: u16, tag: Atom) -> Option<RuleView> {
        let state = self.state(seg, sid)?;
        let mut rid = state.first_rule;
        while !rid.is_null() {
            let rule = self.rule(seg, rid)?;
            if !rule.bitmap.is_null() && self.bitmaps.test(seg, rule.bitmap, tag.value()) {
                return Some(rule);
            }
            rid = rule.next;
        }
        None
    }

    /// Highest state id seen during compilation.
    #[must_use]
    pub fn max_state(&self, seg: &Segment) -> u16 {
        seg.read_u32(seg.matom_offset(self.info) + RI_MAX_STATE) as u16
    }

    /// Trace the whole rulebook, states and rule chains.
    pub fn dump(&self, seg: &Segment) {
        debug!("dumping rulebook");
        for sid in 1..=self.max_state(seg) {
            let Some(state) = self.state(seg, sid) else {
                continue;
            };
            debug!(
                sid,
                flags = state.flags,
                action = ?state.action,
                "state"
            );
            let mut rid = state.first_rule;
            while !rid.is_null() {
                let Some(rule) = self.rule(seg, rid) else {
                    break;
                };
                debug!(
                    rule = %rid,
                    flags = rule.flags,
                    action = ?rule.action,
                    use_tag = %rule.use_tag,
                    new_state = rule.new_state,
                    next = %rule.next,
                    "  rule"
                );
                rid = rule.next;
            }
        }
    }
}

/// Parse a decimal 16-bit state id; zero and overflow are rejected.
fn parse_state_id(bytes: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(bytes).ok()?.trim();
    let value: u32 = text.parse().ok()?;
    if value == 0 || value > u32::from(u16::MAX) {
        return None;
    }
    Some(value as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_document;
    use crate::source::Source;
    use tempfile::tempdir;

    fn compile(script: &str) -> (tempfile::TempDir, Segment, Tree, Rulebook) {
        let dir = tempdir().unwrap();
        let mut seg = Segment::open(dir.path().join("t.db")).unwrap();
        let source = Source::from_bytes(script.as_bytes().to_vec(), crate::source::SF_IGNOREWS);
        let tree = parse_document(&mut seg, "script", source).unwrap();
        let book = Rulebook::prep(&mut seg, &tree, "rb").unwrap();
        (dir, seg, tree, book)
    }

    #[test]
    fn action_names_form_a_closed_set() {
        assert_eq!(Action::from_name(b"none"), Action::None);
        assert_eq!(Action::from_name(b"discard"), Action::Discard);
        assert_eq!(Action::from_name(b"save"), Action::Save);
        assert_eq!(Action::from_name(b"save-simple"), Action::SaveSimple);
        assert_eq!(
            Action::from_name(b"save-with-attributes"),
            Action::SaveAttrib
        );
        assert_eq!(Action::from_name(b"emit"), Action::Emit);
        assert_eq!(Action::from_name(b"return"), Action::Return);
        // Unknown names compile to none.
        assert_eq!(Action::from_name(b"explode"), Action::None);
    }

    #[test]
    fn compile_states_and_rules() {
        let (_dir, seg, tree, book) = compile(
            r#"<script>
                 <state id="1" action="discard">
                   <rule tag="doc" action="save" new-state="2"/>
                   <rule tag="skip" action="discard"/>
                 </state>
                 <state id="2" action="save"/>
               </script>"#,
        );
        assert_eq!(book.max_state(&seg), 2);
        let s1 = book.state(&seg, 1).unwrap();
        assert_eq!(s1.action, Action::Discard);
        assert!(!s1.first_rule.is_null());
        let s2 = book.state(&seg, 2).unwrap();
        assert_eq!(s2.action, Action::Save);
        assert!(s2.first_rule.is_null());

        // The rule list preserves script order.
        let r1 = book.rule(&seg, s1.first_rule).unwrap();
        assert_eq!(r1.action, Action::Save);
        assert_eq!(r1.new_state, 2);
        let r2 = book.rule(&seg, r1.next).unwrap();
        assert_eq!(r2.action, Action::Discard);
        assert!(r2.next.is_null());

        // Lookup matches through the tag bitmaps.
        let doc = tree.strings().find(&seg, b"doc");
        let skip = tree.strings().find(&seg, b"skip");
        let other = tree.strings().find(&seg, b"p");
        assert_eq!(book.find(&seg, 1, doc).unwrap().atom, r1.atom);
        assert_eq!(book.find(&seg, 1, skip).unwrap().atom, r2.atom);
        assert!(book.find(&seg, 1, other).is_none());
        assert!(book.find(&seg, 2, doc).is_none());
    }

    #[test]
    fn use_tag_is_interned() {
        let (_dir, seg, tree, book) = compile(
            r#"<script>
                 <state id="1" action="discard">
                   <rule tag="old" action="save" use-tag="new"/>
                 </state>
               </script>"#,
        );
        let old = tree.strings().find(&seg, b"old");
        let rule = book.find(&seg, 1, old).unwrap();
        assert_eq!(
            tree.strings().deref(&seg, rule.use_tag),
            Some(&b"new"[..])
        );
    }

    #[test]
    fn out_of_range_ids_are_rejected() {
        let (_dir, seg, _tree, book) = compile(
            r#"<script>
                 <state id="0" action="save"/>
                 <state id="70000" action="save"/>
                 <state id="3" action="save"/>
               </script>"#,
        );
        assert_eq!(book.max_state(&seg), 3);
        assert!(book.state(&seg, 3).is_some());
    }

    #[test]
    fn unknown_action_compiles_to_none() {
        let (_dir, seg, tree, book) = compile(
            r#"<script>
                 <state id="1" action="discard">
                   <rule tag="t" action="frobnicate"/>
                 </state>
               </script>"#,
        );
        let t = tree.strings().find(&seg, b"t");
        assert_eq!(book.find(&seg, 1, t).unwrap().action, Action::None);
    }

    #[test]
    fn rulebook_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let doc_atom;
        {
            let mut seg = Segment::open(&path).unwrap();
            let source = Source::from_bytes(
                br#"<script><state id="1" action="discard"><rule tag="doc" action="save"/></state></script>"#.to_vec(),
                0,
            );
            let tree = parse_document(&mut seg, "script", source).unwrap();
            Rulebook::prep(&mut seg, &tree, "rb").unwrap();
            doc_atom = tree.strings().find(&seg, b"doc");
            seg.close().unwrap();
        }
        let mut seg = Segment::open(&path).unwrap();
        let script = Tree::open(&mut seg, "script").unwrap();
        let mut book = Rulebook::setup(&mut seg, "rb").unwrap();
        book.attach_script(script.strings().clone());
        assert_eq!(book.tag_atom(&seg, b"doc"), doc_atom);
        let rule = book.find(&seg, 1, doc_atom).unwrap();
        assert_eq!(rule.action, Action::Save);
    }
}
