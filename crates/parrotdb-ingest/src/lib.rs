//! Streaming XML ingestion over the ParrotDB pools.
//!
//! Parsing input means three distinct areas of work: pulling tokens off
//! the input, deciding what to do with each one, and doing it.  The
//! [`Source`](source::Source) does the tokenizing, the
//! [`Rulebook`](rules::Rulebook) does the deciding, and the
//! [`Parser`](parse::Parser) drives both, saving tokens into a persistent
//! [`Tree`](tree::Tree).

pub mod parse;
pub mod rules;
pub mod source;
pub mod tree;

pub use parse::{parse_document, Parser, TokenView};
pub use rules::{Action, Rulebook};
pub use source::{Source, Token};
pub use tree::{InsertPoint, Tree};

/// Node and token type tags, shared by the tokenizer and the persistent
/// tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum XmlType {
    /// Unknown type.
    #[default]
    None = 0,
    /// End of input.
    Eof = 1,
    /// Failure mode; latched on the source.
    Fail = 2,
    /// Text content.
    Text = 3,
    /// Open tag.
    Open = 4,
    /// Close tag.
    Close = 5,
    /// Empty tag.
    Empty = 6,
    /// Processing instruction.
    Pi = 7,
    /// Document type declaration.
    Dtd = 8,
    /// Comment.
    Comment = 9,
    /// Attribute.
    Attr = 10,
    /// Namespace declaration.
    Ns = 11,
}

impl XmlType {
    /// Decode a stored node-type byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Eof,
            2 => Self::Fail,
            3 => Self::Text,
            4 => Self::Open,
            5 => Self::Close,
            6 => Self::Empty,
            7 => Self::Pi,
            8 => Self::Dtd,
            9 => Self::Comment,
            10 => Self::Attr,
            11 => Self::Ns,
            _ => Self::None,
        }
    }
}
