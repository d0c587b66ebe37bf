//! The single error type shared by every ParrotDB crate.
//!
//! Ordinary allocation failure is not an error: pools return null atoms and
//! the tokenizer returns FAIL tokens, with a diagnostic routed through
//! `tracing`.  This enum covers the conditions that do surface through
//! `Result`: I/O, shape mismatches on reopen, structural failures in the
//! trie, and driver termination states.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, ParrotError>;

#[derive(Debug, Error)]
pub enum ParrotError {
    /// An I/O failure while opening, growing, or flushing a segment or
    /// source.
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file exists but does not carry the segment magic.
    #[error("not a segment file: {path}")]
    BadMagic { path: PathBuf },

    /// The file carries the magic but was written by an incompatible
    /// version or a machine of different byte order or page size.
    #[error("incompatible segment file: {path}")]
    Incompatible { path: PathBuf },

    /// A named header exists but differs in type or declared size from the
    /// shape requested on reopen.
    #[error("header {name:?} exists with a different shape")]
    Shape { name: String },

    /// The segment's header directory has no free entries.
    #[error("segment header directory is full")]
    DirectoryFull,

    /// A pool cannot grow: `max_atoms` reached or the segment refused
    /// pages.
    #[error("pool {name:?} is out of atoms")]
    Full { name: String },

    /// Trie insert of a key equal to, or prefix-overlapping with, an
    /// existing key.
    #[error("duplicate or prefix-overlapping key")]
    Duplicate,

    /// Trie delete of a node that is not in the tree.
    #[error("no such node")]
    NotFound,

    /// The parse driver reached EOF with a non-initial state stack, or the
    /// document closed more elements than it opened.
    #[error("state stack not balanced at end of input")]
    Unbalanced,

    /// A caller-supplied visitor asked the driver to stop.
    #[error("visitor asked to stop")]
    Aborted,

    /// Malformed markup; the source is latched and will keep failing.
    #[error("malformed input near line {lineno}")]
    ParseFail { lineno: u32 },

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ParrotError {
    /// Construct an [`ParrotError::Internal`] from any message.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        ParrotError::Internal(msg.into())
    }

    /// Attach a path to a raw I/O error.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ParrotError::Io {
            path: path.into(),
            source,
        }
    }
}
