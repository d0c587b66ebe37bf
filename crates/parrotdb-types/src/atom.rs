//! Atom and matom handle types.

use std::fmt;

/// A 32-bit index into some pool.  The value 0 is reserved as null.
///
/// Atoms survive unmap/remap of the backing segment; a pointer obtained by
/// dereferencing an atom is only valid until the next mutation of the
/// owning pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Atom(u32);

impl Atom {
    /// The reserved null atom.
    pub const NULL: Atom = Atom(0);

    #[must_use]
    pub const fn new(value: u32) -> Self {
        Atom(value)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// `Some(self)` for non-null atoms, `None` for the null atom.
    #[must_use]
    pub const fn non_null(self) -> Option<Atom> {
        if self.0 == 0 { None } else { Some(self) }
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Atom({})", self.0)
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A segment-allocator atom, counted in pages.
///
/// Identical in representation to [`Atom`], but the shifting and meaning
/// differ enough that mixing the two is always a bug, so it gets its own
/// type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Matom(u32);

impl Matom {
    /// The reserved null matom.
    pub const NULL: Matom = Matom(0);

    #[must_use]
    pub const fn new(value: u32) -> Self {
        Matom(value)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Matom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Matom({})", self.0)
    }
}

impl fmt::Display for Matom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
