//! Interned string table
//!
//! Every long-lived identifier in the compiler is a 32-bit [`StrId`] into a
//! single append-only table. Once interned a string is never freed or
//! rewritten, so a `StrId` stays valid for the life of the compilation
//! context and can be used as a cheap map key everywhere (symbol tables,
//! macro tables, template registries).
//!
//! [`StringBuilder`] composes temporary concatenations (mangled names,
//! instantiation keys) and commits the result to the table in one step.

use std::collections::HashMap;
use std::fmt;

/// Stable handle to an interned string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StrId(u32);

impl StrId {
    /// Handle of the empty string. The table always interns `""` at slot 0.
    pub const EMPTY: StrId = StrId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Rebuild a handle from a raw index previously obtained via `index()`.
    /// Used by the seqlock location cell, which stores the handle in an
    /// atomic word.
    pub(crate) fn from_index(raw: u32) -> StrId {
        StrId(raw)
    }
}

impl fmt::Display for StrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "str#{}", self.0)
    }
}

/// Append-only intern table mapping byte strings to stable handles.
pub struct StringTable {
    strings: Vec<Box<str>>,
    index: HashMap<Box<str>, StrId>,
}

impl StringTable {
    pub fn new() -> Self {
        let mut table = StringTable {
            strings: Vec::with_capacity(1024),
            index: HashMap::with_capacity(1024),
        };
        // Slot 0 is the empty string so StrId::EMPTY is always valid.
        let id = table.intern("");
        debug_assert_eq!(id, StrId::EMPTY);
        table
    }

    /// Intern a string, returning the existing handle if already present.
    pub fn intern(&mut self, s: &str) -> StrId {
        if let Some(&id) = self.index.get(s) {
            return id;
        }
        let id = StrId(u32::try_from(self.strings.len()).expect("string table overflow"));
        let boxed: Box<str> = s.into();
        self.strings.push(boxed.clone());
        self.index.insert(boxed, id);
        id
    }

    /// Look up a string without interning it.
    pub fn lookup(&self, s: &str) -> Option<StrId> {
        self.index.get(s).copied()
    }

    /// Resolve a handle back to its string.
    ///
    /// Handles are only produced by this table, so an out-of-range index is
    /// an internal bug, not user error.
    pub fn resolve(&self, id: StrId) -> &str {
        &self.strings[id.index()]
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        // Slot 0 always exists; the table is never logically empty.
        false
    }

    pub fn builder(&self) -> StringBuilder {
        StringBuilder::new()
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Composes a string from parts, then commits it to the table atomically.
///
/// Nothing is interned until [`StringBuilder::commit`]; abandoned builders
/// leave no trace in the table.
pub struct StringBuilder {
    buf: String,
}

impl StringBuilder {
    pub fn new() -> Self {
        StringBuilder { buf: String::new() }
    }

    pub fn append(mut self, part: &str) -> Self {
        self.buf.push_str(part);
        self
    }

    pub fn append_id(mut self, table: &StringTable, id: StrId) -> Self {
        self.buf.push_str(table.resolve(id));
        self
    }

    pub fn append_char(mut self, c: char) -> Self {
        self.buf.push(c);
        self
    }

    /// Peek at the composed string without committing.
    pub fn preview(&self) -> &str {
        &self.buf
    }

    /// Intern the composed string and return its handle.
    pub fn commit(self, table: &mut StringTable) -> StrId {
        table.intern(&self.buf)
    }
}

impl Default for StringBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_returns_same_handle() {
        let mut table = StringTable::new();
        let a = table.intern("vector");
        let b = table.intern("vector");
        assert_eq!(a, b);
        assert_eq!(table.resolve(a), "vector");
    }

    #[test]
    fn test_distinct_strings_distinct_handles() {
        let mut table = StringTable::new();
        let a = table.intern("foo");
        let b = table.intern("bar");
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_string_is_slot_zero() {
        let mut table = StringTable::new();
        assert_eq!(table.intern(""), StrId::EMPTY);
        assert_eq!(table.resolve(StrId::EMPTY), "");
    }

    #[test]
    fn test_lookup_does_not_intern() {
        let mut table = StringTable::new();
        assert_eq!(table.lookup("missing"), None);
        let before = table.len();
        table.lookup("missing");
        assert_eq!(table.len(), before);
        let id = table.intern("missing");
        assert_eq!(table.lookup("missing"), Some(id));
    }

    #[test]
    fn test_builder_commit() {
        let mut table = StringTable::new();
        let class = table.intern("Container");
        let id = StringBuilder::new()
            .append_id(&table, class)
            .append("::")
            .append("get")
            .commit(&mut table);
        assert_eq!(table.resolve(id), "Container::get");
    }

    #[test]
    fn test_abandoned_builder_interns_nothing() {
        let mut table = StringTable::new();
        let before = table.len();
        {
            let b = StringBuilder::new().append("temporary");
            assert_eq!(b.preview(), "temporary");
        }
        assert_eq!(table.len(), before);
        let _ = &mut table;
    }
}
