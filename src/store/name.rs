//! Qualified names and string interning
//!
//! Per-document name storage:
//! - Interning pool with hash-based deduplication (names repeat heavily)
//! - `QName` as three pool ids: namespace URI, local name, prefix
//! - NCName well-formedness checks used by every mutating cursor call

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::error::{Result, StoreError};

/// Well-known namespace URIs
pub mod ns {
    pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
    pub const XMLNS: &str = "http://www.w3.org/2000/xmlns/";
}

/// Identifier of an interned string; 0 is the empty string
pub type NameId = u32;

/// A qualified name: namespace URI, local name, prefix, all interned.
///
/// Two names refer to the same XML name when URI and local part agree;
/// the prefix is only a serialization hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct QName {
    pub uri: NameId,
    pub local: NameId,
    pub prefix: NameId,
}

impl QName {
    /// Name with no namespace and no prefix
    #[inline]
    pub fn unqualified(local: NameId) -> Self {
        QName {
            uri: 0,
            local,
            prefix: 0,
        }
    }

    /// Name in a namespace
    #[inline]
    pub fn new(uri: NameId, local: NameId, prefix: NameId) -> Self {
        QName { uri, local, prefix }
    }

    /// The empty name carried by unnamed node kinds
    #[inline]
    pub fn none() -> Self {
        QName::default()
    }

    /// XML name equality: URI and local part, prefix ignored
    #[inline]
    pub fn matches(&self, other: QName) -> bool {
        self.uri == other.uri && self.local == other.local
    }
}

/// Name filter used by nth-element and counting scans
#[derive(Debug, Clone, Copy)]
pub enum NameTest<'a> {
    /// Match every element
    Any,
    /// Match one name (URI + local)
    Name(QName),
    /// Match any name in the set
    AnyOf(&'a [QName]),
}

impl NameTest<'_> {
    /// Check whether `name` passes this test
    pub fn matches(&self, name: QName) -> bool {
        match self {
            NameTest::Any => true,
            NameTest::Name(q) => q.matches(name),
            NameTest::AnyOf(set) => set.iter().any(|q| q.matches(name)),
        }
    }
}

/// String interning pool.
///
/// Memory layout:
/// - `entries`: (offset, len) into `data` for each interned id
/// - `data`: one append-only string buffer
/// - `hash_index`: content hash -> ids with that hash (handles collisions)
#[derive(Debug)]
pub struct NamePool {
    entries: Vec<(u32, u32)>,
    data: String,
    hash_index: HashMap<u64, Vec<u32>>,
}

impl Default for NamePool {
    fn default() -> Self {
        Self::new()
    }
}

impl NamePool {
    /// Create a pool with id 0 reserved for the empty string
    pub fn new() -> Self {
        let mut pool = NamePool {
            entries: Vec::with_capacity(64),
            data: String::with_capacity(1024),
            hash_index: HashMap::new(),
        };
        pool.entries.push((0, 0));
        pool
    }

    #[inline]
    fn compute_hash(s: &str) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        let mut hasher = DefaultHasher::new();
        s.hash(&mut hasher);
        hasher.finish()
    }

    /// Intern a string, returning its id (deduplicated)
    pub fn intern(&mut self, s: &str) -> NameId {
        if s.is_empty() {
            return 0;
        }
        let hash = Self::compute_hash(s);
        if let Some(ids) = self.hash_index.get(&hash) {
            for &id in ids {
                if self.get(id) == s {
                    return id;
                }
            }
        }
        let offset = self.data.len() as u32;
        self.data.push_str(s);
        let id = self.entries.len() as u32;
        self.entries.push((offset, s.len() as u32));
        self.hash_index.entry(hash).or_default().push(id);
        id
    }

    /// Resolve an id to its string
    #[inline]
    pub fn get(&self, id: NameId) -> &str {
        let (offset, len) = self.entries[id as usize];
        &self.data[offset as usize..(offset + len) as usize]
    }

    /// Look up a string without interning it
    pub fn lookup(&self, s: &str) -> Option<NameId> {
        if s.is_empty() {
            return Some(0);
        }
        let hash = Self::compute_hash(s);
        let ids = self.hash_index.get(&hash)?;
        ids.iter().copied().find(|&id| self.get(id) == s)
    }

    /// Number of interned strings (including the reserved empty string)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if only the reserved empty string is present
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }
}

#[inline]
fn is_ncname_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

#[inline]
fn is_ncname_char(c: char) -> bool {
    is_ncname_start(c) || c == '-' || c == '.' || c.is_numeric()
}

/// Check NCName well-formedness (a name with no colon)
pub fn is_ncname(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if is_ncname_start(c) => {}
        _ => return false,
    }
    chars.all(is_ncname_char)
}

/// Validate a local name, failing with an argument error otherwise
pub fn validate_local(s: &str) -> Result<()> {
    if is_ncname(s) {
        Ok(())
    } else {
        Err(StoreError::arg(format!("not a valid NCName: {:?}", s)))
    }
}

/// Validate a namespace prefix for declaration.
///
/// Prefixes beginning with the reserved "xml" token (any case) may not be
/// declared; the empty prefix declares the default namespace.
pub fn validate_declared_prefix(s: &str) -> Result<()> {
    if s.is_empty() {
        return Ok(());
    }
    if !is_ncname(s) {
        return Err(StoreError::arg(format!("not a valid prefix: {:?}", s)));
    }
    if s.len() >= 3 && s[..3].eq_ignore_ascii_case("xml") {
        return Err(StoreError::arg(format!(
            "prefix may not begin with the reserved \"xml\" token: {:?}",
            s
        )));
    }
    Ok(())
}

/// Validate an optional prefix on an element or attribute name
pub fn validate_name_prefix(s: &str) -> Result<()> {
    if s.is_empty() || is_ncname(s) {
        Ok(())
    } else {
        Err(StoreError::arg(format!("not a valid prefix: {:?}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedup() {
        let mut pool = NamePool::new();
        let a = pool.intern("item");
        let b = pool.intern("item");
        assert_eq!(a, b);
        assert_eq!(pool.get(a), "item");
    }

    #[test]
    fn test_intern_distinct() {
        let mut pool = NamePool::new();
        let a = pool.intern("item");
        let b = pool.intern("other");
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_string_is_zero() {
        let mut pool = NamePool::new();
        assert_eq!(pool.intern(""), 0);
        assert_eq!(pool.get(0), "");
    }

    #[test]
    fn test_lookup() {
        let mut pool = NamePool::new();
        let id = pool.intern("ns");
        assert_eq!(pool.lookup("ns"), Some(id));
        assert_eq!(pool.lookup("missing"), None);
    }

    #[test]
    fn test_qname_matches_ignores_prefix() {
        let mut pool = NamePool::new();
        let uri = pool.intern("http://example.com");
        let local = pool.intern("a");
        let p1 = pool.intern("x");
        let p2 = pool.intern("y");
        let q1 = QName::new(uri, local, p1);
        let q2 = QName::new(uri, local, p2);
        assert!(q1.matches(q2));
        assert_ne!(q1, q2);
    }

    #[test]
    fn test_ncname() {
        assert!(is_ncname("item"));
        assert!(is_ncname("_item-1.x"));
        assert!(!is_ncname("1item"));
        assert!(!is_ncname("a:b"));
        assert!(!is_ncname(""));
        assert!(!is_ncname("a b"));
    }

    #[test]
    fn test_reserved_prefix() {
        assert!(validate_declared_prefix("xmlfoo").is_err());
        assert!(validate_declared_prefix("XMLfoo").is_err());
        assert!(validate_declared_prefix("xm").is_ok());
        assert!(validate_declared_prefix("svg").is_ok());
        assert!(validate_declared_prefix("").is_ok());
    }

    #[test]
    fn test_name_test() {
        let mut pool = NamePool::new();
        let a = QName::unqualified(pool.intern("a"));
        let b = QName::unqualified(pool.intern("b"));
        let c = QName::unqualified(pool.intern("c"));
        assert!(NameTest::Any.matches(c));
        assert!(NameTest::Name(a).matches(a));
        assert!(!NameTest::Name(a).matches(b));
        let set = [a, b];
        assert!(NameTest::AnyOf(&set).matches(b));
        assert!(!NameTest::AnyOf(&set).matches(c));
    }
}
