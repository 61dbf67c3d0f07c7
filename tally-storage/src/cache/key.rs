//! Namespaced cache keys and invalidation patterns.
//!
//! Keys are plain strings laid out so related data shares a prefix:
//!
//! - `novels/42` a single document
//! - `novels/42/chapters` data derived from that document
//! - `novels?status=published&limit=20` a query result
//!
//! Invalidating `KeyPattern::entity("novels", "42")` drops the first two but
//! leaves `novels/420` alone.

use std::fmt;

const PATH_SEPARATOR: char = '/';
const QUERY_SEPARATOR: char = '?';

/// A cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an arbitrary caller-chosen key.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Key of one document: `collection/id`.
    pub fn document(collection: &str, id: &str) -> Self {
        Self(format!("{collection}{PATH_SEPARATOR}{id}"))
    }

    /// Key of a query result: `collection?fingerprint`.
    pub fn query(collection: &str, fingerprint: &str) -> Self {
        Self(format!("{collection}{QUERY_SEPARATOR}{fingerprint}"))
    }

    /// Key of data derived from a document: `collection/id/suffix`.
    pub fn related(collection: &str, id: &str, suffix: &str) -> Self {
        Self(format!(
            "{collection}{PATH_SEPARATOR}{id}{PATH_SEPARATOR}{suffix}"
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for CacheKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Which keys an invalidation removes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPattern {
    /// Exactly this key.
    Exact(String),
    /// Every key starting with this string.
    Prefix(String),
    /// This key plus every key nested under it (`base/...` or `base?...`).
    Subtree(String),
}

impl KeyPattern {
    /// A document and everything derived from it.
    pub fn entity(collection: &str, id: &str) -> Self {
        Self::Subtree(CacheKey::document(collection, id).into_string())
    }

    /// Every key in a collection, documents and query results alike.
    pub fn collection(collection: &str) -> Self {
        Self::Subtree(collection.to_string())
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Exact(exact) => key == exact,
            KeyPattern::Prefix(prefix) => key.starts_with(prefix.as_str()),
            KeyPattern::Subtree(base) => match key.strip_prefix(base.as_str()) {
                Some("") => true,
                Some(rest) => rest.starts_with([PATH_SEPARATOR, QUERY_SEPARATOR]),
                None => false,
            },
        }
    }

    /// Literal prefix every matching key starts with.
    pub fn literal_prefix(&self) -> &str {
        match self {
            KeyPattern::Exact(s) | KeyPattern::Prefix(s) | KeyPattern::Subtree(s) => s,
        }
    }
}

/// `"novels/*"` is a prefix pattern, anything else an exact key.
impl From<&str> for KeyPattern {
    fn from(raw: &str) -> Self {
        match raw.strip_suffix('*') {
            Some(prefix) => KeyPattern::Prefix(prefix.to_string()),
            None => KeyPattern::Exact(raw.to_string()),
        }
    }
}

impl From<&CacheKey> for KeyPattern {
    fn from(key: &CacheKey) -> Self {
        KeyPattern::Exact(key.as_str().to_string())
    }
}

impl From<CacheKey> for KeyPattern {
    fn from(key: CacheKey) -> Self {
        KeyPattern::Exact(key.into_string())
    }
}
