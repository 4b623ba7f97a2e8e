//! The etag: a 64-bit monotonically increasing change sequence number
//! assigned by the document store to every document write and tombstone.
//! All staleness reasoning in this crate is etag arithmetic (spec §3).

use std::{
    cmp::Ordering,
    fmt,
};

use byteorder::{
    BigEndian,
    ByteOrder,
};

/// A document-store change sequence number. `0` means "nothing observed
/// yet" and is always `<=` any real etag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Etag(pub u64);

impl Etag {
    pub const NONE: Etag = Etag(0);

    pub fn next(self) -> Etag {
        Etag(self.0 + 1)
    }

    pub fn to_be_bytes(self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, self.0);
        buf
    }

    pub fn from_be_bytes(buf: &[u8]) -> Self {
        Etag(BigEndian::read_u64(buf))
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Etag {
    fn from(value: u64) -> Self {
        Etag(value)
    }
}

/// Case-insensitive collection name, compared and hashed in a canonical
/// lowercase form so `"Users"` and `"users"` name the same collection.
#[derive(Debug, Clone, Eq)]
pub struct CollectionName {
    original: String,
    canonical: String,
}

impl CollectionName {
    pub fn new(name: impl Into<String>) -> Self {
        let original = name.into();
        let canonical = original.to_lowercase();
        Self { original, canonical }
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }
}

impl PartialEq for CollectionName {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl std::hash::Hash for CollectionName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl Ord for CollectionName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl PartialOrd for CollectionName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

impl From<&str> for CollectionName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CollectionName {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
