//! [`IndexDefinition`] and the small enums that describe an index's
//! identity and scheduling state (spec §3).

use std::collections::BTreeSet;

use xxhash_rust::xxh64::xxh64;

use crate::etag::CollectionName;

/// Positive integer id assigned by the host database at index creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexId(pub u64);

/// Index type tag. The core only implements `AutoMap`; other variants are
/// admitted by the design (spec §1) but supply their own mapping function
/// and worker ordering outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    AutoMap,
    AutoMapReduce,
    Map,
    MapReduce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    Unlock,
    LockedIgnore,
    LockedError,
    SideBySide,
}

/// Scheduling priority. Exactly one of `Normal`/`Idle`/`Disabled`/`Error`
/// is meaningful at a time; `Forced` is an orthogonal bit suppressing
/// automatic transitions (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityState {
    Normal,
    Idle,
    Disabled,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub state: PriorityState,
    pub forced: bool,
}

impl Priority {
    pub fn normal() -> Self {
        Self {
            state: PriorityState::Normal,
            forced: false,
        }
    }

    pub fn with_state(self, state: PriorityState) -> Self {
        Self { state, ..self }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::normal()
    }
}

/// Immutable once created: an index's name, mapped collections, lock mode,
/// and type-specific fields never change after construction (I6). Changing
/// the collection set requires building a new index.
#[derive(Debug, Clone)]
pub struct IndexDefinition {
    pub id: IndexId,
    pub name: String,
    pub index_type: IndexType,
    pub collections: BTreeSet<CollectionName>,
    pub lock_mode: LockMode,
    /// Type-specific fields, e.g. the mapped field set for `AutoMap`. Kept
    /// opaque here: the core only needs a stable hash of them, not their
    /// structure.
    fields_fingerprint: Vec<u8>,
    stable_hash: u64,
}

impl IndexDefinition {
    pub fn new(
        id: IndexId,
        name: impl Into<String>,
        index_type: IndexType,
        collections: BTreeSet<CollectionName>,
        lock_mode: LockMode,
        fields_fingerprint: Vec<u8>,
    ) -> crate::error::Result<Self> {
        if id.0 == 0 {
            return Err(crate::error::IndexEngineError::invalid_argument(
                "index id must be positive",
            ));
        }
        if collections.is_empty() {
            return Err(crate::error::IndexEngineError::invalid_argument(
                "index must map at least one collection",
            ));
        }
        let name = name.into();
        let stable_hash = Self::compute_stable_hash(&name, index_type, &collections, &fields_fingerprint);
        Ok(Self {
            id,
            name,
            index_type,
            collections,
            lock_mode,
            fields_fingerprint,
            stable_hash,
        })
    }

    fn compute_stable_hash(
        name: &str,
        index_type: IndexType,
        collections: &BTreeSet<CollectionName>,
        fields_fingerprint: &[u8],
    ) -> u64 {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(name.as_bytes());
        bytes.push(0);
        bytes.push(index_type as u8);
        for collection in collections {
            bytes.extend_from_slice(collection.as_str().to_lowercase().as_bytes());
            bytes.push(0);
        }
        bytes.extend_from_slice(fields_fingerprint);
        xxh64(&bytes, 0)
    }

    /// Stable hash used as an input to the cache validator (spec §6).
    pub fn stable_hash(&self) -> u64 {
        self.stable_hash
    }

    /// Collections in a stable, deterministic order for etag vectors fed
    /// into the cache validator.
    pub fn collections_in_order(&self) -> impl Iterator<Item = &CollectionName> {
        self.collections.iter()
    }
}
