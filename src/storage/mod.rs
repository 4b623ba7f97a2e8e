//! Persistent per-index metadata (spec §4.1): priority, lock mode,
//! per-collection progress etags, stats, and the error ring.
//!
//! `IndexStorage` never opens its own transactions (spec §4.1): every
//! reader takes a `ReadTransaction` or `WriteTransaction` borrowed from
//! the caller (the indexing loop or the index façade), and every writer
//! takes a `WriteTransaction`. The environment accessor is exposed so the
//! caller can begin the transaction that a batch will also use to write
//! through `IndexPersistence`, keeping both under one commit (I2).

pub mod stats;

use std::{
    path::Path,
    sync::Arc,
    time::{
        Duration,
        SystemTime,
    },
};

use redb::{
    backends::InMemoryBackend,
    Database,
    ReadTransaction,
    ReadableTable,
    TableDefinition,
    WriteTransaction,
};

use crate::{
    definition::{
        IndexType,
        LockMode,
        Priority,
        PriorityState,
    },
    error::{
        IndexEngineError,
        Result,
    },
    etag::{
        CollectionName,
        Etag,
    },
    storage::stats::{
        BatchStats,
        ErrorRing,
        IndexStats,
        RecordedError,
    },
};

/// The schema version this crate understands (I5). Opening storage with a
/// different version is a fatal error.
pub const SCHEMA_VERSION: u64 = 1;

const METADATA: TableDefinition<&str, &[u8]> = TableDefinition::new("metadata");
const LAST_MAPPED_ETAGS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("last_mapped_etags");
const LAST_TOMBSTONE_ETAGS: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("last_tombstone_etags");

const KEY_SCHEMA_VERSION: &str = "schema_version";
const KEY_PRIORITY: &str = "priority";
const KEY_LOCK_MODE: &str = "lock_mode";
const KEY_STATS: &str = "stats";
const KEY_ERRORS: &str = "errors";
const KEY_INDEX_TYPE: &str = "index_type";

/// A transaction IndexStorage can read through: either a read or a write
/// transaction on the index's environment.
pub enum ReadTxn<'a> {
    Read(&'a ReadTransaction),
    Write(&'a WriteTransaction),
}

impl<'a> From<&'a ReadTransaction> for ReadTxn<'a> {
    fn from(txn: &'a ReadTransaction) -> Self {
        ReadTxn::Read(txn)
    }
}

impl<'a> From<&'a WriteTransaction> for ReadTxn<'a> {
    fn from(txn: &'a WriteTransaction) -> Self {
        ReadTxn::Write(txn)
    }
}

fn collection_key(collection: &CollectionName) -> Vec<u8> {
    collection.as_str().to_lowercase().into_bytes()
}

fn priority_to_bits(priority: Priority) -> u8 {
    let state_bits = match priority.state {
        PriorityState::Normal => 0u8,
        PriorityState::Idle => 1,
        PriorityState::Disabled => 2,
        PriorityState::Error => 3,
    };
    state_bits | if priority.forced { 0b1000 } else { 0 }
}

fn priority_from_bits(bits: u8) -> Priority {
    let state = match bits & 0b0111 {
        0 => PriorityState::Normal,
        1 => PriorityState::Idle,
        2 => PriorityState::Disabled,
        _ => PriorityState::Error,
    };
    Priority {
        state,
        forced: bits & 0b1000 != 0,
    }
}

fn lock_mode_to_byte(mode: LockMode) -> u8 {
    match mode {
        LockMode::Unlock => 0,
        LockMode::LockedIgnore => 1,
        LockMode::LockedError => 2,
        LockMode::SideBySide => 3,
    }
}

fn lock_mode_from_byte(byte: u8) -> LockMode {
    match byte {
        1 => LockMode::LockedIgnore,
        2 => LockMode::LockedError,
        3 => LockMode::SideBySide,
        _ => LockMode::Unlock,
    }
}

fn index_type_to_byte(t: IndexType) -> u8 {
    match t {
        IndexType::AutoMap => 0,
        IndexType::AutoMapReduce => 1,
        IndexType::Map => 2,
        IndexType::MapReduce => 3,
    }
}

fn index_type_from_byte(byte: u8) -> Result<IndexType> {
    Ok(match byte {
        0 => IndexType::AutoMap,
        1 => IndexType::AutoMapReduce,
        2 => IndexType::Map,
        3 => IndexType::MapReduce,
        other => {
            return Err(IndexEngineError::NotImplementedIndexType(format!(
                "unknown type tag byte {other}"
            )))
        },
    })
}

/// Persistent per-index metadata bound to one storage environment.
pub struct IndexStorage {
    environment: Arc<Database>,
}

impl IndexStorage {
    /// Opens (creating if absent) the on-disk environment at `path`,
    /// checking the schema version (I5), and writing it if the database
    /// is brand new.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(|e| IndexEngineError::Other(e.into()))?;
        Self::from_environment(db)
    }

    /// Opens a memory-only environment. Nothing survives a process
    /// restart, matching S6's expectation that a fresh memory environment
    /// starts with no mapped progress.
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(|e| IndexEngineError::Other(e.into()))?;
        Self::from_environment(db)
    }

    fn from_environment(db: Database) -> Result<Self> {
        let txn = db.begin_write().map_err(|e| IndexEngineError::Other(e.into()))?;
        {
            let mut table = txn
                .open_table(METADATA)
                .map_err(|e| IndexEngineError::Other(e.into()))?;
            let existing_version = table
                .get(KEY_SCHEMA_VERSION)
                .map_err(|e| IndexEngineError::Other(e.into()))?
                .map(|existing| -> Result<u64> {
                    Ok(u64::from_be_bytes(existing.value().try_into().map_err(|_| {
                        IndexEngineError::InvalidState("corrupt schema_version record")
                    })?))
                })
                .transpose()?;
            match existing_version {
                Some(version) => {
                    if version != SCHEMA_VERSION {
                        return Err(IndexEngineError::InvalidState(
                            "index storage schema version mismatch",
                        ));
                    }
                },
                None => {
                    table
                        .insert(KEY_SCHEMA_VERSION, SCHEMA_VERSION.to_be_bytes().as_slice())
                        .map_err(|e| IndexEngineError::Other(e.into()))?;
                },
            }
        }
        {
            // Force creation of these tables up front: redb errors when a
            // read transaction opens a table that was never created by a
            // prior write, so every table needs at least one write-side
            // `open_table` before it can be read.
            txn.open_table(LAST_MAPPED_ETAGS)
                .map_err(|e| IndexEngineError::Other(e.into()))?;
            txn.open_table(LAST_TOMBSTONE_ETAGS)
                .map_err(|e| IndexEngineError::Other(e.into()))?;
        }
        txn.commit().map_err(|e| IndexEngineError::Other(e.into()))?;
        Ok(Self {
            environment: Arc::new(db),
        })
    }

    /// Accessor used by the caller to begin the read/write transaction
    /// that is then threaded through this struct's methods and through
    /// [`crate::persistence::IndexPersistence`].
    pub fn environment(&self) -> &Database {
        &self.environment
    }

    pub fn begin_read(&self) -> Result<ReadTransaction> {
        self.environment
            .begin_read()
            .map_err(|e| IndexEngineError::Other(e.into()))
    }

    pub fn begin_write(&self) -> Result<WriteTransaction> {
        self.environment
            .begin_write()
            .map_err(|e| IndexEngineError::Other(e.into()))
    }

    /// Static read used at open time to decide which index variant to
    /// instantiate, before the variant-specific state exists.
    pub fn read_index_type(environment: &Database) -> Result<IndexType> {
        let txn = environment
            .begin_read()
            .map_err(|e| IndexEngineError::Other(e.into()))?;
        let table = txn
            .open_table(METADATA)
            .map_err(|e| IndexEngineError::Other(e.into()))?;
        let bytes = table
            .get(KEY_INDEX_TYPE)
            .map_err(|e| IndexEngineError::Other(e.into()))?
            .ok_or(IndexEngineError::InvalidState("index type not recorded"))?;
        index_type_from_byte(bytes.value()[0])
    }

    pub fn write_index_type(&self, txn: &WriteTransaction, index_type: IndexType) -> Result<()> {
        let mut table = txn
            .open_table(METADATA)
            .map_err(|e| IndexEngineError::Other(e.into()))?;
        table
            .insert(KEY_INDEX_TYPE, [index_type_to_byte(index_type)].as_slice())
            .map_err(|e| IndexEngineError::Other(e.into()))?;
        Ok(())
    }

    pub fn read_priority<'a>(&self, txn: impl Into<ReadTxn<'a>>) -> Result<Priority> {
        let bytes = self.read_metadata_bytes(txn, KEY_PRIORITY)?;
        Ok(bytes.map(|b| priority_from_bits(b[0])).unwrap_or_default())
    }

    pub fn write_priority(&self, txn: &WriteTransaction, priority: Priority) -> Result<()> {
        self.write_metadata_bytes(txn, KEY_PRIORITY, &[priority_to_bits(priority)])
    }

    pub fn read_lock<'a>(&self, txn: impl Into<ReadTxn<'a>>) -> Result<LockMode> {
        let bytes = self.read_metadata_bytes(txn, KEY_LOCK_MODE)?;
        Ok(bytes.map(|b| lock_mode_from_byte(b[0])).unwrap_or_default())
    }

    pub fn write_lock(&self, txn: &WriteTransaction, mode: LockMode) -> Result<()> {
        self.write_metadata_bytes(txn, KEY_LOCK_MODE, &[lock_mode_to_byte(mode)])
    }

    pub fn read_last_mapped_etag<'a>(
        &self,
        txn: impl Into<ReadTxn<'a>>,
        collection: &CollectionName,
    ) -> Result<Etag> {
        self.read_etag(txn, LAST_MAPPED_ETAGS, collection)
    }

    pub fn write_last_mapped_etag(
        &self,
        txn: &WriteTransaction,
        collection: &CollectionName,
        etag: Etag,
    ) -> Result<()> {
        self.write_etag(txn, LAST_MAPPED_ETAGS, collection, etag)
    }

    pub fn read_last_processed_tombstone_etag<'a>(
        &self,
        txn: impl Into<ReadTxn<'a>>,
        collection: &CollectionName,
    ) -> Result<Etag> {
        self.read_etag(txn, LAST_TOMBSTONE_ETAGS, collection)
    }

    pub fn write_last_processed_tombstone_etag(
        &self,
        txn: &WriteTransaction,
        collection: &CollectionName,
        etag: Etag,
    ) -> Result<()> {
        self.write_etag(txn, LAST_TOMBSTONE_ETAGS, collection, etag)
    }

    /// Appends a batch's counters to the rolling stats, records
    /// last-indexing-time, and bumps error counters (spec §4.1).
    pub fn update_stats(
        &self,
        txn: &WriteTransaction,
        batch_start: SystemTime,
        duration: Duration,
        batch: &BatchStats,
    ) -> Result<()> {
        let mut stats = self.read_stats(ReadTxn::Write(txn))?;
        stats.merge_batch(batch_start, duration, batch);
        let encoded = bincode::serialize(&stats).map_err(|e| IndexEngineError::Other(e.into()))?;
        self.write_metadata_bytes(txn, KEY_STATS, &encoded)
    }

    pub fn read_stats<'a>(&self, txn: impl Into<ReadTxn<'a>>) -> Result<IndexStats> {
        match self.read_metadata_bytes(txn, KEY_STATS)? {
            Some(bytes) => bincode::deserialize(&bytes).map_err(|e| IndexEngineError::Other(e.into())),
            None => Ok(IndexStats::default()),
        }
    }

    pub fn record_error<'a>(
        &self,
        txn: &WriteTransaction,
        error: RecordedError,
    ) -> Result<()> {
        let mut ring = self.read_errors_ring(ReadTxn::Write(txn))?;
        ring.push(error);
        let encoded = bincode::serialize(&ring).map_err(|e| IndexEngineError::Other(e.into()))?;
        self.write_metadata_bytes(txn, KEY_ERRORS, &encoded)
    }

    /// Bumps the persisted write-error counter for an error observed
    /// outside a committed batch, without touching `batch_count` or
    /// `last_indexing_time_millis`.
    pub fn record_write_error_stat(&self, txn: &WriteTransaction) -> Result<()> {
        let mut stats = self.read_stats(ReadTxn::Write(txn))?;
        stats.record_write_error();
        let encoded = bincode::serialize(&stats).map_err(|e| IndexEngineError::Other(e.into()))?;
        self.write_metadata_bytes(txn, KEY_STATS, &encoded)
    }

    /// Up to [`stats::MAX_RECORDED_ERRORS`] errors, chronological order.
    pub fn read_errors<'a>(&self, txn: impl Into<ReadTxn<'a>>) -> Result<Vec<RecordedError>> {
        Ok(self.read_errors_ring(txn)?.entries())
    }

    fn read_errors_ring<'a>(&self, txn: impl Into<ReadTxn<'a>>) -> Result<ErrorRing> {
        match self.read_metadata_bytes(txn, KEY_ERRORS)? {
            Some(bytes) => bincode::deserialize(&bytes).map_err(|e| IndexEngineError::Other(e.into())),
            None => Ok(ErrorRing::default()),
        }
    }

    fn read_metadata_bytes<'a>(&self, txn: impl Into<ReadTxn<'a>>, key: &str) -> Result<Option<Vec<u8>>> {
        match txn.into() {
            ReadTxn::Read(r) => {
                let table = r.open_table(METADATA).map_err(|e| IndexEngineError::Other(e.into()))?;
                let value = table
                    .get(key)
                    .map_err(|e| IndexEngineError::Other(e.into()))?
                    .map(|v| v.value().to_vec());
                Ok(value)
            },
            ReadTxn::Write(w) => {
                let table = w.open_table(METADATA).map_err(|e| IndexEngineError::Other(e.into()))?;
                let value = table
                    .get(key)
                    .map_err(|e| IndexEngineError::Other(e.into()))?
                    .map(|v| v.value().to_vec());
                Ok(value)
            },
        }
    }

    fn write_metadata_bytes(&self, txn: &WriteTransaction, key: &str, value: &[u8]) -> Result<()> {
        let mut table = txn.open_table(METADATA).map_err(|e| IndexEngineError::Other(e.into()))?;
        table.insert(key, value).map_err(|e| IndexEngineError::Other(e.into()))?;
        Ok(())
    }

    fn read_etag<'a>(
        &self,
        txn: impl Into<ReadTxn<'a>>,
        table_def: TableDefinition<&[u8], &[u8]>,
        collection: &CollectionName,
    ) -> Result<Etag> {
        let key = collection_key(collection);
        let bytes = match txn.into() {
            ReadTxn::Read(r) => {
                let table = r.open_table(table_def).map_err(|e| IndexEngineError::Other(e.into()))?;
                let value = table
                    .get(key.as_slice())
                    .map_err(|e| IndexEngineError::Other(e.into()))?
                    .map(|v| v.value().to_vec());
                value
            },
            ReadTxn::Write(w) => {
                let table = w.open_table(table_def).map_err(|e| IndexEngineError::Other(e.into()))?;
                let value = table
                    .get(key.as_slice())
                    .map_err(|e| IndexEngineError::Other(e.into()))?
                    .map(|v| v.value().to_vec());
                value
            },
        };
        Ok(bytes.map(|b| Etag::from_be_bytes(&b)).unwrap_or(Etag::NONE))
    }

    fn write_etag(
        &self,
        txn: &WriteTransaction,
        table_def: TableDefinition<&[u8], &[u8]>,
        collection: &CollectionName,
        etag: Etag,
    ) -> Result<()> {
        let key = collection_key(collection);
        let mut table = txn.open_table(table_def).map_err(|e| IndexEngineError::Other(e.into()))?;
        table
            .insert(key.as_slice(), etag.to_be_bytes().as_slice())
            .map_err(|e| IndexEngineError::Other(e.into()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_memory_environment_has_no_progress() {
        let storage = IndexStorage::open_in_memory().unwrap();
        let txn = storage.begin_read().unwrap();
        let users = CollectionName::new("Users");
        assert_eq!(storage.read_last_mapped_etag(&txn, &users).unwrap(), Etag::NONE);
        assert_eq!(storage.read_priority(&txn).unwrap(), Priority::normal());
    }

    #[test]
    fn etags_persist_across_commits() {
        let storage = IndexStorage::open_in_memory().unwrap();
        let users = CollectionName::new("Users");
        let txn = storage.begin_write().unwrap();
        storage.write_last_mapped_etag(&txn, &users, Etag(42)).unwrap();
        txn.commit().unwrap();

        let txn = storage.begin_read().unwrap();
        assert_eq!(storage.read_last_mapped_etag(&txn, &users).unwrap(), Etag(42));
    }

    #[test]
    fn index_type_round_trips_through_the_metadata_table() {
        let storage = IndexStorage::open_in_memory().unwrap();
        let txn = storage.begin_write().unwrap();
        storage.write_index_type(&txn, IndexType::AutoMap).unwrap();
        txn.commit().unwrap();

        assert_eq!(IndexStorage::read_index_type(storage.environment()).unwrap(), IndexType::AutoMap);
    }

    #[test]
    fn schema_version_is_checked_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.redb");
        {
            let storage = IndexStorage::open(&path).unwrap();
            let txn = storage.begin_write().unwrap();
            storage
                .write_last_mapped_etag(&txn, &CollectionName::new("Users"), Etag(7))
                .unwrap();
            txn.commit().unwrap();
        }
        let reopened = IndexStorage::open(&path).unwrap();
        let txn = reopened.begin_read().unwrap();
        assert_eq!(
            reopened.read_last_mapped_etag(&txn, &CollectionName::new("Users")).unwrap(),
            Etag(7)
        );
    }

    #[test]
    fn stats_accumulate_across_batches() {
        let storage = IndexStorage::open_in_memory().unwrap();
        let txn = storage.begin_write().unwrap();
        storage
            .update_stats(
                &txn,
                SystemTime::UNIX_EPOCH,
                Duration::from_millis(5),
                &BatchStats {
                    map_count: 3,
                    ..Default::default()
                },
            )
            .unwrap();
        storage
            .update_stats(
                &txn,
                SystemTime::UNIX_EPOCH,
                Duration::from_millis(5),
                &BatchStats {
                    map_count: 4,
                    ..Default::default()
                },
            )
            .unwrap();
        txn.commit().unwrap();

        let txn = storage.begin_read().unwrap();
        let stats = storage.read_stats(&txn).unwrap();
        assert_eq!(stats.batch_count, 2);
        assert_eq!(stats.map_count, 7);
    }
}
