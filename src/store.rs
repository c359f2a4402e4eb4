use rocksdb::{BlockBasedOptions, ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use crate::record::Record;

const ITEMS_CF: &str = "items";
const UNIQUE_CF: &str = "items_unique";
const SEQUENCE_KEY: &[u8] = b"__items_sequence__";
const INDEX_MARKER_KEY: &[u8] = b"__items_unique_index__";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("RocksDB error: {0}")]
    Db(#[from] rocksdb::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Missing column family {0}")]
    MissingColumnFamily(&'static str),
    #[error("Unique index conflict between items {existing} and {duplicate}")]
    IndexConflict { existing: u64, duplicate: u64 },
    #[error("Corrupt item key of {0} bytes")]
    CorruptKey(usize),
}

/// Result of an insert that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Rejected by the unique index: an identical record is already stored.
    DuplicateKey,
}

/// Persistent item store using RocksDB
/// Uses two column families:
/// - "items": sequence number -> JSON record
/// - "items_unique": encoded unique key -> sequence number (the unique index)
pub struct ItemStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl ItemStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(16 * 1024 * 1024);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.increase_parallelism(num_cpus::get() as i32);

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        block_opts.set_block_cache(&rocksdb::Cache::new_lru_cache(64 * 1024 * 1024));
        opts.set_block_based_table_factory(&block_opts);

        let db = DB::open_cf_descriptors(
            &opts,
            path,
            vec![
                ColumnFamilyDescriptor::new(ITEMS_CF, opts.clone()),
                ColumnFamilyDescriptor::new(UNIQUE_CF, opts.clone()),
            ],
        )?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Builds the unique index over every stored item. Idempotent: once the
    /// index marker is written this is a no-op.
    pub fn ensure_unique_index(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if self.db.get(INDEX_MARKER_KEY)?.is_some() {
            return Ok(());
        }

        let items = self.cf(ITEMS_CF)?;
        let unique = self.cf(UNIQUE_CF)?;
        let mut pending: HashMap<Vec<u8>, u64> = HashMap::new();
        let mut batch = WriteBatch::default();

        for entry in self.db.iterator_cf(items, IteratorMode::Start) {
            let (seq_key, value) = entry?;
            let seq = decode_seq(&seq_key)?;
            let record: Record = serde_json::from_slice(&value)?;
            let key = record.unique_key().to_bytes()?;

            let existing = match pending.get(&key) {
                Some(existing) => Some(*existing),
                None => self.db.get_cf(unique, &key)?.map(|v| decode_seq(&v)).transpose()?,
            };
            if let Some(existing) = existing
                && existing != seq
            {
                return Err(StoreError::IndexConflict { existing, duplicate: seq });
            }

            batch.put_cf(unique, &key, seq_key);
            pending.insert(key, seq);
        }

        batch.put(INDEX_MARKER_KEY, b"1");
        self.db.write(batch)?;
        Ok(())
    }

    /// Inserts `record` unless the unique index already holds its key.
    pub fn insert_if_new(&self, record: &Record) -> Result<InsertOutcome, StoreError> {
        let key = record.unique_key().to_bytes()?;
        let value = serde_json::to_vec(record)?;

        let items = self.cf(ITEMS_CF)?;
        let unique = self.cf(UNIQUE_CF)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.db.get_cf(unique, &key)?.is_some() {
            return Ok(InsertOutcome::DuplicateKey);
        }

        let seq = self.last_sequence()? + 1;
        let seq_key = seq.to_be_bytes();

        let mut batch = WriteBatch::default();
        batch.put_cf(items, seq_key, value);
        batch.put_cf(unique, key, seq_key);
        batch.put(SEQUENCE_KEY, seq.to_le_bytes());
        self.db.write(batch)?;

        Ok(InsertOutcome::Inserted)
    }

    /// Number of stored items.
    pub fn count(&self) -> Result<usize, StoreError> {
        let items = self.cf(ITEMS_CF)?;
        let mut count = 0;
        for entry in self.db.iterator_cf(items, IteratorMode::Start) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Every distinct title ever stored, sorted.
    pub fn distinct_titles(&self) -> Result<Vec<String>, StoreError> {
        let items = self.cf(ITEMS_CF)?;
        let mut titles = BTreeSet::new();
        for entry in self.db.iterator_cf(items, IteratorMode::Start) {
            let (_, value) = entry?;
            let record: Record = serde_json::from_slice(&value)?;
            titles.insert(record.title);
        }
        Ok(titles.into_iter().collect())
    }

    /// Overwrites the sequence counter with a value of the wrong width, so
    /// every later insert fails.
    #[cfg(test)]
    pub(crate) fn corrupt_sequence(&self) -> Result<(), StoreError> {
        self.db.put(SEQUENCE_KEY, [1u8, 2, 3])?;
        Ok(())
    }

    /// Stores a value under the items family that is not a record.
    #[cfg(test)]
    pub(crate) fn corrupt_item(&self) -> Result<(), StoreError> {
        let items = self.cf(ITEMS_CF)?;
        self.db.put_cf(items, u64::MAX.to_be_bytes(), b"not json")?;
        Ok(())
    }

    fn last_sequence(&self) -> Result<u64, StoreError> {
        match self.db.get(SEQUENCE_KEY)? {
            Some(bytes) => {
                let array: [u8; 8] = bytes[..]
                    .try_into()
                    .map_err(|_| StoreError::CorruptKey(bytes.len()))?;
                Ok(u64::from_le_bytes(array))
            }
            None => Ok(0),
        }
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }
}

fn decode_seq(bytes: &[u8]) -> Result<u64, StoreError> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::CorruptKey(bytes.len()))?;
    Ok(u64::from_be_bytes(array))
}

// Clones share the same database handle and write lock.
impl Clone for ItemStore {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            write_lock: self.write_lock.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_record, TempDir};

    #[test]
    fn same_record_is_stored_once() {
        let dir = TempDir::new("store-dedup");
        let store = ItemStore::open(dir.path()).unwrap();
        store.ensure_unique_index().unwrap();

        let record = sample_record("41900001", 1);
        assert_eq!(store.insert_if_new(&record).unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_if_new(&record).unwrap(), InsertOutcome::DuplicateKey);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn update_time_is_not_part_of_the_key() {
        let dir = TempDir::new("store-updated-at");
        let store = ItemStore::open(dir.path()).unwrap();
        store.ensure_unique_index().unwrap();

        let first = sample_record("41900001", 1);
        let mut rescraped = first.clone();
        rescraped.updated_at = first.updated_at + chrono::Duration::minutes(2);
        store.insert_if_new(&first).unwrap();

        assert_eq!(store.insert_if_new(&rescraped).unwrap(), InsertOutcome::DuplicateKey);
    }

    #[test]
    fn changed_fields_produce_a_new_item() {
        let dir = TempDir::new("store-changed");
        let store = ItemStore::open(dir.path()).unwrap();
        store.ensure_unique_index().unwrap();

        let first = sample_record("41900001", 1);
        let mut rescored = first.clone();
        rescored.score = Some(900);
        rescored.comment_count += 10;

        store.insert_if_new(&first).unwrap();
        assert_eq!(store.insert_if_new(&rescored).unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(store.distinct_titles().unwrap(), vec!["Story 41900001"]);
    }

    #[test]
    fn index_survives_reopen_and_is_idempotent() {
        let dir = TempDir::new("store-reopen");
        let record = sample_record("41900001", 3);
        {
            let store = ItemStore::open(dir.path()).unwrap();
            store.ensure_unique_index().unwrap();
            store.ensure_unique_index().unwrap();
            store.insert_if_new(&record).unwrap();
        }

        let store = ItemStore::open(dir.path()).unwrap();
        store.ensure_unique_index().unwrap();
        assert_eq!(store.insert_if_new(&record).unwrap(), InsertOutcome::DuplicateKey);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn concurrent_inserts_of_one_record_store_it_once() {
        let dir = TempDir::new("store-concurrent");
        let store = ItemStore::open(dir.path()).unwrap();
        store.ensure_unique_index().unwrap();
        let record = sample_record("41900001", 1);

        let outcomes: Vec<InsertOutcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let store = store.clone();
                    let record = record.clone();
                    scope.spawn(move || store.insert_if_new(&record).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let inserted = outcomes.iter().filter(|o| **o == InsertOutcome::Inserted).count();
        assert_eq!(inserted, 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn distinct_titles_across_pages() {
        let dir = TempDir::new("store-titles");
        let store = ItemStore::open(dir.path()).unwrap();
        store.ensure_unique_index().unwrap();

        let mut moved = sample_record("2", 1);
        store.insert_if_new(&moved).unwrap();
        moved.page = 2;
        store.insert_if_new(&moved).unwrap();
        store.insert_if_new(&sample_record("1", 3)).unwrap();

        assert_eq!(store.count().unwrap(), 3);
        assert_eq!(store.distinct_titles().unwrap(), vec!["Story 1", "Story 2"]);
    }

    #[test]
    fn corrupt_sequence_fails_inserts() {
        let dir = TempDir::new("store-corrupt");
        let store = ItemStore::open(dir.path()).unwrap();
        store.ensure_unique_index().unwrap();
        store.corrupt_sequence().unwrap();

        let err = store.insert_if_new(&sample_record("1", 1)).unwrap_err();
        assert!(matches!(err, StoreError::CorruptKey(3)));
        assert_eq!(store.count().unwrap(), 0);
    }
}
