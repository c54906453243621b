//! Key-value persistence.
//!
//! The node only needs a small contract from its store: point reads and
//! writes, an ordered prefix scan and two atomic conditional writes.
//! `put_if_absent` backs nullifier recording; `put_all_if_absent` backs the
//! content dedup insert, whose entry and indices must land together.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;

use log::debug;
use parking_lot::RwLock;
use sled::transaction::{TransactionError, TransactionResult};

use crate::error::StorageError;

pub type KvPair = (Vec<u8>, Vec<u8>);

/// Lazy, key-ordered sequence of entries under a prefix.
pub type KvIter<'a> = Box<dyn Iterator<Item = Result<KvPair, StorageError>> + 'a>;

pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    fn exists(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    /// Writes `value` only if `key` is absent. Returns whether it wrote.
    ///
    /// Must be atomic with respect to concurrent callers on the same key.
    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool, StorageError>;

    /// Writes every pair in `writes` if `guard` is absent, nothing otherwise.
    /// Returns whether it wrote.
    ///
    /// All-or-nothing, including across a crash. `writes` normally contains
    /// `guard` itself.
    fn put_all_if_absent(&self, guard: &[u8], writes: &[KvPair]) -> Result<bool, StorageError>;

    /// Entries whose key starts with `prefix`, in ascending key order.
    fn iterate<'a>(&'a self, prefix: &[u8]) -> KvIter<'a> {
        self.iterate_from(prefix, prefix)
    }

    /// Like [`iterate`](KvStore::iterate) but starting at the first key
    /// `>= start`.
    fn iterate_from<'a>(&'a self, prefix: &[u8], start: &[u8]) -> KvIter<'a>;

    /// Makes completed writes durable.
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Entries copied out per lock acquisition while scanning a [`MemoryStore`].
const SCAN_CHUNK: usize = 64;

/// In-process store backed by a `BTreeMap`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn exists(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.entries.read().contains_key(key))
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool, StorageError> {
        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_vec(), value.to_vec());
        Ok(true)
    }

    fn put_all_if_absent(&self, guard: &[u8], writes: &[KvPair]) -> Result<bool, StorageError> {
        let mut entries = self.entries.write();
        if entries.contains_key(guard) {
            return Ok(false);
        }
        for (key, value) in writes {
            entries.insert(key.clone(), value.clone());
        }
        Ok(true)
    }

    fn iterate_from<'a>(&'a self, prefix: &[u8], start: &[u8]) -> KvIter<'a> {
        Box::new(MemoryScan {
            entries: &self.entries,
            prefix: prefix.to_vec(),
            from: Bound::Included(start.to_vec()),
            buffer: Vec::new().into_iter(),
            exhausted: false,
        })
    }
}

/// Lazy prefix scan over a [`MemoryStore`].
///
/// Copies at most [`SCAN_CHUNK`] entries per read lock, so a scan never
/// holds the lock across caller code and never copies the whole range.
struct MemoryScan<'a> {
    entries: &'a RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    prefix: Vec<u8>,
    from: Bound<Vec<u8>>,
    buffer: std::vec::IntoIter<KvPair>,
    exhausted: bool,
}

impl MemoryScan<'_> {
    fn refill(&mut self) {
        let chunk: Vec<KvPair> = self
            .entries
            .read()
            .range((self.from.clone(), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(&self.prefix))
            .take(SCAN_CHUNK)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if chunk.len() < SCAN_CHUNK {
            self.exhausted = true;
        }
        if let Some((last, _)) = chunk.last() {
            self.from = Bound::Excluded(last.clone());
        }
        self.buffer = chunk.into_iter();
    }
}

impl Iterator for MemoryScan<'_> {
    type Item = Result<KvPair, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pair) = self.buffer.next() {
                return Some(Ok(pair));
            }
            if self.exhausted {
                return None;
            }
            self.refill();
        }
    }
}

/// On-disk store backed by sled.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// # Errors
    /// Returns [`StorageError::Backend`] if the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        debug!("Opening sled store at {}", path.display());
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key)?.map(|value| value.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn exists(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.db.contains_key(key)?)
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool, StorageError> {
        let swapped = self
            .db
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))?;
        Ok(swapped.is_ok())
    }

    fn put_all_if_absent(&self, guard: &[u8], writes: &[KvPair]) -> Result<bool, StorageError> {
        let result: TransactionResult<bool, StorageError> = self.db.transaction(|tx| {
            if tx.get(guard)?.is_some() {
                return Ok(false);
            }
            for (key, value) in writes {
                tx.insert(key.as_slice(), value.as_slice())?;
            }
            Ok(true)
        });
        result.map_err(|e| match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => StorageError::from(e),
        })
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn iterate_from<'a>(&'a self, prefix: &[u8], start: &[u8]) -> KvIter<'a> {
        let prefix = prefix.to_vec();
        Box::new(
            self.db
                .range(start.to_vec()..)
                .take_while(move |item| match item {
                    Ok((key, _)) => key.starts_with(&prefix),
                    Err(_) => true,
                })
                .map(|item| {
                    item.map(|(key, value)| (key.to_vec(), value.to_vec()))
                        .map_err(StorageError::from)
                }),
        )
    }
}
