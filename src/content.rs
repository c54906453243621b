//! Content-addressed message storage.
//!
//! Each message type lives in its own partition of the key space:
//!
//! ```text
//! <type>/msg/<hash>                 -> StoredMessage (json)
//! <type>/log/<seq>                  -> hash   insertion order
//! <type>/creator/<address>/<seq>    -> hash   non-anonymous messages only
//! <type>/ref/<hash>/<seq>           -> hash   replies and moderation targets
//! <type>/meta/next_seq              -> u64 (big endian)
//! ```
//!
//! Sequence numbers are written as fixed-width hex so key order equals
//! insertion order. Entries are never mutated or deleted.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage::{KvPair, KvStore};
use crate::types::{Hash32, Message, MessageType, Proof};

/// Outcome of a dedup insert. `AlreadyExists` is a normal result signalling
/// idempotent re-delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    AlreadyExists,
}

/// A persisted message with its proof and partition sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub seq: u64,
    pub message: Message,
    pub proof: Proof,
}

impl StoredMessage {
    #[must_use]
    pub fn hash(&self) -> Hash32 {
        self.message.hash()
    }
}

/// Opaque pagination cursor into a partition's insertion order.
///
/// Cursors stay valid while new messages are appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor(u64);

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Cursor {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Cursor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub items: Vec<StoredMessage>,
    /// Cursor for the following page, `None` when nothing remains.
    pub next: Option<Cursor>,
}

struct Partition {
    message_type: MessageType,
    /// Serializes inserts; holds the next sequence number.
    next_seq: Mutex<u64>,
}

impl Partition {
    fn key(&self, suffix: &str) -> Vec<u8> {
        format!("{}/{}", self.message_type.as_str(), suffix).into_bytes()
    }

    fn msg_key(&self, hash: &Hash32) -> Vec<u8> {
        self.key(&format!("msg/{hash}"))
    }
}

fn seq_suffix(seq: u64) -> String {
    format!("{seq:016x}")
}

fn parse_seq(key: &[u8]) -> Option<u64> {
    let key = std::str::from_utf8(key).ok()?;
    let (_, seq) = key.rsplit_once('/')?;
    u64::from_str_radix(seq, 16).ok()
}

fn corrupt(key: &[u8], reason: impl fmt::Display) -> StorageError {
    StorageError::Corrupt {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: reason.to_string(),
    }
}

/// Type-partitioned, content-addressed store with secondary indices.
pub struct ContentStore {
    store: Arc<dyn KvStore>,
    partitions: Vec<Partition>,
}

impl ContentStore {
    /// Opens the partitions on `store`, resuming sequence numbers.
    ///
    /// # Errors
    /// Returns [`StorageError`] if the persisted counters cannot be read.
    pub fn open(store: Arc<dyn KvStore>) -> Result<Self, StorageError> {
        let mut partitions = Vec::with_capacity(MessageType::ALL.len());
        for message_type in MessageType::ALL {
            let meta_key = format!("{}/meta/next_seq", message_type.as_str()).into_bytes();
            let next_seq = match store.get(&meta_key)? {
                Some(bytes) => {
                    let array: [u8; 8] = bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| corrupt(&meta_key, "sequence counter is not 8 bytes"))?;
                    u64::from_be_bytes(array)
                }
                None => 0,
            };
            debug!("Opened {} partition at seq {}", message_type, next_seq);
            partitions.push(Partition {
                message_type,
                next_seq: Mutex::new(next_seq),
            });
        }
        Ok(Self { store, partitions })
    }

    fn partition(&self, message_type: MessageType) -> &Partition {
        let index = match message_type {
            MessageType::Post => 0,
            MessageType::Moderation => 1,
            MessageType::Connection => 2,
            MessageType::Profile => 3,
        };
        &self.partitions[index]
    }

    /// Atomically stores `(message, proof)` unless its hash is already present.
    ///
    /// The entry, its indices and the advanced sequence counter are one
    /// conditional batch: either all of them are written or none are. On
    /// `AlreadyExists` or an error the sequence number is not consumed.
    ///
    /// # Errors
    /// Returns [`StorageError`] if the backend fails.
    pub fn insert(&self, message: &Message, proof: &Proof) -> Result<InsertResult, StorageError> {
        let partition = self.partition(message.message_type());
        let hash = message.hash();
        let hash_value = hash.to_hex();

        let mut next_seq = partition.next_seq.lock();
        let seq = *next_seq;
        let entry = StoredMessage {
            seq,
            message: message.clone(),
            proof: proof.clone(),
        };
        let bytes = serde_json::to_vec(&entry)
            .map_err(|e| StorageError::Backend(format!("failed to encode entry: {e}")))?;

        let msg_key = partition.msg_key(&hash);
        let suffix = seq_suffix(seq);
        let mut writes: Vec<KvPair> = vec![
            (msg_key.clone(), bytes),
            (
                partition.key(&format!("log/{suffix}")),
                hash_value.as_bytes().to_vec(),
            ),
        ];
        if !message.is_anonymous() {
            writes.push((
                partition.key(&format!("creator/{}/{suffix}", message.creator())),
                hash_value.as_bytes().to_vec(),
            ));
        }
        if let Some(reference) = message.reference() {
            writes.push((
                partition.key(&format!("ref/{reference}/{suffix}")),
                hash_value.as_bytes().to_vec(),
            ));
        }
        writes.push((
            partition.key("meta/next_seq"),
            (seq + 1).to_be_bytes().to_vec(),
        ));

        if !self.store.put_all_if_absent(&msg_key, &writes)? {
            debug!("{} {} already stored", partition.message_type, hash);
            return Ok(InsertResult::AlreadyExists);
        }
        *next_seq = seq + 1;

        debug!("Stored {} {} at seq {}", partition.message_type, hash, seq);
        Ok(InsertResult::Inserted)
    }

    /// # Errors
    /// Returns [`StorageError`] if the backend fails.
    pub fn contains(&self, message_type: MessageType, hash: &Hash32) -> Result<bool, StorageError> {
        self.store
            .exists(&self.partition(message_type).msg_key(hash))
    }

    /// # Errors
    /// Returns [`StorageError`] if the backend fails or the entry is corrupt.
    pub fn get(
        &self,
        message_type: MessageType,
        hash: &Hash32,
    ) -> Result<Option<StoredMessage>, StorageError> {
        let key = self.partition(message_type).msg_key(hash);
        match self.store.get(&key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| corrupt(&key, e)),
            None => Ok(None),
        }
    }

    /// Looks a hash up across all partitions.
    ///
    /// # Errors
    /// Returns [`StorageError`] if the backend fails.
    pub fn find(&self, hash: &Hash32) -> Result<Option<StoredMessage>, StorageError> {
        for message_type in MessageType::ALL {
            if let Some(found) = self.get(message_type, hash)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Messages of one type in insertion order.
    ///
    /// # Errors
    /// Returns [`StorageError`] if the backend fails.
    pub fn list(
        &self,
        message_type: MessageType,
        limit: usize,
        cursor: Option<Cursor>,
    ) -> Result<Page, StorageError> {
        self.page(message_type, "log/".to_string(), limit, cursor)
    }

    /// Messages authored by `address`, in insertion order.
    ///
    /// # Errors
    /// Returns [`StorageError`] if the backend fails.
    pub fn list_by_creator(
        &self,
        message_type: MessageType,
        address: &str,
        limit: usize,
        cursor: Option<Cursor>,
    ) -> Result<Page, StorageError> {
        self.page(message_type, format!("creator/{address}/"), limit, cursor)
    }

    /// Messages whose reference is `hash` (thread replies, moderations of a
    /// message), in insertion order.
    ///
    /// # Errors
    /// Returns [`StorageError`] if the backend fails.
    pub fn list_by_reference(
        &self,
        message_type: MessageType,
        hash: &Hash32,
        limit: usize,
        cursor: Option<Cursor>,
    ) -> Result<Page, StorageError> {
        self.page(message_type, format!("ref/{hash}/"), limit, cursor)
    }

    /// # Errors
    /// Returns [`StorageError`] if the backend fails.
    pub fn count_by_reference(
        &self,
        message_type: MessageType,
        hash: &Hash32,
    ) -> Result<usize, StorageError> {
        let prefix = self.partition(message_type).key(&format!("ref/{hash}/"));
        let mut count = 0;
        for item in self.store.iterate(&prefix) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    fn page(
        &self,
        message_type: MessageType,
        index: String,
        limit: usize,
        cursor: Option<Cursor>,
    ) -> Result<Page, StorageError> {
        let partition = self.partition(message_type);
        let prefix = partition.key(&index);
        let start = match cursor {
            Some(cursor) => partition.key(&format!("{index}{}", seq_suffix(cursor.0))),
            None => prefix.clone(),
        };

        let mut items = Vec::with_capacity(limit.min(256));
        let mut next = None;
        for item in self.store.iterate_from(&prefix, &start) {
            let (key, value) = item?;
            let Some(seq) = parse_seq(&key) else {
                warn!("Skipping index key with bad sequence: {}", String::from_utf8_lossy(&key));
                continue;
            };
            if items.len() == limit {
                next = Some(Cursor(seq));
                break;
            }
            let hash: Hash32 = std::str::from_utf8(&value)
                .map_err(|e| corrupt(&key, e))?
                .parse()
                .map_err(|e| corrupt(&key, e))?;
            match self.get(message_type, &hash)? {
                Some(stored) => items.push(stored),
                None => return Err(corrupt(&key, format!("dangling index entry for {hash}"))),
            }
        }
        Ok(Page { items, next })
    }
}
