//! Append-only record of spent `(nullifier, external_nullifier)` pairs per
//! group.

use std::sync::Arc;

use log::debug;

use crate::error::StorageError;
use crate::storage::KvStore;
use crate::types::{GroupId, Hash32};

const NULLIFIER_PREFIX: &str = "nullifier/";

/// Result of [`NullifierLedger::check_and_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullifierStatus {
    /// The pair was unused and is now bound to the message.
    Fresh,
    /// The pair was already bound to this same message.
    SameMessage,
    /// The pair is bound to a different message.
    Reused,
}

pub struct NullifierLedger {
    store: Arc<dyn KvStore>,
}

impl NullifierLedger {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn key(group_id: &GroupId, external_nullifier: &Hash32, nullifier: &Hash32) -> Vec<u8> {
        format!("{NULLIFIER_PREFIX}{group_id}/{external_nullifier}/{nullifier}").into_bytes()
    }

    /// Binds the pair to `message_hash` unless it is already bound.
    ///
    /// Two concurrent callers with the same pair observe exactly one `Fresh`.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the store fails or the existing binding
    /// is unreadable.
    pub fn check_and_record(
        &self,
        group_id: &GroupId,
        nullifier: &Hash32,
        external_nullifier: &Hash32,
        message_hash: &Hash32,
    ) -> Result<NullifierStatus, StorageError> {
        let key = Self::key(group_id, external_nullifier, nullifier);
        if self.store.put_if_absent(&key, message_hash.as_bytes())? {
            debug!("Recorded nullifier {} in group {}", nullifier, group_id);
            return Ok(NullifierStatus::Fresh);
        }

        let existing = self.store.get(&key)?.ok_or_else(|| StorageError::Corrupt {
            key: String::from_utf8_lossy(&key).into_owned(),
            reason: "nullifier vanished after failed insert".to_string(),
        })?;
        if existing.as_slice() == message_hash.as_bytes() {
            Ok(NullifierStatus::SameMessage)
        } else {
            Ok(NullifierStatus::Reused)
        }
    }

    /// Whether the pair has been recorded for `group_id`.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the store fails.
    pub fn is_spent(
        &self,
        group_id: &GroupId,
        nullifier: &Hash32,
        external_nullifier: &Hash32,
    ) -> Result<bool, StorageError> {
        self.store
            .exists(&Self::key(group_id, external_nullifier, nullifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn ledger() -> NullifierLedger {
        NullifierLedger::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_fresh_then_same_then_reused() {
        let ledger = ledger();
        let group = GroupId::from("g");
        let (n, ext) = (Hash32([1; 32]), Hash32([2; 32]));

        assert!(!ledger.is_spent(&group, &n, &ext).unwrap());
        assert_eq!(
            ledger.check_and_record(&group, &n, &ext, &Hash32([9; 32])).unwrap(),
            NullifierStatus::Fresh
        );
        assert!(ledger.is_spent(&group, &n, &ext).unwrap());
        assert_eq!(
            ledger.check_and_record(&group, &n, &ext, &Hash32([9; 32])).unwrap(),
            NullifierStatus::SameMessage
        );
        assert_eq!(
            ledger.check_and_record(&group, &n, &ext, &Hash32([8; 32])).unwrap(),
            NullifierStatus::Reused
        );
    }

    #[test]
    fn test_pairs_are_scoped_by_group_and_external_nullifier() {
        let ledger = ledger();
        let n = Hash32([1; 32]);
        let msg = Hash32([9; 32]);
        let other = Hash32([7; 32]);

        ledger
            .check_and_record(&GroupId::from("a"), &n, &Hash32([2; 32]), &msg)
            .unwrap();
        assert_eq!(
            ledger
                .check_and_record(&GroupId::from("b"), &n, &Hash32([2; 32]), &other)
                .unwrap(),
            NullifierStatus::Fresh
        );
        assert_eq!(
            ledger
                .check_and_record(&GroupId::from("a"), &n, &Hash32([3; 32]), &other)
                .unwrap(),
            NullifierStatus::Fresh
        );
    }

    #[test]
    fn test_concurrent_record_single_fresh() {
        let ledger = Arc::new(ledger());
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    ledger
                        .check_and_record(
                            &GroupId::from("g"),
                            &Hash32([1; 32]),
                            &Hash32([2; 32]),
                            &Hash32([i; 32]),
                        )
                        .unwrap()
                })
            })
            .collect();
        let statuses: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(
            statuses.iter().filter(|s| **s == NullifierStatus::Fresh).count(),
            1
        );
        assert_eq!(
            statuses.iter().filter(|s| **s == NullifierStatus::Reused).count(),
            7
        );
    }
}
