//! Registered users, populated from the on-chain address registry feed.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{NodeError, StorageError};
use crate::ethereum::normalize_address;
use crate::storage::KvStore;
use crate::types::Hash32;

const USER_PREFIX: &str = "user/";
/// `user_seq/<position>` -> address, in feed order.
const ORDER_PREFIX: &str = "user_seq/";
const CURSOR_KEY: &[u8] = b"meta/user_feed_cursor";

/// One registration event from the address registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub address: String,
    /// Block timestamp of the registration. Informational; ordering comes
    /// from the feed position.
    pub registered_at: u64,
    /// Identity commitment published alongside the registration, admitted
    /// to the open group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_commitment: Option<Hash32>,
}

/// Read-only, append-only log of registration events.
///
/// The feed numbers its records `0, 1, 2, ..` and never reorders them, so
/// every node that reads it derives the same registration order.
#[async_trait]
pub trait AddressFeed: Send + Sync {
    /// Records at positions `>= position`, in position order.
    async fn fetch_since(&self, position: u64) -> Result<Vec<UserRecord>, NodeError>;
}

/// Feed backed by an in-process list; registrations are pushed by the
/// embedding application or by tests.
#[derive(Debug, Default)]
pub struct MemoryAddressFeed {
    records: RwLock<Vec<UserRecord>>,
}

impl MemoryAddressFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: UserRecord) {
        self.records.write().push(record);
    }
}

#[async_trait]
impl AddressFeed for MemoryAddressFeed {
    async fn fetch_since(&self, position: u64) -> Result<Vec<UserRecord>, NodeError> {
        let records = self.records.read();
        let start = usize::try_from(position).map_or(records.len(), |p| p.min(records.len()));
        Ok(records[start..].to_vec())
    }
}

/// `address -> UserRecord` lookup kept current by polling an [`AddressFeed`].
pub struct UserRegistry {
    store: Arc<dyn KvStore>,
    feed: Arc<dyn AddressFeed>,
    sync_lock: Mutex<()>,
}

impl UserRegistry {
    pub fn new(store: Arc<dyn KvStore>, feed: Arc<dyn AddressFeed>) -> Self {
        Self {
            store,
            feed,
            sync_lock: Mutex::new(()),
        }
    }

    fn user_key(address: &str) -> Vec<u8> {
        format!("{USER_PREFIX}{address}").into_bytes()
    }

    fn order_key(position: u64) -> Vec<u8> {
        format!("{ORDER_PREFIX}{position:016x}").into_bytes()
    }

    fn cursor(&self) -> Result<u64, StorageError> {
        match self.store.get(CURSOR_KEY)? {
            Some(bytes) => {
                let array: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StorageError::Corrupt {
                        key: String::from_utf8_lossy(CURSOR_KEY).into_owned(),
                        reason: "cursor is not 8 bytes".to_string(),
                    }
                })?;
                Ok(u64::from_be_bytes(array))
            }
            None => Ok(0),
        }
    }

    /// Pulls new registrations from the feed. Returns how many were new.
    ///
    /// A feed failure leaves the registry untouched. An address registered
    /// twice keeps its first record and position.
    ///
    /// # Errors
    /// Returns [`NodeError::Feed`] if the feed fails and
    /// [`NodeError::Storage`] if persisting a record fails.
    pub async fn sync(&self) -> Result<usize, NodeError> {
        let _guard = self.sync_lock.lock().await;
        let since = self.cursor()?;
        let records = self.feed.fetch_since(since).await?;
        debug!("Address feed returned {} records from position {}", records.len(), since);

        let mut added = 0;
        let mut position = since;
        for record in records {
            let at = position;
            position += 1;
            let address = match normalize_address(&record.address) {
                Ok(address) => address,
                Err(e) => {
                    warn!("Ignoring registration with bad address '{}': {}", record.address, e);
                    continue;
                }
            };
            let normalized = UserRecord { address, ..record };
            let bytes = serde_json::to_vec(&normalized)
                .map_err(|e| StorageError::Backend(format!("failed to encode user: {e}")))?;
            let user_key = Self::user_key(&normalized.address);
            let writes = [
                (user_key.clone(), bytes),
                (Self::order_key(at), normalized.address.into_bytes()),
            ];
            if self.store.put_all_if_absent(&user_key, &writes)? {
                added += 1;
            }
        }
        self.store.put(CURSOR_KEY, &position.to_be_bytes())?;

        if added > 0 {
            info!("Registered {} new users (feed position {})", added, position);
        }
        Ok(added)
    }

    /// # Errors
    /// Returns [`NodeError::Storage`] if the lookup fails.
    pub fn get(&self, address: &str) -> Result<Option<UserRecord>, NodeError> {
        let Ok(address) = normalize_address(address) else {
            return Ok(None);
        };
        match self.store.get(&Self::user_key(&address))? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                NodeError::Storage(StorageError::Corrupt {
                    key: address,
                    reason: e.to_string(),
                })
            }),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns [`NodeError::Storage`] if the lookup fails.
    pub fn is_registered(&self, address: &str) -> Result<bool, NodeError> {
        match normalize_address(address) {
            Ok(address) => Ok(self.store.exists(&Self::user_key(&address))?),
            Err(_) => Ok(false),
        }
    }

    /// All registered users in feed order.
    ///
    /// # Errors
    /// Returns [`NodeError::Storage`] if the scan fails or an order entry
    /// points at a missing user.
    pub fn users(&self) -> Result<Vec<UserRecord>, NodeError> {
        let mut users = Vec::new();
        for item in self.store.iterate(ORDER_PREFIX.as_bytes()) {
            let (key, address) = item?;
            let corrupt = |reason: String| StorageError::Corrupt {
                key: String::from_utf8_lossy(&key).into_owned(),
                reason,
            };
            let address = String::from_utf8(address).map_err(|e| corrupt(e.to_string()))?;
            let record = self
                .get(&address)?
                .ok_or_else(|| corrupt(format!("no user record for {address}")))?;
            users.push(record);
        }
        Ok(users)
    }

    /// Identity commitments of registered users, in feed order.
    ///
    /// # Errors
    /// Returns [`NodeError::Storage`] if the scan fails.
    pub fn identity_commitments(&self) -> Result<Vec<Hash32>, NodeError> {
        Ok(self
            .users()?
            .into_iter()
            .filter_map(|user| user.identity_commitment)
            .collect())
    }
}
