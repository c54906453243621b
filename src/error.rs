//! Error taxonomy for the node.
//!
//! Verification rejections are not errors: they are reported as
//! [`RejectReason`](crate::verifier::RejectReason) values and surfaced as events.
//! Everything in here is either fatal to a single item (`MalformedMessage`),
//! retryable (`GroupSync`, `Feed`, `Transport`) or a hard infrastructure
//! failure that the direct caller must see (`Storage`).

use thiserror::Error;

use crate::types::GroupId;

/// Errors raised by a [`KvStore`](crate::storage::KvStore) backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("corrupt record at key '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<sled::Error> for StorageError {
    fn from(e: sled::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

/// Errors raised by a pubsub [`Transport`](crate::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("query on {topic} failed: {reason}")]
    Query { topic: String, reason: String },
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("sync of group {group_id} failed: {reason}")]
    GroupSync { group_id: GroupId, reason: String },

    #[error("unknown group: {0}")]
    UnknownGroup(GroupId),

    #[error("group already registered: {0}")]
    DuplicateGroup(GroupId),

    #[error("identity is not a member of group {0}")]
    NotAMember(GroupId),

    #[error("group {0} is full")]
    GroupFull(GroupId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("address feed failed: {0}")]
    Feed(String),

    #[error("proof generation failed: {0}")]
    Proving(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("system clock unavailable: {0}")]
    Clock(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl NodeError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodeError::GroupSync { .. } | NodeError::Feed(_) | NodeError::Transport(_)
        )
    }
}
