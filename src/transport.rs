//! Publish/subscribe transport contract and an in-process implementation.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::error::{NodeError, TransportError};
use crate::ethereum::normalize_address;
use crate::types::{GroupId, Hash32};

pub const TOPIC_PREFIX: &str = "/zkitter/1";

/// Pubsub topic a message is published on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every message.
    All,
    /// Messages created by one address (normalized).
    User(String),
    /// Messages referencing one message hash.
    Thread(Hash32),
    /// Anonymous messages proven against one group.
    Group(GroupId),
}

impl Topic {
    /// # Errors
    /// Returns [`NodeError::MalformedMessage`] for an invalid address.
    pub fn user(address: &str) -> Result<Self, NodeError> {
        normalize_address(address).map(Topic::User)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::All => write!(f, "{TOPIC_PREFIX}/all"),
            Topic::User(address) => write!(f, "{TOPIC_PREFIX}/user_{address}"),
            Topic::Thread(hash) => write!(f, "{TOPIC_PREFIX}/thread_{hash}"),
            Topic::Group(group_id) => write!(f, "{TOPIC_PREFIX}/group_{group_id}"),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &Topic, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Live payloads published on `topic` after the call.
    async fn subscribe(&self, topic: &Topic)
        -> Result<BoxStream<'static, Vec<u8>>, TransportError>;

    /// Up to `limit` of the most recent stored payloads, oldest first.
    async fn query(&self, topic: &Topic, limit: usize) -> Result<Vec<Vec<u8>>, TransportError>;
}

struct TopicState {
    sender: broadcast::Sender<Vec<u8>>,
    history: VecDeque<Vec<u8>>,
}

/// Single-process transport: a broadcast channel plus bounded history per
/// topic. Slow subscribers skip what they missed.
pub struct MemoryTransport {
    topics: Mutex<HashMap<String, TopicState>>,
    history_limit: usize,
    channel_capacity: usize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(1024, 256)
    }
}

impl MemoryTransport {
    #[must_use]
    pub fn new(history_limit: usize, channel_capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            history_limit,
            channel_capacity: channel_capacity.max(1),
        }
    }

    fn with_topic<R>(&self, topic: &Topic, f: impl FnOnce(&mut TopicState) -> R) -> R {
        let mut topics = self.topics.lock();
        let state = topics.entry(topic.to_string()).or_insert_with(|| TopicState {
            sender: broadcast::channel(self.channel_capacity).0,
            history: VecDeque::new(),
        });
        f(state)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &Topic, payload: Vec<u8>) -> Result<(), TransportError> {
        let history_limit = self.history_limit;
        let receivers = self.with_topic(topic, |state| {
            if history_limit > 0 {
                if state.history.len() == history_limit {
                    state.history.pop_front();
                }
                state.history.push_back(payload.clone());
            }
            // Err only means nobody is listening.
            state.sender.send(payload).unwrap_or(0)
        });
        debug!("Published to {} ({} live subscribers)", topic, receivers);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &Topic,
    ) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
        let receiver = self.with_topic(topic, |state| state.sender.subscribe());
        let name = topic.to_string();
        let payloads = stream::unfold((receiver, name), |(mut receiver, name)| async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => return Some((payload, (receiver, name))),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Subscriber on {} lagged, skipped {} payloads", name, skipped);
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(payloads.boxed())
    }

    async fn query(&self, topic: &Topic, limit: usize) -> Result<Vec<Vec<u8>>, TransportError> {
        Ok(self.with_topic(topic, |state| {
            let skip = state.history.len().saturating_sub(limit);
            state.history.iter().skip(skip).cloned().collect()
        }))
    }
}
