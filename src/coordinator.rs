//! The single path by which messages enter storage.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::content::{ContentStore, InsertResult};
use crate::error::NodeError;
use crate::gateway::MessageHandler;
use crate::groups::RegistryEvent;
use crate::types::{Envelope, GroupId, Hash32, Message, Proof};
use crate::verifier::{ProofVerifier, RejectReason, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
    Rejected(RejectReason),
}

/// Everything observers of a node may react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    NewMessageCreated { message: Message },
    AlreadyExists { hash: Hash32 },
    Rejected { hash: Hash32, reason: RejectReason },
    GroupSynced { group_id: GroupId, added: usize, root: Hash32 },
}

impl From<RegistryEvent> for NodeEvent {
    fn from(event: RegistryEvent) -> Self {
        match event {
            RegistryEvent::Synced {
                group_id,
                added,
                root,
            } => NodeEvent::GroupSynced {
                group_id,
                added,
                root,
            },
        }
    }
}

pub struct IngestionCoordinator {
    content: Arc<ContentStore>,
    verifier: Arc<ProofVerifier>,
    events: broadcast::Sender<NodeEvent>,
}

impl IngestionCoordinator {
    pub fn new(
        content: Arc<ContentStore>,
        verifier: Arc<ProofVerifier>,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            content,
            verifier,
            events,
        }
    }

    fn emit(&self, event: NodeEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Verifies and stores one message.
    ///
    /// A message already in storage is reported as `AlreadyExists` without
    /// re-verification. Rejections are outcomes, not errors.
    ///
    /// # Errors
    /// Returns [`NodeError::Storage`] if the store fails and
    /// [`NodeError::Task`] if the verification task panics.
    pub async fn insert(&self, message: Message, proof: Proof) -> Result<InsertOutcome, NodeError> {
        let hash = message.hash();
        if self.content.contains(message.message_type(), &hash)? {
            debug!("{} {} already stored", message.message_type(), hash);
            self.emit(NodeEvent::AlreadyExists { hash });
            return Ok(InsertOutcome::AlreadyExists);
        }

        let verifier = Arc::clone(&self.verifier);
        let (message, proof, verdict) = tokio::task::spawn_blocking(move || {
            let verdict = verifier.verify(&message, &proof);
            (message, proof, verdict)
        })
        .await?;

        if let Verdict::Reject(reason) = verdict? {
            info!("Rejected {} {}: {}", message.message_type(), hash, reason);
            self.emit(NodeEvent::Rejected { hash, reason });
            return Ok(InsertOutcome::Rejected(reason));
        }

        match self.content.insert(&message, &proof)? {
            InsertResult::Inserted => {
                info!("Stored {} {}", message.message_type(), hash);
                self.emit(NodeEvent::NewMessageCreated { message });
                Ok(InsertOutcome::Inserted)
            }
            InsertResult::AlreadyExists => {
                self.emit(NodeEvent::AlreadyExists { hash });
                Ok(InsertOutcome::AlreadyExists)
            }
        }
    }

    /// Decodes a wire envelope and inserts it.
    ///
    /// # Errors
    /// Returns [`NodeError::MalformedMessage`] for undecodable bytes, otherwise
    /// as [`IngestionCoordinator::insert`].
    pub async fn insert_encoded(&self, bytes: &[u8]) -> Result<InsertOutcome, NodeError> {
        let (message, proof) = Envelope::decode(bytes)?.into_parts();
        self.insert(message, proof).await
    }

    /// Re-emits registry events as [`NodeEvent`]s until the registry closes.
    pub fn forward_registry_events(
        self: &Arc<Self>,
        mut registry_events: broadcast::Receiver<RegistryEvent>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match registry_events.recv().await {
                    Ok(event) => coordinator.emit(event.into()),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Dropped {} registry events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[async_trait]
impl MessageHandler for IngestionCoordinator {
    async fn handle(&self, message: Message, proof: Proof) {
        let hash = message.hash();
        match self.insert(message, proof).await {
            Ok(outcome) => debug!("Delivery of {} ended as {:?}", hash, outcome),
            Err(e) => error!("Failed to ingest {}: {}", hash, e),
        }
    }
}
