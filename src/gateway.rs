//! Replication over pubsub.
//!
//! The gateway turns transport payloads into `(Message, Proof)` deliveries for
//! a [`MessageHandler`] and publishes locally authored messages. It never
//! stores anything itself: every delivery goes through the handler, which in
//! a node is the ingestion coordinator.

use std::sync::Arc;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use futures::stream::{select_all, BoxStream, StreamExt};
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::circuit::{GroupProofSystem, MembershipWitness};
use crate::error::NodeError;
use crate::ethereum::address_to_string;
use crate::groups::GroupRegistry;
use crate::identity::Identity;
use crate::transport::{Topic, Transport};
use crate::types::{
    Envelope, GroupId, GroupProof, Hash32, Message, MessageKind, PostKind, Proof, PublicSignals,
    SignatureProof,
};
use crate::utils::{sha3_concat, unix_millis};

const EXTERNAL_NULLIFIER_DOMAIN: &[u8] = b"zkitter/external-nullifier";

/// Receives every decoded message the gateway delivers.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message, proof: Proof);
}

#[async_trait]
impl MessageHandler for mpsc::UnboundedSender<(Message, Proof)> {
    async fn handle(&self, message: Message, proof: Proof) {
        if self.send((message, proof)).is_err() {
            debug!("Delivery channel closed, dropping message");
        }
    }
}

/// Handle to a running subscription. Dropping it also cancels.
pub struct Subscription {
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Stops delivery and waits for an in-flight handler call to finish.
    pub async fn cancel(mut self) {
        self.signal();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Subscription task ended abnormally: {}", e);
            }
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn signal(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            // The task may already be gone.
            let _ = cancel.send(());
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.signal();
    }
}

/// Content of a message to be authored locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub kind: MessageKind,
    pub content: String,
    pub reference: Option<Hash32>,
}

impl Draft {
    pub fn new(kind: MessageKind, content: impl Into<String>, reference: Option<Hash32>) -> Self {
        Self {
            kind,
            content: content.into(),
            reference,
        }
    }

    pub fn post(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Post(PostKind::Default), content, None)
    }

    pub fn reply(content: impl Into<String>, parent: Hash32) -> Self {
        Self::new(MessageKind::Post(PostKind::Default), content, Some(parent))
    }
}

/// Who signs a locally authored message.
#[derive(Debug, Clone)]
pub enum Author {
    Wallet(LocalWallet),
    Anonymous {
        identity: Identity,
        group_id: GroupId,
        /// Overrides [`default_external_nullifier`].
        external_nullifier: Option<Hash32>,
    },
}

/// A message authored and published by this node.
#[derive(Debug, Clone)]
pub struct Published {
    pub message: Message,
    pub proof: Proof,
}

impl Published {
    #[must_use]
    pub fn envelope(&self) -> Envelope {
        Envelope::new(self.message.clone(), self.proof.clone())
    }
}

/// Scope an anonymous author's nullifier is derived for.
///
/// Moderations are scoped to the moderated message and connections to their
/// target, so one identity gets one such action per target. Posts and
/// profile updates are scoped to their own hash.
#[must_use]
pub fn default_external_nullifier(message: &Message) -> Hash32 {
    let type_tag = message.message_type().as_str().as_bytes();
    let scope = match message.kind() {
        MessageKind::Moderation(_) => message
            .reference()
            .map(|target| sha3_concat(&[EXTERNAL_NULLIFIER_DOMAIN, type_tag, target.as_bytes()])),
        MessageKind::Connection(_) => Some(sha3_concat(&[
            EXTERNAL_NULLIFIER_DOMAIN,
            type_tag,
            message.content().trim().to_lowercase().as_bytes(),
        ])),
        MessageKind::Post(_) | MessageKind::Profile(_) => None,
    };
    Hash32(scope.unwrap_or_else(|| {
        sha3_concat(&[EXTERNAL_NULLIFIER_DOMAIN, type_tag, message.hash().as_bytes()])
    }))
}

/// Topics a message is published on.
#[must_use]
pub fn topics_for(message: &Message, group_id: Option<&GroupId>) -> Vec<Topic> {
    let mut topics = vec![Topic::All];
    if message.is_anonymous() {
        if let Some(group_id) = group_id {
            topics.push(Topic::Group(group_id.clone()));
        }
    } else {
        topics.push(Topic::User(message.creator().to_string()));
    }
    if let Some(reference) = message.reference() {
        topics.push(Topic::Thread(*reference));
    }
    topics
}

async fn deliver(handler: &dyn MessageHandler, topic: &str, payload: &[u8]) -> bool {
    match Envelope::decode(payload) {
        Ok(envelope) => {
            let (message, proof) = envelope.into_parts();
            handler.handle(message, proof).await;
            true
        }
        Err(e) => {
            warn!("Dropping malformed payload from {}: {}", topic, e);
            false
        }
    }
}

pub struct PubsubGateway {
    transport: Arc<dyn Transport>,
    groups: Arc<GroupRegistry>,
    proof_system: Arc<dyn GroupProofSystem>,
    query_limit: usize,
}

impl PubsubGateway {
    pub fn new(
        transport: Arc<dyn Transport>,
        groups: Arc<GroupRegistry>,
        proof_system: Arc<dyn GroupProofSystem>,
        query_limit: usize,
    ) -> Self {
        Self {
            transport,
            groups,
            proof_system,
            query_limit,
        }
    }

    async fn query_topic(
        &self,
        topic: &Topic,
        handler: &dyn MessageHandler,
    ) -> Result<usize, NodeError> {
        let payloads = self.transport.query(topic, self.query_limit).await?;
        let name = topic.to_string();
        let mut delivered = 0;
        for payload in &payloads {
            if deliver(handler, &name, payload).await {
                delivered += 1;
            }
        }
        debug!("Query on {} delivered {} of {} payloads", name, delivered, payloads.len());
        Ok(delivered)
    }

    /// Delivers stored messages by `address`. Returns how many were delivered.
    ///
    /// # Errors
    /// Returns [`NodeError::MalformedMessage`] for a bad address and
    /// [`NodeError::Transport`] if the query fails.
    pub async fn query_user(
        &self,
        address: &str,
        handler: &dyn MessageHandler,
    ) -> Result<usize, NodeError> {
        self.query_topic(&Topic::user(address)?, handler).await
    }

    /// # Errors
    /// Returns [`NodeError::Transport`] if the query fails.
    pub async fn query_group(
        &self,
        group_id: &GroupId,
        handler: &dyn MessageHandler,
    ) -> Result<usize, NodeError> {
        self.query_topic(&Topic::Group(group_id.clone()), handler).await
    }

    /// # Errors
    /// Returns [`NodeError::Transport`] if the query fails.
    pub async fn query_all(&self, handler: &dyn MessageHandler) -> Result<usize, NodeError> {
        self.query_topic(&Topic::All, handler).await
    }

    async fn subscribe_topics(
        &self,
        topics: Vec<Topic>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, NodeError> {
        let mut streams: Vec<BoxStream<'static, (String, Vec<u8>)>> = Vec::new();
        for topic in &topics {
            let name = topic.to_string();
            let stream = self.transport.subscribe(topic).await?;
            streams.push(stream.map(move |payload| (name.clone(), payload)).boxed());
        }
        debug!("Subscribed to {} topics", topics.len());

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let mut merged = select_all(streams);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancel_rx => break,
                    next = merged.next() => match next {
                        Some((topic, payload)) => {
                            deliver(handler.as_ref(), &topic, &payload).await;
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(Subscription {
            cancel: Some(cancel_tx),
            task: Some(task),
        })
    }

    /// # Errors
    /// Returns [`NodeError::MalformedMessage`] for a bad address and
    /// [`NodeError::Transport`] if subscribing fails.
    pub async fn subscribe_user(
        &self,
        address: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, NodeError> {
        self.subscribe_users(&[address], handler).await
    }

    /// # Errors
    /// See [`PubsubGateway::subscribe_user`].
    pub async fn subscribe_users(
        &self,
        addresses: &[&str],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, NodeError> {
        let topics = addresses
            .iter()
            .map(|address| Topic::user(address))
            .collect::<Result<Vec<_>, _>>()?;
        self.subscribe_topics(topics, handler).await
    }

    /// # Errors
    /// Returns [`NodeError::Transport`] if subscribing fails.
    pub async fn subscribe_thread(
        &self,
        root: Hash32,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, NodeError> {
        self.subscribe_threads(&[root], handler).await
    }

    /// # Errors
    /// Returns [`NodeError::Transport`] if subscribing fails.
    pub async fn subscribe_threads(
        &self,
        roots: &[Hash32],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, NodeError> {
        let topics = roots.iter().copied().map(Topic::Thread).collect();
        self.subscribe_topics(topics, handler).await
    }

    /// # Errors
    /// Returns [`NodeError::Transport`] if subscribing fails.
    pub async fn subscribe_all(
        &self,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, NodeError> {
        self.subscribe_topics(vec![Topic::All], handler).await
    }

    /// Builds, proves and publishes a message.
    ///
    /// The message is not stored locally; callers feed the result back through
    /// their ingestion path.
    ///
    /// # Errors
    /// Returns [`NodeError::UnknownGroup`] or [`NodeError::NotAMember`] for an
    /// anonymous author outside the group, [`NodeError::Signing`] or
    /// [`NodeError::Proving`] if the proof cannot be produced and
    /// [`NodeError::Transport`] if publishing fails.
    pub async fn write(&self, draft: Draft, author: &Author) -> Result<Published, NodeError> {
        let created_at = unix_millis()?;
        let (message, proof, group_id) = match author {
            Author::Wallet(wallet) => {
                let creator = address_to_string(&wallet.address());
                let message =
                    Message::new(draft.kind, &creator, draft.content, draft.reference, created_at)?;
                let signature = wallet
                    .sign_message(message.hash().as_bytes())
                    .await
                    .map_err(|e| NodeError::Signing(e.to_string()))?;
                let proof = Proof::Signature(SignatureProof {
                    signature: signature.to_string(),
                    address: creator,
                });
                (message, proof, None)
            }
            Author::Anonymous {
                identity,
                group_id,
                external_nullifier,
            } => {
                let message =
                    Message::new(draft.kind, "", draft.content, draft.reference, created_at)?;
                let proof = self
                    .prove_membership(&message, identity, group_id, *external_nullifier)
                    .await?;
                (message, proof, Some(group_id))
            }
        };

        let payload = Envelope::new(message.clone(), proof.clone()).encode()?;
        for topic in topics_for(&message, group_id) {
            self.transport.publish(&topic, payload.clone()).await?;
        }
        debug!("Published {} {}", message.message_type(), message.hash());
        Ok(Published { message, proof })
    }

    async fn prove_membership(
        &self,
        message: &Message,
        identity: &Identity,
        group_id: &GroupId,
        external_nullifier: Option<Hash32>,
    ) -> Result<Proof, NodeError> {
        if self.groups.get(group_id).is_none() {
            return Err(NodeError::UnknownGroup(group_id.clone()));
        }
        let path = self
            .groups
            .merkle_path(&identity.commitment(), group_id)
            .ok_or_else(|| NodeError::NotAMember(group_id.clone()))?;

        let external_nullifier =
            external_nullifier.unwrap_or_else(|| default_external_nullifier(message));
        let signals = PublicSignals {
            root: path.root,
            nullifier: identity.nullifier_for(&external_nullifier),
            external_nullifier,
            signal_hash: message.hash(),
        };
        let witness = MembershipWitness::new(identity.clone(), path);

        let proof_system = Arc::clone(&self.proof_system);
        let zk_proof =
            tokio::task::spawn_blocking(move || proof_system.prove(&witness, &signals)).await??;

        Ok(Proof::Group(GroupProof {
            root: signals.root,
            nullifier: signals.nullifier,
            external_nullifier: signals.external_nullifier,
            zk_proof,
        }))
    }
}
