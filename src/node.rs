//! Composition root: wires storage, registries, verification, ingestion and
//! replication into a [`Node`].

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::circuit::{GroupProofSystem, Halo2ProofSystem};
use crate::config::Config;
use crate::content::ContentStore;
use crate::coordinator::{IngestionCoordinator, InsertOutcome, NodeEvent};
use crate::error::NodeError;
use crate::gateway::{Author, Draft, MessageHandler, Published, PubsubGateway, Subscription};
use crate::groups::{
    GroupAdapter, GroupRegistry, HttpMembershipSource, OpenGroup, ReputationGroup, StaticGroup,
    SyncReport,
};
use crate::merkle::{MerklePath, MAX_TREE_DEPTH};
use crate::nullifier::NullifierLedger;
use crate::storage::{KvStore, MemoryStore, SledStore};
use crate::transport::{MemoryTransport, Transport};
use crate::types::{Envelope, GroupId, Hash32, Message, Proof};
use crate::users::{AddressFeed, MemoryAddressFeed, UserRegistry};
use crate::verifier::{ProofVerifier, VerifierSettings};

/// Builds a [`Node`]; every collaborator not supplied falls back to the
/// configured default.
pub struct NodeBuilder {
    config: Config,
    store: Option<Arc<dyn KvStore>>,
    transport: Option<Arc<dyn Transport>>,
    address_feed: Option<Arc<dyn AddressFeed>>,
    proof_system: Option<Arc<dyn GroupProofSystem>>,
    groups: Vec<Arc<dyn GroupAdapter>>,
}

impl NodeBuilder {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            transport: None,
            address_feed: None,
            proof_system: None,
            groups: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn with_address_feed(mut self, feed: Arc<dyn AddressFeed>) -> Self {
        self.address_feed = Some(feed);
        self
    }

    #[must_use]
    pub fn with_proof_system(mut self, proof_system: Arc<dyn GroupProofSystem>) -> Self {
        self.proof_system = Some(proof_system);
        self
    }

    /// Registers an additional group next to the configured ones.
    #[must_use]
    pub fn with_group(mut self, group: Arc<dyn GroupAdapter>) -> Self {
        self.groups.push(group);
        self
    }

    fn configured_groups(
        config: &Config,
        users: &Arc<UserRegistry>,
    ) -> Result<Vec<Arc<dyn GroupAdapter>>, NodeError> {
        let depth = config.groups.tree_depth;
        if depth == 0 || depth > MAX_TREE_DEPTH {
            return Err(NodeError::Config(format!(
                "groups.tree_depth must be between 1 and {MAX_TREE_DEPTH}, got {depth}"
            )));
        }
        let mut groups: Vec<Arc<dyn GroupAdapter>> = Vec::new();

        if config.groups.open_group_enabled {
            groups.push(Arc::new(OpenGroup::new(
                config.groups.open_group_id.clone(),
                depth,
                Arc::clone(users),
            )));
        }
        for group in &config.groups.static_groups {
            groups.push(Arc::new(StaticGroup::new(
                group.id.clone(),
                depth,
                group.members.iter().copied(),
            )?));
        }
        for group in &config.groups.reputation_groups {
            let source = HttpMembershipSource::new(
                group.source_url.clone(),
                Duration::from_secs(group.timeout_secs),
            )?;
            groups.push(Arc::new(ReputationGroup::new(
                group.provider.clone(),
                group.tier.clone(),
                depth,
                Arc::new(source),
            )));
        }
        Ok(groups)
    }

    /// Assembles the node. Must run inside a tokio runtime.
    ///
    /// # Errors
    /// Returns [`NodeError::Storage`] if the store cannot be opened,
    /// [`NodeError::Proving`] if proving keys cannot be generated,
    /// [`NodeError::Config`] if the tree depth is out of range and
    /// [`NodeError::DuplicateGroup`] if two groups share an id.
    pub async fn build(self) -> Result<Node, NodeError> {
        let config = self.config;

        let store: Arc<dyn KvStore> = match (self.store, &config.storage.path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(SledStore::open(path)?),
            (None, None) => Arc::new(MemoryStore::new()),
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(MemoryTransport::new(
                config.transport.history_limit,
                config.transport.channel_capacity,
            )),
        };
        let feed: Arc<dyn AddressFeed> = match self.address_feed {
            Some(feed) => feed,
            None => Arc::new(MemoryAddressFeed::new()),
        };
        let proof_system: Arc<dyn GroupProofSystem> = match self.proof_system {
            Some(proof_system) => proof_system,
            None => {
                let k = config.verification.circuit_k;
                Arc::new(tokio::task::spawn_blocking(move || Halo2ProofSystem::new(k)).await??)
            }
        };

        let content = Arc::new(ContentStore::open(Arc::clone(&store))?);
        let users = Arc::new(UserRegistry::new(Arc::clone(&store), feed));
        let groups = Arc::new(GroupRegistry::new());
        for group in Self::configured_groups(&config, &users)?
            .into_iter()
            .chain(self.groups)
        {
            groups.add_group(group)?;
        }

        let verifier = Arc::new(ProofVerifier::new(
            Arc::clone(&groups),
            Arc::clone(&users),
            NullifierLedger::new(Arc::clone(&store)),
            Arc::clone(&proof_system),
            VerifierSettings {
                require_registration: config.verification.require_registration,
                max_zk_proof_size: config.verification.max_zk_proof_size,
            },
        ));
        let coordinator = Arc::new(IngestionCoordinator::new(
            Arc::clone(&content),
            verifier,
            config.events.capacity,
        ));
        let forwarder = coordinator.forward_registry_events(groups.subscribe_events());
        let gateway = PubsubGateway::new(
            transport,
            Arc::clone(&groups),
            proof_system,
            config.transport.query_limit,
        );

        info!("Node ready with groups {:?}", groups.group_ids());
        Ok(Node {
            config,
            store,
            content,
            users,
            groups,
            coordinator,
            gateway,
            tasks: Mutex::new(vec![forwarder]),
            replication: Mutex::new(None),
        })
    }
}

/// A running protocol node.
pub struct Node {
    config: Config,
    store: Arc<dyn KvStore>,
    content: Arc<ContentStore>,
    users: Arc<UserRegistry>,
    groups: Arc<GroupRegistry>,
    coordinator: Arc<IngestionCoordinator>,
    gateway: PubsubGateway,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    replication: Mutex<Option<Subscription>>,
}

impl Node {
    /// Builds a node with every collaborator taken from `config`.
    ///
    /// # Errors
    /// See [`NodeBuilder::build`].
    pub async fn initialize(config: Config) -> Result<Self, NodeError> {
        NodeBuilder::new(config).build().await
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    #[must_use]
    pub fn users(&self) -> &UserRegistry {
        &self.users
    }

    #[must_use]
    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    #[must_use]
    pub fn gateway(&self) -> &PubsubGateway {
        &self.gateway
    }

    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.coordinator.events()
    }

    fn handler(&self) -> Arc<dyn MessageHandler> {
        Arc::clone(&self.coordinator) as Arc<dyn MessageHandler>
    }

    /// # Errors
    /// See [`IngestionCoordinator::insert`].
    pub async fn insert(&self, message: Message, proof: Proof) -> Result<InsertOutcome, NodeError> {
        self.coordinator.insert(message, proof).await
    }

    /// # Errors
    /// See [`IngestionCoordinator::insert_encoded`].
    pub async fn insert_encoded(&self, bytes: &[u8]) -> Result<InsertOutcome, NodeError> {
        self.coordinator.insert_encoded(bytes).await
    }

    /// Ingests what the transport holds for `address`.
    ///
    /// # Errors
    /// See [`PubsubGateway::query_user`].
    pub async fn query_user(&self, address: &str) -> Result<usize, NodeError> {
        self.gateway.query_user(address, self.coordinator.as_ref()).await
    }

    /// # Errors
    /// See [`PubsubGateway::query_group`].
    pub async fn query_group(&self, group_id: &GroupId) -> Result<usize, NodeError> {
        self.gateway.query_group(group_id, self.coordinator.as_ref()).await
    }

    /// # Errors
    /// See [`PubsubGateway::query_all`].
    pub async fn query_all(&self) -> Result<usize, NodeError> {
        self.gateway.query_all(self.coordinator.as_ref()).await
    }

    /// # Errors
    /// See [`PubsubGateway::subscribe_user`].
    pub async fn subscribe_user(&self, address: &str) -> Result<Subscription, NodeError> {
        self.gateway.subscribe_user(address, self.handler()).await
    }

    /// # Errors
    /// See [`PubsubGateway::subscribe_users`].
    pub async fn subscribe_users(&self, addresses: &[&str]) -> Result<Subscription, NodeError> {
        self.gateway.subscribe_users(addresses, self.handler()).await
    }

    /// # Errors
    /// See [`PubsubGateway::subscribe_thread`].
    pub async fn subscribe_thread(&self, root: Hash32) -> Result<Subscription, NodeError> {
        self.gateway.subscribe_thread(root, self.handler()).await
    }

    /// # Errors
    /// See [`PubsubGateway::subscribe_threads`].
    pub async fn subscribe_threads(&self, roots: &[Hash32]) -> Result<Subscription, NodeError> {
        self.gateway.subscribe_threads(roots, self.handler()).await
    }

    /// # Errors
    /// See [`PubsubGateway::subscribe_all`].
    pub async fn subscribe_all(&self) -> Result<Subscription, NodeError> {
        self.gateway.subscribe_all(self.handler()).await
    }

    /// Authors and publishes a message, then ingests it locally.
    ///
    /// # Errors
    /// See [`PubsubGateway::write`] and [`IngestionCoordinator::insert`].
    pub async fn write(
        &self,
        draft: Draft,
        author: &Author,
    ) -> Result<(Published, InsertOutcome), NodeError> {
        let published = self.gateway.write(draft, author).await?;
        let outcome = self
            .coordinator
            .insert(published.message.clone(), published.proof.clone())
            .await?;
        Ok((published, outcome))
    }

    /// Encodes a stored message for the wire.
    ///
    /// # Errors
    /// Returns [`NodeError::Storage`] if the lookup fails.
    pub fn envelope(&self, hash: &Hash32) -> Result<Option<Envelope>, NodeError> {
        Ok(self
            .content
            .find(hash)?
            .map(|stored| Envelope::new(stored.message, stored.proof)))
    }

    #[must_use]
    pub fn group_members(&self, group_id: &GroupId) -> Option<Vec<Hash32>> {
        self.groups.members(group_id)
    }

    #[must_use]
    pub fn merkle_path(&self, commitment: &Hash32, group_id: &GroupId) -> Option<MerklePath> {
        self.groups.merkle_path(commitment, group_id)
    }

    #[must_use]
    pub fn group_by_root(&self, root: &Hash32) -> Option<GroupId> {
        self.groups.group_by_root(root)
    }

    /// # Errors
    /// See [`GroupRegistry::sync`].
    pub async fn sync_groups(&self, group_id: Option<&GroupId>) -> Result<SyncReport, NodeError> {
        self.groups.sync(group_id).await
    }

    /// # Errors
    /// See [`UserRegistry::sync`].
    pub async fn sync_users(&self) -> Result<usize, NodeError> {
        self.users.sync().await
    }

    /// Starts replication from the `all` topic and the periodic user and
    /// group sync loops.
    ///
    /// # Errors
    /// Returns [`NodeError::Transport`] if the replication subscription fails.
    pub async fn start(&self) -> Result<(), NodeError> {
        let subscription = self.subscribe_all().await?;
        // Replacing drops, and so cancels, an earlier subscription.
        *self.replication.lock() = Some(subscription);

        let users = Arc::clone(&self.users);
        let user_interval = Duration::from_secs(self.config.sync.user_poll_interval_secs.max(1));
        let user_loop = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(user_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = users.sync().await {
                    warn!("User feed poll failed: {}", e);
                }
            }
        });

        let groups = Arc::clone(&self.groups);
        let group_interval = Duration::from_secs(self.config.sync.group_sync_interval_secs.max(1));
        let group_loop = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(group_interval);
            loop {
                ticker.tick().await;
                match groups.sync(None).await {
                    Ok(report) if !report.is_complete() => warn!("Group sync: {}", report),
                    Ok(_) => {}
                    Err(e) => warn!("Group sync failed: {}", e),
                }
            }
        });

        self.tasks.lock().extend([user_loop, group_loop]);
        info!(
            "Node started (user poll {:?}, group sync {:?})",
            user_interval, group_interval
        );
        Ok(())
    }

    /// Stops background work and flushes storage.
    ///
    /// # Errors
    /// Returns [`NodeError::Storage`] if the final flush fails.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        let replication = self.replication.lock().take();
        if let Some(subscription) = replication {
            subscription.cancel().await;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.store.flush()?;
        info!("Node stopped");
        Ok(())
    }
}
