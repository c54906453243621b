//! Membership groups.
//!
//! Every group owns an append-only [`IncrementalTree`] of identity
//! commitments. The [`GroupRegistry`] keeps a global [`RootIndex`] so an
//! inbound group proof can be resolved to its group from the root alone, and
//! every root a group has ever had stays resolvable after later appends.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::error::NodeError;
use crate::merkle::{IncrementalTree, MerklePath};
use crate::types::{GroupId, Hash32};
use crate::users::UserRegistry;

/// Default group that admits every registered user's identity commitment.
pub const OPEN_GROUP_ID: &str = "zksocial_all";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// `root -> group` for every root any registered group has produced.
#[derive(Debug, Default)]
pub struct RootIndex {
    roots: RwLock<HashMap<Hash32, GroupId>>,
}

impl RootIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `root` for `group_id`. The first writer wins; a conflicting
    /// record is logged and ignored. Returns whether the index changed.
    pub fn record(&self, root: Hash32, group_id: &GroupId) -> bool {
        let mut roots = self.roots.write();
        match roots.get(&root) {
            Some(existing) if existing == group_id => false,
            Some(existing) => {
                warn!(
                    "Root {} already belongs to group {}, ignoring claim from {}",
                    root, existing, group_id
                );
                false
            }
            None => {
                roots.insert(root, group_id.clone());
                true
            }
        }
    }

    #[must_use]
    pub fn group_of(&self, root: &Hash32) -> Option<GroupId> {
        self.roots.read().get(root).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.read().is_empty()
    }
}

/// Result of one successful group sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub group_id: GroupId,
    pub added: usize,
    pub root: Hash32,
}

struct MemberState {
    tree: IncrementalTree,
    positions: HashMap<Hash32, usize>,
}

/// A group's tree plus a commitment -> leaf index map.
///
/// Appends take the write lock and publish each new root to the
/// [`RootIndex`] before releasing it, so a root is resolvable as soon as a
/// reader can observe it.
pub struct MemberSet {
    group_id: GroupId,
    state: RwLock<MemberState>,
}

impl MemberSet {
    #[must_use]
    pub fn new(group_id: GroupId, depth: usize) -> Self {
        let tree = IncrementalTree::new(depth, group_id.as_str().as_bytes());
        Self {
            group_id,
            state: RwLock::new(MemberState {
                tree,
                positions: HashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// Appends every candidate that is not yet a member, in order.
    ///
    /// Either all new candidates are appended or, if they do not fit, none
    /// are and [`NodeError::GroupFull`] is returned.
    ///
    /// # Errors
    /// Returns [`NodeError::GroupFull`] when the tree lacks capacity.
    pub fn append_new(
        &self,
        candidates: impl IntoIterator<Item = Hash32>,
        roots: &RootIndex,
    ) -> Result<SyncOutcome, NodeError> {
        let mut state = self.state.write();

        let mut seen = HashSet::new();
        let fresh: Vec<Hash32> = candidates
            .into_iter()
            .filter(|c| !state.positions.contains_key(c) && seen.insert(*c))
            .collect();

        if state.tree.len() + fresh.len() > state.tree.capacity() {
            return Err(NodeError::GroupFull(self.group_id.clone()));
        }

        for commitment in &fresh {
            let index = state.tree.len();
            let root = state
                .tree
                .append(*commitment)
                .ok_or_else(|| NodeError::GroupFull(self.group_id.clone()))?;
            state.positions.insert(*commitment, index);
            roots.record(root, &self.group_id);
        }

        Ok(SyncOutcome {
            group_id: self.group_id.clone(),
            added: fresh.len(),
            root: state.tree.root(),
        })
    }

    #[must_use]
    pub fn members(&self) -> Vec<Hash32> {
        self.state.read().tree.leaves().to_vec()
    }

    #[must_use]
    pub fn contains(&self, commitment: &Hash32) -> bool {
        self.state.read().positions.contains_key(commitment)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().tree.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().tree.is_empty()
    }

    /// Path for `commitment` against the current root.
    #[must_use]
    pub fn merkle_path(&self, commitment: &Hash32) -> Option<MerklePath> {
        let state = self.state.read();
        let index = *state.positions.get(commitment)?;
        state.tree.path(index)
    }

    #[must_use]
    pub fn current_root(&self) -> Hash32 {
        self.state.read().tree.root()
    }

    /// Every root this set has had, oldest first.
    #[must_use]
    pub fn roots(&self) -> Vec<Hash32> {
        self.state.read().tree.roots().to_vec()
    }
}

/// Capability shared by all group kinds.
///
/// Implementors provide their identity, their [`MemberSet`] and how to pull
/// new members; read accessors delegate to the member set.
#[async_trait]
pub trait GroupAdapter: Send + Sync {
    fn group_id(&self) -> &GroupId;

    fn member_set(&self) -> &MemberSet;

    /// Pulls the latest members and appends the new ones. Must leave the
    /// member set untouched on failure.
    async fn sync(&self, roots: &RootIndex) -> Result<SyncOutcome, NodeError>;

    fn members(&self) -> Vec<Hash32> {
        self.member_set().members()
    }

    fn merkle_path(&self, commitment: &Hash32) -> Option<MerklePath> {
        self.member_set().merkle_path(commitment)
    }

    fn current_root(&self) -> Hash32 {
        self.member_set().current_root()
    }

    fn roots(&self) -> Vec<Hash32> {
        self.member_set().roots()
    }
}

/// Group whose members are fixed at construction.
pub struct StaticGroup {
    members: MemberSet,
}

impl StaticGroup {
    /// # Errors
    /// Returns [`NodeError::GroupFull`] if `members` exceed the tree capacity.
    pub fn new(
        group_id: GroupId,
        depth: usize,
        members: impl IntoIterator<Item = Hash32>,
    ) -> Result<Self, NodeError> {
        let set = MemberSet::new(group_id, depth);
        // Roots are indexed when the group is added to a registry.
        set.append_new(members, &RootIndex::new())?;
        Ok(Self { members: set })
    }
}

#[async_trait]
impl GroupAdapter for StaticGroup {
    fn group_id(&self) -> &GroupId {
        self.members.group_id()
    }

    fn member_set(&self) -> &MemberSet {
        &self.members
    }

    async fn sync(&self, _roots: &RootIndex) -> Result<SyncOutcome, NodeError> {
        Ok(SyncOutcome {
            group_id: self.group_id().clone(),
            added: 0,
            root: self.current_root(),
        })
    }
}

/// External source of a group's member commitments.
#[async_trait]
pub trait MembershipSource: Send + Sync {
    /// Full current member list of `group_id`.
    async fn fetch_members(&self, group_id: &GroupId) -> Result<Vec<Hash32>, NodeError>;
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    members: Vec<Hash32>,
}

/// Fetches members over HTTP from `GET {base_url}/groups/{group_id}/members`.
#[derive(Clone)]
pub struct HttpMembershipSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMembershipSource {
    /// # Errors
    /// Returns [`NodeError::GroupSync`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, NodeError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NodeError::GroupSync {
                group_id: GroupId::from("*"),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, base_url })
    }

    #[must_use]
    pub fn members_url(&self, group_id: &GroupId) -> String {
        format!("{}/groups/{}/members", self.base_url, group_id)
    }
}

#[async_trait]
impl MembershipSource for HttpMembershipSource {
    async fn fetch_members(&self, group_id: &GroupId) -> Result<Vec<Hash32>, NodeError> {
        let url = self.members_url(group_id);
        debug!("Fetching members of {} from {}", group_id, url);
        let failed = |reason: String| NodeError::GroupSync {
            group_id: group_id.clone(),
            reason,
        };
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| failed(format!("request to {url} failed: {e}")))?;
        let body: MembersResponse = response
            .json()
            .await
            .map_err(|e| failed(format!("invalid members response: {e}")))?;
        Ok(body.members)
    }
}

/// Group mirroring an external reputation tier, e.g. `interrep_twitter_gold`.
pub struct ReputationGroup {
    provider: String,
    tier: String,
    members: MemberSet,
    source: Arc<dyn MembershipSource>,
}

impl ReputationGroup {
    pub fn new(
        provider: impl Into<String>,
        tier: impl Into<String>,
        depth: usize,
        source: Arc<dyn MembershipSource>,
    ) -> Self {
        let provider = provider.into();
        let tier = tier.into();
        let group_id = Self::group_id_for(&provider, &tier);
        Self {
            provider,
            tier,
            members: MemberSet::new(group_id, depth),
            source,
        }
    }

    #[must_use]
    pub fn group_id_for(provider: &str, tier: &str) -> GroupId {
        GroupId::new(format!("interrep_{provider}_{tier}"))
    }

    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    #[must_use]
    pub fn tier(&self) -> &str {
        &self.tier
    }
}

#[async_trait]
impl GroupAdapter for ReputationGroup {
    fn group_id(&self) -> &GroupId {
        self.members.group_id()
    }

    fn member_set(&self) -> &MemberSet {
        &self.members
    }

    async fn sync(&self, roots: &RootIndex) -> Result<SyncOutcome, NodeError> {
        let fetched = self.source.fetch_members(self.group_id()).await?;
        self.members.append_new(fetched, roots)
    }
}

/// Group admitting the identity commitment of every registered user.
pub struct OpenGroup {
    members: MemberSet,
    users: Arc<UserRegistry>,
}

impl OpenGroup {
    pub fn new(group_id: GroupId, depth: usize, users: Arc<UserRegistry>) -> Self {
        Self {
            members: MemberSet::new(group_id, depth),
            users,
        }
    }
}

#[async_trait]
impl GroupAdapter for OpenGroup {
    fn group_id(&self) -> &GroupId {
        self.members.group_id()
    }

    fn member_set(&self) -> &MemberSet {
        &self.members
    }

    async fn sync(&self, roots: &RootIndex) -> Result<SyncOutcome, NodeError> {
        let to_sync_error = |e: NodeError| NodeError::GroupSync {
            group_id: self.group_id().clone(),
            reason: e.to_string(),
        };
        self.users.sync().await.map_err(to_sync_error)?;
        let commitments = self.users.identity_commitments().map_err(to_sync_error)?;
        self.members.append_new(commitments, roots)
    }
}

/// Notifications from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Synced {
        group_id: GroupId,
        added: usize,
        root: Hash32,
    },
}

/// Outcome of [`GroupRegistry::sync`].
#[derive(Debug, Default)]
pub struct SyncReport {
    pub synced: Vec<SyncOutcome>,
    pub failed: Vec<(GroupId, NodeError)>,
}

impl SyncReport {
    #[must_use]
    pub fn added(&self) -> usize {
        self.synced.iter().map(|outcome| outcome.added).sum()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} groups synced ({} new members), {} failed",
            self.synced.len(),
            self.added(),
            self.failed.len()
        )
    }
}

/// All groups known to the node.
pub struct GroupRegistry {
    groups: RwLock<BTreeMap<GroupId, Arc<dyn GroupAdapter>>>,
    roots: RootIndex,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            groups: RwLock::new(BTreeMap::new()),
            roots: RootIndex::new(),
            events,
        }
    }

    /// Registers `adapter` and indexes every root it already has.
    ///
    /// # Errors
    /// Returns [`NodeError::DuplicateGroup`] if the id is taken.
    pub fn add_group(&self, adapter: Arc<dyn GroupAdapter>) -> Result<(), NodeError> {
        let group_id = adapter.group_id().clone();
        let mut groups = self.groups.write();
        if groups.contains_key(&group_id) {
            return Err(NodeError::DuplicateGroup(group_id));
        }
        for root in adapter.roots() {
            self.roots.record(root, &group_id);
        }
        info!(
            "Registered group {} with {} members",
            group_id,
            adapter.members().len()
        );
        groups.insert(group_id, adapter);
        Ok(())
    }

    #[must_use]
    pub fn group_ids(&self) -> Vec<GroupId> {
        self.groups.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn get(&self, group_id: &GroupId) -> Option<Arc<dyn GroupAdapter>> {
        self.groups.read().get(group_id).cloned()
    }

    /// Syncs one group, or all groups concurrently when `group_id` is `None`.
    ///
    /// Individual failures are logged and reported, not returned.
    ///
    /// # Errors
    /// Returns [`NodeError::UnknownGroup`] if `group_id` is not registered.
    pub async fn sync(&self, group_id: Option<&GroupId>) -> Result<SyncReport, NodeError> {
        let targets: Vec<Arc<dyn GroupAdapter>> = match group_id {
            Some(id) => vec![self
                .get(id)
                .ok_or_else(|| NodeError::UnknownGroup(id.clone()))?],
            None => self.groups.read().values().cloned().collect(),
        };

        let results = join_all(targets.iter().map(|adapter| adapter.sync(&self.roots))).await;

        let mut report = SyncReport::default();
        for (adapter, result) in targets.iter().zip(results) {
            match result {
                Ok(outcome) => {
                    if outcome.added > 0 {
                        info!(
                            "Group {} gained {} members, root {}",
                            outcome.group_id, outcome.added, outcome.root
                        );
                        // No receivers is fine.
                        let _ = self.events.send(RegistryEvent::Synced {
                            group_id: outcome.group_id.clone(),
                            added: outcome.added,
                            root: outcome.root,
                        });
                    }
                    report.synced.push(outcome);
                }
                Err(e) => {
                    warn!("Sync of group {} failed: {}", adapter.group_id(), e);
                    report.failed.push((adapter.group_id().clone(), e));
                }
            }
        }
        Ok(report)
    }

    /// Group that produced `root`, at any point in its history.
    #[must_use]
    pub fn group_by_root(&self, root: &Hash32) -> Option<GroupId> {
        self.roots.group_of(root)
    }

    #[must_use]
    pub fn members(&self, group_id: &GroupId) -> Option<Vec<Hash32>> {
        self.get(group_id).map(|adapter| adapter.members())
    }

    #[must_use]
    pub fn merkle_path(&self, commitment: &Hash32, group_id: &GroupId) -> Option<MerklePath> {
        self.get(group_id)?.merkle_path(commitment)
    }

    #[must_use]
    pub fn current_root(&self, group_id: &GroupId) -> Option<Hash32> {
        self.get(group_id).map(|adapter| adapter.current_root())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}
