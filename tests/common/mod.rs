#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use zkitter_node::circuit::DEFAULT_CIRCUIT_K;
use zkitter_node::ethereum::address_to_string;
use zkitter_node::error::StorageError;
use zkitter_node::storage::{KvIter, KvPair};
use zkitter_node::types::PublicSignals;
use zkitter_node::{
    Config, GroupId, GroupProofSystem, Halo2ProofSystem, Hash32, KvStore, MemoryAddressFeed,
    MemoryStore, MembershipSource, MembershipWitness, Node, NodeBuilder, NodeError, NodeEvent,
    Transport, UserRecord,
};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Real halo2 keys, generated once per test binary.
pub fn halo2() -> Arc<dyn GroupProofSystem> {
    static SYSTEM: OnceLock<Arc<Halo2ProofSystem>> = OnceLock::new();
    let system = SYSTEM.get_or_init(|| {
        Arc::new(Halo2ProofSystem::new(DEFAULT_CIRCUIT_K).expect("Failed to generate proving keys"))
    });
    Arc::clone(system) as Arc<dyn GroupProofSystem>
}

/// Emits a fixed byte string and accepts any non-empty proof. For tests of
/// plumbing that never reaches a verifier.
pub struct FixedProofSystem;

impl GroupProofSystem for FixedProofSystem {
    fn prove(
        &self,
        witness: &MembershipWitness,
        signals: &PublicSignals,
    ) -> Result<Vec<u8>, NodeError> {
        witness.check(signals)?;
        Ok(vec![0x5a; 32])
    }

    fn verify(&self, proof: &[u8], _signals: &PublicSignals) -> bool {
        !proof.is_empty()
    }
}

/// Membership source with a mutable member list that can be told to fail.
#[derive(Default)]
pub struct ScriptedSource {
    members: Mutex<Vec<Hash32>>,
    failing: Mutex<bool>,
}

impl ScriptedSource {
    pub fn new(members: Vec<Hash32>) -> Arc<Self> {
        Arc::new(Self {
            members: Mutex::new(members),
            failing: Mutex::new(false),
        })
    }

    pub fn set_members(&self, members: Vec<Hash32>) {
        *self.members.lock() = members;
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }
}

#[async_trait]
impl MembershipSource for ScriptedSource {
    async fn fetch_members(&self, group_id: &GroupId) -> Result<Vec<Hash32>, NodeError> {
        if *self.failing.lock() {
            return Err(NodeError::GroupSync {
                group_id: group_id.clone(),
                reason: "source unavailable".to_string(),
            });
        }
        Ok(self.members.lock().clone())
    }
}

/// Memory store whose batch writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails the next `count` calls to `put_all_if_absent`.
    pub fn fail_next_batches(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

impl KvStore for FlakyStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.inner.put(key, value)
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool, StorageError> {
        self.inner.put_if_absent(key, value)
    }

    fn put_all_if_absent(&self, guard: &[u8], writes: &[KvPair]) -> Result<bool, StorageError> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StorageError::Backend("disk unavailable".to_string()));
        }
        self.inner.put_all_if_absent(guard, writes)
    }

    fn iterate_from<'a>(&'a self, prefix: &[u8], start: &[u8]) -> KvIter<'a> {
        self.inner.iterate_from(prefix, start)
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn wallet() -> LocalWallet {
    LocalWallet::new(&mut rand::thread_rng())
}

pub fn address_of(wallet: &LocalWallet) -> String {
    address_to_string(&wallet.address())
}

pub fn register(feed: &MemoryAddressFeed, wallet: &LocalWallet, registered_at: u64) {
    feed.push(UserRecord {
        address: address_of(wallet),
        registered_at,
        identity_commitment: None,
    });
}

/// Config for an in-memory node without the open group.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.groups.open_group_enabled = false;
    config.groups.tree_depth = 8;
    config
}

pub async fn node_with(
    feed: Arc<MemoryAddressFeed>,
    transport: Option<Arc<dyn Transport>>,
    configure: impl FnOnce(NodeBuilder) -> NodeBuilder,
) -> Node {
    let mut builder = NodeBuilder::new(test_config())
        .with_address_feed(feed)
        .with_proof_system(halo2());
    if let Some(transport) = transport {
        builder = builder.with_transport(transport);
    }
    configure(builder).build().await.expect("Failed to build node")
}

/// Waits for the first event matching `predicate`.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<NodeEvent>,
    predicate: impl Fn(&NodeEvent) -> bool,
) -> NodeEvent {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("Event channel closed"),
            }
        }
    })
    .await
    .expect("Timed out waiting for event")
}
