mod common;

use std::sync::Arc;

use tempfile::TempDir;
use zkitter_node::groups::{RegistryEvent, OPEN_GROUP_ID};
use zkitter_node::types::{PostKind, SignatureProof};
use zkitter_node::{
    ContentStore, GroupAdapter, GroupId, GroupRegistry, Hash32, Identity, InsertResult, KvStore,
    MemoryAddressFeed, MemoryStore, Message, MessageKind, MessageType, NodeBuilder, NodeError,
    OpenGroup, Proof, ReputationGroup, SledStore, StaticGroup, UserRecord, UserRegistry,
};

use common::*;

fn commitments(n: usize) -> Vec<Hash32> {
    (0..n)
        .map(|_| Identity::random(&mut rand::thread_rng()).commitment())
        .collect()
}

#[tokio::test]
async fn test_reputation_group_appends_only_new_members() {
    let members = commitments(3);
    let source = ScriptedSource::new(members[..2].to_vec());
    let registry = GroupRegistry::new();
    registry
        .add_group(Arc::new(ReputationGroup::new("twitter", "gold", 8, source.clone())))
        .unwrap();
    let group_id = GroupId::from("interrep_twitter_gold");
    let mut events = registry.subscribe_events();

    let report = registry.sync(Some(&group_id)).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.added(), 2);
    let first_root = registry.current_root(&group_id).unwrap();
    assert_eq!(
        events.try_recv().unwrap(),
        RegistryEvent::Synced {
            group_id: group_id.clone(),
            added: 2,
            root: first_root,
        }
    );

    // Reordered and extended; only the third commitment is new.
    source.set_members(vec![members[2], members[1], members[0]]);
    let report = registry.sync(Some(&group_id)).await.unwrap();
    assert_eq!(report.added(), 1);
    assert_eq!(registry.members(&group_id).unwrap(), members);

    let report = registry.sync(None).await.unwrap();
    assert_eq!(report.added(), 0);
    // Nothing new, no event.
    assert!(matches!(events.try_recv(), Ok(RegistryEvent::Synced { added: 1, .. })));
    assert!(events.try_recv().is_err());

    assert_eq!(registry.group_by_root(&first_root), Some(group_id.clone()));
    let current = registry.current_root(&group_id).unwrap();
    assert_eq!(registry.group_by_root(&current), Some(group_id.clone()));

    let path = registry.merkle_path(&members[2], &group_id).unwrap();
    assert_eq!(path.root, current);
    assert!(path.verify());
}

#[tokio::test]
async fn test_failed_sync_preserves_group_state() {
    let members = commitments(2);
    let source = ScriptedSource::new(members.clone());
    let registry = GroupRegistry::new();
    registry
        .add_group(Arc::new(ReputationGroup::new("github", "bronze", 8, source.clone())))
        .unwrap();
    registry
        .add_group(Arc::new(
            StaticGroup::new(GroupId::from("founders"), 8, commitments(1)).unwrap(),
        ))
        .unwrap();
    let group_id = ReputationGroup::group_id_for("github", "bronze");

    registry.sync(None).await.unwrap();
    let root = registry.current_root(&group_id).unwrap();

    source.set_failing(true);
    let report = registry.sync(None).await.unwrap();
    assert!(!report.is_complete());
    assert_eq!(report.synced.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, group_id);
    assert!(matches!(report.failed[0].1, NodeError::GroupSync { .. }));

    assert_eq!(registry.current_root(&group_id), Some(root));
    assert_eq!(registry.members(&group_id).unwrap(), members);

    source.set_failing(false);
    assert!(registry.sync(Some(&group_id)).await.unwrap().is_complete());
}

#[tokio::test]
async fn test_sync_of_unknown_group_is_an_error() {
    let registry = GroupRegistry::new();
    let result = registry.sync(Some(&GroupId::from("ghosts"))).await;
    assert!(matches!(result, Err(NodeError::UnknownGroup(_))));
    assert!(registry.sync(None).await.unwrap().synced.is_empty());
}

#[tokio::test]
async fn test_duplicate_group_id_refused() {
    let registry = GroupRegistry::new();
    let group = || Arc::new(StaticGroup::new(GroupId::from("founders"), 8, commitments(1)).unwrap());
    registry.add_group(group()).unwrap();
    assert!(matches!(
        registry.add_group(group()),
        Err(NodeError::DuplicateGroup(_))
    ));
    assert_eq!(registry.group_ids(), vec![GroupId::from("founders")]);
}

#[tokio::test]
async fn test_full_group_refuses_whole_batch() {
    let source = ScriptedSource::new(commitments(3));
    let registry = GroupRegistry::new();
    registry
        .add_group(Arc::new(ReputationGroup::new("twitter", "tiny", 1, source.clone())))
        .unwrap();
    let group_id = ReputationGroup::group_id_for("twitter", "tiny");

    let report = registry.sync(Some(&group_id)).await.unwrap();
    assert!(matches!(report.failed[0].1, NodeError::GroupFull(_)));
    assert!(registry.members(&group_id).unwrap().is_empty());
}

#[tokio::test]
async fn test_open_group_follows_address_feed() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let feed = Arc::new(MemoryAddressFeed::new());
    let users = Arc::new(UserRegistry::new(Arc::clone(&store), feed.clone()));
    let registry = GroupRegistry::new();
    registry
        .add_group(Arc::new(OpenGroup::new(
            GroupId::from(OPEN_GROUP_ID),
            8,
            Arc::clone(&users),
        )))
        .unwrap();
    let open = GroupId::from(OPEN_GROUP_ID);

    let identity = Identity::random(&mut rand::thread_rng());
    let alice = wallet();
    feed.push(UserRecord {
        address: address_of(&alice),
        registered_at: 10,
        identity_commitment: Some(identity.commitment()),
    });
    // Registered without an identity: a user, but not a group member.
    register(&feed, &wallet(), 11);

    let report = registry.sync(Some(&open)).await.unwrap();
    assert_eq!(report.added(), 1);
    assert!(users.is_registered(&address_of(&alice)).unwrap());
    assert_eq!(users.users().unwrap().len(), 2);
    assert_eq!(registry.members(&open).unwrap(), vec![identity.commitment()]);
    assert!(registry.merkle_path(&identity.commitment(), &open).is_some());

    let report = registry.sync(Some(&open)).await.unwrap();
    assert_eq!(report.added(), 0);
}

#[tokio::test]
async fn test_open_group_root_independent_of_poll_timing() {
    let feed = Arc::new(MemoryAddressFeed::new());
    let open = GroupId::from(OPEN_GROUP_ID);
    let open_registry = |feed: Arc<MemoryAddressFeed>| {
        let users = Arc::new(UserRegistry::new(Arc::new(MemoryStore::new()), feed));
        let registry = GroupRegistry::new();
        registry
            .add_group(Arc::new(OpenGroup::new(GroupId::from(OPEN_GROUP_ID), 8, users)))
            .unwrap();
        registry
    };

    let first = Identity::random(&mut rand::thread_rng());
    let second = Identity::random(&mut rand::thread_rng());
    let running = open_registry(Arc::clone(&feed));
    feed.push(UserRecord {
        address: address_of(&wallet()),
        registered_at: 20,
        identity_commitment: Some(first.commitment()),
    });
    running.sync(Some(&open)).await.unwrap();
    // Same block as an earlier record, delivered on a later poll.
    feed.push(UserRecord {
        address: address_of(&wallet()),
        registered_at: 20,
        identity_commitment: Some(second.commitment()),
    });
    running.sync(Some(&open)).await.unwrap();

    let fresh = open_registry(Arc::clone(&feed));
    fresh.sync(Some(&open)).await.unwrap();

    assert_eq!(
        running.members(&open).unwrap(),
        vec![first.commitment(), second.commitment()]
    );
    assert_eq!(fresh.members(&open), running.members(&open));
    assert_eq!(fresh.current_root(&open), running.current_root(&open));
}

#[test]
fn test_state_survives_reopen() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("db");
    let alice = wallet();
    let message = Message::new(
        MessageKind::Post(PostKind::Default),
        &address_of(&alice),
        "persisted",
        None,
        1_700_000_000_000,
    )
    .unwrap();
    let proof = Proof::Signature(SignatureProof {
        signature: "00".repeat(65),
        address: address_of(&alice),
    });

    let runtime = tokio::runtime::Runtime::new().unwrap();
    {
        let store: Arc<dyn KvStore> = Arc::new(SledStore::open(&path).unwrap());
        let content = ContentStore::open(Arc::clone(&store)).unwrap();
        assert_eq!(content.insert(&message, &proof).unwrap(), InsertResult::Inserted);

        let feed = Arc::new(MemoryAddressFeed::new());
        register(&feed, &alice, 5);
        let users = UserRegistry::new(Arc::clone(&store), feed);
        assert_eq!(runtime.block_on(users.sync()).unwrap(), 1);
        store.flush().unwrap();
    }

    let store: Arc<dyn KvStore> = Arc::new(SledStore::open(&path).unwrap());
    let content = ContentStore::open(Arc::clone(&store)).unwrap();
    assert_eq!(
        content.insert(&message, &proof).unwrap(),
        InsertResult::AlreadyExists
    );
    let stored = content.find(&message.hash()).unwrap().unwrap();
    assert_eq!(stored.message, message);
    assert_eq!(stored.seq, 0);

    let reply = Message::new(
        MessageKind::Post(PostKind::Default),
        &address_of(&alice),
        "after reopen",
        Some(message.hash()),
        1_700_000_000_001,
    )
    .unwrap();
    content.insert(&reply, &proof).unwrap();
    let page = content.list(MessageType::Post, 10, None).unwrap();
    assert_eq!(page.items.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![0, 1]);

    // The feed is empty now; the registration came from disk.
    let users = UserRegistry::new(store, Arc::new(MemoryAddressFeed::new()));
    assert!(users.is_registered(&address_of(&alice)).unwrap());
    assert_eq!(runtime.block_on(users.sync()).unwrap(), 0);
}

#[tokio::test]
async fn test_static_group_roots_indexed_on_registration() {
    let members = commitments(4);
    let group = Arc::new(StaticGroup::new(GroupId::from("founders"), 8, members.clone()).unwrap());
    let roots = group.roots();
    assert_eq!(roots.len(), 5);

    let registry = GroupRegistry::new();
    registry.add_group(group).unwrap();
    for root in &roots {
        assert_eq!(registry.group_by_root(root), Some(GroupId::from("founders")));
    }
    assert_eq!(registry.group_by_root(&Hash32([0xfe; 32])), None);
}

#[tokio::test]
async fn test_out_of_range_tree_depth_refused() {
    for depth in [0, 33, 64] {
        let mut config = test_config();
        config.groups.open_group_enabled = true;
        config.groups.tree_depth = depth;
        let result = NodeBuilder::new(config)
            .with_proof_system(Arc::new(FixedProofSystem))
            .build()
            .await;
        assert!(
            matches!(result, Err(NodeError::Config(_))),
            "depth {depth} accepted"
        );
    }

    let mut config = test_config();
    config.groups.tree_depth = 32;
    assert!(NodeBuilder::new(config)
        .with_proof_system(Arc::new(FixedProofSystem))
        .build()
        .await
        .is_ok());
}
