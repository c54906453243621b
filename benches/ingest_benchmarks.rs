use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use zkitter_node::circuit::DEFAULT_CIRCUIT_K;
use zkitter_node::types::{PostKind, PublicSignals, SignatureProof};
use zkitter_node::{
    verifier::verify_signature, ContentStore, GroupProofSystem, Halo2ProofSystem, Hash32,
    Identity, IncrementalTree, KvStore, MembershipWitness, MemoryStore, Message, MessageKind,
    Proof,
};

const CREATOR: &str = "0x742d35cc6634c0532925a3b844bc454e4438f44e";

fn leaves(count: usize) -> Vec<Hash32> {
    (0..count)
        .map(|i| {
            let mut bytes = [0u8; 32];
            bytes[0..8].copy_from_slice(&(i as u64).to_le_bytes());
            Hash32(bytes)
        })
        .collect()
}

fn bench_tree_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_append");

    for leaf_count in [16, 256, 4096].iter() {
        let batch = leaves(*leaf_count);
        group.bench_with_input(
            BenchmarkId::from_parameter(leaf_count),
            leaf_count,
            |b, _| {
                b.iter(|| {
                    let mut tree = IncrementalTree::new(20, b"bench");
                    for leaf in &batch {
                        tree.append(*leaf);
                    }
                    black_box(tree.root())
                })
            },
        );
    }

    group.finish();
}

fn bench_tree_path(c: &mut Criterion) {
    let mut tree = IncrementalTree::new(20, b"bench");
    for leaf in leaves(4096) {
        tree.append(leaf);
    }

    c.bench_function("tree_path_current", |b| {
        b.iter(|| black_box(tree.path(black_box(1234)).unwrap()))
    });
    c.bench_function("tree_path_historical", |b| {
        b.iter(|| black_box(tree.path_at(black_box(1234), black_box(2000)).unwrap()))
    });
}

fn bench_content_insert(c: &mut Criterion) {
    let proof = Proof::Signature(SignatureProof {
        signature: "00".repeat(65),
        address: CREATOR.to_string(),
    });

    c.bench_function("content_insert_1000", |b| {
        b.iter(|| {
            let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
            let content = ContentStore::open(store).unwrap();
            for i in 0..1000u64 {
                let message = Message::new(
                    MessageKind::Post(PostKind::Default),
                    CREATOR,
                    format!("post {i}"),
                    None,
                    i,
                )
                .unwrap();
                black_box(content.insert(&message, &proof).unwrap());
            }
        })
    });
}

fn bench_signature_verification(c: &mut Criterion) {
    use ethers::signers::{LocalWallet, Signer};

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let wallet = LocalWallet::new(&mut rand::thread_rng());
    let creator = zkitter_node::ethereum::address_to_string(&wallet.address());
    let message = Message::new(
        MessageKind::Post(PostKind::Default),
        &creator,
        "benchmark",
        None,
        1,
    )
    .unwrap();
    let signature = runtime
        .block_on(wallet.sign_message(message.hash().as_bytes()))
        .unwrap();
    let proof = SignatureProof {
        signature: signature.to_string(),
        address: creator,
    };

    c.bench_function("signature_verification", |b| {
        b.iter(|| black_box(verify_signature(&message, &proof)))
    });
}

fn bench_group_proof(c: &mut Criterion) {
    let system = Halo2ProofSystem::new(DEFAULT_CIRCUIT_K).unwrap();
    let identity = Identity::random(&mut rand::thread_rng());
    let mut tree = IncrementalTree::new(20, b"bench");
    tree.append(identity.commitment());
    let external_nullifier = Hash32([1; 32]);
    let signals = PublicSignals {
        root: tree.root(),
        nullifier: identity.nullifier_for(&external_nullifier),
        external_nullifier,
        signal_hash: Hash32([2; 32]),
    };
    let witness = MembershipWitness::new(identity, tree.path(0).unwrap());
    let proof = system.prove(&witness, &signals).unwrap();

    let mut group = c.benchmark_group("group_proof");
    group.sample_size(10);
    group.bench_function("prove", |b| {
        b.iter(|| black_box(system.prove(&witness, &signals).unwrap()))
    });
    group.bench_function("verify", |b| {
        b.iter(|| black_box(system.verify(&proof, &signals)))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_tree_append,
    bench_tree_path,
    bench_content_insert,
    bench_signature_verification,
    bench_group_proof
);
criterion_main!(benches);
