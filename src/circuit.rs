//! Group-membership proof system.
//!
//! The halo2 circuit exposes four instance rows, in order: merkle root,
//! nullifier, external nullifier and signal hash. It constrains
//! `nullifier = Poseidon(identity_nullifier, external_nullifier)` for a
//! private `identity_nullifier` and copies root and signal hash into the
//! instance column, so a proof is bound to exactly one message and root.
//!
//! Membership of the identity commitment in the tree is checked natively by
//! the prover before proving; it is not constrained in-circuit.

use halo2_gadgets::poseidon::{
    primitives::{ConstantLength, P128Pow5T3},
    Hash as PoseidonHash, Pow5Chip, Pow5Config,
};
use halo2_proofs::{
    circuit::{Layouter, SimpleFloorPlanner, Value},
    plonk::{
        create_proof, keygen_pk, keygen_vk, verify_proof, Advice, Circuit, Column,
        ConstraintSystem, Error, Instance, ProvingKey, SingleVerifier,
    },
    poly::commitment::Params,
    transcript::{Blake2bRead, Blake2bWrite, Challenge255},
};
use log::{debug, info};
use pasta_curves::{pallas, vesta};
use rand::rngs::OsRng;

use crate::error::NodeError;
use crate::identity::Identity;
use crate::merkle::MerklePath;
use crate::types::PublicSignals;

/// Smallest `k` whose `2^k` rows fit the Poseidon permutation plus blinding.
pub const MIN_CIRCUIT_K: u32 = 7;

/// Default circuit size.
pub const DEFAULT_CIRCUIT_K: u32 = 8;

const ROOT_ROW: usize = 0;
const NULLIFIER_ROW: usize = 1;
const EXTERNAL_NULLIFIER_ROW: usize = 2;
const SIGNAL_HASH_ROW: usize = 3;

/// Opaque prover/verifier for anonymous group proofs.
pub trait GroupProofSystem: Send + Sync {
    /// # Errors
    /// Returns [`NodeError::Proving`] if the witness does not satisfy
    /// `signals` or proof generation fails.
    fn prove(&self, witness: &MembershipWitness, signals: &PublicSignals)
        -> Result<Vec<u8>, NodeError>;

    fn verify(&self, proof: &[u8], signals: &PublicSignals) -> bool;
}

/// Private inputs of a group proof.
#[derive(Debug, Clone)]
pub struct MembershipWitness {
    pub identity: Identity,
    pub path: MerklePath,
}

impl MembershipWitness {
    #[must_use]
    pub fn new(identity: Identity, path: MerklePath) -> Self {
        Self { identity, path }
    }

    /// Checks that the witness actually supports `signals`.
    ///
    /// # Errors
    /// Returns [`NodeError::Proving`] describing the first mismatch.
    pub fn check(&self, signals: &PublicSignals) -> Result<(), NodeError> {
        if self.path.leaf != self.identity.commitment() {
            return Err(NodeError::Proving(
                "merkle path leaf is not the identity commitment".to_string(),
            ));
        }
        if !self.path.verify() {
            return Err(NodeError::Proving(
                "merkle path does not recompute its root".to_string(),
            ));
        }
        if self.path.root != signals.root {
            return Err(NodeError::Proving(format!(
                "merkle path root {} does not match signal root {}",
                self.path.root, signals.root
            )));
        }
        if self.identity.nullifier_for(&signals.external_nullifier) != signals.nullifier {
            return Err(NodeError::Proving(
                "nullifier is not derived from this identity".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SignalConfig {
    state: [Column<Advice>; 3],
    instance: Column<Instance>,
    poseidon: Pow5Config<pallas::Base, 3, 2>,
}

#[derive(Debug, Clone, Copy)]
pub struct SignalCircuit {
    identity_nullifier: Value<pallas::Base>,
    external_nullifier: Value<pallas::Base>,
    root: Value<pallas::Base>,
    signal_hash: Value<pallas::Base>,
}

impl Default for SignalCircuit {
    fn default() -> Self {
        Self {
            identity_nullifier: Value::unknown(),
            external_nullifier: Value::unknown(),
            root: Value::unknown(),
            signal_hash: Value::unknown(),
        }
    }
}

impl SignalCircuit {
    #[must_use]
    pub fn new(identity_nullifier: pallas::Base, signals: &PublicSignals) -> Self {
        Self {
            identity_nullifier: Value::known(identity_nullifier),
            external_nullifier: Value::known(signals.external_nullifier.to_field()),
            root: Value::known(signals.root.to_field()),
            signal_hash: Value::known(signals.signal_hash.to_field()),
        }
    }
}

impl Circuit<pallas::Base> for SignalCircuit {
    type Config = SignalConfig;
    type FloorPlanner = SimpleFloorPlanner;

    fn without_witnesses(&self) -> Self {
        Self::default()
    }

    fn configure(meta: &mut ConstraintSystem<pallas::Base>) -> Self::Config {
        let state = [meta.advice_column(), meta.advice_column(), meta.advice_column()];
        let partial_sbox = meta.advice_column();
        let rc_a = [meta.fixed_column(), meta.fixed_column(), meta.fixed_column()];
        let rc_b = [meta.fixed_column(), meta.fixed_column(), meta.fixed_column()];
        let instance = meta.instance_column();

        meta.enable_equality(instance);
        meta.enable_constant(rc_b[0]);

        // Enables equality on the state columns.
        let poseidon = Pow5Chip::configure::<P128Pow5T3>(meta, state, partial_sbox, rc_a, rc_b);

        SignalConfig {
            state,
            instance,
            poseidon,
        }
    }

    fn synthesize(
        &self,
        config: Self::Config,
        mut layouter: impl Layouter<pallas::Base>,
    ) -> Result<(), Error> {
        let [secret, external_nullifier, root, signal_hash] = layouter.assign_region(
            || "load witnesses",
            |mut region| {
                let secret = region.assign_advice(
                    || "identity nullifier",
                    config.state[0],
                    0,
                    || self.identity_nullifier,
                )?;
                let external_nullifier = region.assign_advice(
                    || "external nullifier",
                    config.state[1],
                    0,
                    || self.external_nullifier,
                )?;
                let root = region.assign_advice(|| "root", config.state[2], 0, || self.root)?;
                let signal_hash = region.assign_advice(
                    || "signal hash",
                    config.state[0],
                    1,
                    || self.signal_hash,
                )?;
                Ok([secret, external_nullifier, root, signal_hash])
            },
        )?;

        let chip = Pow5Chip::construct(config.poseidon.clone());
        let hasher = PoseidonHash::<_, _, P128Pow5T3, ConstantLength<2>, 3, 2>::init(
            chip,
            layouter.namespace(|| "init nullifier hash"),
        )?;
        let nullifier = hasher.hash(
            layouter.namespace(|| "nullifier hash"),
            [secret, external_nullifier.clone()],
        )?;

        layouter.constrain_instance(root.cell(), config.instance, ROOT_ROW)?;
        layouter.constrain_instance(nullifier.cell(), config.instance, NULLIFIER_ROW)?;
        layouter.constrain_instance(
            external_nullifier.cell(),
            config.instance,
            EXTERNAL_NULLIFIER_ROW,
        )?;
        layouter.constrain_instance(signal_hash.cell(), config.instance, SIGNAL_HASH_ROW)?;
        Ok(())
    }
}

/// halo2 (IPA over the Pasta cycle) implementation of [`GroupProofSystem`].
///
/// Parameters and keys are generated once at construction; prover and
/// verifier must agree on `k`.
pub struct Halo2ProofSystem {
    k: u32,
    params: Params<vesta::Affine>,
    pk: ProvingKey<vesta::Affine>,
}

impl Halo2ProofSystem {
    /// # Errors
    /// Returns [`NodeError::Proving`] if `k` is below [`MIN_CIRCUIT_K`] or
    /// key generation fails.
    pub fn new(k: u32) -> Result<Self, NodeError> {
        if k < MIN_CIRCUIT_K {
            return Err(NodeError::Proving(format!(
                "circuit k must be at least {MIN_CIRCUIT_K}, got {k}"
            )));
        }
        info!("Generating proving keys (k={})", k);
        let params: Params<vesta::Affine> = Params::new(k);
        let circuit = SignalCircuit::default();
        let vk = keygen_vk(&params, &circuit)
            .map_err(|e| NodeError::Proving(format!("verifying key generation failed: {e:?}")))?;
        let pk = keygen_pk(&params, vk, &circuit)
            .map_err(|e| NodeError::Proving(format!("proving key generation failed: {e:?}")))?;
        Ok(Self { k, params, pk })
    }

    #[must_use]
    pub fn k(&self) -> u32 {
        self.k
    }
}

impl GroupProofSystem for Halo2ProofSystem {
    fn prove(
        &self,
        witness: &MembershipWitness,
        signals: &PublicSignals,
    ) -> Result<Vec<u8>, NodeError> {
        witness.check(signals)?;
        let instance = signals
            .to_fields()
            .ok_or_else(|| NodeError::Proving("nullifier is not a field element".to_string()))?;
        let circuit = SignalCircuit::new(witness.identity.nullifier_secret(), signals);

        let columns: &[&[pallas::Base]] = &[&instance[..]];
        let instances: &[&[&[pallas::Base]]] = &[columns];
        let mut transcript = Blake2bWrite::<_, vesta::Affine, Challenge255<_>>::init(vec![]);
        create_proof(
            &self.params,
            &self.pk,
            &[circuit],
            instances,
            OsRng,
            &mut transcript,
        )
        .map_err(|e| NodeError::Proving(format!("{e:?}")))?;

        let proof = transcript.finalize();
        debug!("Generated group proof of {} bytes", proof.len());
        Ok(proof)
    }

    fn verify(&self, proof: &[u8], signals: &PublicSignals) -> bool {
        let Some(instance) = signals.to_fields() else {
            return false;
        };
        let columns: &[&[pallas::Base]] = &[&instance[..]];
        let instances: &[&[&[pallas::Base]]] = &[columns];
        let strategy = SingleVerifier::new(&self.params);
        let mut transcript = Blake2bRead::<_, vesta::Affine, Challenge255<_>>::init(proof);
        verify_proof(
            &self.params,
            self.pk.get_vk(),
            strategy,
            instances,
            &mut transcript,
        )
        .is_ok()
    }
}
