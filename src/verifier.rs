//! Authenticity checks applied to every inbound message before storage.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ethers::types::Signature;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::circuit::GroupProofSystem;
use crate::error::NodeError;
use crate::ethereum::{normalize_address, parse_address};
use crate::groups::GroupRegistry;
use crate::nullifier::{NullifierLedger, NullifierStatus};
use crate::types::{GroupProof, Message, Proof, PublicSignals, SignatureProof};
use crate::users::UserRegistry;

/// Why a message was refused. Rejections are data, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InvalidSignature,
    UnknownAddress,
    UnknownRoot,
    InvalidProof,
    NullifierReused,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::InvalidSignature => "signature does not match the creator",
            RejectReason::UnknownAddress => "creator is not a registered user",
            RejectReason::UnknownRoot => "proof root belongs to no known group",
            RejectReason::InvalidProof => "group proof does not verify",
            RejectReason::NullifierReused => "nullifier already used for another message",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(RejectReason),
}

impl Verdict {
    #[must_use]
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

impl From<RejectReason> for Verdict {
    fn from(reason: RejectReason) -> Self {
        Verdict::Reject(reason)
    }
}

/// Checks an EIP-191 signature over the message hash and that the signing
/// address is the message creator.
#[must_use]
pub fn verify_signature(message: &Message, proof: &SignatureProof) -> bool {
    let Ok(claimed) = normalize_address(&proof.address) else {
        return false;
    };
    if claimed != message.creator() {
        return false;
    }
    let (Ok(signature), Ok(address)) = (
        Signature::from_str(&proof.signature),
        parse_address(&claimed),
    ) else {
        return false;
    };
    signature
        .verify(message.hash().as_bytes().to_vec(), address)
        .is_ok()
}

#[derive(Debug, Clone, Copy)]
pub struct VerifierSettings {
    /// Reject signed messages from addresses missing in the user registry.
    pub require_registration: bool,
    pub max_zk_proof_size: usize,
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            require_registration: true,
            max_zk_proof_size: 16 * 1024,
        }
    }
}

pub struct ProofVerifier {
    groups: Arc<GroupRegistry>,
    users: Arc<UserRegistry>,
    nullifiers: NullifierLedger,
    proof_system: Arc<dyn GroupProofSystem>,
    settings: VerifierSettings,
}

impl ProofVerifier {
    pub fn new(
        groups: Arc<GroupRegistry>,
        users: Arc<UserRegistry>,
        nullifiers: NullifierLedger,
        proof_system: Arc<dyn GroupProofSystem>,
        settings: VerifierSettings,
    ) -> Self {
        Self {
            groups,
            users,
            nullifiers,
            proof_system,
            settings,
        }
    }

    /// Decides whether `message` may be stored.
    ///
    /// An accepted group proof has its nullifier recorded as a side effect.
    ///
    /// # Errors
    /// Returns [`NodeError::Storage`] if the user registry or nullifier
    /// ledger cannot be read or written.
    pub fn verify(&self, message: &Message, proof: &Proof) -> Result<Verdict, NodeError> {
        let verdict = match proof {
            Proof::Signature(signature) => self.verify_signed(message, signature)?,
            Proof::Group(group) => self.verify_group(message, group)?,
        };
        debug!(
            "Verified {} {} ({} proof): {:?}",
            message.message_type(),
            message.hash(),
            proof.scheme(),
            verdict
        );
        Ok(verdict)
    }

    fn verify_signed(&self, message: &Message, proof: &SignatureProof) -> Result<Verdict, NodeError> {
        if !verify_signature(message, proof) {
            return Ok(RejectReason::InvalidSignature.into());
        }
        if self.settings.require_registration && !self.users.is_registered(message.creator())? {
            return Ok(RejectReason::UnknownAddress.into());
        }
        Ok(Verdict::Accept)
    }

    fn verify_group(&self, message: &Message, proof: &GroupProof) -> Result<Verdict, NodeError> {
        if !message.is_anonymous() {
            return Ok(RejectReason::InvalidProof.into());
        }
        let Some(group_id) = self.groups.group_by_root(&proof.root) else {
            return Ok(RejectReason::UnknownRoot.into());
        };
        if proof.zk_proof.is_empty() || proof.zk_proof.len() > self.settings.max_zk_proof_size {
            return Ok(RejectReason::InvalidProof.into());
        }

        let signals = PublicSignals::for_message(proof, message);
        if !self.proof_system.verify(&proof.zk_proof, &signals) {
            return Ok(RejectReason::InvalidProof.into());
        }

        let status = self.nullifiers.check_and_record(
            &group_id,
            &proof.nullifier,
            &proof.external_nullifier,
            &signals.signal_hash,
        )?;
        Ok(match status {
            NullifierStatus::Fresh | NullifierStatus::SameMessage => Verdict::Accept,
            NullifierStatus::Reused => RejectReason::NullifierReused.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::MembershipWitness;
    use crate::ethereum::address_to_string;
    use crate::groups::{GroupAdapter, StaticGroup};
    use crate::storage::MemoryStore;
    use crate::types::{GroupId, Hash32, MessageKind, PostKind};
    use crate::users::{MemoryAddressFeed, UserRecord};
    use ethers::signers::{LocalWallet, Signer};

    /// Accepts a proof iff it equals the signal hash bytes.
    struct EchoProofSystem;

    impl GroupProofSystem for EchoProofSystem {
        fn prove(
            &self,
            _witness: &MembershipWitness,
            signals: &PublicSignals,
        ) -> Result<Vec<u8>, NodeError> {
            Ok(signals.signal_hash.as_bytes().to_vec())
        }

        fn verify(&self, proof: &[u8], signals: &PublicSignals) -> bool {
            proof == signals.signal_hash.as_bytes()
        }
    }

    struct Fixture {
        verifier: ProofVerifier,
        feed: Arc<MemoryAddressFeed>,
        users: Arc<UserRegistry>,
        root: Hash32,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let feed = Arc::new(MemoryAddressFeed::new());
        let users = Arc::new(UserRegistry::new(store.clone(), feed.clone()));
        let groups = Arc::new(GroupRegistry::new());
        let group =
            StaticGroup::new(GroupId::from("g"), 4, vec![Hash32([1; 32])]).unwrap();
        let root = group.member_set().current_root();
        groups.add_group(Arc::new(group)).unwrap();
        let verifier = ProofVerifier::new(
            groups,
            users.clone(),
            NullifierLedger::new(store),
            Arc::new(EchoProofSystem),
            VerifierSettings::default(),
        );
        Fixture {
            verifier,
            feed,
            users,
            root,
        }
    }

    fn post(creator: &str, content: &str) -> Message {
        Message::new(MessageKind::Post(PostKind::Default), creator, content, None, 1).unwrap()
    }

    async fn signed(wallet: &LocalWallet, content: &str) -> (Message, Proof) {
        let address = address_to_string(&wallet.address());
        let message = post(&address, content);
        let signature = wallet.sign_message(message.hash().as_bytes()).await.unwrap();
        let proof = Proof::Signature(SignatureProof {
            signature: signature.to_string(),
            address,
        });
        (message, proof)
    }

    fn group_proof(fx: &Fixture, message: &Message, nullifier: u8) -> Proof {
        Proof::Group(GroupProof {
            root: fx.root,
            nullifier: Hash32([nullifier; 32]),
            external_nullifier: Hash32([3; 32]),
            zk_proof: message.hash().as_bytes().to_vec(),
        })
    }

    #[tokio::test]
    async fn test_signature_requires_registration() {
        let fx = fixture();
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let (message, proof) = signed(&wallet, "hello").await;

        assert_eq!(
            fx.verifier.verify(&message, &proof).unwrap(),
            Verdict::Reject(RejectReason::UnknownAddress)
        );

        fx.feed.push(UserRecord {
            address: address_to_string(&wallet.address()),
            registered_at: 1,
            identity_commitment: None,
        });
        fx.users.sync().await.unwrap();
        assert_eq!(fx.verifier.verify(&message, &proof).unwrap(), Verdict::Accept);
    }

    #[tokio::test]
    async fn test_signature_over_other_content_is_invalid() {
        let fx = fixture();
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let (_, proof) = signed(&wallet, "original").await;
        let forged = post(&address_to_string(&wallet.address()), "forged");
        assert_eq!(
            fx.verifier.verify(&forged, &proof).unwrap(),
            Verdict::Reject(RejectReason::InvalidSignature)
        );
    }

    #[tokio::test]
    async fn test_signature_by_other_wallet_is_invalid() {
        let fx = fixture();
        let alice = LocalWallet::new(&mut rand::thread_rng());
        let mallory = LocalWallet::new(&mut rand::thread_rng());
        let message = post(&address_to_string(&alice.address()), "hi");
        let signature = mallory.sign_message(message.hash().as_bytes()).await.unwrap();
        let proof = Proof::Signature(SignatureProof {
            signature: signature.to_string(),
            address: address_to_string(&alice.address()),
        });
        assert_eq!(
            fx.verifier.verify(&message, &proof).unwrap(),
            Verdict::Reject(RejectReason::InvalidSignature)
        );
    }

    #[test]
    fn test_group_proof_paths() {
        let fx = fixture();
        let message = post("", "anon");

        assert_eq!(
            fx.verifier.verify(&message, &group_proof(&fx, &message, 7)).unwrap(),
            Verdict::Accept
        );
        // Redelivery of the same message keeps its nullifier binding.
        assert_eq!(
            fx.verifier.verify(&message, &group_proof(&fx, &message, 7)).unwrap(),
            Verdict::Accept
        );

        let second = post("", "anon again");
        assert_eq!(
            fx.verifier.verify(&second, &group_proof(&fx, &second, 7)).unwrap(),
            Verdict::Reject(RejectReason::NullifierReused)
        );

        let mut unknown = group_proof(&fx, &second, 8);
        if let Proof::Group(proof) = &mut unknown {
            proof.root = Hash32([0xAB; 32]);
        }
        assert_eq!(
            fx.verifier.verify(&second, &unknown).unwrap(),
            Verdict::Reject(RejectReason::UnknownRoot)
        );

        let tampered = post("", "anon, edited");
        assert_eq!(
            fx.verifier.verify(&tampered, &group_proof(&fx, &second, 8)).unwrap(),
            Verdict::Reject(RejectReason::InvalidProof)
        );
    }

    #[test]
    fn test_group_proof_on_signed_message_is_invalid() {
        let fx = fixture();
        let message = post("0x742d35Cc6634C0532925a3b844Bc454e4438f44e", "not anon");
        assert_eq!(
            fx.verifier.verify(&message, &group_proof(&fx, &message, 1)).unwrap(),
            Verdict::Reject(RejectReason::InvalidProof)
        );
    }
}
