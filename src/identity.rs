//! Anonymous identities.
//!
//! An identity is a pair of secret field elements. Only its commitment is
//! ever published (as a group leaf); nullifiers are derived per scope so the
//! same identity acting twice in one scope is detectable without revealing
//! which leaf acted.

use std::fmt;

use pasta_curves::group::ff::Field;
use pasta_curves::pallas;
use rand::RngCore;

use crate::error::NodeError;
use crate::types::Hash32;
use crate::utils::{field_from_repr, field_to_bytes, poseidon_hash, strip_hex_prefix};

#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    identity_nullifier: pallas::Base,
    identity_trapdoor: pallas::Base,
}

impl Identity {
    pub fn random(rng: &mut impl RngCore) -> Self {
        Self {
            identity_nullifier: pallas::Base::random(&mut *rng),
            identity_trapdoor: pallas::Base::random(&mut *rng),
        }
    }

    /// Public commitment inserted into group trees.
    #[must_use]
    pub fn commitment(&self) -> Hash32 {
        Hash32(field_to_bytes(poseidon_hash(
            self.identity_nullifier,
            self.identity_trapdoor,
        )))
    }

    /// Nullifier for `external_nullifier`; identical for every action this
    /// identity takes in that scope.
    #[must_use]
    pub fn nullifier_for(&self, external_nullifier: &Hash32) -> Hash32 {
        Hash32(field_to_bytes(poseidon_hash(
            self.identity_nullifier,
            external_nullifier.to_field(),
        )))
    }

    /// Secret scalar the group circuit proves knowledge of.
    pub(crate) fn nullifier_secret(&self) -> pallas::Base {
        self.identity_nullifier
    }

    /// Serializes the secret as `<nullifier hex><trapdoor hex>`.
    #[must_use]
    pub fn to_secret_hex(&self) -> String {
        format!(
            "{}{}",
            hex::encode(field_to_bytes(self.identity_nullifier)),
            hex::encode(field_to_bytes(self.identity_trapdoor))
        )
    }

    /// # Errors
    /// Returns [`NodeError::MalformedMessage`] if the secret is not 64 bytes of
    /// hex holding two canonical field elements.
    pub fn from_secret_hex(secret: &str) -> Result<Self, NodeError> {
        let bytes = hex::decode(strip_hex_prefix(secret))
            .map_err(|e| NodeError::MalformedMessage(format!("invalid identity secret: {e}")))?;
        if bytes.len() != 64 {
            return Err(NodeError::MalformedMessage(format!(
                "identity secret must be 64 bytes, got {}",
                bytes.len()
            )));
        }
        let mut nullifier = [0u8; 32];
        let mut trapdoor = [0u8; 32];
        nullifier.copy_from_slice(&bytes[..32]);
        trapdoor.copy_from_slice(&bytes[32..]);
        let non_canonical =
            || NodeError::MalformedMessage("identity secret is not canonical".to_string());
        Ok(Self {
            identity_nullifier: field_from_repr(nullifier).ok_or_else(non_canonical)?,
            identity_trapdoor: field_from_repr(trapdoor).ok_or_else(non_canonical)?,
        })
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("commitment", &self.commitment())
            .finish_non_exhaustive()
    }
}
