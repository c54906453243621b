//! Hex, field and hashing helpers shared by the wire types, identities and the
//! proof system.

use std::time::{SystemTime, UNIX_EPOCH};

use halo2_gadgets::poseidon::primitives::{
    self as poseidon, ConstantLength, P128Pow5T3 as PoseidonSpec,
};
use pasta_curves::group::ff::PrimeField;
use pasta_curves::pallas;
use sha3::{Digest, Sha3_256};

use crate::error::NodeError;

fn is_valid_hex_string(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Strips surrounding whitespace and an optional `0x`/`0X` prefix.
pub fn strip_hex_prefix(input: &str) -> &str {
    let trimmed = input.trim();
    trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed)
}

/// Validates a hex string of an exact length and returns it without prefix.
///
/// # Errors
/// Returns [`NodeError::MalformedMessage`] if the stripped string has the wrong
/// length or contains non-hex characters.
///
/// # Examples
///
/// ```
/// use zkitter_node::utils::validate_and_strip_hex;
///
/// let result = validate_and_strip_hex("0x1234abcd", 8).unwrap();
/// assert_eq!(result, "1234abcd");
/// ```
pub fn validate_and_strip_hex(input: &str, expected_len: usize) -> Result<String, NodeError> {
    let stripped = strip_hex_prefix(input);

    if stripped.len() != expected_len {
        return Err(NodeError::MalformedMessage(format!(
            "invalid hex string: must be {} characters (got {})",
            expected_len,
            stripped.len()
        )));
    }

    if !is_valid_hex_string(stripped) {
        return Err(NodeError::MalformedMessage(
            "invalid hex string: contains non-hex characters".to_string(),
        ));
    }

    Ok(stripped.to_string())
}

const BASE_U64: u64 = 256;

/// Converts 32 bytes to a Pallas base field element.
///
/// The bytes are read as a big-endian base-256 number and reduced modulo the
/// field order, so every 32-byte value maps to some field element.
#[inline]
#[must_use]
pub fn bytes_to_field(bytes: &[u8; 32]) -> pallas::Base {
    let mut value = pallas::Base::zero();
    let base = pallas::Base::from(BASE_U64);

    for &byte in bytes.iter() {
        value = value * base + pallas::Base::from(byte as u64);
    }

    value
}

/// Canonical little-endian representation of a field element.
#[inline]
#[must_use]
pub fn field_to_bytes(field: pallas::Base) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    let repr = field.to_repr();
    bytes.copy_from_slice(repr.as_ref());
    bytes
}

/// Inverse of [`field_to_bytes`]. `None` for non-canonical encodings.
#[must_use]
pub fn field_from_repr(bytes: [u8; 32]) -> Option<pallas::Base> {
    Option::from(pallas::Base::from_repr(bytes))
}

/// Poseidon hash of two field elements (`P128Pow5T3`, width 3, rate 2).
///
/// ```
/// use zkitter_node::utils::poseidon_hash;
/// use pasta_curves::pallas;
///
/// let hash = poseidon_hash(pallas::Base::from(1), pallas::Base::from(2));
/// assert_ne!(hash, pallas::Base::zero());
/// ```
#[inline]
#[must_use]
pub fn poseidon_hash(left: pallas::Base, right: pallas::Base) -> pallas::Base {
    let inputs = [left, right];
    poseidon::Hash::<_, PoseidonSpec, ConstantLength<2>, 3, 2>::init().hash(inputs)
}

/// SHA3-256 over the concatenation of `parts`.
#[must_use]
pub fn sha3_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Milliseconds since the unix epoch.
///
/// # Errors
/// Returns [`NodeError::Clock`] if the system clock is before the epoch.
pub fn unix_millis() -> Result<u64, NodeError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|e| NodeError::Clock(e.to_string()))
}
