//! Ethereum address handling.
//!
//! Creators and signature proofs carry addresses as strings. Everything that
//! compares or indexes addresses goes through [`normalize_address`] so that
//! checksum casing and the `0x` prefix never split one user into two.

use std::str::FromStr;

use ethers::types::Address;

use crate::error::NodeError;
use crate::utils::validate_and_strip_hex;

/// Ethereum addresses are 20 bytes = 40 hex characters.
pub const ADDRESS_HEX_LENGTH: usize = 40;

/// Ethereum private keys are 32 bytes = 64 hex characters.
pub const PRIVATE_KEY_HEX_LENGTH: usize = 64;

/// Validates and normalizes an address to lowercase hex without `0x`.
///
/// # Errors
///
/// Returns [`NodeError::MalformedMessage`] if the address is not 40 hex
/// characters after stripping the prefix.
///
/// # Examples
///
/// ```
/// use zkitter_node::ethereum::normalize_address;
///
/// let normalized = normalize_address("0x742d35Cc6634C0532925a3b844Bc454e4438f44e").unwrap();
/// assert_eq!(normalized, "742d35cc6634c0532925a3b844bc454e4438f44e");
/// ```
pub fn normalize_address(address: &str) -> Result<String, NodeError> {
    validate_and_strip_hex(address, ADDRESS_HEX_LENGTH).map(|s| s.to_lowercase())
}

/// Parses an address string into an ethers [`Address`].
///
/// # Errors
///
/// Returns [`NodeError::MalformedMessage`] for anything that is not a 20-byte
/// hex address.
pub fn parse_address(address: &str) -> Result<Address, NodeError> {
    let normalized = normalize_address(address)?;
    Address::from_str(&normalized)
        .map_err(|e| NodeError::MalformedMessage(format!("invalid address '{address}': {e}")))
}

/// Normalized string form of an ethers [`Address`].
#[must_use]
pub fn address_to_string(address: &Address) -> String {
    format!("{:x}", address)
}

/// Whether `address` is a well-formed, non-zero address.
///
/// ```
/// use zkitter_node::ethereum::is_valid_address;
///
/// assert!(is_valid_address("0x742d35Cc6634C0532925a3b844Bc454e4438f44e"));
/// assert!(!is_valid_address("0x0000000000000000000000000000000000000000"));
/// assert!(!is_valid_address("invalid"));
/// ```
#[must_use]
pub fn is_valid_address(address: &str) -> bool {
    match normalize_address(address) {
        Ok(normalized) => !normalized.chars().all(|c| c == '0'),
        Err(_) => false,
    }
}

/// Validates a private key string (with or without `0x`).
///
/// # Errors
///
/// Returns an error if the key is not 64 hex characters or is all zeros.
pub fn validate_private_key(private_key: &str) -> Result<(), NodeError> {
    let stripped = validate_and_strip_hex(private_key, PRIVATE_KEY_HEX_LENGTH)?;

    if stripped.chars().all(|c| c == '0') {
        return Err(NodeError::MalformedMessage(
            "private key cannot be all zeros".to_string(),
        ));
    }

    Ok(())
}
