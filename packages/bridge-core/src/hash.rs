//! Hashing and hex helpers shared by the proof modules
//!
//! The header MMR merges nodes with keccak256 over the concatenation of the
//! left and right child, which is what the destination relay contract
//! recomputes when it checks an inclusion proof.

use alloy::primitives::B256;
use eyre::{eyre, Result};
use tiny_keccak::{Hasher, Keccak};

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Merge two MMR nodes: `keccak256(left ++ right)`
///
/// Order matters. Peaks are bagged with the right peak passed as `left`.
pub fn merge_nodes(left: &B256, right: &B256) -> B256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left.as_slice());
    data[32..].copy_from_slice(right.as_slice());
    B256::from(keccak256(&data))
}

/// Convert bytes to hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Convert 4-byte array to hex string with 0x prefix
pub fn bytes4_to_hex(bytes: &[u8; 4]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decode a hex string (with or without 0x prefix) into raw bytes
pub fn parse_hex_bytes(value: &str) -> Result<Vec<u8>> {
    let value = value.trim();
    let value = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(value).map_err(|e| eyre!("Invalid hex '{}': {}", value, e))
}

/// Decode a 32-byte hex value (with or without 0x prefix)
pub fn parse_bytes32(value: &str) -> Result<B256> {
    let bytes = parse_hex_bytes(value)?;
    if bytes.len() != 32 {
        return Err(eyre!("Expected 32 bytes, got {}", bytes.len()));
    }
    Ok(B256::from_slice(&bytes))
}

/// Decode a 4-byte hex value such as a method selector
pub fn parse_bytes4(value: &str) -> Result<[u8; 4]> {
    let bytes = parse_hex_bytes(value)?;
    let array: [u8; 4] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| eyre!("Expected 4 bytes, got {}", bytes.len()))?;
    Ok(array)
}
