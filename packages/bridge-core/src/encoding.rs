//! Canonical byte encodings consumed by the destination chain
//!
//! The root message is what the source chain's validator set signs when it
//! commits an MMR root. The destination relay contract rebuilds the same bytes
//! from the submitted fields before recovering signers, so any drift here
//! silently breaks every historical-root claim.

use alloy::primitives::{Bytes, B256};
use parity_scale_codec::{Decode, Encode};

use crate::error::ProofError;

/// Chain name prefix used by the default source chain
pub const DEFAULT_CHAIN_PREFIX: &str = "Pangolin";

/// Method selector the validators commit roots under
pub const DEFAULT_METHOD_ID: [u8; 4] = [0x47, 0x9f, 0xbd, 0xf9];

/// SCALE layout: compact-length prefix bytes, 4-byte method id, compact leaf
/// index, 32-byte root.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct RootMessage {
    pub prefix: Vec<u8>,
    pub method_id: [u8; 4],
    #[codec(compact)]
    pub index: u32,
    pub root: [u8; 32],
}

impl RootMessage {
    pub fn new(
        prefix: &str,
        method_id: [u8; 4],
        mmr_index: u64,
        root: B256,
    ) -> Result<Self, ProofError> {
        let index = u32::try_from(mmr_index).map_err(|_| ProofError::IndexOverflow(mmr_index))?;
        Ok(Self {
            prefix: prefix.as_bytes().to_vec(),
            method_id,
            index,
            root: root.0,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode())
    }
}

/// Pack trie nodes of a read proof as a SCALE `Vec<Vec<u8>>`
pub fn encode_storage_proof(nodes: &[Bytes]) -> Bytes {
    let nodes: Vec<Vec<u8>> = nodes.iter().map(|n| n.to_vec()).collect();
    Bytes::from(nodes.encode())
}
