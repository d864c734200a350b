//! Common types for bridge routing and proof assembly
//!
//! Vertices and directions are lookup keys for the bridge registry. The
//! proof documents mirror what the backend relayer API returns.

use alloy::primitives::{Bytes, B256};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProofError;
use crate::hash::{parse_bytes32, parse_hex_bytes};

// ============================================================================
// Network Vertices
// ============================================================================

/// Network identifier, e.g. "pangolin" or "ropsten"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Network(String);

impl Network {
    pub fn new(name: impl Into<String>) -> Self {
        Network(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Network {
    fn from(name: &str) -> Self {
        Network(name.to_string())
    }
}

/// Execution layer of a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// The chain's own account model
    Native,
    /// A smart-contract VM hosted on top of the chain
    SmartContractLayer,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Native => "native",
            Mode::SmartContractLayer => "smart-contract-layer",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end of a bridge. Compared structurally, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Vertex {
    pub network: Network,
    pub mode: Mode,
}

impl Vertex {
    pub fn new(network: impl Into<Network>, mode: Mode) -> Self {
        Self {
            network: network.into(),
            mode,
        }
    }

    pub fn native(network: impl Into<Network>) -> Self {
        Self::new(network, Mode::Native)
    }

    pub fn smart_contract(network: impl Into<Network>) -> Self {
        Self::new(network, Mode::SmartContractLayer)
    }
}

impl fmt::Display for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.mode)
    }
}

/// Ordered (departure, arrival) pair requested by a transfer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Direction {
    pub departure: Vertex,
    pub arrival: Vertex,
}

impl Direction {
    pub fn new(departure: Vertex, arrival: Vertex) -> Self {
        Self { departure, arrival }
    }

    /// The same bridge traversed the other way
    pub fn reversed(&self) -> Self {
        Self {
            departure: self.arrival.clone(),
            arrival: self.departure.clone(),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.departure, self.arrival)
    }
}

/// Whether a direction follows a bridge's declared order or runs against it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarity {
    /// Mints or credits a representation on the arrival chain
    Issuing,
    /// Burns the representation and releases toward the origin chain
    Redeeming,
}

impl Polarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Polarity::Issuing => "issuing",
            Polarity::Redeeming => "redeeming",
        }
    }
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Chain Data
// ============================================================================

/// Block selector for header queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockId {
    Number(u64),
    Hash(B256),
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Number(n) => write!(f, "#{}", n),
            BlockId::Hash(h) => write!(f, "{}", h),
        }
    }
}

/// Source-chain block header as returned by the chain client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub hash: B256,
    pub number: u64,
    /// SCALE-encoded header, submitted verbatim to the destination chain
    pub encoded: Bytes,
}

/// Most recent MMR root the destination chain is known to have accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BestRoot {
    /// Number of MMR leaves (blocks) covered by `root`
    pub index: u64,
    pub root: B256,
}

// ============================================================================
// Backend Proof Documents
// ============================================================================

/// Validator signatures as the backend encodes them: either a JSON array of
/// hex strings or a single comma-separated string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignatureList {
    List(Vec<String>),
    Joined(String),
}

impl SignatureList {
    pub fn decode(&self) -> Result<Vec<Bytes>, ProofError> {
        let parts: Vec<&str> = match self {
            SignatureList::List(items) => items.iter().map(String::as_str).collect(),
            SignatureList::Joined(joined) => joined.split(',').collect(),
        };

        parts
            .into_iter()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                parse_hex_bytes(s)
                    .map(Bytes::from)
                    .map_err(|e| ProofError::MalformedDocument(format!("signature: {}", e)))
            })
            .collect()
    }
}

/// Register proof document exactly as the relayer backend serves it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRegisterProof {
    pub block_hash: String,
    pub block_num: u64,
    pub mmr_index: u64,
    pub mmr_root: String,
    pub signatures: SignatureList,
}

/// Signed document proving a token registration event was committed to the
/// source chain's header MMR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterProofDoc {
    pub block_hash: B256,
    pub block_num: u64,
    /// Leaf count of the MMR the validators signed
    pub mmr_index: u64,
    pub mmr_root: B256,
    pub signatures: Vec<Bytes>,
    pub raw: RawRegisterProof,
}

impl TryFrom<RawRegisterProof> for RegisterProofDoc {
    type Error = ProofError;

    fn try_from(raw: RawRegisterProof) -> Result<Self, Self::Error> {
        let block_hash = parse_bytes32(&raw.block_hash)
            .map_err(|e| ProofError::MalformedDocument(format!("block_hash: {}", e)))?;
        let mmr_root = parse_bytes32(&raw.mmr_root)
            .map_err(|e| ProofError::MalformedDocument(format!("mmr_root: {}", e)))?;
        let signatures = raw.signatures.decode()?;

        Ok(Self {
            block_hash,
            block_num: raw.block_num,
            mmr_index: raw.mmr_index,
            mmr_root,
            signatures,
            raw,
        })
    }
}

/// Locator for a lock/burn event plus the validator metadata signed for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub block_number: u64,
    pub block_hash: B256,
    /// Leaf count of the historical MMR root supplied with the event
    pub mmr_index: u64,
    pub mmr_root: B256,
    pub signatures: Vec<Bytes>,
}

// ============================================================================
// Transfers and Records
// ============================================================================

/// A user's request to move an asset across one direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferIntent {
    pub direction: Direction,
    pub sender: String,
    pub recipient: String,
    /// Token contract address or native asset symbol
    pub asset: String,
    pub amount: u128,
}

/// History query for one direction and account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
    pub direction: Direction,
    pub account: String,
    pub page: u32,
    pub size: u32,
}

/// One historical transfer as indexed by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub tx_hash: String,
    pub sender: String,
    pub recipient: String,
    #[serde(default)]
    pub token: Option<String>,
    pub amount: String,
    pub block_num: u64,
    #[serde(default)]
    pub block_hash: Option<String>,
    #[serde(default)]
    pub block_timestamp: Option<u64>,
    #[serde(default)]
    pub mmr_index: Option<u64>,
    #[serde(default)]
    pub mmr_root: Option<String>,
    #[serde(default)]
    pub signatures: Option<SignatureList>,
}

impl TransferRecord {
    /// Build the claim locator for this record.
    ///
    /// Fails when the backend has not yet attached validator metadata.
    pub fn claim_request(&self) -> Result<ClaimRequest, ProofError> {
        let missing = |field: &str| {
            ProofError::MalformedDocument(format!("record {} has no {}", self.tx_hash, field))
        };

        let block_hash = self.block_hash.as_deref().ok_or_else(|| missing("block_hash"))?;
        let mmr_root = self.mmr_root.as_deref().ok_or_else(|| missing("mmr_root"))?;
        let mmr_index = self.mmr_index.ok_or_else(|| missing("mmr_index"))?;
        let signatures = match &self.signatures {
            Some(list) => list.decode()?,
            None => Vec::new(),
        };

        Ok(ClaimRequest {
            block_number: self.block_num,
            block_hash: parse_bytes32(block_hash)
                .map_err(|e| ProofError::MalformedDocument(format!("block_hash: {}", e)))?,
            mmr_index,
            mmr_root: parse_bytes32(mmr_root)
                .map_err(|e| ProofError::MalformedDocument(format!("mmr_root: {}", e)))?,
            signatures,
        })
    }
}

/// One page of history records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPage {
    pub total: u64,
    pub records: Vec<TransferRecord>,
}
