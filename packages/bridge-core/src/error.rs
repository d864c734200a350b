//! Error taxonomy for the bridge core
//!
//! Collaborator I/O (chain clients, HTTP backend) reports through `eyre`;
//! the types here are the ones callers are expected to match on.

use thiserror::Error;

use crate::types::Vertex;

/// Failures while building a [`crate::registry::BridgeRegistry`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Bridge {first} <-> {second} is registered more than once")]
    Conflict { first: Vertex, second: Vertex },

    #[error("Bridge endpoints must differ, got {0} on both sides")]
    SelfLoop(Vertex),
}

/// Failures in the block-range → storage-key table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageKeyError {
    #[error("Storage key table is empty")]
    NoRanges,

    #[error("Storage key range is empty: min {min} > max {max}")]
    EmptyRange { min: u64, max: u64 },

    #[error("Storage key ranges overlap at block {block}")]
    Overlap { block: u64 },

    #[error("Storage key ranges leave a gap between block {after} and block {next}")]
    Gap { after: u64, next: u64 },

    #[error("Invalid storage key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("No storage key mapped for block {block}")]
    Unmapped { block: u64 },
}

/// Failures while assembling or verifying a proof bundle
///
/// Cloneable so a single in-flight computation can hand the same outcome to
/// every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofError {
    #[error(transparent)]
    StorageKey(#[from] StorageKeyError),

    #[error("Proof fetch failed: {0}")]
    Fetch(String),

    #[error("Malformed proof document: {0}")]
    MalformedDocument(String),

    #[error("Header mismatch for block {block}: expected {expected}, chain returned {actual}")]
    HeaderMismatch {
        block: u64,
        expected: String,
        actual: String,
    },

    #[error("MMR with {leaf_count} leaves does not cover block {block}")]
    NotCovered { block: u64, leaf_count: u64 },

    #[error("Malformed MMR proof: {0}")]
    MalformedMmrProof(String),

    #[error("MMR proof does not match peak {peak} at position {position}")]
    PeakMismatch { peak: String, position: u64 },

    #[error("Bagged MMR peaks {computed} do not match root {expected}")]
    RootMismatch { expected: String, computed: String },

    #[error("MMR index {0} does not fit the root message index field")]
    IndexOverflow(u64),

    #[error("Historical root for block {block} carries no validator signatures")]
    MissingSignatures { block: u64 },
}

/// Failures from [`crate::poller::RecordPoller`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("Polling gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Failures while loading [`crate::config::BridgeConfig`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error(transparent)]
    StorageKeys(#[from] StorageKeyError),
}
