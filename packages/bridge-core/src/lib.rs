//! Bridge-Core: Cross-Chain Transfer Orchestration and Proof Assembly
//!
//! This crate is the non-presentational core of a multi-chain bridge client:
//!
//! - **Registry** - Routes a (departure, arrival) vertex pair to its transfer and record handlers
//! - **Lifecycle** - Drives one submitted call from confirmation to a terminal `Tx` state
//! - **Proofs** - Builds and locally verifies MMR, storage and root-message proof bundles
//! - **Registration** - Two-phase ERC20 token registration with resumable proof waits
//! - **Poller** - Bounded/unbounded polling with error backoff for eventually consistent sources
//! - **Testing Module** - In-memory MMR, mock chain client, mock backend and mock registry
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! bridge-core = { path = "../bridge-core" }
//! ```
//!
//! ## Feature Flags
//!
//! - `testing` - Enable the test doubles for downstream crates

// Primitives
pub mod cache;
pub mod encoding;
pub mod error;
pub mod hash;
pub mod mmr;
pub mod redact;
pub mod storage_keys;
pub mod types;

// Collaborators
pub mod backend;
pub mod client;
pub mod contracts;

// Orchestration
pub mod config;
pub mod handlers;
pub mod lifecycle;
pub mod poller;
pub mod proof;
pub mod registration;
pub mod registry;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used items at the crate root
pub use client::{ChainCall, ChainClient, NativeStatus, ProofRpc, Signer};
pub use config::BridgeConfig;
pub use error::{ConfigError, PollError, ProofError, RegistryError, StorageKeyError};
pub use lifecycle::{
    ConfirmGate, OnFinalize, TransactionLifecycle, Tx, TxKind, TxSubscription, WeakTxSubscription,
};
pub use poller::{PollConfig, RecordPoller};
pub use proof::{ProofBuilder, ProofBundle, ProofSettings};
pub use registration::{RegistrationPhase, RegistrationStatus, RegistrationWorkflow};
pub use registry::{BridgeRegistry, RecordHandler, Resolution, TransferHandler};
pub use types::{Direction, Mode, Polarity, Vertex};
