//! Test doubles for the bridge core
//!
//! Compiled for this crate's tests and for downstream crates that enable the
//! `testing` feature.
//!
//! ## Submodules
//!
//! - `memory_mmr` - In-memory header MMR producing roots and proofs
//! - `mock_client` - Scripted chain client and proof RPC with call counters
//! - `mock_backend` - Relayer backend with delayed register proofs and fault injection
//! - `mock_registry` - Token registry with settable statuses

pub mod memory_mmr;
pub mod mock_backend;
pub mod mock_client;
pub mod mock_registry;

pub use memory_mmr::MemoryMmr;
pub use mock_backend::MockBackend;
pub use mock_client::MockChain;
pub use mock_registry::MockTokenRegistry;
