//! Chain client seam
//!
//! The core never talks to a chain directly. Everything it needs from either
//! chain family goes through [`ChainClient`] (calls, storage, headers,
//! connection) and [`ProofRpc`] (MMR and trie proofs). Concrete RPC wiring
//! lives outside this crate.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use eyre::{eyre, Result};
use futures::stream::BoxStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::PollError;
use crate::mmr::MmrProof;
use crate::poller::{PollConfig, RecordPoller};
use crate::types::{BlockId, Header};

// ============================================================================
// Calls and Statuses
// ============================================================================

/// Status events reported by a chain while a submitted call progresses
///
/// Account-model chains report the transaction-pool lifecycle; VM chains only
/// report submission and confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeStatus {
    Future,
    Ready,
    Broadcast,
    InBlock(B256),
    Retracted(B256),
    FinalityTimeout(B256),
    Finalized(B256),
    Usurped(B256),
    Dropped,
    Invalid,
    /// VM transaction accepted into the mempool
    Submitted(B256),
    /// VM transaction mined with enough confirmations
    Confirmed(B256),
}

/// A call to submit, in either chain family's shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainCall {
    Extrinsic {
        pallet: String,
        call: String,
        /// SCALE-encoded call arguments
        args: Bytes,
    },
    Contract {
        to: Address,
        data: Bytes,
        value: U256,
    },
}

impl ChainCall {
    pub fn contract(to: Address, data: impl Into<Bytes>) -> Self {
        ChainCall::Contract {
            to,
            data: data.into(),
            value: U256::ZERO,
        }
    }

    /// 4-byte selector of a contract call
    pub fn selector(&self) -> Option<[u8; 4]> {
        match self {
            ChainCall::Contract { data, .. } if data.len() >= 4 => {
                let mut selector = [0u8; 4];
                selector.copy_from_slice(&data[..4]);
                Some(selector)
            }
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ChainCall::Extrinsic { pallet, call, .. } => format!("{}.{}", pallet, call),
            ChainCall::Contract { to, data, .. } => match self.selector() {
                Some(sel) => format!("{}::0x{}", to, hex::encode(sel)),
                None => format!("{} ({} bytes)", to, data.len()),
            },
        }
    }
}

/// Account that signs a call. The wallet holding its keys is external.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signer(pub String);

impl Signer {
    pub fn new(account: impl Into<String>) -> Self {
        Signer(account.into())
    }

    pub fn account(&self) -> &str {
        &self.0
    }
}

pub type StatusStream = BoxStream<'static, Result<NativeStatus>>;

// ============================================================================
// Collaborator Traits
// ============================================================================

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// RPC endpoint this client talks to
    fn endpoint(&self) -> &str;

    /// Sign and submit a call. The stream ends after a terminal status.
    async fn submit_call(&self, call: ChainCall, signer: &Signer) -> Result<StatusStream>;

    async fn query_storage(&self, block_hash: B256, key: &[u8]) -> Result<Option<Bytes>>;

    async fn query_block_header(&self, block: BlockId) -> Result<Header>;

    async fn is_connected(&self) -> bool;

    async fn connect(&self) -> Result<()>;
}

#[async_trait]
pub trait ProofRpc: Send + Sync {
    /// Inclusion proof for leaf `leaf_index` in the MMR of `mmr_size` nodes
    async fn mmr_proof(&self, leaf_index: u64, mmr_size: u64) -> Result<MmrProof>;

    /// Trie nodes proving `keys` at `block_hash`
    async fn read_proof(&self, block_hash: B256, keys: &[Bytes]) -> Result<Vec<Bytes>>;
}

// ============================================================================
// Client Registry
// ============================================================================

/// Normalize an RPC endpoint so equivalent spellings share one client
pub fn normalize_endpoint(endpoint: &str) -> Result<String> {
    let parsed = url::Url::parse(endpoint.trim())
        .map_err(|e| eyre!("Invalid RPC endpoint '{}': {}", endpoint, e))?;
    if parsed.host_str().is_none() {
        return Err(eyre!("RPC endpoint '{}' has no host", endpoint));
    }
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

/// One client per RPC endpoint for the life of the process
pub struct ClientRegistry<C: ?Sized> {
    clients: Mutex<HashMap<String, Arc<C>>>,
}

impl<C: ?Sized> Default for ClientRegistry<C> {
    fn default() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl<C: ?Sized + Send + Sync> ClientRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the client for `endpoint`, creating it with `make` on first use
    pub async fn get_or_insert_with<F>(&self, endpoint: &str, make: F) -> Result<Arc<C>>
    where
        F: FnOnce(&str) -> Result<Arc<C>>,
    {
        let key = normalize_endpoint(endpoint)?;
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let client = make(&key)?;
        info!(endpoint = %key, "Created chain client");
        clients.insert(key, client.clone());
        Ok(client)
    }

    pub async fn get(&self, endpoint: &str) -> Option<Arc<C>> {
        let key = normalize_endpoint(endpoint).ok()?;
        self.clients.lock().await.get(&key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }
}

/// Ask the client to connect, then poll until it reports a live connection
pub async fn wait_until_connected<C>(client: &C, poll: &PollConfig) -> Result<(), PollError>
where
    C: ChainClient + ?Sized,
{
    if client.is_connected().await {
        return Ok(());
    }

    if let Err(e) = client.connect().await {
        warn!(endpoint = %client.endpoint(), error = %e, "Connect request failed, polling anyway");
    }

    let poller = RecordPoller::new(poll.clone());
    let connected = poller
        .poll(
            |_| async { Ok(client.is_connected().await) },
            |connected| !*connected,
        )
        .await?;

    if connected {
        debug!(endpoint = %client.endpoint(), "Chain client connected");
        Ok(())
    } else {
        Err(PollError::Exhausted {
            attempts: poll.max_attempts.unwrap_or_default(),
            last_error: format!("{} is not connected", client.endpoint()),
        })
    }
}

/// Submit `call` once the client reports a live connection
pub async fn submit_when_connected(
    client: &dyn ChainClient,
    call: ChainCall,
    signer: &Signer,
    connect: &PollConfig,
) -> Result<StatusStream> {
    wait_until_connected(client, connect)
        .await
        .map_err(|e| eyre!("{} is unavailable: {}", client.endpoint(), e))?;
    client.submit_call(call, signer).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChain;
    use std::time::Duration;

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(
            normalize_endpoint("wss://Pangolin-RPC.example.org/").unwrap(),
            "wss://pangolin-rpc.example.org"
        );
        assert_eq!(
            normalize_endpoint(" https://rpc.example.org/v1/ ").unwrap(),
            "https://rpc.example.org/v1"
        );
        assert!(normalize_endpoint("not a url").is_err());
    }

    #[test]
    fn test_call_selector_and_description() {
        let call = ChainCall::contract(Address::ZERO, vec![0xde, 0xad, 0xbe, 0xef, 0x00]);
        assert_eq!(call.selector(), Some([0xde, 0xad, 0xbe, 0xef]));
        assert!(call.describe().ends_with("::0xdeadbeef"));

        let extrinsic = ChainCall::Extrinsic {
            pallet: "balances".to_string(),
            call: "transfer".to_string(),
            args: Bytes::new(),
        };
        assert_eq!(extrinsic.selector(), None);
        assert_eq!(extrinsic.describe(), "balances.transfer");
    }

    #[tokio::test]
    async fn test_registry_memoizes_per_endpoint() {
        let registry: ClientRegistry<dyn ChainClient> = ClientRegistry::new();

        let first = registry
            .get_or_insert_with("wss://rpc.example.org/", |url| {
                Ok(Arc::new(MockChain::new(url)) as Arc<dyn ChainClient>)
            })
            .await
            .unwrap();
        let second = registry
            .get_or_insert_with("wss://RPC.example.org", |_| {
                panic!("client must be reused for the same endpoint")
            })
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len().await, 1);
        assert!(registry.get("wss://rpc.example.org").await.is_some());
        assert!(registry.get("wss://other.example.org").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_connected() {
        let chain = MockChain::new("wss://rpc.example.org");
        chain.set_connected(false);
        chain.connect_after_polls(2);

        let poll = PollConfig::bounded(Duration::from_millis(100), 5);
        wait_until_connected(&chain, &poll).await.unwrap();
        assert_eq!(chain.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_waits_for_connection() {
        let chain = MockChain::new("wss://rpc.example.org");
        chain.set_connected(false);
        chain.connect_after_polls(3);

        let call = ChainCall::contract(Address::ZERO, vec![0x01, 0x02, 0x03, 0x04]);
        let poll = PollConfig::bounded(Duration::from_millis(100), 5);
        submit_when_connected(&chain, call.clone(), &Signer::new("0xuser"), &poll)
            .await
            .unwrap();
        assert_eq!(chain.connect_calls(), 1);
        assert_eq!(chain.submit_calls(), 1);

        chain.set_connected(false);
        let poll = PollConfig::bounded(Duration::from_millis(100), 2);
        let err = submit_when_connected(&chain, call, &Signer::new("0xuser"), &poll)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().starts_with("wss://rpc.example.org is unavailable"));
        assert_eq!(chain.submit_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_connected_gives_up() {
        let chain = MockChain::new("wss://rpc.example.org");
        chain.set_connected(false);

        let poll = PollConfig::bounded(Duration::from_millis(100), 3);
        let err = wait_until_connected(&chain, &poll).await.unwrap_err();
        assert!(matches!(err, PollError::Exhausted { attempts: 3, .. }));
    }
}
