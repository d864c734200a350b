//! Cross-chain proof assembly
//!
//! A proof bundle convinces the destination chain that an event happened on
//! the source chain. It has three parts:
//!
//! 1. The source block header plus an MMR inclusion proof tying it to a root
//!    the destination already trusts (the best root) or can check against
//!    validator signatures (a historical root plus its signed root message).
//! 2. A storage proof for the event's storage key at that block.
//! 3. For historical roots, the root message and validator signatures.
//!
//! Bundles are memoized per block hash (claims) or token (registrations).
//! Concurrent requests for the same key share a single in-flight build, and
//! failed builds are evicted so the next request starts over.

use std::sync::Arc;

use alloy::primitives::{Address, Bytes, B256};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::ProofBackend;
use crate::cache::{BoundedCache, DEFAULT_PROOF_CACHE_SIZE};
use crate::client::{ChainClient, ProofRpc};
use crate::encoding::{encode_storage_proof, RootMessage, DEFAULT_CHAIN_PREFIX, DEFAULT_METHOD_ID};
use crate::error::ProofError;
use crate::hash::bytes32_to_hex;
use crate::mmr::{checked_mmr_size_for_leaves, verify_leaf, MmrProof};
use crate::poller::{PollConfig, RecordPoller};
use crate::storage_keys::StorageKeyTable;
use crate::types::{BestRoot, BlockId, ClaimRequest, Header, RegisterProofDoc};

// ============================================================================
// Bundle Types
// ============================================================================

/// Cache key for a proof bundle
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProofKey {
    /// Source block hash of a lock/burn event
    Claim(B256),
    /// Token being registered
    Register(Address),
}

/// What a bundle proves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofSubject {
    Claim(ClaimRequest),
    Register(RegisterProofDoc),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofBundle {
    pub subject: ProofSubject,
    pub header: Header,
    /// MMR root the inclusion proof was checked against
    pub root: B256,
    /// Leaf count of `root`
    pub mmr_index: u64,
    pub mmr_proof: MmrProof,
    /// SCALE-encoded trie nodes
    pub storage_proof: Bytes,
    pub root_message: Option<Bytes>,
    pub signatures: Option<Vec<Bytes>>,
}

impl ProofBundle {
    /// True when the bundle relies on a root the destination already accepted
    pub fn uses_best_root(&self) -> bool {
        self.root_message.is_none()
    }

    pub fn block_number(&self) -> u64 {
        self.header.number
    }
}

/// Root a proof is anchored to
#[derive(Debug, Clone, PartialEq, Eq)]
enum Anchor {
    Best(BestRoot),
    Historical {
        index: u64,
        root: B256,
        signatures: Vec<Bytes>,
    },
}

impl Anchor {
    fn index(&self) -> u64 {
        match self {
            Anchor::Best(best) => best.index,
            Anchor::Historical { index, .. } => *index,
        }
    }

    fn root(&self) -> B256 {
        match self {
            Anchor::Best(best) => best.root,
            Anchor::Historical { root, .. } => *root,
        }
    }
}

/// Pick the best root when it already covers `block`, otherwise the
/// historical root supplied with the event.
fn select_anchor(
    block: u64,
    best: Option<BestRoot>,
    historical_index: u64,
    historical_root: B256,
    signatures: &[Bytes],
) -> Result<Anchor, ProofError> {
    if let Some(best) = best {
        if best.index > block {
            return Ok(Anchor::Best(best));
        }
    }

    if historical_index <= block {
        return Err(ProofError::NotCovered {
            block,
            leaf_count: historical_index.max(best.map_or(0, |b| b.index)),
        });
    }
    if signatures.is_empty() {
        return Err(ProofError::MissingSignatures { block });
    }

    Ok(Anchor::Historical {
        index: historical_index,
        root: historical_root,
        signatures: signatures.to_vec(),
    })
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProofSettings {
    /// Chain name prefix of the root message
    pub chain_prefix: String,
    pub method_id: [u8; 4],
    /// Lock/burn event storage keys by block range
    pub storage_keys: StorageKeyTable,
    /// Storage key of the token registry's proof record
    pub register_proof_key: Bytes,
    pub cache_size: usize,
}

impl ProofSettings {
    pub fn new(storage_keys: StorageKeyTable, register_proof_key: Bytes) -> Self {
        Self {
            chain_prefix: DEFAULT_CHAIN_PREFIX.to_string(),
            method_id: DEFAULT_METHOD_ID,
            storage_keys,
            register_proof_key,
            cache_size: DEFAULT_PROOF_CACHE_SIZE,
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

type ProofResult = Result<Arc<ProofBundle>, ProofError>;
type InFlight = Shared<BoxFuture<'static, ProofResult>>;

/// Collaborators a build needs; owned by the build future, never by the cache
#[derive(Clone)]
struct Sources {
    client: Arc<dyn ChainClient>,
    rpc: Arc<dyn ProofRpc>,
    backend: Arc<dyn ProofBackend>,
    settings: Arc<ProofSettings>,
}

#[derive(Clone)]
pub struct ProofBuilder {
    sources: Sources,
    cache: Arc<Mutex<BoundedCache<ProofKey, InFlight>>>,
}

impl ProofBuilder {
    pub fn new(
        client: Arc<dyn ChainClient>,
        rpc: Arc<dyn ProofRpc>,
        backend: Arc<dyn ProofBackend>,
        settings: ProofSettings,
    ) -> Self {
        let cache = BoundedCache::new(settings.cache_size);
        Self {
            sources: Sources {
                client,
                rpc,
                backend,
                settings: Arc::new(settings),
            },
            cache: Arc::new(Mutex::new(cache)),
        }
    }

    pub fn settings(&self) -> &ProofSettings {
        &self.sources.settings
    }

    /// Bundle for a lock/burn event at `request.block_number`
    pub async fn build_claim_proof(&self, request: &ClaimRequest) -> ProofResult {
        let sources = self.sources.clone();
        let request = request.clone();
        self.memoized(ProofKey::Claim(request.block_hash), move || {
            assemble_claim(sources, request).boxed()
        })
        .await
    }

    /// Bundle for a token registration. Waits on the backend for the signed
    /// register proof according to `poll`.
    pub async fn build_register_proof(&self, token: Address, poll: &PollConfig) -> ProofResult {
        let sources = self.sources.clone();
        let poll = poll.clone();
        self.memoized(ProofKey::Register(token), move || {
            assemble_register(sources, token, poll).boxed()
        })
        .await
    }

    /// A completed bundle already in the cache
    pub async fn cached(&self, key: &ProofKey) -> Option<Arc<ProofBundle>> {
        let mut cache = self.cache.lock().await;
        cache
            .get(key)
            .and_then(|in_flight| in_flight.peek().cloned())
            .and_then(Result::ok)
    }

    async fn memoized<F>(&self, key: ProofKey, build: F) -> ProofResult
    where
        F: FnOnce() -> BoxFuture<'static, ProofResult>,
    {
        let in_flight = {
            let mut cache = self.cache.lock().await;
            match cache.get(&key) {
                Some(existing) => {
                    debug!(key = ?key, "Joining cached proof build");
                    existing.clone()
                }
                None => {
                    let in_flight = build().shared();
                    cache.insert(key.clone(), in_flight.clone());
                    in_flight
                }
            }
        };

        let result = in_flight.clone().await;
        if let Err(e) = &result {
            let mut cache = self.cache.lock().await;
            // a retry may already have replaced the failed entry
            if cache
                .peek(&key)
                .is_some_and(|cached| Shared::ptr_eq(cached, &in_flight))
            {
                cache.remove(&key);
                debug!(key = ?key, error = %e, "Evicted failed proof build");
            }
        }
        result
    }
}

// ============================================================================
// Assembly
// ============================================================================

async fn fetch_header(sources: &Sources, number: u64, expected: B256) -> Result<Header, ProofError> {
    let header = sources
        .client
        .query_block_header(BlockId::Number(number))
        .await
        .map_err(|e| ProofError::Fetch(format!("header #{}: {}", number, e)))?;

    if header.hash != expected || header.number != number {
        return Err(ProofError::HeaderMismatch {
            block: number,
            expected: bytes32_to_hex(&expected.0),
            actual: bytes32_to_hex(&header.hash.0),
        });
    }
    Ok(header)
}

async fn finish(
    sources: &Sources,
    subject: ProofSubject,
    header: Header,
    anchor: Anchor,
    storage_key: Bytes,
) -> ProofResult {
    let block = header.number;
    let mmr_size = checked_mmr_size_for_leaves(anchor.index()).ok_or_else(|| {
        ProofError::MalformedMmrProof(format!(
            "root index {} exceeds the supported MMR size",
            anchor.index()
        ))
    })?;

    let mmr_proof = sources
        .rpc
        .mmr_proof(block, mmr_size)
        .await
        .map_err(|e| ProofError::Fetch(format!("mmr proof for #{}: {}", block, e)))?;
    if mmr_proof.mmr_size != mmr_size {
        return Err(ProofError::MalformedMmrProof(format!(
            "requested size {}, got {}",
            mmr_size, mmr_proof.mmr_size
        )));
    }
    verify_leaf(&anchor.root(), block, &header.hash, &mmr_proof)?;

    let nodes = sources
        .rpc
        .read_proof(header.hash, std::slice::from_ref(&storage_key))
        .await
        .map_err(|e| ProofError::Fetch(format!("storage proof for #{}: {}", block, e)))?;
    if nodes.is_empty() {
        return Err(ProofError::Fetch(format!(
            "storage proof for #{} is empty",
            block
        )));
    }

    let (root_message, signatures) = match &anchor {
        Anchor::Best(_) => (None, None),
        Anchor::Historical {
            index,
            root,
            signatures,
        } => {
            let settings = &sources.settings;
            let message =
                RootMessage::new(&settings.chain_prefix, settings.method_id, *index, *root)?;
            (Some(message.to_bytes()), Some(signatures.clone()))
        }
    };

    info!(
        block,
        mmr_index = anchor.index(),
        best_root = root_message.is_none(),
        "Proof bundle assembled"
    );

    Ok(Arc::new(ProofBundle {
        subject,
        header,
        root: anchor.root(),
        mmr_index: anchor.index(),
        mmr_proof,
        storage_proof: encode_storage_proof(&nodes),
        root_message,
        signatures,
    }))
}

async fn assemble_claim(sources: Sources, request: ClaimRequest) -> ProofResult {
    let block = request.block_number;
    let storage_key = sources.settings.storage_keys.key_for(block)?;
    let header = fetch_header(&sources, block, request.block_hash).await?;

    let best = sources
        .backend
        .best_root()
        .await
        .map_err(|e| ProofError::Fetch(format!("best root: {}", e)))?;
    let anchor = select_anchor(
        block,
        Some(best),
        request.mmr_index,
        request.mmr_root,
        &request.signatures,
    )?;

    finish(&sources, ProofSubject::Claim(request), header, anchor, storage_key).await
}

async fn assemble_register(sources: Sources, token: Address, poll: PollConfig) -> ProofResult {
    let poller = RecordPoller::new(poll);
    let backend = sources.backend.clone();
    let doc = poller
        .poll(
            |attempt| {
                let backend = backend.clone();
                async move {
                    debug!(token = %token, attempt, "Polling for register proof");
                    backend.register_proof(token).await
                }
            },
            Option::is_none,
        )
        .await
        .map_err(|e| ProofError::Fetch(e.to_string()))?
        .ok_or_else(|| {
            warn!(token = %token, "Register proof still unavailable");
            ProofError::Fetch(format!("register proof for {} is not available yet", token))
        })?;

    let header = fetch_header(&sources, doc.block_num, doc.block_hash).await?;
    let anchor = select_anchor(doc.block_num, None, doc.mmr_index, doc.mmr_root, &doc.signatures)?;
    let storage_key = sources.settings.register_proof_key.clone();

    finish(&sources, ProofSubject::Register(doc), header, anchor, storage_key).await
}
