//! Scripted chain for tests
//!
//! `MockChain` is both a [`ChainClient`] and a [`ProofRpc`]. Block `n` has
//! hash `keccak256("block" ++ n)` and every block is a leaf of an in-memory
//! header MMR, so proofs it serves verify against [`MockChain::root_at`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use eyre::{eyre, Result};
use futures::stream::{self, StreamExt};

use super::memory_mmr::MemoryMmr;
use crate::client::{ChainCall, ChainClient, NativeStatus, ProofRpc, Signer, StatusStream};
use crate::hash::{bytes32_to_hex, keccak256};
use crate::mmr::{leaf_count_for_size, MmrProof};
use crate::types::{BlockId, Header, RawRegisterProof, RegisterProofDoc, SignatureList};

#[derive(Default)]
struct Counters {
    submits: AtomicU32,
    headers: AtomicU32,
    storage: AtomicU32,
    mmr_proofs: AtomicU32,
    read_proofs: AtomicU32,
    connects: AtomicU32,
}

pub struct MockChain {
    endpoint: String,
    mmr: Mutex<MemoryMmr>,
    latency: Mutex<Duration>,
    scripts: Mutex<VecDeque<Vec<Result<NativeStatus, String>>>>,
    submit_errors: Mutex<VecDeque<String>>,
    submitted: Mutex<Vec<(ChainCall, Signer)>>,
    read_proof_keys: Mutex<Vec<Bytes>>,
    connected: AtomicBool,
    connect_countdown: Mutex<Option<u32>>,
    mmr_proof_override: Mutex<Option<MmrProof>>,
    counters: Counters,
}

impl MockChain {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            mmr: Mutex::new(MemoryMmr::new()),
            latency: Mutex::new(Duration::ZERO),
            scripts: Mutex::new(VecDeque::new()),
            submit_errors: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            read_proof_keys: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            connect_countdown: Mutex::new(None),
            mmr_proof_override: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn with_blocks(endpoint: &str, count: u64) -> Self {
        let chain = Self::new(endpoint);
        chain.produce_blocks(count);
        chain
    }

    pub fn block_hash(number: u64) -> B256 {
        let mut data = b"block".to_vec();
        data.extend_from_slice(&number.to_be_bytes());
        B256::from(keccak256(&data))
    }

    pub fn produce_blocks(&self, count: u64) {
        let mut mmr = self.mmr.lock().unwrap();
        for _ in 0..count {
            let number = mmr.leaf_count();
            mmr.push(Self::block_hash(number));
        }
    }

    pub fn best_block(&self) -> Option<u64> {
        self.mmr.lock().unwrap().leaf_count().checked_sub(1)
    }

    pub fn root_at(&self, leaf_count: u64) -> Option<B256> {
        self.mmr.lock().unwrap().root_at(leaf_count)
    }

    /// A register proof document for `block`, signed over the root at `mmr_index`
    pub fn register_doc(&self, block: u64, mmr_index: u64) -> RegisterProofDoc {
        let raw = RawRegisterProof {
            block_hash: bytes32_to_hex(&Self::block_hash(block).0),
            block_num: block,
            mmr_index,
            mmr_root: bytes32_to_hex(&self.root_at(mmr_index).unwrap_or_default().0),
            signatures: SignatureList::Joined(format!("0x{},0x{}", "aa".repeat(65), "bb".repeat(65))),
        };
        RegisterProofDoc::try_from(raw).unwrap()
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Statuses for the next submission. Unscripted submissions run
    /// Ready → InBlock → Finalized.
    pub fn script_statuses(&self, statuses: Vec<NativeStatus>) {
        self.scripts
            .lock()
            .unwrap()
            .push_back(statuses.into_iter().map(Ok).collect());
    }

    /// Statuses for the next submission, ending in a stream error
    pub fn script_stream_error(&self, mut statuses: Vec<NativeStatus>, error: &str) {
        let mut script: Vec<Result<NativeStatus, String>> = statuses.drain(..).map(Ok).collect();
        script.push(Err(error.to_string()));
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Reject the next submission before it reaches the pool
    pub fn reject_next_submit(&self, error: &str) {
        self.submit_errors
            .lock()
            .unwrap()
            .push_back(error.to_string());
    }

    pub fn submitted_calls(&self) -> Vec<ChainCall> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .map(|(call, _)| call.clone())
            .collect()
    }

    pub fn submitted_signers(&self) -> Vec<Signer> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .map(|(_, signer)| signer.clone())
            .collect()
    }

    /// Calls to `to` whose calldata starts with `selector`
    pub fn calls_to(&self, to: Address, selector: [u8; 4]) -> usize {
        self.submitted_calls()
            .iter()
            .filter(|call| matches!(call, ChainCall::Contract { to: dest, .. } if *dest == to))
            .filter(|call| call.selector() == Some(selector))
            .count()
    }

    pub fn read_proof_keys(&self) -> Vec<Bytes> {
        self.read_proof_keys.lock().unwrap().clone()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// After `connect()`, report connected on the `polls`-th status check
    pub fn connect_after_polls(&self, polls: u32) {
        *self.connect_countdown.lock().unwrap() = Some(polls);
    }

    /// Serve `proof` for every MMR proof request instead of the real one
    pub fn override_mmr_proof(&self, proof: MmrProof) {
        *self.mmr_proof_override.lock().unwrap() = Some(proof);
    }

    pub fn submit_calls(&self) -> u32 {
        self.counters.submits.load(Ordering::SeqCst)
    }

    pub fn header_calls(&self) -> u32 {
        self.counters.headers.load(Ordering::SeqCst)
    }

    pub fn storage_calls(&self) -> u32 {
        self.counters.storage.load(Ordering::SeqCst)
    }

    pub fn mmr_proof_calls(&self) -> u32 {
        self.counters.mmr_proofs.load(Ordering::SeqCst)
    }

    pub fn read_proof_calls(&self) -> u32 {
        self.counters.read_proofs.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> u32 {
        self.counters.connects.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn header(&self, number: u64) -> Option<Header> {
        if number >= self.mmr.lock().unwrap().leaf_count() {
            return None;
        }
        Some(Header {
            hash: Self::block_hash(number),
            number,
            encoded: Bytes::from(number.to_be_bytes().to_vec()),
        })
    }
}

#[async_trait]
impl ChainClient for MockChain {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn submit_call(&self, call: ChainCall, signer: &Signer) -> Result<StatusStream> {
        self.counters.submits.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.submit_errors.lock().unwrap().pop_front() {
            return Err(eyre!(error));
        }

        let hash = B256::from(keccak256(call.describe().as_bytes()));
        self.submitted.lock().unwrap().push((call, signer.clone()));

        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_else(|| {
            vec![
                Ok(NativeStatus::Ready),
                Ok(NativeStatus::InBlock(hash)),
                Ok(NativeStatus::Finalized(hash)),
            ]
        });
        let statuses = script
            .into_iter()
            .map(|status| status.map_err(|e| eyre!(e)))
            .collect::<Vec<_>>();
        Ok(stream::iter(statuses).boxed())
    }

    async fn query_storage(&self, block_hash: B256, key: &[u8]) -> Result<Option<Bytes>> {
        self.counters.storage.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let mut data = block_hash.to_vec();
        data.extend_from_slice(key);
        Ok(Some(Bytes::from(keccak256(&data).to_vec())))
    }

    async fn query_block_header(&self, block: BlockId) -> Result<Header> {
        self.counters.headers.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let number = match block {
            BlockId::Number(n) => n,
            BlockId::Hash(hash) => {
                let best = self.best_block().ok_or_else(|| eyre!("no blocks"))?;
                (0..=best)
                    .find(|n| Self::block_hash(*n) == hash)
                    .ok_or_else(|| eyre!("unknown block {}", hash))?
            }
        };
        self.header(number)
            .ok_or_else(|| eyre!("block #{} not produced yet", number))
    }

    async fn is_connected(&self) -> bool {
        let mut countdown = self.connect_countdown.lock().unwrap();
        if self.connect_calls() > 0 {
            if let Some(remaining) = countdown.as_mut() {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    self.connected.store(true, Ordering::SeqCst);
                    *countdown = None;
                }
            }
        }
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<()> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ProofRpc for MockChain {
    async fn mmr_proof(&self, leaf_index: u64, mmr_size: u64) -> Result<MmrProof> {
        self.counters.mmr_proofs.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if let Some(proof) = self.mmr_proof_override.lock().unwrap().clone() {
            return Ok(proof);
        }
        let leaf_count =
            leaf_count_for_size(mmr_size).ok_or_else(|| eyre!("invalid mmr size {}", mmr_size))?;
        self.mmr
            .lock()
            .unwrap()
            .proof_at(leaf_index, leaf_count)
            .ok_or_else(|| eyre!("leaf {} not in mmr of {} leaves", leaf_index, leaf_count))
    }

    async fn read_proof(&self, block_hash: B256, keys: &[Bytes]) -> Result<Vec<Bytes>> {
        self.counters.read_proofs.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        self.read_proof_keys
            .lock()
            .unwrap()
            .extend(keys.iter().cloned());
        Ok(keys
            .iter()
            .map(|key| {
                let mut node = block_hash.to_vec();
                node.extend_from_slice(key);
                Bytes::from(node)
            })
            .collect())
    }
}
