//! In-memory relayer backend

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use alloy::primitives::Address;
use async_trait::async_trait;
use eyre::{eyre, Result};

use crate::backend::ProofBackend;
use crate::types::{BestRoot, RecordPage, RecordQuery, RegisterProofDoc, TransferRecord};

struct PendingProof {
    doc: RegisterProofDoc,
    /// Lookups that still answer "not yet"
    hidden_for: u32,
}

#[derive(Default)]
pub struct MockBackend {
    best: Mutex<Option<BestRoot>>,
    register_proofs: Mutex<HashMap<Address, PendingProof>>,
    records: Mutex<Vec<TransferRecord>>,
    failures: AtomicU32,
    register_calls: AtomicU32,
    best_calls: AtomicU32,
    record_calls: AtomicU32,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_best_root(&self, best: BestRoot) {
        *self.best.lock().unwrap() = Some(best);
    }

    /// Serve `doc` for `token` once `hidden_for` lookups have returned nothing
    pub fn publish_register_proof(&self, token: Address, doc: RegisterProofDoc, hidden_for: u32) {
        self.register_proofs
            .lock()
            .unwrap()
            .insert(token, PendingProof { doc, hidden_for });
    }

    pub fn push_record(&self, record: TransferRecord) {
        self.records.lock().unwrap().push(record);
    }

    /// Fail the next `count` requests of any kind with a 503
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn register_calls(&self) -> u32 {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn best_calls(&self) -> u32 {
        self.best_calls.load(Ordering::SeqCst)
    }

    pub fn record_calls(&self) -> u32 {
        self.record_calls.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self) -> Result<()> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(eyre!("Backend returned 503 Service Unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ProofBackend for MockBackend {
    async fn register_proof(&self, token: Address) -> Result<Option<RegisterProofDoc>> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_fail()?;

        let mut proofs = self.register_proofs.lock().unwrap();
        let Some(pending) = proofs.get_mut(&token) else {
            return Ok(None);
        };
        if pending.hidden_for > 0 {
            pending.hidden_for -= 1;
            return Ok(None);
        }
        Ok(Some(pending.doc.clone()))
    }

    async fn best_root(&self) -> Result<BestRoot> {
        self.best_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_fail()?;
        self.best
            .lock()
            .unwrap()
            .ok_or_else(|| eyre!("Backend has no best MMR root yet"))
    }

    async fn records(&self, query: &RecordQuery) -> Result<RecordPage> {
        self.record_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_fail()?;

        let records = self.records.lock().unwrap();
        let matching: Vec<&TransferRecord> = records
            .iter()
            .filter(|r| r.sender == query.account || r.recipient == query.account)
            .collect();
        let start = (query.page as usize).saturating_mul(query.size as usize);
        Ok(RecordPage {
            total: matching.len() as u64,
            records: matching
                .into_iter()
                .skip(start)
                .take(query.size as usize)
                .cloned()
                .collect(),
        })
    }
}
