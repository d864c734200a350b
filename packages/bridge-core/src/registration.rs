//! Two-phase ERC20 token registration
//!
//! ```text
//! Unregistered ──registerToken──▶ Registering ──poll backend──▶ ProofReady ──confirmRegistration──▶ Registered
//! ```
//!
//! Both on-chain steps run as [`TransactionLifecycle`]s. The wait for the
//! register proof is driven by [`RecordPoller`](crate::poller::RecordPoller)
//! inside the proof builder and may take an unbounded time. A user who
//! navigates away and back is rehydrated from the destination contract's
//! status plus the session's stored proofs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use alloy::primitives::Address;
use async_trait::async_trait;
use eyre::{eyre, Result};
use futures::{FutureExt, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::BoundedCache;
use crate::client::{submit_when_connected, ChainClient, NativeStatus, Signer};
use crate::contracts::{confirm_registration_call, register_token_call};
use crate::error::ProofError;
use crate::lifecycle::{
    CallFuture, ConfirmGate, OnFinalize, TransactionLifecycle, Tx, TxKind, TxSubscription,
    WeakTxSubscription,
};
use crate::poller::PollConfig;
use crate::proof::{ProofBuilder, ProofBundle, ProofKey, ProofSubject};
use crate::types::RegisterProofDoc;

/// Registration state as reported by the destination backing contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationStatus {
    Unregistered,
    Registering,
    Registered,
}

impl TryFrom<u8> for RegistrationStatus {
    type Error = eyre::Report;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RegistrationStatus::Unregistered),
            1 => Ok(RegistrationStatus::Registering),
            2 => Ok(RegistrationStatus::Registered),
            other => Err(eyre!("Unknown registration status {}", other)),
        }
    }
}

#[async_trait]
pub trait TokenRegistry: Send + Sync {
    async fn registration_status(&self, token: Address) -> Result<RegistrationStatus>;
}

/// A register proof bundle together with the backend document it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredProof {
    pub token: Address,
    pub descriptor: RegisterProofDoc,
    pub bundle: Arc<ProofBundle>,
}

/// Where a token stands in the workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationPhase {
    Unregistered,
    Registering,
    ProofReady(Arc<StoredProof>),
    Registered,
}

/// Result of asking to register a token
#[derive(Debug)]
pub enum RegisterOutcome {
    /// A registerToken lifecycle (already failed if the status pre-check failed)
    Submitted(TxSubscription),
    AlreadyRegistering,
    AlreadyRegistered,
}

#[derive(Debug, Clone)]
pub struct RegistrationSettings {
    /// Backing contract that accepts `registerToken` on the source chain
    pub source_backing: Address,
    /// Backing contract that accepts `confirmRegistration` on the destination chain
    pub destination_backing: Address,
    /// How to wait for the relayer's register proof
    pub proof_poll: PollConfig,
    /// How to wait for a chain client's connection before each call
    pub connect_poll: PollConfig,
    /// Stored proofs kept for the session
    pub stored_capacity: usize,
}

#[derive(Clone)]
pub struct RegistrationWorkflow {
    source: Arc<dyn ChainClient>,
    destination: Arc<dyn ChainClient>,
    registry: Arc<dyn TokenRegistry>,
    proofs: ProofBuilder,
    settings: Arc<RegistrationSettings>,
    stored: Arc<StdMutex<BoundedCache<Address, Arc<StoredProof>>>>,
    pending: Arc<PendingMap>,
    next_attempt: Arc<AtomicU64>,
    submit_lock: Arc<Mutex<()>>,
}

/// A registerToken attempt made this session
struct PendingRegistration {
    attempt: u64,
    lifecycle: WeakTxSubscription,
    submitted: Arc<AtomicBool>,
}

impl PendingRegistration {
    /// Holds the token until the call reaches the chain, or for good once it has
    fn is_live(&self) -> bool {
        self.submitted.load(Ordering::SeqCst) || self.lifecycle.is_alive()
    }
}

type PendingMap = StdMutex<HashMap<Address, PendingRegistration>>;

fn release(pending: &PendingMap, token: Address, attempt: u64) {
    let mut pending = pending.lock().unwrap_or_else(|p| p.into_inner());
    if pending
        .get(&token)
        .is_some_and(|entry| entry.attempt == attempt)
    {
        pending.remove(&token);
        debug!(token = %token, attempt, "Released pending registration");
    }
}

/// Releases an attempt whose call never reached the chain: declined,
/// rejected, or dropped along with its lifecycle.
struct PendingGuard {
    pending: Arc<PendingMap>,
    token: Address,
    attempt: u64,
    armed: bool,
}

impl PendingGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            release(&self.pending, self.token, self.attempt);
        }
    }
}

fn is_failure(status: &Result<NativeStatus>) -> bool {
    match status {
        Ok(status) => matches!(Tx::from_native(status), Some(Tx::Error { .. })),
        Err(_) => true,
    }
}

impl RegistrationWorkflow {
    pub fn new(
        source: Arc<dyn ChainClient>,
        destination: Arc<dyn ChainClient>,
        registry: Arc<dyn TokenRegistry>,
        proofs: ProofBuilder,
        settings: RegistrationSettings,
    ) -> Self {
        let stored = BoundedCache::new(settings.stored_capacity);
        Self {
            source,
            destination,
            registry,
            proofs,
            settings: Arc::new(settings),
            stored: Arc::new(StdMutex::new(stored)),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            next_attempt: Arc::new(AtomicU64::new(0)),
            submit_lock: Arc::new(Mutex::new(())),
        }
    }

    fn is_pending(&self, token: &Address) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        match pending.get(token) {
            Some(entry) if entry.is_live() => true,
            Some(entry) => {
                debug!(token = %token, attempt = entry.attempt, "Dropping abandoned registration");
                pending.remove(token);
                false
            }
            None => false,
        }
    }

    fn stored(&self, token: &Address) -> Option<Arc<StoredProof>> {
        self.stored
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(token)
            .cloned()
    }

    fn store(&self, proof: Arc<StoredProof>) {
        self.stored
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(proof.token, proof);
    }

    /// Submit `registerToken` unless the token is already on its way.
    ///
    /// A token submitted earlier in this session counts as registering until
    /// its call fails, the user declines the prompt, or every subscription to
    /// an unconfirmed attempt is dropped.
    pub async fn register(
        &self,
        token: Address,
        signer: Signer,
        gate: ConfirmGate,
        on_finalize: Option<OnFinalize>,
    ) -> RegisterOutcome {
        let _submitting = self.submit_lock.lock().await;

        if self.is_pending(&token) {
            debug!(token = %token, "Registration already submitted this session");
            return RegisterOutcome::AlreadyRegistering;
        }

        let status = match self.registry.registration_status(token).await {
            Ok(status) => status,
            Err(e) => {
                warn!(token = %token, error = %e, "Registration status check failed");
                return RegisterOutcome::Submitted(TxSubscription::failed(
                    TxKind::Register,
                    e.to_string(),
                ));
            }
        };
        match status {
            RegistrationStatus::Registering => return RegisterOutcome::AlreadyRegistering,
            RegistrationStatus::Registered => return RegisterOutcome::AlreadyRegistered,
            RegistrationStatus::Unregistered => {}
        }

        let attempt = self.next_attempt.fetch_add(1, Ordering::SeqCst);
        info!(
            token = %token,
            attempt,
            signer = %signer.account(),
            "Submitting token registration"
        );

        let submitted = Arc::new(AtomicBool::new(false));
        let guard = PendingGuard {
            pending: self.pending.clone(),
            token,
            attempt,
            armed: true,
        };
        let source = self.source.clone();
        let connect = self.settings.connect_poll.clone();
        let call_pending = self.pending.clone();
        let call_submitted = submitted.clone();
        let call = register_token_call(self.settings.source_backing, token);
        let call: CallFuture = async move {
            let statuses = submit_when_connected(&*source, call, &signer, &connect).await?;
            call_submitted.store(true, Ordering::SeqCst);
            guard.disarm();
            Ok(statuses
                .inspect(move |status| {
                    if is_failure(status) {
                        release(&call_pending, token, attempt);
                    }
                })
                .boxed())
        }
        .boxed();

        // the driver's guard release must not run before the entry exists
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        let sub = TransactionLifecycle::new(TxKind::Register).submit(gate, call, on_finalize);
        pending.insert(
            token,
            PendingRegistration {
                attempt,
                lifecycle: sub.downgrade(),
                submitted,
            },
        );
        drop(pending);

        RegisterOutcome::Submitted(sub)
    }

    /// Current phase, rebuilt from the destination contract and stored proofs
    pub async fn status(&self, token: Address) -> Result<RegistrationPhase> {
        let status = self.registry.registration_status(token).await?;
        let phase = match status {
            RegistrationStatus::Registered => RegistrationPhase::Registered,
            RegistrationStatus::Unregistered if !self.is_pending(&token) => {
                RegistrationPhase::Unregistered
            }
            _ => match self.stored_or_cached(token).await {
                Some(proof) => RegistrationPhase::ProofReady(proof),
                None => RegistrationPhase::Registering,
            },
        };
        debug!(token = %token, phase = ?phase, "Registration phase");
        Ok(phase)
    }

    async fn stored_or_cached(&self, token: Address) -> Option<Arc<StoredProof>> {
        if let Some(proof) = self.stored(&token) {
            return Some(proof);
        }
        let bundle = self.proofs.cached(&ProofKey::Register(token)).await?;
        let proof = Arc::new(StoredProof::from_bundle(token, bundle).ok()?);
        self.store(proof.clone());
        Some(proof)
    }

    /// Wait for the relayer's register proof and keep it for the session
    pub async fn await_proof(&self, token: Address) -> Result<Arc<StoredProof>, ProofError> {
        if let Some(proof) = self.stored(&token) {
            return Ok(proof);
        }

        let bundle = self
            .proofs
            .build_register_proof(token, &self.settings.proof_poll)
            .await?;
        let proof = Arc::new(StoredProof::from_bundle(token, bundle)?);
        self.store(proof.clone());
        info!(
            token = %token,
            block = proof.descriptor.block_num,
            "Register proof ready"
        );
        Ok(proof)
    }

    /// Submit `confirmRegistration` with the token's register proof. A proof
    /// failure ends the lifecycle with `Error`.
    ///
    /// The proof wait runs after the gate opens, so the lifecycle stays at
    /// `Signing` until the relayer publishes it. Callers that prompt the user
    /// should [`await_proof`](Self::await_proof) first.
    pub fn confirm(
        &self,
        token: Address,
        signer: Signer,
        gate: ConfirmGate,
        on_finalize: Option<OnFinalize>,
    ) -> TxSubscription {
        let this = self.clone();
        let call: CallFuture = async move {
            let proof = this.await_proof(token).await?;
            let call = confirm_registration_call(this.settings.destination_backing, &proof.bundle)?;
            submit_when_connected(&*this.destination, call, &signer, &this.settings.connect_poll)
                .await
        }
        .boxed();

        TransactionLifecycle::new(TxKind::Confirm).submit(gate, call, on_finalize)
    }
}

impl StoredProof {
    fn from_bundle(token: Address, bundle: Arc<ProofBundle>) -> Result<Self, ProofError> {
        match &bundle.subject {
            ProofSubject::Register(doc) => Ok(Self {
                token,
                descriptor: doc.clone(),
                bundle: bundle.clone(),
            }),
            ProofSubject::Claim(_) => Err(ProofError::MalformedDocument(
                "claim bundle stored under a register key".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::TokenBacking;
    use crate::lifecycle::{confirmed, declined, gate_from_oneshot};
    use crate::proof::ProofSettings;
    use crate::storage_keys::StorageKeyTable;
    use crate::testing::{MockBackend, MockChain, MockTokenRegistry};
    use crate::types::BestRoot;
    use alloy::primitives::Bytes;
    use alloy::sol_types::SolCall;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    const SOURCE_BACKING: Address = Address::repeat_byte(0xa1);
    const DEST_BACKING: Address = Address::repeat_byte(0xb2);

    struct Harness {
        source: Arc<MockChain>,
        destination: Arc<MockChain>,
        backend: Arc<MockBackend>,
        registry: Arc<MockTokenRegistry>,
        proofs: ProofBuilder,
        workflow: RegistrationWorkflow,
    }

    fn harness() -> Harness {
        let source = Arc::new(MockChain::with_blocks("wss://pangolin.example.org", 50));
        let destination = Arc::new(MockChain::new("https://ropsten.example.org"));
        let backend = Arc::new(MockBackend::new());
        backend.set_best_root(BestRoot {
            index: 10,
            root: source.root_at(10).unwrap(),
        });
        let registry = Arc::new(MockTokenRegistry::new());

        let proofs = ProofBuilder::new(
            source.clone(),
            source.clone(),
            backend.clone(),
            ProofSettings::new(
                StorageKeyTable::single("0x01").unwrap(),
                Bytes::from(vec![0xe6, 0x6f]),
            ),
        );
        let workflow = workflow_for(&source, &destination, &registry, &proofs);
        Harness {
            source,
            destination,
            backend,
            registry,
            proofs,
            workflow,
        }
    }

    fn workflow_for(
        source: &Arc<MockChain>,
        destination: &Arc<MockChain>,
        registry: &Arc<MockTokenRegistry>,
        proofs: &ProofBuilder,
    ) -> RegistrationWorkflow {
        RegistrationWorkflow::new(
            source.clone(),
            destination.clone(),
            registry.clone(),
            proofs.clone(),
            RegistrationSettings {
                source_backing: SOURCE_BACKING,
                destination_backing: DEST_BACKING,
                proof_poll: PollConfig::unbounded(Duration::from_secs(5)),
                connect_poll: PollConfig::bounded(Duration::from_millis(100), 3),
                stored_capacity: 16,
            },
        )
    }

    fn register_calls(chain: &MockChain) -> usize {
        chain.calls_to(SOURCE_BACKING, TokenBacking::registerTokenCall::SELECTOR)
    }

    #[tokio::test]
    async fn test_register_twice_submits_once() {
        let h = harness();
        let token = Address::repeat_byte(0x11);

        let first = h
            .workflow
            .register(token, Signer::new("0xuser"), confirmed(), None)
            .await;
        let RegisterOutcome::Submitted(sub) = first else {
            panic!("first registration must submit");
        };
        let second = h
            .workflow
            .register(token, Signer::new("0xuser"), confirmed(), None)
            .await;
        assert!(matches!(second, RegisterOutcome::AlreadyRegistering));

        assert!(matches!(sub.terminal().await, Some(Tx::Finalized { .. })));
        assert_eq!(register_calls(&h.source), 1);
    }

    #[tokio::test]
    async fn test_register_short_circuits_on_chain_status() {
        let h = harness();
        let registering = Address::repeat_byte(0x21);
        let registered = Address::repeat_byte(0x22);
        h.registry
            .set_status(registering, RegistrationStatus::Registering);
        h.registry
            .set_status(registered, RegistrationStatus::Registered);

        for _ in 0..2 {
            let outcome = h
                .workflow
                .register(registering, Signer::new("0xuser"), confirmed(), None)
                .await;
            assert!(matches!(outcome, RegisterOutcome::AlreadyRegistering));
        }
        let outcome = h
            .workflow
            .register(registered, Signer::new("0xuser"), confirmed(), None)
            .await;
        assert!(matches!(outcome, RegisterOutcome::AlreadyRegistered));
        assert_eq!(h.source.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_declined_or_failed_registration_can_be_retried() {
        let h = harness();
        let token = Address::repeat_byte(0x31);

        let RegisterOutcome::Submitted(sub) = h
            .workflow
            .register(token, Signer::new("0xuser"), declined(), None)
            .await
        else {
            panic!("expected submission");
        };
        assert!(sub.collect().await.is_empty());

        h.source.reject_next_submit("User rejected the request");
        let RegisterOutcome::Submitted(sub) = h
            .workflow
            .register(token, Signer::new("0xuser"), confirmed(), None)
            .await
        else {
            panic!("declined registration must be retryable");
        };
        assert_eq!(
            sub.terminal().await,
            Some(Tx::Error {
                detail: "User rejected the request".to_string()
            })
        );

        let RegisterOutcome::Submitted(sub) = h
            .workflow
            .register(token, Signer::new("0xuser"), confirmed(), None)
            .await
        else {
            panic!("rejected registration must be retryable");
        };
        assert!(matches!(sub.terminal().await, Some(Tx::Finalized { .. })));
        assert_eq!(h.source.submit_calls(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_prompt_frees_token() {
        let h = harness();
        let token = Address::repeat_byte(0x35);

        let (answer, rx) = oneshot::channel();
        let RegisterOutcome::Submitted(sub) = h
            .workflow
            .register(token, Signer::new("0xuser"), gate_from_oneshot(rx), None)
            .await
        else {
            panic!("expected submission");
        };
        let again = h
            .workflow
            .register(token, Signer::new("0xuser"), confirmed(), None)
            .await;
        assert!(matches!(again, RegisterOutcome::AlreadyRegistering));

        // the user navigates away before answering the prompt
        drop(sub);
        drop(answer);
        assert_eq!(
            h.workflow.status(token).await.unwrap(),
            RegistrationPhase::Unregistered
        );

        let RegisterOutcome::Submitted(sub) = h
            .workflow
            .register(token, Signer::new("0xuser"), confirmed(), None)
            .await
        else {
            panic!("abandoned registration must be retryable");
        };
        assert!(matches!(sub.terminal().await, Some(Tx::Finalized { .. })));
        assert_eq!(register_calls(&h.source), 1);

        // the aborted attempt winding down must not free the live one
        tokio::task::yield_now().await;
        assert_eq!(
            h.workflow.status(token).await.unwrap(),
            RegistrationPhase::Registering
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_waits_for_source_connection() {
        let h = harness();
        let token = Address::repeat_byte(0x37);
        h.source.set_connected(false);

        let RegisterOutcome::Submitted(sub) = h
            .workflow
            .register(token, Signer::new("0xuser"), confirmed(), None)
            .await
        else {
            panic!("expected submission");
        };
        let Some(Tx::Error { detail }) = sub.terminal().await else {
            panic!("expected connection failure");
        };
        assert!(detail.starts_with("wss://pangolin.example.org is unavailable"));
        assert_eq!(h.source.submit_calls(), 0);
        assert_eq!(
            h.workflow.status(token).await.unwrap(),
            RegistrationPhase::Unregistered
        );

        h.source.set_connected(true);
        let RegisterOutcome::Submitted(sub) = h
            .workflow
            .register(token, Signer::new("0xuser"), confirmed(), None)
            .await
        else {
            panic!("expected submission");
        };
        assert!(matches!(sub.terminal().await, Some(Tx::Finalized { .. })));
    }

    #[tokio::test]
    async fn test_status_check_failure_becomes_error_tx() {
        let h = harness();
        h.registry.set_unavailable(true);
        let RegisterOutcome::Submitted(sub) = h
            .workflow
            .register(Address::repeat_byte(0x41), Signer::new("0xuser"), confirmed(), None)
            .await
        else {
            panic!("expected failed lifecycle");
        };
        assert!(matches!(sub.terminal().await, Some(Tx::Error { .. })));
        assert_eq!(h.source.submit_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_registration_flow() {
        let h = harness();
        let token = Address::repeat_byte(0x51);
        let finalized = Arc::new(AtomicU32::new(0));

        let counter = finalized.clone();
        let hook: OnFinalize = Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let RegisterOutcome::Submitted(sub) = h
            .workflow
            .register(token, Signer::new("0xuser"), confirmed(), Some(hook))
            .await
        else {
            panic!("expected submission");
        };
        assert!(matches!(sub.terminal().await, Some(Tx::Finalized { .. })));
        assert_eq!(finalized.load(Ordering::SeqCst), 1);

        // still unregistered on chain, but submitted this session
        assert_eq!(
            h.workflow.status(token).await.unwrap(),
            RegistrationPhase::Registering
        );

        h.registry
            .set_status(token, RegistrationStatus::Registering);
        h.backend
            .publish_register_proof(token, h.source.register_doc(30, 40), 2);

        let proof = h.workflow.await_proof(token).await.unwrap();
        assert_eq!(proof.descriptor.block_num, 30);
        assert!(matches!(
            h.workflow.status(token).await.unwrap(),
            RegistrationPhase::ProofReady(_)
        ));

        let confirm = h
            .workflow
            .confirm(token, Signer::new("0xuser"), confirmed(), None)
            .terminal()
            .await;
        assert!(matches!(confirm, Some(Tx::Finalized { .. })));

        let confirms = h
            .destination
            .calls_to(DEST_BACKING, TokenBacking::confirmRegistrationCall::SELECTOR);
        assert_eq!(confirms, 1);
        let crate::client::ChainCall::Contract { data, .. } = &h.destination.submitted_calls()[0]
        else {
            panic!("expected contract call");
        };
        let decoded = TokenBacking::confirmRegistrationCall::abi_decode(data, true).unwrap();
        assert_eq!(decoded.root, proof.descriptor.mmr_root);
        assert_eq!(decoded.mmrIndex, 40);
        assert_eq!(decoded.signatures.len(), 2);

        h.registry
            .set_status(token, RegistrationStatus::Registered);
        assert_eq!(
            h.workflow.status(token).await.unwrap(),
            RegistrationPhase::Registered
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rehydrates_after_navigation() {
        let h = harness();
        let token = Address::repeat_byte(0x61);
        h.registry
            .set_status(token, RegistrationStatus::Registering);
        h.backend
            .publish_register_proof(token, h.source.register_doc(12, 20), 0);

        h.workflow.await_proof(token).await.unwrap();
        drop(h.workflow);

        // a fresh view over the same session-wide proof builder
        let revisited = workflow_for(&h.source, &h.destination, &h.registry, &h.proofs);
        let phase = revisited.status(token).await.unwrap();
        let RegistrationPhase::ProofReady(proof) = phase else {
            panic!("expected stored proof, got {:?}", phase);
        };
        assert_eq!(proof.descriptor.block_num, 12);
        assert_eq!(h.backend.register_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_surfaces_proof_failure() {
        let h = harness();
        let token = Address::repeat_byte(0x71);
        let mut doc = h.source.register_doc(12, 20);
        doc.block_hash = alloy::primitives::B256::from([0xee; 32]);
        h.backend.publish_register_proof(token, doc, 0);

        let terminal = h
            .workflow
            .confirm(token, Signer::new("0xuser"), confirmed(), None)
            .terminal()
            .await;
        let Some(Tx::Error { detail }) = terminal else {
            panic!("expected error, got {:?}", terminal);
        };
        assert!(detail.starts_with("Header mismatch for block 12"));
        assert_eq!(h.destination.submit_calls(), 0);
    }
}
