//! Concrete transfer, record and claim handlers
//!
//! These are the handlers bridge configuration code plugs into the
//! [`BridgeRegistry`](crate::registry::BridgeRegistry). Chain-specific call
//! encoding is injected, so one handler type serves every bridge that submits
//! a single call per transfer.

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::backend::ProofBackend;
use crate::client::{submit_when_connected, ChainCall, ChainClient, Signer};
use crate::contracts::{approve_call, unlock_from_remote_call};
use crate::lifecycle::{
    CallFuture, ConfirmGate, OnFinalize, TransactionLifecycle, TxKind, TxSubscription,
};
use crate::poller::{PollConfig, RecordPoller};
use crate::proof::ProofBuilder;
use crate::registry::{RecordHandler, TransferHandler, TransferSubmission};
use crate::types::{ClaimRequest, RecordPage, RecordQuery, TransferIntent, TransferRecord};

pub const UNSUPPORTED_DETAIL: &str = "direction not supported";

/// Builds the chain call for a transfer intent
pub type CallEncoder = Arc<dyn Fn(&TransferIntent) -> Result<ChainCall> + Send + Sync>;

fn submit(
    client: Arc<dyn ChainClient>,
    call: ChainCall,
    signer: Signer,
    connect: PollConfig,
) -> CallFuture {
    async move { submit_when_connected(&*client, call, &signer, &connect).await }.boxed()
}

// ============================================================================
// Unsupported
// ============================================================================

/// Placeholder for directions no bridge serves
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedHandler;

#[async_trait]
impl TransferHandler for UnsupportedHandler {
    fn name(&self) -> &str {
        "unsupported"
    }

    async fn transfer(
        &self,
        intent: &TransferIntent,
        _gate: ConfirmGate,
        _on_finalize: Option<OnFinalize>,
    ) -> TransferSubmission {
        debug!(direction = %intent.direction, "Transfer requested on unsupported direction");
        TransferSubmission::single(TxSubscription::failed(TxKind::Transfer, UNSUPPORTED_DETAIL))
    }
}

#[async_trait]
impl RecordHandler for UnsupportedHandler {
    fn name(&self) -> &str {
        "unsupported"
    }

    async fn records(&self, _query: &RecordQuery) -> Result<RecordPage> {
        Ok(RecordPage::default())
    }
}

// ============================================================================
// Single-call transfers
// ============================================================================

/// Submits one encoded call per transfer, optionally preceded by an ERC20
/// approval of `intent.amount` to a spender.
pub struct CallTransferHandler {
    name: String,
    client: Arc<dyn ChainClient>,
    encode: CallEncoder,
    approve_spender: Option<Address>,
    connect_poll: PollConfig,
}

impl CallTransferHandler {
    pub fn new(name: impl Into<String>, client: Arc<dyn ChainClient>, encode: CallEncoder) -> Self {
        Self {
            name: name.into(),
            client,
            encode,
            approve_spender: None,
            connect_poll: PollConfig::connection(),
        }
    }

    /// How long to wait for the client's connection before each call
    pub fn with_connect_poll(mut self, poll: PollConfig) -> Self {
        self.connect_poll = poll;
        self
    }

    /// Approve `spender` for the transferred token before each transfer.
    /// `intent.asset` must then be the token contract address.
    pub fn approve_first(mut self, spender: Address) -> Self {
        self.approve_spender = Some(spender);
        self
    }
}

#[async_trait]
impl TransferHandler for CallTransferHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transfer(
        &self,
        intent: &TransferIntent,
        gate: ConfirmGate,
        on_finalize: Option<OnFinalize>,
    ) -> TransferSubmission {
        let call = match (self.encode)(intent) {
            Ok(call) => call,
            Err(e) => {
                warn!(handler = %self.name, error = %e, "Failed to encode transfer");
                return TransferSubmission::single(TxSubscription::failed(
                    TxKind::Transfer,
                    e.to_string(),
                ));
            }
        };
        let signer = Signer::new(intent.sender.clone());
        info!(
            handler = %self.name,
            direction = %intent.direction,
            call = %call.describe(),
            amount = intent.amount,
            "Submitting transfer"
        );

        let Some(spender) = self.approve_spender else {
            let transfer = TransactionLifecycle::new(TxKind::Transfer).submit(
                gate,
                submit(self.client.clone(), call, signer, self.connect_poll.clone()),
                on_finalize,
            );
            return TransferSubmission::single(transfer);
        };

        let token: Address = match intent.asset.parse() {
            Ok(token) => token,
            Err(e) => {
                return TransferSubmission::single(TxSubscription::failed(
                    TxKind::Approve,
                    format!("Invalid token address '{}': {}", intent.asset, e),
                ));
            }
        };
        let approval = TransactionLifecycle::new(TxKind::Approve).submit(
            gate,
            submit(
                self.client.clone(),
                approve_call(token, spender, U256::from(intent.amount)),
                signer.clone(),
                self.connect_poll.clone(),
            ),
            None,
        );
        // the transfer goes out only once the approval finalizes
        let transfer = TransactionLifecycle::new(TxKind::Transfer).submit(
            approval.subscribe().finalized_gate(),
            submit(self.client.clone(), call, signer, self.connect_poll.clone()),
            on_finalize,
        );

        TransferSubmission {
            approval: Some(approval),
            transfer,
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// History from the relayer backend, retrying transient failures
pub struct BackendRecordHandler {
    name: String,
    backend: Arc<dyn ProofBackend>,
    poll: PollConfig,
}

impl BackendRecordHandler {
    pub fn new(name: impl Into<String>, backend: Arc<dyn ProofBackend>, poll: PollConfig) -> Self {
        Self {
            name: name.into(),
            backend,
            poll,
        }
    }
}

#[async_trait]
impl RecordHandler for BackendRecordHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn records(&self, query: &RecordQuery) -> Result<RecordPage> {
        let poller = RecordPoller::new(self.poll.clone());
        let page = poller
            .poll(
                |attempt| {
                    let backend = self.backend.clone();
                    let query = query.clone();
                    async move {
                        debug!(direction = %query.direction, attempt, "Fetching records");
                        backend.records(&query).await
                    }
                },
                |_| false,
            )
            .await
            .wrap_err_with(|| format!("Failed to load records for {}", query.direction))?;

        debug!(
            handler = %self.name,
            total = page.total,
            returned = page.records.len(),
            "Loaded records"
        );
        Ok(page)
    }
}

// ============================================================================
// Claims
// ============================================================================

/// Releases funds on the destination chain with a proof of the source event
#[derive(Clone)]
pub struct ClaimHandler {
    proofs: ProofBuilder,
    destination: Arc<dyn ChainClient>,
    backing: Address,
    connect_poll: PollConfig,
}

impl ClaimHandler {
    pub fn new(proofs: ProofBuilder, destination: Arc<dyn ChainClient>, backing: Address) -> Self {
        Self {
            proofs,
            destination,
            backing,
            connect_poll: PollConfig::connection(),
        }
    }

    pub fn with_connect_poll(mut self, poll: PollConfig) -> Self {
        self.connect_poll = poll;
        self
    }

    /// Claim the transfer described by a backend record
    pub fn claim_record(
        &self,
        record: &TransferRecord,
        signer: Signer,
        gate: ConfirmGate,
        on_finalize: Option<OnFinalize>,
    ) -> TxSubscription {
        match record.claim_request() {
            Ok(request) => self.claim(request, signer, gate, on_finalize),
            Err(e) => {
                warn!(tx = %record.tx_hash, error = %e, "Record is not claimable");
                TxSubscription::failed(TxKind::Claim, e.to_string())
            }
        }
    }

    /// Build the proof bundle once the user confirms, then submit
    /// `unlockFromRemote`
    pub fn claim(
        &self,
        request: ClaimRequest,
        signer: Signer,
        gate: ConfirmGate,
        on_finalize: Option<OnFinalize>,
    ) -> TxSubscription {
        let this = self.clone();
        let call: CallFuture = async move {
            let bundle = this.proofs.build_claim_proof(&request).await?;
            info!(
                block = request.block_number,
                best_root = bundle.uses_best_root(),
                "Submitting claim"
            );
            let call = unlock_from_remote_call(this.backing, &bundle)?;
            submit_when_connected(&*this.destination, call, &signer, &this.connect_poll).await
        }
        .boxed();

        TransactionLifecycle::new(TxKind::Claim).submit(gate, call, on_finalize)
    }
}
