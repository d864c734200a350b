//! Transaction lifecycle state machine
//!
//! A lifecycle wraps exactly one user-initiated call. It waits on a
//! confirmation gate, invokes the call, maps the chain's native status
//! events onto [`Tx`] and fans them out to every subscriber. States only move
//! forward:
//!
//! ```text
//! (gate) → Signing → Queued → Broadcast → InBlock → Finalized
//!                  ↘          ↘           ↘         ↘
//!                                Error (terminal, from any state)
//! ```
//!
//! The finalize hook runs once per lifecycle, in the driver task, right
//! after `Finalized` is published. Dropping every [`TxSubscription`] aborts
//! the driver, so a lifecycle cancelled before finalization never runs it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use alloy::primitives::B256;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{NativeStatus, StatusStream};

const CHANNEL_CAPACITY: usize = 16;

// ============================================================================
// Tx States
// ============================================================================

/// Observable state of one submitted call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tx {
    Signing,
    Queued { hash: Option<B256> },
    Broadcast,
    InBlock { hash: B256 },
    Finalized { hash: B256 },
    Error { detail: String },
}

/// Position of a [`Tx`] in the lifecycle order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Signing,
    Queued,
    Broadcast,
    InBlock,
    Finalized,
    Error,
}

impl Tx {
    pub fn stage(&self) -> Stage {
        match self {
            Tx::Signing => Stage::Signing,
            Tx::Queued { .. } => Stage::Queued,
            Tx::Broadcast => Stage::Broadcast,
            Tx::InBlock { .. } => Stage::InBlock,
            Tx::Finalized { .. } => Stage::Finalized,
            Tx::Error { .. } => Stage::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Tx::Finalized { .. } | Tx::Error { .. })
    }

    pub fn hash(&self) -> Option<B256> {
        match self {
            Tx::Queued { hash } => *hash,
            Tx::InBlock { hash } | Tx::Finalized { hash } => Some(*hash),
            _ => None,
        }
    }

    /// Map a chain status event. `None` means the event has no Tx counterpart.
    pub fn from_native(status: &NativeStatus) -> Option<Tx> {
        let tx = match status {
            NativeStatus::Future | NativeStatus::Ready => Tx::Queued { hash: None },
            NativeStatus::Submitted(hash) => Tx::Queued { hash: Some(*hash) },
            NativeStatus::Broadcast => Tx::Broadcast,
            NativeStatus::InBlock(hash) => Tx::InBlock { hash: *hash },
            // the pool re-includes retracted calls; wait for the next block
            NativeStatus::Retracted(_) => return None,
            NativeStatus::Finalized(hash) | NativeStatus::Confirmed(hash) => {
                Tx::Finalized { hash: *hash }
            }
            NativeStatus::FinalityTimeout(hash) => Tx::Error {
                detail: format!("finality timeout for block {}", hash),
            },
            NativeStatus::Usurped(hash) => Tx::Error {
                detail: format!("usurped by {}", hash),
            },
            NativeStatus::Dropped => Tx::Error {
                detail: "dropped from the transaction pool".to_string(),
            },
            NativeStatus::Invalid => Tx::Error {
                detail: "invalid transaction".to_string(),
            },
        };
        Some(tx)
    }
}

/// Which user action a lifecycle belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxKind {
    Approve,
    Transfer,
    Claim,
    Register,
    Confirm,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Approve => "approve",
            TxKind::Transfer => "transfer",
            TxKind::Claim => "claim",
            TxKind::Register => "register",
            TxKind::Confirm => "confirm",
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Inputs
// ============================================================================

/// Resolves to the user's answer to the confirmation prompt. Only the first
/// value is read; a closed gate counts as declined.
pub type ConfirmGate = BoxStream<'static, bool>;

/// The call to run once confirmed. Not polled until the gate opens.
pub type CallFuture = BoxFuture<'static, eyre::Result<StatusStream>>;

/// Post-success side effect such as a balance refresh
pub type OnFinalize = Box<dyn FnOnce(&Tx) + Send + 'static>;

pub fn confirmed() -> ConfirmGate {
    stream::once(async { true }).boxed()
}

pub fn declined() -> ConfirmGate {
    stream::once(async { false }).boxed()
}

/// Gate fed by a one-shot answer; dropping the sender declines
pub fn gate_from_oneshot(rx: oneshot::Receiver<bool>) -> ConfirmGate {
    stream::once(async move { rx.await.unwrap_or(false) }).boxed()
}

// ============================================================================
// Lifecycle
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct TransactionLifecycle {
    kind: TxKind,
}

impl TransactionLifecycle {
    pub fn new(kind: TxKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> TxKind {
        self.kind
    }

    /// Spawn the driver and return the first subscription to its states.
    ///
    /// Must be called inside a tokio runtime.
    pub fn submit(
        &self,
        gate: ConfirmGate,
        call: CallFuture,
        on_finalize: Option<OnFinalize>,
    ) -> TxSubscription {
        let (sender, rx) = broadcast::channel(CHANNEL_CAPACITY);
        let history = Arc::new(Mutex::new(Vec::new()));

        let publisher = Publisher {
            kind: self.kind,
            sender,
            history: history.clone(),
            last: None,
        };
        let driver = tokio::spawn(drive(publisher, gate, call, on_finalize));

        TxSubscription {
            kind: self.kind,
            replay: VecDeque::new(),
            rx: Some(rx),
            shared: Arc::new(Shared {
                history,
                driver: Some(driver),
            }),
            done: false,
        }
    }
}

/// Publishes states in order, dropping repeats and regressions
struct Publisher {
    kind: TxKind,
    sender: broadcast::Sender<Tx>,
    history: Arc<Mutex<Vec<Tx>>>,
    last: Option<Stage>,
}

impl Publisher {
    /// Returns whether `state` advanced the lifecycle and was published
    fn publish(&mut self, state: Tx) -> bool {
        let stage = state.stage();
        if let Some(last) = self.last {
            if last == Stage::Error || last == Stage::Finalized {
                return false;
            }
            if stage != Stage::Error && stage <= last {
                debug!(kind = %self.kind, state = ?state, "Dropping non-advancing state");
                return false;
            }
        }
        self.last = Some(stage);

        let mut history = lock(&self.history);
        history.push(state.clone());
        // no receivers left is fine; the driver is about to be aborted
        let _ = self.sender.send(state);
        true
    }
}

async fn drive(
    mut publisher: Publisher,
    mut gate: ConfirmGate,
    call: CallFuture,
    mut on_finalize: Option<OnFinalize>,
) {
    let kind = publisher.kind;
    match gate.next().await {
        Some(true) => {}
        answer => {
            debug!(kind = %kind, closed = answer.is_none(), "Confirmation declined");
            return;
        }
    }
    drop(gate);

    publisher.publish(Tx::Signing);

    let mut statuses = match call.await {
        Ok(statuses) => statuses,
        Err(e) => {
            warn!(kind = %kind, error = %e, "Call rejected");
            publisher.publish(Tx::Error {
                detail: e.to_string(),
            });
            return;
        }
    };

    while let Some(status) = statuses.next().await {
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Status stream failed");
                publisher.publish(Tx::Error {
                    detail: e.to_string(),
                });
                return;
            }
        };

        let Some(state) = Tx::from_native(&status) else {
            debug!(kind = %kind, status = ?status, "Ignoring status");
            continue;
        };
        if !publisher.publish(state.clone()) {
            continue;
        }

        match &state {
            Tx::Finalized { hash } => {
                info!(kind = %kind, hash = %hash, "Transaction finalized");
                if let Some(hook) = on_finalize.take() {
                    hook(&state);
                }
                return;
            }
            Tx::Error { detail } => {
                warn!(kind = %kind, detail = %detail, "Transaction failed");
                return;
            }
            _ => {}
        }
    }

    publisher.publish(Tx::Error {
        detail: format!("{} status stream ended before finalization", kind),
    });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Subscriptions
// ============================================================================

struct Shared {
    history: Arc<Mutex<Vec<Tx>>>,
    driver: Option<JoinHandle<()>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(driver) = &self.driver {
            driver.abort();
        }
    }
}

/// Read-only view of a lifecycle's states
///
/// Every subscription sees the full sequence: one created with
/// [`TxSubscription::subscribe`] first replays what was already published.
pub struct TxSubscription {
    kind: TxKind,
    replay: VecDeque<Tx>,
    rx: Option<broadcast::Receiver<Tx>>,
    shared: Arc<Shared>,
    done: bool,
}

impl TxSubscription {
    /// A subscription that yields a single `Error` and ends
    pub fn failed(kind: TxKind, detail: impl Into<String>) -> Self {
        let state = Tx::Error {
            detail: detail.into(),
        };
        Self {
            kind,
            replay: VecDeque::from([state.clone()]),
            rx: None,
            shared: Arc::new(Shared {
                history: Arc::new(Mutex::new(vec![state])),
                driver: None,
            }),
            done: false,
        }
    }

    pub fn kind(&self) -> TxKind {
        self.kind
    }

    /// Next state, or `None` once the lifecycle has ended
    pub async fn next(&mut self) -> Option<Tx> {
        if self.done {
            return None;
        }
        if let Some(state) = self.replay.pop_front() {
            self.done = state.is_terminal();
            return Some(state);
        }

        let Some(rx) = self.rx.as_mut() else {
            self.done = true;
            return None;
        };
        loop {
            match rx.recv().await {
                Ok(state) => {
                    self.done = state.is_terminal();
                    return Some(state);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(kind = %self.kind, skipped, "Subscriber lagged behind lifecycle");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    /// Another subscription to the same lifecycle, starting from the first state
    pub fn subscribe(&self) -> TxSubscription {
        let history = lock(&self.shared.history);
        let replay: VecDeque<Tx> = history.iter().cloned().collect();
        let rx = self.rx.as_ref().map(|rx| rx.resubscribe());
        drop(history);

        TxSubscription {
            kind: self.kind,
            replay,
            rx,
            shared: self.shared.clone(),
            done: false,
        }
    }

    /// A handle that observes the lifecycle without keeping it alive
    pub fn downgrade(&self) -> WeakTxSubscription {
        WeakTxSubscription {
            kind: self.kind,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Drain the subscription and return its terminal state, if any
    pub async fn terminal(mut self) -> Option<Tx> {
        let mut last = None;
        while let Some(state) = self.next().await {
            last = Some(state);
        }
        last.filter(Tx::is_terminal)
    }

    /// Drain the subscription into a list of states
    pub async fn collect(mut self) -> Vec<Tx> {
        let mut states = Vec::new();
        while let Some(state) = self.next().await {
            states.push(state);
        }
        states
    }

    /// Adapt into a stream of states
    pub fn into_stream(self) -> BoxStream<'static, Tx> {
        stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|state| (state, sub))
        })
        .boxed()
    }

    /// A gate that opens once this lifecycle finalizes
    pub fn finalized_gate(self) -> ConfirmGate {
        async move { matches!(self.terminal().await, Some(Tx::Finalized { .. })) }
            .into_stream()
            .boxed()
    }
}

/// Non-owning view of a lifecycle, see [`TxSubscription::downgrade`]
#[derive(Debug, Clone)]
pub struct WeakTxSubscription {
    kind: TxKind,
    shared: Weak<Shared>,
}

impl WeakTxSubscription {
    pub fn kind(&self) -> TxKind {
        self.kind
    }

    /// False once every subscription is gone and the driver was aborted
    pub fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }
}

impl fmt::Debug for TxSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxSubscription")
            .field("kind", &self.kind)
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::eyre;
    use futures::channel::mpsc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn h(byte: u8) -> B256 {
        B256::from([byte; 32])
    }

    fn scripted(statuses: Vec<eyre::Result<NativeStatus>>) -> CallFuture {
        async move { Ok(stream::iter(statuses).boxed()) }.boxed()
    }

    fn counting_hook(counter: &Arc<AtomicU32>) -> Option<OnFinalize> {
        let counter = counter.clone();
        Some(Box::new(move |_: &Tx| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    fn is_monotonic(states: &[Tx]) -> bool {
        let terminals = states.iter().filter(|s| s.is_terminal()).count();
        let ordered = states.windows(2).all(|w| w[0].stage() < w[1].stage());
        terminals <= 1 && ordered
    }

    #[tokio::test]
    async fn test_states_follow_lifecycle_order() {
        let call = scripted(vec![
            Ok(NativeStatus::Future),
            Ok(NativeStatus::Ready),
            Ok(NativeStatus::Broadcast),
            Ok(NativeStatus::InBlock(h(1))),
            Ok(NativeStatus::Ready),
            Ok(NativeStatus::Retracted(h(1))),
            Ok(NativeStatus::InBlock(h(2))),
            Ok(NativeStatus::Finalized(h(2))),
            Ok(NativeStatus::InBlock(h(3))),
        ]);

        let states = TransactionLifecycle::new(TxKind::Transfer)
            .submit(confirmed(), call, None)
            .collect()
            .await;

        assert_eq!(
            states,
            vec![
                Tx::Signing,
                Tx::Queued { hash: None },
                Tx::Broadcast,
                Tx::InBlock { hash: h(1) },
                Tx::Finalized { hash: h(2) },
            ]
        );
        assert!(is_monotonic(&states));
    }

    #[tokio::test]
    async fn test_vm_statuses_map_to_queued_and_finalized() {
        let call = scripted(vec![
            Ok(NativeStatus::Submitted(h(9))),
            Ok(NativeStatus::Confirmed(h(9))),
        ]);
        let states = TransactionLifecycle::new(TxKind::Approve)
            .submit(confirmed(), call, None)
            .collect()
            .await;
        assert_eq!(
            states,
            vec![
                Tx::Signing,
                Tx::Queued { hash: Some(h(9)) },
                Tx::Finalized { hash: h(9) },
            ]
        );
    }

    #[tokio::test]
    async fn test_cleanup_runs_once_for_many_subscribers() {
        let cleanups = Arc::new(AtomicU32::new(0));
        let call = scripted(vec![
            Ok(NativeStatus::Ready),
            Ok(NativeStatus::InBlock(h(1))),
            Ok(NativeStatus::InBlock(h(1))),
            Ok(NativeStatus::Finalized(h(1))),
            Ok(NativeStatus::Finalized(h(1))),
        ]);

        let first = TransactionLifecycle::new(TxKind::Claim).submit(
            confirmed(),
            call,
            counting_hook(&cleanups),
        );
        let second = first.subscribe();
        let third = first.subscribe();

        let (a, b, c) = tokio::join!(first.collect(), second.collect(), third.collect());
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.last(), Some(&Tx::Finalized { hash: h(1) }));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_history() {
        let call = scripted(vec![Ok(NativeStatus::Confirmed(h(4)))]);
        let sub = TransactionLifecycle::new(TxKind::Confirm).submit(confirmed(), call, None);
        let late = sub.subscribe();
        assert_eq!(
            sub.terminal().await,
            Some(Tx::Finalized { hash: h(4) })
        );

        let replayed = late.subscribe().collect().await;
        assert_eq!(replayed, vec![Tx::Signing, Tx::Finalized { hash: h(4) }]);
    }

    #[tokio::test]
    async fn test_declined_gate_emits_nothing() {
        let cleanups = Arc::new(AtomicU32::new(0));
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let call: CallFuture = async move {
            flag.store(true, Ordering::SeqCst);
            Ok(stream::empty().boxed())
        }
        .boxed();

        let states = TransactionLifecycle::new(TxKind::Transfer)
            .submit(declined(), call, counting_hook(&cleanups))
            .collect()
            .await;

        assert!(states.is_empty());
        assert!(!invoked.load(Ordering::SeqCst));
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_gate_sender_declines() {
        let (tx, rx) = oneshot::channel::<bool>();
        drop(tx);
        let states = TransactionLifecycle::new(TxKind::Transfer)
            .submit(gate_from_oneshot(rx), scripted(vec![]), None)
            .collect()
            .await;
        assert!(states.is_empty());
    }

    #[tokio::test]
    async fn test_call_rejection_is_forwarded_verbatim() {
        let cleanups = Arc::new(AtomicU32::new(0));
        let call: CallFuture = async { Err(eyre!("1010: Invalid Transaction: Inability to pay some fees")) }.boxed();

        let states = TransactionLifecycle::new(TxKind::Transfer)
            .submit(confirmed(), call, counting_hook(&cleanups))
            .collect()
            .await;

        assert_eq!(
            states,
            vec![
                Tx::Signing,
                Tx::Error {
                    detail: "1010: Invalid Transaction: Inability to pay some fees".to_string()
                },
            ]
        );
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_native_failure_is_terminal() {
        let call = scripted(vec![
            Ok(NativeStatus::Ready),
            Ok(NativeStatus::Usurped(h(7))),
            Ok(NativeStatus::Finalized(h(7))),
        ]);
        let states = TransactionLifecycle::new(TxKind::Transfer)
            .submit(confirmed(), call, None)
            .collect()
            .await;
        assert_eq!(states.len(), 3);
        assert!(matches!(states[2], Tx::Error { .. }));
        assert!(is_monotonic(&states));
    }

    #[tokio::test]
    async fn test_stream_error_and_early_end() {
        let call = scripted(vec![
            Ok(NativeStatus::Broadcast),
            Err(eyre!("execution reverted: token not registered")),
        ]);
        let terminal = TransactionLifecycle::new(TxKind::Claim)
            .submit(confirmed(), call, None)
            .terminal()
            .await;
        assert_eq!(
            terminal,
            Some(Tx::Error {
                detail: "execution reverted: token not registered".to_string()
            })
        );

        let call = scripted(vec![Ok(NativeStatus::InBlock(h(1)))]);
        let terminal = TransactionLifecycle::new(TxKind::Claim)
            .submit(confirmed(), call, None)
            .terminal()
            .await;
        assert_eq!(
            terminal,
            Some(Tx::Error {
                detail: "claim status stream ended before finalization".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_before_finalized_skips_cleanup() {
        let cleanups = Arc::new(AtomicU32::new(0));
        let (status_tx, status_rx) = mpsc::unbounded::<eyre::Result<NativeStatus>>();
        let call: CallFuture = async move { Ok(status_rx.boxed()) }.boxed();

        let mut sub = TransactionLifecycle::new(TxKind::Transfer).submit(
            confirmed(),
            call,
            counting_hook(&cleanups),
        );
        assert_eq!(sub.next().await, Some(Tx::Signing));
        drop(sub);

        let _ = status_tx.unbounded_send(Ok(NativeStatus::Finalized(h(1))));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_subscription() {
        let sub = TxSubscription::failed(TxKind::Transfer, "direction not supported");
        let copy = sub.subscribe();
        assert_eq!(
            sub.collect().await,
            vec![Tx::Error {
                detail: "direction not supported".to_string()
            }]
        );
        assert_eq!(copy.collect().await.len(), 1);
    }

    #[tokio::test]
    async fn test_finalized_gate() {
        let call = scripted(vec![Ok(NativeStatus::Confirmed(h(1)))]);
        let approval = TransactionLifecycle::new(TxKind::Approve).submit(confirmed(), call, None);
        let mut gate = approval.finalized_gate();
        assert_eq!(gate.next().await, Some(true));

        let call = scripted(vec![Ok(NativeStatus::Invalid)]);
        let approval = TransactionLifecycle::new(TxKind::Approve).submit(confirmed(), call, None);
        let mut gate = approval.finalized_gate();
        assert_eq!(gate.next().await, Some(false));
    }

    #[tokio::test]
    async fn test_weak_handle_tracks_subscribers() {
        let (_answer, rx) = oneshot::channel::<bool>();
        let sub = TransactionLifecycle::new(TxKind::Register).submit(
            gate_from_oneshot(rx),
            scripted(vec![]),
            None,
        );
        let copy = sub.subscribe();
        let weak = sub.downgrade();

        drop(sub);
        assert!(weak.is_alive());
        drop(copy);
        assert!(!weak.is_alive());
        assert_eq!(weak.kind(), TxKind::Register);
    }

    #[test]
    fn test_from_native_mapping() {
        assert_eq!(Tx::from_native(&NativeStatus::Retracted(h(1))), None);
        assert!(matches!(
            Tx::from_native(&NativeStatus::FinalityTimeout(h(1))),
            Some(Tx::Error { .. })
        ));
        assert!(matches!(
            Tx::from_native(&NativeStatus::Dropped),
            Some(Tx::Error { .. })
        ));
        assert_eq!(
            Tx::from_native(&NativeStatus::Confirmed(h(2))).and_then(|t| t.hash()),
            Some(h(2))
        );
        assert!(Stage::Signing < Stage::Queued && Stage::InBlock < Stage::Finalized);
    }
}
