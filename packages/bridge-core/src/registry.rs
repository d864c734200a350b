//! Bridge routing table
//!
//! Each bridge is an undirected pair of [`Vertex`]es carrying two handler
//! sets: the issuing set for the declared departure → arrival order and the
//! redeem set for the reverse. The table is built once at startup and never
//! mutated; a direction with no bridge resolves to the unsupported handlers.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::handlers::UnsupportedHandler;
use crate::lifecycle::{ConfirmGate, OnFinalize, TxSubscription};
use crate::types::{Direction, Polarity, RecordPage, RecordQuery, TransferIntent, Vertex};

/// Lifecycles started by one transfer request
#[derive(Debug)]
pub struct TransferSubmission {
    /// Allowance approval that has to finalize before the transfer is sent
    pub approval: Option<TxSubscription>,
    pub transfer: TxSubscription,
}

impl TransferSubmission {
    pub fn single(transfer: TxSubscription) -> Self {
        Self {
            approval: None,
            transfer,
        }
    }
}

#[async_trait]
pub trait TransferHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn transfer(
        &self,
        intent: &TransferIntent,
        gate: ConfirmGate,
        on_finalize: Option<OnFinalize>,
    ) -> TransferSubmission;
}

#[async_trait]
pub trait RecordHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn records(&self, query: &RecordQuery) -> Result<RecordPage>;
}

/// Transfer and record handlers for one polarity of a bridge
#[derive(Clone)]
pub struct HandlerSet {
    pub transfer: Arc<dyn TransferHandler>,
    pub record: Arc<dyn RecordHandler>,
}

impl HandlerSet {
    pub fn new(transfer: Arc<dyn TransferHandler>, record: Arc<dyn RecordHandler>) -> Self {
        Self { transfer, record }
    }

    pub fn unsupported() -> Self {
        let handler = Arc::new(UnsupportedHandler);
        Self {
            transfer: handler.clone(),
            record: handler,
        }
    }
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSet")
            .field("transfer", &self.transfer.name())
            .field("record", &self.record.name())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BridgeRegistration {
    pub departure: Vertex,
    pub arrival: Vertex,
    pub issuing: HandlerSet,
    pub redeem: HandlerSet,
}

impl BridgeRegistration {
    fn unordered_pair(&self) -> (Vertex, Vertex) {
        if self.departure <= self.arrival {
            (self.departure.clone(), self.arrival.clone())
        } else {
            (self.arrival.clone(), self.departure.clone())
        }
    }
}

/// Handlers selected for a direction
#[derive(Clone)]
pub struct Resolution {
    pub transfer: Arc<dyn TransferHandler>,
    pub record: Arc<dyn RecordHandler>,
    /// `None` when no bridge serves the direction
    pub polarity: Option<Polarity>,
}

impl Resolution {
    fn from_set(set: &HandlerSet, polarity: Option<Polarity>) -> Self {
        Self {
            transfer: set.transfer.clone(),
            record: set.record.clone(),
            polarity,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.polarity.is_some()
    }
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolution")
            .field("transfer", &self.transfer.name())
            .field("record", &self.record.name())
            .field("polarity", &self.polarity)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BridgeRegistry {
    bridges: Vec<BridgeRegistration>,
    unsupported: HandlerSet,
}

impl BridgeRegistry {
    /// Validate and freeze the routing table.
    ///
    /// Two registrations for the same unordered vertex pair, in either
    /// orientation, are rejected.
    pub fn new(bridges: Vec<BridgeRegistration>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for bridge in &bridges {
            if bridge.departure == bridge.arrival {
                return Err(RegistryError::SelfLoop(bridge.departure.clone()));
            }
            let (first, second) = bridge.unordered_pair();
            if !seen.insert((first.clone(), second.clone())) {
                return Err(RegistryError::Conflict { first, second });
            }
        }

        info!(bridges = bridges.len(), "Bridge registry built");
        Ok(Self {
            bridges,
            unsupported: HandlerSet::unsupported(),
        })
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Pick handlers for `direction`.
    ///
    /// The full ordered pair is matched against every bridge in both
    /// orientations first. Failing that, any bridge declared with the same
    /// departure is used in its issuing polarity.
    pub fn resolve(&self, direction: &Direction) -> Resolution {
        for bridge in &self.bridges {
            if bridge.departure == direction.departure && bridge.arrival == direction.arrival {
                debug!(direction = %direction, "Resolved issuing bridge");
                return Resolution::from_set(&bridge.issuing, Some(Polarity::Issuing));
            }
            if bridge.departure == direction.arrival && bridge.arrival == direction.departure {
                debug!(direction = %direction, "Resolved redeeming bridge");
                return Resolution::from_set(&bridge.redeem, Some(Polarity::Redeeming));
            }
        }
        self.resolve_departure(&direction.departure)
    }

    /// Pick handlers when only the departure is known
    pub fn resolve_departure(&self, departure: &Vertex) -> Resolution {
        match self.bridges.iter().find(|b| &b.departure == departure) {
            Some(bridge) => {
                debug!(departure = %departure, arrival = %bridge.arrival, "Resolved by departure");
                Resolution::from_set(&bridge.issuing, Some(Polarity::Issuing))
            }
            None => {
                debug!(departure = %departure, "No bridge registered");
                Resolution::from_set(&self.unsupported, None)
            }
        }
    }

    /// Every routable direction, issuing then redeeming per bridge
    pub fn directions(&self) -> Vec<Direction> {
        self.bridges
            .iter()
            .flat_map(|b| {
                let issuing = Direction::new(b.departure.clone(), b.arrival.clone());
                let redeem = issuing.reversed();
                [issuing, redeem]
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }
}

/// Collects issuing and redeem halves before validating them together
#[derive(Default)]
pub struct RegistryBuilder {
    issuing: Vec<(Vertex, Vertex, HandlerSet)>,
    redeem: Vec<(Vertex, Vertex, HandlerSet)>,
}

impl RegistryBuilder {
    /// Handlers for `departure → arrival`
    pub fn register(
        mut self,
        departure: Vertex,
        arrival: Vertex,
        transfer: Arc<dyn TransferHandler>,
        record: Arc<dyn RecordHandler>,
    ) -> Self {
        self.issuing
            .push((departure, arrival, HandlerSet::new(transfer, record)));
        self
    }

    /// Handlers for `arrival → departure` of the bridge declared as
    /// `departure → arrival`
    pub fn register_redeem(
        mut self,
        departure: Vertex,
        arrival: Vertex,
        transfer: Arc<dyn TransferHandler>,
        record: Arc<dyn RecordHandler>,
    ) -> Self {
        self.redeem
            .push((departure, arrival, HandlerSet::new(transfer, record)));
        self
    }

    pub fn build(self) -> Result<BridgeRegistry, RegistryError> {
        let mut redeem = self.redeem;
        let mut bridges = Vec::with_capacity(self.issuing.len());

        for (departure, arrival, issuing) in self.issuing {
            let half = redeem
                .iter()
                .position(|(d, a, _)| d == &departure && a == &arrival)
                .map(|idx| redeem.remove(idx).2);
            if half.is_none() {
                debug!(departure = %departure, arrival = %arrival, "Bridge has no redeem handlers");
            }
            bridges.push(BridgeRegistration {
                departure,
                arrival,
                issuing,
                redeem: half.unwrap_or_else(HandlerSet::unsupported),
            });
        }
        for (departure, arrival, half) in redeem {
            bridges.push(BridgeRegistration {
                departure,
                arrival,
                issuing: HandlerSet::unsupported(),
                redeem: half,
            });
        }

        BridgeRegistry::new(bridges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{confirmed, Tx, TxKind};

    struct Named(String);

    impl Named {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self(name.to_string()))
        }
    }

    #[async_trait]
    impl TransferHandler for Named {
        fn name(&self) -> &str {
            &self.0
        }

        async fn transfer(
            &self,
            _intent: &TransferIntent,
            _gate: ConfirmGate,
            _on_finalize: Option<OnFinalize>,
        ) -> TransferSubmission {
            TransferSubmission::single(TxSubscription::failed(TxKind::Transfer, self.0.clone()))
        }
    }

    #[async_trait]
    impl RecordHandler for Named {
        fn name(&self) -> &str {
            &self.0
        }

        async fn records(&self, _query: &RecordQuery) -> Result<RecordPage> {
            Ok(RecordPage::default())
        }
    }

    fn set(name: &str) -> HandlerSet {
        let handler = Named::new(name);
        HandlerSet::new(handler.clone(), handler)
    }

    fn bridge(departure: Vertex, arrival: Vertex, name: &str) -> BridgeRegistration {
        BridgeRegistration {
            departure,
            arrival,
            issuing: set(name),
            redeem: set(&format!("{}-redeem", name)),
        }
    }

    fn pangolin() -> Vertex {
        Vertex::native("pangolin")
    }

    fn pangolin_evm() -> Vertex {
        Vertex::smart_contract("pangolin")
    }

    fn ropsten() -> Vertex {
        Vertex::native("ropsten")
    }

    fn crab() -> Vertex {
        Vertex::native("crab")
    }

    fn registry() -> BridgeRegistry {
        BridgeRegistry::new(vec![
            bridge(pangolin(), ropsten(), "substrate-ethereum"),
            bridge(pangolin(), pangolin_evm(), "substrate-dvm"),
            bridge(crab(), pangolin(), "crab-pangolin"),
        ])
        .unwrap()
    }

    #[test]
    fn test_every_bridge_resolves_symmetrically() {
        let registry = registry();
        for direction in registry.directions().chunks(2) {
            let issuing = registry.resolve(&direction[0]);
            let redeem = registry.resolve(&direction[1]);

            assert_eq!(issuing.polarity, Some(Polarity::Issuing));
            assert_eq!(redeem.polarity, Some(Polarity::Redeeming));
            assert_eq!(
                redeem.transfer.name(),
                format!("{}-redeem", issuing.transfer.name())
            );
            assert_eq!(redeem.record.name(), redeem.transfer.name());
        }
        assert_eq!(registry.directions().len(), 6);
    }

    #[test]
    fn test_full_pair_wins_over_departure() {
        let registry = registry();
        let resolution = registry.resolve(&Direction::new(pangolin(), pangolin_evm()));
        assert_eq!(resolution.transfer.name(), "substrate-dvm");

        let resolution = registry.resolve(&Direction::new(pangolin(), crab()));
        assert_eq!(resolution.transfer.name(), "crab-pangolin-redeem");
    }

    #[test]
    fn test_departure_only_fallback() {
        let registry = registry();
        let resolution = registry.resolve(&Direction::new(crab(), Vertex::native("darwinia")));
        assert_eq!(resolution.transfer.name(), "crab-pangolin");
        assert_eq!(resolution.polarity, Some(Polarity::Issuing));

        let resolution = registry.resolve_departure(&pangolin());
        assert_eq!(resolution.transfer.name(), "substrate-ethereum");
    }

    #[tokio::test]
    async fn test_unknown_direction_is_unsupported() {
        let registry = registry();
        let direction = Direction::new(Vertex::native("kusama"), ropsten());
        let resolution = registry.resolve(&direction);
        assert!(!resolution.is_supported());
        assert_eq!(resolution.transfer.name(), "unsupported");

        let intent = TransferIntent {
            direction,
            sender: "0xsender".to_string(),
            recipient: "0xrecipient".to_string(),
            asset: "RING".to_string(),
            amount: 1,
        };
        let submission = resolution.transfer.transfer(&intent, confirmed(), None).await;
        assert!(submission.approval.is_none());
        assert_eq!(
            submission.transfer.collect().await,
            vec![Tx::Error {
                detail: "direction not supported".to_string()
            }]
        );
    }

    #[test]
    fn test_conflicting_registrations_rejected() {
        let err = BridgeRegistry::new(vec![
            bridge(pangolin(), ropsten(), "a"),
            bridge(ropsten(), pangolin(), "b"),
        ])
        .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));

        let err = BridgeRegistry::new(vec![bridge(pangolin(), pangolin(), "loop")]).unwrap_err();
        assert_eq!(err, RegistryError::SelfLoop(pangolin()));
    }

    #[test]
    fn test_builder_pairs_halves() {
        let issuing = Named::new("issue");
        let redeem = Named::new("redeem");
        let lonely = Named::new("lonely");

        let registry = BridgeRegistry::builder()
            .register(pangolin(), ropsten(), issuing.clone(), issuing)
            .register_redeem(pangolin(), ropsten(), redeem.clone(), redeem)
            .register(crab(), pangolin(), lonely.clone(), lonely)
            .build()
            .unwrap();
        assert_eq!(registry.len(), 2);

        let back = registry.resolve(&Direction::new(ropsten(), pangolin()));
        assert_eq!(back.transfer.name(), "redeem");
        assert_eq!(back.polarity, Some(Polarity::Redeeming));

        let missing = registry.resolve(&Direction::new(pangolin(), crab()));
        assert_eq!(missing.transfer.name(), "unsupported");
        assert_eq!(missing.polarity, Some(Polarity::Redeeming));
    }

    #[test]
    fn test_builder_rejects_duplicate_redeem() {
        let handler = Named::new("x");
        let err = BridgeRegistry::builder()
            .register(pangolin(), ropsten(), handler.clone(), handler.clone())
            .register_redeem(pangolin(), ropsten(), handler.clone(), handler.clone())
            .register_redeem(pangolin(), ropsten(), handler.clone(), handler)
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));
    }
}
