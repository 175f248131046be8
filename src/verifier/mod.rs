//! Escrow verifier
//!
//! Confirms that escrows exist on both chains, match the order's terms, and
//! have reached finality. The two sides are polled independently; a failure
//! on one side never aborts the other's check, and adapter errors are
//! treated as "not verified yet" so monitoring keeps retrying.

use crate::chain::{AdapterRegistry, EscrowDetails};
use crate::clock::now_ms;
use crate::config::{OrchestratorConfig, Settings};
use crate::error::OrchestratorResult;
use crate::events::{EventBus, SwapEvent};
use crate::order::{OrderStore, SwapOrder};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Maximum tolerated distance between escrow and order timeouts
const TIMEOUT_TOLERANCE_MS: u64 = 300_000;

/// Which side of the swap an escrow sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowSide {
    Source,
    Destination,
}

impl EscrowSide {
    fn as_str(&self) -> &'static str {
        match self {
            EscrowSide::Source => "source",
            EscrowSide::Destination => "destination",
        }
    }
}

/// Ephemeral result of one verification pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowVerification {
    pub order_hash: String,
    pub is_source_verified: bool,
    pub is_destination_verified: bool,
    pub source_details: Option<EscrowDetails>,
    pub destination_details: Option<EscrowDetails>,
    /// Set once both sides verify
    pub finalization_time_ms: Option<u64>,
    pub verified_at: u64,
}

impl EscrowVerification {
    pub fn both_verified(&self) -> bool {
        self.is_source_verified && self.is_destination_verified
    }
}

pub struct EscrowVerifier {
    registry: Arc<AdapterRegistry>,
    orders: Arc<OrderStore>,
    settings: Arc<Settings>,
    config: OrchestratorConfig,
    bus: EventBus,
    /// Active bounded monitoring loops keyed by order hash
    monitors: DashMap<String, JoinHandle<()>>,
}

impl EscrowVerifier {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        orders: Arc<OrderStore>,
        settings: Arc<Settings>,
        config: OrchestratorConfig,
        bus: EventBus,
    ) -> Self {
        Self {
            registry,
            orders,
            settings,
            config,
            bus,
            monitors: DashMap::new(),
        }
    }

    /// Verify both escrows against the order's terms.
    ///
    /// Adapter-not-found and config errors surface synchronously; everything
    /// else is folded into the per-side verified flags.
    pub async fn verify_escrow_creation(
        &self,
        order: &SwapOrder,
        resolver: &str,
    ) -> OrchestratorResult<EscrowVerification> {
        let source = self
            .verify_side(order, resolver, EscrowSide::Source)
            .await?;
        let destination = self
            .verify_side(order, resolver, EscrowSide::Destination)
            .await?;

        let mut verification = EscrowVerification {
            order_hash: order.order_hash.clone(),
            is_source_verified: source.is_some(),
            is_destination_verified: destination.is_some(),
            source_details: source,
            destination_details: destination,
            finalization_time_ms: None,
            verified_at: now_ms(),
        };

        if verification.both_verified() {
            let src = self.settings.chain(&order.src_chain)?;
            let dst = self.settings.chain(&order.dst_chain)?;
            let finalization = (src.block_time_secs * src.finality_blocks)
                .max(dst.block_time_secs * dst.finality_blocks)
                * 1000;
            verification.finalization_time_ms = Some(finalization);

            info!(
                order_hash = %order.order_hash,
                finalization_ms = finalization,
                "Both escrows verified"
            );
            crate::metrics::record_escrow_verification("verified");
            self.bus.publish(SwapEvent::EscrowsVerified {
                order_hash: order.order_hash.clone(),
                finalization_time_ms: finalization,
            });
        }

        Ok(verification)
    }

    /// Verify a single side. Returns the escrow details when the side
    /// checks out, `None` otherwise.
    async fn verify_side(
        &self,
        order: &SwapOrder,
        resolver: &str,
        side: EscrowSide,
    ) -> OrchestratorResult<Option<EscrowDetails>> {
        let (chain, address) = match side {
            EscrowSide::Source => (&order.src_chain, &order.src_escrow_address),
            EscrowSide::Destination => (&order.dst_chain, &order.dst_escrow_address),
        };
        let adapter = self.registry.get(chain)?;

        let address = match address {
            Some(a) => a,
            None => {
                debug!(
                    order_hash = %order.order_hash,
                    side = side.as_str(),
                    "Escrow address not yet known"
                );
                return Ok(None);
            }
        };

        let details = match adapter.verify_escrow(&order.order_hash, address).await {
            Ok(d) => d,
            Err(e) => {
                // Transient chain failures are retried by the monitor loop
                warn!(
                    order_hash = %order.order_hash,
                    chain = %chain,
                    error = %e,
                    "Adapter call failed, treating side as unverified"
                );
                return Ok(None);
            }
        };

        match validate_escrow_details(order, &details, resolver, side) {
            Ok(()) => {
                debug!(
                    order_hash = %order.order_hash,
                    side = side.as_str(),
                    amount = %details.amount,
                    safety_deposit = %details.safety_deposit,
                    "Escrow side verified"
                );
                Ok(Some(details))
            }
            Err(reason) => {
                warn!(
                    order_hash = %order.order_hash,
                    chain = %chain,
                    side = side.as_str(),
                    reason = %reason,
                    "Escrow validation mismatch"
                );
                crate::metrics::record_escrow_verification("mismatch");
                self.bus.publish(SwapEvent::EscrowVerificationFailed {
                    order_hash: order.order_hash.clone(),
                    chain: chain.clone(),
                    reason,
                });
                Ok(None)
            }
        }
    }

    /// Poll until both escrows verify, on a bounded budget. Stops silently
    /// on success; emits `escrow_timeout` when the budget is exhausted.
    pub fn monitor_escrow_creation(self: &Arc<Self>, order_hash: &str, resolver: &str) {
        let verifier = self.clone();
        let hash = order_hash.to_string();
        let resolver = resolver.to_string();
        let interval = Duration::from_secs(self.config.escrow_poll_interval_secs);
        let max_attempts = self.config.escrow_poll_max_attempts;

        let handle = tokio::spawn({
            let hash = hash.clone();
            async move {
                for attempt in 1..=max_attempts {
                    tokio::time::sleep(interval).await;

                    // Orders evicted mid-monitor end the loop
                    let order = match verifier.orders.get(&hash) {
                        Ok(o) => o,
                        Err(_) => {
                            debug!(order_hash = %hash, "Order gone, stopping escrow monitor");
                            return;
                        }
                    };

                    match verifier.verify_escrow_creation(&order, &resolver).await {
                        Ok(v) if v.both_verified() => {
                            debug!(
                                order_hash = %hash,
                                attempt,
                                "Escrow monitoring complete"
                            );
                            verifier.monitors.remove(&hash);
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(order_hash = %hash, error = %e, "Verification pass failed");
                        }
                    }
                }

                warn!(order_hash = %hash, attempts = max_attempts, "Escrow monitoring exhausted");
                verifier.bus.publish(SwapEvent::EscrowTimeout {
                    order_hash: hash.clone(),
                    attempts: max_attempts,
                });
                verifier.monitors.remove(&hash);
            }
        });

        if let Some(old) = self.monitors.insert(hash, handle) {
            old.abort();
        }
    }

    /// Confirm a transaction has accumulated the chain's configured
    /// confirmation count. Adapter failures read as "not final yet".
    pub async fn verify_finality(
        &self,
        order_hash: &str,
        chain: &str,
        tx_hash: &str,
    ) -> OrchestratorResult<bool> {
        let adapter = self.registry.get(chain)?;
        let spec = self.settings.chain(chain)?;

        let tx = match adapter.get_transaction(tx_hash).await {
            Ok(Some(tx)) => tx,
            Ok(None) => {
                debug!(order_hash = %order_hash, tx_hash = %tx_hash, "Transaction not found yet");
                return Ok(false);
            }
            Err(e) => {
                warn!(order_hash = %order_hash, chain = %chain, error = %e, "Finality check failed");
                return Ok(false);
            }
        };

        let tx_block = match tx.block_number {
            Some(b) => b,
            None => return Ok(false),
        };

        let current = match adapter.get_block_number().await {
            Ok(b) => b,
            Err(e) => {
                warn!(order_hash = %order_hash, chain = %chain, error = %e, "Finality check failed");
                return Ok(false);
            }
        };

        let confirmations = current.saturating_sub(tx_block);
        let final_now = tx.success && confirmations >= spec.finality_blocks;
        debug!(
            order_hash = %order_hash,
            chain = %chain,
            confirmations,
            required = spec.finality_blocks,
            "Finality check"
        );
        Ok(final_now)
    }

    /// Stop the monitor for one order
    pub fn stop_monitoring(&self, order_hash: &str) {
        if let Some((_, handle)) = self.monitors.remove(order_hash) {
            handle.abort();
        }
    }

    /// Abort every active monitor (shutdown)
    pub fn cleanup(&self) {
        let keys: Vec<String> = self.monitors.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.stop_monitoring(&key);
        }
    }
}

/// Validate one escrow against the order's terms.
///
/// Tolerances: timeouts may differ by at most 300s; the amount may deviate
/// from the expected side amount by at most 0.1%.
pub fn validate_escrow_details(
    order: &SwapOrder,
    escrow: &EscrowDetails,
    resolver: &str,
    side: EscrowSide,
) -> Result<(), String> {
    if !escrow.is_created {
        return Err("escrow not created".to_string());
    }

    if escrow.secret_hash != order.secret_hash {
        return Err(format!(
            "secret hash mismatch: escrow {} vs order {}",
            escrow.secret_hash, order.secret_hash
        ));
    }

    let timeout_diff = escrow.timeout.abs_diff(order.timeout);
    if timeout_diff > TIMEOUT_TOLERANCE_MS {
        return Err(format!(
            "timeout differs by {}ms (tolerance {}ms)",
            timeout_diff, TIMEOUT_TOLERANCE_MS
        ));
    }

    if !escrow.designated.eq_ignore_ascii_case(resolver) {
        return Err(format!(
            "designated resolver {} does not match {}",
            escrow.designated, resolver
        ));
    }

    let expected = match side {
        EscrowSide::Source => order.src_amount,
        EscrowSide::Destination => order.dst_amount,
    };
    let amount_diff = escrow.amount.abs_diff(expected);
    // diff/expected <= 1/1000, kept in integer arithmetic
    if amount_diff.saturating_mul(1000) > expected {
        return Err(format!(
            "amount {} outside 0.1% of expected {}",
            escrow.amount, expected
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainAdapter;
    use crate::error::OrchestratorError;
    use crate::order::test_order;
    use crate::secrets::merkle;

    fn settings() -> Arc<Settings> {
        let toml_str = r#"
            [orchestrator]
            instance_id = "test-0"
            phase_sweep_interval_secs = 30
            exclusive_check_interval_secs = 60
            escrow_poll_interval_secs = 10
            escrow_poll_max_attempts = 60

            [api]
            host = "127.0.0.1"
            port = 8080

            [metrics]
            enabled = false
            port = 9090

            [chains.ethereum]
            name = "Ethereum"
            block_time_secs = 12
            finality_blocks = 12
            enabled = true
            gas_limits = { deploy_escrow = 500000, withdraw = 120000, cancel = 90000 }

            [chains.near]
            name = "NEAR"
            block_time_secs = 1
            finality_blocks = 3
            enabled = true
            gas_limits = { deploy_escrow = 300000, withdraw = 100000, cancel = 80000 }
        "#;
        Arc::new(toml::from_str(toml_str).unwrap())
    }

    fn order_with_escrows(hash: &str) -> SwapOrder {
        let mut order = test_order(hash);
        order.secret_hash = merkle::sha256_hex("secret");
        order.src_escrow_address = Some("0xsrc-escrow".to_string());
        order.dst_escrow_address = Some("escrow.near".to_string());
        order
    }

    fn matching_escrow(order: &SwapOrder, side: EscrowSide) -> EscrowDetails {
        let (chain, address, amount) = match side {
            EscrowSide::Source => (
                order.src_chain.clone(),
                order.src_escrow_address.clone().unwrap(),
                order.src_amount,
            ),
            EscrowSide::Destination => (
                order.dst_chain.clone(),
                order.dst_escrow_address.clone().unwrap(),
                order.dst_amount,
            ),
        };
        EscrowDetails {
            order_hash: order.order_hash.clone(),
            chain,
            contract_address: address,
            secret_hash: order.secret_hash.clone(),
            amount,
            safety_deposit: 1_000,
            timeout: order.timeout,
            creator: order.maker.clone(),
            designated: "resolver-1".to_string(),
            is_created: true,
            is_withdrawn: false,
            is_cancelled: false,
            created_at: now_ms(),
        }
    }

    fn verifier_with_adapters(
        orders: Arc<OrderStore>,
        src: MockChainAdapter,
        dst: MockChainAdapter,
        bus: EventBus,
    ) -> Arc<EscrowVerifier> {
        let registry = Arc::new(AdapterRegistry::new());
        registry.register(Arc::new(src));
        registry.register(Arc::new(dst));
        Arc::new(EscrowVerifier::new(
            registry,
            orders,
            settings(),
            OrchestratorConfig::default(),
            bus,
        ))
    }

    fn mock_adapter(chain: &str) -> MockChainAdapter {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_chain_id().return_const(chain.to_string());
        adapter
    }

    #[test]
    fn test_timeout_tolerance_boundary() {
        let order = order_with_escrows("0xaaa");
        let mut escrow = matching_escrow(&order, EscrowSide::Source);

        escrow.timeout = order.timeout + 300_000;
        assert!(validate_escrow_details(&order, &escrow, "resolver-1", EscrowSide::Source).is_ok());

        escrow.timeout = order.timeout + 300_001;
        assert!(
            validate_escrow_details(&order, &escrow, "resolver-1", EscrowSide::Source).is_err()
        );
    }

    #[test]
    fn test_amount_tolerance_boundary() {
        let mut order = order_with_escrows("0xbbb");
        order.src_amount = 1_000_000;
        let mut escrow = matching_escrow(&order, EscrowSide::Source);

        // Exactly 0.1% over
        escrow.amount = 1_001_000;
        assert!(validate_escrow_details(&order, &escrow, "resolver-1", EscrowSide::Source).is_ok());

        escrow.amount = 1_001_001;
        assert!(
            validate_escrow_details(&order, &escrow, "resolver-1", EscrowSide::Source).is_err()
        );

        // Same tolerance below
        escrow.amount = 999_000;
        assert!(validate_escrow_details(&order, &escrow, "resolver-1", EscrowSide::Source).is_ok());
        escrow.amount = 998_999;
        assert!(
            validate_escrow_details(&order, &escrow, "resolver-1", EscrowSide::Source).is_err()
        );
    }

    #[test]
    fn test_resolver_match_is_case_insensitive() {
        let order = order_with_escrows("0xccc");
        let escrow = matching_escrow(&order, EscrowSide::Source);

        assert!(validate_escrow_details(&order, &escrow, "RESOLVER-1", EscrowSide::Source).is_ok());
        assert!(
            validate_escrow_details(&order, &escrow, "resolver-2", EscrowSide::Source).is_err()
        );
    }

    #[test]
    fn test_secret_hash_must_match_exactly() {
        let order = order_with_escrows("0xddd");
        let mut escrow = matching_escrow(&order, EscrowSide::Source);
        escrow.secret_hash = merkle::sha256_hex("other");
        assert!(
            validate_escrow_details(&order, &escrow, "resolver-1", EscrowSide::Source).is_err()
        );
    }

    #[tokio::test]
    async fn test_side_failure_does_not_abort_other_side() {
        let orders = Arc::new(OrderStore::new());
        let order = order_with_escrows("0xeee");
        orders.insert(order.clone());

        // Source adapter errors; destination returns a valid escrow
        let mut src = mock_adapter("ethereum");
        src.expect_verify_escrow().returning(|_, _| {
            Err(OrchestratorError::Adapter {
                chain: "ethereum".to_string(),
                message: "rpc unreachable".to_string(),
            })
        });
        let mut dst = mock_adapter("near");
        let dst_escrow = matching_escrow(&order, EscrowSide::Destination);
        dst.expect_verify_escrow()
            .returning(move |_, _| Ok(dst_escrow.clone()));

        let bus = EventBus::new(64);
        let verifier = verifier_with_adapters(orders, src, dst, bus);

        let result = verifier
            .verify_escrow_creation(&order, "resolver-1")
            .await
            .unwrap();
        assert!(!result.is_source_verified);
        assert!(result.is_destination_verified);
        assert!(!result.both_verified());
        assert!(result.finalization_time_ms.is_none());
    }

    #[tokio::test]
    async fn test_both_sides_verified_emits_event_with_finalization() {
        let orders = Arc::new(OrderStore::new());
        let order = order_with_escrows("0xfff");
        orders.insert(order.clone());

        let mut src = mock_adapter("ethereum");
        let src_escrow = matching_escrow(&order, EscrowSide::Source);
        src.expect_verify_escrow()
            .returning(move |_, _| Ok(src_escrow.clone()));
        let mut dst = mock_adapter("near");
        let dst_escrow = matching_escrow(&order, EscrowSide::Destination);
        dst.expect_verify_escrow()
            .returning(move |_, _| Ok(dst_escrow.clone()));

        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let verifier = verifier_with_adapters(orders, src, dst, bus);

        let result = verifier
            .verify_escrow_creation(&order, "resolver-1")
            .await
            .unwrap();
        assert!(result.both_verified());
        // max(12*12, 1*3) seconds in milliseconds
        assert_eq!(result.finalization_time_ms, Some(144_000));

        match rx.try_recv().unwrap() {
            SwapEvent::EscrowsVerified {
                finalization_time_ms,
                ..
            } => assert_eq!(finalization_time_ms, 144_000),
            other => panic!("unexpected event {:?}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_verify_finality_thresholds() {
        let orders = Arc::new(OrderStore::new());

        let mut src = mock_adapter("ethereum");
        src.expect_get_transaction().returning(|_| {
            Ok(Some(crate::chain::TransactionInfo {
                tx_hash: "0xtx".to_string(),
                block_number: Some(100),
                success: true,
            }))
        });
        // 11 confirmations, then 12
        let mut heights = vec![111u64, 112].into_iter();
        src.expect_get_block_number()
            .returning(move || Ok(heights.next().unwrap_or(112)));

        let dst = mock_adapter("near");
        let verifier = verifier_with_adapters(orders, src, dst, EventBus::new(16));

        assert!(!verifier
            .verify_finality("0x1", "ethereum", "0xtx")
            .await
            .unwrap());
        assert!(verifier
            .verify_finality("0x1", "ethereum", "0xtx")
            .await
            .unwrap());

        // Unknown chain fails loudly
        assert!(verifier.verify_finality("0x1", "solana", "0xtx").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_exhaustion_emits_timeout() {
        let orders = Arc::new(OrderStore::new());
        let order = order_with_escrows("0x111");
        orders.insert(order);

        // Neither escrow ever appears
        let mut src = mock_adapter("ethereum");
        src.expect_verify_escrow().returning(|_, _| {
            Err(OrchestratorError::Adapter {
                chain: "ethereum".to_string(),
                message: "not deployed".to_string(),
            })
        });
        let mut dst = mock_adapter("near");
        dst.expect_verify_escrow().returning(|_, _| {
            Err(OrchestratorError::Adapter {
                chain: "near".to_string(),
                message: "not deployed".to_string(),
            })
        });

        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let verifier = verifier_with_adapters(orders, src, dst, bus);

        verifier.monitor_escrow_creation("0x111", "resolver-1");

        loop {
            match rx.recv().await.unwrap() {
                SwapEvent::EscrowTimeout { attempts, .. } => {
                    assert_eq!(attempts, 60);
                    break;
                }
                _ => continue,
            }
        }
    }
}
