//! Order lifecycle coordinator
//!
//! Wires timelock transitions, verifier results, and fill progress into
//! secret-reveal decisions. The coordinator is the only component that
//! reacts to the event bus; the managers it composes own their state and
//! never call each other directly.

use crate::chain::AdapterRegistry;
use crate::config::Settings;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, SwapEvent};
use crate::fills::{PartialFill, PartialFillManager, PartialFillState};
use crate::order::{OrderStore, SwapOrder};
use crate::resolvers::ResolverRegistry;
use crate::secrets::{merkle, RevealConditions, RevealRequest, SecretManager};
use crate::timelock::{TimelockManager, TimelockPhase};
use crate::verifier::EscrowVerifier;

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

/// Aggregated view of one order for status queries
#[derive(Debug, Serialize)]
pub struct OrderStatus {
    pub order: SwapOrder,
    pub phase: Option<TimelockPhase>,
    pub time_remaining_ms: Option<u64>,
    pub exclusive_withdrawal_active: bool,
    pub fill: Option<PartialFillState>,
    pub conditions: Option<RevealConditions>,
    pub is_revealed: bool,
    /// Escrow funding read through the adapters, best effort
    #[serde(with = "crate::order::amount_serde_opt")]
    pub src_escrow_balance: Option<u128>,
    #[serde(with = "crate::order::amount_serde_opt")]
    pub dst_escrow_balance: Option<u128>,
}

pub struct Coordinator {
    settings: Arc<Settings>,
    orders: Arc<OrderStore>,
    adapters: Arc<AdapterRegistry>,
    resolvers: Arc<ResolverRegistry>,
    timelocks: Arc<TimelockManager>,
    secrets: Arc<SecretManager>,
    fills: Arc<PartialFillManager>,
    verifier: Arc<EscrowVerifier>,
    bus: EventBus,
    shutdown: Arc<RwLock<bool>>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        orders: Arc<OrderStore>,
        adapters: Arc<AdapterRegistry>,
        resolvers: Arc<ResolverRegistry>,
        timelocks: Arc<TimelockManager>,
        secrets: Arc<SecretManager>,
        fills: Arc<PartialFillManager>,
        verifier: Arc<EscrowVerifier>,
        bus: EventBus,
    ) -> Self {
        Self {
            settings,
            orders,
            adapters,
            resolvers,
            timelocks,
            secrets,
            fills,
            verifier,
            bus,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Register a new order: create every per-order record and open the
    /// announcement phase.
    ///
    /// For partial-fill orders `secret` is the master secret; the order's
    /// hashlock must equal the derived `merkle:<root>` commitment.
    pub fn register_order(&self, order: SwapOrder, secret: &str) -> OrchestratorResult<()> {
        let src = self.settings.chain(&order.src_chain)?.clone();
        let dst = self.settings.chain(&order.dst_chain)?.clone();

        if let Some(parts) = order.fill_parts {
            if !(crate::secrets::MIN_FILL_PARTS..=crate::secrets::MAX_FILL_PARTS).contains(&parts)
            {
                return Err(OrchestratorError::InvalidFillParts { parts });
            }
            // The escrows commit to the Merkle root, so the order must too
            let part_secrets = merkle::derive_part_secrets(secret, parts);
            let hashlock = merkle::merkle_hashlock(&merkle::merkle_root(&part_secrets));
            if order.secret_hash != hashlock {
                return Err(OrchestratorError::HashMismatch {
                    order_hash: order.order_hash.clone(),
                });
            }
        }

        let order_hash = order.order_hash.clone();
        self.orders.insert(order.clone());

        let result = (|| {
            if let Some(parts) = order.fill_parts {
                self.secrets
                    .store_secret(&order_hash, secret, &merkle::sha256_hex(secret))?;
                let tree = self
                    .secrets
                    .create_merkle_secret_tree(&order_hash, parts, secret)?;
                self.fills.initialize_partial_fill(&order, &tree)?;
            } else {
                self.secrets
                    .store_secret(&order_hash, secret, &order.secret_hash)?;
            }
            self.timelocks.setup_order_timelocks(&order, &src, &dst)?;
            Ok(())
        })();

        if let Err(e) = result {
            // Roll back the partial registration
            self.orders.remove(&order_hash);
            self.secrets.evict(&order_hash);
            self.fills.evict(&order_hash);
            self.timelocks.evict(&order_hash);
            return Err(e);
        }

        info!(order_hash = %order_hash, "Order registered");
        crate::metrics::record_order_registered();
        self.bus.publish(SwapEvent::OrderCreated {
            order_hash: order_hash.clone(),
            src_chain: order.src_chain.clone(),
            dst_chain: order.dst_chain.clone(),
            src_amount: order.src_amount,
            dst_amount: order.dst_amount,
        });
        self.bus.publish(SwapEvent::AuctionStarted {
            order_hash,
            start_time: order.auction_start_time,
            duration_ms: order.auction_duration_ms,
        });
        Ok(())
    }

    /// Record the auction winner and start watching for escrow deployment
    pub fn record_auction_result(
        &self,
        order_hash: &str,
        resolver: &str,
    ) -> OrchestratorResult<()> {
        if !self.resolvers.is_authorized(resolver) {
            return Err(OrchestratorError::ResolverNotAuthorized {
                resolver: resolver.to_string(),
            });
        }

        self.orders.set_winner(order_hash, resolver)?;
        self.secrets
            .update_reveal_condition(order_hash, |c| c.resolver_verified = true)?;

        self.bus.publish(SwapEvent::AuctionWon {
            order_hash: order_hash.to_string(),
            resolver: resolver.to_string(),
        });

        self.verifier.monitor_escrow_creation(order_hash, resolver);
        Ok(())
    }

    /// Record externally deployed escrow addresses; the monitor picks them
    /// up on its next pass
    pub fn record_escrow_deployment(
        &self,
        order_hash: &str,
        src_escrow: &str,
        dst_escrow: &str,
    ) -> OrchestratorResult<()> {
        self.orders
            .set_escrow_addresses(order_hash, src_escrow, dst_escrow)
    }

    /// Relay externally observed auction progress to subscribers
    pub fn report_auction_progress(&self, order_hash: &str, current_rate: f64) {
        self.bus.publish(SwapEvent::AuctionProgress {
            order_hash: order_hash.to_string(),
            current_rate,
        });
    }

    /// Re-estimate gas for an escrow operation and notify subscribers
    pub async fn report_gas_adjustment(
        &self,
        order_hash: &str,
        chain: &str,
        operation: &str,
    ) -> OrchestratorResult<u64> {
        let adapter = self.adapters.get(chain)?;
        let gas_limit = adapter
            .estimate_gas(operation, &serde_json::json!({ "orderHash": order_hash }))
            .await?;

        self.bus.publish(SwapEvent::GasAdjustment {
            order_hash: order_hash.to_string(),
            chain: chain.to_string(),
            gas_limit,
        });
        Ok(gas_limit)
    }

    /// Apply a fill increment and hand out the part secret unlocking it
    pub fn process_partial_fill(
        &self,
        order_hash: &str,
        resolver: &str,
        amount: u128,
        proposed_secret_index: Option<u32>,
        transaction_hash: Option<&str>,
    ) -> OrchestratorResult<(PartialFill, Option<String>)> {
        if !self.resolvers.is_authorized(resolver) {
            return Err(OrchestratorError::ResolverNotAuthorized {
                resolver: resolver.to_string(),
            });
        }

        let fill = self.fills.process_partial_fill(
            order_hash,
            resolver,
            amount,
            proposed_secret_index,
            transaction_hash,
        )?;
        let part_secret = self.secrets.handle_partial_fill(order_hash, fill.secret_index)?;

        if self.fills.is_completed(order_hash) {
            info!(order_hash = %order_hash, "Order fully filled");
            if let Err(e) = self.timelocks.complete_order(order_hash) {
                warn!(order_hash = %order_hash, error = %e, "Completion deferred");
            }
        }

        Ok((fill, part_secret))
    }

    /// Pass a resolver's reveal request through to the secret manager
    pub fn request_secret_reveal(
        &self,
        request: &RevealRequest,
    ) -> OrchestratorResult<Option<String>> {
        self.secrets.request_secret_reveal(request)
    }

    /// Complete an order whose withdrawal has been observed externally.
    /// The resulting `order_completed` event evicts every component's state.
    pub fn complete_order(&self, order_hash: &str) -> OrchestratorResult<()> {
        self.timelocks.complete_order(order_hash)
    }

    /// Force an order into recovery
    pub fn cancel_order(&self, order_hash: &str, reason: &str) -> OrchestratorResult<()> {
        self.timelocks.force_recovery(order_hash, reason)
    }

    /// Aggregate the per-component views of one order
    pub async fn order_status(&self, order_hash: &str) -> OrchestratorResult<OrderStatus> {
        let order = self.orders.get(order_hash)?;

        let src_escrow_balance = match &order.src_escrow_address {
            Some(address) => self.escrow_balance(&order.src_chain, address).await,
            None => None,
        };
        let dst_escrow_balance = match &order.dst_escrow_address {
            Some(address) => self.escrow_balance(&order.dst_chain, address).await,
            None => None,
        };

        Ok(OrderStatus {
            phase: self.timelocks.phase(order_hash),
            time_remaining_ms: self.timelocks.get_time_remaining(order_hash),
            exclusive_withdrawal_active: self
                .timelocks
                .is_exclusive_withdrawal_active(order_hash),
            fill: self.fills.state(order_hash),
            conditions: self.secrets.conditions(order_hash),
            is_revealed: self.secrets.is_revealed(order_hash),
            src_escrow_balance,
            dst_escrow_balance,
            order,
        })
    }

    async fn escrow_balance(&self, chain: &str, address: &str) -> Option<u128> {
        let adapter = self.adapters.get(chain).ok()?;
        adapter.get_balance(address, None).await.ok()
    }

    /// Main reaction loop over the event bus
    pub async fn run(&self) -> OrchestratorResult<()> {
        let mut rx = self.bus.subscribe();
        let mut health_interval = interval(Duration::from_secs(60));

        info!("Coordinator started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                result = rx.recv() => match result {
                    Ok(event) => self.handle_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Coordinator lagged on the event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },

                _ = health_interval.tick() => {
                    self.adapters.health_check().await;
                    crate::metrics::record_health_check();
                }
            }
        }

        info!("Coordinator stopped");
        Ok(())
    }

    async fn handle_event(&self, event: SwapEvent) {
        debug!(event = event.name(), order_hash = event.order_hash(), "Handling event");

        match event {
            SwapEvent::EscrowsVerified { order_hash, .. } => {
                // Escrows exist and match: the announcement phase is over.
                // A mismatch here means the sweep already moved the order on.
                if let Err(e) = self.timelocks.transition_to_deposit_phase(&order_hash) {
                    debug!(order_hash = %order_hash, error = %e, "Deposit transition skipped");
                }
                if let Err(e) = self
                    .secrets
                    .update_reveal_condition(&order_hash, |c| c.escrows_verified = true)
                {
                    warn!(order_hash = %order_hash, error = %e, "Condition update failed");
                }
            }

            SwapEvent::FinalizationCompleted { order_hash } => {
                // Finality horizon passed: open the withdrawal window and
                // let the reveal gate see both flags at once.
                if let Err(e) = self.timelocks.transition_to_withdrawal_phase(&order_hash) {
                    warn!(order_hash = %order_hash, error = %e, "Withdrawal transition failed");
                    return;
                }
                if let Err(e) = self.secrets.update_reveal_condition(&order_hash, |c| {
                    c.finality_reached = true;
                    c.time_conditions_met = true;
                }) {
                    warn!(order_hash = %order_hash, error = %e, "Condition update failed");
                }
            }

            SwapEvent::EscrowTimeout { order_hash, .. } => {
                if let Err(e) = self
                    .timelocks
                    .force_recovery(&order_hash, "escrow deployment timed out")
                {
                    error!(order_hash = %order_hash, error = %e, "Recovery after timeout failed");
                }
            }

            SwapEvent::OrderCancelled { order_hash, .. } => {
                // Recovery is underway; stop watching the chains. Records
                // survive until the recovery window expires.
                self.verifier.stop_monitoring(&order_hash);
            }

            SwapEvent::OrderCompleted { order_hash } => {
                self.verifier.stop_monitoring(&order_hash);
                self.secrets.evict(&order_hash);
                self.fills.evict(&order_hash);
                self.orders.remove(&order_hash);
                info!(order_hash = %order_hash, "Order state evicted");
            }

            _ => {}
        }
    }

    /// Stop the reaction loop and cancel all outstanding timers
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        self.verifier.cleanup();
        self.secrets.cleanup();
        self.timelocks.cleanup();
        info!("Coordinator shutdown initiated");
    }
}
