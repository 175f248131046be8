//! Partial fill manager
//!
//! Tracks cumulative fill progress per order and allocates the secret index
//! unlocking each increment. Indices are single-use: once consumed they
//! leave `available_secrets` for good, so a resolver can never replay an
//! already-spent part secret.

use crate::clock::now_ms;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, SwapEvent};
use crate::order::SwapOrder;
use crate::secrets::MerkleSecretTree;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Append-only record of one fill increment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialFill {
    pub fill_id: String,
    pub resolver: String,
    #[serde(with = "crate::order::amount_serde")]
    pub amount: u128,
    pub secret_index: u32,
    /// Cumulative percentage after this fill
    pub fill_percentage: f64,
    pub timestamp: u64,
    pub transaction_hash: Option<String>,
}

/// Mutable fill ledger for one order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialFillState {
    pub order_hash: String,
    #[serde(with = "crate::order::amount_serde")]
    pub total_amount: u128,
    #[serde(with = "crate::order::amount_serde")]
    pub filled_amount: u128,
    pub fill_percentage: f64,
    pub fill_parts: u32,
    pub secrets_used: Vec<u32>,
    pub available_secrets: Vec<u32>,
    pub is_completed: bool,
    pub fills: Vec<PartialFill>,
}

/// The secret index a cumulative percentage maps to.
///
/// Reaching 100% requires the completion secret (`fill_parts + 1`), never
/// the final part index.
pub fn calculate_required_secret_index(percentage: f64, fill_parts: u32) -> u32 {
    if percentage >= 100.0 {
        return fill_parts + 1;
    }
    let step = 100.0 / fill_parts as f64;
    ((percentage / step).ceil() as u32).min(fill_parts)
}

pub struct PartialFillManager {
    states: DashMap<String, PartialFillState>,
    bus: EventBus,
}

impl PartialFillManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            states: DashMap::new(),
            bus,
        }
    }

    /// Seed zeroed fill state for a partial-fill order. The order must
    /// already carry its Merkle secret tree; the tree fixes the part count.
    pub fn initialize_partial_fill(
        &self,
        order: &SwapOrder,
        tree: &MerkleSecretTree,
    ) -> OrchestratorResult<()> {
        let fill_parts = tree.total_parts;

        self.states.insert(
            order.order_hash.clone(),
            PartialFillState {
                order_hash: order.order_hash.clone(),
                total_amount: order.src_amount,
                filled_amount: 0,
                fill_percentage: 0.0,
                fill_parts,
                secrets_used: Vec::new(),
                // All usable indices including the completion secret
                available_secrets: (1..=fill_parts + 1).collect(),
                is_completed: false,
                fills: Vec::new(),
            },
        );
        debug!(order_hash = %order.order_hash, parts = fill_parts, "Partial fill state initialized");
        Ok(())
    }

    /// Apply a fill increment: derive the required secret index from the
    /// post-fill percentage, consume it, and append the fill record.
    pub fn process_partial_fill(
        &self,
        order_hash: &str,
        resolver: &str,
        fill_amount: u128,
        proposed_secret_index: Option<u32>,
        transaction_hash: Option<&str>,
    ) -> OrchestratorResult<PartialFill> {
        let mut state =
            self.states
                .get_mut(order_hash)
                .ok_or_else(|| OrchestratorError::OrderNotFound {
                    order_hash: order_hash.to_string(),
                })?;

        let new_filled = state.filled_amount + fill_amount;
        let new_percentage = if new_filled >= state.total_amount {
            100.0
        } else {
            new_filled as f64 * 100.0 / state.total_amount as f64
        };

        let required = calculate_required_secret_index(new_percentage, state.fill_parts);

        if let Some(proposed) = proposed_secret_index {
            if proposed != required {
                return Err(OrchestratorError::WrongSecretIndex {
                    order_hash: order_hash.to_string(),
                    proposed,
                    required,
                });
            }
        }

        let position = state
            .available_secrets
            .iter()
            .position(|&i| i == required)
            .ok_or_else(|| OrchestratorError::SecretIndexUsed {
                order_hash: order_hash.to_string(),
                index: required,
            })?;

        state.available_secrets.remove(position);
        state.secrets_used.push(required);
        state.filled_amount = new_filled;
        state.fill_percentage = new_percentage;
        state.is_completed = new_percentage >= 100.0;

        let fill = PartialFill {
            fill_id: Uuid::new_v4().to_string(),
            resolver: resolver.to_string(),
            amount: fill_amount,
            secret_index: required,
            fill_percentage: new_percentage,
            timestamp: now_ms(),
            transaction_hash: transaction_hash.map(|h| h.to_string()),
        };
        state.fills.push(fill.clone());

        info!(
            order_hash = %order_hash,
            resolver = %resolver,
            secret_index = required,
            percentage = new_percentage,
            completed = state.is_completed,
            "Partial fill processed"
        );
        crate::metrics::record_partial_fill();
        self.bus.publish(SwapEvent::PartialFill {
            order_hash: order_hash.to_string(),
            resolver: resolver.to_string(),
            amount: fill_amount,
            secret_index: required,
            fill_percentage: new_percentage,
        });

        Ok(fill)
    }

    /// Preview the index a hypothetical fill amount would require, without
    /// mutating state. Errors if that index has already been consumed.
    pub fn get_next_available_secret(
        &self,
        order_hash: &str,
        fill_amount: u128,
    ) -> OrchestratorResult<u32> {
        let state = self
            .states
            .get(order_hash)
            .ok_or_else(|| OrchestratorError::OrderNotFound {
                order_hash: order_hash.to_string(),
            })?;

        let new_filled = state.filled_amount + fill_amount;
        let percentage = if new_filled >= state.total_amount {
            100.0
        } else {
            new_filled as f64 * 100.0 / state.total_amount as f64
        };
        let required = calculate_required_secret_index(percentage, state.fill_parts);

        if !state.available_secrets.contains(&required) {
            return Err(OrchestratorError::SecretIndexUsed {
                order_hash: order_hash.to_string(),
                index: required,
            });
        }
        Ok(required)
    }

    /// Human-readable explanation of which index a target percentage needs
    pub fn calculate_partial_fill_strategy(
        &self,
        order_hash: &str,
        target_percentage: f64,
    ) -> OrchestratorResult<String> {
        let state = self
            .states
            .get(order_hash)
            .ok_or_else(|| OrchestratorError::OrderNotFound {
                order_hash: order_hash.to_string(),
            })?;

        let index = calculate_required_secret_index(target_percentage, state.fill_parts);
        let description = if index > state.fill_parts {
            format!(
                "target {:.1}% completes the order: use completion secret index {} of {}",
                target_percentage,
                index,
                state.fill_parts + 1
            )
        } else {
            format!(
                "target {:.1}% falls in part {} of {}: use secret index {}",
                target_percentage, index, state.fill_parts, index
            )
        };
        Ok(description)
    }

    pub fn state(&self, order_hash: &str) -> Option<PartialFillState> {
        self.states.get(order_hash).map(|s| s.clone())
    }

    pub fn is_completed(&self, order_hash: &str) -> bool {
        self.states
            .get(order_hash)
            .map(|s| s.is_completed)
            .unwrap_or(false)
    }

    pub fn evict(&self, order_hash: &str) {
        self.states.remove(order_hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::test_order;
    use crate::secrets::merkle;

    fn tree(order_hash: &str, parts: u32) -> MerkleSecretTree {
        let secrets = merkle::derive_part_secrets("master", parts);
        MerkleSecretTree {
            order_hash: order_hash.to_string(),
            total_parts: parts,
            merkle_root: merkle::merkle_root(&secrets),
            secrets,
        }
    }

    fn manager_with_order(hash: &str, total: u128, parts: u32) -> PartialFillManager {
        let manager = PartialFillManager::new(EventBus::new(64));
        let mut order = test_order(hash);
        order.src_amount = total;
        order.fill_parts = Some(parts);
        manager
            .initialize_partial_fill(&order, &tree(hash, parts))
            .unwrap();
        manager
    }

    #[test]
    fn test_index_mapping_for_four_parts() {
        assert_eq!(calculate_required_secret_index(20.0, 4), 1);
        assert_eq!(calculate_required_secret_index(25.0, 4), 1);
        assert_eq!(calculate_required_secret_index(26.0, 4), 2);
        assert_eq!(calculate_required_secret_index(50.0, 4), 2);
        assert_eq!(calculate_required_secret_index(75.0, 4), 3);
        assert_eq!(calculate_required_secret_index(99.9, 4), 4);
        // 100% always maps to the completion secret, never the last part
        assert_eq!(calculate_required_secret_index(100.0, 4), 5);
    }

    #[test]
    fn test_end_to_end_fill_sequence() {
        let manager = manager_with_order("0xaaa", 1000, 4);

        let fill = manager
            .process_partial_fill("0xaaa", "r1", 250, None, None)
            .unwrap();
        assert_eq!(fill.secret_index, 1);
        assert_eq!(fill.fill_percentage, 25.0);
        assert!(!manager.is_completed("0xaaa"));

        let fill = manager
            .process_partial_fill("0xaaa", "r1", 250, None, None)
            .unwrap();
        assert_eq!(fill.secret_index, 2);
        assert_eq!(fill.fill_percentage, 50.0);
        assert!(!manager.is_completed("0xaaa"));

        let fill = manager
            .process_partial_fill("0xaaa", "r2", 500, None, Some("0xtx"))
            .unwrap();
        assert_eq!(fill.secret_index, 5);
        assert_eq!(fill.fill_percentage, 100.0);
        assert!(manager.is_completed("0xaaa"));

        let state = manager.state("0xaaa").unwrap();
        assert_eq!(state.secrets_used, vec![1, 2, 5]);
        assert_eq!(state.fills.len(), 3);
        assert_eq!(state.filled_amount, 1000);
    }

    #[test]
    fn test_available_secrets_only_shrink() {
        let manager = manager_with_order("0xbbb", 1000, 4);

        let before = manager.state("0xbbb").unwrap().available_secrets.len();
        // 10% -> index 1
        manager
            .process_partial_fill("0xbbb", "r1", 100, None, None)
            .unwrap();
        let state = manager.state("0xbbb").unwrap();
        assert_eq!(state.available_secrets.len(), before - 1);
        assert!(!state.available_secrets.contains(&1));

        // 15% still falls in part 1, whose index is already consumed
        let err = manager
            .process_partial_fill("0xbbb", "r1", 50, None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::SecretIndexUsed { index: 1, .. }
        ));

        // Failed attempts must not mutate the ledger
        let state = manager.state("0xbbb").unwrap();
        assert_eq!(state.filled_amount, 100);
        assert_eq!(state.fills.len(), 1);
    }

    #[test]
    fn test_fill_percentage_monotonic() {
        let manager = manager_with_order("0xccc", 1000, 4);

        let mut last = 0.0;
        for amount in [250u128, 250, 500] {
            let fill = manager
                .process_partial_fill("0xccc", "r1", amount, None, None)
                .unwrap();
            assert!(fill.fill_percentage >= last);
            last = fill.fill_percentage;
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn test_proposed_index_mismatch_rejected() {
        let manager = manager_with_order("0xddd", 1000, 4);

        let err = manager
            .process_partial_fill("0xddd", "r1", 250, Some(3), None)
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::WrongSecretIndex {
                proposed: 3,
                required: 1,
                ..
            }
        ));

        // Matching proposal is accepted
        manager
            .process_partial_fill("0xddd", "r1", 250, Some(1), None)
            .unwrap();
    }

    #[test]
    fn test_preview_does_not_mutate() {
        let manager = manager_with_order("0xeee", 1000, 4);

        assert_eq!(manager.get_next_available_secret("0xeee", 250).unwrap(), 1);
        assert_eq!(manager.get_next_available_secret("0xeee", 1000).unwrap(), 5);

        let state = manager.state("0xeee").unwrap();
        assert_eq!(state.filled_amount, 0);
        assert_eq!(state.available_secrets.len(), 5);
    }

    #[test]
    fn test_strategy_explainer() {
        let manager = manager_with_order("0xfff", 1000, 4);

        let strategy = manager
            .calculate_partial_fill_strategy("0xfff", 50.0)
            .unwrap();
        assert!(strategy.contains("secret index 2"));

        let strategy = manager
            .calculate_partial_fill_strategy("0xfff", 100.0)
            .unwrap();
        assert!(strategy.contains("completion secret index 5"));
    }
}
