//! Chain abstraction - adapters for every chain the orchestrator observes
//!
//! One adapter instance per supported chain identifier. The orchestrator
//! never submits transactions; it only reads state created by external
//! actors (escrow deployment, withdrawals) through this interface.

use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// On-chain escrow state as read from a chain adapter.
///
/// Mirrors what the escrow contracts expose: immutable terms plus the
/// withdrawn/cancelled flags. `safety_deposit` is informational only;
/// amount tolerance checks apply to the principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowDetails {
    pub order_hash: String,
    pub chain: String,
    pub contract_address: String,
    pub secret_hash: String,
    #[serde(with = "crate::order::amount_serde")]
    pub amount: u128,
    #[serde(with = "crate::order::amount_serde")]
    pub safety_deposit: u128,
    /// Escrow timeout as unix milliseconds
    pub timeout: u64,
    pub creator: String,
    /// Resolver designated to act during the exclusivity period
    pub designated: String,
    pub is_created: bool,
    pub is_withdrawn: bool,
    pub is_cancelled: bool,
    pub created_at: u64,
}

/// Transaction lookup result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub success: bool,
}

/// Per-chain read capability consumed by the verifier and status API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Chain identifier this adapter serves
    fn chain_id(&self) -> String;

    /// Current block height
    async fn get_block_number(&self) -> OrchestratorResult<u64>;

    /// Fetch a transaction and its inclusion block, if mined
    async fn get_transaction(&self, tx_hash: &str) -> OrchestratorResult<Option<TransactionInfo>>;

    /// Read escrow contract state for an order
    async fn verify_escrow(
        &self,
        order_hash: &str,
        contract_address: &str,
    ) -> OrchestratorResult<EscrowDetails>;

    /// Balance of an address, optionally for a specific token
    async fn get_balance<'a>(
        &self,
        address: &str,
        token: Option<&'a str>,
    ) -> OrchestratorResult<u128>;

    /// Estimate gas for an escrow operation
    async fn estimate_gas(
        &self,
        operation: &str,
        params: &serde_json::Value,
    ) -> OrchestratorResult<u64>;
}

/// Registry of adapters indexed by chain identifier
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn ChainAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// Register an adapter for its chain id
    pub fn register(&self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters
            .write()
            .unwrap()
            .insert(adapter.chain_id(), adapter);
    }

    /// Get the adapter for a chain; unknown chains fail loudly
    pub fn get(&self, chain: &str) -> OrchestratorResult<Arc<dyn ChainAdapter>> {
        self.adapters
            .read()
            .unwrap()
            .get(chain)
            .map(|a| a.clone())
            .ok_or_else(|| OrchestratorError::ChainNotFound {
                chain: chain.to_string(),
            })
    }

    /// All registered chain ids
    pub fn chains(&self) -> Vec<String> {
        self.adapters.read().unwrap().keys().cloned().collect()
    }

    /// Probe every adapter with a block-height call
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let mut results = Vec::new();

        let adapters: Vec<(String, Arc<dyn ChainAdapter>)> = self
            .adapters
            .read()
            .unwrap()
            .iter()
            .map(|(chain, adapter)| (chain.clone(), adapter.clone()))
            .collect();

        for (chain, adapter) in adapters {
            let healthy = adapter.get_block_number().await.is_ok();
            crate::metrics::record_chain_health(&chain, healthy);
            results.push((chain, healthy));
        }

        results
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
