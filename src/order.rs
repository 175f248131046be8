//! Swap order model and the order-scoped state store

use crate::error::{OrchestratorError, OrchestratorResult};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Serialize u128 amounts as decimal strings. JSON numbers cap at u64 and
/// yocto-denominated balances overflow that.
pub mod amount_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// `amount_serde` for optional amounts
pub mod amount_serde_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<u128>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u128>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| s.parse().map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// A registered swap order.
///
/// Orders arrive already built and signed by the external SDK; the
/// orchestrator only tracks the fields it needs to verify escrows and
/// drive the lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapOrder {
    pub order_hash: String,
    pub maker: String,
    pub src_chain: String,
    pub dst_chain: String,
    #[serde(with = "amount_serde")]
    pub src_amount: u128,
    #[serde(with = "amount_serde")]
    pub dst_amount: u128,
    /// Hashlock commitment the escrows on both sides are bound to
    pub secret_hash: String,
    /// Escrow timeout as unix milliseconds
    pub timeout: u64,
    pub auction_start_time: u64,
    pub auction_duration_ms: u64,
    /// Winning resolver, once the auction settles
    pub winning_resolver: Option<String>,
    pub src_escrow_address: Option<String>,
    pub dst_escrow_address: Option<String>,
    /// Number of fill parts for partial-fill orders
    pub fill_parts: Option<u32>,
    pub created_at: u64,
}

impl SwapOrder {
    pub fn supports_partial_fills(&self) -> bool {
        self.fill_parts.is_some()
    }
}

/// In-memory store of live orders keyed by order hash.
///
/// Entries are created at registration and removed when the order reaches a
/// terminal state; nothing is kept for completed or recovered orders.
pub struct OrderStore {
    orders: DashMap<String, SwapOrder>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self {
            orders: DashMap::new(),
        }
    }

    pub fn insert(&self, order: SwapOrder) {
        self.orders.insert(order.order_hash.clone(), order);
    }

    pub fn get(&self, order_hash: &str) -> OrchestratorResult<SwapOrder> {
        self.orders
            .get(order_hash)
            .map(|o| o.clone())
            .ok_or_else(|| OrchestratorError::OrderNotFound {
                order_hash: order_hash.to_string(),
            })
    }

    pub fn contains(&self, order_hash: &str) -> bool {
        self.orders.contains_key(order_hash)
    }

    /// Record the auction winner
    pub fn set_winner(&self, order_hash: &str, resolver: &str) -> OrchestratorResult<()> {
        let mut order = self
            .orders
            .get_mut(order_hash)
            .ok_or_else(|| OrchestratorError::OrderNotFound {
                order_hash: order_hash.to_string(),
            })?;
        order.winning_resolver = Some(resolver.to_string());
        Ok(())
    }

    /// Record externally deployed escrow addresses
    pub fn set_escrow_addresses(
        &self,
        order_hash: &str,
        src_escrow: &str,
        dst_escrow: &str,
    ) -> OrchestratorResult<()> {
        let mut order = self
            .orders
            .get_mut(order_hash)
            .ok_or_else(|| OrchestratorError::OrderNotFound {
                order_hash: order_hash.to_string(),
            })?;
        order.src_escrow_address = Some(src_escrow.to_string());
        order.dst_escrow_address = Some(dst_escrow.to_string());
        Ok(())
    }

    /// Evict an order at a terminal state
    pub fn remove(&self, order_hash: &str) -> Option<SwapOrder> {
        self.orders.remove(order_hash).map(|(_, o)| o)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn order_hashes(&self) -> Vec<String> {
        self.orders.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for OrderStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a minimal order for tests
#[cfg(test)]
pub fn test_order(order_hash: &str) -> SwapOrder {
    use crate::clock::now_ms;

    SwapOrder {
        order_hash: order_hash.to_string(),
        maker: "0xmaker".to_string(),
        src_chain: "ethereum".to_string(),
        dst_chain: "near".to_string(),
        src_amount: 1_000_000,
        dst_amount: 2_000_000,
        secret_hash: String::new(),
        timeout: now_ms() + 3_600_000,
        auction_start_time: now_ms(),
        auction_duration_ms: 120_000,
        winning_resolver: None,
        src_escrow_address: None,
        dst_escrow_address: None,
        fill_parts: None,
        created_at: now_ms(),
    }
}
