//! Lifecycle event types and the internal event bus
//!
//! Every component publishes `SwapEvent`s onto a shared broadcast bus; the
//! coordinator and the websocket broadcaster are the two consumers.

use crate::clock::now_ms;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;

/// Fixed allow-list of event names a connection may subscribe to
pub const ALLOWED_EVENTS: &[&str] = &[
    "order_created",
    "auction_started",
    "auction_progress",
    "gas_adjustment",
    "partial_fill",
    "auction_won",
    "secret_revealed",
    "order_completed",
    "order_cancelled",
    "phase_transition",
    "phase_expiring_soon",
    "exclusive_withdrawal_ended",
    "finalization_completed",
    "escrow_timeout",
    "escrows_verified",
    "escrow_verification_failed",
];

/// Check an event name against the allow-list
pub fn is_allowed_event(name: &str) -> bool {
    ALLOWED_EVENTS.contains(&name)
}

/// Events emitted across the order lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SwapEvent {
    OrderCreated {
        order_hash: String,
        src_chain: String,
        dst_chain: String,
        #[serde(with = "crate::order::amount_serde")]
        src_amount: u128,
        #[serde(with = "crate::order::amount_serde")]
        dst_amount: u128,
    },

    AuctionStarted {
        order_hash: String,
        start_time: u64,
        duration_ms: u64,
    },

    AuctionProgress {
        order_hash: String,
        current_rate: f64,
    },

    GasAdjustment {
        order_hash: String,
        chain: String,
        gas_limit: u64,
    },

    AuctionWon {
        order_hash: String,
        resolver: String,
    },

    PartialFill {
        order_hash: String,
        resolver: String,
        #[serde(with = "crate::order::amount_serde")]
        amount: u128,
        secret_index: u32,
        fill_percentage: f64,
    },

    SecretRevealed {
        order_hash: String,
        secret: String,
        revealed_to: Vec<String>,
    },

    OrderCompleted {
        order_hash: String,
    },

    OrderCancelled {
        order_hash: String,
        reason: String,
    },

    PhaseTransition {
        order_hash: String,
        from: String,
        to: String,
        start_time: u64,
        end_time: u64,
    },

    PhaseExpiringSoon {
        order_hash: String,
        phase: String,
        end_time: u64,
    },

    ExclusiveWithdrawalEnded {
        order_hash: String,
    },

    FinalizationCompleted {
        order_hash: String,
    },

    EscrowTimeout {
        order_hash: String,
        attempts: u32,
    },

    EscrowsVerified {
        order_hash: String,
        finalization_time_ms: u64,
    },

    EscrowVerificationFailed {
        order_hash: String,
        chain: String,
        reason: String,
    },
}

impl SwapEvent {
    /// Get the topic name for this event
    pub fn name(&self) -> &'static str {
        match self {
            SwapEvent::OrderCreated { .. } => "order_created",
            SwapEvent::AuctionStarted { .. } => "auction_started",
            SwapEvent::AuctionProgress { .. } => "auction_progress",
            SwapEvent::GasAdjustment { .. } => "gas_adjustment",
            SwapEvent::AuctionWon { .. } => "auction_won",
            SwapEvent::PartialFill { .. } => "partial_fill",
            SwapEvent::SecretRevealed { .. } => "secret_revealed",
            SwapEvent::OrderCompleted { .. } => "order_completed",
            SwapEvent::OrderCancelled { .. } => "order_cancelled",
            SwapEvent::PhaseTransition { .. } => "phase_transition",
            SwapEvent::PhaseExpiringSoon { .. } => "phase_expiring_soon",
            SwapEvent::ExclusiveWithdrawalEnded { .. } => "exclusive_withdrawal_ended",
            SwapEvent::FinalizationCompleted { .. } => "finalization_completed",
            SwapEvent::EscrowTimeout { .. } => "escrow_timeout",
            SwapEvent::EscrowsVerified { .. } => "escrows_verified",
            SwapEvent::EscrowVerificationFailed { .. } => "escrow_verification_failed",
        }
    }

    /// Get the order hash this event belongs to
    pub fn order_hash(&self) -> &str {
        match self {
            SwapEvent::OrderCreated { order_hash, .. } => order_hash,
            SwapEvent::AuctionStarted { order_hash, .. } => order_hash,
            SwapEvent::AuctionProgress { order_hash, .. } => order_hash,
            SwapEvent::GasAdjustment { order_hash, .. } => order_hash,
            SwapEvent::AuctionWon { order_hash, .. } => order_hash,
            SwapEvent::PartialFill { order_hash, .. } => order_hash,
            SwapEvent::SecretRevealed { order_hash, .. } => order_hash,
            SwapEvent::OrderCompleted { order_hash } => order_hash,
            SwapEvent::OrderCancelled { order_hash, .. } => order_hash,
            SwapEvent::PhaseTransition { order_hash, .. } => order_hash,
            SwapEvent::PhaseExpiringSoon { order_hash, .. } => order_hash,
            SwapEvent::ExclusiveWithdrawalEnded { order_hash } => order_hash,
            SwapEvent::FinalizationCompleted { order_hash } => order_hash,
            SwapEvent::EscrowTimeout { order_hash, .. } => order_hash,
            SwapEvent::EscrowsVerified { order_hash, .. } => order_hash,
            SwapEvent::EscrowVerificationFailed { order_hash, .. } => order_hash,
        }
    }

    /// Event payload for the wire envelope. Amounts are rendered as strings
    /// so non-EVM callers never see truncated integers.
    pub fn data(&self) -> serde_json::Value {
        match self {
            SwapEvent::OrderCreated {
                src_chain,
                dst_chain,
                src_amount,
                dst_amount,
                ..
            } => json!({
                "srcChain": src_chain,
                "dstChain": dst_chain,
                "srcAmount": src_amount.to_string(),
                "dstAmount": dst_amount.to_string(),
            }),
            SwapEvent::AuctionStarted {
                start_time,
                duration_ms,
                ..
            } => json!({ "startTime": start_time, "durationMs": duration_ms }),
            SwapEvent::AuctionProgress { current_rate, .. } => {
                json!({ "currentRate": current_rate })
            }
            SwapEvent::GasAdjustment { chain, gas_limit, .. } => {
                json!({ "chain": chain, "gasLimit": gas_limit })
            }
            SwapEvent::AuctionWon { resolver, .. } => json!({ "resolver": resolver }),
            SwapEvent::PartialFill {
                resolver,
                amount,
                secret_index,
                fill_percentage,
                ..
            } => json!({
                "resolver": resolver,
                "amount": amount.to_string(),
                "secretIndex": secret_index,
                "fillPercentage": fill_percentage,
            }),
            SwapEvent::SecretRevealed {
                secret, revealed_to, ..
            } => json!({ "secret": secret, "revealedTo": revealed_to }),
            SwapEvent::OrderCompleted { .. } => json!({}),
            SwapEvent::OrderCancelled { reason, .. } => json!({ "reason": reason }),
            SwapEvent::PhaseTransition {
                from,
                to,
                start_time,
                end_time,
                ..
            } => json!({
                "from": from,
                "to": to,
                "startTime": start_time,
                "endTime": end_time,
            }),
            SwapEvent::PhaseExpiringSoon { phase, end_time, .. } => {
                json!({ "phase": phase, "endTime": end_time })
            }
            SwapEvent::ExclusiveWithdrawalEnded { .. } => json!({}),
            SwapEvent::FinalizationCompleted { .. } => json!({}),
            SwapEvent::EscrowTimeout { attempts, .. } => json!({ "attempts": attempts }),
            SwapEvent::EscrowsVerified {
                finalization_time_ms,
                ..
            } => json!({ "finalizationTimeMs": finalization_time_ms }),
            SwapEvent::EscrowVerificationFailed { chain, reason, .. } => {
                json!({ "chain": chain, "reason": reason })
            }
        }
    }

    /// Build the outbound wire envelope for this event
    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            event: self.name().to_string(),
            data: self.data(),
            timestamp: now_ms(),
            order_hash: Some(self.order_hash().to_string()),
        }
    }
}

/// Outbound connection-protocol envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub event: String,
    pub data: serde_json::Value,
    pub timestamp: u64,
    #[serde(rename = "orderHash", skip_serializing_if = "Option::is_none")]
    pub order_hash: Option<String>,
}

/// Broadcast bus shared by all components
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SwapEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwapEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: SwapEvent) {
        crate::metrics::record_event(event.name());
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_variant_name_is_allowed() {
        let events = vec![
            SwapEvent::OrderCompleted {
                order_hash: "0xabc".into(),
            },
            SwapEvent::FinalizationCompleted {
                order_hash: "0xabc".into(),
            },
            SwapEvent::EscrowTimeout {
                order_hash: "0xabc".into(),
                attempts: 60,
            },
        ];
        for event in events {
            assert!(is_allowed_event(event.name()));
        }
    }

    #[test]
    fn test_unknown_event_name_rejected() {
        assert!(!is_allowed_event("order_teleported"));
        assert!(!is_allowed_event(""));
    }

    #[test]
    fn test_wire_envelope_shape() {
        let event = SwapEvent::EscrowsVerified {
            order_hash: "0xdeadbeef".into(),
            finalization_time_ms: 144_000,
        };
        let wire = event.to_wire();
        assert_eq!(wire.event, "escrows_verified");
        assert_eq!(wire.order_hash.as_deref(), Some("0xdeadbeef"));

        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["orderHash"], "0xdeadbeef");
        assert_eq!(json["data"]["finalizationTimeMs"], 144_000);
        assert!(json["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_amounts_rendered_as_strings() {
        let event = SwapEvent::OrderCreated {
            order_hash: "0x1".into(),
            src_chain: "ethereum".into(),
            dst_chain: "near".into(),
            src_amount: u128::MAX,
            dst_amount: 1000,
        };
        let data = event.data();
        assert_eq!(data["srcAmount"], u128::MAX.to_string());
        assert_eq!(data["dstAmount"], "1000");
    }

    #[tokio::test]
    async fn test_bus_fan_out() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(SwapEvent::OrderCompleted {
            order_hash: "0xabc".into(),
        });

        assert_eq!(rx1.recv().await.unwrap().order_hash(), "0xabc");
        assert_eq!(rx2.recv().await.unwrap().order_hash(), "0xabc");
    }
}
