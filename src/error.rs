//! Error types for the orchestrator

use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain {chain} not found in configuration")]
    ChainNotFound { chain: String },

    #[error("Order {order_hash} not found")]
    OrderNotFound { order_hash: String },

    #[error("Secret hash mismatch for order {order_hash}")]
    HashMismatch { order_hash: String },

    #[error("Invalid fill part count {parts}: must be between 2 and 10")]
    InvalidFillParts { parts: u32 },

    #[error("Invalid phase transition for order {order_hash}: expected {expected}, found {found}")]
    InvalidPhaseTransition {
        order_hash: String,
        expected: String,
        found: String,
    },

    #[error("Secret index {index} already used for order {order_hash}")]
    SecretIndexUsed { order_hash: String, index: u32 },

    #[error(
        "Wrong secret index for order {order_hash}: proposed {proposed}, required {required}"
    )]
    WrongSecretIndex {
        order_hash: String,
        proposed: u32,
        required: u32,
    },

    #[error("Resolver {resolver} is not registered or not KYC approved")]
    ResolverNotAuthorized { resolver: String },

    #[error("Invalid reveal proof for order {order_hash}: {reason}")]
    InvalidProof { order_hash: String, reason: String },

    #[error("Adapter error on chain {chain}: {message}")]
    Adapter { chain: String, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Check if error is retryable by a polling caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Adapter { .. } | OrchestratorError::Timeout { .. }
        )
    }

    /// Validation-class errors surface synchronously to direct callers;
    /// everything else surfaces through events or state queries.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            OrchestratorError::HashMismatch { .. }
                | OrchestratorError::InvalidFillParts { .. }
                | OrchestratorError::InvalidPhaseTransition { .. }
                | OrchestratorError::SecretIndexUsed { .. }
                | OrchestratorError::WrongSecretIndex { .. }
                | OrchestratorError::ResolverNotAuthorized { .. }
                | OrchestratorError::InvalidProof { .. }
                | OrchestratorError::OrderNotFound { .. }
                | OrchestratorError::ChainNotFound { .. }
        )
    }
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
