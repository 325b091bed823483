//! Error types for the HTLC bridge relayer

use crate::chain::Chain;
use crate::events::EventKind;

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Transient RPC error on {chain}: {message}")]
    TransientRpc { chain: Chain, message: String },

    #[error("Rate limited on {chain}")]
    RateLimited { chain: Chain },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("{chain} rejected the transaction: {reason}")]
    ChainRejection { chain: Chain, reason: String },

    #[error("Insufficient balance on {chain}: have {have}, need {need}")]
    InsufficientBalance {
        chain: Chain,
        have: String,
        need: String,
    },

    #[error("Invalid {chain} address: {address}")]
    InvalidAddress { chain: Chain, address: String },

    #[error("Escrow creation failed on {chain}: {reason}")]
    EscrowCreationFailed { chain: Chain, reason: String },

    #[error("Timelock of escrow {escrow_ref} on {chain} has not expired")]
    TimelockNotExpired { chain: Chain, escrow_ref: String },

    #[error("Duplicate {kind} event for escrow {escrow_ref}")]
    DuplicateEvent { escrow_ref: String, kind: EventKind },

    #[error("Price oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Swap {0} not found")]
    SwapNotFound(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Chain {0} not configured")]
    ChainNotFound(Chain),

    #[error("Secure randomness unavailable: {0}")]
    EntropyUnavailable(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::TransientRpc { .. }
                | RelayerError::Timeout { .. }
                | RelayerError::RateLimited { .. }
        )
    }

    /// Check if error means the chain will never accept the request as-is
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            RelayerError::ChainRejection { .. }
                | RelayerError::InsufficientBalance { .. }
                | RelayerError::InvalidAddress { .. }
                | RelayerError::EscrowCreationFailed { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::InsufficientBalance { .. }
                | RelayerError::Wallet(_)
                | RelayerError::EntropyUnavailable(_)
        )
    }

    /// Wrap a permanent failure raised while locking funds
    pub fn into_escrow_creation(self, chain: Chain) -> Self {
        if self.is_permanent() {
            match self {
                RelayerError::EscrowCreationFailed { .. } => self,
                other => RelayerError::EscrowCreationFailed {
                    chain,
                    reason: other.to_string(),
                },
            }
        } else {
            self
        }
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_errors_become_escrow_creation_failures() {
        let err = RelayerError::InsufficientBalance {
            chain: Chain::Tron,
            have: "1".into(),
            need: "2".into(),
        }
        .into_escrow_creation(Chain::Tron);
        assert!(matches!(
            err,
            RelayerError::EscrowCreationFailed { chain: Chain::Tron, .. }
        ));
    }

    #[test]
    fn transient_errors_pass_through() {
        let err = RelayerError::TransientRpc {
            chain: Chain::Near,
            message: "timeout".into(),
        }
        .into_escrow_creation(Chain::Near);
        assert!(err.is_retryable());
        assert!(!err.is_permanent());
    }
}
