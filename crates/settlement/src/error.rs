//! Settlement error types

use common::OrderId;
use thiserror::Error;

use crate::types::OrderStatus;

/// Errors that can occur while settling an order
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SettlementError {
    /// Inbound order rejected before anything was persisted
    #[error("Validation error: {0}")]
    Validation(String),

    /// Order, transaction or beneficiary not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A monitor is already registered for this order
    #[error("Monitor already registered for order {0}")]
    DuplicateMonitor(OrderId),

    /// The order is not in a state that allows the requested transition
    #[error("Invalid state transition for order {order_id}: {from} -> {to}")]
    InvalidStateTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    /// Transient failure talking to the escrow or bank provider
    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// The provider answered with a definitive refusal
    #[error("Gateway rejected request: {0}")]
    GatewayRejected(String),

    /// A money-moving call timed out without a definitive answer
    #[error("Ambiguous outcome: {0}")]
    AmbiguousOutcome(String),

    /// Durable write or read failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SettlementError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn order_not_found(order_id: OrderId) -> Self {
        Self::NotFound(format!("order {}", order_id))
    }

    pub fn transaction_not_found(order_id: OrderId) -> Self {
        Self::NotFound(format!("transaction for order {}", order_id))
    }

    /// Errors worth another attempt later without operator involvement.
    ///
    /// `AmbiguousOutcome` is not transient: it is resolved by
    /// querying the outcome, never by blindly re-sending.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::GatewayUnavailable(_) | Self::Storage(_))
    }

    /// Race-condition and programming guards. Surfaced, never retried.
    pub fn is_guard(&self) -> bool {
        matches!(
            self,
            Self::DuplicateMonitor(_) | Self::InvalidStateTransition { .. } | Self::NotFound(_)
        )
    }
}

/// Result type for settlement operations
pub type SettlementResult<T> = std::result::Result<T, SettlementError>;
