//! Gateways to the two settlement rails and the beneficiary directory
//!
//! Every gateway is a trait with an in-process mock for tests and the
//! sandbox profile, plus a REST adapter behind the `client` feature.

pub mod bank;
pub mod directory;
pub mod escrow;

pub use bank::{BankGateway, MockBankGateway};
pub use directory::{AccountDirectory, InMemoryAccountDirectory};
pub use escrow::{EscrowGateway, MockEscrowGateway};

/// How a mock gateway answers money-moving calls
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransferBehavior {
    /// Execute and acknowledge
    #[default]
    Complete,
    /// Refuse with a definitive rejection
    Reject(String),
    /// Refuse with a transient error, nothing executed
    Unavailable,
    /// Execute, then never answer
    LoseResponse,
    /// Never answer and never execute
    Stall,
}

#[cfg(feature = "client")]
pub(crate) mod http {
    use crate::error::SettlementError;
    use reqwest::{Response, StatusCode};

    /// Header carrying the idempotency key of money-moving calls
    pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

    /// Header carrying the provider API key
    pub const API_KEY_HEADER: &str = "X-API-Key";

    /// Map a transport error. Reads are always safe to repeat; for
    /// money-moving calls only a failed connect proves nothing was sent.
    pub fn transport_error(e: reqwest::Error, money_moving: bool) -> SettlementError {
        if money_moving && !e.is_connect() {
            SettlementError::AmbiguousOutcome(e.to_string())
        } else {
            SettlementError::GatewayUnavailable(e.to_string())
        }
    }

    /// Turn a non-success response into an error
    pub async fn status_error(response: Response, money_moving: bool) -> SettlementError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = format!("{}: {}", status, body);

        if status.is_client_error() && status != StatusCode::REQUEST_TIMEOUT {
            SettlementError::GatewayRejected(message)
        } else if money_moving {
            SettlementError::AmbiguousOutcome(message)
        } else {
            SettlementError::GatewayUnavailable(message)
        }
    }
}
