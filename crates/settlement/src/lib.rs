//! Settlement Orchestration Engine
//!
//! Settles OTC crypto/fiat orders against an escrow custody provider and a
//! banking rail.
//!
//! # Features
//!
//! - Order intake, validation and durable PENDING → MATCHED → COMPLETED lifecycle
//! - One supervised polling monitor per pending order (escrow funding or bank credit)
//! - Idempotent confirmation and counter-leg execution with idempotency keys
//! - Bounded retries, ambiguous-outcome resolution by query
//! - Startup recovery and periodic reconciliation
//!
//! # Feature Flags
//!
//! - `postgres` - Enable PostgreSQL storage
//! - `client` - Enable HTTP adapters for the custody and banking providers

pub mod error;
pub mod gateways;
pub mod orchestrator;
pub mod reconciler;
pub mod store;
pub mod supervisor;
pub mod types;

// Re-export commonly used types
pub use error::{SettlementError, SettlementResult};
pub use orchestrator::{OrchestratorConfig, ReconcileReport, SettlementOrchestrator};
pub use reconciler::ReconciliationSweeper;
pub use types::{
    BankDetails, ConfirmOutcome, EscrowRef, FundingPolicy, MonitorKind, NewOrder, Order,
    OrderStatus, PaymentRef, Transaction, TransactionRef, TransactionStatus, TransferOutcome,
};

// Store exports
pub use store::memory::InMemoryOrderStore;
pub use store::traits::OrderStore;

#[cfg(feature = "postgres")]
pub use store::postgres::PostgresOrderStore;

// Gateway exports
pub use gateways::{
    AccountDirectory, BankGateway, EscrowGateway, InMemoryAccountDirectory, MockBankGateway,
    MockEscrowGateway, TransferBehavior,
};

#[cfg(feature = "client")]
pub use gateways::bank::http::HttpBankGateway;

#[cfg(feature = "client")]
pub use gateways::escrow::http::HttpEscrowGateway;

// Supervisor exports
pub use supervisor::{ConfirmationHandler, MonitorInfo, MonitorSupervisor, RetryPolicy, SupervisorConfig};
