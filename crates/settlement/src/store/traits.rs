//! OrderStore trait definition

use async_trait::async_trait;
use common::OrderId;

use crate::error::SettlementResult;
use crate::types::{ConfirmOutcome, Order, OrderStatus, Transaction};

/// Durable record of orders and their settlement transactions.
///
/// Every status change goes through a compare-and-set on the current status,
/// so two handlers racing on the same order cannot lose each other's update.
/// Implementations must make `confirm_and_match` atomic: either both the
/// transaction and the order move, or neither does.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persist a new order
    async fn create_order(&self, order: Order) -> SettlementResult<Order>;

    /// Get an order by ID
    async fn get_order(&self, order_id: OrderId) -> SettlementResult<Option<Order>>;

    /// List orders, optionally filtered by status, oldest first
    async fn list_orders(&self, statuses: Option<Vec<OrderStatus>>) -> SettlementResult<Vec<Order>>;

    /// Persist the settlement transaction for an order.
    ///
    /// Transactions are 1:1 with orders: if one already exists it is
    /// returned unchanged.
    async fn create_transaction(&self, transaction: Transaction) -> SettlementResult<Transaction>;

    /// Get the transaction for an order
    async fn get_transaction(&self, order_id: OrderId) -> SettlementResult<Option<Transaction>>;

    /// All transactions still waiting for their first leg
    async fn list_pending_transactions(&self) -> SettlementResult<Vec<Transaction>>;

    /// Store the escrow account id or bank payment reference
    async fn set_external_ref(
        &self,
        order_id: OrderId,
        external_ref: &str,
    ) -> SettlementResult<Transaction>;

    /// Move an order from `from` to `to`.
    ///
    /// Fails with `InvalidStateTransition` if the stored status is not `from`
    /// or if the state machine forbids the edge. `fault_reason` is recorded
    /// alongside the transition when given.
    async fn transition_order(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        fault_reason: Option<String>,
    ) -> SettlementResult<Order>;

    /// Atomically mark the transaction CONFIRMED and the order MATCHED.
    ///
    /// Returns `AlreadyConfirmed` without touching anything when the
    /// transaction was confirmed earlier. Fails with `InvalidStateTransition`
    /// when the order has left PENDING by another route (cancel, failure).
    async fn confirm_and_match(&self, order_id: OrderId) -> SettlementResult<ConfirmOutcome>;

    /// Persist the idempotency key of the counter-leg attempt about to be sent.
    ///
    /// Must be durable before the money-moving call goes out.
    async fn set_counter_leg_key(&self, order_id: OrderId, key: &str)
        -> SettlementResult<Transaction>;

    /// Record an inspectable fault on the order. MATCHED orders are also
    /// flagged for counter-leg retry.
    async fn record_fault(&self, order_id: OrderId, reason: &str) -> SettlementResult<Order>;

    /// Record a definitive counter-leg failure and bump the attempt counter
    async fn record_counter_leg_failure(
        &self,
        order_id: OrderId,
        reason: &str,
    ) -> SettlementResult<Order>;
}
