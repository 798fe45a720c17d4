//! In-memory order store implementation

use async_trait::async_trait;
use chrono::Utc;
use common::OrderId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{SettlementError, SettlementResult};
use crate::store::traits::OrderStore;
use crate::types::{ConfirmOutcome, Order, OrderStatus, Transaction, TransactionStatus};

#[derive(Default)]
struct StoreState {
    orders: HashMap<OrderId, Order>,
    transactions: HashMap<OrderId, Transaction>,
}

/// In-memory order store for tests, development and the sandbox profile.
///
/// Orders and transactions live behind one lock so `confirm_and_match` is a
/// single critical section.
pub struct InMemoryOrderStore {
    state: RwLock<StoreState>,
    fail_writes: AtomicBool,
}

impl InMemoryOrderStore {
    /// Create a new in-memory order store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail with a storage error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> SettlementResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SettlementError::Storage("store is not accepting writes".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_transition(
    order: &mut Order,
    from: OrderStatus,
    to: OrderStatus,
    fault_reason: Option<String>,
) -> SettlementResult<()> {
    if order.status != from || !from.can_transition_to(to) {
        return Err(SettlementError::InvalidStateTransition {
            order_id: order.order_id,
            from: order.status,
            to,
        });
    }

    order.status = to;
    order.updated_at = Utc::now();
    match to {
        OrderStatus::Completed => {
            order.retry_pending = false;
            order.fault_reason = None;
        }
        OrderStatus::Failed | OrderStatus::Cancelled => {
            order.retry_pending = false;
        }
        _ => {}
    }
    if fault_reason.is_some() {
        order.fault_reason = fault_reason;
    }
    Ok(())
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create_order(&self, order: Order) -> SettlementResult<Order> {
        self.check_writable()?;
        let mut state = self.state.write();
        if state.orders.contains_key(&order.order_id) {
            return Err(SettlementError::Storage(format!(
                "order {} already exists",
                order.order_id
            )));
        }
        state.orders.insert(order.order_id, order.clone());
        Ok(order)
    }

    async fn get_order(&self, order_id: OrderId) -> SettlementResult<Option<Order>> {
        Ok(self.state.read().orders.get(&order_id).cloned())
    }

    async fn list_orders(&self, statuses: Option<Vec<OrderStatus>>) -> SettlementResult<Vec<Order>> {
        let state = self.state.read();
        let mut result: Vec<Order> = state
            .orders
            .values()
            .filter(|o| statuses.as_ref().map_or(true, |s| s.contains(&o.status)))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(result)
    }

    async fn create_transaction(&self, transaction: Transaction) -> SettlementResult<Transaction> {
        self.check_writable()?;
        let mut state = self.state.write();
        if !state.orders.contains_key(&transaction.order_id) {
            return Err(SettlementError::order_not_found(transaction.order_id));
        }
        let stored = state
            .transactions
            .entry(transaction.order_id)
            .or_insert(transaction);
        Ok(stored.clone())
    }

    async fn get_transaction(&self, order_id: OrderId) -> SettlementResult<Option<Transaction>> {
        Ok(self.state.read().transactions.get(&order_id).cloned())
    }

    async fn list_pending_transactions(&self) -> SettlementResult<Vec<Transaction>> {
        let state = self.state.read();
        let mut result: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| t.status == TransactionStatus::Pending)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(result)
    }

    async fn set_external_ref(
        &self,
        order_id: OrderId,
        external_ref: &str,
    ) -> SettlementResult<Transaction> {
        self.check_writable()?;
        let mut state = self.state.write();
        let tx = state
            .transactions
            .get_mut(&order_id)
            .ok_or_else(|| SettlementError::transaction_not_found(order_id))?;
        tx.external_ref = Some(external_ref.to_string());
        tx.updated_at = Utc::now();
        Ok(tx.clone())
    }

    async fn transition_order(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        fault_reason: Option<String>,
    ) -> SettlementResult<Order> {
        self.check_writable()?;
        let mut state = self.state.write();
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| SettlementError::order_not_found(order_id))?;
        apply_transition(order, from, to, fault_reason)?;
        Ok(order.clone())
    }

    async fn confirm_and_match(&self, order_id: OrderId) -> SettlementResult<ConfirmOutcome> {
        self.check_writable()?;
        let mut state = self.state.write();
        let state = &mut *state;

        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| SettlementError::order_not_found(order_id))?;
        let tx = state
            .transactions
            .get_mut(&order_id)
            .ok_or_else(|| SettlementError::transaction_not_found(order_id))?;

        if tx.is_confirmed() {
            return Ok(ConfirmOutcome::AlreadyConfirmed {
                order: order.clone(),
                transaction: tx.clone(),
            });
        }

        // Check the order edge first so a refused match leaves the
        // transaction untouched.
        apply_transition(order, OrderStatus::Pending, OrderStatus::Matched, None)?;

        let now = Utc::now();
        tx.status = TransactionStatus::Confirmed;
        tx.confirmed_at = Some(now);
        tx.updated_at = now;

        Ok(ConfirmOutcome::Confirmed {
            order: order.clone(),
            transaction: tx.clone(),
        })
    }

    async fn set_counter_leg_key(
        &self,
        order_id: OrderId,
        key: &str,
    ) -> SettlementResult<Transaction> {
        self.check_writable()?;
        let mut state = self.state.write();
        let tx = state
            .transactions
            .get_mut(&order_id)
            .ok_or_else(|| SettlementError::transaction_not_found(order_id))?;
        if tx.counter_leg_key.as_deref() != Some(key) {
            tx.counter_leg_key = Some(key.to_string());
            tx.updated_at = Utc::now();
        }
        Ok(tx.clone())
    }

    async fn record_fault(&self, order_id: OrderId, reason: &str) -> SettlementResult<Order> {
        self.check_writable()?;
        let mut state = self.state.write();
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| SettlementError::order_not_found(order_id))?;
        order.fault_reason = Some(reason.to_string());
        if order.status == OrderStatus::Matched {
            order.retry_pending = true;
        }
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn record_counter_leg_failure(
        &self,
        order_id: OrderId,
        reason: &str,
    ) -> SettlementResult<Order> {
        self.check_writable()?;
        let mut state = self.state.write();
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| SettlementError::order_not_found(order_id))?;
        order.fault_reason = Some(reason.to_string());
        order.counter_leg_attempts += 1;
        if order.status == OrderStatus::Matched {
            order.retry_pending = true;
        }
        order.updated_at = Utc::now();
        Ok(order.clone())
    }
}
