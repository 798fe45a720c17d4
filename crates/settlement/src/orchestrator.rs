//! Settlement orchestrator
//!
//! Drives each order through
//!
//! ```text
//! PENDING ──(first leg confirmed)──► MATCHED ──(counter-leg done)──► COMPLETED
//! ```
//!
//! SELL orders wait for the seller to fund an escrow and are then paid out in
//! fiat. BUY orders wait for the buyer's bank transfer and are then released
//! crypto from the treasury account.
//!
//! All mutations of one order run under a per-order async lock, and every
//! status change is a compare-and-set in the store, so a monitor, the
//! reconciliation sweep and an API caller can race safely. Money-moving
//! calls carry an idempotency key that is persisted before the call goes
//! out; after an unanswered call the outcome is queried by key before
//! anything is re-sent.

use async_trait::async_trait;
use common::OrderId;
use observability::SettlementMetrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{SettlementError, SettlementResult};
use crate::gateways::{AccountDirectory, BankGateway, EscrowGateway};
use crate::store::traits::OrderStore;
use crate::supervisor::{
    BankCreditProbe, ConfirmationHandler, EscrowFundingProbe, MonitorSupervisor, Probe,
    SupervisorConfig,
};
use crate::types::{
    ConfirmOutcome, EscrowRef, FundingPolicy, MonitorKind, NewOrder, Order, OrderStatus,
    PaymentRef, PayoutRequest, ReleaseRequest, Transaction, TransactionRef, TransferOutcome,
};

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on any single gateway call
    pub gateway_timeout: Duration,
    /// Definitive counter-leg failures before a MATCHED order is failed
    pub counter_leg_max_attempts: u32,
    pub funding_policy: FundingPolicy,
    /// Custody account BUY-path releases are paid from
    pub treasury_account: EscrowRef,
    pub supervisor: SupervisorConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            gateway_timeout: Duration::from_secs(15),
            counter_leg_max_attempts: 5,
            funding_policy: FundingPolicy::default(),
            treasury_account: EscrowRef(config::default_treasury_account()),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_config(
        settlement: &config::SettlementEngineConfig,
        escrow: &config::EscrowGatewayConfig,
    ) -> Self {
        Self {
            gateway_timeout: Duration::from_secs(settlement.gateway_timeout_seconds),
            counter_leg_max_attempts: settlement.counter_leg_max_attempts,
            funding_policy: settlement.funding_policy.into(),
            treasury_account: EscrowRef(
                escrow
                    .treasury_account
                    .clone()
                    .unwrap_or_else(config::default_treasury_account),
            ),
            supervisor: SupervisorConfig::from(settlement),
        }
    }
}

/// What a reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// PENDING orders whose transaction or external resource was (re)created
    pub resubmitted: usize,
    /// Monitors re-attached to PENDING transactions
    pub monitors_attached: usize,
    /// MATCHED orders whose counter-leg was retried
    pub counter_legs_retried: usize,
    /// Orders that reached COMPLETED during this pass
    pub completed: usize,
    /// Orders that could not be handled this pass
    pub errors: usize,
}

type OrderLocks = Mutex<HashMap<OrderId, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive hold on one order. The registry entry is dropped with the last
/// holder, so ids that are never touched again do not accumulate.
struct OrderGuard<'a> {
    locks: &'a OrderLocks,
    order_id: OrderId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for OrderGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock();
        // Waiters hold a clone of the entry
        if locks
            .get(&self.order_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.order_id);
        }
    }
}

/// Settlement orchestrator
pub struct SettlementOrchestrator {
    store: Arc<dyn OrderStore>,
    escrow: Arc<dyn EscrowGateway>,
    bank: Arc<dyn BankGateway>,
    directory: Arc<dyn AccountDirectory>,
    supervisor: MonitorSupervisor,
    config: OrchestratorConfig,
    metrics: SettlementMetrics,
    order_locks: OrderLocks,
}

impl SettlementOrchestrator {
    /// Create the orchestrator together with its monitor supervisor
    pub fn new(
        store: Arc<dyn OrderStore>,
        escrow: Arc<dyn EscrowGateway>,
        bank: Arc<dyn BankGateway>,
        directory: Arc<dyn AccountDirectory>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        let metrics = SettlementMetrics::new();

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let handler: Weak<dyn ConfirmationHandler> = weak.clone();
            let supervisor = MonitorSupervisor::new(config.supervisor.clone(), handler)
                .with_metrics(metrics.clone());

            Self {
                store,
                escrow,
                bank,
                directory,
                supervisor,
                config,
                metrics,
                order_locks: Mutex::new(HashMap::new()),
            }
        })
    }

    pub fn supervisor(&self) -> &MonitorSupervisor {
        &self.supervisor
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // ==================== Intake ====================

    /// Validate, persist as PENDING and submit an inbound order.
    ///
    /// A gateway outage during submission does not fail the call: the order
    /// is returned PENDING with the fault recorded and the reconciliation
    /// sweep finishes the submission later.
    #[instrument(skip_all, fields(user_id = %request.user_id, order_type = %request.order_type))]
    pub async fn create_order(&self, request: NewOrder) -> SettlementResult<Order> {
        request.validate().map_err(SettlementError::Validation)?;

        let order = self.store.create_order(Order::new(request)).await?;
        let order_id = order.order_id;
        self.metrics.order_submitted();
        info!(
            order_id = %order_id,
            amount = %order.amount,
            price = %order.price,
            currency = %order.currency,
            "Order created"
        );

        match self.submit(order_id).await {
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                warn!(order_id = %order_id, error = %e, "Submission deferred to reconciliation");
                self.store.record_fault(order_id, &e.to_string()).await?;
            }
            Err(SettlementError::GatewayRejected(reason)) => {
                self.fail_pending(order_id, format!("settlement rail refused order: {}", reason))
                    .await?;
                return Err(SettlementError::GatewayRejected(reason));
            }
            Err(e) => return Err(e),
        }

        self.get_order(order_id).await
    }

    /// Open the settlement leg of a PENDING order and start monitoring it.
    ///
    /// Fails with `GatewayUnavailable` when the rail cannot be reached; the
    /// order stays PENDING. Fails with `DuplicateMonitor` when the order is
    /// already being monitored.
    #[instrument(skip_all, fields(order_id = %order_id))]
    pub async fn submit(&self, order_id: OrderId) -> SettlementResult<TransactionRef> {
        let _guard = self.lock_order(order_id).await;

        let order = self.load_order(order_id).await?;
        let (transaction, _) = self.attach(&order, true).await?;
        Ok(transaction.to_ref())
    }

    // ==================== Confirmation ====================

    /// Apply a confirmed first leg: CONFIRMED + MATCHED, then the counter-leg.
    ///
    /// Idempotent: once the transaction is CONFIRMED, further calls return
    /// without side effects. Refuses orders that left PENDING by another
    /// route with `InvalidStateTransition`.
    #[instrument(skip_all, fields(order_id = %order_id, kind = %kind))]
    pub async fn on_confirmed(&self, order_id: OrderId, kind: MonitorKind) -> SettlementResult<()> {
        let _guard = self.lock_order(order_id).await;

        let order = self.load_order(order_id).await?;
        if order.monitor_kind() != kind {
            return Err(SettlementError::Internal(format!(
                "order {} settles via {}, not {}",
                order_id,
                order.monitor_kind(),
                kind
            )));
        }

        let (order, transaction) = match self.store.confirm_and_match(order_id).await {
            Ok(ConfirmOutcome::Confirmed { order, transaction }) => (order, transaction),
            Ok(ConfirmOutcome::AlreadyConfirmed { .. }) => {
                debug!("Confirmation already applied");
                self.supervisor.retire(order_id);
                return Ok(());
            }
            Err(e @ SettlementError::InvalidStateTransition { .. }) => {
                warn!(error = %e, "Confirmation refused");
                self.supervisor.retire(order_id);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.metrics.confirmation(kind.as_str());
        info!(
            transaction_id = %transaction.transaction_id,
            "First leg confirmed, order matched"
        );
        self.supervisor.retire(order_id);

        self.settle_counter_leg(&order, &transaction).await?;
        Ok(())
    }

    /// Retry the counter-leg of a MATCHED order
    #[instrument(skip_all, fields(order_id = %order_id))]
    pub async fn retry_counter_leg(&self, order_id: OrderId) -> SettlementResult<Order> {
        let _guard = self.lock_order(order_id).await;

        let order = self.load_order(order_id).await?;
        if order.status != OrderStatus::Matched {
            return Err(SettlementError::InvalidStateTransition {
                order_id,
                from: order.status,
                to: OrderStatus::Completed,
            });
        }

        let transaction = self.load_transaction(order_id).await?;
        if !transaction.is_confirmed() {
            return Err(SettlementError::Internal(format!(
                "order {} is matched but its transaction is {}",
                order_id, transaction.status
            )));
        }

        let order = self.settle_counter_leg(&order, &transaction).await?;
        Ok(order)
    }

    // ==================== Cancellation and failure ====================

    /// Cancel a PENDING order and stop monitoring it
    #[instrument(skip_all, fields(order_id = %order_id))]
    pub async fn cancel(&self, order_id: OrderId) -> SettlementResult<Order> {
        let _guard = self.lock_order(order_id).await;

        let order = self.load_order(order_id).await?;
        let order = self
            .store
            .transition_order(order.order_id, OrderStatus::Pending, OrderStatus::Cancelled, None)
            .await?;

        self.supervisor.retire(order_id);
        self.metrics.order_cancelled();
        info!("Order cancelled");

        Ok(order)
    }

    /// Fail an order whose first leg never confirmed.
    ///
    /// Only PENDING orders are failed; an order that moved on in the
    /// meantime is returned unchanged.
    #[instrument(skip_all, fields(order_id = %order_id))]
    pub async fn fail_pending(&self, order_id: OrderId, reason: String) -> SettlementResult<Order> {
        let _guard = self.lock_order(order_id).await;

        let order = self.load_order(order_id).await?;
        if order.status != OrderStatus::Pending {
            debug!(status = %order.status, "Order no longer pending, not failing it");
            return Ok(order);
        }

        let order = self
            .store
            .transition_order(order_id, OrderStatus::Pending, OrderStatus::Failed, Some(reason.clone()))
            .await?;

        self.supervisor.retire(order_id);
        self.metrics.order_failed();
        error!(%reason, "Order failed before its first leg settled");

        Ok(order)
    }

    // ==================== Recovery ====================

    /// Rebuild in-memory state after a restart: re-attach a monitor to every
    /// PENDING order and resume every unfinished counter-leg.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> SettlementResult<ReconcileReport> {
        info!("Starting settlement recovery");
        let report = self.reconcile().await?;
        info!(
            monitors = report.monitors_attached,
            resubmitted = report.resubmitted,
            counter_legs = report.counter_legs_retried,
            errors = report.errors,
            "Settlement recovery complete"
        );
        Ok(report)
    }

    /// One reconciliation pass over durable state:
    /// - PENDING orders without a transaction or external reference are resubmitted
    /// - PENDING transactions without a live monitor get one
    /// - MATCHED orders get their counter-leg retried
    ///
    /// Per-order failures are logged and counted; only a failure to list
    /// orders aborts the pass.
    pub async fn reconcile(&self) -> SettlementResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let pending = self.store.list_orders(Some(vec![OrderStatus::Pending])).await?;
        for order in pending {
            let order_id = order.order_id;
            match self.reattach(order_id).await {
                Ok(Reattached { resubmitted, registered }) => {
                    report.resubmitted += usize::from(resubmitted);
                    report.monitors_attached += usize::from(registered);
                }
                Err(e) => {
                    report.errors += 1;
                    if e.is_transient() {
                        warn!(order_id = %order_id, error = %e, "Could not re-attach order");
                    } else {
                        error!(order_id = %order_id, error = %e, "Could not re-attach order");
                    }
                }
            }
        }

        let matched = self.store.list_orders(Some(vec![OrderStatus::Matched])).await?;
        for order in matched {
            let order_id = order.order_id;
            report.counter_legs_retried += 1;
            match self.retry_counter_leg(order_id).await {
                Ok(order) if order.status == OrderStatus::Completed => report.completed += 1,
                Ok(_) => {}
                // Completed or failed concurrently
                Err(SettlementError::InvalidStateTransition { .. }) => {}
                Err(e) => {
                    report.errors += 1;
                    error!(order_id = %order_id, error = %e, "Counter-leg retry failed");
                }
            }
        }

        if report != ReconcileReport::default() {
            info!(
                resubmitted = report.resubmitted,
                monitors = report.monitors_attached,
                counter_legs = report.counter_legs_retried,
                completed = report.completed,
                errors = report.errors,
                "Reconciliation pass"
            );
        }
        Ok(report)
    }

    // ==================== Queries ====================

    pub async fn get_order(&self, order_id: OrderId) -> SettlementResult<Order> {
        self.load_order(order_id).await
    }

    pub async fn get_transaction(&self, order_id: OrderId) -> SettlementResult<Transaction> {
        self.load_transaction(order_id).await
    }

    pub async fn list_orders(&self, statuses: Option<Vec<OrderStatus>>) -> SettlementResult<Vec<Order>> {
        self.store.list_orders(statuses).await
    }

    /// Stop every monitor and wait for them
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    // ==================== Internals ====================

    async fn lock_order(&self, order_id: OrderId) -> OrderGuard<'_> {
        let lock = self.order_locks.lock().entry(order_id).or_default().clone();
        let guard = lock.lock_owned().await;
        OrderGuard {
            locks: &self.order_locks,
            order_id,
            guard: Some(guard),
        }
    }

    async fn load_order(&self, order_id: OrderId) -> SettlementResult<Order> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or_else(|| SettlementError::order_not_found(order_id))
    }

    async fn load_transaction(&self, order_id: OrderId) -> SettlementResult<Transaction> {
        self.store
            .get_transaction(order_id)
            .await?
            .ok_or_else(|| SettlementError::transaction_not_found(order_id))
    }

    async fn reattach(&self, order_id: OrderId) -> SettlementResult<Reattached> {
        let _guard = self.lock_order(order_id).await;

        let order = self.load_order(order_id).await?;
        if order.status != OrderStatus::Pending {
            return Ok(Reattached::default());
        }
        let (_, reattached) = self.attach(&order, false).await?;
        Ok(reattached)
    }

    /// Ensure a PENDING order has its transaction, its external resource and
    /// a live monitor. Caller holds the order lock.
    async fn attach(&self, order: &Order, strict: bool) -> SettlementResult<(Transaction, Reattached)> {
        if order.status != OrderStatus::Pending {
            return Err(SettlementError::InvalidStateTransition {
                order_id: order.order_id,
                from: order.status,
                to: OrderStatus::Matched,
            });
        }

        let mut reattached = Reattached::default();
        let mut transaction = match self.store.get_transaction(order.order_id).await? {
            Some(existing) => existing,
            None => {
                reattached.resubmitted = true;
                self.store
                    .create_transaction(Transaction::for_order(order)?)
                    .await?
            }
        };

        if transaction.is_confirmed() {
            // The confirmation is applied by on_confirmed; nothing to watch.
            return Ok((transaction, reattached));
        }

        let external_ref = match transaction.external_ref.clone() {
            Some(external_ref) => external_ref,
            None => {
                reattached.resubmitted = true;
                let external_ref = self.open_external(order).await?;
                transaction = self
                    .store
                    .set_external_ref(order.order_id, &external_ref)
                    .await?;
                info!(
                    order_id = %order.order_id,
                    kind = %transaction.kind,
                    external_ref = %external_ref,
                    "Settlement leg opened"
                );
                external_ref
            }
        };

        if !strict && self.supervisor.is_monitored(order.order_id) {
            return Ok((transaction, reattached));
        }

        let probe = self.build_probe(order, &transaction, &external_ref);
        self.supervisor
            .register(order.order_id, transaction.kind, probe)?;
        reattached.registered = true;
        Ok((transaction, reattached))
    }

    async fn open_external(&self, order: &Order) -> SettlementResult<String> {
        let amount = order.inbound_amount()?;
        match order.monitor_kind() {
            MonitorKind::Escrow => self
                .call_gateway(
                    "escrow",
                    "open_escrow",
                    false,
                    self.escrow.open_escrow(order.order_id, amount),
                )
                .await
                .map(|escrow_ref| escrow_ref.0),
            MonitorKind::Bank => self
                .call_gateway(
                    "bank",
                    "watch_bank_credit",
                    false,
                    self.bank
                        .watch_bank_credit(order.order_id, amount, &order.currency),
                )
                .await
                .map(|payment_ref| payment_ref.0),
        }
    }

    fn build_probe(&self, order: &Order, transaction: &Transaction, external_ref: &str) -> Arc<dyn Probe> {
        match order.monitor_kind() {
            MonitorKind::Escrow => Arc::new(EscrowFundingProbe::new(
                self.escrow.clone(),
                EscrowRef(external_ref.to_string()),
                transaction.amount,
                self.config.funding_policy,
                self.config.gateway_timeout,
            )),
            MonitorKind::Bank => Arc::new(BankCreditProbe::new(
                self.bank.clone(),
                PaymentRef(external_ref.to_string()),
                self.config.gateway_timeout,
            )),
        }
    }

    /// Run a gateway call under the configured timeout.
    ///
    /// A timed-out read is `GatewayUnavailable`; a timed-out money-moving
    /// call is `AmbiguousOutcome` because it may have executed.
    async fn call_gateway<T, F>(
        &self,
        gateway: &'static str,
        operation: &'static str,
        money_moving: bool,
        call: F,
    ) -> SettlementResult<T>
    where
        F: Future<Output = SettlementResult<T>>,
    {
        let _timer = self.metrics.time_gateway_call(gateway, operation);

        match tokio::time::timeout(self.config.gateway_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                match &e {
                    SettlementError::AmbiguousOutcome(_) => self.metrics.ambiguous_outcome(),
                    SettlementError::GatewayUnavailable(_) => self.metrics.gateway_error(gateway),
                    _ => {}
                }
                Err(e)
            }
            Err(_) if money_moving => {
                self.metrics.ambiguous_outcome();
                Err(SettlementError::AmbiguousOutcome(format!(
                    "{} {} timed out after {:?}",
                    gateway, operation, self.config.gateway_timeout
                )))
            }
            Err(_) => {
                self.metrics.gateway_error(gateway);
                Err(SettlementError::GatewayUnavailable(format!(
                    "{} {} timed out after {:?}",
                    gateway, operation, self.config.gateway_timeout
                )))
            }
        }
    }

    /// Idempotency key of the current counter-leg attempt.
    ///
    /// Only definitive failures advance the attempt number, so an unanswered
    /// call is always retried under the key it was first sent with.
    fn counter_leg_key(order: &Order) -> String {
        let prefix = match order.monitor_kind() {
            MonitorKind::Escrow => "payout",
            MonitorKind::Bank => "release",
        };
        format!("{}-{}-{}", prefix, order.order_id, order.counter_leg_attempts + 1)
    }

    async fn query_counter_leg(&self, order: &Order, key: &str) -> SettlementResult<TransferOutcome> {
        match order.monitor_kind() {
            MonitorKind::Escrow => {
                self.call_gateway("bank", "query_payout", false, self.bank.query_payout(key))
                    .await
            }
            MonitorKind::Bank => {
                self.call_gateway("escrow", "query_release", false, self.escrow.query_release(key))
                    .await
            }
        }
    }

    async fn send_counter_leg(&self, order: &Order, key: &str) -> SettlementResult<()> {
        match order.monitor_kind() {
            MonitorKind::Escrow => {
                let bank_details = self.directory.bank_details(order.user_id).await?;
                let request = PayoutRequest {
                    idempotency_key: key.to_string(),
                    user_id: order.user_id,
                    amount: order.outbound_amount()?,
                    currency: order.currency.clone(),
                    bank_details,
                };
                self.store.set_counter_leg_key(order.order_id, key).await?;
                info!(
                    order_id = %order.order_id,
                    amount = %request.amount,
                    currency = %request.currency,
                    key = %key,
                    "Sending fiat payout"
                );
                self.call_gateway("bank", "payout", true, self.bank.payout(&request))
                    .await
            }
            MonitorKind::Bank => {
                let destination = self.directory.crypto_destination(order.user_id).await?;
                let request = ReleaseRequest {
                    idempotency_key: key.to_string(),
                    source: self.config.treasury_account.clone(),
                    destination,
                    amount: order.outbound_amount()?,
                };
                self.store.set_counter_leg_key(order.order_id, key).await?;
                info!(
                    order_id = %order.order_id,
                    amount = %request.amount,
                    destination = %request.destination,
                    key = %key,
                    "Sending custody release"
                );
                self.call_gateway("escrow", "release_escrow", true, self.escrow.release_escrow(&request))
                    .await
            }
        }
    }

    /// Run the counter-leg of a MATCHED order. Caller holds the order lock.
    ///
    /// Returns the order as it stands afterwards: COMPLETED on success,
    /// MATCHED with a fault on a retryable problem, FAILED once the attempt
    /// budget is spent. Only storage and internal errors are returned as
    /// errors.
    async fn settle_counter_leg(&self, order: &Order, transaction: &Transaction) -> SettlementResult<Order> {
        let key = Self::counter_leg_key(order);

        if transaction.counter_leg_key.as_deref() == Some(key.as_str()) {
            match self.query_counter_leg(order, &key).await {
                Ok(TransferOutcome::Completed) => {
                    info!(order_id = %order.order_id, key = %key, "Counter-leg already executed");
                    return self.complete(order).await;
                }
                Ok(TransferOutcome::InFlight) => {
                    return self
                        .store
                        .record_fault(order.order_id, &format!("counter-leg {} still in flight", key))
                        .await;
                }
                Ok(TransferOutcome::Failed(reason)) => {
                    return self.counter_leg_failed(order, reason).await;
                }
                Ok(TransferOutcome::NotFound) => {
                    debug!(order_id = %order.order_id, key = %key, "Counter-leg never reached the provider");
                }
                Err(e) => {
                    warn!(order_id = %order.order_id, key = %key, error = %e, "Counter-leg outcome unknown");
                    return self
                        .store
                        .record_fault(order.order_id, &format!("counter-leg outcome unknown: {}", e))
                        .await;
                }
            }
        }

        match self.send_counter_leg(order, &key).await {
            Ok(()) => self.complete(order).await,
            Err(SettlementError::GatewayRejected(reason)) => self.counter_leg_failed(order, reason).await,
            Err(SettlementError::NotFound(what)) => {
                self.counter_leg_failed(order, format!("no beneficiary: {}", what))
                    .await
            }
            Err(SettlementError::Validation(reason)) => self.counter_leg_failed(order, reason).await,
            Err(e @ SettlementError::AmbiguousOutcome(_)) => {
                warn!(order_id = %order.order_id, key = %key, error = %e, "Counter-leg outcome ambiguous");
                self.store.record_fault(order.order_id, &e.to_string()).await
            }
            Err(e @ SettlementError::GatewayUnavailable(_)) => {
                warn!(order_id = %order.order_id, key = %key, error = %e, "Counter-leg deferred");
                self.store.record_fault(order.order_id, &e.to_string()).await
            }
            Err(e) => Err(e),
        }
    }

    async fn complete(&self, order: &Order) -> SettlementResult<Order> {
        let completed = self
            .store
            .transition_order(order.order_id, OrderStatus::Matched, OrderStatus::Completed, None)
            .await?;
        self.metrics.order_completed();
        info!(order_id = %order.order_id, "Order completed");
        Ok(completed)
    }

    async fn counter_leg_failed(&self, order: &Order, reason: String) -> SettlementResult<Order> {
        self.metrics.counter_leg_failure();
        let updated = self
            .store
            .record_counter_leg_failure(order.order_id, &reason)
            .await?;
        warn!(
            order_id = %order.order_id,
            attempts = updated.counter_leg_attempts,
            max_attempts = self.config.counter_leg_max_attempts,
            %reason,
            "Counter-leg failed"
        );

        if updated.counter_leg_attempts < self.config.counter_leg_max_attempts {
            return Ok(updated);
        }

        let fault = format!(
            "counter-leg failed {} times, last error: {}",
            updated.counter_leg_attempts, reason
        );
        let failed = self
            .store
            .transition_order(order.order_id, OrderStatus::Matched, OrderStatus::Failed, Some(fault))
            .await?;
        self.metrics.order_failed();
        error!(order_id = %order.order_id, "Order failed after its first leg settled; manual intervention required");
        Ok(failed)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Reattached {
    resubmitted: bool,
    registered: bool,
}

#[async_trait]
impl ConfirmationHandler for SettlementOrchestrator {
    async fn on_confirmed(&self, order_id: OrderId, kind: MonitorKind) -> SettlementResult<()> {
        SettlementOrchestrator::on_confirmed(self, order_id, kind).await
    }

    async fn on_monitor_exhausted(
        &self,
        order_id: OrderId,
        _kind: MonitorKind,
        reason: String,
    ) -> SettlementResult<()> {
        self.fail_pending(order_id, reason).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateways::directory::MockAccountDirectory;
    use crate::gateways::{MockBankGateway, MockEscrowGateway, TransferBehavior};
    use crate::store::memory::InMemoryOrderStore;
    use crate::types::{BankDetails, TransactionStatus};
    use assert_matches::assert_matches;
    use common::{OrderType, UserId};
    use rust_decimal::Decimal;

    struct Harness {
        store: Arc<InMemoryOrderStore>,
        escrow: Arc<MockEscrowGateway>,
        bank: Arc<MockBankGateway>,
        orchestrator: Arc<SettlementOrchestrator>,
    }

    fn bank_details() -> BankDetails {
        BankDetails {
            account_holder: "Seller GmbH".to_string(),
            account_number: "DE89370400440532013000".to_string(),
            bank_code: None,
        }
    }

    fn directory() -> MockAccountDirectory {
        let mut directory = MockAccountDirectory::new();
        directory
            .expect_bank_details()
            .returning(|_| Ok(bank_details()));
        directory
            .expect_crypto_destination()
            .returning(|_| Ok("0xbuyer".to_string()));
        directory
    }

    fn harness_with(escrow: MockEscrowGateway, bank: MockBankGateway, directory: MockAccountDirectory) -> Harness {
        let store = Arc::new(InMemoryOrderStore::new());
        let escrow = Arc::new(escrow);
        let bank = Arc::new(bank);
        let config = OrchestratorConfig {
            counter_leg_max_attempts: 2,
            ..OrchestratorConfig::default()
        };
        let orchestrator = SettlementOrchestrator::new(
            store.clone(),
            escrow.clone(),
            bank.clone(),
            Arc::new(directory),
            config,
        );
        Harness {
            store,
            escrow,
            bank,
            orchestrator,
        }
    }

    fn harness() -> Harness {
        harness_with(MockEscrowGateway::new(), MockBankGateway::new(), directory())
    }

    fn new_order(order_type: OrderType) -> NewOrder {
        NewOrder::new(UserId::new(), order_type, Decimal::new(100, 0), Decimal::new(15, 1), "USD")
    }

    #[tokio::test]
    async fn test_create_order_validates() {
        let h = harness();
        let mut request = new_order(OrderType::Sell);
        request.amount = Decimal::ZERO;

        let err = h.orchestrator.create_order(request).await.unwrap_err();
        assert_matches!(err, SettlementError::Validation(_));
        assert!(h.store.list_orders(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_sell_order_opens_escrow_and_monitors() {
        let h = harness();
        let order = h.orchestrator.create_order(new_order(OrderType::Sell)).await.unwrap();

        assert_eq!(order.status, OrderStatus::Pending);
        let tx = h.orchestrator.get_transaction(order.order_id).await.unwrap();
        assert_eq!(tx.kind, MonitorKind::Escrow);
        assert_eq!(tx.amount, Decimal::new(100, 0));
        assert_eq!(tx.external_ref, Some(format!("escrow-{}", order.order_id)));
        assert!(h.orchestrator.supervisor().is_monitored(order.order_id));
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_order_survives_gateway_outage() {
        let h = harness();
        h.bank.set_unavailable(true);

        let order = h.orchestrator.create_order(new_order(OrderType::Buy)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(order.fault_reason.unwrap().contains("bank offline"));
        assert!(!h.orchestrator.supervisor().is_monitored(order.order_id));

        let tx = h.orchestrator.get_transaction(order.order_id).await.unwrap();
        assert!(tx.external_ref.is_none());

        h.bank.set_unavailable(false);
        let report = h.orchestrator.reconcile().await.unwrap();
        assert_eq!(report.resubmitted, 1);
        assert_eq!(report.monitors_attached, 1);
        assert!(h.orchestrator.supervisor().is_monitored(order.order_id));
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_twice_is_duplicate_monitor() {
        let h = harness();
        let order = h.orchestrator.create_order(new_order(OrderType::Sell)).await.unwrap();

        let err = h.orchestrator.submit(order.order_id).await.unwrap_err();
        assert_eq!(err, SettlementError::DuplicateMonitor(order.order_id));
        assert_eq!(h.escrow.open_calls(), 1);
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_on_confirmed_sell_pays_out_fiat_once() {
        let h = harness();
        let order = h.orchestrator.create_order(new_order(OrderType::Sell)).await.unwrap();

        h.orchestrator
            .on_confirmed(order.order_id, MonitorKind::Escrow)
            .await
            .unwrap();
        h.orchestrator
            .on_confirmed(order.order_id, MonitorKind::Escrow)
            .await
            .unwrap();

        let order = h.orchestrator.get_order(order.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
        let payouts = h.bank.payout_calls();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].amount, Decimal::new(150, 0));
        assert_eq!(payouts[0].idempotency_key, format!("payout-{}-1", order.order_id));
        assert!(!h.orchestrator.supervisor().is_monitored(order.order_id));
    }

    #[tokio::test]
    async fn test_on_confirmed_buy_releases_crypto_from_treasury() {
        let h = harness();
        let order = h.orchestrator.create_order(new_order(OrderType::Buy)).await.unwrap();

        h.orchestrator
            .on_confirmed(order.order_id, MonitorKind::Bank)
            .await
            .unwrap();

        let releases = h.escrow.release_calls();
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].amount, Decimal::new(100, 0));
        assert_eq!(releases[0].destination, "0xbuyer");
        assert_eq!(releases[0].source, EscrowRef("treasury".to_string()));
        assert_eq!(
            h.orchestrator.get_order(order.order_id).await.unwrap().status,
            OrderStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_on_confirmed_wrong_kind_is_rejected() {
        let h = harness();
        let order = h.orchestrator.create_order(new_order(OrderType::Buy)).await.unwrap();

        let err = h
            .orchestrator
            .on_confirmed(order.order_id, MonitorKind::Escrow)
            .await
            .unwrap_err();
        assert_matches!(err, SettlementError::Internal(_));
        assert_eq!(
            h.orchestrator.get_transaction(order.order_id).await.unwrap().status,
            TransactionStatus::Pending
        );
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_rules() {
        let h = harness();
        let pending = h.orchestrator.create_order(new_order(OrderType::Sell)).await.unwrap();

        let cancelled = h.orchestrator.cancel(pending.order_id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(!h.orchestrator.supervisor().is_monitored(pending.order_id));

        let err = h
            .orchestrator
            .on_confirmed(pending.order_id, MonitorKind::Escrow)
            .await
            .unwrap_err();
        assert_matches!(err, SettlementError::InvalidStateTransition { from: OrderStatus::Cancelled, .. });
        assert!(h.bank.payout_calls().is_empty());

        let completed = h.orchestrator.create_order(new_order(OrderType::Sell)).await.unwrap();
        h.orchestrator
            .on_confirmed(completed.order_id, MonitorKind::Escrow)
            .await
            .unwrap();
        let err = h.orchestrator.cancel(completed.order_id).await.unwrap_err();
        assert_matches!(
            err,
            SettlementError::InvalidStateTransition {
                from: OrderStatus::Completed,
                to: OrderStatus::Cancelled,
                ..
            }
        );
        assert_eq!(
            h.orchestrator.get_order(completed.order_id).await.unwrap().status,
            OrderStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_cancel_unknown_order() {
        let h = harness();
        let err = h.orchestrator.cancel(OrderId::new()).await.unwrap_err();
        assert_matches!(err, SettlementError::NotFound(_));
    }

    #[tokio::test]
    async fn test_rejected_counter_leg_stays_matched_then_fails() {
        let h = harness_with(
            MockEscrowGateway::new(),
            MockBankGateway::new().with_payout_behavior(TransferBehavior::Reject("account closed".to_string())),
            directory(),
        );
        let order = h.orchestrator.create_order(new_order(OrderType::Sell)).await.unwrap();

        h.orchestrator
            .on_confirmed(order.order_id, MonitorKind::Escrow)
            .await
            .unwrap();
        let matched = h.orchestrator.get_order(order.order_id).await.unwrap();
        assert_eq!(matched.status, OrderStatus::Matched);
        assert!(matched.retry_pending);
        assert_eq!(matched.counter_leg_attempts, 1);

        let failed = h.orchestrator.retry_counter_leg(order.order_id).await.unwrap();
        assert_eq!(failed.status, OrderStatus::Failed);
        assert!(failed.fault_reason.unwrap().contains("account closed"));

        let keys: Vec<String> = h
            .bank
            .payout_calls()
            .into_iter()
            .map(|p| p.idempotency_key)
            .collect();
        assert_eq!(
            keys,
            vec![
                format!("payout-{}-1", order.order_id),
                format!("payout-{}-2", order.order_id)
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_counter_leg_can_recover() {
        let h = harness_with(
            MockEscrowGateway::new(),
            MockBankGateway::new().with_payout_behavior(TransferBehavior::Reject("limit".to_string())),
            directory(),
        );
        let order = h.orchestrator.create_order(new_order(OrderType::Sell)).await.unwrap();
        h.orchestrator
            .on_confirmed(order.order_id, MonitorKind::Escrow)
            .await
            .unwrap();

        h.bank.set_payout_behavior(TransferBehavior::Complete);
        let report = h.orchestrator.reconcile().await.unwrap();
        assert_eq!(report.counter_legs_retried, 1);
        assert_eq!(report.completed, 1);

        let completed = h.orchestrator.get_order(order.order_id).await.unwrap();
        assert_eq!(completed.status, OrderStatus::Completed);
        assert!(!completed.retry_pending);
        assert_eq!(h.bank.executed_payouts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ambiguous_payout_is_resolved_by_query_not_resent() {
        let h = harness_with(
            MockEscrowGateway::new(),
            MockBankGateway::new().with_payout_behavior(TransferBehavior::LoseResponse),
            directory(),
        );
        let order = h.orchestrator.create_order(new_order(OrderType::Sell)).await.unwrap();

        h.orchestrator
            .on_confirmed(order.order_id, MonitorKind::Escrow)
            .await
            .unwrap();
        let matched = h.orchestrator.get_order(order.order_id).await.unwrap();
        assert_eq!(matched.status, OrderStatus::Matched);
        assert_eq!(matched.counter_leg_attempts, 0);
        assert!(matched.fault_reason.unwrap().contains("Ambiguous"));

        let completed = h.orchestrator.retry_counter_leg(order.order_id).await.unwrap();
        assert_eq!(completed.status, OrderStatus::Completed);
        assert_eq!(h.bank.payout_calls().len(), 1);
        assert_eq!(h.bank.executed_payouts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_payout_is_resent_under_same_key() {
        let h = harness_with(
            MockEscrowGateway::new(),
            MockBankGateway::new().with_payout_behavior(TransferBehavior::Stall),
            directory(),
        );
        let order = h.orchestrator.create_order(new_order(OrderType::Sell)).await.unwrap();
        h.orchestrator
            .on_confirmed(order.order_id, MonitorKind::Escrow)
            .await
            .unwrap();

        h.bank.set_payout_behavior(TransferBehavior::Complete);
        let completed = h.orchestrator.retry_counter_leg(order.order_id).await.unwrap();
        assert_eq!(completed.status, OrderStatus::Completed);

        let keys: Vec<String> = h
            .bank
            .payout_calls()
            .into_iter()
            .map(|p| p.idempotency_key)
            .collect();
        let key = format!("payout-{}-1", order.order_id);
        assert_eq!(keys, vec![key.clone(), key]);
        assert_eq!(h.bank.executed_payouts(), 1);
    }

    #[tokio::test]
    async fn test_missing_beneficiary_counts_as_failure() {
        let mut directory = MockAccountDirectory::new();
        directory
            .expect_bank_details()
            .times(2)
            .returning(|user| Err(SettlementError::not_found(format!("bank details for user {}", user))));
        let h = harness_with(MockEscrowGateway::new(), MockBankGateway::new(), directory);
        let order = h.orchestrator.create_order(new_order(OrderType::Sell)).await.unwrap();

        h.orchestrator
            .on_confirmed(order.order_id, MonitorKind::Escrow)
            .await
            .unwrap();
        let failed = h.orchestrator.retry_counter_leg(order.order_id).await.unwrap();

        assert_eq!(failed.status, OrderStatus::Failed);
        assert!(failed.fault_reason.unwrap().contains("no beneficiary"));
        assert!(h.bank.payout_calls().is_empty());
    }

    #[tokio::test]
    async fn test_retry_counter_leg_requires_matched() {
        let h = harness();
        let order = h.orchestrator.create_order(new_order(OrderType::Buy)).await.unwrap();

        let err = h.orchestrator.retry_counter_leg(order.order_id).await.unwrap_err();
        assert_matches!(err, SettlementError::InvalidStateTransition { from: OrderStatus::Pending, .. });
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_fail_pending_only_fails_pending_orders() {
        let h = harness();
        let pending = h.orchestrator.create_order(new_order(OrderType::Buy)).await.unwrap();
        let failed = h
            .orchestrator
            .fail_pending(pending.order_id, "bank never confirmed".to_string())
            .await
            .unwrap();
        assert_eq!(failed.status, OrderStatus::Failed);
        assert_eq!(failed.fault_reason.as_deref(), Some("bank never confirmed"));
        assert_eq!(
            h.orchestrator.get_transaction(pending.order_id).await.unwrap().status,
            TransactionStatus::Pending
        );

        let matched = h.orchestrator.create_order(new_order(OrderType::Buy)).await.unwrap();
        h.escrow.set_release_behavior(TransferBehavior::Unavailable);
        h.orchestrator
            .on_confirmed(matched.order_id, MonitorKind::Bank)
            .await
            .unwrap();
        let unchanged = h
            .orchestrator
            .fail_pending(matched.order_id, "late".to_string())
            .await
            .unwrap();
        assert_eq!(unchanged.status, OrderStatus::Matched);
    }

    #[tokio::test]
    async fn test_storage_failure_during_confirmation_is_surfaced() {
        let h = harness();
        let order = h.orchestrator.create_order(new_order(OrderType::Sell)).await.unwrap();

        h.store.set_fail_writes(true);
        let err = h
            .orchestrator
            .on_confirmed(order.order_id, MonitorKind::Escrow)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(h.bank.payout_calls().is_empty());

        h.store.set_fail_writes(false);
        h.orchestrator
            .on_confirmed(order.order_id, MonitorKind::Escrow)
            .await
            .unwrap();
        assert_eq!(h.bank.payout_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_confirmations_pay_once() {
        let h = harness();
        let order = h.orchestrator.create_order(new_order(OrderType::Sell)).await.unwrap();

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let orchestrator = h.orchestrator.clone();
                let order_id = order.order_id;
                tokio::spawn(async move { orchestrator.on_confirmed(order_id, MonitorKind::Escrow).await })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }

        assert_eq!(h.bank.payout_calls().len(), 1);
        assert_eq!(
            h.orchestrator.get_order(order.order_id).await.unwrap().status,
            OrderStatus::Completed
        );
    }

    fn huge_order(order_type: OrderType) -> NewOrder {
        let huge = Decimal::new(1_000_000_000_000_000, 0);
        NewOrder::new(UserId::new(), order_type, huge, huge, "USD")
    }

    #[tokio::test]
    async fn test_create_order_rejects_fiat_overflow() {
        let h = harness();

        let err = h.orchestrator.create_order(huge_order(OrderType::Buy)).await.unwrap_err();
        assert_matches!(err, SettlementError::Validation(_));
        assert!(h.store.list_orders(None).await.unwrap().is_empty());

        let report = h.orchestrator.reconcile().await.unwrap();
        assert_eq!(report, ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_stored_overflowing_orders_do_not_stall_reconcile() {
        let h = harness();

        let buy = h.store.create_order(Order::new(huge_order(OrderType::Buy))).await.unwrap();
        let sell = h.store.create_order(Order::new(huge_order(OrderType::Sell))).await.unwrap();
        h.store
            .create_transaction(Transaction::for_order(&sell).unwrap())
            .await
            .unwrap();
        h.store.confirm_and_match(sell.order_id).await.unwrap();

        let report = h.orchestrator.reconcile().await.unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.counter_legs_retried, 1);
        assert_eq!(
            h.orchestrator.get_order(sell.order_id).await.unwrap().counter_leg_attempts,
            1
        );

        h.orchestrator.reconcile().await.unwrap();
        let failed = h.orchestrator.get_order(sell.order_id).await.unwrap();
        assert_eq!(failed.status, OrderStatus::Failed);
        assert!(h.bank.payout_calls().is_empty());

        let stuck = h.orchestrator.get_order(buy.order_id).await.unwrap();
        assert_eq!(stuck.status, OrderStatus::Pending);
        assert!(h.store.get_transaction(buy.order_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_order_locks_are_released_on_every_path() {
        let h = harness();

        h.orchestrator.cancel(OrderId::new()).await.unwrap_err();
        h.orchestrator
            .on_confirmed(OrderId::new(), MonitorKind::Bank)
            .await
            .unwrap_err();
        h.orchestrator.retry_counter_leg(OrderId::new()).await.unwrap_err();
        assert!(h.orchestrator.order_locks.lock().is_empty());

        let order = h.orchestrator.create_order(new_order(OrderType::Sell)).await.unwrap();
        h.orchestrator
            .on_confirmed(order.order_id, MonitorKind::Escrow)
            .await
            .unwrap();
        h.orchestrator.cancel(order.order_id).await.unwrap_err();
        h.orchestrator.retry_counter_leg(order.order_id).await.unwrap_err();
        assert!(h.orchestrator.order_locks.lock().is_empty());

        let pending = h.orchestrator.create_order(new_order(OrderType::Buy)).await.unwrap();
        h.orchestrator.retry_counter_leg(pending.order_id).await.unwrap_err();
        assert!(h.orchestrator.order_locks.lock().is_empty());
        h.orchestrator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_racing_confirmation_has_one_winner() {
        let h = harness();

        for _ in 0..25 {
            let order = h.orchestrator.create_order(new_order(OrderType::Sell)).await.unwrap();
            let payouts_before = h.bank.payout_calls().len();

            let confirm = {
                let orchestrator = h.orchestrator.clone();
                tokio::spawn(async move { orchestrator.on_confirmed(order.order_id, MonitorKind::Escrow).await })
            };
            let cancel = {
                let orchestrator = h.orchestrator.clone();
                tokio::spawn(async move { orchestrator.cancel(order.order_id).await })
            };
            let (confirmed, cancelled) = (confirm.await.unwrap(), cancel.await.unwrap());

            let settled = h.orchestrator.get_order(order.order_id).await.unwrap();
            let payouts = h.bank.payout_calls().len() - payouts_before;
            match (confirmed, cancelled) {
                (Ok(()), Err(err)) => {
                    assert_matches!(
                        err,
                        SettlementError::InvalidStateTransition { to: OrderStatus::Cancelled, .. }
                    );
                    assert_eq!(settled.status, OrderStatus::Completed);
                    assert_eq!(payouts, 1);
                }
                (Err(err), Ok(cancelled)) => {
                    assert_matches!(
                        err,
                        SettlementError::InvalidStateTransition { from: OrderStatus::Cancelled, .. }
                    );
                    assert_eq!(cancelled.status, OrderStatus::Cancelled);
                    assert_eq!(settled.status, OrderStatus::Cancelled);
                    assert_eq!(payouts, 0);
                }
                other => panic!("expected exactly one winner, got {:?}", other),
            }
            assert!(!h.orchestrator.supervisor().is_monitored(order.order_id));
        }

        assert!(h.orchestrator.order_locks.lock().is_empty());
        h.orchestrator.shutdown().await;
    }
}
