//! Bank gateway - trait and implementations

use async_trait::async_trait;
use common::{Currency, OrderId};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::TransferBehavior;
use crate::error::{SettlementError, SettlementResult};
use crate::types::{PaymentRef, PayoutRequest, TransferOutcome};

/// Reference the buyer quotes on the inbound wire
pub fn payment_reference(order_id: OrderId) -> String {
    format!("otc-{}", order_id)
}

/// Client trait for the fiat banking provider
#[async_trait]
pub trait BankGateway: Send + Sync {
    /// Start watching for the buyer's inbound transfer
    async fn watch_bank_credit(
        &self,
        order_id: OrderId,
        amount: Decimal,
        currency: &Currency,
    ) -> SettlementResult<PaymentRef>;

    /// Whether the watched transfer has completed
    async fn query_bank_received(&self, payment_ref: &PaymentRef) -> SettlementResult<bool>;

    /// Send a fiat payout
    async fn payout(&self, request: &PayoutRequest) -> SettlementResult<()>;

    /// Look up a payout by its idempotency key
    async fn query_payout(&self, idempotency_key: &str) -> SettlementResult<TransferOutcome>;
}

// ==================== Mock Implementation ====================

#[derive(Debug, Default)]
struct MockBankState {
    watched: HashMap<PaymentRef, u32>,
    credited: HashSet<PaymentRef>,
    credit_on_poll: Option<u32>,
    unavailable: bool,
    watch_calls: u32,
    payout_behavior: TransferBehavior,
    payout_calls: Vec<PayoutRequest>,
    payouts: HashMap<String, TransferOutcome>,
}

/// Mock banking provider for tests and the sandbox profile
#[derive(Debug, Default)]
pub struct MockBankGateway {
    state: Mutex<MockBankState>,
}

impl MockBankGateway {
    /// Create a new mock bank gateway
    pub fn new() -> Self {
        Self::default()
    }

    /// Every watched transfer completes on its `poll`-th query
    pub fn with_credit_on_poll(self, poll: u32) -> Self {
        self.state.lock().credit_on_poll = Some(poll);
        self
    }

    /// Configure how payouts are answered
    pub fn with_payout_behavior(self, behavior: TransferBehavior) -> Self {
        self.set_payout_behavior(behavior);
        self
    }

    pub fn set_payout_behavior(&self, behavior: TransferBehavior) {
        self.state.lock().payout_behavior = behavior;
    }

    /// Fail every call with `GatewayUnavailable` while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Mark the inbound transfer for an order as completed
    pub fn credit(&self, order_id: OrderId) {
        self.state
            .lock()
            .credited
            .insert(PaymentRef(payment_reference(order_id)));
    }

    /// Number of status queries seen for an order's transfer
    pub fn query_count(&self, order_id: OrderId) -> u32 {
        self.state
            .lock()
            .watched
            .get(&PaymentRef(payment_reference(order_id)))
            .copied()
            .unwrap_or(0)
    }

    pub fn watch_calls(&self) -> u32 {
        self.state.lock().watch_calls
    }

    /// Every payout request that reached the provider, in order
    pub fn payout_calls(&self) -> Vec<PayoutRequest> {
        self.state.lock().payout_calls.clone()
    }

    /// Payouts the provider actually executed
    pub fn executed_payouts(&self) -> usize {
        self.state
            .lock()
            .payouts
            .values()
            .filter(|o| **o == TransferOutcome::Completed)
            .count()
    }
}

#[async_trait]
impl BankGateway for MockBankGateway {
    async fn watch_bank_credit(
        &self,
        order_id: OrderId,
        _amount: Decimal,
        _currency: &Currency,
    ) -> SettlementResult<PaymentRef> {
        let mut state = self.state.lock();
        state.watch_calls += 1;
        if state.unavailable {
            return Err(SettlementError::GatewayUnavailable("bank offline".to_string()));
        }
        let payment_ref = PaymentRef(payment_reference(order_id));
        state.watched.entry(payment_ref.clone()).or_insert(0);
        Ok(payment_ref)
    }

    async fn query_bank_received(&self, payment_ref: &PaymentRef) -> SettlementResult<bool> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(SettlementError::GatewayUnavailable("bank offline".to_string()));
        }

        let credit_on_poll = state.credit_on_poll;
        let queries = state
            .watched
            .get_mut(payment_ref)
            .ok_or_else(|| SettlementError::not_found(format!("bank transfer {}", payment_ref)))?;
        *queries += 1;
        let polls = *queries;

        if credit_on_poll.is_some_and(|poll| polls >= poll) {
            state.credited.insert(payment_ref.clone());
        }
        Ok(state.credited.contains(payment_ref))
    }

    async fn payout(&self, request: &PayoutRequest) -> SettlementResult<()> {
        let behavior = {
            let mut state = self.state.lock();
            state.payout_calls.push(request.clone());
            if state.payouts.get(&request.idempotency_key) == Some(&TransferOutcome::Completed) {
                return Ok(());
            }
            let behavior = state.payout_behavior.clone();
            match &behavior {
                TransferBehavior::Complete | TransferBehavior::LoseResponse => {
                    state
                        .payouts
                        .insert(request.idempotency_key.clone(), TransferOutcome::Completed);
                }
                TransferBehavior::Reject(reason) => {
                    state.payouts.insert(
                        request.idempotency_key.clone(),
                        TransferOutcome::Failed(reason.clone()),
                    );
                }
                TransferBehavior::Unavailable | TransferBehavior::Stall => {}
            }
            behavior
        };

        match behavior {
            TransferBehavior::Complete => Ok(()),
            TransferBehavior::Reject(reason) => Err(SettlementError::GatewayRejected(reason)),
            TransferBehavior::Unavailable => {
                Err(SettlementError::GatewayUnavailable("bank offline".to_string()))
            }
            TransferBehavior::LoseResponse | TransferBehavior::Stall => {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                Err(SettlementError::AmbiguousOutcome("no response from bank".to_string()))
            }
        }
    }

    async fn query_payout(&self, idempotency_key: &str) -> SettlementResult<TransferOutcome> {
        let state = self.state.lock();
        if state.unavailable {
            return Err(SettlementError::GatewayUnavailable("bank offline".to_string()));
        }
        Ok(state
            .payouts
            .get(idempotency_key)
            .cloned()
            .unwrap_or(TransferOutcome::NotFound))
    }
}

// ==================== HTTP Implementation ====================

#[cfg(feature = "client")]
pub mod http {
    use async_trait::async_trait;
    use common::{Currency, OrderId};
    use reqwest::{Client, StatusCode};
    use rust_decimal::Decimal;
    use serde::Deserialize;
    use std::time::Duration;

    use super::{payment_reference, BankGateway};
    use crate::error::{SettlementError, SettlementResult};
    use crate::gateways::http::{status_error, transport_error, API_KEY_HEADER, IDEMPOTENCY_HEADER};
    use crate::types::{PaymentRef, PayoutRequest, TransferOutcome};

    #[derive(Debug, Deserialize)]
    struct TransactionResponse {
        #[serde(default)]
        id: Option<String>,
        status: String,
        #[serde(default)]
        reason: Option<String>,
    }

    /// REST adapter for the banking provider
    pub struct HttpBankGateway {
        client: Client,
        base_url: String,
        api_key: String,
    }

    impl HttpBankGateway {
        /// Create a new HTTP bank gateway
        pub fn new(base_url: &str, api_key: impl Into<String>, timeout: Duration) -> SettlementResult<Self> {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| SettlementError::Config(format!("Failed to build HTTP client: {}", e)))?;

            Ok(Self {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key: api_key.into(),
            })
        }
    }

    #[async_trait]
    impl BankGateway for HttpBankGateway {
        async fn watch_bank_credit(
            &self,
            order_id: OrderId,
            amount: Decimal,
            currency: &Currency,
        ) -> SettlementResult<PaymentRef> {
            let url = format!("{}/transactions/expected", self.base_url);
            let reference = payment_reference(order_id);

            let response = self
                .client
                .post(&url)
                .header(API_KEY_HEADER, &self.api_key)
                .header(IDEMPOTENCY_HEADER, &reference)
                .json(&serde_json::json!({
                    "reference": reference,
                    "amount": amount.to_string(),
                    "currency": currency.as_str(),
                }))
                .send()
                .await
                .map_err(|e| transport_error(e, false))?;

            if !response.status().is_success() {
                return Err(status_error(response, false).await);
            }

            let watched: TransactionResponse = response
                .json()
                .await
                .map_err(|e| SettlementError::GatewayUnavailable(e.to_string()))?;
            Ok(PaymentRef(watched.id.unwrap_or(reference)))
        }

        async fn query_bank_received(&self, payment_ref: &PaymentRef) -> SettlementResult<bool> {
            let url = format!("{}/transactions/{}", self.base_url, payment_ref);

            let response = self
                .client
                .get(&url)
                .header(API_KEY_HEADER, &self.api_key)
                .send()
                .await
                .map_err(|e| transport_error(e, false))?;

            if !response.status().is_success() {
                return Err(status_error(response, false).await);
            }

            let transaction: TransactionResponse = response
                .json()
                .await
                .map_err(|e| SettlementError::GatewayUnavailable(e.to_string()))?;
            Ok(transaction.status == "COMPLETED")
        }

        async fn payout(&self, request: &PayoutRequest) -> SettlementResult<()> {
            let url = format!("{}/transfers", self.base_url);

            let response = self
                .client
                .post(&url)
                .header(API_KEY_HEADER, &self.api_key)
                .header(IDEMPOTENCY_HEADER, &request.idempotency_key)
                .json(&serde_json::json!({
                    "reference": request.idempotency_key,
                    "userId": request.user_id.to_string(),
                    "amount": request.amount.to_string(),
                    "currency": request.currency.as_str(),
                    "bankDetails": request.bank_details,
                }))
                .send()
                .await
                .map_err(|e| transport_error(e, true))?;

            // 409: the bank already holds a transfer under this reference
            if response.status().is_success() || response.status() == StatusCode::CONFLICT {
                return Ok(());
            }
            Err(status_error(response, true).await)
        }

        async fn query_payout(&self, idempotency_key: &str) -> SettlementResult<TransferOutcome> {
            let url = format!("{}/transfers/by-reference/{}", self.base_url, idempotency_key);

            let response = self
                .client
                .get(&url)
                .header(API_KEY_HEADER, &self.api_key)
                .send()
                .await
                .map_err(|e| transport_error(e, false))?;

            if response.status() == StatusCode::NOT_FOUND {
                return Ok(TransferOutcome::NotFound);
            }
            if !response.status().is_success() {
                return Err(status_error(response, false).await);
            }

            let transfer: TransactionResponse = response
                .json()
                .await
                .map_err(|e| SettlementError::GatewayUnavailable(e.to_string()))?;

            Ok(match transfer.status.as_str() {
                "COMPLETED" => TransferOutcome::Completed,
                "FAILED" | "REJECTED" | "RETURNED" => {
                    TransferOutcome::Failed(transfer.reason.unwrap_or(transfer.status))
                }
                _ => TransferOutcome::InFlight,
            })
        }
    }
}
