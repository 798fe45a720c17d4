//! Escrow gateway - trait and implementations

use async_trait::async_trait;
use common::OrderId;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;

use super::TransferBehavior;
use crate::error::{SettlementError, SettlementResult};
use crate::types::{EscrowAccount, EscrowRef, EscrowStatus, FundingPolicy, ReleaseRequest, TransferOutcome};

/// Name of the escrow account opened for an order.
///
/// Deterministic so a re-open after a crash lands on the same account.
pub fn escrow_name(order_id: OrderId) -> String {
    format!("escrow-{}", order_id)
}

/// Client trait for the crypto custody provider
#[async_trait]
pub trait EscrowGateway: Send + Sync {
    /// Open (or re-open) the escrow account for an order
    async fn open_escrow(&self, order_id: OrderId, amount: Decimal) -> SettlementResult<EscrowRef>;

    /// Current snapshot of an escrow account
    async fn fetch_escrow(&self, escrow_ref: &EscrowRef) -> SettlementResult<EscrowAccount>;

    /// Whether the escrow holds enough of the asset under `policy`
    async fn query_escrow_funded(
        &self,
        escrow_ref: &EscrowRef,
        expected: Decimal,
        policy: FundingPolicy,
    ) -> SettlementResult<bool> {
        let account = self.fetch_escrow(escrow_ref).await?;
        Ok(account.is_funded_for(expected, policy))
    }

    /// Move custody funds to an external destination
    async fn release_escrow(&self, request: &ReleaseRequest) -> SettlementResult<()>;

    /// Look up a release by its idempotency key
    async fn query_release(&self, idempotency_key: &str) -> SettlementResult<TransferOutcome>;
}

// ==================== Mock Implementation ====================

#[derive(Debug)]
struct MockEscrow {
    account: EscrowAccount,
    expected: Decimal,
    fetches: u32,
}

#[derive(Debug, Default)]
struct MockEscrowState {
    escrows: HashMap<EscrowRef, MockEscrow>,
    fund_on_poll: Option<u32>,
    unavailable: bool,
    failing_fetches: u32,
    open_calls: u32,
    release_behavior: TransferBehavior,
    release_calls: Vec<ReleaseRequest>,
    releases: HashMap<String, TransferOutcome>,
}

/// Mock custody provider for tests and the sandbox profile
#[derive(Debug, Default)]
pub struct MockEscrowGateway {
    state: Mutex<MockEscrowState>,
}

impl MockEscrowGateway {
    /// Create a new mock escrow gateway
    pub fn new() -> Self {
        Self::default()
    }

    /// Every escrow becomes fully funded on its `poll`-th fetch
    pub fn with_funding_on_poll(self, poll: u32) -> Self {
        self.state.lock().fund_on_poll = Some(poll);
        self
    }

    /// Configure how releases are answered
    pub fn with_release_behavior(self, behavior: TransferBehavior) -> Self {
        self.set_release_behavior(behavior);
        self
    }

    pub fn set_release_behavior(&self, behavior: TransferBehavior) {
        self.state.lock().release_behavior = behavior;
    }

    /// Fail every call with `GatewayUnavailable` while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Fail the next `count` fetches with `GatewayUnavailable`
    pub fn fail_next_fetches(&self, count: u32) {
        self.state.lock().failing_fetches = count;
    }

    /// Credit an order's escrow with `amount`
    pub fn fund(&self, order_id: OrderId, amount: Decimal) {
        let mut state = self.state.lock();
        if let Some(escrow) = state.escrows.get_mut(&EscrowRef(escrow_name(order_id))) {
            escrow.account.funded_amount += amount;
            if escrow.account.funded_amount >= escrow.expected {
                escrow.account.status = EscrowStatus::Funded;
            }
        }
    }

    /// Cancel an order's escrow at the provider
    pub fn cancel_escrow(&self, order_id: OrderId) {
        let mut state = self.state.lock();
        if let Some(escrow) = state.escrows.get_mut(&EscrowRef(escrow_name(order_id))) {
            escrow.account.status = EscrowStatus::Cancelled;
        }
    }

    /// Number of fetches seen for an order's escrow
    pub fn fetch_count(&self, order_id: OrderId) -> u32 {
        self.state
            .lock()
            .escrows
            .get(&EscrowRef(escrow_name(order_id)))
            .map(|e| e.fetches)
            .unwrap_or(0)
    }

    pub fn open_calls(&self) -> u32 {
        self.state.lock().open_calls
    }

    /// Every release request that reached the provider, in order
    pub fn release_calls(&self) -> Vec<ReleaseRequest> {
        self.state.lock().release_calls.clone()
    }

    /// Releases the provider actually executed
    pub fn executed_releases(&self) -> usize {
        self.state
            .lock()
            .releases
            .values()
            .filter(|o| **o == TransferOutcome::Completed)
            .count()
    }
}

#[async_trait]
impl EscrowGateway for MockEscrowGateway {
    async fn open_escrow(&self, order_id: OrderId, amount: Decimal) -> SettlementResult<EscrowRef> {
        let mut state = self.state.lock();
        state.open_calls += 1;
        if state.unavailable {
            return Err(SettlementError::GatewayUnavailable("custody provider offline".to_string()));
        }

        let escrow_ref = EscrowRef(escrow_name(order_id));
        state.escrows.entry(escrow_ref.clone()).or_insert_with(|| MockEscrow {
            account: EscrowAccount {
                escrow_ref: escrow_ref.clone(),
                funded_amount: Decimal::ZERO,
                status: EscrowStatus::Pending,
            },
            expected: amount,
            fetches: 0,
        });
        Ok(escrow_ref)
    }

    async fn fetch_escrow(&self, escrow_ref: &EscrowRef) -> SettlementResult<EscrowAccount> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(SettlementError::GatewayUnavailable("custody provider offline".to_string()));
        }
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(SettlementError::GatewayUnavailable("custody provider timeout".to_string()));
        }

        let fund_on_poll = state.fund_on_poll;
        let escrow = state
            .escrows
            .get_mut(escrow_ref)
            .ok_or_else(|| SettlementError::not_found(format!("escrow {}", escrow_ref)))?;
        escrow.fetches += 1;
        if let Some(poll) = fund_on_poll {
            if escrow.fetches >= poll && escrow.account.status == EscrowStatus::Pending {
                escrow.account.funded_amount = escrow.expected;
                escrow.account.status = EscrowStatus::Funded;
            }
        }
        Ok(escrow.account.clone())
    }

    async fn release_escrow(&self, request: &ReleaseRequest) -> SettlementResult<()> {
        let behavior = {
            let mut state = self.state.lock();
            state.release_calls.push(request.clone());
            if state.releases.get(&request.idempotency_key) == Some(&TransferOutcome::Completed) {
                return Ok(());
            }
            let behavior = state.release_behavior.clone();
            match &behavior {
                TransferBehavior::Complete | TransferBehavior::LoseResponse => {
                    state
                        .releases
                        .insert(request.idempotency_key.clone(), TransferOutcome::Completed);
                }
                TransferBehavior::Reject(reason) => {
                    state.releases.insert(
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
            TransferBehavior::Unavailable => Err(SettlementError::GatewayUnavailable(
                "custody provider offline".to_string(),
            )),
            TransferBehavior::LoseResponse | TransferBehavior::Stall => {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                Err(SettlementError::AmbiguousOutcome("no response from custody provider".to_string()))
            }
        }
    }

    async fn query_release(&self, idempotency_key: &str) -> SettlementResult<TransferOutcome> {
        let state = self.state.lock();
        if state.unavailable {
            return Err(SettlementError::GatewayUnavailable("custody provider offline".to_string()));
        }
        Ok(state
            .releases
            .get(idempotency_key)
            .cloned()
            .unwrap_or(TransferOutcome::NotFound))
    }
}

// ==================== HTTP Implementation ====================

#[cfg(feature = "client")]
pub mod http {
    use async_trait::async_trait;
    use common::OrderId;
    use reqwest::{Client, StatusCode};
    use rust_decimal::Decimal;
    use serde::Deserialize;
    use std::time::Duration;

    use super::{escrow_name, EscrowGateway};
    use crate::error::{SettlementError, SettlementResult};
    use crate::gateways::http::{status_error, transport_error, API_KEY_HEADER, IDEMPOTENCY_HEADER};
    use crate::types::{EscrowAccount, EscrowRef, EscrowStatus, ReleaseRequest, TransferOutcome};

    #[derive(Debug, Deserialize)]
    struct VaultAccountResponse {
        id: String,
        #[serde(default)]
        assets: Vec<VaultAsset>,
        #[serde(default)]
        status: Option<EscrowStatus>,
    }

    #[derive(Debug, Deserialize)]
    struct VaultAsset {
        id: String,
        total: Decimal,
    }

    #[derive(Debug, Deserialize)]
    struct TransferStatusResponse {
        status: String,
        #[serde(default, rename = "subStatus")]
        sub_status: Option<String>,
    }

    /// REST adapter for a vault-based custody provider
    pub struct HttpEscrowGateway {
        client: Client,
        base_url: String,
        api_key: String,
        asset_id: String,
    }

    impl HttpEscrowGateway {
        /// Create a new HTTP escrow gateway
        pub fn new(
            base_url: &str,
            api_key: impl Into<String>,
            asset_id: impl Into<String>,
            timeout: Duration,
        ) -> SettlementResult<Self> {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| SettlementError::Config(format!("Failed to build HTTP client: {}", e)))?;

            Ok(Self {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key: api_key.into(),
                asset_id: asset_id.into(),
            })
        }

        fn balance_of(&self, response: &VaultAccountResponse) -> Decimal {
            response
                .assets
                .iter()
                .find(|asset| asset.id == self.asset_id)
                .map(|asset| asset.total)
                .unwrap_or(Decimal::ZERO)
        }
    }

    #[async_trait]
    impl EscrowGateway for HttpEscrowGateway {
        async fn open_escrow(&self, order_id: OrderId, _amount: Decimal) -> SettlementResult<EscrowRef> {
            let url = format!("{}/v1/vault/accounts", self.base_url);
            let name = escrow_name(order_id);

            let response = self
                .client
                .post(&url)
                .header(API_KEY_HEADER, &self.api_key)
                .header(IDEMPOTENCY_HEADER, &name)
                .json(&serde_json::json!({
                    "name": name,
                    "customerRefId": order_id.to_string(),
                    "hiddenOnUI": false,
                }))
                .send()
                .await
                .map_err(|e| transport_error(e, false))?;

            if !response.status().is_success() {
                return Err(status_error(response, false).await);
            }

            let account: VaultAccountResponse = response
                .json()
                .await
                .map_err(|e| SettlementError::GatewayUnavailable(e.to_string()))?;
            Ok(EscrowRef(account.id))
        }

        async fn fetch_escrow(&self, escrow_ref: &EscrowRef) -> SettlementResult<EscrowAccount> {
            let url = format!("{}/v1/vault/accounts/{}", self.base_url, escrow_ref);

            let response = self
                .client
                .get(&url)
                .header(API_KEY_HEADER, &self.api_key)
                .send()
                .await
                .map_err(|e| transport_error(e, false))?;

            if response.status() == StatusCode::NOT_FOUND {
                return Err(SettlementError::not_found(format!("escrow {}", escrow_ref)));
            }
            if !response.status().is_success() {
                return Err(status_error(response, false).await);
            }

            let account: VaultAccountResponse = response
                .json()
                .await
                .map_err(|e| SettlementError::GatewayUnavailable(e.to_string()))?;
            let funded_amount = self.balance_of(&account);
            let status = account.status.unwrap_or(if funded_amount > Decimal::ZERO {
                EscrowStatus::Funded
            } else {
                EscrowStatus::Pending
            });

            Ok(EscrowAccount {
                escrow_ref: EscrowRef(account.id),
                funded_amount,
                status,
            })
        }

        async fn release_escrow(&self, request: &ReleaseRequest) -> SettlementResult<()> {
            let url = format!("{}/v1/transactions", self.base_url);

            let response = self
                .client
                .post(&url)
                .header(API_KEY_HEADER, &self.api_key)
                .header(IDEMPOTENCY_HEADER, &request.idempotency_key)
                .json(&serde_json::json!({
                    "assetId": self.asset_id,
                    "amount": request.amount.to_string(),
                    "source": { "type": "VAULT_ACCOUNT", "id": request.source.as_str() },
                    "destination": {
                        "type": "ONE_TIME_ADDRESS",
                        "oneTimeAddress": { "address": request.destination },
                    },
                    "externalTxId": request.idempotency_key,
                }))
                .send()
                .await
                .map_err(|e| transport_error(e, true))?;

            // 409: the provider already holds a transfer under this key
            if response.status().is_success() || response.status() == StatusCode::CONFLICT {
                return Ok(());
            }
            Err(status_error(response, true).await)
        }

        async fn query_release(&self, idempotency_key: &str) -> SettlementResult<TransferOutcome> {
            let url = format!(
                "{}/v1/transactions/external_tx_id/{}",
                self.base_url, idempotency_key
            );

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

            let transfer: TransferStatusResponse = response
                .json()
                .await
                .map_err(|e| SettlementError::GatewayUnavailable(e.to_string()))?;

            Ok(match transfer.status.as_str() {
                "COMPLETED" => TransferOutcome::Completed,
                "FAILED" | "REJECTED" | "CANCELLED" | "BLOCKED" => TransferOutcome::Failed(
                    transfer.sub_status.unwrap_or(transfer.status),
                ),
                _ => TransferOutcome::InFlight,
            })
        }
    }
}
