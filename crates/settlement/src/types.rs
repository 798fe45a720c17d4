//! Settlement domain types
//!
//! Orders, their settlement transactions, and the value objects exchanged
//! with the escrow and bank gateways.

use crate::error::{SettlementError, SettlementResult};
use chrono::{DateTime, Utc};
use common::{Currency, OrderId, OrderType, TransactionId, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Order status in the settlement state machine
///
/// ```text
/// Pending ──► Matched ──► Completed
///    │           │
///    ├──► Cancelled
///    └───────────┴──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Waiting for the first settlement leg to be funded or paid
    #[default]
    Pending,
    /// First leg confirmed, counter-leg not yet confirmed
    Matched,
    /// Both legs settled
    Completed,
    /// Cancelled by the owner before the first leg was confirmed
    Cancelled,
    /// Gave up; requires manual intervention
    Failed,
}

impl OrderStatus {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Matched)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Matched, Completed)
                | (Matched, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Matched => "matched",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "matched" => Ok(OrderStatus::Matched),
            "completed" => Ok(OrderStatus::Completed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "failed" => Ok(OrderStatus::Failed),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// Status of the settlement leg being watched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    #[default]
    Pending,
    Confirmed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "confirmed" => Ok(TransactionStatus::Confirmed),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(format!("unknown transaction status: {}", other)),
        }
    }
}

/// Which rail a monitor watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorKind {
    /// Waiting for the seller to fund the escrow
    Escrow,
    /// Waiting for the buyer's fiat transfer
    Bank,
}

impl MonitorKind {
    /// SELL waits on escrow funding, BUY waits on an inbound bank credit.
    pub fn for_order_type(order_type: OrderType) -> Self {
        match order_type {
            OrderType::Sell => MonitorKind::Escrow,
            OrderType::Buy => MonitorKind::Bank,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorKind::Escrow => "escrow",
            MonitorKind::Bank => "bank",
        }
    }
}

impl std::fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MonitorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "escrow" => Ok(MonitorKind::Escrow),
            "bank" => Ok(MonitorKind::Bank),
            other => Err(format!("unknown monitor kind: {}", other)),
        }
    }
}

/// Inbound order request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
    pub user_id: UserId,
    pub order_type: OrderType,
    /// Crypto quantity
    pub amount: Decimal,
    /// Fiat price per unit of crypto
    pub price: Decimal,
    pub currency: Currency,
}

impl NewOrder {
    pub fn new(
        user_id: UserId,
        order_type: OrderType,
        amount: Decimal,
        price: Decimal,
        currency: impl Into<Currency>,
    ) -> Self {
        Self {
            user_id,
            order_type,
            amount,
            price,
            currency: currency.into(),
        }
    }

    /// Basic shape checks; returns the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.amount <= Decimal::ZERO {
            return Err("Amount must be greater than 0".to_string());
        }
        if self.price <= Decimal::ZERO {
            return Err("Price must be greater than 0".to_string());
        }
        if self.amount.checked_mul(self.price).is_none() {
            return Err("Amount times price exceeds the representable fiat range".to_string());
        }
        if !self.currency.is_well_formed() {
            return Err(format!(
                "Currency must be a three letter code, got '{}'",
                self.currency
            ));
        }
        Ok(())
    }
}

/// Order in the settlement engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub order_type: OrderType,
    /// Crypto quantity
    pub amount: Decimal,
    /// Fiat price per unit of crypto
    pub price: Decimal,
    pub currency: Currency,
    pub status: OrderStatus,
    /// Last recorded settlement fault, if any
    pub fault_reason: Option<String>,
    /// Set while a MATCHED order still owes its counter-leg
    pub retry_pending: bool,
    /// Definitive counter-leg failures so far
    pub counter_leg_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a new PENDING order from an inbound request
    pub fn new(request: NewOrder) -> Self {
        let now = Utc::now();
        Self {
            order_id: OrderId::new(),
            user_id: request.user_id,
            order_type: request.order_type,
            amount: request.amount,
            price: request.price,
            currency: request.currency,
            status: OrderStatus::Pending,
            fault_reason: None,
            retry_pending: false,
            counter_leg_attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn monitor_kind(&self) -> MonitorKind {
        MonitorKind::for_order_type(self.order_type)
    }

    /// Quantity moved on the crypto rail, identical for both order types
    pub fn crypto_amount(&self) -> Decimal {
        self.amount
    }

    /// Quantity moved on the fiat rail, identical for both order types
    pub fn fiat_amount(&self) -> SettlementResult<Decimal> {
        self.amount.checked_mul(self.price).ok_or_else(|| {
            SettlementError::Validation(format!(
                "Fiat amount of order {} overflows ({} x {})",
                self.order_id, self.amount, self.price
            ))
        })
    }

    /// Amount expected on the first leg (what the monitor waits for)
    pub fn inbound_amount(&self) -> SettlementResult<Decimal> {
        match self.monitor_kind() {
            MonitorKind::Escrow => Ok(self.crypto_amount()),
            MonitorKind::Bank => self.fiat_amount(),
        }
    }

    /// Amount sent on the counter-leg once the first leg is confirmed
    pub fn outbound_amount(&self) -> SettlementResult<Decimal> {
        match self.monitor_kind() {
            MonitorKind::Escrow => self.fiat_amount(),
            MonitorKind::Bank => Ok(self.crypto_amount()),
        }
    }

    pub fn can_cancel(&self) -> bool {
        self.status == OrderStatus::Pending
    }
}

/// Settlement record for the first leg of an order (1:1 with the order)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: TransactionId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub kind: MonitorKind,
    /// Amount expected on this leg, in crypto units (escrow) or fiat (bank)
    pub amount: Decimal,
    pub status: TransactionStatus,
    /// Escrow account id or bank payment reference, once opened
    pub external_ref: Option<String>,
    /// Idempotency key of the counter-leg transfer, persisted before sending
    pub counter_leg_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn for_order(order: &Order) -> SettlementResult<Self> {
        let amount = order.inbound_amount()?;
        let now = Utc::now();
        Ok(Self {
            transaction_id: TransactionId::new(),
            order_id: order.order_id,
            user_id: order.user_id,
            kind: order.monitor_kind(),
            amount,
            status: TransactionStatus::Pending,
            external_ref: None,
            counter_leg_key: None,
            created_at: now,
            updated_at: now,
            confirmed_at: None,
        })
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == TransactionStatus::Confirmed
    }

    pub fn to_ref(&self) -> TransactionRef {
        TransactionRef {
            transaction_id: self.transaction_id,
            order_id: self.order_id,
            kind: self.kind,
            external_ref: self.external_ref.clone(),
        }
    }
}

/// Handle returned by `submit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRef {
    pub transaction_id: TransactionId,
    pub order_id: OrderId,
    pub kind: MonitorKind,
    pub external_ref: Option<String>,
}

/// Outcome of the atomic confirm-and-match step
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    /// This call moved Transaction to CONFIRMED and Order to MATCHED
    Confirmed { order: Order, transaction: Transaction },
    /// Already confirmed by an earlier call; nothing changed
    AlreadyConfirmed { order: Order, transaction: Transaction },
}

/// Reference to an escrow account at the custody provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EscrowRef(pub String);

impl EscrowRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EscrowRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a watched inbound bank transfer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentRef(pub String);

impl PaymentRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PaymentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Escrow account status as reported by the custody provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EscrowStatus {
    Pending,
    Funded,
    Completed,
    Cancelled,
}

/// Snapshot of an escrow account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowAccount {
    pub escrow_ref: EscrowRef,
    pub funded_amount: Decimal,
    pub status: EscrowStatus,
}

/// When an escrow counts as funded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FundingPolicy {
    /// Balance must cover the expected amount
    #[default]
    ExactAmount,
    /// Any positive balance
    AnyBalance,
}

impl From<config::FundingPolicyKind> for FundingPolicy {
    fn from(kind: config::FundingPolicyKind) -> Self {
        match kind {
            config::FundingPolicyKind::ExactAmount => FundingPolicy::ExactAmount,
            config::FundingPolicyKind::AnyBalance => FundingPolicy::AnyBalance,
        }
    }
}

impl EscrowAccount {
    pub fn is_funded_for(&self, expected: Decimal, policy: FundingPolicy) -> bool {
        if self.status == EscrowStatus::Cancelled {
            return false;
        }
        match policy {
            FundingPolicy::ExactAmount => self.funded_amount >= expected,
            FundingPolicy::AnyBalance => self.funded_amount > Decimal::ZERO,
        }
    }
}

/// Beneficiary bank details used for fiat payouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankDetails {
    pub account_holder: String,
    pub account_number: String,
    #[serde(default)]
    pub bank_code: Option<String>,
}

/// Fiat payout on the bank rail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub idempotency_key: String,
    pub user_id: UserId,
    pub amount: Decimal,
    pub currency: Currency,
    pub bank_details: BankDetails,
}

/// Custody release on the crypto rail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub idempotency_key: String,
    pub source: EscrowRef,
    pub destination: String,
    pub amount: Decimal,
}

/// Result of looking up a money-moving call by idempotency key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOutcome {
    /// The provider has no record of the key; safe to send
    NotFound,
    /// Accepted, not yet final
    InFlight,
    Completed,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_order(order_type: OrderType) -> Order {
        Order::new(NewOrder::new(
            UserId::new(),
            order_type,
            Decimal::new(100, 0),
            Decimal::new(15, 1),
            "usd",
        ))
    }

    #[test]
    fn test_state_machine_never_skips_matched() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Matched));
        assert!(Matched.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Matched.can_transition_to(Pending));
        assert!(!Matched.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Matched));
        assert!(!Completed.can_transition_to(Failed));
        assert!(Matched.can_transition_to(Failed));
    }

    #[test]
    fn test_settlement_amounts_are_symmetric() {
        let sell = new_order(OrderType::Sell);
        assert_eq!(sell.monitor_kind(), MonitorKind::Escrow);
        assert_eq!(sell.inbound_amount().unwrap(), Decimal::new(100, 0));
        assert_eq!(sell.outbound_amount().unwrap(), Decimal::new(150, 0));

        let buy = new_order(OrderType::Buy);
        assert_eq!(buy.monitor_kind(), MonitorKind::Bank);
        assert_eq!(buy.inbound_amount().unwrap(), Decimal::new(150, 0));
        assert_eq!(buy.outbound_amount().unwrap(), Decimal::new(100, 0));
    }

    #[test]
    fn test_new_order_validation() {
        let ok = NewOrder::new(UserId::new(), OrderType::Sell, Decimal::ONE, Decimal::ONE, "EUR");
        assert!(ok.validate().is_ok());

        let mut zero_amount = ok.clone();
        zero_amount.amount = Decimal::ZERO;
        assert!(zero_amount.validate().is_err());

        let mut negative_price = ok.clone();
        negative_price.price = Decimal::new(-1, 0);
        assert!(negative_price.validate().is_err());

        let mut bad_currency = ok;
        bad_currency.currency = Currency::new("dollars");
        assert!(bad_currency.validate().is_err());
    }

    #[test]
    fn test_fiat_overflow_is_rejected_not_panicking() {
        let huge = Decimal::new(1_000_000_000_000_000, 0);
        let request = NewOrder::new(UserId::new(), OrderType::Buy, huge, huge, "USD");
        assert!(request.validate().is_err());

        // Orders persisted before the range check still surface as errors
        let order = Order::new(request);
        assert!(matches!(order.fiat_amount(), Err(SettlementError::Validation(_))));
        assert!(order.inbound_amount().is_err());
        assert!(Transaction::for_order(&order).is_err());

        let sell = Order {
            order_type: OrderType::Sell,
            ..order
        };
        assert_eq!(sell.inbound_amount().unwrap(), huge);
        assert!(sell.outbound_amount().is_err());
    }

    #[test]
    fn test_funding_policy() {
        let account = EscrowAccount {
            escrow_ref: EscrowRef("vault-1".into()),
            funded_amount: Decimal::new(40, 0),
            status: EscrowStatus::Pending,
        };
        assert!(!account.is_funded_for(Decimal::new(100, 0), FundingPolicy::ExactAmount));
        assert!(account.is_funded_for(Decimal::new(100, 0), FundingPolicy::AnyBalance));

        let cancelled = EscrowAccount {
            status: EscrowStatus::Cancelled,
            funded_amount: Decimal::new(500, 0),
            ..account
        };
        assert!(!cancelled.is_funded_for(Decimal::new(100, 0), FundingPolicy::AnyBalance));
    }

    #[test]
    fn test_status_round_trip_through_strings() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Matched,
            OrderStatus::Completed,
            OrderStatus::Cancelled,
            OrderStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>(), Ok(status));
        }
        assert!("open".parse::<OrderStatus>().is_err());
    }
}
