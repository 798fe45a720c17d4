//! Probes: one status check against a settlement rail

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use crate::gateways::{BankGateway, EscrowGateway};
use crate::types::{EscrowRef, FundingPolicy, MonitorKind, PaymentRef};

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// Leg not settled yet
    NotYet,
    /// Leg settled
    Confirmed,
    /// The gateway could not answer
    GatewayError(String),
}

/// A status check a monitor repeats until the leg settles
#[async_trait]
pub trait Probe: Send + Sync {
    fn kind(&self) -> MonitorKind;

    async fn probe(&self) -> ProbeResult;
}

/// Waits for an escrow to hold the order amount
pub struct EscrowFundingProbe {
    gateway: Arc<dyn EscrowGateway>,
    escrow_ref: EscrowRef,
    expected: Decimal,
    policy: FundingPolicy,
    timeout: Duration,
}

impl EscrowFundingProbe {
    pub fn new(
        gateway: Arc<dyn EscrowGateway>,
        escrow_ref: EscrowRef,
        expected: Decimal,
        policy: FundingPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            escrow_ref,
            expected,
            policy,
            timeout,
        }
    }
}

#[async_trait]
impl Probe for EscrowFundingProbe {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Escrow
    }

    async fn probe(&self) -> ProbeResult {
        let call = self
            .gateway
            .query_escrow_funded(&self.escrow_ref, self.expected, self.policy);

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(true)) => ProbeResult::Confirmed,
            Ok(Ok(false)) => ProbeResult::NotYet,
            Ok(Err(e)) => ProbeResult::GatewayError(e.to_string()),
            Err(_) => ProbeResult::GatewayError(format!(
                "escrow query timed out after {:?}",
                self.timeout
            )),
        }
    }
}

/// Waits for the buyer's inbound bank transfer
pub struct BankCreditProbe {
    gateway: Arc<dyn BankGateway>,
    payment_ref: PaymentRef,
    timeout: Duration,
}

impl BankCreditProbe {
    pub fn new(gateway: Arc<dyn BankGateway>, payment_ref: PaymentRef, timeout: Duration) -> Self {
        Self {
            gateway,
            payment_ref,
            timeout,
        }
    }
}

#[async_trait]
impl Probe for BankCreditProbe {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Bank
    }

    async fn probe(&self) -> ProbeResult {
        match tokio::time::timeout(self.timeout, self.gateway.query_bank_received(&self.payment_ref)).await {
            Ok(Ok(true)) => ProbeResult::Confirmed,
            Ok(Ok(false)) => ProbeResult::NotYet,
            Ok(Err(e)) => ProbeResult::GatewayError(e.to_string()),
            Err(_) => ProbeResult::GatewayError(format!(
                "bank query timed out after {:?}",
                self.timeout
            )),
        }
    }
}
