//! Periodic reconciliation sweep
//!
//! Picks up work that fell between the cracks: submissions deferred by a
//! gateway outage, PENDING transactions that lost their monitor, and
//! counter-legs waiting for a retry.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::orchestrator::SettlementOrchestrator;

/// Runs [`SettlementOrchestrator::reconcile`] on a fixed interval
pub struct ReconciliationSweeper {
    orchestrator: Arc<SettlementOrchestrator>,
    interval: Duration,
}

impl ReconciliationSweeper {
    pub fn new(orchestrator: Arc<SettlementOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    pub fn from_config(
        orchestrator: Arc<SettlementOrchestrator>,
        config: &config::SettlementEngineConfig,
    ) -> Self {
        Self::new(
            orchestrator,
            Duration::from_secs(config.reconcile_interval_seconds),
        )
    }

    /// Sweep until `shutdown` is cancelled. The first sweep runs one
    /// interval after start; startup recovery covers time zero.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "Starting reconciliation sweeper");

        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = self.orchestrator.reconcile().await {
                        error!(error = %e, "Reconciliation sweep failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Reconciliation sweeper shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateways::{InMemoryAccountDirectory, MockBankGateway, MockEscrowGateway};
    use crate::orchestrator::OrchestratorConfig;
    use crate::store::memory::InMemoryOrderStore;
    use crate::types::{NewOrder, OrderStatus};
    use common::{OrderType, UserId};
    use rust_decimal::Decimal;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_resubmits_after_outage_and_stops() {
        let escrow = Arc::new(MockEscrowGateway::new());
        let orchestrator = SettlementOrchestrator::new(
            Arc::new(InMemoryOrderStore::new()),
            escrow.clone(),
            Arc::new(MockBankGateway::new()),
            Arc::new(InMemoryAccountDirectory::new()),
            OrchestratorConfig::default(),
        );

        escrow.set_unavailable(true);
        let order = orchestrator
            .create_order(NewOrder::new(
                UserId::new(),
                OrderType::Sell,
                Decimal::ONE,
                Decimal::new(50_000, 0),
                "EUR",
            ))
            .await
            .unwrap();
        assert!(!orchestrator.supervisor().is_monitored(order.order_id));
        escrow.set_unavailable(false);

        let shutdown = CancellationToken::new();
        let sweeper = ReconciliationSweeper::new(orchestrator.clone(), Duration::from_secs(60));
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { sweeper.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(orchestrator.supervisor().is_monitored(order.order_id));
        assert_eq!(
            orchestrator.get_order(order.order_id).await.unwrap().status,
            OrderStatus::Pending
        );

        shutdown.cancel();
        handle.await.unwrap();
        orchestrator.shutdown().await;
    }
}
