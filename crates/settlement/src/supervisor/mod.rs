//! Monitor supervisor
//!
//! Owns one cancellable polling task per PENDING order. Each task repeats a
//! [`Probe`] until the leg settles, then reports back through a
//! [`ConfirmationHandler`] exactly once and retires itself.
//!
//! Tasks:
//! - wait one poll interval (or the backoff delay after an error)
//! - probe the gateway
//! - on `Confirmed`, call `on_confirmed` and exit
//! - after too many consecutive errors, or once the poll budget is spent,
//!   call `on_monitor_exhausted` and exit
//!
//! Cancellation (retire or shutdown) is observed at both suspension points,
//! so a retired monitor stops within one interval.

pub mod backoff;
pub mod probe;
pub mod registry;

pub use backoff::RetryPolicy;
pub use probe::{BankCreditProbe, EscrowFundingProbe, Probe, ProbeResult};
pub use registry::{MonitorInfo, MonitorRegistry};

use async_trait::async_trait;
use common::OrderId;
use observability::SettlementMetrics;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{SettlementError, SettlementResult};
use crate::types::MonitorKind;

/// Receives the outcome of a monitor
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    /// The watched leg settled. Must be idempotent: a crash between this call
    /// and the monitor's retirement replays it.
    async fn on_confirmed(&self, order_id: OrderId, kind: MonitorKind) -> SettlementResult<()>;

    /// The monitor gave up without a confirmation
    async fn on_monitor_exhausted(
        &self,
        order_id: OrderId,
        kind: MonitorKind,
        reason: String,
    ) -> SettlementResult<()>;
}

/// Polling configuration shared by every monitor
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&config::SettlementEngineConfig> for SupervisorConfig {
    fn from(config: &config::SettlementEngineConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
            retry: RetryPolicy::from(config),
        }
    }
}

enum MonitorExit {
    Confirmed,
    Exhausted(String),
    Cancelled,
}

struct MonitorTask {
    order_id: OrderId,
    kind: MonitorKind,
    generation: u64,
    probe: Arc<dyn Probe>,
    handler: Weak<dyn ConfirmationHandler>,
    registry: Arc<MonitorRegistry>,
    config: SupervisorConfig,
    metrics: SettlementMetrics,
    token: CancellationToken,
}

impl MonitorTask {
    async fn run(self) {
        let (order_id, kind) = (self.order_id, self.kind);

        match self.poll().await {
            MonitorExit::Confirmed => {
                info!(order_id = %order_id, kind = %kind, "Settlement leg confirmed");
                self.report(|handler| async move { handler.on_confirmed(order_id, kind).await })
                    .await;
            }
            MonitorExit::Exhausted(reason) => {
                warn!(order_id = %order_id, kind = %kind, %reason, "Monitor exhausted");
                self.report(|handler| async move {
                    handler.on_monitor_exhausted(order_id, kind, reason).await
                })
                .await;
            }
            MonitorExit::Cancelled => {
                debug!(order_id = %order_id, kind = %kind, "Monitor cancelled");
            }
        }

        if self.registry.remove_if_generation(order_id, self.generation) {
            self.metrics.monitor_stopped();
        }
    }

    async fn poll(&self) -> MonitorExit {
        let mut polls: u32 = 0;
        let mut failures: u32 = 0;
        let mut delay = self.config.poll_interval;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return MonitorExit::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }

            polls += 1;
            let result = tokio::select! {
                _ = self.token.cancelled() => return MonitorExit::Cancelled,
                result = self.probe.probe() => result,
            };

            match result {
                ProbeResult::Confirmed => return MonitorExit::Confirmed,
                ProbeResult::NotYet => {
                    debug!(order_id = %self.order_id, kind = %self.kind, polls, "Not settled yet");
                    failures = 0;
                    delay = self.config.poll_interval;
                }
                ProbeResult::GatewayError(reason) => {
                    failures += 1;
                    self.metrics.gateway_error(self.kind.as_str());
                    warn!(
                        order_id = %self.order_id,
                        kind = %self.kind,
                        failures,
                        %reason,
                        "Probe failed"
                    );
                    if self.config.retry.is_exhausted(failures) {
                        return MonitorExit::Exhausted(format!(
                            "{} gateway failed {} consecutive times: {}",
                            self.kind, failures, reason
                        ));
                    }
                    delay = self.config.retry.delay_for(failures);
                }
            }

            if self.config.retry.polls_exhausted(polls) {
                return MonitorExit::Exhausted(format!(
                    "no {} confirmation after {} polls",
                    self.kind, polls
                ));
            }
        }
    }

    async fn report<F, Fut>(&self, call: F)
    where
        F: FnOnce(Arc<dyn ConfirmationHandler>) -> Fut,
        Fut: std::future::Future<Output = SettlementResult<()>>,
    {
        let Some(handler) = self.handler.upgrade() else {
            warn!(order_id = %self.order_id, "Confirmation handler dropped; outcome not delivered");
            return;
        };

        if let Err(e) = call(handler).await {
            if e.is_guard() {
                warn!(order_id = %self.order_id, error = %e, "Monitor outcome refused");
            } else {
                error!(order_id = %self.order_id, error = %e, "Failed to apply monitor outcome");
            }
        }
    }
}

/// Supervisor of the per-order polling tasks
pub struct MonitorSupervisor {
    registry: Arc<MonitorRegistry>,
    handler: Weak<dyn ConfirmationHandler>,
    config: SupervisorConfig,
    metrics: SettlementMetrics,
    shutdown: CancellationToken,
}

impl MonitorSupervisor {
    pub fn new(config: SupervisorConfig, handler: Weak<dyn ConfirmationHandler>) -> Self {
        Self {
            registry: Arc::new(MonitorRegistry::new()),
            handler,
            config,
            metrics: SettlementMetrics::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: SettlementMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start polling for an order.
    ///
    /// Fails with `DuplicateMonitor` if the order is already monitored.
    pub fn register(
        &self,
        order_id: OrderId,
        kind: MonitorKind,
        probe: Arc<dyn Probe>,
    ) -> SettlementResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(SettlementError::Internal(
                "monitor supervisor is shut down".to_string(),
            ));
        }
        if probe.kind() != kind {
            return Err(SettlementError::Internal(format!(
                "probe watches {} but monitor kind is {}",
                probe.kind(),
                kind
            )));
        }

        let token = self.shutdown.child_token();
        let task_token = token.clone();
        let registry = self.registry.clone();
        let handler = self.handler.clone();
        let config = self.config.clone();
        let metrics = self.metrics.clone();

        self.registry.insert_with(order_id, kind, token, move |generation| {
            let task = MonitorTask {
                order_id,
                kind,
                generation,
                probe,
                handler,
                registry,
                config,
                metrics,
                token: task_token,
            };
            tokio::spawn(task.run())
        })?;

        self.metrics.monitor_started();
        info!(
            order_id = %order_id,
            kind = %kind,
            interval = ?self.config.poll_interval,
            "Monitor registered"
        );
        Ok(())
    }

    /// Stop polling for an order. No-op if it is not monitored.
    pub fn retire(&self, order_id: OrderId) -> bool {
        match self.registry.remove(order_id) {
            Some(removed) => {
                self.metrics.monitor_stopped();
                debug!(order_id = %order_id, kind = %removed.info.kind, "Monitor retired");
                true
            }
            None => false,
        }
    }

    pub fn is_monitored(&self, order_id: OrderId) -> bool {
        self.registry.contains(order_id)
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    pub fn active_orders(&self) -> Vec<OrderId> {
        self.registry.order_ids()
    }

    pub fn monitor_info(&self, order_id: OrderId) -> Option<MonitorInfo> {
        self.registry.get(order_id)
    }

    /// Cancel every monitor and wait for the tasks to finish.
    ///
    /// A task already delivering its outcome finishes that call first.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let removed = self.registry.drain();
        let count = removed.len();
        for _ in 0..count {
            self.metrics.monitor_stopped();
        }

        let results = futures::future::join_all(removed.into_iter().map(|m| m.task)).await;
        for result in results {
            if let Err(e) = result {
                error!(error = %e, "Monitor task panicked");
            }
        }
        info!(stopped = count, "Monitor supervisor shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Probe answering from a script, then repeating the last answer
    struct ScriptedProbe {
        kind: MonitorKind,
        script: Mutex<Vec<ProbeResult>>,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn new(kind: MonitorKind, mut script: Vec<ProbeResult>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                kind,
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        fn kind(&self) -> MonitorKind {
            self.kind
        }

        async fn probe(&self) -> ProbeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop().unwrap_or(ProbeResult::NotYet)
            } else {
                script.last().cloned().unwrap_or(ProbeResult::NotYet)
            }
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        confirmed: Mutex<Vec<OrderId>>,
        exhausted: Mutex<Vec<(OrderId, String)>>,
    }

    #[async_trait]
    impl ConfirmationHandler for RecordingHandler {
        async fn on_confirmed(&self, order_id: OrderId, _kind: MonitorKind) -> SettlementResult<()> {
            self.confirmed.lock().push(order_id);
            Ok(())
        }

        async fn on_monitor_exhausted(
            &self,
            order_id: OrderId,
            _kind: MonitorKind,
            reason: String,
        ) -> SettlementResult<()> {
            self.exhausted.lock().push((order_id, reason));
            Ok(())
        }
    }

    fn supervisor(handler: &Arc<RecordingHandler>, retry: RetryPolicy) -> MonitorSupervisor {
        let weak: Weak<dyn ConfirmationHandler> = Arc::downgrade(handler) as Weak<dyn ConfirmationHandler>;
        MonitorSupervisor::new(
            SupervisorConfig {
                poll_interval: Duration::from_secs(30),
                retry,
            },
            weak,
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirms_on_third_poll_and_retires() {
        let handler = Arc::new(RecordingHandler::default());
        let supervisor = supervisor(&handler, RetryPolicy::default());
        let order_id = OrderId::new();
        let probe = ScriptedProbe::new(
            MonitorKind::Escrow,
            vec![ProbeResult::NotYet, ProbeResult::NotYet, ProbeResult::Confirmed],
        );

        supervisor
            .register(order_id, MonitorKind::Escrow, probe.clone())
            .unwrap();
        assert!(supervisor.is_monitored(order_id));

        tokio::time::sleep(Duration::from_secs(95)).await;
        settle().await;

        assert_eq!(probe.calls(), 3);
        assert_eq!(handler.confirmed.lock().as_slice(), &[order_id]);
        assert!(!supervisor.is_monitored(order_id));
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_register_rejected() {
        let handler = Arc::new(RecordingHandler::default());
        let supervisor = supervisor(&handler, RetryPolicy::default());
        let order_id = OrderId::new();

        let probe = ScriptedProbe::new(MonitorKind::Bank, vec![ProbeResult::NotYet]);
        supervisor.register(order_id, MonitorKind::Bank, probe.clone()).unwrap();
        let err = supervisor
            .register(order_id, MonitorKind::Bank, probe)
            .unwrap_err();
        assert_eq!(err, SettlementError::DuplicateMonitor(order_id));
        assert_eq!(supervisor.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kind_mismatch_rejected() {
        let handler = Arc::new(RecordingHandler::default());
        let supervisor = supervisor(&handler, RetryPolicy::default());
        let probe = ScriptedProbe::new(MonitorKind::Bank, vec![ProbeResult::NotYet]);

        let err = supervisor
            .register(OrderId::new(), MonitorKind::Escrow, probe)
            .unwrap_err();
        assert!(matches!(err, SettlementError::Internal(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retire_stops_polling() {
        let handler = Arc::new(RecordingHandler::default());
        let supervisor = supervisor(&handler, RetryPolicy::default());
        let order_id = OrderId::new();
        let probe = ScriptedProbe::new(MonitorKind::Bank, vec![ProbeResult::NotYet]);

        supervisor.register(order_id, MonitorKind::Bank, probe.clone()).unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(probe.calls(), 1);

        assert!(supervisor.retire(order_id));
        assert!(!supervisor.retire(order_id));

        tokio::time::sleep(Duration::from_secs(300)).await;
        settle().await;
        assert_eq!(probe.calls(), 1);
        assert!(handler.confirmed.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_errors_exhaust_monitor() {
        let handler = Arc::new(RecordingHandler::default());
        let retry = RetryPolicy {
            max_consecutive_failures: 3,
            ..RetryPolicy::default()
        };
        let supervisor = supervisor(&handler, retry);
        let order_id = OrderId::new();
        let probe = ScriptedProbe::new(
            MonitorKind::Bank,
            vec![ProbeResult::GatewayError("bank offline".to_string())],
        );

        supervisor.register(order_id, MonitorKind::Bank, probe.clone()).unwrap();
        // 30s interval, then 1s and 2s backoff
        tokio::time::sleep(Duration::from_secs(40)).await;
        settle().await;

        assert_eq!(probe.calls(), 3);
        let exhausted = handler.exhausted.lock();
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].0, order_id);
        assert!(exhausted[0].1.contains("3 consecutive"));
        assert!(!supervisor.is_monitored(order_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_probe_resets_error_count() {
        let handler = Arc::new(RecordingHandler::default());
        let retry = RetryPolicy {
            max_consecutive_failures: 2,
            ..RetryPolicy::default()
        };
        let supervisor = supervisor(&handler, retry);
        let order_id = OrderId::new();
        let probe = ScriptedProbe::new(
            MonitorKind::Escrow,
            vec![
                ProbeResult::GatewayError("timeout".to_string()),
                ProbeResult::NotYet,
                ProbeResult::GatewayError("timeout".to_string()),
                ProbeResult::Confirmed,
            ],
        );

        supervisor.register(order_id, MonitorKind::Escrow, probe).unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;

        assert!(handler.exhausted.lock().is_empty());
        assert_eq!(handler.confirmed.lock().as_slice(), &[order_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_budget_exhausts_monitor() {
        let handler = Arc::new(RecordingHandler::default());
        let retry = RetryPolicy {
            max_polls: Some(4),
            ..RetryPolicy::default()
        };
        let supervisor = supervisor(&handler, retry);
        let order_id = OrderId::new();
        let probe = ScriptedProbe::new(MonitorKind::Bank, vec![ProbeResult::NotYet]);

        supervisor.register(order_id, MonitorKind::Bank, probe.clone()).unwrap();
        tokio::time::sleep(Duration::from_secs(30 * 10)).await;
        settle().await;

        assert_eq!(probe.calls(), 4);
        let exhausted = handler.exhausted.lock();
        assert_eq!(exhausted.len(), 1);
        assert!(exhausted[0].1.contains("after 4 polls"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let handler = Arc::new(RecordingHandler::default());
        let supervisor = supervisor(&handler, RetryPolicy::default());
        let probe = ScriptedProbe::new(MonitorKind::Bank, vec![ProbeResult::NotYet]);

        for _ in 0..5 {
            supervisor
                .register(OrderId::new(), MonitorKind::Bank, probe.clone())
                .unwrap();
        }
        assert_eq!(supervisor.active_count(), 5);

        supervisor.shutdown().await;
        assert_eq!(supervisor.active_count(), 0);

        let err = supervisor
            .register(OrderId::new(), MonitorKind::Bank, probe)
            .unwrap_err();
        assert!(matches!(err, SettlementError::Internal(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handler_does_not_panic() {
        let handler = Arc::new(RecordingHandler::default());
        let supervisor = supervisor(&handler, RetryPolicy::default());
        drop(handler);

        let order_id = OrderId::new();
        let probe = ScriptedProbe::new(MonitorKind::Escrow, vec![ProbeResult::Confirmed]);
        supervisor.register(order_id, MonitorKind::Escrow, probe).unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        settle().await;
        assert!(!supervisor.is_monitored(order_id));
    }
}
