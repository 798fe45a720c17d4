//! Prometheus metrics
//!
//! Metrics go through the `metrics` facade. Without an installed recorder
//! (tests, or `metrics.enabled: false`) every call is a no-op.

use metrics::{counter, gauge, histogram, Counter, Gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP listener exposing `/metrics` on the given port.
pub fn init_metrics(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    tracing::info!(%addr, "Metrics server listening");
    Ok(())
}

/// Settlement engine metrics
///
/// * `settlement_orders_total{event}` - submitted, completed, failed, cancelled
/// * `settlement_confirmations_total{kind}` - first legs confirmed per rail
/// * `settlement_counter_leg_failures_total` - definitive counter-leg failures
/// * `settlement_ambiguous_outcomes_total` - money-moving calls without an answer
/// * `settlement_gateway_errors_total{gateway}` - failed gateway calls
/// * `settlement_gateway_call_duration_seconds{gateway,operation}`
/// * `settlement_active_monitors` - polling tasks currently registered
#[derive(Clone)]
pub struct SettlementMetrics {
    orders_submitted: Counter,
    orders_completed: Counter,
    orders_failed: Counter,
    orders_cancelled: Counter,
    counter_leg_failures: Counter,
    ambiguous_outcomes: Counter,
    active_monitors: Gauge,
}

impl SettlementMetrics {
    pub fn new() -> Self {
        Self {
            orders_submitted: counter!("settlement_orders_total", "event" => "submitted"),
            orders_completed: counter!("settlement_orders_total", "event" => "completed"),
            orders_failed: counter!("settlement_orders_total", "event" => "failed"),
            orders_cancelled: counter!("settlement_orders_total", "event" => "cancelled"),
            counter_leg_failures: counter!("settlement_counter_leg_failures_total"),
            ambiguous_outcomes: counter!("settlement_ambiguous_outcomes_total"),
            active_monitors: gauge!("settlement_active_monitors"),
        }
    }

    pub fn order_submitted(&self) {
        self.orders_submitted.increment(1);
    }

    pub fn order_completed(&self) {
        self.orders_completed.increment(1);
    }

    pub fn order_failed(&self) {
        self.orders_failed.increment(1);
    }

    pub fn order_cancelled(&self) {
        self.orders_cancelled.increment(1);
    }

    /// First leg confirmed on the given rail ("escrow" or "bank")
    pub fn confirmation(&self, kind: &'static str) {
        counter!("settlement_confirmations_total", "kind" => kind).increment(1);
    }

    pub fn counter_leg_failure(&self) {
        self.counter_leg_failures.increment(1);
    }

    pub fn ambiguous_outcome(&self) {
        self.ambiguous_outcomes.increment(1);
    }

    pub fn gateway_error(&self, gateway: &'static str) {
        counter!("settlement_gateway_errors_total", "gateway" => gateway).increment(1);
    }

    pub fn monitor_started(&self) {
        self.active_monitors.increment(1.0);
    }

    pub fn monitor_stopped(&self) {
        self.active_monitors.decrement(1.0);
    }

    /// Start timing a gateway call; the duration is recorded on drop
    pub fn time_gateway_call(&self, gateway: &'static str, operation: &'static str) -> GatewayCallTimer {
        GatewayCallTimer {
            gateway,
            operation,
            start: Instant::now(),
        }
    }
}

impl Default for SettlementMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Records the duration of a gateway call when dropped
pub struct GatewayCallTimer {
    gateway: &'static str,
    operation: &'static str,
    start: Instant,
}

impl Drop for GatewayCallTimer {
    fn drop(&mut self) {
        histogram!(
            "settlement_gateway_call_duration_seconds",
            "gateway" => self.gateway,
            "operation" => self.operation
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
