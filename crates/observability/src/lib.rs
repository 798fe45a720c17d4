//! Observability infrastructure for the OTC settlement engine
//!
//! This crate provides:
//! - Structured logging via tracing
//! - Prometheus metrics
//! - Settlement-specific metric helpers
//!
//! # Quick Start
//!
//! ```ignore
//! use observability::{init_logging, LogFormat};
//!
//! init_logging("otcx", LogFormat::Pretty)?;
//! observability::metrics::init_metrics(9090)?;
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, init_test_logging, LogFormat};
pub use metrics::{init_metrics, GatewayCallTimer, SettlementMetrics};
