//! Common types for the OTC settlement engine
//!
//! This crate provides the identifiers and small domain primitives shared
//! by the configuration, settlement and binary crates.
//!
//! # Modules
//!
//! - [`types`] - Identifiers (OrderId, UserId, TransactionId), OrderType, Currency

pub mod types;

pub use types::*;
