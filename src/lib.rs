//! Tenant bot orchestrator
//!
//! Runs one trading session per paying tenant against their own Binance Futures
//! account and settles USDT subscription payments on the Tron ledger.

pub mod api;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod secrets;
pub mod task_runner;
