pub mod activity;
pub mod agent;
pub mod config;
pub mod cost;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod models;
pub mod pricing;
pub mod providers;
pub mod reports;
pub mod service;
pub mod storage;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

/// Stamped on every ledger row.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
