//! # Yield Keeper
//!
//! Unattended keeper that periodically rebalances a multi-strategy yield
//! vault towards risk-adjusted target weights.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `chain`: Vault controller access (JSON-RPC client and simulated vault)
//! - `portfolio`: Snapshot of the vault's current allocation
//! - `prediction`: Yield prediction service client
//! - `strategy`: Allocation optimizer, decision gate and transaction executor
//! - `keeper`: Run pipeline and single-flight scheduler
//! - `persistence`: SQLite transaction history
//! - `utils`: Decimal and on-chain amount helpers

pub mod chain;
pub mod config;
pub mod error;
pub mod keeper;
pub mod persistence;
pub mod portfolio;
pub mod prediction;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use error::{GatewayError, KeeperError};
