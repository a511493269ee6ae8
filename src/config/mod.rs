//! Configuration management for the yield keeper.
//!
//! Loads settings from an optional `keeper.toml`, environment variables and
//! the legacy variable names the deployment scripts still export.

use crate::portfolio::strategy_key;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Scheduling and decision settings
    #[serde(default)]
    pub keeper: KeeperConfig,
    /// Allocation solver bounds
    #[serde(default)]
    pub solver: SolverConfig,
    /// Transaction submission and confirmation
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Prediction service connection
    #[serde(default)]
    pub prediction: PredictionConfig,
    /// Chain connection and signing
    #[serde(default)]
    pub chain: ChainConfig,
    /// Transaction history store
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeeperConfig {
    /// Seconds between pipeline runs
    #[serde(default = "default_rebalance_interval")]
    pub rebalance_interval_secs: u64,
    /// Maximum per-strategy weight drift tolerated before rebalancing (0.0-1.0)
    #[serde(default = "default_deviation_threshold")]
    pub deviation_threshold: f64,
    /// Run against the in-memory vault instead of the chain
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Softens the volatility penalty in the score (1.0 = plain return/risk ratio)
    #[serde(default = "default_risk_tolerance")]
    pub risk_tolerance: f64,
    /// Floor weight for every strategy (0.0-1.0)
    #[serde(default = "default_min_allocation")]
    pub min_allocation: f64,
    /// Ceiling weight for every strategy (0.0-1.0)
    #[serde(default = "default_max_allocation")]
    pub max_allocation: f64,
    /// Per-strategy weight caps keyed by strategy id (case-insensitive)
    #[serde(default)]
    pub strategy_max_allocation: HashMap<String, f64>,
    /// Decimal places target amounts are rounded to (asset precision)
    #[serde(default = "default_amount_decimals")]
    pub amount_decimals: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Seconds to wait for a receipt before giving up on a run
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,
    /// Milliseconds between receipt polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Attempts for transient submission failures (including the first)
    #[serde(default = "default_max_submit_attempts")]
    pub max_submit_attempts: u32,
    /// Base backoff between attempts, multiplied by the attempt number
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// Multiplier applied to the node's suggested gas price
    #[serde(default = "default_gas_price_multiplier")]
    pub gas_price_multiplier: f64,
    /// Fractional buffer added on top of the gas estimate
    #[serde(default = "default_gas_limit_buffer")]
    pub gas_limit_buffer: f64,
    /// Gas limit used when the node cannot estimate
    #[serde(default = "default_gas_limit")]
    pub default_gas_limit: u64,
    /// Auxiliary bridge call data per strategy id, hex encoded
    #[serde(default)]
    pub bridge_call_data: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    /// Base URL of the prediction service
    #[serde(default = "default_prediction_endpoint")]
    pub endpoint: String,
    /// Forecast horizon requested from the service
    #[serde(default = "default_horizon_days")]
    pub horizon_days: u32,
    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Predictions below this confidence fall back to observed values
    #[serde(default)]
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC endpoint
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Chain id used for signing (Base mainnet by default)
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    /// Vault controller proxy address
    #[serde(default)]
    pub controller_address: String,
    /// Decimals of the vault's underlying asset
    #[serde(default = "default_asset_decimals")]
    pub asset_decimals: u32,
    /// Keeper signing key, injected from the secret store
    #[serde(default, skip_serializing)]
    pub private_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite file holding the transaction history
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// Default value functions
fn default_rebalance_interval() -> u64 {
    3600
}

fn default_deviation_threshold() -> f64 {
    0.05
}

fn default_risk_tolerance() -> f64 {
    1.0
}

fn default_min_allocation() -> f64 {
    0.05
}

fn default_max_allocation() -> f64 {
    0.50
}

fn default_amount_decimals() -> u32 {
    6 // USDC
}

fn default_confirmation_timeout() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_max_submit_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    500
}

fn default_gas_price_multiplier() -> f64 {
    1.1
}

fn default_gas_limit_buffer() -> f64 {
    0.20
}

fn default_gas_limit() -> u64 {
    300_000
}

fn default_prediction_endpoint() -> String {
    "http://localhost:5000".to_string()
}

fn default_horizon_days() -> u32 {
    7
}

fn default_request_timeout() -> u64 {
    30
}

fn default_rpc_url() -> String {
    "https://mainnet.base.org".to_string()
}

fn default_chain_id() -> u64 {
    8453
}

fn default_asset_decimals() -> u32 {
    6
}

fn default_db_path() -> String {
    "data/keeper.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("keeper").required(false))
            .add_source(config::Environment::default().separator("__").prefix("KEEPER"))
            .set_override_option("chain.rpc_url", std::env::var("BASE_RPC_URL").ok())?
            .set_override_option("chain.private_key", std::env::var("KEEPER_PRIVATE_KEY").ok())?
            .set_override_option("prediction.endpoint", std::env::var("ML_API_URL").ok())?
            .set_override_option(
                "keeper.rebalance_interval_secs",
                std::env::var("REBALANCE_INTERVAL_SECONDS").ok(),
            )?
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.keeper.rebalance_interval_secs > 0,
            "rebalance_interval_secs must be positive"
        );

        anyhow::ensure!(
            self.keeper.deviation_threshold > 0.0 && self.keeper.deviation_threshold < 1.0,
            "deviation_threshold must be between 0 and 1"
        );

        anyhow::ensure!(
            (0.0..=1.0).contains(&self.solver.min_allocation)
                && (0.0..=1.0).contains(&self.solver.max_allocation)
                && self.solver.min_allocation <= self.solver.max_allocation,
            "allocation bounds must satisfy 0 <= min_allocation <= max_allocation <= 1"
        );

        anyhow::ensure!(
            self.solver.risk_tolerance > 0.0,
            "risk_tolerance must be positive"
        );

        for (strategy, cap) in &self.solver.strategy_max_allocation {
            anyhow::ensure!(
                *cap > 0.0 && *cap <= 1.0,
                "max allocation for {} must be in (0, 1]",
                strategy
            );
        }
        ensure_unique_keys("strategy_max_allocation", self.solver.strategy_max_allocation.keys())?;
        ensure_unique_keys("bridge_call_data", self.execution.bridge_call_data.keys())?;

        anyhow::ensure!(
            self.execution.max_submit_attempts >= 1,
            "max_submit_attempts must be at least 1"
        );

        anyhow::ensure!(
            self.execution.gas_price_multiplier > 0.0,
            "gas_price_multiplier must be positive"
        );

        anyhow::ensure!(
            self.execution.gas_limit_buffer >= 0.0,
            "gas_limit_buffer must not be negative"
        );

        anyhow::ensure!(
            (0.0..=1.0).contains(&self.prediction.min_confidence),
            "min_confidence must be between 0 and 1"
        );

        self.execution
            .decoded_call_data()
            .context("bridge_call_data must be hex encoded")?;

        if !self.keeper.dry_run {
            anyhow::ensure!(
                !self.chain.controller_address.is_empty(),
                "chain.controller_address is required outside dry-run mode"
            );
            anyhow::ensure!(
                !self.chain.private_key.is_empty(),
                "KEEPER_PRIVATE_KEY is required outside dry-run mode"
            );
        }

        Ok(())
    }
}

impl KeeperConfig {
    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_interval_secs)
    }
}

impl SolverConfig {
    /// Weight cap for a strategy: the override if present, otherwise 1.0.
    pub fn strategy_cap(&self, strategy_id: &str) -> f64 {
        let key = strategy_key(strategy_id);
        self.strategy_max_allocation
            .iter()
            .find(|(strategy, _)| strategy_key(strategy) == key)
            .map(|(_, cap)| *cap)
            .unwrap_or(1.0)
    }
}

impl ExecutionConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Backoff before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms * attempt as u64)
    }

    /// Decode the per-strategy bridge call data, keyed by [`strategy_key`].
    pub fn decoded_call_data(&self) -> Result<HashMap<String, Vec<u8>>> {
        self.bridge_call_data
            .iter()
            .map(|(strategy, data)| {
                let bytes = hex::decode(data.trim_start_matches("0x"))
                    .with_context(|| format!("invalid call data for {}", strategy))?;
                Ok((strategy_key(strategy), bytes))
            })
            .collect()
    }
}

/// Reject maps with two keys naming the same strategy in different case.
fn ensure_unique_keys<'a>(field: &str, keys: impl Iterator<Item = &'a String>) -> Result<()> {
    let mut seen = HashSet::new();
    for key in keys {
        anyhow::ensure!(
            seen.insert(strategy_key(key)),
            "{} lists strategy {} more than once",
            field,
            key
        );
    }
    Ok(())
}

impl PredictionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keeper: KeeperConfig::default(),
            solver: SolverConfig::default(),
            execution: ExecutionConfig::default(),
            prediction: PredictionConfig::default(),
            chain: ChainConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            rebalance_interval_secs: default_rebalance_interval(),
            deviation_threshold: default_deviation_threshold(),
            dry_run: false,
        }
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            risk_tolerance: default_risk_tolerance(),
            min_allocation: default_min_allocation(),
            max_allocation: default_max_allocation(),
            strategy_max_allocation: HashMap::new(),
            amount_decimals: default_amount_decimals(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_secs: default_confirmation_timeout(),
            poll_interval_ms: default_poll_interval(),
            max_submit_attempts: default_max_submit_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            gas_price_multiplier: default_gas_price_multiplier(),
            gas_limit_buffer: default_gas_limit_buffer(),
            default_gas_limit: default_gas_limit(),
            bridge_call_data: HashMap::new(),
        }
    }
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_prediction_endpoint(),
            horizon_days: default_horizon_days(),
            request_timeout_secs: default_request_timeout(),
            min_confidence: 0.0,
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            chain_id: default_chain_id(),
            controller_address: String::new(),
            asset_decimals: default_asset_decimals(),
            private_key: String::new(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}
