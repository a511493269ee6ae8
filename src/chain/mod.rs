//! Vault controller access.
//!
//! Everything the keeper needs from the chain goes through the
//! [`ChainGateway`] trait: [`client::EthersGateway`] talks to a real node,
//! [`mock::MockVault`] keeps an in-memory vault for dry runs and tests.

pub mod client;
pub mod mock;

use crate::error::GatewayError;
use crate::portfolio::StrategyPosition;
use crate::strategy::RebalancePlan;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use client::EthersGateway;
pub use mock::MockVault;

/// Raw vault state as reported by the controller contract.
#[derive(Debug, Clone, PartialEq)]
pub struct VaultState {
    pub total_assets: Decimal,
    pub positions: Vec<StrategyPosition>,
}

/// Explicit transaction parameters for a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxParams {
    pub nonce: u64,
    /// Gas price in wei
    pub gas_price: u128,
    pub gas_limit: u64,
}

/// A locally signed rebalance transaction, not yet broadcast.
///
/// Re-sending `raw` is idempotent: the node either accepts it or already
/// knows it under `hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRebalance {
    pub hash: String,
    pub nonce: u64,
    pub gas_price: u128,
    /// RLP-encoded signed transaction
    pub raw: Vec<u8>,
}

/// A broadcast transaction awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionHandle {
    pub hash: String,
    pub nonce: u64,
    pub gas_price: u128,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Success,
    Failure,
}

/// Mined transaction outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub hash: String,
    pub status: ReceiptStatus,
    pub gas_used: u64,
    pub block_number: u64,
}

/// Result of waiting on a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Mined(TxReceipt),
    TimedOut,
}

/// Read and write access to the vault controller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Total assets plus per-strategy amount, APY and risk.
    async fn read_vault_state(&self) -> Result<VaultState, GatewayError>;

    /// Next nonce for the keeper account, counting pending transactions.
    async fn pending_nonce(&self) -> Result<u64, GatewayError>;

    /// Current network gas price in wei.
    async fn gas_price(&self) -> Result<u128, GatewayError>;

    async fn estimate_rebalance_gas(&self, plan: &RebalancePlan) -> Result<u64, GatewayError>;

    /// Sign a rebalance call with the given parameters without sending it.
    async fn sign_rebalance(
        &self,
        plan: &RebalancePlan,
        params: TxParams,
    ) -> Result<SignedRebalance, GatewayError>;

    /// Send a signed transaction to the node.
    async fn broadcast_rebalance(&self, signed: &SignedRebalance) -> Result<(), GatewayError>;

    /// Receipt of a transaction, `None` while it is not yet mined.
    async fn transaction_receipt(&self, hash: &str) -> Result<Option<TxReceipt>, GatewayError>;
}

/// Poll for a receipt until it appears or `timeout` elapses.
///
/// Transient poll failures are tolerated up to `max_poll_failures` in a row.
/// Never resubmits.
pub async fn await_confirmation(
    gateway: &dyn ChainGateway,
    hash: &str,
    timeout: Duration,
    poll_interval: Duration,
    max_poll_failures: u32,
) -> Result<Confirmation, GatewayError> {
    let deadline = Instant::now() + timeout;
    let max_poll_failures = max_poll_failures.max(1);
    let mut failures = 0u32;

    loop {
        match gateway.transaction_receipt(hash).await {
            Ok(Some(receipt)) => return Ok(Confirmation::Mined(receipt)),
            Ok(None) => {
                failures = 0;
                debug!(%hash, "Transaction not mined yet");
            }
            Err(e) if e.is_transient() && failures + 1 < max_poll_failures => {
                failures += 1;
                warn!(%hash, failures, error = %e, "Receipt poll failed, retrying");
            }
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(Confirmation::TimedOut);
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}
