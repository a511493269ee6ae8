//! In-memory vault controller for dry runs and tests.

use super::{ChainGateway, ReceiptStatus, SignedRebalance, TxParams, TxReceipt, VaultState};
use crate::error::GatewayError;
use crate::portfolio::StrategyPosition;
use crate::strategy::RebalancePlan;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

const REBALANCE_GAS_USED: u64 = 180_000;
const REBALANCE_GAS_ESTIMATE: u64 = 210_000;
const DEFAULT_GAS_PRICE: u128 = 100_000_000; // 0.1 gwei, typical Base price

#[derive(Debug, Default)]
struct VaultInner {
    idle: Decimal,
    positions: Vec<StrategyPosition>,
    next_nonce: u64,
    block_number: u64,
    gas_price: u128,
    signed: HashMap<String, (u64, RebalancePlan)>,
    signatures: u64,
    pending: HashMap<String, RebalancePlan>,
    receipts: HashMap<String, TxReceipt>,
    failing_reads: u32,
    failing_submits: u32,
    lost_responses: u32,
    revert_next: bool,
    withhold_receipts: bool,
    submissions: u32,
}

/// Simulated vault controller.
///
/// Submissions are mined on the first receipt poll: the plan's target
/// amounts replace the strategy balances and the remainder stays idle.
pub struct MockVault {
    inner: RwLock<VaultInner>,
}

impl MockVault {
    pub fn new(idle: Decimal, positions: Vec<StrategyPosition>) -> Self {
        Self {
            inner: RwLock::new(VaultInner {
                idle,
                positions,
                block_number: 1,
                gas_price: DEFAULT_GAS_PRICE,
                ..Default::default()
            }),
        }
    }

    /// Three-strategy vault holding 1,000,000 units of the base asset.
    pub fn demo() -> Self {
        let position = |id: &str, amount: Decimal, apy: f64, risk: f64| StrategyPosition {
            strategy_id: id.to_string(),
            current_amount: amount,
            current_apy: apy,
            risk_score: risk,
        };

        Self::new(
            Decimal::ZERO,
            vec![
                position("aave", dec!(400_000), 0.052, 25.0),
                position("lido", dec!(300_000), 0.041, 30.0),
                position("delta", dec!(300_000), 0.085, 45.0),
            ],
        )
    }

    /// Fail the next `count` state reads with a transport error.
    pub async fn fail_next_reads(&self, count: u32) {
        self.inner.write().await.failing_reads = count;
    }

    /// Fail the next `count` broadcasts with a transport error before the
    /// transaction reaches the vault.
    pub async fn fail_next_submits(&self, count: u32) {
        self.inner.write().await.failing_submits = count;
    }

    /// Accept the next `count` broadcasts but answer with a transport error,
    /// as when the connection drops after the node took the transaction.
    pub async fn lose_next_responses(&self, count: u32) {
        self.inner.write().await.lost_responses = count;
    }

    /// Mine the next submitted transaction as reverted.
    pub async fn revert_next(&self) {
        self.inner.write().await.revert_next = true;
    }

    /// Keep submitted transactions unmined until released.
    pub async fn withhold_receipts(&self, withhold: bool) {
        self.inner.write().await.withhold_receipts = withhold;
    }

    pub async fn set_gas_price(&self, gas_price: u128) {
        self.inner.write().await.gas_price = gas_price;
    }

    /// Number of transactions broadcast so far.
    pub async fn submissions(&self) -> u32 {
        self.inner.read().await.submissions
    }

    pub async fn position_amount(&self, strategy_id: &str) -> Option<Decimal> {
        self.inner
            .read()
            .await
            .positions
            .iter()
            .find(|p| p.strategy_id == strategy_id)
            .map(|p| p.current_amount)
    }

    fn apply_plan(inner: &mut VaultInner, plan: &RebalancePlan) {
        let total: Decimal = inner.idle + inner.positions.iter().map(|p| p.current_amount).sum::<Decimal>();
        for leg in &plan.legs {
            if let Some(position) = inner
                .positions
                .iter_mut()
                .find(|p| p.strategy_id == leg.strategy_id)
            {
                position.current_amount = leg.target_amount;
            }
        }
        let deployed: Decimal = inner.positions.iter().map(|p| p.current_amount).sum();
        inner.idle = total - deployed;
    }
}

#[async_trait]
impl ChainGateway for MockVault {
    async fn read_vault_state(&self) -> Result<VaultState, GatewayError> {
        let mut inner = self.inner.write().await;
        if inner.failing_reads > 0 {
            inner.failing_reads -= 1;
            return Err(GatewayError::Transport("simulated read failure".into()));
        }

        let deployed: Decimal = inner.positions.iter().map(|p| p.current_amount).sum();
        Ok(VaultState {
            total_assets: inner.idle + deployed,
            positions: inner.positions.clone(),
        })
    }

    async fn pending_nonce(&self) -> Result<u64, GatewayError> {
        Ok(self.inner.read().await.next_nonce)
    }

    async fn gas_price(&self) -> Result<u128, GatewayError> {
        Ok(self.inner.read().await.gas_price)
    }

    async fn estimate_rebalance_gas(&self, _plan: &RebalancePlan) -> Result<u64, GatewayError> {
        Ok(REBALANCE_GAS_ESTIMATE)
    }

    async fn sign_rebalance(
        &self,
        plan: &RebalancePlan,
        params: TxParams,
    ) -> Result<SignedRebalance, GatewayError> {
        let mut inner = self.inner.write().await;
        inner.signatures += 1;
        let hash = format!("0x{:064x}", (inner.signatures << 32) | params.nonce);
        let raw = serde_json::to_vec(plan).map_err(|e| GatewayError::Malformed(e.to_string()))?;
        inner.signed.insert(hash.clone(), (params.nonce, plan.clone()));

        Ok(SignedRebalance {
            hash,
            nonce: params.nonce,
            gas_price: params.gas_price,
            raw,
        })
    }

    async fn broadcast_rebalance(&self, signed: &SignedRebalance) -> Result<(), GatewayError> {
        let mut inner = self.inner.write().await;
        if inner.failing_submits > 0 {
            inner.failing_submits -= 1;
            return Err(GatewayError::Transport("simulated submit failure".into()));
        }
        if inner.pending.contains_key(&signed.hash) || inner.receipts.contains_key(&signed.hash) {
            return Err(GatewayError::AlreadyKnown(signed.hash.clone()));
        }
        let Some((nonce, plan)) = inner.signed.get(&signed.hash).cloned() else {
            return Err(GatewayError::Malformed(format!("unknown transaction {}", signed.hash)));
        };
        if nonce < inner.next_nonce {
            return Err(GatewayError::NonceTooLow(format!(
                "got {}, next {}",
                nonce, inner.next_nonce
            )));
        }

        inner.signed.remove(&signed.hash);
        inner.next_nonce = nonce + 1;
        inner.submissions += 1;
        inner.pending.insert(signed.hash.clone(), plan.clone());
        info!(hash = %signed.hash, nonce, legs = plan.legs.len(), "Simulated rebalance broadcast");

        if inner.lost_responses > 0 {
            inner.lost_responses -= 1;
            return Err(GatewayError::Transport("simulated connection drop after send".into()));
        }
        Ok(())
    }

    async fn transaction_receipt(&self, hash: &str) -> Result<Option<TxReceipt>, GatewayError> {
        let mut inner = self.inner.write().await;
        if let Some(receipt) = inner.receipts.get(hash) {
            return Ok(Some(receipt.clone()));
        }
        if inner.withhold_receipts {
            return Ok(None);
        }
        let Some(plan) = inner.pending.remove(hash) else {
            return Ok(None);
        };

        let status = if std::mem::take(&mut inner.revert_next) {
            ReceiptStatus::Failure
        } else {
            Self::apply_plan(&mut inner, &plan);
            ReceiptStatus::Success
        };

        inner.block_number += 1;
        let receipt = TxReceipt {
            hash: hash.to_string(),
            status,
            gas_used: REBALANCE_GAS_USED,
            block_number: inner.block_number,
        };
        inner.receipts.insert(hash.to_string(), receipt.clone());
        debug!(%hash, ?status, block = receipt.block_number, "Simulated transaction mined");

        Ok(Some(receipt))
    }
}
