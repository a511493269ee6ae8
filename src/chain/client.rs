//! Vault controller client over JSON-RPC.

use super::{ChainGateway, ReceiptStatus, SignedRebalance, TxParams, TxReceipt, VaultState};
use crate::config::ChainConfig;
use crate::error::GatewayError;
use crate::portfolio::StrategyPosition;
use crate::strategy::RebalancePlan;
use crate::utils::decimal::{bps_to_fraction, decimal_to_u256, u256_to_decimal};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::prelude::*;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument};

abigen!(
    VaultController,
    r#"[
        function totalAssets() external view returns (uint256)
        function getActiveStrategies() external view returns (address[])
        function getStrategyState(address strategy) external view returns (uint256, uint256, uint256)
        function rebalance(address[] strategies, uint256[] targetAmounts, bytes[] bridgeCallData) external
    ]"#
);

type SignerClient = SignerMiddleware<Arc<Provider<Http>>, LocalWallet>;

/// Signing gateway to the vault controller contract.
pub struct EthersGateway {
    client: Arc<SignerClient>,
    controller: VaultController<SignerClient>,
    chain_id: u64,
    asset_decimals: u32,
}

impl EthersGateway {
    pub fn new(config: &ChainConfig) -> Result<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .with_context(|| format!("Invalid RPC url {}", config.rpc_url))?;

        let wallet = LocalWallet::from_str(config.private_key.trim_start_matches("0x"))
            .context("Invalid keeper private key")?
            .with_chain_id(config.chain_id);

        let controller_address = Address::from_str(&config.controller_address)
            .with_context(|| format!("Invalid controller address {}", config.controller_address))?;

        let client = Arc::new(SignerMiddleware::new(Arc::new(provider), wallet));
        let controller = VaultController::new(controller_address, client.clone());

        info!(
            chain_id = config.chain_id,
            controller = ?controller_address,
            keeper = ?client.address(),
            "Chain gateway initialized"
        );

        Ok(Self {
            client,
            controller,
            chain_id: config.chain_id,
            asset_decimals: config.asset_decimals,
        })
    }

    fn rebalance_call(
        &self,
        plan: &RebalancePlan,
    ) -> Result<ContractCall<SignerClient, ()>, GatewayError> {
        let mut strategies = Vec::with_capacity(plan.legs.len());
        let mut amounts = Vec::with_capacity(plan.legs.len());
        let mut call_data = Vec::with_capacity(plan.legs.len());

        for leg in &plan.legs {
            let address = Address::from_str(&leg.strategy_id).map_err(|e| {
                GatewayError::Malformed(format!("strategy id {} is not an address: {e}", leg.strategy_id))
            })?;
            let amount = decimal_to_u256(leg.target_amount, self.asset_decimals)
                .map_err(|e| GatewayError::Malformed(e.to_string()))?;

            strategies.push(address);
            amounts.push(amount);
            call_data.push(Bytes::from(leg.call_data.clone()));
        }

        Ok(self.controller.rebalance(strategies, amounts, call_data))
    }

    fn to_amount(&self, raw: U256) -> Result<rust_decimal::Decimal, GatewayError> {
        u256_to_decimal(raw, self.asset_decimals).map_err(|e| GatewayError::Malformed(e.to_string()))
    }
}

fn to_u64(value: U256, field: &str) -> Result<u64, GatewayError> {
    if value > U256::from(u64::MAX) {
        return Err(GatewayError::Malformed(format!("{field} {value} out of range")));
    }
    Ok(value.as_u64())
}

/// Sort a contract error into transport, decoding or rejection.
fn classify_contract_error<M: Middleware>(err: ContractError<M>) -> GatewayError {
    let message = err.to_string();
    match err {
        ContractError::Revert(_) => GatewayError::Rejected(message),
        ContractError::DecodingError(_)
        | ContractError::AbiError(_)
        | ContractError::DetokenizationError(_) => GatewayError::Malformed(message),
        _ => classify_rpc_message(message),
    }
}

/// Node-side refusals come back as JSON-RPC errors; everything else is
/// treated as a transport failure.
fn classify_rpc_message(message: String) -> GatewayError {
    const KNOWN: [&str; 2] = ["already known", "known transaction"];
    const REJECTIONS: [&str; 4] = [
        "revert",
        "underpriced",
        "insufficient funds",
        "exceeds block gas limit",
    ];

    let lower = message.to_lowercase();
    if KNOWN.iter().any(|needle| lower.contains(needle)) {
        GatewayError::AlreadyKnown(message)
    } else if lower.contains("nonce too low") {
        GatewayError::NonceTooLow(message)
    } else if REJECTIONS.iter().any(|needle| lower.contains(needle)) {
        GatewayError::Rejected(message)
    } else {
        GatewayError::Transport(message)
    }
}

#[async_trait]
impl ChainGateway for EthersGateway {
    #[instrument(skip(self))]
    async fn read_vault_state(&self) -> Result<VaultState, GatewayError> {
        let total = self
            .controller
            .total_assets()
            .call()
            .await
            .map_err(classify_contract_error)?;

        let strategies = self
            .controller
            .get_active_strategies()
            .call()
            .await
            .map_err(classify_contract_error)?;

        let mut positions = Vec::with_capacity(strategies.len());
        for strategy in strategies {
            let (amount, apy_bps, risk_bps) = self
                .controller
                .get_strategy_state(strategy)
                .call()
                .await
                .map_err(classify_contract_error)?;

            positions.push(StrategyPosition {
                strategy_id: format!("{strategy:?}"),
                current_amount: self.to_amount(amount)?,
                current_apy: bps_to_fraction(to_u64(apy_bps, "apy")?),
                // risk is reported in basis points of 100%
                risk_score: to_u64(risk_bps, "risk")? as f64 / 100.0,
            });
        }

        let total_assets = self.to_amount(total)?;
        debug!(%total_assets, strategies = positions.len(), "Vault state read");

        Ok(VaultState {
            total_assets,
            positions,
        })
    }

    async fn pending_nonce(&self) -> Result<u64, GatewayError> {
        let nonce = self
            .client
            .get_transaction_count(self.client.address(), Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| classify_rpc_message(e.to_string()))?;
        to_u64(nonce, "nonce")
    }

    async fn gas_price(&self) -> Result<u128, GatewayError> {
        let price = self
            .client
            .get_gas_price()
            .await
            .map_err(|e| classify_rpc_message(e.to_string()))?;
        if price > U256::from(u128::MAX) {
            return Err(GatewayError::Malformed(format!("gas price {price} out of range")));
        }
        Ok(price.as_u128())
    }

    async fn estimate_rebalance_gas(&self, plan: &RebalancePlan) -> Result<u64, GatewayError> {
        let estimate = self
            .rebalance_call(plan)?
            .estimate_gas()
            .await
            .map_err(classify_contract_error)?;
        to_u64(estimate, "gas estimate")
    }

    #[instrument(skip(self, plan), fields(run_id = %plan.run_id))]
    async fn sign_rebalance(
        &self,
        plan: &RebalancePlan,
        params: TxParams,
    ) -> Result<SignedRebalance, GatewayError> {
        let mut tx = self.rebalance_call(plan)?.legacy().tx;
        tx.set_from(self.client.address());
        tx.set_nonce(params.nonce);
        tx.set_gas(params.gas_limit);
        tx.set_gas_price(params.gas_price);
        tx.set_chain_id(self.chain_id);

        let signature = self
            .client
            .signer()
            .sign_transaction(&tx)
            .await
            .map_err(|e| GatewayError::Malformed(format!("failed to sign rebalance: {e}")))?;

        let hash = format!("{:?}", tx.hash(&signature));
        debug!(%hash, nonce = params.nonce, "Rebalance transaction signed");

        Ok(SignedRebalance {
            hash,
            nonce: params.nonce,
            gas_price: params.gas_price,
            raw: tx.rlp_signed(&signature).to_vec(),
        })
    }

    #[instrument(skip(self, signed), fields(hash = %signed.hash))]
    async fn broadcast_rebalance(&self, signed: &SignedRebalance) -> Result<(), GatewayError> {
        self.client
            .send_raw_transaction(Bytes::from(signed.raw.clone()))
            .await
            .map_err(|e| classify_rpc_message(e.to_string()))?;

        info!(
            hash = %signed.hash,
            nonce = signed.nonce,
            gas_price = signed.gas_price,
            "Rebalance transaction sent"
        );
        Ok(())
    }

    async fn transaction_receipt(&self, hash: &str) -> Result<Option<TxReceipt>, GatewayError> {
        let tx_hash = TxHash::from_str(hash)
            .map_err(|e| GatewayError::Malformed(format!("bad transaction hash {hash}: {e}")))?;

        let receipt = self
            .client
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| classify_rpc_message(e.to_string()))?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        // A receipt without a block is still pending
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };

        let status = if receipt.status == Some(1.into()) {
            ReceiptStatus::Success
        } else {
            ReceiptStatus::Failure
        };

        Ok(Some(TxReceipt {
            hash: hash.to_string(),
            status,
            gas_used: receipt
                .gas_used
                .map(|g| to_u64(g, "gas used"))
                .transpose()?
                .unwrap_or_default(),
            block_number: block_number.as_u64(),
        }))
    }
}
