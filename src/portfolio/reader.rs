//! Portfolio State Reader.

use super::types::{strategy_key, PortfolioSnapshot, RunId};
use crate::chain::{ChainGateway, VaultState};
use crate::error::{GatewayError, KeeperError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Reads vault state through the chain gateway and stamps it with a run id.
pub struct PortfolioReader {
    gateway: Arc<dyn ChainGateway>,
    last_run: AtomicU64,
}

impl PortfolioReader {
    pub fn new(gateway: Arc<dyn ChainGateway>) -> Self {
        Self {
            gateway,
            last_run: AtomicU64::new(0),
        }
    }

    /// Read the current allocation state.
    ///
    /// Any RPC failure or inconsistent response aborts the run; no partial
    /// snapshot is ever returned.
    pub async fn read_snapshot(&self) -> Result<PortfolioSnapshot, KeeperError> {
        let state = self
            .gateway
            .read_vault_state()
            .await
            .map_err(KeeperError::ChainRead)?;

        validate_state(&state).map_err(KeeperError::ChainRead)?;

        let timestamp = Utc::now();
        let run_id = self.next_run_id(timestamp);

        info!(
            %run_id,
            total_assets = %state.total_assets,
            strategies = state.positions.len(),
            "Portfolio state fetched"
        );

        Ok(PortfolioSnapshot {
            run_id,
            total_assets: state.total_assets,
            positions: state.positions,
            timestamp,
        })
    }

    /// Next run id: the timestamp in milliseconds, or one past the previous
    /// id when the clock has not moved forward.
    fn next_run_id(&self, now: DateTime<Utc>) -> RunId {
        let now_ms = now.timestamp_millis().max(0) as u64;
        let previous = self
            .last_run
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now_ms.max(last + 1))
            })
            .unwrap_or_default();
        RunId(now_ms.max(previous + 1))
    }
}

fn validate_state(state: &VaultState) -> Result<(), GatewayError> {
    if state.total_assets < Decimal::ZERO {
        return Err(GatewayError::Malformed(format!(
            "negative total assets {}",
            state.total_assets
        )));
    }

    let mut seen = HashSet::new();
    let mut deployed = Decimal::ZERO;
    for position in &state.positions {
        if !seen.insert(strategy_key(&position.strategy_id)) {
            return Err(GatewayError::Malformed(format!(
                "duplicate strategy {}",
                position.strategy_id
            )));
        }
        if position.current_amount < Decimal::ZERO {
            return Err(GatewayError::Malformed(format!(
                "negative amount for {}",
                position.strategy_id
            )));
        }
        if !position.current_apy.is_finite()
            || !position.risk_score.is_finite()
            || position.risk_score < 0.0
        {
            return Err(GatewayError::Malformed(format!(
                "invalid yield or risk for {}",
                position.strategy_id
            )));
        }
        deployed += position.current_amount;
    }

    if deployed > state.total_assets {
        return Err(GatewayError::Malformed(format!(
            "deployed assets {} exceed total {}",
            deployed, state.total_assets
        )));
    }

    debug!(deployed = %deployed, "Vault state validated");
    Ok(())
}
