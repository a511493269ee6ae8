//! Snapshot types shared by every pipeline stage.

use crate::utils::decimal::weight_of;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a pipeline run: the run's start time in milliseconds,
/// bumped when needed so that ids strictly increase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical form of a strategy id used for lookups.
///
/// Ids are contract addresses, which arrive lowercase from the chain but
/// may be written checksummed (mixed case) in configuration or by the
/// prediction service.
pub fn strategy_key(strategy_id: &str) -> String {
    strategy_id.trim().to_ascii_lowercase()
}

/// Capital currently deployed in one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyPosition {
    /// Strategy identifier (contract address on chain)
    pub strategy_id: String,
    /// Assets currently allocated, in asset units
    pub current_amount: Decimal,
    /// Observed APY as a fraction (0.05 = 5%)
    pub current_apy: f64,
    /// Risk score on a 0-100 scale
    pub risk_score: f64,
}

/// Vault allocation state read at the start of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioSnapshot {
    pub run_id: RunId,
    /// Total assets under management, including idle capital
    pub total_assets: Decimal,
    /// Positions in the order the vault reports them
    pub positions: Vec<StrategyPosition>,
    pub timestamp: DateTime<Utc>,
}

impl PortfolioSnapshot {
    /// Current weight of a position relative to total assets.
    pub fn current_weight(&self, position: &StrategyPosition) -> f64 {
        weight_of(position.current_amount, self.total_assets)
    }

    pub fn position(&self, strategy_id: &str) -> Option<&StrategyPosition> {
        self.positions.iter().find(|p| p.strategy_id == strategy_id)
    }

    pub fn strategy_ids(&self) -> Vec<&str> {
        self.positions.iter().map(|p| p.strategy_id.as_str()).collect()
    }

    /// Assets not deployed in any strategy.
    pub fn idle_assets(&self) -> Decimal {
        let deployed: Decimal = self.positions.iter().map(|p| p.current_amount).sum();
        self.total_assets - deployed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot() -> PortfolioSnapshot {
        PortfolioSnapshot {
            run_id: RunId(1),
            total_assets: dec!(1_000_000),
            positions: vec![
                StrategyPosition {
                    strategy_id: "aave".into(),
                    current_amount: dec!(400_000),
                    current_apy: 0.052,
                    risk_score: 25.0,
                },
                StrategyPosition {
                    strategy_id: "lido".into(),
                    current_amount: dec!(300_000),
                    current_apy: 0.041,
                    risk_score: 30.0,
                },
            ],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_current_weight() {
        let snapshot = snapshot();
        let aave = snapshot.position("aave").unwrap();
        assert!((snapshot.current_weight(aave) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_strategy_key_ignores_checksum_case() {
        assert_eq!(
            strategy_key("0xAbC0000000000000000000000000000000000dEf"),
            strategy_key(" 0xabc0000000000000000000000000000000000def")
        );
    }

    #[test]
    fn test_idle_assets() {
        assert_eq!(snapshot().idle_assets(), dec!(300_000));
    }

    #[test]
    fn test_snapshot_serializes_decimals_as_strings() {
        let json = serde_json::to_value(snapshot()).unwrap();
        assert_eq!(json["total_assets"], "1000000");
        assert_eq!(json["run_id"], 1);
        assert_eq!(json["positions"][1]["strategy_id"], "lido");
    }
}
