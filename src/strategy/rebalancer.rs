//! Rebalance decision gate.
//!
//! Compares current weights against an allocation and decides whether the
//! drift justifies a rebalance transaction.

use crate::error::KeeperError;
use crate::portfolio::{strategy_key, PortfolioSnapshot, RunId};
use crate::strategy::optimizer::AllocationTarget;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// Target allocation computed for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub run_id: RunId,
    pub targets: Vec<AllocationTarget>,
}

impl Allocation {
    pub fn target_weight(&self, strategy_id: &str) -> Option<f64> {
        self.targets
            .iter()
            .find(|t| t.strategy_id == strategy_id)
            .map(|t| t.weight)
    }
}

/// One strategy's new target amount in a rebalance call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanLeg {
    pub strategy_id: String,
    pub target_amount: Decimal,
    #[serde(serialize_with = "hex_bytes")]
    pub call_data: Vec<u8>,
}

/// Ordered target amounts to send in a single rebalance transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebalancePlan {
    pub run_id: RunId,
    pub legs: Vec<PlanLeg>,
}

fn hex_bytes<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
}

/// Drift of a single strategy from its target weight.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyDrift {
    pub strategy_id: String,
    pub current_weight: f64,
    pub target_weight: f64,
}

impl StrategyDrift {
    pub fn deviation(&self) -> f64 {
        (self.current_weight - self.target_weight).abs()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RebalanceDecision {
    /// Drift within threshold; nothing to do this run
    Skip { max_deviation: f64 },
    Rebalance {
        plan: RebalancePlan,
        max_deviation: f64,
    },
}

/// Applies the deviation threshold to an allocation.
pub struct RebalanceGate {
    threshold: f64,
    call_data: HashMap<String, Vec<u8>>,
}

impl RebalanceGate {
    /// `call_data` maps strategy ids to opaque bridge payloads, matched
    /// case-insensitively; strategies without an entry get empty call data.
    pub fn new(threshold: f64, call_data: HashMap<String, Vec<u8>>) -> Self {
        Self {
            threshold,
            call_data: call_data
                .into_iter()
                .map(|(strategy, data)| (strategy_key(&strategy), data))
                .collect(),
        }
    }

    /// Per-strategy drift between the snapshot and the allocation.
    ///
    /// Strategies present on only one side count with a weight of zero on
    /// the other.
    pub fn drift(&self, snapshot: &PortfolioSnapshot, allocation: &Allocation) -> Vec<StrategyDrift> {
        let mut drift: Vec<StrategyDrift> = snapshot
            .positions
            .iter()
            .map(|position| StrategyDrift {
                strategy_id: position.strategy_id.clone(),
                current_weight: snapshot.current_weight(position),
                target_weight: allocation.target_weight(&position.strategy_id).unwrap_or(0.0),
            })
            .collect();

        for target in &allocation.targets {
            if snapshot.position(&target.strategy_id).is_none() {
                drift.push(StrategyDrift {
                    strategy_id: target.strategy_id.clone(),
                    current_weight: 0.0,
                    target_weight: target.weight,
                });
            }
        }

        drift
    }

    /// Decide whether to rebalance.
    ///
    /// Acts only when the largest drift strictly exceeds the threshold.
    /// An allocation computed for a different run is refused.
    pub fn decide(
        &self,
        snapshot: &PortfolioSnapshot,
        allocation: &Allocation,
    ) -> Result<RebalanceDecision, KeeperError> {
        if allocation.run_id != snapshot.run_id {
            return Err(KeeperError::StaleSnapshot {
                snapshot_run: snapshot.run_id.0,
                target_run: allocation.run_id.0,
            });
        }

        if snapshot.total_assets.is_zero() {
            info!(run_id = %snapshot.run_id, "Vault is empty, nothing to rebalance");
            return Ok(RebalanceDecision::Skip { max_deviation: 0.0 });
        }

        let drift = self.drift(snapshot, allocation);
        for d in &drift {
            debug!(
                strategy = %d.strategy_id,
                current = d.current_weight,
                target = d.target_weight,
                deviation = d.deviation(),
                "Strategy drift"
            );
        }

        let max_deviation = drift.iter().map(StrategyDrift::deviation).fold(0.0, f64::max);

        if max_deviation <= self.threshold {
            info!(
                run_id = %snapshot.run_id,
                max_deviation,
                threshold = self.threshold,
                "Deviation within threshold, skipping rebalance"
            );
            return Ok(RebalanceDecision::Skip { max_deviation });
        }

        let legs = allocation
            .targets
            .iter()
            .map(|target| PlanLeg {
                strategy_id: target.strategy_id.clone(),
                target_amount: target.target_amount,
                call_data: self
                    .call_data
                    .get(&strategy_key(&target.strategy_id))
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();

        info!(
            run_id = %snapshot.run_id,
            max_deviation,
            threshold = self.threshold,
            "Deviation exceeds threshold, rebalancing"
        );

        Ok(RebalanceDecision::Rebalance {
            plan: RebalancePlan {
                run_id: snapshot.run_id,
                legs,
            },
            max_deviation,
        })
    }
}
