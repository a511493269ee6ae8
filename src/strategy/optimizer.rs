//! Allocation optimizer.
//!
//! Scores each strategy by risk-adjusted expected return, normalizes the
//! scores into weights, and enforces per-strategy bounds before converting
//! weights into target amounts.

use crate::config::SolverConfig;
use crate::error::KeeperError;
use crate::utils::decimal::scale_by_weight;
use rust_decimal::Decimal;
use tracing::{debug, warn};

const EPSILON: f64 = 1e-12;
const WEIGHT_TOLERANCE: f64 = 1e-9;

/// Solver input for one strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyInput {
    pub id: String,
    /// Current weight of the strategy in the vault
    pub current_allocation: f64,
    /// Predicted return as a fraction
    pub expected_return: f64,
    /// Predicted volatility as a fraction
    pub volatility: f64,
    /// Risk score on a 0-100 scale
    pub risk_score: f64,
    /// Upper bound on this strategy's weight
    pub max_allocation: f64,
}

/// Target weight and amount for one strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationTarget {
    pub strategy_id: String,
    pub weight: f64,
    pub target_amount: Decimal,
}

/// Mean-variance style allocator over a handful of strategies.
#[derive(Debug, Clone)]
pub struct AllocationOptimizer {
    config: SolverConfig,
}

impl AllocationOptimizer {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    /// Compute target weights and amounts for `total_assets`.
    ///
    /// Output order follows input order. Weights lie within the configured
    /// bounds whenever the bounds are jointly satisfiable and always sum to
    /// one; amounts sum exactly to `total_assets`.
    pub fn optimize(
        &self,
        strategies: &[StrategyInput],
        total_assets: Decimal,
    ) -> Result<Vec<AllocationTarget>, KeeperError> {
        if strategies.is_empty() {
            return Err(KeeperError::Optimization("no strategies to allocate".into()));
        }
        if let Some(bad) = strategies.iter().find(|s| !is_valid_input(s)) {
            return Err(KeeperError::Optimization(format!(
                "invalid solver input for {}",
                bad.id
            )));
        }

        let scores: Vec<f64> = strategies.iter().map(|s| self.score(s)).collect();
        let raw = normalize_scores(&scores);

        let (lower, upper): (Vec<f64>, Vec<f64>) = strategies
            .iter()
            .map(|s| {
                let upper = self.config.max_allocation.min(s.max_allocation).max(0.0);
                (self.config.min_allocation.min(upper), upper)
            })
            .unzip();

        let weights = apply_bounds(&raw, &lower, &upper);

        for (strategy, (score, weight)) in strategies.iter().zip(scores.iter().zip(&weights)) {
            debug!(
                strategy = %strategy.id,
                score,
                current = strategy.current_allocation,
                target = weight,
                "Strategy weight"
            );
        }

        self.to_targets(strategies, &weights, total_assets)
    }

    /// Risk-adjusted score: return per unit of risk-scaled volatility.
    ///
    /// `risk_tolerance` softens the risk penalty: the denominator is raised
    /// to `1 / risk_tolerance`, so 1.0 is the plain ratio and larger values
    /// approach scoring by return alone. Strategies with zero volatility or
    /// zero risk score already carry no penalty and are scored by expected
    /// return for every tolerance.
    pub fn score(&self, strategy: &StrategyInput) -> f64 {
        let risk = strategy.volatility * (strategy.risk_score / 100.0);
        if strategy.volatility > 0.0 && strategy.risk_score > 0.0 {
            strategy.expected_return / risk.powf(1.0 / self.config.risk_tolerance)
        } else {
            strategy.expected_return
        }
    }

    fn to_targets(
        &self,
        strategies: &[StrategyInput],
        weights: &[f64],
        total_assets: Decimal,
    ) -> Result<Vec<AllocationTarget>, KeeperError> {
        let decimals = self.config.amount_decimals;
        let mut targets = strategies
            .iter()
            .zip(weights)
            .map(|(strategy, &weight)| {
                let target_amount = scale_by_weight(total_assets, weight, decimals)
                    .map_err(|e| KeeperError::Optimization(e.to_string()))?;
                Ok(AllocationTarget {
                    strategy_id: strategy.id.clone(),
                    weight,
                    target_amount,
                })
            })
            .collect::<Result<Vec<_>, KeeperError>>()?;

        // Rounding dust goes to the largest target so amounts conserve capital
        let allocated: Decimal = targets.iter().map(|t| t.target_amount).sum();
        let dust = total_assets - allocated;
        if !dust.is_zero() {
            if let Some(largest) = targets
                .iter_mut()
                .max_by(|a, b| a.target_amount.cmp(&b.target_amount))
            {
                largest.target_amount += dust;
            }
        }

        Ok(targets)
    }
}

fn is_valid_input(strategy: &StrategyInput) -> bool {
    strategy.expected_return.is_finite()
        && strategy.volatility.is_finite()
        && strategy.volatility >= 0.0
        && strategy.risk_score.is_finite()
        && strategy.risk_score >= 0.0
        && strategy.max_allocation.is_finite()
}

/// Divide scores by their sum, or split equally when the sum is not positive.
fn normalize_scores(scores: &[f64]) -> Vec<f64> {
    let total: f64 = scores.iter().sum();
    if !total.is_finite() || total <= EPSILON {
        warn!(total, "Non-positive total score, using equal weights");
        let equal = 1.0 / scores.len() as f64;
        return vec![equal; scores.len()];
    }
    scores.iter().map(|s| s / total).collect()
}

/// Clip weights into `[lower, upper]` and redistribute the residual across
/// strategies that still have room, in proportion to their weight.
///
/// When the bounds cannot all hold at once (their sums do not bracket one),
/// clipped weights are renormalized and the sum constraint wins.
fn apply_bounds(raw: &[f64], lower: &[f64], upper: &[f64]) -> Vec<f64> {
    let mut weights: Vec<f64> = raw
        .iter()
        .zip(lower.iter().zip(upper))
        .map(|(w, (lo, hi))| w.clamp(*lo, *hi))
        .collect();

    let feasible = lower.iter().sum::<f64>() <= 1.0 + WEIGHT_TOLERANCE
        && upper.iter().sum::<f64>() >= 1.0 - WEIGHT_TOLERANCE;
    if !feasible {
        warn!("Allocation bounds cannot sum to one, renormalizing without bounds");
        return renormalize(weights);
    }

    for _ in 0..(4 * weights.len() + 8) {
        let residual = 1.0 - weights.iter().sum::<f64>();
        if residual.abs() <= WEIGHT_TOLERANCE {
            break;
        }

        let free: Vec<usize> = (0..weights.len())
            .filter(|&i| {
                if residual > 0.0 {
                    weights[i] < upper[i] - EPSILON
                } else {
                    weights[i] > lower[i] + EPSILON
                }
            })
            .collect();
        if free.is_empty() {
            break;
        }

        let free_mass: f64 = free.iter().map(|&i| weights[i]).sum();
        for &i in &free {
            let share = if free_mass > EPSILON {
                weights[i] / free_mass
            } else {
                1.0 / free.len() as f64
            };
            weights[i] = (weights[i] + residual * share).clamp(lower[i], upper[i]);
        }
    }

    weights
}

fn renormalize(weights: Vec<f64>) -> Vec<f64> {
    let total: f64 = weights.iter().sum();
    if total <= EPSILON {
        let equal = 1.0 / weights.len() as f64;
        return vec![equal; weights.len()];
    }
    weights.into_iter().map(|w| w / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn optimizer() -> AllocationOptimizer {
        AllocationOptimizer::new(SolverConfig::default())
    }

    fn input(id: &str, expected_return: f64, volatility: f64, risk_score: f64) -> StrategyInput {
        StrategyInput {
            id: id.to_string(),
            current_allocation: 0.0,
            expected_return,
            volatility,
            risk_score,
            max_allocation: 1.0,
        }
    }

    fn weights(targets: &[AllocationTarget]) -> Vec<f64> {
        targets.iter().map(|t| t.weight).collect()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_three_strategy_allocation() {
        let strategies = vec![
            input("aave", 0.05, 0.03, 25.0),
            input("lido", 0.04, 0.02, 30.0),
            input("delta", 0.08, 0.06, 45.0),
        ];

        let targets = optimizer().optimize(&strategies, dec!(1_000_000)).unwrap();
        let w = weights(&targets);

        // scores 6.667, 6.667, 2.963
        assert_close(w[0], 0.409091);
        assert_close(w[1], 0.409091);
        assert_close(w[2], 0.181818);
        assert_close(w.iter().sum(), 1.0);
        assert_eq!(
            targets.iter().map(|t| t.target_amount).sum::<Decimal>(),
            dec!(1_000_000)
        );
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let strategies = vec![
            input("aave", 0.05, 0.03, 25.0),
            input("lido", 0.04, 0.02, 30.0),
            input("delta", 0.08, 0.06, 45.0),
        ];
        let opt = optimizer();

        let first = opt.optimize(&strategies, dec!(1_000_000)).unwrap();
        let second = opt.optimize(&strategies, dec!(1_000_000)).unwrap();
        let fresh = optimizer().optimize(&strategies, dec!(1_000_000)).unwrap();

        assert_eq!(first, second);
        assert_eq!(first, fresh);
    }

    #[test]
    fn test_risk_tolerance_softens_penalty() {
        let strategies = vec![
            input("aave", 0.05, 0.03, 25.0),
            input("lido", 0.04, 0.02, 30.0),
            input("delta", 0.08, 0.06, 45.0),
        ];
        let tolerant = AllocationOptimizer::new(SolverConfig {
            risk_tolerance: 2.0,
            ..SolverConfig::default()
        });

        let w = weights(&tolerant.optimize(&strategies, dec!(1_000_000)).unwrap());
        assert_close(w[0], 0.365270);
        assert_close(w[1], 0.326707);
        assert_close(w[2], 0.308023);
        assert_close(w.iter().sum(), 1.0);

        // No penalty to soften without volatility
        assert_close(tolerant.score(&input("a", 0.05, 0.0, 25.0)), 0.05);
        assert_close(tolerant.score(&input("a", 0.05, 0.03, 25.0)), 0.05 / 0.0075f64.sqrt());
    }

    #[test]
    fn test_dominant_strategy_is_capped() {
        let strategies = vec![
            input("a", 1.0, 0.01, 10.0),
            input("b", 0.01, 0.01, 10.0),
            input("c", 0.01, 0.01, 10.0),
        ];

        let w = weights(&optimizer().optimize(&strategies, dec!(1000)).unwrap());
        assert_close(w[0], 0.5);
        assert_close(w[1], 0.25);
        assert_close(w[2], 0.25);
    }

    #[test]
    fn test_tiny_strategy_raised_to_floor() {
        let strategies = vec![
            input("a", 0.10, 0.02, 20.0),
            input("b", 0.10, 0.02, 20.0),
            input("c", 0.001, 0.02, 20.0),
        ];

        let w = weights(&optimizer().optimize(&strategies, dec!(1000)).unwrap());
        assert_close(w[2], 0.05);
        assert_close(w[0], 0.475);
        assert_close(w[1], 0.475);
    }

    #[test]
    fn test_zero_volatility_uses_raw_return() {
        let opt = optimizer();
        assert_close(opt.score(&input("a", 0.05, 0.0, 25.0)), 0.05);
        assert_close(opt.score(&input("a", 0.05, 0.03, 0.0)), 0.05);
        assert_close(opt.score(&input("a", 0.05, 0.03, 25.0)), 0.05 / 0.0075);
    }

    #[test]
    fn test_non_positive_scores_fall_back_to_equal_weights() {
        let strategies = vec![
            input("a", 0.0, 0.03, 25.0),
            input("b", 0.0, 0.02, 30.0),
            input("c", 0.0, 0.06, 45.0),
        ];

        let w = weights(&optimizer().optimize(&strategies, dec!(900)).unwrap());
        for weight in w {
            assert_close(weight, 1.0 / 3.0);
        }
    }

    #[test]
    fn test_negative_returns_stay_in_bounds() {
        let strategies = vec![
            input("a", 0.10, 0.02, 20.0),
            input("b", -0.05, 0.02, 20.0),
        ];

        let w = weights(&optimizer().optimize(&strategies, dec!(1000)).unwrap());
        assert_close(w[0], 0.5);
        assert_close(w[1], 0.5);
    }

    #[test]
    fn test_per_strategy_cap() {
        let mut strategies = vec![
            input("a", 0.10, 0.02, 20.0),
            input("b", 0.05, 0.02, 20.0),
            input("c", 0.05, 0.02, 20.0),
        ];
        strategies[0].max_allocation = 0.2;

        let w = weights(&optimizer().optimize(&strategies, dec!(1000)).unwrap());
        assert_close(w[0], 0.2);
        assert_close(w[1], 0.4);
        assert_close(w[2], 0.4);
    }

    #[test]
    fn test_single_strategy_takes_everything() {
        let strategies = vec![input("only", 0.05, 0.03, 25.0)];

        let targets = optimizer().optimize(&strategies, dec!(1234.5)).unwrap();
        assert_close(targets[0].weight, 1.0);
        assert_eq!(targets[0].target_amount, dec!(1234.5));
    }

    #[test]
    fn test_empty_input_is_error() {
        let err = optimizer().optimize(&[], dec!(1000)).unwrap_err();
        assert!(matches!(err, KeeperError::Optimization(_)));
    }

    #[test]
    fn test_nan_input_is_error() {
        let strategies = vec![input("a", f64::NAN, 0.03, 25.0)];
        assert!(optimizer().optimize(&strategies, dec!(1000)).is_err());
    }

    #[test]
    fn test_rounding_dust_conserves_total() {
        let strategies = vec![
            input("a", 0.05, 0.03, 25.0),
            input("b", 0.05, 0.03, 25.0),
            input("c", 0.05, 0.03, 25.0),
        ];

        let targets = optimizer().optimize(&strategies, dec!(100)).unwrap();
        let total: Decimal = targets.iter().map(|t| t.target_amount).sum();
        assert_eq!(total, dec!(100));
        assert!(targets.iter().all(|t| t.target_amount >= dec!(33.333333)));
    }

    #[test]
    fn test_bounds_hold_across_many_inputs() {
        let opt = optimizer();
        for seed in 0..50u32 {
            let strategies: Vec<StrategyInput> = (0..5u32)
                .map(|i| {
                    let x = ((seed * 31 + i * 17) % 97) as f64 / 97.0;
                    input(&format!("s{i}"), x * 0.2 - 0.02, 0.01 + x * 0.1, 5.0 + x * 90.0)
                })
                .collect();

            let targets = opt.optimize(&strategies, dec!(1_000_000)).unwrap();
            let sum: f64 = targets.iter().map(|t| t.weight).sum();
            assert_close(sum, 1.0);
            for t in &targets {
                assert!(t.weight >= 0.05 - 1e-9 && t.weight <= 0.5 + 1e-9, "{t:?}");
            }
            assert_eq!(
                targets.iter().map(|t| t.target_amount).sum::<Decimal>(),
                dec!(1_000_000)
            );
        }
    }
}
