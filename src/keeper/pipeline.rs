//! One end-to-end rebalancing run.
//!
//! Stages run strictly in order:
//! Gathering -> Predicting -> Optimizing -> Deciding -> Executing -> Confirming.
//! Any error ends the run; only a broadcast transaction forces the run to
//! stay alive until its outcome is known.

use crate::chain::ChainGateway;
use crate::config::Config;
use crate::error::KeeperError;
use crate::persistence::{TransactionRecord, TransactionStore};
use crate::portfolio::{PortfolioReader, PortfolioSnapshot, RunId};
use crate::prediction::{resolve_predictions, Prediction, PredictionSource};
use crate::strategy::{
    Allocation, AllocationOptimizer, RebalanceDecision, RebalanceGate, StrategyInput,
    TransactionExecutor,
};
use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Idle,
    Gathering,
    Predicting,
    Optimizing,
    Deciding,
    Executing,
    Confirming,
}

/// How a run that did not fail ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Skipped { run_id: RunId, max_deviation: f64 },
    Rebalanced(TransactionRecord),
}

/// Something the scheduler can run once per tick.
#[async_trait]
pub trait PipelineRunner: Send + Sync + 'static {
    async fn run(&self, cancel: CancellationToken) -> Result<RunOutcome, KeeperError>;
}

/// Gather, predict, optimize, decide, execute.
pub struct RebalancePipeline {
    reader: PortfolioReader,
    predictor: Arc<dyn PredictionSource>,
    optimizer: AllocationOptimizer,
    gate: RebalanceGate,
    executor: TransactionExecutor,
    config: Config,
    stage: Mutex<PipelineStage>,
}

impl RebalancePipeline {
    pub fn new(
        config: Config,
        gateway: Arc<dyn ChainGateway>,
        predictor: Arc<dyn PredictionSource>,
        history: Arc<TransactionStore>,
    ) -> Result<Self> {
        let gate = RebalanceGate::new(
            config.keeper.deviation_threshold,
            config.execution.decoded_call_data()?,
        );

        Ok(Self {
            reader: PortfolioReader::new(gateway.clone()),
            predictor,
            optimizer: AllocationOptimizer::new(config.solver.clone()),
            gate,
            executor: TransactionExecutor::new(gateway, history, config.execution.clone()),
            config,
            stage: Mutex::new(PipelineStage::Idle),
        })
    }

    /// Stage the current run is in, `Idle` between runs.
    pub fn stage(&self) -> PipelineStage {
        self.stage
            .lock()
            .map(|s| *s)
            .unwrap_or(PipelineStage::Idle)
    }

    pub fn executor(&self) -> &TransactionExecutor {
        &self.executor
    }

    fn enter(&self, stage: PipelineStage) {
        if let Ok(mut current) = self.stage.lock() {
            *current = stage;
        }
    }

    /// Run a pre-submission step, giving up if shutdown is requested.
    async fn cancellable<T>(
        cancel: &CancellationToken,
        step: impl Future<Output = Result<T, KeeperError>>,
    ) -> Result<T, KeeperError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(KeeperError::Cancelled),
            result = step => result,
        }
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<RunOutcome, KeeperError> {
        self.enter(PipelineStage::Gathering);
        let snapshot = Self::cancellable(cancel, self.reader.read_snapshot()).await?;
        Span::current().record("run_id", snapshot.run_id.0);

        self.enter(PipelineStage::Predicting);
        let raw = Self::cancellable(cancel, self.predictor.fetch_predictions(&snapshot)).await?;
        let resolved = resolve_predictions(&snapshot, raw, self.config.prediction.min_confidence);

        self.enter(PipelineStage::Optimizing);
        let inputs = self.strategy_inputs(&snapshot, &resolved.predictions);
        let targets = self.optimizer.optimize(&inputs, snapshot.total_assets)?;
        let allocation = Allocation {
            run_id: snapshot.run_id,
            targets,
        };

        self.enter(PipelineStage::Deciding);
        let plan = match self.gate.decide(&snapshot, &allocation)? {
            RebalanceDecision::Skip { max_deviation } => {
                return Ok(RunOutcome::Skipped {
                    run_id: snapshot.run_id,
                    max_deviation,
                })
            }
            RebalanceDecision::Rebalance { plan, .. } => plan,
        };

        if self.config.keeper.dry_run {
            info!(run_id = %plan.run_id, legs = plan.legs.len(), "Dry run: submitting to simulated vault");
        }

        self.enter(PipelineStage::Executing);
        let handle = self.executor.submit(&plan, cancel).await?;

        // Past this point the transaction is out; shutdown waits for the outcome
        self.enter(PipelineStage::Confirming);
        let record = self.executor.confirm(&plan, &handle).await?;

        Ok(RunOutcome::Rebalanced(record))
    }

    /// Combine snapshot positions with their resolved predictions.
    fn strategy_inputs(
        &self,
        snapshot: &PortfolioSnapshot,
        predictions: &[Prediction],
    ) -> Vec<StrategyInput> {
        snapshot
            .positions
            .iter()
            .zip(predictions)
            .map(|(position, prediction)| StrategyInput {
                id: position.strategy_id.clone(),
                current_allocation: snapshot.current_weight(position),
                expected_return: prediction.predicted_return,
                volatility: prediction.predicted_volatility,
                risk_score: position.risk_score,
                max_allocation: self.config.solver.strategy_cap(&position.strategy_id),
            })
            .collect()
    }
}

#[async_trait]
impl PipelineRunner for RebalancePipeline {
    async fn run(&self, cancel: CancellationToken) -> Result<RunOutcome, KeeperError> {
        let span = info_span!("run", run_id = tracing::field::Empty);
        let result = self.execute(&cancel).instrument(span).await;
        self.enter(PipelineStage::Idle);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockVault;
    use crate::error::GatewayError;
    use crate::persistence::TxStatus;
    use rust_decimal_macros::dec;

    /// Fixed predictions, optionally failing.
    struct StaticPredictions {
        predictions: Vec<Prediction>,
        fail: bool,
    }

    #[async_trait]
    impl PredictionSource for StaticPredictions {
        async fn fetch_predictions(
            &self,
            _snapshot: &PortfolioSnapshot,
        ) -> Result<Vec<Prediction>, KeeperError> {
            if self.fail {
                return Err(KeeperError::Prediction("service down".into()));
            }
            Ok(self.predictions.clone())
        }
    }

    fn prediction(id: &str, ret: f64, vol: f64) -> Prediction {
        Prediction {
            strategy_id: id.to_string(),
            predicted_return: ret,
            predicted_volatility: vol,
            confidence: 0.85,
        }
    }

    fn demo_predictions() -> Vec<Prediction> {
        vec![
            prediction("aave", 0.05, 0.03),
            prediction("lido", 0.04, 0.02),
            prediction("delta", 0.08, 0.06),
        ]
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.keeper.dry_run = true;
        config.execution.confirmation_timeout_secs = 10;
        config.execution.poll_interval_ms = 500;
        config
    }

    fn pipeline(vault: Arc<MockVault>, predictions: Vec<Prediction>, fail: bool) -> RebalancePipeline {
        RebalancePipeline::new(
            config(),
            vault,
            Arc::new(StaticPredictions { predictions, fail }),
            Arc::new(TransactionStore::new(":memory:").unwrap()),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_run_rebalances_demo_vault() {
        let vault = Arc::new(MockVault::demo());
        let pipeline = pipeline(vault.clone(), demo_predictions(), false);

        let outcome = pipeline.run(CancellationToken::new()).await.unwrap();
        let RunOutcome::Rebalanced(record) = outcome else {
            panic!("expected a rebalance, got {outcome:?}");
        };

        assert_eq!(record.status, TxStatus::Confirmed);
        assert_eq!(pipeline.stage(), PipelineStage::Idle);
        // delta drops from 30% towards its ~18% target
        let delta = vault.position_amount("delta").await.unwrap();
        assert!(delta < dec!(200_000));
        assert_eq!(vault.submissions().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_skips_once_balanced() {
        let vault = Arc::new(MockVault::demo());
        let pipeline = pipeline(vault.clone(), demo_predictions(), false);

        pipeline.run(CancellationToken::new()).await.unwrap();
        let outcome = pipeline.run(CancellationToken::new()).await.unwrap();

        assert!(matches!(outcome, RunOutcome::Skipped { max_deviation, .. } if max_deviation < 1e-6));
        assert_eq!(vault.submissions().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prediction_failure_aborts_before_submission() {
        let vault = Arc::new(MockVault::demo());
        let pipeline = pipeline(vault.clone(), Vec::new(), true);

        let err = pipeline.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, KeeperError::Prediction(_)));
        assert_eq!(vault.submissions().await, 0);
        assert_eq!(pipeline.stage(), PipelineStage::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_read_failure_aborts_run() {
        let vault = Arc::new(MockVault::demo());
        vault.fail_next_reads(1).await;
        let pipeline = pipeline(vault.clone(), demo_predictions(), false);

        let err = pipeline.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, KeeperError::ChainRead(GatewayError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_predictions_use_observed_yield() {
        let vault = Arc::new(MockVault::demo());
        let pipeline = pipeline(vault.clone(), Vec::new(), false);

        // aave 0.052/(0.25*0.25), lido 0.041/(0.30*0.30), delta 0.085/(0.45*0.45)
        // gives targets far enough from 40/30/30 to act on
        let outcome = pipeline.run(CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Rebalanced(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_never_submits() {
        let vault = Arc::new(MockVault::demo());
        let pipeline = pipeline(vault.clone(), demo_predictions(), false);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline.run(cancel).await.unwrap_err();
        assert!(matches!(err, KeeperError::Cancelled));
        assert_eq!(vault.submissions().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_survives_cancellation() {
        let vault = Arc::new(MockVault::demo());
        vault.withhold_receipts(true).await;
        let pipeline = Arc::new(pipeline(vault.clone(), demo_predictions(), false));
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            async move { pipeline.run(cancel).await }
        });

        while vault.submissions().await == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        cancel.cancel();
        vault.withhold_receipts(false).await;

        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, RunOutcome::Rebalanced(_)));
    }
}
