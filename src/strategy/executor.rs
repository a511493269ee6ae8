//! Rebalance transaction execution.
//!
//! Submission and confirmation are separate steps so the pipeline can
//! observe the hand-off: once [`TransactionExecutor::submit`] returns, a
//! pending record exists and the run must wait for the outcome.
//!
//! Transactions are signed locally, so the hash is recorded before the first
//! broadcast and every retry resends the same signed bytes.

use crate::chain::{
    await_confirmation, ChainGateway, Confirmation, ReceiptStatus, SignedRebalance,
    TransactionHandle, TxParams, TxReceipt,
};
use crate::config::ExecutionConfig;
use crate::error::{GatewayError, KeeperError};
use crate::persistence::{TransactionRecord, TransactionStore, TxStatus};
use crate::strategy::RebalancePlan;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Gateway call that ran out of retries.
struct RetryExhausted {
    error: GatewayError,
    attempts: u32,
}

impl From<RetryExhausted> for KeeperError {
    fn from(failure: RetryExhausted) -> Self {
        KeeperError::Submission {
            attempts: failure.attempts,
            source: failure.error,
        }
    }
}

/// Signs, submits and confirms rebalance transactions.
pub struct TransactionExecutor {
    gateway: Arc<dyn ChainGateway>,
    history: Arc<TransactionStore>,
    config: ExecutionConfig,
}

impl TransactionExecutor {
    pub fn new(
        gateway: Arc<dyn ChainGateway>,
        history: Arc<TransactionStore>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            gateway,
            history,
            config,
        }
    }

    pub fn history(&self) -> &TransactionStore {
        &self.history
    }

    /// Broadcast `plan` with a fresh nonce and current gas price.
    ///
    /// Cancellation is honoured until the transaction is handed to the
    /// node. The pending record is written before the first send; if it
    /// cannot be written nothing is sent. Retries resend the same signed
    /// transaction, so at most one transaction per plan can ever be mined.
    pub async fn submit(
        &self,
        plan: &RebalancePlan,
        cancel: &CancellationToken,
    ) -> Result<TransactionHandle, KeeperError> {
        let params = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(KeeperError::Cancelled),
            params = self.prepare(plan) => params?,
        };

        let signed = self
            .gateway
            .sign_rebalance(plan, params)
            .await
            .map_err(|source| KeeperError::Submission { attempts: 1, source })?;

        if cancel.is_cancelled() {
            return Err(KeeperError::Cancelled);
        }

        let handle = TransactionHandle {
            hash: signed.hash.clone(),
            nonce: signed.nonce,
            gas_price: signed.gas_price,
            submitted_at: Utc::now(),
        };
        let pending = self.pending_record(plan, &handle);
        self.append(&pending)?;

        if let Err(failure) = self.broadcast(&signed).await {
            let maybe_sent = failure.attempts > 1 || failure.error.is_transient();
            if maybe_sent {
                // The node may hold it; reconcile settles the record
                error!(
                    hash = %handle.hash,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "Broadcast outcome unknown, left pending"
                );
            } else {
                self.append(&pending.with_status(TxStatus::Dropped))?;
                error!(hash = %handle.hash, error = %failure.error, "Broadcast refused, transaction dropped");
            }
            return Err(failure.into());
        }

        info!(
            run_id = %plan.run_id,
            hash = %handle.hash,
            nonce = handle.nonce,
            gas_price = handle.gas_price,
            "Rebalance submitted"
        );

        Ok(handle)
    }

    /// Send the signed transaction, resending the same bytes on transport
    /// failures.
    ///
    /// A resend answered with "already known" means an earlier attempt got
    /// through. So does "nonce too low" after a failed attempt, since this
    /// transaction holds the nonce.
    async fn broadcast(&self, signed: &SignedRebalance) -> Result<(), RetryExhausted> {
        let max_attempts = self.config.max_submit_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.gateway.broadcast_rebalance(signed).await {
                Ok(()) => return Ok(()),
                Err(GatewayError::AlreadyKnown(reason)) => {
                    info!(hash = %signed.hash, attempt, %reason, "Node already holds transaction");
                    return Ok(());
                }
                Err(GatewayError::NonceTooLow(reason)) if attempt > 1 => {
                    warn!(hash = %signed.hash, attempt, %reason, "Nonce consumed after resend, assuming earlier attempt landed");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(operation = "broadcast", attempt, max_attempts, error = %e, "Chain call failed, retrying");
                    tokio::time::sleep(self.config.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(error) => {
                    return Err(RetryExhausted {
                        error,
                        attempts: attempt,
                    })
                }
            }
        }
    }

    /// Wait for the outcome of a submitted transaction and record it.
    ///
    /// Reverts and timeouts are recorded, then returned as errors. Neither
    /// triggers a resubmission.
    pub async fn confirm(
        &self,
        plan: &RebalancePlan,
        handle: &TransactionHandle,
    ) -> Result<TransactionRecord, KeeperError> {
        let timeout = self.config.confirmation_timeout();
        let outcome = await_confirmation(
            self.gateway.as_ref(),
            &handle.hash,
            timeout,
            self.config.poll_interval(),
            self.config.max_submit_attempts,
        )
        .await
        .map_err(|e| {
            error!(hash = %handle.hash, error = %e, "Lost track of transaction, left pending");
            KeeperError::Submission {
                attempts: self.config.max_submit_attempts,
                source: e,
            }
        })?;

        let base = self.pending_record(plan, handle);
        match outcome {
            Confirmation::Mined(receipt) => {
                let record = self.record_receipt(base, &receipt)?;
                match receipt.status {
                    ReceiptStatus::Success => {
                        info!(
                            hash = %record.hash,
                            block = receipt.block_number,
                            gas_used = receipt.gas_used,
                            "Rebalance confirmed"
                        );
                        Ok(record)
                    }
                    ReceiptStatus::Failure => {
                        error!(hash = %record.hash, block = receipt.block_number, "Rebalance reverted");
                        Err(KeeperError::TransactionReverted { hash: record.hash })
                    }
                }
            }
            Confirmation::TimedOut => {
                self.append(&base.with_status(TxStatus::TimedOut))?;
                warn!(hash = %handle.hash, ?timeout, "Rebalance not confirmed in time, not resubmitting");
                Err(KeeperError::ConfirmationTimeout {
                    hash: handle.hash.clone(),
                    timeout,
                })
            }
        }
    }

    /// Resolve transactions left pending by an earlier process.
    ///
    /// Each unresolved hash is polled once; those with a receipt get a
    /// terminal record, the rest are left for the next pass.
    pub async fn reconcile(&self) -> Result<usize, KeeperError> {
        let unresolved = self
            .history
            .unresolved()
            .map_err(|e| KeeperError::History(e.to_string()))?;

        let mut resolved = 0;
        for pending in unresolved {
            match self.gateway.transaction_receipt(&pending.hash).await {
                Ok(Some(receipt)) => {
                    let record = self.record_receipt(pending, &receipt)?;
                    info!(hash = %record.hash, status = %record.status, "Reconciled pending transaction");
                    resolved += 1;
                }
                Ok(None) => warn!(hash = %pending.hash, "Transaction from earlier run still pending"),
                Err(e) => warn!(hash = %pending.hash, error = %e, "Failed to reconcile transaction"),
            }
        }

        Ok(resolved)
    }

    /// Nonce, gas price and gas limit for a submission.
    async fn prepare(&self, plan: &RebalancePlan) -> Result<TxParams, KeeperError> {
        let nonce = self.with_retry("nonce", || self.gateway.pending_nonce()).await?;
        let network_price = self.with_retry("gas_price", || self.gateway.gas_price()).await?;
        let gas_price = (network_price as f64 * self.config.gas_price_multiplier).ceil() as u128;

        let gas_limit = match self
            .with_retry("estimate_gas", || self.gateway.estimate_rebalance_gas(plan))
            .await
        {
            Ok(estimate) => (estimate as f64 * (1.0 + self.config.gas_limit_buffer)).ceil() as u64,
            Err(RetryExhausted {
                error: GatewayError::Rejected(reason),
                attempts,
            }) => {
                // Estimation reverting means the call itself would revert
                return Err(KeeperError::Submission {
                    attempts,
                    source: GatewayError::Rejected(reason),
                });
            }
            Err(failure) => {
                warn!(
                    error = %failure.error,
                    default = self.config.default_gas_limit,
                    "Gas estimation failed, using default limit"
                );
                self.config.default_gas_limit
            }
        };

        Ok(TxParams {
            nonce,
            gas_price,
            gas_limit,
        })
    }

    /// Retry transient gateway failures with linear backoff.
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let max_attempts = self.config.max_submit_attempts.max(1);
        let mut attempt = 1;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(operation, attempt, max_attempts, error = %e, "Chain call failed, retrying");
                    tokio::time::sleep(self.config.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(error) => {
                    return Err(RetryExhausted {
                        error,
                        attempts: attempt,
                    })
                }
            }
        }
    }

    fn pending_record(&self, plan: &RebalancePlan, handle: &TransactionHandle) -> TransactionRecord {
        TransactionRecord {
            run_id: plan.run_id,
            hash: handle.hash.clone(),
            status: TxStatus::Pending,
            nonce: handle.nonce,
            gas_price: handle.gas_price,
            gas_used: None,
            block_number: None,
            submitted_at: handle.submitted_at,
            confirmed_at: None,
            plan: serde_json::to_string(plan).unwrap_or_default(),
        }
    }

    fn record_receipt(
        &self,
        pending: TransactionRecord,
        receipt: &TxReceipt,
    ) -> Result<TransactionRecord, KeeperError> {
        let status = match receipt.status {
            ReceiptStatus::Success => TxStatus::Confirmed,
            ReceiptStatus::Failure => TxStatus::Reverted,
        };
        let record = TransactionRecord {
            status,
            gas_used: Some(receipt.gas_used),
            block_number: Some(receipt.block_number),
            confirmed_at: Some(Utc::now()),
            ..pending
        };
        self.append(&record)?;
        Ok(record)
    }

    fn append(&self, record: &TransactionRecord) -> Result<(), KeeperError> {
        self.history
            .append(record)
            .map_err(|e| KeeperError::History(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainGateway, MockVault};
    use crate::portfolio::RunId;
    use crate::strategy::PlanLeg;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn plan() -> RebalancePlan {
        RebalancePlan {
            run_id: RunId(9),
            legs: vec![
                PlanLeg {
                    strategy_id: "aave".into(),
                    target_amount: dec!(500_000),
                    call_data: Vec::new(),
                },
                PlanLeg {
                    strategy_id: "lido".into(),
                    target_amount: dec!(300_000),
                    call_data: Vec::new(),
                },
                PlanLeg {
                    strategy_id: "delta".into(),
                    target_amount: dec!(200_000),
                    call_data: Vec::new(),
                },
            ],
        }
    }

    fn config() -> ExecutionConfig {
        ExecutionConfig {
            confirmation_timeout_secs: 10,
            poll_interval_ms: 1000,
            ..ExecutionConfig::default()
        }
    }

    fn signed(hash: &str, params: TxParams) -> SignedRebalance {
        SignedRebalance {
            hash: hash.to_string(),
            nonce: params.nonce,
            gas_price: params.gas_price,
            raw: format!("signed-{hash}").into_bytes(),
        }
    }

    fn executor(gateway: Arc<dyn ChainGateway>) -> TransactionExecutor {
        let history = Arc::new(TransactionStore::new(":memory:").unwrap());
        TransactionExecutor::new(gateway, history, config())
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_and_confirm() {
        let vault = Arc::new(MockVault::demo());
        let executor = executor(vault.clone());
        let plan = plan();

        let handle = executor.submit(&plan, &CancellationToken::new()).await.unwrap();
        let pending = executor.history().latest(&handle.hash).unwrap().unwrap();
        assert_eq!(pending.status, TxStatus::Pending);

        let record = executor.confirm(&plan, &handle).await.unwrap();
        assert_eq!(record.status, TxStatus::Confirmed);
        assert_eq!(record.gas_used, Some(180_000));
        assert_eq!(vault.position_amount("aave").await, Some(dec!(500_000)));
        assert_eq!(executor.history().count().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gas_price_multiplier_and_buffer() {
        let vault = Arc::new(MockVault::demo());
        vault.set_gas_price(1_000_000_000).await;
        let executor = executor(vault);

        let params = executor.prepare(&plan()).await.unwrap();
        assert_eq!(params.nonce, 0);
        assert_eq!(params.gas_price, 1_100_000_000);
        assert_eq!(params.gas_limit, 252_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_submit_failures_are_retried() {
        let vault = Arc::new(MockVault::demo());
        vault.fail_next_submits(2).await;
        let executor = executor(vault.clone());

        let handle = executor.submit(&plan(), &CancellationToken::new()).await.unwrap();
        assert_eq!(handle.nonce, 0);
        assert_eq!(vault.submissions().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_escalates_after_max_attempts() {
        let vault = Arc::new(MockVault::demo());
        vault.fail_next_submits(5).await;
        let executor = executor(vault.clone());

        let err = executor.submit(&plan(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, KeeperError::Submission { attempts: 3, .. }));
        assert_eq!(vault.submissions().await, 0);

        // Outcome unknown, so the record stays open for reconcile
        let unresolved = executor.history().unresolved().unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].nonce, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_record_precedes_broadcast() {
        let vault = Arc::new(MockVault::demo());
        vault.lose_next_responses(1).await;
        let executor = executor(vault.clone());
        let plan = plan();

        let handle = executor.submit(&plan, &CancellationToken::new()).await.unwrap();
        assert_eq!(vault.submissions().await, 1);

        let record = executor.confirm(&plan, &handle).await.unwrap();
        assert_eq!(record.status, TxStatus::Confirmed);
        assert_eq!(vault.position_amount("aave").await, Some(dec!(500_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_known_after_lost_response_is_success() {
        let mut gateway = MockChainGateway::new();
        gateway.expect_pending_nonce().returning(|| Ok(4));
        gateway.expect_gas_price().returning(|| Ok(100));
        gateway.expect_estimate_rebalance_gas().returning(|_| Ok(200_000));
        gateway
            .expect_sign_rebalance()
            .times(1)
            .returning(|_, params| Ok(signed("0xabc", params)));

        let mut sends = mockall::Sequence::new();
        gateway
            .expect_broadcast_rebalance()
            .times(1)
            .in_sequence(&mut sends)
            .returning(|_| Err(GatewayError::Transport("connection reset".into())));
        gateway
            .expect_broadcast_rebalance()
            .times(1)
            .in_sequence(&mut sends)
            .withf(|tx| tx.hash == "0xabc" && tx.raw == b"signed-0xabc".to_vec())
            .returning(|_| Err(GatewayError::AlreadyKnown("already known".into())));
        gateway.expect_transaction_receipt().returning(|hash| {
            Ok(Some(TxReceipt {
                hash: hash.to_string(),
                block_number: 77,
                gas_used: 150_000,
                status: ReceiptStatus::Success,
            }))
        });

        let executor = executor(Arc::new(gateway));
        let plan = plan();

        let handle = executor.submit(&plan, &CancellationToken::new()).await.unwrap();
        assert_eq!(handle.hash, "0xabc");
        assert_eq!(handle.nonce, 4);
        let pending = executor.history().latest("0xabc").unwrap().unwrap();
        assert_eq!(pending.status, TxStatus::Pending);

        let record = executor.confirm(&plan, &handle).await.unwrap();
        assert_eq!(record.status, TxStatus::Confirmed);
        assert_eq!(record.block_number, Some(77));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonce_too_low_on_resend_is_success() {
        let mut gateway = MockChainGateway::new();
        gateway.expect_pending_nonce().returning(|| Ok(1));
        gateway.expect_gas_price().returning(|| Ok(100));
        gateway.expect_estimate_rebalance_gas().returning(|_| Ok(200_000));
        gateway
            .expect_sign_rebalance()
            .returning(|_, params| Ok(signed("0xdef", params)));

        let mut sends = mockall::Sequence::new();
        gateway
            .expect_broadcast_rebalance()
            .times(1)
            .in_sequence(&mut sends)
            .returning(|_| Err(GatewayError::Transport("timed out".into())));
        gateway
            .expect_broadcast_rebalance()
            .times(1)
            .in_sequence(&mut sends)
            .returning(|_| Err(GatewayError::NonceTooLow("nonce too low".into())));

        let executor = executor(Arc::new(gateway));
        let handle = executor.submit(&plan(), &CancellationToken::new()).await.unwrap();

        assert_eq!(handle.hash, "0xdef");
        let unresolved = executor.history().unresolved().unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].hash, "0xdef");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_first_broadcast_is_dropped() {
        let mut gateway = MockChainGateway::new();
        gateway.expect_pending_nonce().returning(|| Ok(2));
        gateway.expect_gas_price().returning(|| Ok(100));
        gateway.expect_estimate_rebalance_gas().returning(|_| Ok(200_000));
        gateway
            .expect_sign_rebalance()
            .returning(|_, params| Ok(signed("0x123", params)));
        gateway
            .expect_broadcast_rebalance()
            .times(1)
            .returning(|_| Err(GatewayError::Rejected("insufficient funds for gas".into())));

        let executor = executor(Arc::new(gateway));
        let err = executor.submit(&plan(), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(
            err,
            KeeperError::Submission { attempts: 1, source: GatewayError::Rejected(_) }
        ));
        let latest = executor.history().latest("0x123").unwrap().unwrap();
        assert_eq!(latest.status, TxStatus::Dropped);
        assert!(executor.history().unresolved().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_revert_is_recorded_and_not_retried() {
        let vault = Arc::new(MockVault::demo());
        vault.revert_next().await;
        let executor = executor(vault.clone());
        let plan = plan();

        let handle = executor.submit(&plan, &CancellationToken::new()).await.unwrap();
        let err = executor.confirm(&plan, &handle).await.unwrap_err();

        assert!(matches!(err, KeeperError::TransactionReverted { .. }));
        assert_eq!(vault.submissions().await, 1);
        let latest = executor.history().latest(&handle.hash).unwrap().unwrap();
        assert_eq!(latest.status, TxStatus::Reverted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_never_resubmits() {
        let mut gateway = MockChainGateway::new();
        gateway.expect_pending_nonce().returning(|| Ok(3));
        gateway.expect_gas_price().returning(|| Ok(100));
        gateway.expect_estimate_rebalance_gas().returning(|_| Ok(200_000));
        gateway
            .expect_sign_rebalance()
            .times(1)
            .returning(|_, params| Ok(signed("0xfeed", params)));
        gateway.expect_broadcast_rebalance().times(1).returning(|_| Ok(()));
        gateway.expect_transaction_receipt().returning(|_| Ok(None));

        let executor = executor(Arc::new(gateway));
        let plan = plan();

        let handle = executor.submit(&plan, &CancellationToken::new()).await.unwrap();
        let err = executor.confirm(&plan, &handle).await.unwrap_err();

        assert!(matches!(
            err,
            KeeperError::ConfirmationTimeout { timeout, .. } if timeout == Duration::from_secs(10)
        ));
        let latest = executor.history().latest("0xfeed").unwrap().unwrap();
        assert_eq!(latest.status, TxStatus::TimedOut);
        assert!(executor.history().unresolved().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimation_revert_aborts_submission() {
        let mut gateway = MockChainGateway::new();
        gateway.expect_pending_nonce().returning(|| Ok(0));
        gateway.expect_gas_price().returning(|| Ok(100));
        gateway
            .expect_estimate_rebalance_gas()
            .returning(|_| Err(GatewayError::Rejected("execution reverted".into())));
        gateway.expect_sign_rebalance().never();
        gateway.expect_broadcast_rebalance().never();

        let err = executor(Arc::new(gateway))
            .submit(&plan(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KeeperError::Submission { source: GatewayError::Rejected(_), .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_submit() {
        let vault = Arc::new(MockVault::demo());
        let executor = executor(vault.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = executor.submit(&plan(), &cancel).await.unwrap_err();
        assert!(matches!(err, KeeperError::Cancelled));
        assert_eq!(vault.submissions().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_resolves_leftover_pending() {
        let vault = Arc::new(MockVault::demo());
        vault.withhold_receipts(true).await;
        let executor = executor(vault.clone());
        let plan = plan();

        let handle = executor.submit(&plan, &CancellationToken::new()).await.unwrap();
        assert_eq!(executor.reconcile().await.unwrap(), 0);

        vault.withhold_receipts(false).await;
        assert_eq!(executor.reconcile().await.unwrap(), 1);
        let latest = executor.history().latest(&handle.hash).unwrap().unwrap();
        assert_eq!(latest.status, TxStatus::Confirmed);
        assert!(executor.history().unresolved().unwrap().is_empty());
    }
}
