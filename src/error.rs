//! Error taxonomy for a pipeline run.
//!
//! Every variant of [`KeeperError`] aborts only the run that produced it;
//! the scheduler logs it and carries on with the next tick.

use std::time::Duration;
use thiserror::Error;

/// Failure reported by the chain gateway.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// Connection drop, timeout or other RPC transport problem.
    #[error("rpc transport error: {0}")]
    Transport(String),
    /// The node answered with something we could not interpret.
    #[error("malformed chain response: {0}")]
    Malformed(String),
    /// The node or contract refused the request (revert, underpriced, no funds).
    #[error("request rejected: {0}")]
    Rejected(String),
    /// The node already holds this exact signed transaction.
    #[error("transaction already known: {0}")]
    AlreadyKnown(String),
    /// The nonce has been used by a transaction the node has seen.
    #[error("nonce too low: {0}")]
    NonceTooLow(String),
}

impl GatewayError {
    /// Only transport failures are worth retrying automatically.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }
}

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("failed to read portfolio state: {0}")]
    ChainRead(#[source] GatewayError),

    #[error("prediction service error: {0}")]
    Prediction(String),

    #[error("optimization failed: {0}")]
    Optimization(String),

    #[error("allocation for run {target_run} does not match snapshot run {snapshot_run}")]
    StaleSnapshot { snapshot_run: u64, target_run: u64 },

    #[error("submission failed after {attempts} attempt(s): {source}")]
    Submission {
        attempts: u32,
        #[source]
        source: GatewayError,
    },

    #[error("transaction {hash} not confirmed within {timeout:?}")]
    ConfirmationTimeout { hash: String, timeout: Duration },

    #[error("transaction {hash} reverted")]
    TransactionReverted { hash: String },

    #[error("run cancelled before submission")]
    Cancelled,

    #[error("transaction history error: {0}")]
    History(String),
}

impl KeeperError {
    /// Short label for logs and run statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            KeeperError::ChainRead(_) => "chain_read",
            KeeperError::Prediction(_) => "prediction",
            KeeperError::Optimization(_) => "optimization",
            KeeperError::StaleSnapshot { .. } => "stale_snapshot",
            KeeperError::Submission { .. } => "submission",
            KeeperError::ConfirmationTimeout { .. } => "confirmation_timeout",
            KeeperError::TransactionReverted { .. } => "reverted",
            KeeperError::Cancelled => "cancelled",
            KeeperError::History(_) => "history",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_are_transient() {
        assert!(GatewayError::Transport("connection reset".into()).is_transient());
        assert!(!GatewayError::Malformed("bad abi".into()).is_transient());
        assert!(!GatewayError::Rejected("insufficient funds".into()).is_transient());
        assert!(!GatewayError::AlreadyKnown("already known".into()).is_transient());
        assert!(!GatewayError::NonceTooLow("nonce too low".into()).is_transient());
    }

    #[test]
    fn test_submission_error_message_includes_attempts() {
        let err = KeeperError::Submission {
            attempts: 3,
            source: GatewayError::Transport("eof".into()),
        };
        assert_eq!(
            err.to_string(),
            "submission failed after 3 attempt(s): rpc transport error: eof"
        );
        assert_eq!(err.kind(), "submission");
    }
}
