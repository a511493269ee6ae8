//! Yield prediction service access.
//!
//! Contains:
//! - Wire types for the prediction service
//! - The HTTP client
//! - Fallback resolution for strategies without a usable prediction

mod client;
mod types;

pub use client::PredictionClient;
pub use types::{resolve_predictions, Prediction, ResolvedPredictions};

use crate::error::KeeperError;
use crate::portfolio::PortfolioSnapshot;
use async_trait::async_trait;

/// Source of per-strategy return and volatility forecasts.
#[async_trait]
pub trait PredictionSource: Send + Sync {
    /// Raw predictions for the strategies in `snapshot`. May cover only a
    /// subset of them.
    async fn fetch_predictions(
        &self,
        snapshot: &PortfolioSnapshot,
    ) -> Result<Vec<Prediction>, KeeperError>;
}
