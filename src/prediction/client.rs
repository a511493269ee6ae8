//! Prediction service HTTP client.

use super::types::{Prediction, PredictionResponse};
use super::PredictionSource;
use crate::config::PredictionConfig;
use crate::error::KeeperError;
use crate::portfolio::PortfolioSnapshot;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, instrument};

/// Request body for `POST /predict`.
#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    #[serde(flatten)]
    snapshot: &'a PortfolioSnapshot,
    strategies: Vec<&'a str>,
    horizon_days: u32,
}

/// Client for the yield prediction service.
pub struct PredictionClient {
    http: Client,
    base_url: String,
    horizon_days: u32,
}

impl PredictionClient {
    pub fn new(config: &PredictionConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            horizon_days: config.horizon_days,
        })
    }

    /// Check that the service is up.
    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        self.http
            .get(&url)
            .send()
            .await
            .context("Failed to reach prediction service")?
            .error_for_status()
            .context("Prediction service unhealthy")?;
        Ok(())
    }
}

#[async_trait]
impl PredictionSource for PredictionClient {
    #[instrument(skip(self, snapshot), fields(run_id = %snapshot.run_id))]
    async fn fetch_predictions(
        &self,
        snapshot: &PortfolioSnapshot,
    ) -> Result<Vec<Prediction>, KeeperError> {
        let url = format!("{}/predict", self.base_url);
        let request = PredictRequest {
            snapshot,
            strategies: snapshot.strategy_ids(),
            horizon_days: self.horizon_days,
        };

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| KeeperError::Prediction(format!("request failed: {e}")))?;

        let body: PredictionResponse = response
            .json()
            .await
            .map_err(|e| KeeperError::Prediction(format!("unparseable response: {e}")))?;

        let predictions = body.into_predictions();
        debug!(count = predictions.len(), "Predictions received");
        Ok(predictions)
    }
}
