//! Prediction wire types and fallback resolution.

use crate::portfolio::{strategy_key, PortfolioSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Forecast for one strategy over the prediction horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(alias = "strategy")]
    pub strategy_id: String,
    #[serde(alias = "apy")]
    pub predicted_return: f64,
    #[serde(alias = "volatility")]
    pub predicted_volatility: f64,
    #[serde(default)]
    pub confidence: f64,
}

impl Prediction {
    /// Conservative "no change" forecast from the observed position.
    pub fn fallback(strategy_id: &str, current_apy: f64, risk_score: f64) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            predicted_return: current_apy,
            predicted_volatility: risk_score / 100.0,
            confidence: 0.0,
        }
    }

    fn is_usable(&self, min_confidence: f64) -> bool {
        self.predicted_return.is_finite()
            && self.predicted_volatility.is_finite()
            && self.predicted_volatility >= 0.0
            && (0.0..=1.0).contains(&self.confidence)
            && self.confidence >= min_confidence
    }
}

/// Per-strategy entry in the keyed response form.
#[derive(Debug, Deserialize)]
pub(crate) struct KeyedPrediction {
    #[serde(alias = "apy")]
    predicted_return: f64,
    #[serde(alias = "volatility")]
    predicted_volatility: f64,
    #[serde(default)]
    confidence: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum PredictionPayload {
    List(Vec<Prediction>),
    Keyed(BTreeMap<String, KeyedPrediction>),
}

/// Every response shape the service is known to return.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum PredictionResponse {
    Bare(Vec<Prediction>),
    Wrapped { predictions: PredictionPayload },
}

impl PredictionResponse {
    pub(crate) fn into_predictions(self) -> Vec<Prediction> {
        match self {
            PredictionResponse::Bare(list)
            | PredictionResponse::Wrapped {
                predictions: PredictionPayload::List(list),
            } => list,
            PredictionResponse::Wrapped {
                predictions: PredictionPayload::Keyed(map),
            } => map
                .into_iter()
                .map(|(strategy_id, p)| Prediction {
                    strategy_id,
                    predicted_return: p.predicted_return,
                    predicted_volatility: p.predicted_volatility,
                    confidence: p.confidence,
                })
                .collect(),
        }
    }
}

/// Predictions aligned one-to-one with a snapshot's positions.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPredictions {
    /// In snapshot position order
    pub predictions: Vec<Prediction>,
    /// Strategies that fell back to their observed APY and risk
    pub fallback_ids: Vec<String>,
}

/// Align raw predictions with the snapshot, substituting the observed
/// APY and risk for any strategy that has no usable prediction.
///
/// Ids are matched case-insensitively and resolved predictions carry the
/// snapshot's spelling. Predictions for strategies not in the snapshot are
/// ignored.
pub fn resolve_predictions(
    snapshot: &PortfolioSnapshot,
    raw: Vec<Prediction>,
    min_confidence: f64,
) -> ResolvedPredictions {
    let mut by_id: HashMap<String, Prediction> = HashMap::with_capacity(raw.len());
    for prediction in raw {
        if !prediction.is_usable(min_confidence) {
            warn!(
                strategy = %prediction.strategy_id,
                confidence = prediction.confidence,
                "Discarding unusable prediction"
            );
            continue;
        }
        by_id.insert(strategy_key(&prediction.strategy_id), prediction);
    }

    let mut fallback_ids = Vec::new();
    let predictions = snapshot
        .positions
        .iter()
        .map(|position| match by_id.remove(&strategy_key(&position.strategy_id)) {
            Some(prediction) => Prediction {
                strategy_id: position.strategy_id.clone(),
                ..prediction
            },
            None => {
                fallback_ids.push(position.strategy_id.clone());
                Prediction::fallback(
                    &position.strategy_id,
                    position.current_apy,
                    position.risk_score,
                )
            }
        })
        .collect();

    if !fallback_ids.is_empty() {
        warn!(
            run_id = %snapshot.run_id,
            strategies = ?fallback_ids,
            "Missing predictions, using observed yield"
        );
    }

    ResolvedPredictions {
        predictions,
        fallback_ids,
    }
}
