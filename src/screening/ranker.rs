use serde::{Deserialize, Serialize};
use tracing::info;

use super::boosting::{BoostError, BoostedEnsemble, Objective};
use super::config::{RankerParams, ScreeningConfig};
use super::domain::{pick, FeatureMatrix};
use super::stats::mean_absolute_error;

#[derive(Debug, thiserror::Error)]
pub enum RankerError {
    #[error("no training scores above the cutoff {cutoff}")]
    EmptyTrainingSet { cutoff: f64 },
    #[error("{rows} feature rows but {scores} scores")]
    LengthMismatch { rows: usize, scores: usize },
    #[error("ranker regressor could not be fitted: {0}")]
    Regressor(#[from] BoostError),
}

/// Conservative quantile regressor trained on the gate's survivors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankerModel {
    regressor: BoostedEnsemble,
    n_train: usize,
    train_mae: f64,
    cutoff: f64,
    quantile: f64,
}

impl RankerModel {
    pub fn regressor(&self) -> &BoostedEnsemble {
        &self.regressor
    }

    pub fn n_train(&self) -> usize {
        self.n_train
    }

    pub fn train_mae(&self) -> f64 {
        self.train_mae
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    pub fn quantile(&self) -> f64 {
        self.quantile
    }

    pub fn predict(&self, matrix: &FeatureMatrix) -> Vec<f64> {
        self.regressor.predict(matrix)
    }
}

/// Indices of training rows strictly above `cutoff`.
pub fn training_subset(scores: &[f64], cutoff: f64) -> Vec<usize> {
    scores
        .iter()
        .enumerate()
        .filter(|(_, &score)| score > cutoff)
        .map(|(index, _)| index)
        .collect()
}

pub struct QualityRanker {
    cutoff: f64,
    params: RankerParams,
    seed: u64,
}

impl QualityRanker {
    /// Ranker sharing the gate's low-score cutoff.
    pub fn new(config: &ScreeningConfig) -> Self {
        Self {
            cutoff: config.low_cutoff(),
            params: config.ranker.clone(),
            seed: config.seed,
        }
    }

    pub fn with_cutoff(mut self, cutoff: f64) -> Self {
        self.cutoff = cutoff;
        self
    }

    pub fn fit(&self, matrix: &FeatureMatrix, scores: &[f64]) -> Result<RankerModel, RankerError> {
        if matrix.n_rows() != scores.len() {
            return Err(RankerError::LengthMismatch {
                rows: matrix.n_rows(),
                scores: scores.len(),
            });
        }

        let subset = training_subset(scores, self.cutoff);
        if subset.is_empty() {
            return Err(RankerError::EmptyTrainingSet {
                cutoff: self.cutoff,
            });
        }

        let train_matrix = matrix.select_rows(&subset);
        let train_scores = pick(scores, &subset);
        let regressor = BoostedEnsemble::fit(
            &train_matrix,
            &train_scores,
            &self.params.boost_params(self.seed),
            Objective::Quantile {
                alpha: self.params.quantile,
            },
        )?;

        let train_mae =
            mean_absolute_error(&train_scores, &regressor.predict(&train_matrix)).unwrap_or(0.0);
        info!(
            n_train = subset.len(),
            train_mae,
            quantile = self.params.quantile,
            "quality ranker trained"
        );

        Ok(RankerModel {
            regressor,
            n_train: subset.len(),
            train_mae,
            cutoff: self.cutoff,
            quantile: self.params.quantile,
        })
    }
}
