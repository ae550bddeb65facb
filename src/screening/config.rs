use serde::{Deserialize, Serialize};

use super::boosting::BoostParams;
use super::gate::CostMatrix;

/// Knobs shared by every stage of a screening run.
///
/// `low_score_threshold` is the single cutoff used both to label gate targets
/// and to select the ranker's training subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningConfig {
    pub low_score_threshold: i32,
    pub recall_target: f64,
    pub production_pool_size: usize,
    pub production_k: usize,
    pub gate: GateParams,
    pub ranker: RankerParams,
    pub cost: CostMatrix,
    pub bootstrap_resamples: usize,
    pub seed: u64,
}

impl ScreeningConfig {
    pub fn low_cutoff(&self) -> f64 {
        f64::from(self.low_score_threshold)
    }

    /// Review quota for a pool of `pool_size`, scaled from the production quota.
    pub fn proportional_k(&self, pool_size: usize) -> usize {
        proportional_k(self.production_k, pool_size, self.production_pool_size)
    }
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            low_score_threshold: 15,
            recall_target: 0.95,
            production_pool_size: 10_000,
            production_k: 4_000,
            gate: GateParams::default(),
            ranker: RankerParams::default(),
            cost: CostMatrix::default(),
            bootstrap_resamples: 1_000,
            seed: 42,
        }
    }
}

/// Gradient-boosted classifier settings for the safety gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateParams {
    pub max_depth: usize,
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub min_child_weight: f64,
    pub subsample: f64,
    pub lambda: f64,
    pub positive_weight_multiplier: f64,
}

impl GateParams {
    pub fn boost_params(&self, seed: u64) -> BoostParams {
        BoostParams {
            n_estimators: self.n_estimators,
            max_depth: self.max_depth,
            learning_rate: self.learning_rate,
            min_child_weight: self.min_child_weight,
            subsample: self.subsample,
            lambda: self.lambda,
            seed,
        }
    }
}

impl Default for GateParams {
    fn default() -> Self {
        Self {
            max_depth: 2,
            n_estimators: 200,
            learning_rate: 0.05,
            min_child_weight: 10.0,
            subsample: 0.7,
            lambda: 1.0,
            positive_weight_multiplier: 2.5,
        }
    }
}

/// Quantile regressor settings for the quality ranker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankerParams {
    pub max_depth: usize,
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub min_child_weight: f64,
    pub subsample: f64,
    pub lambda: f64,
    pub quantile: f64,
}

impl RankerParams {
    pub fn boost_params(&self, seed: u64) -> BoostParams {
        BoostParams {
            n_estimators: self.n_estimators,
            max_depth: self.max_depth,
            learning_rate: self.learning_rate,
            min_child_weight: self.min_child_weight,
            subsample: self.subsample,
            lambda: self.lambda,
            seed,
        }
    }
}

impl Default for RankerParams {
    fn default() -> Self {
        Self {
            max_depth: 3,
            n_estimators: 200,
            learning_rate: 0.05,
            min_child_weight: 1.0,
            subsample: 0.8,
            lambda: 1.0,
            quantile: 0.25,
        }
    }
}

/// `max(1, round(production_k * pool_size / production_pool_size))`.
pub fn proportional_k(production_k: usize, pool_size: usize, production_pool_size: usize) -> usize {
    if production_pool_size == 0 {
        return production_k.max(1);
    }

    let scaled = production_k as f64 * pool_size as f64 / production_pool_size as f64;
    (scaled.round() as usize).max(1)
}
