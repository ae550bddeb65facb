//! Depth-limited gradient-boosted regression trees.
//!
//! Two objectives are supported: weighted logistic loss for the safety gate
//! and pinball (quantile) loss for the quality ranker. Trees are grown with
//! exact greedy splits on first and second order gradients; quantile trees
//! have their node values refit to the residual quantile after growth.

mod tree;

pub use tree::{RegressionTree, SplitRule, TreeNode};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tree::{GrowthParams, TreeGrower};

use super::domain::FeatureMatrix;
use super::stats::{logit, percentile, sigmoid};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Objective {
    /// Binary logistic loss; targets are 0/1 and positives are up-weighted.
    Logistic { positive_weight: f64 },
    /// Pinball loss at quantile `alpha`.
    Quantile { alpha: f64 },
}

impl Objective {
    fn weight(&self, target: f64) -> f64 {
        match self {
            Objective::Logistic { positive_weight } if target > 0.5 => *positive_weight,
            _ => 1.0,
        }
    }

    fn base_score(&self, targets: &[f64]) -> f64 {
        match self {
            Objective::Logistic { .. } => {
                let (weighted_pos, total) = targets.iter().fold((0.0, 0.0), |(pos, total), &y| {
                    let w = self.weight(y);
                    (pos + w * y, total + w)
                });
                logit(weighted_pos / total)
            }
            Objective::Quantile { alpha } => percentile(targets, alpha * 100.0).unwrap_or(0.0),
        }
    }

    fn gradient(&self, target: f64, margin: f64) -> (f64, f64) {
        match self {
            Objective::Logistic { .. } => {
                let w = self.weight(target);
                let p = sigmoid(margin);
                (w * (p - target), w * (p * (1.0 - p)).max(1e-16))
            }
            Objective::Quantile { alpha } => {
                let g = if target >= margin { -alpha } else { 1.0 - alpha };
                (g, 1.0)
            }
        }
    }

    /// Mean loss, used for monitoring only.
    pub fn loss(&self, targets: &[f64], margins: &[f64]) -> f64 {
        if targets.is_empty() {
            return 0.0;
        }

        let total: f64 = targets
            .iter()
            .zip(margins)
            .map(|(&y, &m)| match self {
                Objective::Logistic { .. } => {
                    let p = sigmoid(m).clamp(1e-15, 1.0 - 1e-15);
                    -self.weight(y) * (y * p.ln() + (1.0 - y) * (1.0 - p).ln())
                }
                Objective::Quantile { alpha } => {
                    let diff = y - m;
                    if diff >= 0.0 {
                        alpha * diff
                    } else {
                        (alpha - 1.0) * diff
                    }
                }
            })
            .sum();
        total / targets.len() as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub min_child_weight: f64,
    pub subsample: f64,
    pub lambda: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BoostError {
    #[error("cannot fit an ensemble on zero rows")]
    EmptyTrainingSet,
    #[error("{rows} feature rows but {targets} targets")]
    TargetLength { rows: usize, targets: usize },
    #[error("ensemble configured with zero estimators")]
    NoEstimators,
    #[error("quantile level {0} must lie strictly between 0 and 1")]
    InvalidQuantile(f64),
}

/// Rows and targets watched during fitting without influencing it.
#[derive(Debug, Clone, Copy)]
pub struct EvalSet<'a> {
    pub matrix: &'a FeatureMatrix,
    pub targets: &'a [f64],
}

/// Fitted ensemble plus the monitored loss after every boosting round.
#[derive(Debug, Clone)]
pub struct MonitoredFit {
    pub ensemble: BoostedEnsemble,
    pub eval_loss: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedEnsemble {
    objective: Objective,
    base_score: f64,
    learning_rate: f64,
    trees: Vec<RegressionTree>,
    feature_names: Vec<String>,
}

impl BoostedEnsemble {
    pub fn fit(
        matrix: &FeatureMatrix,
        targets: &[f64],
        params: &BoostParams,
        objective: Objective,
    ) -> Result<Self, BoostError> {
        Self::fit_monitored(matrix, targets, params, objective, None).map(|fit| fit.ensemble)
    }

    pub fn fit_monitored(
        matrix: &FeatureMatrix,
        targets: &[f64],
        params: &BoostParams,
        objective: Objective,
        monitor: Option<EvalSet<'_>>,
    ) -> Result<MonitoredFit, BoostError> {
        if matrix.is_empty() {
            return Err(BoostError::EmptyTrainingSet);
        }
        if matrix.n_rows() != targets.len() {
            return Err(BoostError::TargetLength {
                rows: matrix.n_rows(),
                targets: targets.len(),
            });
        }
        if params.n_estimators == 0 {
            return Err(BoostError::NoEstimators);
        }
        if let Objective::Quantile { alpha } = objective {
            if !(alpha > 0.0 && alpha < 1.0) {
                return Err(BoostError::InvalidQuantile(alpha));
            }
        }

        let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
        let base_score = objective.base_score(targets);
        let growth = GrowthParams {
            max_depth: params.max_depth,
            min_child_weight: params.min_child_weight,
            lambda: params.lambda,
        };

        let mut margins = vec![base_score; matrix.n_rows()];
        let mut eval_margins = monitor
            .map(|set| vec![base_score; set.matrix.n_rows()])
            .unwrap_or_default();
        let mut eval_loss = Vec::new();
        let mut trees = Vec::with_capacity(params.n_estimators);
        let mut gradients = vec![0.0; matrix.n_rows()];
        let mut hessians = vec![0.0; matrix.n_rows()];

        for round in 0..params.n_estimators {
            for (row, (&target, &margin)) in targets.iter().zip(&margins).enumerate() {
                let (g, h) = objective.gradient(target, margin);
                gradients[row] = g;
                hessians[row] = h;
            }

            let rows = sample_rows(matrix.n_rows(), params.subsample, &mut rng);
            let mut tree = TreeGrower::new(matrix, &gradients, &hessians, growth).grow(rows.clone());

            if let Objective::Quantile { alpha } = objective {
                refit_quantile_nodes(&mut tree, matrix, targets, &margins, &rows, alpha);
            }

            for (row, margin) in margins.iter_mut().enumerate() {
                *margin += params.learning_rate * tree.predict_row(matrix.row(row));
            }

            if let Some(set) = monitor {
                for (row, margin) in eval_margins.iter_mut().enumerate() {
                    *margin += params.learning_rate * tree.predict_row(set.matrix.row(row));
                }
                let loss = objective.loss(set.targets, &eval_margins);
                if (round + 1) % 50 == 0 {
                    debug!(round = round + 1, loss, "boosting eval checkpoint");
                }
                eval_loss.push(loss);
            }

            trees.push(tree);
        }

        Ok(MonitoredFit {
            ensemble: Self {
                objective,
                base_score,
                learning_rate: params.learning_rate,
                trees,
                feature_names: matrix.feature_names().to_vec(),
            },
            eval_loss,
        })
    }

    pub fn objective(&self) -> Objective {
        self.objective
    }

    pub fn base_score(&self) -> f64 {
        self.base_score
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Total split gain per feature across all trees, largest first.
    /// Features that never split are left out.
    pub fn gain_importance(&self) -> Vec<(String, f64)> {
        let mut totals = vec![0.0; self.feature_names.len()];
        for rule in self
            .trees
            .iter()
            .flat_map(|tree| tree.nodes())
            .filter_map(|node| node.split.as_ref())
        {
            totals[rule.feature] += rule.gain;
        }

        let mut ranked: Vec<(String, f64)> = self
            .feature_names
            .iter()
            .cloned()
            .zip(totals)
            .filter(|(_, gain)| *gain > 0.0)
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }

    /// Raw additive output (log-odds for the logistic objective).
    pub fn margin_row(&self, row: &[f64]) -> f64 {
        self.trees.iter().fold(self.base_score, |acc, tree| {
            acc + self.learning_rate * tree.predict_row(row)
        })
    }

    pub fn predict_margin(&self, matrix: &FeatureMatrix) -> Vec<f64> {
        matrix.rows().map(|row| self.margin_row(row)).collect()
    }

    /// Probability for the logistic objective, quantile estimate otherwise.
    pub fn predict(&self, matrix: &FeatureMatrix) -> Vec<f64> {
        let margins = self.predict_margin(matrix);
        match self.objective {
            Objective::Logistic { .. } => margins.into_iter().map(sigmoid).collect(),
            Objective::Quantile { .. } => margins,
        }
    }
}

fn sample_rows(n_rows: usize, subsample: f64, rng: &mut ChaCha8Rng) -> Vec<usize> {
    if subsample >= 1.0 {
        return (0..n_rows).collect();
    }

    let rows: Vec<usize> = (0..n_rows)
        .filter(|_| rng.gen::<f64>() < subsample)
        .collect();
    if rows.is_empty() {
        (0..n_rows).collect()
    } else {
        rows
    }
}

fn refit_quantile_nodes(
    tree: &mut RegressionTree,
    matrix: &FeatureMatrix,
    targets: &[f64],
    margins: &[f64],
    rows: &[usize],
    alpha: f64,
) {
    let mut residuals: Vec<Vec<f64>> = vec![Vec::new(); tree.nodes().len()];
    for &row in rows {
        let residual = targets[row] - margins[row];
        for node in tree.decision_path(matrix.row(row)) {
            residuals[node].push(residual);
        }
    }

    let values: Vec<f64> = tree
        .nodes()
        .iter()
        .zip(&residuals)
        .map(|(node, node_residuals)| {
            percentile(node_residuals, alpha * 100.0).unwrap_or(node.value)
        })
        .collect();
    tree.set_node_values(&values);
}
