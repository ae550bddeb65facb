//! Feature attribution for fitted gate and ranker models.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::boosting::BoostedEnsemble;
use super::domain::FeatureMatrix;
use super::gate::GateModel;
use super::ranker::RankerModel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureAttribution {
    pub feature: String,
    /// Mean absolute attribution over the explained rows.
    pub mean_abs: f64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExplainError {
    #[error("{explainer} cannot explain a {model} model")]
    Unsupported {
        explainer: &'static str,
        model: &'static str,
    },
    #[error("model expects {expected} features, matrix has {found}")]
    FeatureCount { expected: usize, found: usize },
    #[error("no rows to explain")]
    EmptyMatrix,
}

/// A fitted model handed to an explainer.
#[derive(Debug, Clone, Copy)]
pub enum TrainedModel<'a> {
    Classifier(&'a GateModel),
    Regressor(&'a RankerModel),
}

impl<'a> TrainedModel<'a> {
    pub const fn kind(&self) -> &'static str {
        match self {
            TrainedModel::Classifier(_) => "classifier",
            TrainedModel::Regressor(_) => "regressor",
        }
    }

    /// Trees whose decision paths can be walked, when the model exposes them.
    pub fn tree_ensemble(&self) -> Option<&'a BoostedEnsemble> {
        match *self {
            TrainedModel::Classifier(gate) => Some(gate.classifier()),
            TrainedModel::Regressor(ranker) => Some(ranker.regressor()),
        }
    }

    pub fn feature_names(&self) -> &'a [String] {
        match *self {
            TrainedModel::Classifier(gate) => gate.classifier().feature_names(),
            TrainedModel::Regressor(ranker) => ranker.regressor().feature_names(),
        }
    }

    /// Model output in its serving units: `p_low` or the ranking score.
    pub fn predict(&self, matrix: &FeatureMatrix) -> Vec<f64> {
        match self {
            TrainedModel::Classifier(gate) => gate.p_low(matrix),
            TrainedModel::Regressor(ranker) => ranker.predict(matrix),
        }
    }
}

pub trait Explainer {
    fn name(&self) -> &'static str;

    fn explain(
        &self,
        model: TrainedModel<'_>,
        matrix: &FeatureMatrix,
    ) -> Result<Vec<FeatureAttribution>, ExplainError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplainerKind {
    TreePath,
    Permutation,
}

/// Pick the exact path explainer when the model exposes its trees and the
/// caller did not ask for sampling.
pub fn select_explainer(
    model: TrainedModel<'_>,
    requested: Option<ExplainerKind>,
    seed: u64,
) -> Box<dyn Explainer> {
    match (requested, model.tree_ensemble()) {
        (Some(ExplainerKind::Permutation), _) | (_, None) => {
            Box::new(PermutationExplainer::new(seed))
        }
        _ => Box::new(TreePathExplainer),
    }
}

/// Path attribution: every split on a row's decision path credits its feature
/// with the change in node value from parent to child. Contributions plus the
/// ensemble base score add up to the raw margin.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreePathExplainer;

impl TreePathExplainer {
    pub fn contributions(ensemble: &BoostedEnsemble, row: &[f64]) -> Vec<f64> {
        let mut contributions = vec![0.0; ensemble.feature_names().len()];
        for tree in ensemble.trees() {
            let nodes = tree.nodes();
            let path = tree.decision_path(row);
            for step in path.windows(2) {
                let (parent, child) = (&nodes[step[0]], &nodes[step[1]]);
                if let Some(rule) = &parent.split {
                    contributions[rule.feature] +=
                        ensemble.learning_rate() * (child.value - parent.value);
                }
            }
        }
        contributions
    }

    /// Root values are the part of each tree no feature accounts for.
    pub fn expected_margin(ensemble: &BoostedEnsemble) -> f64 {
        ensemble.trees().iter().fold(ensemble.base_score(), |acc, tree| {
            acc + ensemble.learning_rate() * tree.nodes()[0].value
        })
    }
}

impl Explainer for TreePathExplainer {
    fn name(&self) -> &'static str {
        "tree_path"
    }

    fn explain(
        &self,
        model: TrainedModel<'_>,
        matrix: &FeatureMatrix,
    ) -> Result<Vec<FeatureAttribution>, ExplainError> {
        let ensemble = model.tree_ensemble().ok_or(ExplainError::Unsupported {
            explainer: self.name(),
            model: model.kind(),
        })?;
        check_shape(model, matrix)?;

        let mut totals = vec![0.0; matrix.n_features()];
        for row in matrix.rows() {
            for (total, contribution) in totals.iter_mut().zip(Self::contributions(ensemble, row)) {
                *total += contribution.abs();
            }
        }

        Ok(rank(model.feature_names(), totals, matrix.n_rows()))
    }
}

/// Model-agnostic attribution from the mean absolute change in output when
/// one column is shuffled.
#[derive(Debug, Clone, Copy)]
pub struct PermutationExplainer {
    seed: u64,
    repeats: usize,
}

impl PermutationExplainer {
    pub fn new(seed: u64) -> Self {
        Self { seed, repeats: 5 }
    }

    pub fn with_repeats(mut self, repeats: usize) -> Self {
        self.repeats = repeats.max(1);
        self
    }
}

impl Explainer for PermutationExplainer {
    fn name(&self) -> &'static str {
        "permutation"
    }

    fn explain(
        &self,
        model: TrainedModel<'_>,
        matrix: &FeatureMatrix,
    ) -> Result<Vec<FeatureAttribution>, ExplainError> {
        check_shape(model, matrix)?;

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let baseline = model.predict(matrix);
        let mut totals = vec![0.0; matrix.n_features()];

        for (feature, total) in totals.iter_mut().enumerate() {
            for _ in 0..self.repeats {
                let mut column = matrix.column(feature);
                column.shuffle(&mut rng);
                let shuffled = model.predict(&matrix.with_column(feature, &column));
                *total += baseline
                    .iter()
                    .zip(&shuffled)
                    .map(|(before, after)| (after - before).abs())
                    .sum::<f64>();
            }
            *total /= self.repeats as f64;
        }

        Ok(rank(model.feature_names(), totals, matrix.n_rows()))
    }
}

fn check_shape(model: TrainedModel<'_>, matrix: &FeatureMatrix) -> Result<(), ExplainError> {
    if matrix.is_empty() {
        return Err(ExplainError::EmptyMatrix);
    }
    let expected = model.feature_names().len();
    if matrix.n_features() != expected {
        return Err(ExplainError::FeatureCount {
            expected,
            found: matrix.n_features(),
        });
    }
    Ok(())
}

fn rank(names: &[String], totals: Vec<f64>, n_rows: usize) -> Vec<FeatureAttribution> {
    let mut attributions: Vec<FeatureAttribution> = names
        .iter()
        .zip(totals)
        .map(|(name, total)| FeatureAttribution {
            feature: name.clone(),
            mean_abs: total / n_rows as f64,
        })
        .collect();
    attributions.sort_by(|a, b| b.mean_abs.total_cmp(&a.mean_abs));
    attributions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screening::config::ScreeningConfig;
    use crate::screening::ranker::QualityRanker;

    fn fitted_ranker() -> (RankerModel, FeatureMatrix) {
        let rows: Vec<Vec<f64>> = (0..80)
            .map(|i| vec![15.0 + i as f64 * 0.1, ((i * 13) % 7) as f64])
            .collect();
        let scores: Vec<f64> = rows.iter().map(|row| row[0]).collect();
        let matrix =
            FeatureMatrix::from_rows(vec!["signal".into(), "noise".into()], rows).expect("matrix");

        let mut config = ScreeningConfig::default();
        config.ranker.n_estimators = 40;
        config.ranker.max_depth = 2;
        let model = QualityRanker::new(&config)
            .fit(&matrix, &scores)
            .expect("ranker trains");
        (model, matrix)
    }

    #[test]
    fn path_contributions_sum_to_the_margin() {
        let (model, matrix) = fitted_ranker();
        let ensemble = model.regressor();
        let row = matrix.row(17);

        let total: f64 = TreePathExplainer::contributions(ensemble, row).iter().sum();
        let rebuilt = TreePathExplainer::expected_margin(ensemble) + total;
        assert!((rebuilt - ensemble.margin_row(row)).abs() < 1e-9);
    }

    #[test]
    fn both_explainers_rank_the_signal_first() {
        let (model, matrix) = fitted_ranker();
        let target = TrainedModel::Regressor(&model);

        for explainer in [
            select_explainer(target, None, 7),
            select_explainer(target, Some(ExplainerKind::Permutation), 7),
        ] {
            let ranked = explainer.explain(target, &matrix).expect("explains");
            assert_eq!(ranked.len(), 2);
            assert_eq!(ranked[0].feature, "signal", "{}", explainer.name());
            assert!(ranked[0].mean_abs >= ranked[1].mean_abs);
        }
    }

    #[test]
    fn permutation_attribution_is_seeded() {
        let (model, matrix) = fitted_ranker();
        let target = TrainedModel::Regressor(&model);
        let first = PermutationExplainer::new(3).explain(target, &matrix).expect("explains");
        let second = PermutationExplainer::new(3).explain(target, &matrix).expect("explains");
        assert_eq!(first, second);
    }

    #[test]
    fn mismatched_columns_are_rejected() {
        let (model, _) = fitted_ranker();
        let narrow = FeatureMatrix::from_rows(vec!["signal".into()], vec![vec![16.0]]).expect("matrix");

        match TreePathExplainer.explain(TrainedModel::Regressor(&model), &narrow) {
            Err(ExplainError::FeatureCount { expected, found }) => {
                assert_eq!((expected, found), (2, 1));
            }
            other => panic!("expected feature count error, got {other:?}"),
        }
    }
}
