//! Safety gate: calibrated low-score classifier with a recall-constrained threshold.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::boosting::{BoostError, BoostedEnsemble, EvalSet, Objective};
use super::calibration::{log_loss, CalibrationError, PlattCalibrator};
use super::config::{GateParams, ScreeningConfig};
use super::domain::{binarize, pick, FeatureMatrix};
use super::split::{three_way_split, SplitError, SplitSizes};
use super::stats::roc_auc;

/// Confusion-matrix weights for "flag as low" decisions.
///
/// Positive class is the low scorer: a true positive is a low scorer the gate
/// rejects, a false negative is a low scorer it lets through.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostMatrix {
    pub true_positive: f64,
    pub false_negative: f64,
    pub false_positive: f64,
    pub true_negative: f64,
}

impl CostMatrix {
    pub fn gain(&self, counts: &ConfusionCounts) -> f64 {
        self.true_positive * counts.true_positive as f64
            + self.false_negative * counts.false_negative as f64
            + self.false_positive * counts.false_positive as f64
            + self.true_negative * counts.true_negative as f64
    }
}

impl Default for CostMatrix {
    fn default() -> Self {
        Self {
            true_positive: 1.0,
            false_negative: -10.0,
            false_positive: -1.0,
            true_negative: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionCounts {
    pub true_positive: usize,
    pub false_negative: usize,
    pub false_positive: usize,
    pub true_negative: usize,
}

impl ConfusionCounts {
    pub fn tally(labels: &[bool], flagged: impl IntoIterator<Item = bool>) -> Self {
        let mut counts = Self::default();
        for (&actual, predicted) in labels.iter().zip(flagged) {
            match (actual, predicted) {
                (true, true) => counts.true_positive += 1,
                (true, false) => counts.false_negative += 1,
                (false, true) => counts.false_positive += 1,
                (false, false) => counts.true_negative += 1,
            }
        }
        counts
    }

    /// Recall of the low class; 0 when there are no low scorers.
    pub fn recall(&self) -> f64 {
        let positives = self.true_positive + self.false_negative;
        if positives == 0 {
            return 0.0;
        }
        self.true_positive as f64 / positives as f64
    }

    pub fn flagged_rate(&self) -> f64 {
        let total =
            self.true_positive + self.false_negative + self.false_positive + self.true_negative;
        if total == 0 {
            return 0.0;
        }
        (self.true_positive + self.false_positive) as f64 / total as f64
    }
}

/// Candidate thresholds `start, start + step, ...` strictly below `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdGrid {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl ThresholdGrid {
    pub fn values(&self) -> Vec<f64> {
        if self.step <= 0.0 || self.stop <= self.start {
            return vec![self.start];
        }

        let count = ((self.stop - self.start) / self.step - 1e-6).ceil() as usize;
        (0..count)
            .map(|index| {
                let raw = self.start + index as f64 * self.step;
                (raw * 1e9).round() / 1e9
            })
            .collect()
    }
}

impl Default for ThresholdGrid {
    fn default() -> Self {
        Self {
            start: 0.01,
            stop: 0.50,
            step: 0.005,
        }
    }
}

/// Outcome of the threshold sweep on the holdout split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdChoice {
    pub threshold: f64,
    pub recall: f64,
    pub gain: f64,
    pub counts: ConfusionCounts,
    pub recall_target_met: bool,
}

/// Pick the highest-gain threshold whose recall meets `recall_target`.
///
/// Earlier (smaller) thresholds win ties. When no threshold qualifies the
/// smallest tested threshold is returned with `recall_target_met == false`.
pub fn sweep_thresholds(
    p_low: &[f64],
    labels: &[bool],
    grid: &ThresholdGrid,
    recall_target: f64,
    cost: &CostMatrix,
) -> ThresholdChoice {
    let candidates = grid.values();
    let evaluate = |threshold: f64| {
        let counts = ConfusionCounts::tally(labels, p_low.iter().map(|&p| p >= threshold));
        ThresholdChoice {
            threshold,
            recall: counts.recall(),
            gain: cost.gain(&counts),
            counts,
            recall_target_met: counts.recall() >= recall_target,
        }
    };

    let mut best: Option<ThresholdChoice> = None;
    for &threshold in &candidates {
        let choice = evaluate(threshold);
        if !choice.recall_target_met {
            continue;
        }
        if best.map(|current| choice.gain > current.gain).unwrap_or(true) {
            best = Some(choice);
        }
    }

    match best {
        Some(choice) => choice,
        None => {
            let fallback = candidates.first().copied().unwrap_or(grid.start);
            warn!(
                recall_target,
                fallback, "no threshold reached the recall target; using the most conservative threshold"
            );
            evaluate(fallback)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("degenerate gate split: {0}")]
    DegenerateSplit(#[from] SplitError),
    #[error("gate classifier could not be fitted: {0}")]
    Classifier(#[from] BoostError),
    #[error("gate calibration failed: {0}")]
    Calibration(#[from] CalibrationError),
    #[error("{rows} feature rows but {scores} scores")]
    LengthMismatch { rows: usize, scores: usize },
}

/// Fit-time diagnostics, all measured on the threshold holdout unless noted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDiagnostics {
    pub threshold_recall: f64,
    pub threshold_gain: f64,
    pub threshold_auc: Option<f64>,
    pub threshold_counts: ConfusionCounts,
    pub recall_target: f64,
    pub recall_target_met: bool,
    pub positive_weight: f64,
    /// Log-loss of calibrated probabilities on the calibration split.
    pub calibration_log_loss: f64,
    /// Raw classifier loss on the calibration split after the final round.
    pub monitor_loss: Option<f64>,
    pub split_sizes: SplitSizes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateModel {
    classifier: BoostedEnsemble,
    calibrator: PlattCalibrator,
    threshold: f64,
    diagnostics: GateDiagnostics,
}

impl GateModel {
    pub fn classifier(&self) -> &BoostedEnsemble {
        &self.classifier
    }

    pub fn calibrator(&self) -> &PlattCalibrator {
        &self.calibrator
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn diagnostics(&self) -> &GateDiagnostics {
        &self.diagnostics
    }

    /// Calibrated probability that each row is a low scorer.
    pub fn p_low(&self, matrix: &FeatureMatrix) -> Vec<f64> {
        self.calibrator
            .transform(&self.classifier.predict_margin(matrix))
    }

    pub fn rejects(&self, p_low: f64) -> bool {
        p_low >= self.threshold
    }
}

pub struct SafetyGateTrainer {
    low_score_threshold: f64,
    recall_target: f64,
    params: GateParams,
    cost: CostMatrix,
    grid: ThresholdGrid,
    seed: u64,
}

impl SafetyGateTrainer {
    pub fn new(config: &ScreeningConfig) -> Self {
        Self {
            low_score_threshold: config.low_cutoff(),
            recall_target: config.recall_target,
            params: config.gate.clone(),
            cost: config.cost,
            grid: ThresholdGrid::default(),
            seed: config.seed,
        }
    }

    pub fn with_grid(mut self, grid: ThresholdGrid) -> Self {
        self.grid = grid;
        self
    }

    pub fn fit(&self, matrix: &FeatureMatrix, scores: &[f64]) -> Result<GateModel, GateError> {
        if matrix.n_rows() != scores.len() {
            return Err(GateError::LengthMismatch {
                rows: matrix.n_rows(),
                scores: scores.len(),
            });
        }

        let labels = binarize(scores, self.low_score_threshold);
        let splits = three_way_split(&labels, self.seed)?;
        info!(
            train_core = splits.core.len(),
            calibration = splits.calibration.len(),
            threshold = splits.threshold.len(),
            "gate split"
        );

        let core_labels = pick(&labels, &splits.core);
        let n_low = core_labels.iter().filter(|&&low| low).count();
        let n_high = core_labels.len() - n_low;
        let positive_weight = (n_high as f64 / n_low as f64) * self.params.positive_weight_multiplier;

        let core_matrix = matrix.select_rows(&splits.core);
        let calibration_matrix = matrix.select_rows(&splits.calibration);
        let calibration_labels = pick(&labels, &splits.calibration);
        let calibration_targets = as_targets(&calibration_labels);

        let fit = BoostedEnsemble::fit_monitored(
            &core_matrix,
            &as_targets(&core_labels),
            &self.params.boost_params(self.seed),
            Objective::Logistic { positive_weight },
            Some(EvalSet {
                matrix: &calibration_matrix,
                targets: &calibration_targets,
            }),
        )?;
        let classifier = fit.ensemble;

        let calibration_margins = classifier.predict_margin(&calibration_matrix);
        let calibrator = PlattCalibrator::fit(&calibration_margins, &calibration_labels)?;
        let calibration_log_loss = log_loss(
            &calibrator.transform(&calibration_margins),
            &calibration_labels,
        );

        let threshold_matrix = matrix.select_rows(&splits.threshold);
        let threshold_labels = pick(&labels, &splits.threshold);
        let threshold_p_low = calibrator.transform(&classifier.predict_margin(&threshold_matrix));
        let choice = sweep_thresholds(
            &threshold_p_low,
            &threshold_labels,
            &self.grid,
            self.recall_target,
            &self.cost,
        );

        info!(
            threshold = choice.threshold,
            recall = choice.recall,
            gain = choice.gain,
            positive_weight,
            "gate threshold selected"
        );

        let diagnostics = GateDiagnostics {
            threshold_recall: choice.recall,
            threshold_gain: choice.gain,
            threshold_auc: roc_auc(&threshold_labels, &threshold_p_low),
            threshold_counts: choice.counts,
            recall_target: self.recall_target,
            recall_target_met: choice.recall_target_met,
            positive_weight,
            calibration_log_loss,
            monitor_loss: fit.eval_loss.last().copied(),
            split_sizes: splits.sizes(),
        };

        Ok(GateModel {
            classifier,
            calibrator,
            threshold: choice.threshold,
            diagnostics,
        })
    }
}

fn as_targets(labels: &[bool]) -> Vec<f64> {
    labels
        .iter()
        .map(|&low| if low { 1.0 } else { 0.0 })
        .collect()
}
