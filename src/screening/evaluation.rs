//! Selection-quality metrics for a triaged pool.
//!
//! Everything here is measured against ground-truth scores that the triage
//! stage never saw. Bootstrap intervals resample pool positions and follow
//! selected candidates into each resample; resamples that lose the whole
//! selection are skipped rather than scored as zero.

use std::collections::HashSet;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::config::{proportional_k, ScreeningConfig};
use super::domain::{binarize, is_low, pick, FeatureMatrix};
use super::gate::{ConfusionCounts, CostMatrix};
use super::ranker::RankerModel;
use super::stats::{mean, mean_absolute_error, percentile, roc_auc, spearman};
use super::triage::{TriageResult, TriageStatus};

/// Metrics derived from one selection over one set of scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionStats {
    pub n_selected: usize,
    pub n_low_in_selected: usize,
    pub contamination_rate: f64,
    pub precision_at_k: f64,
    pub coverage: f64,
    pub mean_selected_score: Option<f64>,
    pub min_selected_score: Option<f64>,
    pub p10_selected_score: Option<f64>,
}

impl SelectionStats {
    pub fn measure(scores: &[f64], selected: &[usize], low_cutoff: f64) -> Self {
        let selected_scores = pick(scores, selected);
        let n_selected = selected_scores.len();
        let n_low_in_selected = selected_scores
            .iter()
            .filter(|&&score| is_low(score, low_cutoff))
            .count();
        let n_high_in_selected = n_selected - n_low_in_selected;
        let n_high_in_pool = scores
            .iter()
            .filter(|&&score| !is_low(score, low_cutoff))
            .count();

        // An empty selection admits no low scorer.
        let contamination_rate = if n_selected == 0 {
            0.0
        } else {
            n_low_in_selected as f64 / n_selected as f64
        };
        let precision_at_k = 1.0 - contamination_rate;

        Self {
            n_selected,
            n_low_in_selected,
            contamination_rate,
            precision_at_k,
            coverage: n_high_in_selected as f64 / n_high_in_pool.max(1) as f64,
            mean_selected_score: mean(&selected_scores),
            min_selected_score: selected_scores.iter().copied().reduce(f64::min),
            p10_selected_score: percentile(&selected_scores, 10.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    ContaminationRate,
    PrecisionAtK,
    Coverage,
    MeanSelectedScore,
    MinSelectedScore,
    P10SelectedScore,
}

impl MetricKind {
    pub const ALL: [MetricKind; 6] = [
        MetricKind::ContaminationRate,
        MetricKind::PrecisionAtK,
        MetricKind::Coverage,
        MetricKind::MeanSelectedScore,
        MetricKind::MinSelectedScore,
        MetricKind::P10SelectedScore,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            MetricKind::ContaminationRate => "contamination_rate",
            MetricKind::PrecisionAtK => "precision_at_k",
            MetricKind::Coverage => "coverage",
            MetricKind::MeanSelectedScore => "mean_score_selected",
            MetricKind::MinSelectedScore => "min_score_selected",
            MetricKind::P10SelectedScore => "p10_score_selected",
        }
    }

    pub fn value(self, stats: &SelectionStats) -> Option<f64> {
        match self {
            MetricKind::ContaminationRate => Some(stats.contamination_rate),
            MetricKind::PrecisionAtK => Some(stats.precision_at_k),
            MetricKind::Coverage => Some(stats.coverage),
            MetricKind::MeanSelectedScore => stats.mean_selected_score,
            MetricKind::MinSelectedScore => stats.min_selected_score,
            MetricKind::P10SelectedScore => stats.p10_selected_score,
        }
    }
}

/// Bootstrap mean with the 2.5th and 97.5th percentiles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricInterval {
    pub metric: MetricKind,
    pub mean: f64,
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapSummary {
    pub resamples_used: usize,
    pub resamples_skipped: usize,
    pub intervals: Vec<MetricInterval>,
}

impl BootstrapSummary {
    pub fn interval(&self, metric: MetricKind) -> Option<&MetricInterval> {
        self.intervals
            .iter()
            .find(|interval| interval.metric == metric)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningMetrics {
    pub n_eval: usize,
    pub k_eval: usize,
    pub selection: SelectionStats,
    pub gate_rejection_rate: f64,
    pub n_passed_gate: usize,
    pub status: TriageStatus,
    /// `None` when every bootstrap resample lost the selection.
    pub bootstrap: Option<BootstrapSummary>,
}

pub struct ScreeningEvaluator {
    low_cutoff: f64,
    production_pool_size: usize,
    production_k: usize,
    resamples: usize,
    seed: u64,
}

impl ScreeningEvaluator {
    pub fn new(config: &ScreeningConfig) -> Self {
        Self {
            low_cutoff: config.low_cutoff(),
            production_pool_size: config.production_pool_size,
            production_k: config.production_k,
            resamples: config.bootstrap_resamples,
            seed: config.seed,
        }
    }

    pub fn k_for(&self, pool_size: usize) -> usize {
        proportional_k(self.production_k, pool_size, self.production_pool_size)
    }

    pub fn evaluate(&self, scores: &[f64], triage: &TriageResult) -> ScreeningMetrics {
        let n_eval = scores.len();
        let k_eval = self.k_for(n_eval);
        let selected: Vec<usize> = triage.selected.iter().take(k_eval).copied().collect();
        let selection = SelectionStats::measure(scores, &selected, self.low_cutoff);
        let bootstrap = self.bootstrap(scores, &selected, k_eval);

        info!(
            n_eval,
            k_eval,
            n_selected = selection.n_selected,
            contamination_rate = selection.contamination_rate,
            precision_at_k = selection.precision_at_k,
            coverage = selection.coverage,
            "screening evaluation complete"
        );

        ScreeningMetrics {
            n_eval,
            k_eval,
            selection,
            gate_rejection_rate: triage.rejection_rate,
            n_passed_gate: triage.n_passed(),
            status: triage.status,
            bootstrap,
        }
    }

    /// Resample pool positions with replacement and follow the selection.
    pub fn bootstrap(
        &self,
        scores: &[f64],
        selected: &[usize],
        k_eval: usize,
    ) -> Option<BootstrapSummary> {
        let n = scores.len();
        if n == 0 || self.resamples == 0 {
            return None;
        }

        let chosen: HashSet<usize> = selected.iter().copied().collect();
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut samples: Vec<SelectionStats> = Vec::with_capacity(self.resamples);
        let mut skipped = 0;

        for _ in 0..self.resamples {
            let draw: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            let remapped: Vec<usize> = draw
                .iter()
                .enumerate()
                .filter(|(_, original)| chosen.contains(*original))
                .map(|(position, _)| position)
                .take(k_eval)
                .collect();

            if remapped.is_empty() {
                skipped += 1;
                continue;
            }

            let resampled_scores = pick(scores, &draw);
            samples.push(SelectionStats::measure(
                &resampled_scores,
                &remapped,
                self.low_cutoff,
            ));
        }

        if samples.is_empty() {
            warn!(
                resamples = self.resamples,
                "every bootstrap resample lost the selection; intervals omitted"
            );
            return None;
        }
        debug!(used = samples.len(), skipped, "bootstrap resampling done");

        let intervals = MetricKind::ALL
            .iter()
            .filter_map(|&metric| {
                let values: Vec<f64> = samples
                    .iter()
                    .filter_map(|stats| metric.value(stats))
                    .collect();
                Some(MetricInterval {
                    metric,
                    mean: mean(&values)?,
                    low: percentile(&values, 2.5)?,
                    high: percentile(&values, 97.5)?,
                })
            })
            .collect();

        Some(BootstrapSummary {
            resamples_used: samples.len(),
            resamples_skipped: skipped,
            intervals,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MajorityBaseline {
    pub majority_bucket: u8,
    pub accuracy: f64,
    pub n: usize,
}

/// Accuracy of always predicting the most common bucket (smallest on ties).
pub fn majority_bucket_baseline(buckets: &[u8]) -> Option<MajorityBaseline> {
    let mut counts = [0usize; 256];
    for &bucket in buckets {
        counts[usize::from(bucket)] += 1;
    }

    let (majority, &count) = counts
        .iter()
        .enumerate()
        .rev()
        .max_by_key(|(_, &count)| count)?;
    if count == 0 {
        return None;
    }

    Some(MajorityBaseline {
        majority_bucket: majority as u8,
        accuracy: count as f64 / buckets.len() as f64,
        n: buckets.len(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryBaseline {
    pub n_low: usize,
    pub n_high: usize,
    pub low_share: f64,
    pub majority_accuracy: f64,
}

pub fn binary_baseline(scores: &[f64], low_cutoff: f64) -> BinaryBaseline {
    let n_low = binarize(scores, low_cutoff).into_iter().filter(|&low| low).count();
    let n_high = scores.len() - n_low;
    let total = scores.len().max(1) as f64;

    BinaryBaseline {
        n_low,
        n_high,
        low_share: n_low as f64 / total,
        majority_accuracy: n_low.max(n_high) as f64 / total,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureAuc {
    pub feature: String,
    pub auc: f64,
}

/// Features ranked by how well each one alone separates low scorers.
///
/// AUCs are folded to `max(auc, 1 - auc)`; constant columns are skipped.
pub fn single_feature_baselines(
    matrix: &FeatureMatrix,
    labels: &[bool],
    top_n: usize,
) -> Vec<FeatureAuc> {
    let mut results: Vec<FeatureAuc> = (0..matrix.n_features())
        .filter_map(|feature| {
            let column = matrix.column(feature);
            let first = *column.first()?;
            if column.iter().all(|&value| value == first) {
                return None;
            }
            let auc = roc_auc(labels, &column)?;
            Some(FeatureAuc {
                feature: matrix.feature_names()[feature].clone(),
                auc: auc.max(1.0 - auc),
            })
        })
        .collect();

    results.sort_by(|a, b| b.auc.total_cmp(&a.auc));
    results.truncate(top_n);
    results
}

/// Gate performance on the held-out cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateHoldoutDiagnostics {
    pub recall: f64,
    pub auc: Option<f64>,
    pub gain: f64,
    pub rejection_rate: f64,
    pub counts: ConfusionCounts,
}

impl GateHoldoutDiagnostics {
    pub fn measure(
        p_low: &[f64],
        threshold: f64,
        scores: &[f64],
        low_cutoff: f64,
        cost: &CostMatrix,
    ) -> Self {
        let labels = binarize(scores, low_cutoff);
        let counts = ConfusionCounts::tally(&labels, p_low.iter().map(|&p| p >= threshold));
        Self {
            recall: counts.recall(),
            auc: roc_auc(&labels, p_low),
            gain: cost.gain(&counts),
            rejection_rate: counts.flagged_rate(),
            counts,
        }
    }
}

/// Ranker agreement with true scores among held-out high scorers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankerHoldoutDiagnostics {
    pub n_high: usize,
    pub spearman: Option<f64>,
    pub mae: Option<f64>,
}

impl RankerHoldoutDiagnostics {
    pub fn measure(ranker: &RankerModel, matrix: &FeatureMatrix, scores: &[f64]) -> Self {
        let high: Vec<usize> = scores
            .iter()
            .enumerate()
            .filter(|(_, &score)| score > ranker.cutoff())
            .map(|(index, _)| index)
            .collect();
        let actual = pick(scores, &high);
        let predicted = ranker.predict(&matrix.select_rows(&high));

        Self {
            n_high: high.len(),
            spearman: spearman(&actual, &predicted),
            mae: mean_absolute_error(&actual, &predicted),
        }
    }
}
