use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::domain::{FeatureMatrix, ShapeError};
use super::gate::GateModel;
use super::ranker::RankerModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageStatus {
    /// The quota was filled from gate survivors.
    Filled,
    /// Fewer survivors than the quota; every survivor was selected.
    QuotaUnmet,
    /// The gate rejected the whole pool.
    NonePassed,
}

impl TriageStatus {
    pub const fn label(self) -> &'static str {
        match self {
            TriageStatus::Filled => "filled",
            TriageStatus::QuotaUnmet => "quota_unmet",
            TriageStatus::NonePassed => "none_passed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageResult {
    /// Pool indices in review order.
    pub selected: Vec<usize>,
    /// Ranker score for each entry of `selected`.
    pub ranking_scores: Vec<f64>,
    /// Gate probability for every pool member.
    pub p_low: Vec<f64>,
    /// Pool indices that passed the gate, ascending.
    pub passed: Vec<usize>,
    pub rejection_rate: f64,
    pub status: TriageStatus,
    pub requested_k: usize,
}

impl TriageResult {
    pub fn pool_size(&self) -> usize {
        self.p_low.len()
    }

    pub fn n_passed(&self) -> usize {
        self.passed.len()
    }
}

pub struct TriageEngine<'a> {
    gate: &'a GateModel,
    ranker: &'a RankerModel,
}

impl<'a> TriageEngine<'a> {
    pub fn new(gate: &'a GateModel, ranker: &'a RankerModel) -> Self {
        Self { gate, ranker }
    }

    /// Pool columns are matched to each model by name. Extra columns are
    /// ignored and missing ones are an error.
    pub fn triage(&self, pool: &FeatureMatrix, k: usize) -> Result<TriageResult, ShapeError> {
        let gate_view = pool.align_to(self.gate.classifier().feature_names())?;
        let ranker_view = pool.align_to(self.ranker.regressor().feature_names())?;

        let p_low = self.gate.p_low(&gate_view);
        Ok(select(p_low, self.gate.threshold(), k, |passed| {
            self.ranker.predict(&ranker_view.select_rows(passed))
        }))
    }
}

/// Gate the pool on `p_low < threshold` and take the top `k` survivors.
///
/// `rank` receives the surviving pool indices and returns one score per index.
/// Ties keep pool order.
pub fn select<F>(p_low: Vec<f64>, threshold: f64, k: usize, rank: F) -> TriageResult
where
    F: FnOnce(&[usize]) -> Vec<f64>,
{
    let pool_size = p_low.len();
    let passed: Vec<usize> = p_low
        .iter()
        .enumerate()
        .filter(|(_, &p)| p < threshold)
        .map(|(index, _)| index)
        .collect();

    let rejection_rate = if pool_size == 0 {
        0.0
    } else {
        1.0 - passed.len() as f64 / pool_size as f64
    };

    if passed.is_empty() {
        warn!(pool_size, threshold, "gate rejected every candidate in the pool");
        return TriageResult {
            selected: Vec::new(),
            ranking_scores: Vec::new(),
            p_low,
            passed,
            rejection_rate: 1.0,
            status: TriageStatus::NonePassed,
            requested_k: k,
        };
    }

    let scores = rank(&passed);
    let mut order: Vec<usize> = (0..passed.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(passed[a].cmp(&passed[b])));

    let status = if passed.len() < k {
        warn!(
            n_passed = passed.len(),
            requested_k = k,
            "fewer candidates passed the gate than the review quota"
        );
        TriageStatus::QuotaUnmet
    } else {
        TriageStatus::Filled
    };

    order.truncate(k);
    let selected: Vec<usize> = order.iter().map(|&position| passed[position]).collect();
    let ranking_scores: Vec<f64> = order.iter().map(|&position| scores[position]).collect();

    info!(
        pool_size,
        n_passed = passed.len(),
        n_selected = selected.len(),
        rejection_rate,
        status = status.label(),
        "triage complete"
    );

    TriageResult {
        selected,
        ranking_scores,
        p_low,
        passed,
        rejection_rate,
        status,
        requested_k: k,
    }
}
