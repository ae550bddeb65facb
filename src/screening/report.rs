use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use super::domain::CandidateId;
use super::evaluation::{GateHoldoutDiagnostics, RankerHoldoutDiagnostics, ScreeningMetrics};
use super::fairness::GateFairnessAudit;
use super::triage::TriageResult;

pub const TWO_STAGE_REPORT: &str = "two_stage_report.csv";
pub const FAIRNESS_REPORT: &str = "gate_fairness_report.csv";
pub const TRIAGE_DECISIONS: &str = "triage_decisions.csv";

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode report row: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRow {
    pub metric: String,
    pub value: Option<f64>,
}

impl MetricRow {
    fn new(metric: impl Into<String>, value: Option<f64>) -> Self {
        Self {
            metric: metric.into(),
            value,
        }
    }
}

/// Held-out results for one trained pair of models.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TwoStageReport {
    pub gate_threshold: f64,
    pub gate: GateHoldoutDiagnostics,
    pub ranker: RankerHoldoutDiagnostics,
    pub metrics: ScreeningMetrics,
}

impl TwoStageReport {
    pub fn rows(&self) -> Vec<MetricRow> {
        let selection = &self.metrics.selection;
        let mut rows = vec![
            MetricRow::new("gate_recall", Some(self.gate.recall)),
            MetricRow::new("gate_auc", self.gate.auc),
            MetricRow::new("gate_rejection_rate", Some(self.gate.rejection_rate)),
            MetricRow::new("gate_threshold", Some(self.gate_threshold)),
            MetricRow::new("ranker_spearman", self.ranker.spearman),
            MetricRow::new("ranker_mae", self.ranker.mae),
            MetricRow::new("contamination_rate", Some(selection.contamination_rate)),
            MetricRow::new("precision_at_k", Some(selection.precision_at_k)),
            MetricRow::new("coverage", Some(selection.coverage)),
            MetricRow::new("mean_score_selected", selection.mean_selected_score),
            MetricRow::new("min_score_selected", selection.min_selected_score),
            MetricRow::new("p10_score_selected", selection.p10_selected_score),
            MetricRow::new("k", Some(self.metrics.k_eval as f64)),
            MetricRow::new("n_test", Some(self.metrics.n_eval as f64)),
        ];

        if let Some(bootstrap) = &self.metrics.bootstrap {
            for interval in &bootstrap.intervals {
                let key = interval.metric.label();
                rows.push(MetricRow::new(format!("{key}_ci_lo"), Some(interval.low)));
                rows.push(MetricRow::new(format!("{key}_ci_hi"), Some(interval.high)));
            }
        }
        rows
    }
}

#[derive(Debug, Serialize)]
struct DecisionRow<'a> {
    id: &'a str,
    p_low: f64,
    passed_gate: bool,
    review_rank: Option<usize>,
    ranking_score: Option<f64>,
}

pub fn write_rows<W: Write, T: Serialize>(writer: W, rows: &[T]) -> Result<(), ReportError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for row in rows {
        csv_writer.serialize(row)?;
    }
    csv_writer.flush().map_err(csv::Error::from)?;
    Ok(())
}

pub fn write_decisions<W: Write>(
    writer: W,
    ids: &[CandidateId],
    triage: &TriageResult,
) -> Result<(), ReportError> {
    let mut rank = vec![None; triage.pool_size()];
    for (position, (&index, &score)) in triage
        .selected
        .iter()
        .zip(&triage.ranking_scores)
        .enumerate()
    {
        rank[index] = Some((position + 1, score));
    }

    let rows: Vec<DecisionRow<'_>> = ids
        .iter()
        .zip(&triage.p_low)
        .enumerate()
        .map(|(index, (id, &p_low))| DecisionRow {
            id: &id.0,
            p_low,
            passed_gate: triage.passed.binary_search(&index).is_ok(),
            review_rank: rank[index].map(|(position, _)| position),
            ranking_score: rank[index].map(|(_, score)| score),
        })
        .collect();
    write_rows(writer, &rows)
}

fn create(dir: &Path, name: &str) -> Result<(File, PathBuf), ReportError> {
    fs::create_dir_all(dir).map_err(|source| ReportError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = dir.join(name);
    let file = File::create(&path).map_err(|source| ReportError::Io {
        path: path.clone(),
        source,
    })?;
    Ok((file, path))
}

pub fn save_two_stage_report(dir: &Path, report: &TwoStageReport) -> Result<PathBuf, ReportError> {
    let (file, path) = create(dir, TWO_STAGE_REPORT)?;
    write_rows(file, &report.rows())?;
    info!(path = %path.display(), "two-stage report saved");
    Ok(path)
}

/// Nothing is written when every attribute was skipped.
pub fn save_fairness_report(
    dir: &Path,
    audit: &GateFairnessAudit,
) -> Result<Option<PathBuf>, ReportError> {
    if audit.rows.is_empty() {
        return Ok(None);
    }
    let (file, path) = create(dir, FAIRNESS_REPORT)?;
    write_rows(file, &audit.rows)?;
    info!(path = %path.display(), "gate fairness report saved");
    Ok(Some(path))
}

pub fn save_decisions(
    dir: &Path,
    ids: &[CandidateId],
    triage: &TriageResult,
) -> Result<PathBuf, ReportError> {
    let (file, path) = create(dir, TRIAGE_DECISIONS)?;
    write_decisions(file, ids, triage)?;
    info!(path = %path.display(), selected = triage.selected.len(), "triage decisions saved");
    Ok(path)
}
