//! End-to-end training run: load, baseline, fit, triage, evaluate, audit.
//!
//! A run owns nothing global. Everything it needs arrives through a
//! [`PipelineContext`] and everything it produces is returned in a
//! [`PipelineOutcome`]. Progress checkpoints go to the caller's
//! [`ProgressSink`].

use std::fmt;
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use super::artifact::{ArtifactBundle, ArtifactError, TrainingMetadata};
use super::config::ScreeningConfig;
use super::domain::{binarize, FeatureBundle, ShapeError};
use super::evaluation::{
    binary_baseline, majority_bucket_baseline, single_feature_baselines, BinaryBaseline,
    FeatureAuc, GateHoldoutDiagnostics, MajorityBaseline, RankerHoldoutDiagnostics,
    ScreeningEvaluator,
};
use super::explain::{select_explainer, ExplainerKind, FeatureAttribution, TrainedModel};
use super::fairness::{GateFairnessAudit, GateFairnessAuditor};
use super::gate::{GateError, GateModel, SafetyGateTrainer};
use super::provider::{FeatureMatrixProvider, ProviderError};
use super::ranker::{QualityRanker, RankerError, RankerModel};
use super::report::{save_fairness_report, save_two_stage_report, ReportError, TwoStageReport};
use super::split::SplitError;
use super::triage::{TriageEngine, TriageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    LoadFeatures,
    Baselines,
    TrainGate,
    TrainRanker,
    Triage,
    Evaluate,
    FairnessAudit,
    Explain,
    SaveArtifacts,
    Complete,
}

impl PipelineStep {
    pub const fn label(self) -> &'static str {
        match self {
            PipelineStep::LoadFeatures => "load_features",
            PipelineStep::Baselines => "baselines",
            PipelineStep::TrainGate => "train_gate",
            PipelineStep::TrainRanker => "train_ranker",
            PipelineStep::Triage => "triage",
            PipelineStep::Evaluate => "evaluate",
            PipelineStep::FairnessAudit => "fairness_audit",
            PipelineStep::Explain => "explain",
            PipelineStep::SaveArtifacts => "save_artifacts",
            PipelineStep::Complete => "complete",
        }
    }

    /// Share of the run finished once this step completes.
    pub const fn progress_pct(self) -> u8 {
        match self {
            PipelineStep::LoadFeatures => 5,
            PipelineStep::Baselines => 10,
            PipelineStep::TrainGate => 35,
            PipelineStep::TrainRanker => 55,
            PipelineStep::Triage => 60,
            PipelineStep::Evaluate => 75,
            PipelineStep::FairnessAudit => 85,
            PipelineStep::Explain => 92,
            PipelineStep::SaveArtifacts => 98,
            PipelineStep::Complete => 100,
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub trait ProgressSink {
    fn checkpoint(&mut self, step: PipelineStep, pct: u8);
}

/// Logs each checkpoint.
#[derive(Debug, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn checkpoint(&mut self, step: PipelineStep, pct: u8) {
        info!(step = step.label(), pct, "pipeline checkpoint");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Ranker(#[from] RankerError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// A failed run: the step it died in plus a message fit for end users.
#[derive(Debug, thiserror::Error)]
#[error("pipeline failed during {step}: {message}")]
pub struct PipelineFailure {
    pub step: PipelineStep,
    pub message: String,
    #[source]
    pub source: StageError,
}

impl PipelineFailure {
    fn new(step: PipelineStep, source: StageError) -> Self {
        Self {
            step,
            message: translate_error(step, &source),
            source,
        }
    }
}

const MAX_DETAIL_CHARS: usize = 200;

/// Friendly message for known failure shapes, a truncated generic one otherwise.
pub fn translate_error(step: PipelineStep, error: &StageError) -> String {
    match error {
        StageError::Provider(ProviderError::MissingColumn(column)) => {
            format!("The feature file is missing the required '{column}' column.")
        }
        StageError::Provider(ProviderError::Io { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            "A required data file was not found.".to_owned()
        }
        StageError::Provider(ProviderError::Shape(err)) => {
            format!("The loaded feature data is inconsistent: {err}.")
        }
        StageError::Provider(ProviderError::TemporalLeak { .. }) => {
            "Training cohorts must all come before the evaluation cohort.".to_owned()
        }
        StageError::Gate(GateError::DegenerateSplit(SplitError::Degenerate { .. })) => {
            "There are too few low-scoring candidates in the training cohorts to train the safety gate."
                .to_owned()
        }
        StageError::Ranker(RankerError::EmptyTrainingSet { .. }) => {
            "No training candidates scored above the low-score cutoff, so the ranker cannot be trained."
                .to_owned()
        }
        other => {
            let detail: String = other.to_string().chars().take(MAX_DETAIL_CHARS).collect();
            format!("Pipeline error during {step}: {detail}")
        }
    }
}

/// Caller-owned state for one run.
pub struct PipelineContext<'a> {
    pub config: ScreeningConfig,
    /// Where the bundle and CSV reports go; nothing is written when `None`.
    pub output_dir: Option<PathBuf>,
    pub explainer: Option<ExplainerKind>,
    pub top_features: usize,
    pub environment: String,
    progress: &'a mut dyn ProgressSink,
}

impl<'a> PipelineContext<'a> {
    pub fn new(config: ScreeningConfig, progress: &'a mut dyn ProgressSink) -> Self {
        Self {
            config,
            output_dir: None,
            explainer: None,
            top_features: 5,
            environment: "development".to_owned(),
            progress,
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    fn checkpoint(&mut self, step: PipelineStep) {
        self.progress.checkpoint(step, step.progress_pct());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Baselines {
    pub majority_bucket: Option<MajorityBaseline>,
    pub binary: BinaryBaseline,
    pub top_features: Vec<FeatureAuc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavedArtifacts {
    pub bundle: PathBuf,
    pub digest: String,
    pub two_stage_report: PathBuf,
    pub fairness_report: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub baselines: Baselines,
    pub gate: GateModel,
    pub ranker: RankerModel,
    pub triage: TriageResult,
    pub report: TwoStageReport,
    pub fairness: GateFairnessAudit,
    pub gate_features: Vec<FeatureAttribution>,
    pub ranker_features: Vec<FeatureAttribution>,
    pub saved: Option<SavedArtifacts>,
}

pub fn run(
    ctx: &mut PipelineContext<'_>,
    provider: &dyn FeatureMatrixProvider,
) -> Result<PipelineOutcome, PipelineFailure> {
    let bundle = provider
        .load()
        .map_err(|err| PipelineFailure::new(PipelineStep::LoadFeatures, err.into()))?;
    check_bundle(&bundle)?;
    ctx.checkpoint(PipelineStep::LoadFeatures);

    run_stages(ctx, &bundle)
}

/// Run every stage after loading on an already assembled bundle.
pub fn run_bundle(
    ctx: &mut PipelineContext<'_>,
    bundle: &FeatureBundle,
) -> Result<PipelineOutcome, PipelineFailure> {
    check_bundle(bundle)?;
    run_stages(ctx, bundle)
}

fn check_bundle(bundle: &FeatureBundle) -> Result<(), PipelineFailure> {
    bundle.validate().map_err(|err| {
        PipelineFailure::new(PipelineStep::LoadFeatures, ProviderError::Shape(err).into())
    })
}

fn run_stages(
    ctx: &mut PipelineContext<'_>,
    bundle: &FeatureBundle,
) -> Result<PipelineOutcome, PipelineFailure> {
    let config = ctx.config.clone();
    let cutoff = config.low_cutoff();

    let baselines = Baselines {
        majority_bucket: majority_bucket_baseline(&bundle.y_train_bucket),
        binary: binary_baseline(&bundle.y_train_score, cutoff),
        top_features: single_feature_baselines(
            &bundle.x_train,
            &binarize(&bundle.y_train_score, cutoff),
            ctx.top_features,
        ),
    };
    info!(
        n_low = baselines.binary.n_low,
        n_high = baselines.binary.n_high,
        majority_accuracy = baselines.binary.majority_accuracy,
        "baselines computed"
    );
    ctx.checkpoint(PipelineStep::Baselines);

    let gate = SafetyGateTrainer::new(&config)
        .fit(&bundle.x_train, &bundle.y_train_score)
        .map_err(|err| PipelineFailure::new(PipelineStep::TrainGate, err.into()))?;
    ctx.checkpoint(PipelineStep::TrainGate);

    let ranker = QualityRanker::new(&config)
        .fit(&bundle.x_train, &bundle.y_train_score)
        .map_err(|err| PipelineFailure::new(PipelineStep::TrainRanker, err.into()))?;
    ctx.checkpoint(PipelineStep::TrainRanker);

    let k = config.proportional_k(bundle.x_test.n_rows());
    let triage = TriageEngine::new(&gate, &ranker)
        .triage(&bundle.x_test, k)
        .map_err(|err| PipelineFailure::new(PipelineStep::Triage, err.into()))?;
    ctx.checkpoint(PipelineStep::Triage);

    let metrics = ScreeningEvaluator::new(&config).evaluate(&bundle.y_test_score, &triage);
    let report = TwoStageReport {
        gate_threshold: gate.threshold(),
        gate: GateHoldoutDiagnostics::measure(
            &triage.p_low,
            gate.threshold(),
            &bundle.y_test_score,
            cutoff,
            &config.cost,
        ),
        ranker: RankerHoldoutDiagnostics::measure(&ranker, &bundle.x_test, &bundle.y_test_score),
        metrics,
    };
    ctx.checkpoint(PipelineStep::Evaluate);

    let fairness = GateFairnessAuditor::new(gate.threshold(), cutoff).audit(
        &triage.p_low,
        &bundle.y_test_score,
        &bundle.test_protected,
    );
    ctx.checkpoint(PipelineStep::FairnessAudit);

    let gate_features = top_attributions(ctx, TrainedModel::Classifier(&gate), bundle);
    let ranker_features = top_attributions(ctx, TrainedModel::Regressor(&ranker), bundle);
    ctx.checkpoint(PipelineStep::Explain);

    let saved = match ctx.output_dir.clone() {
        Some(dir) => {
            let saved = save_outputs(ctx, bundle, &gate, &ranker, &report, &fairness, dir)
                .map_err(|err| PipelineFailure::new(PipelineStep::SaveArtifacts, err))?;
            ctx.checkpoint(PipelineStep::SaveArtifacts);
            Some(saved)
        }
        None => None,
    };

    ctx.checkpoint(PipelineStep::Complete);
    Ok(PipelineOutcome {
        baselines,
        gate,
        ranker,
        triage,
        report,
        fairness,
        gate_features,
        ranker_features,
        saved,
    })
}

fn top_attributions(
    ctx: &PipelineContext<'_>,
    model: TrainedModel<'_>,
    bundle: &FeatureBundle,
) -> Vec<FeatureAttribution> {
    let explainer = select_explainer(model, ctx.explainer, ctx.config.seed);
    match explainer.explain(model, &bundle.x_test) {
        Ok(mut ranked) => {
            ranked.truncate(ctx.top_features);
            ranked
        }
        Err(err) => {
            warn!(model = model.kind(), error = %err, "feature attribution skipped");
            Vec::new()
        }
    }
}

fn save_outputs(
    ctx: &PipelineContext<'_>,
    bundle: &FeatureBundle,
    gate: &GateModel,
    ranker: &RankerModel,
    report: &TwoStageReport,
    fairness: &GateFairnessAudit,
    dir: PathBuf,
) -> Result<SavedArtifacts, StageError> {
    let metadata = TrainingMetadata {
        train_years: bundle.train_years.clone(),
        test_year: bundle.test_year,
        low_score_threshold: ctx.config.low_score_threshold,
        gate_threshold: gate.threshold(),
        gate_holdout_recall: Some(report.gate.recall),
        gate_holdout_auc: report.gate.auc,
        ranker_spearman: report.ranker.spearman,
        environment: ctx.environment.clone(),
        created_at: Utc::now(),
    };
    let artifact = ArtifactBundle::new(gate.clone(), ranker.clone(), metadata)?;
    let bundle_path = dir.join("screening_bundle.json");
    let digest = artifact.save(&bundle_path)?;

    Ok(SavedArtifacts {
        bundle: bundle_path,
        digest,
        two_stage_report: save_two_stage_report(&dir, report)?,
        fairness_report: save_fairness_report(&dir, fairness)?,
    })
}
