//! Two-stage candidate screening: a calibrated safety gate that keeps likely
//! low scorers out of review, followed by a conservative quality ranker over
//! the survivors.

pub mod artifact;
pub mod boosting;
pub mod calibration;
pub mod config;
pub mod domain;
pub mod evaluation;
pub mod explain;
pub mod fairness;
pub mod gate;
pub mod pipeline;
pub mod provider;
pub mod ranker;
pub mod report;
pub mod split;
pub mod stats;
pub mod triage;

pub use artifact::{ArtifactBundle, ArtifactError, ArtifactLoad, TrainingMetadata};
pub use config::{GateParams, RankerParams, ScreeningConfig};
pub use domain::{CandidateId, FeatureBundle, FeatureMatrix};
pub use evaluation::{ScreeningEvaluator, ScreeningMetrics, SelectionStats};
pub use fairness::{GateFairnessAudit, GateFairnessAuditor, ProtectedAttribute};
pub use gate::{CostMatrix, GateError, GateModel, SafetyGateTrainer};
pub use pipeline::{PipelineContext, PipelineFailure, PipelineOutcome, PipelineStep, ProgressSink};
pub use provider::{CsvFeatureProvider, FeatureMatrixProvider, ProviderError};
pub use ranker::{QualityRanker, RankerError, RankerModel};
pub use triage::{TriageEngine, TriageResult, TriageStatus};
