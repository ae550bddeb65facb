use crate::config::ConfigError;
use crate::screening::artifact::ArtifactError;
use crate::screening::pipeline::PipelineFailure;
use crate::screening::provider::ProviderError;
use crate::screening::report::ReportError;
use crate::telemetry::TelemetryError;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Telemetry(TelemetryError),
    Io(std::io::Error),
    Json(serde_json::Error),
    Pipeline(PipelineFailure),
    Artifact(ArtifactError),
    Provider(ProviderError),
    Report(ReportError),
    /// The bundle bytes do not match the digest in its sidecar.
    IntegrityFailure { expected: String, actual: String },
    /// The bundle has no sidecar and the caller did not opt out of verification.
    VerificationMissing { sidecar: PathBuf },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(err) => write!(f, "configuration error: {}", err),
            AppError::Telemetry(err) => write!(f, "telemetry error: {}", err),
            AppError::Io(err) => write!(f, "io error: {}", err),
            AppError::Json(err) => write!(f, "json error: {}", err),
            AppError::Pipeline(err) => write!(f, "{}", err.message),
            AppError::Artifact(err) => write!(f, "artifact error: {}", err),
            AppError::Provider(err) => write!(f, "data error: {}", err),
            AppError::Report(err) => write!(f, "report error: {}", err),
            AppError::IntegrityFailure { expected, actual } => write!(
                f,
                "artifact integrity check failed: expected sha256 {expected}, found {actual}"
            ),
            AppError::VerificationMissing { sidecar } => write!(
                f,
                "artifact has no integrity sidecar at {} (pass --allow-unverified to load it anyway)",
                sidecar.display()
            ),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(err) => Some(err),
            AppError::Telemetry(err) => Some(err),
            AppError::Io(err) => Some(err),
            AppError::Json(err) => Some(err),
            AppError::Pipeline(err) => Some(err),
            AppError::Artifact(err) => Some(err),
            AppError::Provider(err) => Some(err),
            AppError::Report(err) => Some(err),
            AppError::IntegrityFailure { .. } | AppError::VerificationMissing { .. } => None,
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TelemetryError> for AppError {
    fn from(value: TelemetryError) -> Self {
        Self::Telemetry(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<PipelineFailure> for AppError {
    fn from(value: PipelineFailure) -> Self {
        Self::Pipeline(value)
    }
}

impl From<ArtifactError> for AppError {
    fn from(value: ArtifactError) -> Self {
        Self::Artifact(value)
    }
}

impl From<ProviderError> for AppError {
    fn from(value: ProviderError) -> Self {
        Self::Provider(value)
    }
}

impl From<ReportError> for AppError {
    fn from(value: ReportError) -> Self {
        Self::Report(value)
    }
}
