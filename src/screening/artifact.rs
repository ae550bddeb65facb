//! Versioned JSON bundle of the fitted gate and ranker.
//!
//! Every bundle is written next to a `.sha256` sidecar holding the hex digest
//! of the exact bytes on disk. Loading checks the sidecar before parsing.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::domain::{FeatureMatrix, ShapeError};
use super::gate::GateModel;
use super::ranker::RankerModel;

pub const ARTIFACT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("artifact is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("artifact version {found} is not supported (expected {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("gate and ranker were trained on different feature columns")]
    FeatureMismatch,
    #[error("scoring input is missing columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

impl ArtifactError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Provenance recorded at training time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetadata {
    pub train_years: Vec<i32>,
    pub test_year: i32,
    pub low_score_threshold: i32,
    pub gate_threshold: f64,
    pub gate_holdout_recall: Option<f64>,
    pub gate_holdout_auc: Option<f64>,
    pub ranker_spearman: Option<f64>,
    pub environment: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactBundle {
    version: u32,
    feature_names: Vec<String>,
    gate: GateModel,
    ranker: RankerModel,
    metadata: TrainingMetadata,
}

/// Outcome of a verified load.
#[derive(Debug)]
pub enum ArtifactLoad {
    Verified(Box<ArtifactBundle>),
    /// No sidecar next to the bundle; nothing was parsed.
    VerificationMissing { sidecar: PathBuf },
    IntegrityFailure { expected: String, actual: String },
}

impl ArtifactBundle {
    pub fn new(
        gate: GateModel,
        ranker: RankerModel,
        metadata: TrainingMetadata,
    ) -> Result<Self, ArtifactError> {
        let feature_names = gate.classifier().feature_names().to_vec();
        if ranker.regressor().feature_names() != feature_names.as_slice() {
            return Err(ArtifactError::FeatureMismatch);
        }

        Ok(Self {
            version: ARTIFACT_VERSION,
            feature_names,
            gate,
            ranker,
            metadata,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn gate(&self) -> &GateModel {
        &self.gate
    }

    pub fn ranker(&self) -> &RankerModel {
        &self.ranker
    }

    pub fn metadata(&self) -> &TrainingMetadata {
        &self.metadata
    }

    pub fn threshold(&self) -> f64 {
        self.gate.threshold()
    }

    /// Write the bundle and its sidecar; returns the hex digest.
    pub fn save(&self, path: &Path) -> Result<String, ArtifactError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| ArtifactError::io(parent, err))?;
        }

        let bytes = serde_json::to_vec_pretty(self)?;
        let digest = sha256_hex(&bytes);
        fs::write(path, &bytes).map_err(|err| ArtifactError::io(path, err))?;

        let sidecar = sidecar_path(path);
        fs::write(&sidecar, &digest).map_err(|err| ArtifactError::io(&sidecar, err))?;

        info!(path = %path.display(), digest = %digest, "artifact bundle saved");
        Ok(digest)
    }

    pub fn load_verified(path: &Path) -> Result<ArtifactLoad, ArtifactError> {
        let sidecar = sidecar_path(path);
        let expected = match fs::read_to_string(&sidecar) {
            Ok(contents) => contents.trim().to_ascii_lowercase(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(sidecar = %sidecar.display(), "artifact has no integrity sidecar");
                return Ok(ArtifactLoad::VerificationMissing { sidecar });
            }
            Err(err) => return Err(ArtifactError::io(&sidecar, err)),
        };

        let bytes = fs::read(path).map_err(|err| ArtifactError::io(path, err))?;
        let actual = sha256_hex(&bytes);
        if actual != expected {
            warn!(path = %path.display(), %expected, %actual, "artifact integrity check failed");
            return Ok(ArtifactLoad::IntegrityFailure { expected, actual });
        }

        Ok(ArtifactLoad::Verified(Box::new(Self::parse(&bytes)?)))
    }

    /// Parse without checking the sidecar. Callers opt in explicitly.
    pub fn load_unverified(path: &Path) -> Result<Self, ArtifactError> {
        let bytes = fs::read(path).map_err(|err| ArtifactError::io(path, err))?;
        warn!(path = %path.display(), "loading artifact without integrity verification");
        Self::parse(&bytes)
    }

    fn parse(bytes: &[u8]) -> Result<Self, ArtifactError> {
        let bundle: Self = serde_json::from_slice(bytes)?;
        if bundle.version != ARTIFACT_VERSION {
            return Err(ArtifactError::UnsupportedVersion {
                found: bundle.version,
                supported: ARTIFACT_VERSION,
            });
        }
        Ok(bundle)
    }

    /// Reorder `matrix` columns to the training order, dropping extras.
    pub fn align(&self, matrix: &FeatureMatrix) -> Result<FeatureMatrix, ArtifactError> {
        align_columns(&self.feature_names, matrix)
    }
}

pub fn sidecar_path(path: &Path) -> PathBuf {
    path.with_extension("sha256")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn align_columns(
    expected: &[String],
    matrix: &FeatureMatrix,
) -> Result<FeatureMatrix, ArtifactError> {
    match matrix.align_to(expected) {
        Ok(aligned) => Ok(aligned.into_owned()),
        Err(ShapeError::MissingColumns(missing)) => Err(ArtifactError::MissingColumns(missing)),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(names: &[&str], rows: Vec<Vec<f64>>) -> FeatureMatrix {
        FeatureMatrix::from_rows(names.iter().map(|name| (*name).to_owned()).collect(), rows)
            .expect("matrix")
    }

    #[test]
    fn align_reorders_and_drops_extra_columns() {
        let incoming = matrix(&["b", "extra", "a"], vec![vec![2.0, 9.0, 1.0], vec![4.0, 9.0, 3.0]]);
        let expected = vec!["a".to_owned(), "b".to_owned()];

        let aligned = align_columns(&expected, &incoming).expect("columns align");
        assert_eq!(aligned.feature_names(), expected.as_slice());
        assert_eq!(aligned.row(0), &[1.0, 2.0]);
        assert_eq!(aligned.row(1), &[3.0, 4.0]);
    }

    #[test]
    fn align_reports_missing_columns() {
        let incoming = matrix(&["a"], vec![vec![1.0]]);
        let expected = vec!["a".to_owned(), "b".to_owned(), "c".to_owned()];

        match align_columns(&expected, &incoming) {
            Err(ArtifactError::MissingColumns(missing)) => assert_eq!(missing, vec!["b", "c"]),
            other => panic!("expected missing columns, got {other:?}"),
        }
    }

    #[test]
    fn digest_is_lowercase_hex() {
        let digest = sha256_hex(b"abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sidecar_path(Path::new("out/bundle.json")), PathBuf::from("out/bundle.sha256"));
    }
}
