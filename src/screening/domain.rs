use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Candidate identifier carried alongside feature rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateId(pub String);

impl std::fmt::Display for CandidateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one candidate row; pools being scored may lack a cohort year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateMeta {
    pub id: CandidateId,
    pub cohort_year: Option<i32>,
}

/// Raised when rows do not line up with the declared feature columns.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShapeError {
    #[error("row {row} has {found} values, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("flat buffer of {len} values cannot hold {rows} rows of {columns} features")]
    BufferSize {
        len: usize,
        rows: usize,
        columns: usize,
    },
    #[error("missing feature columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("{what} has {found} entries for {rows} feature rows")]
    LengthMismatch {
        what: &'static str,
        rows: usize,
        found: usize,
    },
    #[error("test features do not match training features")]
    FeatureNames,
}

/// Dense row-major matrix of numeric features with ordered column names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    feature_names: Vec<String>,
    values: Vec<f64>,
    n_rows: usize,
}

impl FeatureMatrix {
    pub fn from_rows(feature_names: Vec<String>, rows: Vec<Vec<f64>>) -> Result<Self, ShapeError> {
        let width = feature_names.len();
        let n_rows = rows.len();
        let mut values = Vec::with_capacity(n_rows * width);

        for (index, row) in rows.into_iter().enumerate() {
            if row.len() != width {
                return Err(ShapeError::RaggedRow {
                    row: index,
                    expected: width,
                    found: row.len(),
                });
            }
            values.extend(row);
        }

        Ok(Self {
            feature_names,
            values,
            n_rows,
        })
    }

    pub fn from_flat(
        feature_names: Vec<String>,
        values: Vec<f64>,
        n_rows: usize,
    ) -> Result<Self, ShapeError> {
        if values.len() != n_rows * feature_names.len() {
            return Err(ShapeError::BufferSize {
                len: values.len(),
                rows: n_rows,
                columns: feature_names.len(),
            });
        }

        Ok(Self {
            feature_names,
            values,
            n_rows,
        })
    }

    pub fn empty(feature_names: Vec<String>) -> Self {
        Self {
            feature_names,
            values: Vec::new(),
            n_rows: 0,
        }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.n_rows == 0
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn row(&self, index: usize) -> &[f64] {
        let width = self.n_features();
        &self.values[index * width..(index + 1) * width]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> + '_ {
        (0..self.n_rows).map(move |index| self.row(index))
    }

    pub fn value(&self, row: usize, feature: usize) -> f64 {
        self.values[row * self.n_features() + feature]
    }

    pub fn column(&self, feature: usize) -> Vec<f64> {
        self.rows().map(|row| row[feature]).collect()
    }

    /// Copy of the matrix restricted to `indices`, in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let mut values = Vec::with_capacity(indices.len() * self.n_features());
        for &index in indices {
            values.extend_from_slice(self.row(index));
        }

        Self {
            feature_names: self.feature_names.clone(),
            values,
            n_rows: indices.len(),
        }
    }

    /// View of the matrix with columns in `expected` order, dropping extras.
    /// Borrows when the columns already match.
    pub fn align_to(&self, expected: &[String]) -> Result<Cow<'_, FeatureMatrix>, ShapeError> {
        if self.feature_names == expected {
            return Ok(Cow::Borrowed(self));
        }

        let positions: Vec<Option<usize>> = expected
            .iter()
            .map(|name| self.feature_names.iter().position(|column| column == name))
            .collect();
        let missing: Vec<String> = expected
            .iter()
            .zip(&positions)
            .filter(|(_, position)| position.is_none())
            .map(|(name, _)| name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(ShapeError::MissingColumns(missing));
        }

        let positions: Vec<usize> = positions.into_iter().flatten().collect();
        let values: Vec<f64> = self
            .rows()
            .flat_map(|row| positions.iter().map(move |&position| row[position]))
            .collect();
        Ok(Cow::Owned(FeatureMatrix::from_flat(
            expected.to_vec(),
            values,
            self.n_rows,
        )?))
    }

    /// Copy of the matrix with one column replaced.
    pub fn with_column(&self, feature: usize, column: &[f64]) -> Self {
        let mut copy = self.clone();
        let width = self.n_features();
        for (row, value) in column.iter().enumerate().take(self.n_rows) {
            copy.values[row * width + feature] = *value;
        }
        copy
    }
}

/// `true` when a score sits at or below the low-score cutoff.
pub fn is_low(score: f64, low_score_threshold: f64) -> bool {
    score <= low_score_threshold
}

pub fn binarize(scores: &[f64], low_score_threshold: f64) -> Vec<bool> {
    scores
        .iter()
        .map(|&score| is_low(score, low_score_threshold))
        .collect()
}

pub fn pick<T: Clone>(values: &[T], indices: &[usize]) -> Vec<T> {
    indices.iter().map(|&index| values[index].clone()).collect()
}

/// Boundaries between the four discretized score buckets.
pub const SCORE_BUCKET_THRESHOLDS: [f64; 3] = [6.25, 12.5, 18.75];

/// Map a continuous score onto bucket 0..=3.
pub fn score_bucket(score: f64) -> u8 {
    SCORE_BUCKET_THRESHOLDS
        .iter()
        .position(|&threshold| score < threshold)
        .map(|position| position as u8)
        .unwrap_or(3)
}

/// Train/test snapshot handed over by a feature provider.
///
/// Train and test rows come from disjoint cohorts; `test_year` is strictly
/// later than every training year.
#[derive(Debug, Clone)]
pub struct FeatureBundle {
    pub x_train: FeatureMatrix,
    pub x_test: FeatureMatrix,
    pub y_train_score: Vec<f64>,
    pub y_test_score: Vec<f64>,
    pub y_train_bucket: Vec<u8>,
    pub y_test_bucket: Vec<u8>,
    pub test_ids: Vec<CandidateId>,
    pub test_protected: Vec<super::fairness::ProtectedAttribute>,
    pub train_years: Vec<i32>,
    pub test_year: i32,
}

impl FeatureBundle {
    pub fn feature_names(&self) -> &[String] {
        self.x_train.feature_names()
    }

    /// Every per-row vector must line up with its matrix, and both matrices
    /// must carry the same columns in the same order.
    pub fn validate(&self) -> Result<(), ShapeError> {
        let train_rows = self.x_train.n_rows();
        let test_rows = self.x_test.n_rows();
        let checks = [
            ("y_train_score", train_rows, self.y_train_score.len()),
            ("y_train_bucket", train_rows, self.y_train_bucket.len()),
            ("y_test_score", test_rows, self.y_test_score.len()),
            ("y_test_bucket", test_rows, self.y_test_bucket.len()),
            ("test_ids", test_rows, self.test_ids.len()),
        ];
        if let Some(&(what, rows, found)) = checks.iter().find(|(_, rows, found)| rows != found) {
            return Err(ShapeError::LengthMismatch { what, rows, found });
        }

        if self.x_test.feature_names() != self.x_train.feature_names() {
            return Err(ShapeError::FeatureNames);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(count: usize) -> Vec<String> {
        (0..count).map(|index| format!("f{index}")).collect()
    }

    #[test]
    fn labels_low_scores_at_or_below_cutoff() {
        let scores = [2.0, 8.0, 14.0, 16.0, 20.0, 24.0];
        assert_eq!(
            binarize(&scores, 15.0),
            vec![true, true, true, false, false, false]
        );
        assert!(is_low(15.0, 15.0));
    }

    #[test]
    fn labeling_is_monotonic_in_score() {
        let scores: Vec<f64> = (0..=100).map(|step| step as f64 * 0.25).collect();
        for window in scores.windows(2) {
            let (lower, higher) = (window[0], window[1]);
            assert!(is_low(lower, 15.0) >= is_low(higher, 15.0));
        }
    }

    #[test]
    fn from_rows_rejects_ragged_input() {
        match FeatureMatrix::from_rows(names(2), vec![vec![1.0, 2.0], vec![3.0]]) {
            Err(ShapeError::RaggedRow { row, expected, found }) => {
                assert_eq!((row, expected, found), (1, 2, 1));
            }
            other => panic!("expected ragged row error, got {other:?}"),
        }
    }

    #[test]
    fn select_rows_preserves_requested_order() {
        let matrix = FeatureMatrix::from_rows(
            names(2),
            vec![vec![0.0, 0.5], vec![1.0, 1.5], vec![2.0, 2.5]],
        )
        .expect("matrix builds");

        let subset = matrix.select_rows(&[2, 0]);
        assert_eq!(subset.n_rows(), 2);
        assert_eq!(subset.row(0), &[2.0, 2.5]);
        assert_eq!(subset.row(1), &[0.0, 0.5]);
        assert_eq!(matrix.column(1), vec![0.5, 1.5, 2.5]);
    }

    #[test]
    fn align_to_borrows_matching_columns_and_reorders_others() {
        let matrix = FeatureMatrix::from_rows(names(3), vec![vec![0.0, 1.0, 2.0]])
            .expect("matrix builds");

        assert!(matches!(matrix.align_to(&names(3)), Ok(Cow::Borrowed(_))));

        let wanted = vec!["f2".to_owned(), "f0".to_owned()];
        let aligned = matrix.align_to(&wanted).expect("columns align");
        assert_eq!(aligned.feature_names(), wanted.as_slice());
        assert_eq!(aligned.row(0), &[2.0, 0.0]);

        match matrix.align_to(&names(5)) {
            Err(ShapeError::MissingColumns(missing)) => assert_eq!(missing, vec!["f3", "f4"]),
            other => panic!("expected missing columns, got {other:?}"),
        }
    }

    fn bundle(train_rows: usize, test_rows: usize) -> FeatureBundle {
        let matrix = |rows: usize| {
            FeatureMatrix::from_rows(names(2), vec![vec![1.0, 2.0]; rows]).expect("matrix builds")
        };
        FeatureBundle {
            x_train: matrix(train_rows),
            x_test: matrix(test_rows),
            y_train_score: vec![10.0; train_rows],
            y_test_score: vec![10.0; test_rows],
            y_train_bucket: vec![1; train_rows],
            y_test_bucket: vec![1; test_rows],
            test_ids: (0..test_rows)
                .map(|row| CandidateId(format!("c{row}")))
                .collect(),
            test_protected: Vec::new(),
            train_years: vec![2022],
            test_year: 2023,
        }
    }

    #[test]
    fn bundle_validation_catches_short_label_vectors() {
        assert_eq!(bundle(6, 4).validate(), Ok(()));

        let mut short = bundle(6, 4);
        short.y_test_score.truncate(1);
        assert_eq!(
            short.validate(),
            Err(ShapeError::LengthMismatch {
                what: "y_test_score",
                rows: 4,
                found: 1
            })
        );
    }

    #[test]
    fn bundle_validation_requires_identical_feature_columns() {
        let mut renamed = bundle(6, 4);
        renamed.x_test = FeatureMatrix::from_rows(
            vec!["f1".to_owned(), "f0".to_owned()],
            vec![vec![2.0, 1.0]; 4],
        )
        .expect("matrix builds");
        assert_eq!(renamed.validate(), Err(ShapeError::FeatureNames));
    }

    #[test]
    fn buckets_follow_score_thresholds() {
        assert_eq!(score_bucket(0.0), 0);
        assert_eq!(score_bucket(6.25), 1);
        assert_eq!(score_bucket(15.0), 2);
        assert_eq!(score_bucket(25.0), 3);
    }
}
