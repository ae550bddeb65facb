use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{info, warn};

use super::domain::{
    score_bucket, CandidateId, CandidateMeta, FeatureBundle, FeatureMatrix, ShapeError,
};
use super::fairness::{BinRange, ProtectedAttribute};

pub const ID_COLUMN: &str = "id";
pub const COHORT_COLUMN: &str = "cohort_year";
pub const SCORE_COLUMN: &str = "score";
pub const BUCKET_COLUMN: &str = "bucket";

const RESERVED_COLUMNS: [&str; 4] = [ID_COLUMN, COHORT_COLUMN, SCORE_COLUMN, BUCKET_COLUMN];
const MISSING_MARKERS: [&str; 4] = ["na", "nan", "null", "none"];

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("failed to open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("required column `{0}` is absent")]
    MissingColumn(&'static str),
    #[error("line {line}: column `{column}` has invalid value `{value}`")]
    InvalidValue {
        line: u64,
        column: String,
        value: String,
    },
    #[error("training cohort {train_year} is not earlier than test cohort {test_year}")]
    TemporalLeak { train_year: i32, test_year: i32 },
    #[error("no scored rows for {0}")]
    EmptyCohort(String),
    #[error("no feature columns remain after removing reserved and protected columns")]
    NoFeatureColumns,
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// Source of a train/test snapshot.
pub trait FeatureMatrixProvider {
    fn load(&self) -> Result<FeatureBundle, ProviderError>;
}

/// Audit-only column; never becomes a model feature.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectedColumn {
    pub name: String,
    /// Numeric ranges for continuous attributes; `None` for categorical ones.
    pub bins: Option<Vec<BinRange>>,
}

impl ProtectedColumn {
    pub fn categorical(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bins: None,
        }
    }

    pub fn binned(name: impl Into<String>, bins: Vec<BinRange>) -> Self {
        Self {
            name: name.into(),
            bins: Some(bins),
        }
    }
}

/// Training cohorts and the later cohort they are evaluated on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CohortSplit {
    pub train_years: Vec<i32>,
    pub test_year: i32,
}

impl CohortSplit {
    /// Reject any training cohort at or after the test cohort.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.train_years.is_empty() {
            return Err(ProviderError::EmptyCohort("training years".to_owned()));
        }
        match self
            .train_years
            .iter()
            .copied()
            .find(|&year| year >= self.test_year)
        {
            Some(train_year) => Err(ProviderError::TemporalLeak {
                train_year,
                test_year: self.test_year,
            }),
            None => Ok(()),
        }
    }
}

/// Parsed candidate table with features separated from identity, outcome and
/// audit columns.
#[derive(Debug, Clone)]
pub struct CandidateTable {
    pub meta: Vec<CandidateMeta>,
    pub features: FeatureMatrix,
    pub scores: Vec<Option<f64>>,
    pub buckets: Vec<Option<u8>>,
    pub protected: Vec<ProtectedAttribute>,
}

impl CandidateTable {
    pub fn len(&self) -> usize {
        self.meta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meta.is_empty()
    }

    pub fn ids(&self) -> Vec<CandidateId> {
        self.meta.iter().map(|meta| meta.id.clone()).collect()
    }

    /// Scored rows belonging to `years`.
    fn scored_rows(&self, years: &[i32]) -> Vec<usize> {
        (0..self.len())
            .filter(|&row| {
                self.scores[row].is_some()
                    && self.meta[row]
                        .cohort_year
                        .map(|year| years.contains(&year))
                        .unwrap_or(false)
            })
            .collect()
    }

    fn scores_for(&self, rows: &[usize]) -> Vec<f64> {
        rows.iter()
            .map(|&row| self.scores[row].unwrap_or_default())
            .collect()
    }

    fn buckets_for(&self, rows: &[usize]) -> Vec<u8> {
        rows.iter()
            .map(|&row| {
                self.buckets[row]
                    .unwrap_or_else(|| score_bucket(self.scores[row].unwrap_or_default()))
            })
            .collect()
    }

    fn protected_for(&self, rows: &[usize]) -> Vec<ProtectedAttribute> {
        self.protected
            .iter()
            .map(|attribute| attribute.subset(rows))
            .collect()
    }
}

pub fn parse_table<R: Read>(
    reader: R,
    protected: &[ProtectedColumn],
    missing_value: f64,
) -> Result<CandidateTable, ProviderError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = csv_reader.headers()?.clone();
    let position = |name: &str| headers.iter().position(|header| header == name);

    let id_column = position(ID_COLUMN).ok_or(ProviderError::MissingColumn(ID_COLUMN))?;
    let cohort_column = position(COHORT_COLUMN);
    let score_column = position(SCORE_COLUMN);
    let bucket_column = position(BUCKET_COLUMN);

    let protected_columns: Vec<(&ProtectedColumn, Option<usize>)> = protected
        .iter()
        .map(|column| (column, position(&column.name)))
        .collect();
    for (column, index) in &protected_columns {
        if index.is_none() {
            warn!(column = %column.name, "protected column not present in input");
        }
    }

    let feature_columns: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(_, header)| {
            !RESERVED_COLUMNS.contains(header)
                && !protected.iter().any(|column| column.name == *header)
        })
        .map(|(index, header)| (index, header.to_owned()))
        .collect();
    if feature_columns.is_empty() {
        return Err(ProviderError::NoFeatureColumns);
    }

    let mut meta = Vec::new();
    let mut values = Vec::new();
    let mut scores = Vec::new();
    let mut buckets = Vec::new();
    let mut raw_protected: Vec<Vec<Option<String>>> = vec![Vec::new(); protected_columns.len()];

    for record in csv_reader.records() {
        let record = record?;
        let line = record.position().map(|pos| pos.line()).unwrap_or_default();
        let field = |index: usize| record.get(index).filter(|value| !is_missing(value));
        let number = |index: usize, column: &str| -> Result<Option<f64>, ProviderError> {
            field(index)
                .map(|value| parse_cell(value, line, column))
                .transpose()
        };

        let id = record.get(id_column).unwrap_or_default().to_owned();
        let cohort_year = match cohort_column {
            Some(index) => field(index)
                .map(|value| parse_cell::<i32>(value, line, COHORT_COLUMN))
                .transpose()?,
            None => None,
        };
        meta.push(CandidateMeta {
            id: CandidateId(id),
            cohort_year,
        });
        scores.push(match score_column {
            Some(index) => number(index, SCORE_COLUMN)?,
            None => None,
        });
        buckets.push(match bucket_column {
            Some(index) => field(index)
                .map(|value| parse_cell::<u8>(value, line, BUCKET_COLUMN))
                .transpose()?,
            None => None,
        });

        for (index, name) in &feature_columns {
            values.push(number(*index, name.as_str())?.unwrap_or(missing_value));
        }
        for (slot, (_, index)) in raw_protected.iter_mut().zip(&protected_columns) {
            slot.push(index.and_then(|index| field(index)).map(str::to_owned));
        }
    }

    let n_rows = meta.len();
    let feature_names = feature_columns.into_iter().map(|(_, name)| name).collect();
    let features = FeatureMatrix::from_flat(feature_names, values, n_rows)?;

    let protected = protected_columns
        .iter()
        .zip(raw_protected)
        .filter(|((_, index), _)| index.is_some())
        .map(|((column, _), values)| match &column.bins {
            None => ProtectedAttribute::categorical(column.name.clone(), values),
            Some(bins) => ProtectedAttribute::continuous(
                column.name.clone(),
                values
                    .iter()
                    .map(|value| value.as_deref().and_then(|value| value.parse::<f64>().ok()))
                    .collect(),
                bins.clone(),
            ),
        })
        .collect();

    Ok(CandidateTable {
        meta,
        features,
        scores,
        buckets,
        protected,
    })
}

/// Cohort years and buckets must parse exactly; `2023.7` or `300` is an
/// error rather than a truncated value.
fn parse_cell<T: FromStr>(value: &str, line: u64, column: &str) -> Result<T, ProviderError> {
    value.parse::<T>().map_err(|_| ProviderError::InvalidValue {
        line,
        column: column.to_owned(),
        value: value.to_owned(),
    })
}

fn is_missing(value: &str) -> bool {
    value.is_empty()
        || MISSING_MARKERS
            .iter()
            .any(|marker| value.eq_ignore_ascii_case(marker))
}

/// Reads a prepared feature CSV and partitions it by cohort year.
pub struct CsvFeatureProvider {
    path: PathBuf,
    split: CohortSplit,
    protected: Vec<ProtectedColumn>,
    missing_value: f64,
}

impl CsvFeatureProvider {
    pub fn new(path: impl Into<PathBuf>, split: CohortSplit) -> Self {
        Self {
            path: path.into(),
            split,
            protected: Vec::new(),
            missing_value: 0.0,
        }
    }

    pub fn with_protected(mut self, protected: Vec<ProtectedColumn>) -> Self {
        self.protected = protected;
        self
    }

    pub fn with_missing_value(mut self, missing_value: f64) -> Self {
        self.missing_value = missing_value;
        self
    }

    /// Build a bundle from an already parsed table.
    pub fn bundle(&self, table: &CandidateTable) -> Result<FeatureBundle, ProviderError> {
        self.split.validate()?;

        let train_rows = table.scored_rows(&self.split.train_years);
        let test_rows = table.scored_rows(&[self.split.test_year]);
        if train_rows.is_empty() {
            return Err(ProviderError::EmptyCohort(format!(
                "training years {:?}",
                self.split.train_years
            )));
        }
        if test_rows.is_empty() {
            return Err(ProviderError::EmptyCohort(format!(
                "test year {}",
                self.split.test_year
            )));
        }

        info!(
            train_rows = train_rows.len(),
            test_rows = test_rows.len(),
            features = table.features.n_features(),
            test_year = self.split.test_year,
            "feature bundle assembled"
        );

        Ok(FeatureBundle {
            x_train: table.features.select_rows(&train_rows),
            x_test: table.features.select_rows(&test_rows),
            y_train_score: table.scores_for(&train_rows),
            y_test_score: table.scores_for(&test_rows),
            y_train_bucket: table.buckets_for(&train_rows),
            y_test_bucket: table.buckets_for(&test_rows),
            test_ids: test_rows
                .iter()
                .map(|&row| table.meta[row].id.clone())
                .collect(),
            test_protected: table.protected_for(&test_rows),
            train_years: self.split.train_years.clone(),
            test_year: self.split.test_year,
        })
    }
}

impl FeatureMatrixProvider for CsvFeatureProvider {
    fn load(&self) -> Result<FeatureBundle, ProviderError> {
        let table = read_table(&self.path, &self.protected, self.missing_value)?;
        self.bundle(&table)
    }
}

pub fn read_table(
    path: &Path,
    protected: &[ProtectedColumn],
    missing_value: f64,
) -> Result<CandidateTable, ProviderError> {
    let file = File::open(path).map_err(|source| ProviderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_table(file, protected, missing_value)
}

/// Candidates to triage: every row is kept, scores are optional.
pub fn read_pool(
    path: &Path,
    protected: &[ProtectedColumn],
) -> Result<CandidateTable, ProviderError> {
    let table = read_table(path, protected, 0.0)?;
    info!(path = %path.display(), candidates = table.len(), "scoring pool loaded");
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screening::fairness::AttributeColumn;

    const SAMPLE: &str = "\
id,cohort_year,score,gpa,essays,Gender,Age
a1,2022,20,3.5,4,F,22
a2,2022,10,2.1,,M,27
a3,2023,18,3.9,5,F,
a4,2023,,3.0,3,M,35
a5,2024,14,2.8,NA,F,40
a6,2024,23,3.7,5,M,19
";

    fn protected() -> Vec<ProtectedColumn> {
        vec![
            ProtectedColumn::categorical("Gender"),
            ProtectedColumn::binned("Age", BinRange::age_bins()),
        ]
    }

    #[test]
    fn protected_columns_never_become_features() {
        let table = parse_table(SAMPLE.as_bytes(), &protected(), 0.0).expect("parses");

        assert_eq!(table.features.feature_names(), &["gpa", "essays"]);
        assert_eq!(table.len(), 6);
        assert_eq!(table.features.row(1), &[2.1, 0.0]);
        assert_eq!(table.features.row(4), &[2.8, 0.0]);
        assert_eq!(table.scores[3], None);
        assert_eq!(table.protected.len(), 2);
    }

    #[test]
    fn bundle_partitions_by_cohort_and_drops_unscored_rows() {
        let table = parse_table(SAMPLE.as_bytes(), &protected(), -1.0).expect("parses");
        let provider = CsvFeatureProvider::new(
            "unused.csv",
            CohortSplit {
                train_years: vec![2022, 2023],
                test_year: 2024,
            },
        );

        let bundle = provider.bundle(&table).expect("bundle builds");
        assert_eq!(bundle.x_train.n_rows(), 3);
        assert_eq!(bundle.y_train_score, vec![20.0, 10.0, 18.0]);
        assert_eq!(bundle.y_train_bucket, vec![3, 1, 2]);
        assert_eq!(bundle.x_test.row(0), &[2.8, -1.0]);
        assert_eq!(
            bundle.test_ids,
            vec![CandidateId("a5".into()), CandidateId("a6".into())]
        );

        let age = &bundle.test_protected[1];
        match &age.column {
            AttributeColumn::Continuous { values, .. } => {
                assert_eq!(values, &vec![Some(40.0), Some(19.0)]);
            }
            other => panic!("expected continuous column, got {other:?}"),
        }
    }

    #[test]
    fn later_training_cohort_is_a_leak() {
        let split = CohortSplit {
            train_years: vec![2022, 2024],
            test_year: 2024,
        };
        match split.validate() {
            Err(ProviderError::TemporalLeak {
                train_year,
                test_year,
            }) => assert_eq!((train_year, test_year), (2024, 2024)),
            other => panic!("expected temporal leak, got {other:?}"),
        }
    }

    #[test]
    fn non_numeric_feature_is_reported_with_its_line() {
        let input = "id,cohort_year,score,gpa\nx,2022,12,high\n";
        match parse_table(input.as_bytes(), &[], 0.0) {
            Err(ProviderError::InvalidValue { line, column, value }) => {
                assert_eq!((line, column.as_str(), value.as_str()), (2, "gpa", "high"));
            }
            other => panic!("expected invalid value, got {other:?}"),
        }
    }

    #[test]
    fn fractional_years_and_oversized_buckets_are_invalid() {
        let cases = [
            ("id,cohort_year,score,gpa\nx,2023.7,12,3\n", COHORT_COLUMN, "2023.7"),
            ("id,cohort_year,score,bucket,gpa\nx,2023,12,300,3\n", BUCKET_COLUMN, "300"),
            ("id,cohort_year,score,bucket,gpa\nx,2023,12,-1,3\n", BUCKET_COLUMN, "-1"),
        ];
        for (input, expected_column, expected_value) in cases {
            match parse_table(input.as_bytes(), &[], 0.0) {
                Err(ProviderError::InvalidValue { line, column, value }) => {
                    assert_eq!(line, 2);
                    assert_eq!(column, expected_column);
                    assert_eq!(value, expected_value);
                }
                other => panic!("expected invalid value for {expected_value}, got {other:?}"),
            }
        }

        let table = parse_table(
            "id,cohort_year,score,bucket,gpa\nx,2023,12,2,3\n".as_bytes(),
            &[],
            0.0,
        )
        .expect("integer cells parse");
        assert_eq!(table.meta[0].cohort_year, Some(2023));
        assert_eq!(table.buckets, vec![Some(2)]);
    }

    #[test]
    fn missing_id_column_is_rejected() {
        match parse_table("score,gpa\n1,2\n".as_bytes(), &[], 0.0) {
            Err(ProviderError::MissingColumn(column)) => assert_eq!(column, ID_COLUMN),
            other => panic!("expected missing column, got {other:?}"),
        }
    }
}
