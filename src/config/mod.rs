use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::screening::config::ScreeningConfig;
use crate::screening::fairness::BinRange;
use crate::screening::provider::{CohortSplit, ProtectedColumn};

/// Distinguishes runtime behavior for different stages of the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Test => "test",
            Self::Production => "production",
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub screening: ScreeningConfig,
    pub data: DataConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("TRIAGE_ENV").unwrap_or_else(|_| "development".to_string()),
        );
        let log_level = env::var("TRIAGE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let defaults = ScreeningConfig::default();
        let mut screening = ScreeningConfig {
            low_score_threshold: parsed("TRIAGE_LOW_SCORE_THRESHOLD", defaults.low_score_threshold)?,
            recall_target: parsed("TRIAGE_RECALL_TARGET", defaults.recall_target)?,
            production_pool_size: parsed("TRIAGE_PRODUCTION_POOL_SIZE", defaults.production_pool_size)?,
            production_k: parsed("TRIAGE_PRODUCTION_K", defaults.production_k)?,
            bootstrap_resamples: parsed("TRIAGE_BOOTSTRAP_RESAMPLES", defaults.bootstrap_resamples)?,
            seed: parsed("TRIAGE_SEED", defaults.seed)?,
            ..defaults
        };
        screening.gate.max_depth = parsed("TRIAGE_GATE_MAX_DEPTH", screening.gate.max_depth)?;
        screening.gate.positive_weight_multiplier = parsed(
            "TRIAGE_GATE_POSITIVE_WEIGHT_MULTIPLIER",
            screening.gate.positive_weight_multiplier,
        )?;
        screening.ranker.max_depth = parsed("TRIAGE_RANKER_MAX_DEPTH", screening.ranker.max_depth)?;
        screening.ranker.quantile = parsed("TRIAGE_RANKER_QUANTILE", screening.ranker.quantile)?;
        screening.cost.true_positive =
            parsed("TRIAGE_COST_TRUE_POSITIVE", screening.cost.true_positive)?;
        screening.cost.false_negative =
            parsed("TRIAGE_COST_FALSE_NEGATIVE", screening.cost.false_negative)?;
        screening.cost.false_positive =
            parsed("TRIAGE_COST_FALSE_POSITIVE", screening.cost.false_positive)?;
        screening.cost.true_negative =
            parsed("TRIAGE_COST_TRUE_NEGATIVE", screening.cost.true_negative)?;

        let data = DataConfig {
            features_csv: PathBuf::from(
                env::var("TRIAGE_FEATURES_CSV").unwrap_or_else(|_| "data/features.csv".to_string()),
            ),
            train_years: parsed_list("TRIAGE_TRAIN_YEARS", vec![2022, 2023])?,
            test_year: parsed("TRIAGE_TEST_YEAR", 2024)?,
            protected_columns: parsed_list(
                "TRIAGE_PROTECTED_COLUMNS",
                vec!["Gender".to_string(), "Race".to_string(), "Citizenship".to_string()],
            )?,
            binned_columns: parsed_list("TRIAGE_BINNED_COLUMNS", vec!["Age".to_string()])?,
            output_dir: PathBuf::from(
                env::var("TRIAGE_OUTPUT_DIR").unwrap_or_else(|_| "output".to_string()),
            ),
            missing_value: parsed("TRIAGE_MISSING_VALUE", 0.0)?,
        };

        let config = Self {
            environment,
            screening,
            data,
            telemetry: TelemetryConfig { log_level },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_screening(&self.screening)?;
        if self.data.train_years.is_empty() {
            return Err(ConfigError::OutOfRange {
                key: "TRIAGE_TRAIN_YEARS",
                expected: "at least one cohort year",
            });
        }
        Ok(())
    }
}

pub fn validate_screening(screening: &ScreeningConfig) -> Result<(), ConfigError> {
    if !(screening.recall_target > 0.0 && screening.recall_target <= 1.0) {
        return Err(ConfigError::OutOfRange {
            key: "TRIAGE_RECALL_TARGET",
            expected: "a value in (0, 1]",
        });
    }
    if !(screening.ranker.quantile > 0.0 && screening.ranker.quantile < 1.0) {
        return Err(ConfigError::OutOfRange {
            key: "TRIAGE_RANKER_QUANTILE",
            expected: "a value in (0, 1)",
        });
    }
    if screening.production_pool_size == 0 {
        return Err(ConfigError::OutOfRange {
            key: "TRIAGE_PRODUCTION_POOL_SIZE",
            expected: "a positive pool size",
        });
    }
    if screening.production_k == 0 {
        return Err(ConfigError::OutOfRange {
            key: "TRIAGE_PRODUCTION_K",
            expected: "a positive review quota",
        });
    }
    let cost = &screening.cost;
    let costs = [
        ("TRIAGE_COST_TRUE_POSITIVE", cost.true_positive),
        ("TRIAGE_COST_FALSE_NEGATIVE", cost.false_negative),
        ("TRIAGE_COST_FALSE_POSITIVE", cost.false_positive),
        ("TRIAGE_COST_TRUE_NEGATIVE", cost.true_negative),
    ];
    if let Some(&(key, _)) = costs.iter().find(|(_, value)| !value.is_finite()) {
        return Err(ConfigError::OutOfRange {
            key,
            expected: "a finite gain",
        });
    }
    if screening.gate.positive_weight_multiplier <= 0.0 {
        return Err(ConfigError::OutOfRange {
            key: "TRIAGE_GATE_POSITIVE_WEIGHT_MULTIPLIER",
            expected: "a positive multiplier",
        });
    }
    Ok(())
}

/// Where training data comes from and where outputs go.
#[derive(Debug, Clone)]
pub struct DataConfig {
    pub features_csv: PathBuf,
    pub train_years: Vec<i32>,
    pub test_year: i32,
    /// Categorical audit-only columns.
    pub protected_columns: Vec<String>,
    /// Numeric audit-only columns grouped into age ranges.
    pub binned_columns: Vec<String>,
    pub output_dir: PathBuf,
    pub missing_value: f64,
}

impl DataConfig {
    pub fn cohort_split(&self) -> CohortSplit {
        CohortSplit {
            train_years: self.train_years.clone(),
            test_year: self.test_year,
        }
    }

    pub fn protected(&self) -> Vec<ProtectedColumn> {
        self.protected_columns
            .iter()
            .map(ProtectedColumn::categorical)
            .chain(
                self.binned_columns
                    .iter()
                    .map(|name| ProtectedColumn::binned(name, BinRange::age_bins())),
            )
            .collect()
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

fn parsed<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidValue { key, value: raw })
        }
        _ => Ok(default),
    }
}

fn parsed_list<T: FromStr>(key: &'static str, default: Vec<T>) -> Result<Vec<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| {
                item.parse::<T>().map_err(|_| ConfigError::InvalidValue {
                    key,
                    value: raw.clone(),
                })
            })
            .collect(),
        _ => Ok(default),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue { key: &'static str, value: String },
    OutOfRange { key: &'static str, expected: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue { key, value } => {
                write!(f, "{key} could not be parsed from `{value}`")
            }
            ConfigError::OutOfRange { key, expected } => write!(f, "{key} must be {expected}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serializes every test in the crate that touches process environment.
#[cfg(test)]
pub(crate) fn env_guard() -> &'static std::sync::Mutex<()> {
    static GUARD: std::sync::OnceLock<std::sync::Mutex<()>> = std::sync::OnceLock::new();
    GUARD.get_or_init(|| std::sync::Mutex::new(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screening::gate::CostMatrix;
    use std::env;

    const KEYS: [&str; 21] = [
        "TRIAGE_ENV",
        "TRIAGE_LOG_LEVEL",
        "TRIAGE_LOW_SCORE_THRESHOLD",
        "TRIAGE_RECALL_TARGET",
        "TRIAGE_PRODUCTION_POOL_SIZE",
        "TRIAGE_PRODUCTION_K",
        "TRIAGE_BOOTSTRAP_RESAMPLES",
        "TRIAGE_SEED",
        "TRIAGE_GATE_MAX_DEPTH",
        "TRIAGE_GATE_POSITIVE_WEIGHT_MULTIPLIER",
        "TRIAGE_RANKER_MAX_DEPTH",
        "TRIAGE_RANKER_QUANTILE",
        "TRIAGE_FEATURES_CSV",
        "TRIAGE_TRAIN_YEARS",
        "TRIAGE_TEST_YEAR",
        "TRIAGE_PROTECTED_COLUMNS",
        "TRIAGE_BINNED_COLUMNS",
        "TRIAGE_COST_TRUE_POSITIVE",
        "TRIAGE_COST_FALSE_NEGATIVE",
        "TRIAGE_COST_FALSE_POSITIVE",
        "TRIAGE_COST_TRUE_NEGATIVE",
    ];

    fn reset_env() {
        for key in KEYS {
            env::remove_var(key);
        }
        env::remove_var("TRIAGE_OUTPUT_DIR");
        env::remove_var("TRIAGE_MISSING_VALUE");
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.screening, ScreeningConfig::default());
        assert_eq!(config.data.train_years, vec![2022, 2023]);
        assert_eq!(config.data.test_year, 2024);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.data.protected().len(), 4);
    }

    #[test]
    fn env_overrides_screening_knobs() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("TRIAGE_ENV", "prod");
        env::set_var("TRIAGE_LOW_SCORE_THRESHOLD", "12");
        env::set_var("TRIAGE_RANKER_QUANTILE", "0.3");
        env::set_var("TRIAGE_TRAIN_YEARS", "2019, 2020,2021");

        let config = AppConfig::load().expect("config loads");
        assert_eq!(config.environment, AppEnvironment::Production);
        assert_eq!(config.screening.low_score_threshold, 12);
        assert_eq!(config.screening.ranker.quantile, 0.3);
        assert_eq!(config.data.train_years, vec![2019, 2020, 2021]);
        reset_env();
    }

    #[test]
    fn env_overrides_threshold_sweep_costs() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("TRIAGE_COST_FALSE_NEGATIVE", "-25");
        env::set_var("TRIAGE_COST_TRUE_NEGATIVE", "0.5");

        let config = AppConfig::load().expect("config loads");
        let cost = config.screening.cost;
        assert_eq!(cost.false_negative, -25.0);
        assert_eq!(cost.true_negative, 0.5);
        assert_eq!(cost.true_positive, CostMatrix::default().true_positive);
        assert_eq!(cost.false_positive, CostMatrix::default().false_positive);

        env::set_var("TRIAGE_COST_FALSE_POSITIVE", "NaN");
        match AppConfig::load() {
            Err(ConfigError::OutOfRange { key, .. }) => {
                assert_eq!(key, "TRIAGE_COST_FALSE_POSITIVE")
            }
            other => panic!("expected out of range error, got {other:?}"),
        }
        reset_env();
    }

    #[test]
    fn rejects_out_of_range_recall_target() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("TRIAGE_RECALL_TARGET", "1.5");

        match AppConfig::load() {
            Err(ConfigError::OutOfRange { key, .. }) => assert_eq!(key, "TRIAGE_RECALL_TARGET"),
            other => panic!("expected out of range error, got {other:?}"),
        }
        reset_env();
    }

    #[test]
    fn rejects_unparseable_numbers() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("TRIAGE_SEED", "forty-two");

        match AppConfig::load() {
            Err(ConfigError::InvalidValue { key, value }) => {
                assert_eq!((key, value.as_str()), ("TRIAGE_SEED", "forty-two"));
            }
            other => panic!("expected invalid value error, got {other:?}"),
        }
        reset_env();
    }
}
