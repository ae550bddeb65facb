use clap::{Args, Parser, Subcommand, ValueEnum};
use cohort_triage::config::{validate_screening, AppConfig};
use cohort_triage::error::AppError;
use cohort_triage::screening::artifact::{ArtifactBundle, ArtifactError, ArtifactLoad};
use cohort_triage::screening::explain::{ExplainerKind, TrainedModel};
use cohort_triage::screening::pipeline::{self, PipelineContext, TracingProgress};
use cohort_triage::screening::provider::{read_pool, CsvFeatureProvider};
use cohort_triage::screening::report::save_decisions;
use cohort_triage::screening::triage::TriageEngine;
use cohort_triage::telemetry;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "cohort-triage",
    about = "Train and apply a two-stage candidate screening model",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the gate and ranker on past cohorts and evaluate on the held-out cohort
    Train(TrainArgs),
    /// Score a pool of candidates with a saved bundle and pick the review list
    Triage(TriageArgs),
    /// Print the provenance and top features of a saved bundle
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Feature CSV (overrides TRIAGE_FEATURES_CSV)
    #[arg(long)]
    features: Option<PathBuf>,
    /// Comma separated training cohort years (overrides TRIAGE_TRAIN_YEARS)
    #[arg(long, value_delimiter = ',')]
    train_years: Option<Vec<i32>>,
    /// Held-out cohort year (overrides TRIAGE_TEST_YEAR)
    #[arg(long)]
    test_year: Option<i32>,
    /// Directory for the bundle and reports (overrides TRIAGE_OUTPUT_DIR)
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Recall the gate must reach on its threshold split
    #[arg(long)]
    recall_target: Option<f64>,
    /// Attribution method for the top-feature summary
    #[arg(long, value_enum)]
    explainer: Option<ExplainerArg>,
    /// Number of features to report per model
    #[arg(long, default_value_t = 5)]
    top_features: usize,
}

#[derive(Args, Debug)]
struct TriageArgs {
    /// Saved screening bundle
    #[arg(long)]
    bundle: PathBuf,
    /// Candidate CSV to score
    #[arg(long)]
    pool: PathBuf,
    /// Review quota; defaults to the production ratio applied to the pool size
    #[arg(long)]
    k: Option<usize>,
    /// Load the bundle even when its integrity sidecar is missing
    #[arg(long)]
    allow_unverified: bool,
    /// Directory for the decisions CSV (overrides TRIAGE_OUTPUT_DIR)
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// Saved screening bundle
    #[arg(long)]
    bundle: PathBuf,
    #[arg(long)]
    allow_unverified: bool,
    /// Features to list per model
    #[arg(long, default_value_t = 5)]
    top: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExplainerArg {
    TreePath,
    Permutation,
}

impl From<ExplainerArg> for ExplainerKind {
    fn from(value: ExplainerArg) -> Self {
        match value {
            ExplainerArg::TreePath => ExplainerKind::TreePath,
            ExplainerArg::Permutation => ExplainerKind::Permutation,
        }
    }
}

fn main() {
    if let Err(err) = run_cli() {
        eprintln!("application error: {err}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<(), AppError> {
    let cli = Cli::parse();
    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;

    match cli.command {
        Command::Train(args) => run_train(config, args),
        Command::Triage(args) => run_triage(config, args),
        Command::Inspect(args) => run_inspect(args),
    }
}

fn run_train(mut config: AppConfig, args: TrainArgs) -> Result<(), AppError> {
    if let Some(features) = args.features {
        config.data.features_csv = features;
    }
    if let Some(train_years) = args.train_years {
        config.data.train_years = train_years;
    }
    if let Some(test_year) = args.test_year {
        config.data.test_year = test_year;
    }
    if let Some(output_dir) = args.output_dir {
        config.data.output_dir = output_dir;
    }
    if let Some(recall_target) = args.recall_target {
        config.screening.recall_target = recall_target;
    }
    config.validate()?;

    info!(
        environment = config.environment.label(),
        features = %config.data.features_csv.display(),
        test_year = config.data.test_year,
        "training screening models"
    );

    let provider = CsvFeatureProvider::new(&config.data.features_csv, config.data.cohort_split())
        .with_protected(config.data.protected())
        .with_missing_value(config.data.missing_value);

    let mut progress = TracingProgress;
    let mut ctx = PipelineContext::new(config.screening.clone(), &mut progress)
        .with_output_dir(&config.data.output_dir);
    ctx.explainer = args.explainer.map(ExplainerKind::from);
    ctx.top_features = args.top_features;
    ctx.environment = config.environment.label().to_owned();

    let outcome = pipeline::run(&mut ctx, &provider)?;

    let summary = json!({
        "gate_threshold": outcome.gate.threshold(),
        "gate": outcome.report.gate,
        "ranker": outcome.report.ranker,
        "metrics": outcome.report.metrics,
        "baselines": outcome.baselines,
        "fairness_all_pass": outcome.fairness.all_pass(),
        "fairness_skipped": outcome.fairness.skipped,
        "gate_top_features": outcome.gate_features,
        "ranker_top_features": outcome.ranker_features,
        "saved": outcome.saved,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn run_triage(config: AppConfig, args: TriageArgs) -> Result<(), AppError> {
    validate_screening(&config.screening)?;
    let bundle = load_bundle(&args.bundle, args.allow_unverified)?;

    let pool = read_pool(&args.pool, &config.data.protected())?;
    let matrix = bundle.align(&pool.features)?;
    let k = args
        .k
        .unwrap_or_else(|| config.screening.proportional_k(pool.len()));

    let triage = TriageEngine::new(bundle.gate(), bundle.ranker())
        .triage(&matrix, k)
        .map_err(ArtifactError::from)?;
    let output_dir = args.output_dir.unwrap_or(config.data.output_dir);
    let decisions = save_decisions(&output_dir, &pool.ids(), &triage)?;

    let summary = json!({
        "pool_size": triage.pool_size(),
        "requested_k": triage.requested_k,
        "selected": triage.selected.len(),
        "passed_gate": triage.n_passed(),
        "rejection_rate": triage.rejection_rate,
        "status": triage.status.label(),
        "decisions": decisions,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn run_inspect(args: InspectArgs) -> Result<(), AppError> {
    let bundle = load_bundle(&args.bundle, args.allow_unverified)?;
    let metadata = bundle.metadata();

    println!("Screening bundle v{}", bundle.version());
    println!(
        "Trained on {:?}, evaluated on {} ({})",
        metadata.train_years, metadata.test_year, metadata.environment
    );
    println!("Created at {}", metadata.created_at.to_rfc3339());
    println!(
        "Low-score cutoff {}, gate threshold {:.3}",
        metadata.low_score_threshold, metadata.gate_threshold
    );
    if let Some(recall) = metadata.gate_holdout_recall {
        println!("Gate recall on held-out cohort: {recall:.3}");
    }
    if let Some(spearman) = metadata.ranker_spearman {
        println!("Ranker Spearman on held-out cohort: {spearman:.3}");
    }
    println!("{} features", bundle.feature_names().len());

    for model in [
        TrainedModel::Classifier(bundle.gate()),
        TrainedModel::Regressor(bundle.ranker()),
    ] {
        println!("\nTop features by split gain ({})", model.kind());
        let Some(ensemble) = model.tree_ensemble() else {
            println!("- not a tree model");
            continue;
        };
        for (feature, gain) in ensemble.gain_importance().into_iter().take(args.top) {
            println!("- {feature}: {gain:.4}");
        }
    }
    Ok(())
}

fn load_bundle(path: &Path, allow_unverified: bool) -> Result<ArtifactBundle, AppError> {
    match ArtifactBundle::load_verified(path)? {
        ArtifactLoad::Verified(bundle) => Ok(*bundle),
        ArtifactLoad::VerificationMissing { .. } if allow_unverified => {
            Ok(ArtifactBundle::load_unverified(path)?)
        }
        ArtifactLoad::VerificationMissing { sidecar } => {
            Err(AppError::VerificationMissing { sidecar })
        }
        ArtifactLoad::IntegrityFailure { expected, actual } => {
            Err(AppError::IntegrityFailure { expected, actual })
        }
    }
}
