mod common;

use cohort_triage::screening::domain::{FeatureMatrix, ShapeError};
use cohort_triage::screening::evaluation::{ScreeningEvaluator, SelectionStats};
use cohort_triage::screening::pipeline::{self, PipelineContext, PipelineStep, ProgressSink};
use cohort_triage::screening::report::{FAIRNESS_REPORT, TWO_STAGE_REPORT};
use cohort_triage::screening::{
    ArtifactBundle, ArtifactLoad, QualityRanker, SafetyGateTrainer, TriageEngine, TriageStatus,
};
use common::{feature_bundle, feature_names, naive_top_k, screening_config, synthetic_cohort};

#[derive(Default)]
struct Steps(Vec<PipelineStep>);

impl ProgressSink for Steps {
    fn checkpoint(&mut self, step: PipelineStep, _pct: u8) {
        self.0.push(step);
    }
}

#[test]
fn gate_meets_recall_target_on_its_threshold_split() {
    let config = screening_config();
    let train = synthetic_cohort(1000, 7, "train");

    let gate = SafetyGateTrainer::new(&config)
        .fit(&train.matrix(), &train.scores)
        .expect("gate trains");

    let diagnostics = gate.diagnostics();
    assert!(diagnostics.recall_target_met);
    assert!(
        diagnostics.threshold_recall >= 0.95,
        "threshold-split recall {}",
        diagnostics.threshold_recall
    );
    assert!((0.01..=0.5).contains(&gate.threshold()));
    assert_eq!(
        diagnostics.split_sizes.core
            + diagnostics.split_sizes.calibration
            + diagnostics.split_sizes.threshold,
        1000
    );
}

#[test]
fn two_stage_selection_is_cleaner_than_naive_noisy_top_k() {
    let config = screening_config();
    let train = synthetic_cohort(1000, 7, "train");
    let pool = synthetic_cohort(500, 99, "pool");
    let matrix = train.matrix();

    let gate = SafetyGateTrainer::new(&config)
        .fit(&matrix, &train.scores)
        .expect("gate trains");
    let ranker = QualityRanker::new(&config)
        .fit(&matrix, &train.scores)
        .expect("ranker trains");

    let triage = TriageEngine::new(&gate, &ranker)
        .triage(&pool.matrix(), 150)
        .expect("pool matches training columns");
    assert!(triage.selected.len() <= 150);
    assert!(triage
        .selected
        .iter()
        .all(|index| triage.passed.contains(index)));

    let cutoff = config.low_cutoff();
    let two_stage = SelectionStats::measure(&pool.scores, &triage.selected, cutoff);
    let naive = SelectionStats::measure(&pool.scores, &naive_top_k(&pool.noisy_scores, 150), cutoff);

    assert!(
        two_stage.contamination_rate < naive.contamination_rate,
        "two-stage {} vs naive {}",
        two_stage.contamination_rate,
        naive.contamination_rate
    );
}

#[test]
fn identical_seed_reproduces_thresholds_and_metrics() {
    let config = screening_config();
    let train = synthetic_cohort(600, 11, "train");
    let pool = synthetic_cohort(300, 12, "pool");

    let run = || {
        let gate = SafetyGateTrainer::new(&config)
            .fit(&train.matrix(), &train.scores)
            .expect("gate trains");
        let ranker = QualityRanker::new(&config)
            .fit(&train.matrix(), &train.scores)
            .expect("ranker trains");
        let triage = TriageEngine::new(&gate, &ranker)
            .triage(&pool.matrix(), 90)
            .expect("pool matches training columns");
        let metrics = ScreeningEvaluator::new(&config).evaluate(&pool.scores, &triage);
        (gate.threshold(), triage, metrics)
    };

    let (first_threshold, first_triage, first_metrics) = run();
    let (second_threshold, second_triage, second_metrics) = run();
    assert_eq!(first_threshold, second_threshold);
    assert_eq!(first_triage, second_triage);
    assert_eq!(first_metrics, second_metrics);
}

#[test]
fn pipeline_trains_evaluates_audits_and_saves() {
    let train = synthetic_cohort(800, 21, "train");
    let test = synthetic_cohort(400, 22, "test");
    let bundle = feature_bundle(&train, &test);
    let dir = tempfile::tempdir().expect("temp dir");

    let mut steps = Steps::default();
    let mut ctx =
        PipelineContext::new(screening_config(), &mut steps).with_output_dir(dir.path());
    let outcome = pipeline::run_bundle(&mut ctx, &bundle).expect("pipeline succeeds");

    // k = round(4000 * 400 / 10000)
    assert_eq!(outcome.report.metrics.k_eval, 160);
    assert_eq!(outcome.triage.requested_k, 160);
    assert_ne!(outcome.triage.status, TriageStatus::NonePassed);
    let bootstrap = outcome
        .report
        .metrics
        .bootstrap
        .as_ref()
        .expect("bootstrap intervals");
    assert_eq!(bootstrap.resamples_used + bootstrap.resamples_skipped, 200);

    assert!(outcome.fairness.skipped.is_empty());
    assert_eq!(outcome.fairness.rows.len(), 2);
    assert_eq!(outcome.gate_features.len(), 4);
    assert_ne!(outcome.gate_features[0].feature, "noise");

    let saved = outcome.saved.as_ref().expect("outputs saved");
    assert_eq!(saved.two_stage_report, dir.path().join(TWO_STAGE_REPORT));
    assert_eq!(saved.fairness_report, Some(dir.path().join(FAIRNESS_REPORT)));
    let report = std::fs::read_to_string(&saved.two_stage_report).expect("report readable");
    assert!(report.lines().any(|line| line.starts_with("gate_recall,")));
    assert!(report
        .lines()
        .any(|line| line.starts_with("contamination_rate_ci_lo,")));

    match ArtifactBundle::load_verified(&saved.bundle).expect("bundle readable") {
        ArtifactLoad::Verified(loaded) => {
            assert_eq!(loaded.feature_names(), bundle.feature_names());
            assert_eq!(loaded.metadata().test_year, 2024);
        }
        other => panic!("expected a verified bundle, got {other:?}"),
    }

    assert_eq!(steps.0.first(), Some(&PipelineStep::Baselines));
    assert_eq!(steps.0.last(), Some(&PipelineStep::Complete));
}

#[test]
fn triage_matches_pool_columns_by_name() {
    let config = screening_config();
    let train = synthetic_cohort(600, 31, "train");
    let pool = synthetic_cohort(200, 32, "pool");

    let gate = SafetyGateTrainer::new(&config)
        .fit(&train.matrix(), &train.scores)
        .expect("gate trains");
    let ranker = QualityRanker::new(&config)
        .fit(&train.matrix(), &train.scores)
        .expect("ranker trains");
    let engine = TriageEngine::new(&gate, &ranker);
    let canonical = engine
        .triage(&pool.matrix(), 60)
        .expect("pool matches training columns");

    let mut reversed_names = feature_names();
    reversed_names.reverse();
    let reversed_rows = pool
        .rows
        .iter()
        .map(|row| row.iter().rev().copied().collect())
        .collect();
    let reversed = FeatureMatrix::from_rows(reversed_names, reversed_rows).expect("matrix builds");
    let reordered = engine
        .triage(&reversed, 60)
        .expect("reordered columns still align");
    assert_eq!(reordered, canonical);

    let narrow_names = feature_names()[..2].to_vec();
    let narrow_rows = pool.rows.iter().map(|row| row[..2].to_vec()).collect();
    let narrow = FeatureMatrix::from_rows(narrow_names, narrow_rows).expect("matrix builds");
    match engine.triage(&narrow, 60) {
        Err(ShapeError::MissingColumns(missing)) => {
            assert_eq!(missing, vec!["activity_count", "noise"])
        }
        other => panic!("expected missing columns, got {other:?}"),
    }
}

#[test]
fn inconsistent_bundles_fail_at_load_instead_of_panicking() {
    let train = synthetic_cohort(300, 41, "train");
    let test = synthetic_cohort(100, 42, "test");
    let mut bundle = feature_bundle(&train, &test);
    bundle.y_test_score.truncate(1);

    let mut steps = Steps::default();
    let mut ctx = PipelineContext::new(screening_config(), &mut steps);
    match pipeline::run_bundle(&mut ctx, &bundle) {
        Err(failure) => {
            assert_eq!(failure.step, PipelineStep::LoadFeatures);
            assert!(failure.message.contains("y_test_score"), "{}", failure.message);
        }
        Ok(_) => panic!("expected a load failure"),
    }
    assert!(steps.0.is_empty());
}
