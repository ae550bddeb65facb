#![allow(dead_code)]

use std::f64::consts::PI;
use std::fmt::Write as _;

use cohort_triage::screening::domain::{score_bucket, CandidateId, FeatureBundle, FeatureMatrix};
use cohort_triage::screening::fairness::ProtectedAttribute;
use cohort_triage::screening::ScreeningConfig;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub const FEATURES: [&str; 4] = ["essay_score", "interview_score", "activity_count", "noise"];

/// Candidates whose true score is uniform on [0, 25].
///
/// Two features are the true score plus moderate noise, one is a weak proxy
/// and one is pure noise. `noisy_score` is the true score with heavier noise
/// and is never shown to the models.
pub struct Cohort {
    pub ids: Vec<CandidateId>,
    pub rows: Vec<Vec<f64>>,
    pub scores: Vec<f64>,
    pub noisy_scores: Vec<f64>,
    pub genders: Vec<Option<String>>,
}

impl Cohort {
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn matrix(&self) -> FeatureMatrix {
        FeatureMatrix::from_rows(feature_names(), self.rows.clone()).expect("synthetic matrix")
    }

    pub fn buckets(&self) -> Vec<u8> {
        self.scores.iter().map(|&score| score_bucket(score)).collect()
    }

    pub fn gender_attribute(&self) -> ProtectedAttribute {
        ProtectedAttribute::categorical("Gender", self.genders.clone())
    }
}

pub fn feature_names() -> Vec<String> {
    FEATURES.iter().map(|name| (*name).to_owned()).collect()
}

fn gaussian(rng: &mut ChaCha8Rng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

pub fn synthetic_cohort(n: usize, seed: u64, prefix: &str) -> Cohort {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut cohort = Cohort {
        ids: Vec::with_capacity(n),
        rows: Vec::with_capacity(n),
        scores: Vec::with_capacity(n),
        noisy_scores: Vec::with_capacity(n),
        genders: Vec::with_capacity(n),
    };

    for index in 0..n {
        let score: f64 = rng.gen_range(0.0..25.0);
        let essay = score + 1.5 * gaussian(&mut rng);
        let interview = score + 1.5 * gaussian(&mut rng);
        let activities = (score / 5.0 + 2.0 * gaussian(&mut rng)).max(0.0).round();
        let noise = gaussian(&mut rng);

        cohort.ids.push(CandidateId(format!("{prefix}-{index:04}")));
        cohort.rows.push(vec![essay, interview, activities, noise]);
        cohort.scores.push(score);
        cohort.noisy_scores.push(score + 5.0 * gaussian(&mut rng));
        cohort
            .genders
            .push(Some(if rng.gen_bool(0.5) { "F" } else { "M" }.to_owned()));
    }
    cohort
}

/// Smaller ensembles keep the integration suite quick.
pub fn screening_config() -> ScreeningConfig {
    let mut config = ScreeningConfig::default();
    config.gate.n_estimators = 80;
    config.ranker.n_estimators = 80;
    config.bootstrap_resamples = 200;
    config
}

pub fn feature_bundle(train: &Cohort, test: &Cohort) -> FeatureBundle {
    FeatureBundle {
        x_train: train.matrix(),
        x_test: test.matrix(),
        y_train_score: train.scores.clone(),
        y_test_score: test.scores.clone(),
        y_train_bucket: train.buckets(),
        y_test_bucket: test.buckets(),
        test_ids: test.ids.clone(),
        test_protected: vec![test.gender_attribute()],
        train_years: vec![2022, 2023],
        test_year: 2024,
    }
}

/// Indices of the `k` largest values, ties broken by position.
pub fn naive_top_k(values: &[f64], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));
    order.truncate(k);
    order
}

/// Render cohorts as the feature CSV the provider reads.
pub fn feature_csv(cohorts: &[(&Cohort, i32)]) -> String {
    let mut out = format!("id,cohort_year,score,{},Gender,Age\n", FEATURES.join(","));
    for (cohort, year) in cohorts {
        for index in 0..cohort.len() {
            let row = &cohort.rows[index];
            let age = 18 + (index % 30);
            writeln!(
                out,
                "{},{},{:.3},{:.4},{:.4},{},{:.4},{},{}",
                cohort.ids[index].0,
                year,
                cohort.scores[index],
                row[0],
                row[1],
                row[2],
                row[3],
                cohort.genders[index].as_deref().unwrap_or(""),
                age
            )
            .expect("write to string");
        }
    }
    out
}
