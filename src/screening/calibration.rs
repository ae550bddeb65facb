use serde::{Deserialize, Serialize};

use super::stats::sigmoid;

const MAX_ITERATIONS: usize = 100;
const MIN_STEP: f64 = 1e-10;
const SIGMA: f64 = 1e-12;
const GRADIENT_TOLERANCE: f64 = 1e-5;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalibrationError {
    #[error("calibration set needs both classes (positives {positives}, negatives {negatives})")]
    SingleClass { positives: usize, negatives: usize },
    #[error("{scores} scores but {labels} labels")]
    LengthMismatch { scores: usize, labels: usize },
}

/// Monotonic sigmoid map `p = 1 / (1 + exp(a * s + b))` fitted on frozen
/// classifier margins (Platt scaling with smoothed targets).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlattCalibrator {
    a: f64,
    b: f64,
}

impl PlattCalibrator {
    pub fn new(a: f64, b: f64) -> Self {
        Self { a, b }
    }

    pub fn fit(scores: &[f64], labels: &[bool]) -> Result<Self, CalibrationError> {
        if scores.len() != labels.len() {
            return Err(CalibrationError::LengthMismatch {
                scores: scores.len(),
                labels: labels.len(),
            });
        }

        let positives = labels.iter().filter(|&&label| label).count();
        let negatives = labels.len() - positives;
        if positives == 0 || negatives == 0 {
            return Err(CalibrationError::SingleClass {
                positives,
                negatives,
            });
        }

        let hi_target = (positives as f64 + 1.0) / (positives as f64 + 2.0);
        let lo_target = 1.0 / (negatives as f64 + 2.0);
        let targets: Vec<f64> = labels
            .iter()
            .map(|&label| if label { hi_target } else { lo_target })
            .collect();

        let mut a = 0.0;
        let mut b = ((negatives as f64 + 1.0) / (positives as f64 + 1.0)).ln();
        let mut objective = negative_log_likelihood(scores, &targets, a, b);

        for _ in 0..MAX_ITERATIONS {
            let mut h11 = SIGMA;
            let mut h22 = SIGMA;
            let mut h21 = 0.0;
            let mut g1 = 0.0;
            let mut g2 = 0.0;

            for (&score, &target) in scores.iter().zip(&targets) {
                let p = sigmoid(-(score * a + b));
                let q = 1.0 - p;
                let d2 = p * q;
                h11 += score * score * d2;
                h22 += d2;
                h21 += score * d2;
                let d1 = target - p;
                g1 += score * d1;
                g2 += d1;
            }

            if g1.abs() < GRADIENT_TOLERANCE && g2.abs() < GRADIENT_TOLERANCE {
                break;
            }

            let det = h11 * h22 - h21 * h21;
            let delta_a = -(h22 * g1 - h21 * g2) / det;
            let delta_b = -(-h21 * g1 + h11 * g2) / det;
            let directional = g1 * delta_a + g2 * delta_b;

            let mut step = 1.0;
            while step >= MIN_STEP {
                let next_a = a + step * delta_a;
                let next_b = b + step * delta_b;
                let next_objective = negative_log_likelihood(scores, &targets, next_a, next_b);
                if next_objective < objective + 1e-4 * step * directional {
                    a = next_a;
                    b = next_b;
                    objective = next_objective;
                    break;
                }
                step /= 2.0;
            }

            if step < MIN_STEP {
                break;
            }
        }

        Ok(Self { a, b })
    }

    pub fn slope(&self) -> f64 {
        self.a
    }

    pub fn intercept(&self) -> f64 {
        self.b
    }

    pub fn probability(&self, score: f64) -> f64 {
        sigmoid(-(self.a * score + self.b))
    }

    pub fn transform(&self, scores: &[f64]) -> Vec<f64> {
        scores.iter().map(|&score| self.probability(score)).collect()
    }
}

fn negative_log_likelihood(scores: &[f64], targets: &[f64], a: f64, b: f64) -> f64 {
    scores
        .iter()
        .zip(targets)
        .map(|(&score, &target)| {
            let f = score * a + b;
            if f >= 0.0 {
                target * f + (1.0 + (-f).exp()).ln()
            } else {
                (target - 1.0) * f + (1.0 + f.exp()).ln()
            }
        })
        .sum()
}

/// Mean log-loss of calibrated probabilities, used as a calibration diagnostic.
pub fn log_loss(probabilities: &[f64], labels: &[bool]) -> f64 {
    if probabilities.is_empty() {
        return 0.0;
    }

    let total: f64 = probabilities
        .iter()
        .zip(labels)
        .map(|(&p, &label)| {
            let p = p.clamp(1e-15, 1.0 - 1e-15);
            if label {
                -p.ln()
            } else {
                -(1.0 - p).ln()
            }
        })
        .sum();
    total / probabilities.len() as f64
}
