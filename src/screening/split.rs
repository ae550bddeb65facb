use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Named partitions of the training rows used while fitting the safety gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitKind {
    TrainCore,
    Calibration,
    ThresholdHoldout,
}

impl SplitKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::TrainCore => "train-core",
            Self::Calibration => "calibration",
            Self::ThresholdHoldout => "threshold-holdout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SplitError {
    #[error("{} split has no {class} examples ({size} rows)", .split.label())]
    Degenerate {
        split: SplitKind,
        class: &'static str,
        size: usize,
    },
    #[error("cannot split an empty index set")]
    Empty,
}

/// Disjoint 60/20/20 partition of training row indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSplits {
    pub core: Vec<usize>,
    pub calibration: Vec<usize>,
    pub threshold: Vec<usize>,
}

impl GateSplits {
    pub fn get(&self, kind: SplitKind) -> &[usize] {
        match kind {
            SplitKind::TrainCore => &self.core,
            SplitKind::Calibration => &self.calibration,
            SplitKind::ThresholdHoldout => &self.threshold,
        }
    }

    pub fn sizes(&self) -> SplitSizes {
        SplitSizes {
            core: self.core.len(),
            calibration: self.calibration.len(),
            threshold: self.threshold.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitSizes {
    pub core: usize,
    pub calibration: usize,
    pub threshold: usize,
}

/// Split `indices` into (kept, held_out), sampling `test_fraction` of each class.
///
/// Both outputs are returned in ascending index order.
pub fn stratified_split(
    indices: &[usize],
    labels: &[bool],
    test_fraction: f64,
    rng: &mut ChaCha8Rng,
) -> Result<(Vec<usize>, Vec<usize>), SplitError> {
    if indices.is_empty() {
        return Err(SplitError::Empty);
    }

    let mut kept = Vec::with_capacity(indices.len());
    let mut held_out = Vec::new();

    for class in [true, false] {
        let mut members: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&index| labels[index] == class)
            .collect();
        members.shuffle(rng);

        let n_test = ((members.len() as f64) * test_fraction).round() as usize;
        let n_test = n_test.min(members.len());
        held_out.extend_from_slice(&members[..n_test]);
        kept.extend_from_slice(&members[n_test..]);
    }

    kept.sort_unstable();
    held_out.sort_unstable();
    Ok((kept, held_out))
}

/// Two sequential stratified splits: 20% threshold holdout, then 25% of the
/// remainder to calibration, leaving 60% for the core fit.
pub fn three_way_split(labels: &[bool], seed: u64) -> Result<GateSplits, SplitError> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let all: Vec<usize> = (0..labels.len()).collect();

    let (remainder, threshold) = stratified_split(&all, labels, 0.20, &mut rng)?;
    let (core, calibration) = stratified_split(&remainder, labels, 0.25, &mut rng)?;

    let splits = GateSplits {
        core,
        calibration,
        threshold,
    };

    for kind in [
        SplitKind::TrainCore,
        SplitKind::Calibration,
        SplitKind::ThresholdHoldout,
    ] {
        let members = splits.get(kind);
        if !members.iter().any(|&index| labels[index]) {
            return Err(SplitError::Degenerate {
                split: kind,
                class: "low-score",
                size: members.len(),
            });
        }
    }

    if !splits.core.iter().any(|&index| !labels[index]) {
        return Err(SplitError::Degenerate {
            split: SplitKind::TrainCore,
            class: "high-score",
            size: splits.core.len(),
        });
    }

    Ok(splits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn alternating_labels(n: usize, every: usize) -> Vec<bool> {
        (0..n).map(|index| index % every == 0).collect()
    }

    #[test]
    fn three_way_split_is_disjoint_and_complete() {
        let labels = alternating_labels(1_000, 3);
        let splits = three_way_split(&labels, 42).expect("split succeeds");

        let mut seen = HashSet::new();
        for index in splits
            .core
            .iter()
            .chain(&splits.calibration)
            .chain(&splits.threshold)
        {
            assert!(seen.insert(*index), "index {index} appears twice");
        }
        assert_eq!(seen.len(), labels.len());

        let sizes = splits.sizes();
        assert_eq!(sizes.threshold, 200);
        assert_eq!(sizes.calibration, 200);
        assert_eq!(sizes.core, 600);
    }

    #[test]
    fn get_returns_each_named_partition() {
        let splits = three_way_split(&alternating_labels(50, 4), 3).expect("valid split");
        assert_eq!(splits.get(SplitKind::TrainCore), splits.core.as_slice());
        assert_eq!(splits.get(SplitKind::Calibration), splits.calibration.as_slice());
        assert_eq!(splits.get(SplitKind::ThresholdHoldout), splits.threshold.as_slice());
        assert_ne!(splits.get(SplitKind::TrainCore), splits.get(SplitKind::ThresholdHoldout));
    }

    #[test]
    fn split_preserves_class_balance() {
        let labels = alternating_labels(1_000, 4);
        let splits = three_way_split(&labels, 7).expect("split succeeds");

        let low_share = |indices: &[usize]| {
            indices.iter().filter(|&&index| labels[index]).count() as f64 / indices.len() as f64
        };
        for share in [
            low_share(&splits.core),
            low_share(&splits.calibration),
            low_share(&splits.threshold),
        ] {
            assert!((share - 0.25).abs() < 0.02, "unbalanced share {share}");
        }
    }

    #[test]
    fn identical_seed_reproduces_partition() {
        let labels = alternating_labels(300, 2);
        let first = three_way_split(&labels, 11).expect("split succeeds");
        let second = three_way_split(&labels, 11).expect("split succeeds");
        assert_eq!(first, second);

        let other = three_way_split(&labels, 12).expect("split succeeds");
        assert_ne!(first, other);
    }

    #[test]
    fn split_without_low_scorers_is_fatal() {
        let labels = vec![false; 50];
        match three_way_split(&labels, 42) {
            Err(SplitError::Degenerate { class, .. }) => assert_eq!(class, "low-score"),
            other => panic!("expected degenerate split, got {other:?}"),
        }
    }

    #[test]
    fn split_with_too_few_low_scorers_is_fatal() {
        let mut labels = vec![false; 50];
        labels[3] = true;
        assert!(matches!(
            three_way_split(&labels, 42),
            Err(SplitError::Degenerate { .. })
        ));
    }
}
