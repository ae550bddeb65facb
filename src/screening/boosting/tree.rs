use serde::{Deserialize, Serialize};

use crate::screening::domain::FeatureMatrix;

/// Split rule of an internal node. Rows with `value < threshold` go left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitRule {
    pub feature: usize,
    pub threshold: f64,
    pub left: usize,
    pub right: usize,
    pub gain: f64,
}

/// Every node keeps its own output value so path attributions can be taken
/// as the change in value between parent and child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub value: f64,
    pub cover: f64,
    pub split: Option<SplitRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<TreeNode>,
}

impl RegressionTree {
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes.iter().filter(|node| node.split.is_none()).count()
    }

    pub fn predict_row(&self, row: &[f64]) -> f64 {
        let leaf = *self.decision_path(row).last().unwrap_or(&0);
        self.nodes[leaf].value
    }

    /// Node indices visited from the root to the leaf reached by `row`.
    pub fn decision_path(&self, row: &[f64]) -> Vec<usize> {
        let mut path = vec![0];
        let mut current = 0;
        while let Some(rule) = &self.nodes[current].split {
            current = if row[rule.feature] < rule.threshold {
                rule.left
            } else {
                rule.right
            };
            path.push(current);
        }
        path
    }

    /// Overwrite node outputs; used by objectives that refit values after growth.
    pub(super) fn set_node_values(&mut self, values: &[f64]) {
        for (node, value) in self.nodes.iter_mut().zip(values) {
            node.value = *value;
        }
    }
}

/// Growth constraints for one tree.
#[derive(Debug, Clone, Copy)]
pub(super) struct GrowthParams {
    pub max_depth: usize,
    pub min_child_weight: f64,
    pub lambda: f64,
}

/// Exact greedy, depth-wise tree growth over first/second order gradients.
pub(super) struct TreeGrower<'a> {
    matrix: &'a FeatureMatrix,
    gradients: &'a [f64],
    hessians: &'a [f64],
    params: GrowthParams,
    nodes: Vec<TreeNode>,
}

impl<'a> TreeGrower<'a> {
    pub fn new(
        matrix: &'a FeatureMatrix,
        gradients: &'a [f64],
        hessians: &'a [f64],
        params: GrowthParams,
    ) -> Self {
        Self {
            matrix,
            gradients,
            hessians,
            params,
            nodes: Vec::new(),
        }
    }

    pub fn grow(mut self, rows: Vec<usize>) -> RegressionTree {
        self.grow_node(rows, 0);
        RegressionTree { nodes: self.nodes }
    }

    fn grow_node(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let (sum_g, sum_h) = self.sums(&rows);
        let index = self.nodes.len();
        self.nodes.push(TreeNode {
            value: leaf_weight(sum_g, sum_h, self.params.lambda),
            cover: sum_h,
            split: None,
        });

        if depth >= self.params.max_depth || rows.len() < 2 {
            return index;
        }

        let Some(candidate) = self.best_split(&rows, sum_g, sum_h) else {
            return index;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .partition(|&&row| self.matrix.value(row, candidate.feature) < candidate.threshold);

        let left = self.grow_node(left_rows, depth + 1);
        let right = self.grow_node(right_rows, depth + 1);
        self.nodes[index].split = Some(SplitRule {
            feature: candidate.feature,
            threshold: candidate.threshold,
            left,
            right,
            gain: candidate.gain,
        });
        index
    }

    fn sums(&self, rows: &[usize]) -> (f64, f64) {
        rows.iter().fold((0.0, 0.0), |(g, h), &row| {
            (g + self.gradients[row], h + self.hessians[row])
        })
    }

    fn best_split(&self, rows: &[usize], sum_g: f64, sum_h: f64) -> Option<SplitCandidate> {
        let lambda = self.params.lambda;
        let parent_score = sum_g * sum_g / (sum_h + lambda);
        let mut best: Option<SplitCandidate> = None;

        for feature in 0..self.matrix.n_features() {
            let mut ordered: Vec<(f64, usize)> = rows
                .iter()
                .map(|&row| (self.matrix.value(row, feature), row))
                .collect();
            ordered.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

            let mut left_g = 0.0;
            let mut left_h = 0.0;
            for position in 0..ordered.len() - 1 {
                let (value, row) = ordered[position];
                left_g += self.gradients[row];
                left_h += self.hessians[row];

                let next_value = ordered[position + 1].0;
                if next_value <= value {
                    continue;
                }

                let right_g = sum_g - left_g;
                let right_h = sum_h - left_h;
                if left_h < self.params.min_child_weight || right_h < self.params.min_child_weight
                {
                    continue;
                }

                let gain = 0.5
                    * (left_g * left_g / (left_h + lambda) + right_g * right_g / (right_h + lambda)
                        - parent_score);
                if gain <= 1e-12 {
                    continue;
                }

                if best.as_ref().map(|current| gain > current.gain).unwrap_or(true) {
                    best = Some(SplitCandidate {
                        feature,
                        threshold: value + (next_value - value) / 2.0,
                        gain,
                    });
                }
            }
        }

        best
    }
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

pub(super) fn leaf_weight(sum_g: f64, sum_h: f64, lambda: f64) -> f64 {
    -sum_g / (sum_h + lambda)
}
