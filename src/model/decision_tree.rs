//! Regression tree grown by variance reduction.
//!
//! Candidate thresholds for a feature are found in one pass over the node's
//! samples sorted by that feature, keeping running sums of the targets and
//! their squares so each split's squared error costs O(1). Targets are
//! centred on the node mean first; raw sums of squares of prices cancel.

use super::dataset::Dataset;
use anyhow::{Result, bail};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TreeParams {
    /// Unlimited when `None`.
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Features drawn per node; all of them when `None`.
    pub max_features: Option<usize>,
    pub seed: u64,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
        samples: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    params: TreeParams,
    /// Root at index 0; children always follow their parent.
    nodes: Vec<Node>,
    n_features: usize,
    importances: Vec<f64>,
}

struct Candidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

/// Label statistics of one node.
struct NodeStats {
    mean: f64,
    /// Squared error around `mean`.
    sse: f64,
    pure: bool,
}

impl NodeStats {
    fn of(data: &Dataset, indices: &[usize]) -> Self {
        let first = data.labels[indices[0]];
        if indices.iter().all(|&i| data.labels[i] == first) {
            return Self {
                mean: first,
                sse: 0.0,
                pure: true,
            };
        }
        let mean = indices.iter().map(|&i| data.labels[i]).sum::<f64>() / indices.len() as f64;
        let sse = indices.iter().map(|&i| (data.labels[i] - mean).powi(2)).sum();
        Self {
            mean,
            sse,
            pure: false,
        }
    }
}

struct Pending {
    indices: Vec<usize>,
    depth: usize,
    slot: usize,
}

impl DecisionTree {
    pub fn new(params: TreeParams) -> Self {
        Self {
            params,
            nodes: Vec::new(),
            n_features: 0,
            importances: Vec::new(),
        }
    }

    pub fn params(&self) -> &TreeParams {
        &self.params
    }

    pub fn fit(&mut self, data: &Dataset) -> Result<()> {
        self.fit_indices(data, (0..data.len()).collect())
    }

    /// Fits on the samples at `indices`, which may repeat.
    pub(crate) fn fit_indices(&mut self, data: &Dataset, indices: Vec<usize>) -> Result<()> {
        if indices.is_empty() {
            bail!("cannot fit a tree on an empty dataset");
        }
        self.n_features = data.n_features();
        self.importances = vec![0.0; self.n_features];
        self.nodes = vec![Node::Leaf {
            value: 0.0,
            samples: 0,
        }];
        let mut rng = ChaCha8Rng::seed_from_u64(self.params.seed);

        let mut stack = vec![Pending {
            indices,
            depth: 0,
            slot: 0,
        }];
        while let Some(task) = stack.pop() {
            let n = task.indices.len();
            let stats = NodeStats::of(data, &task.indices);
            let value = stats.mean;

            let may_split = self.params.max_depth.is_none_or(|d| task.depth < d)
                && n >= self.params.min_samples_split.max(2)
                && !stats.pure;
            let best = if may_split {
                self.best_split(data, &task.indices, &stats, &mut rng)
            } else {
                None
            };

            let Some(split) = best else {
                self.nodes[task.slot] = Node::Leaf { value, samples: n };
                continue;
            };

            self.importances[split.feature] += split.gain;
            let (left_indices, right_indices): (Vec<usize>, Vec<usize>) = task
                .indices
                .iter()
                .partition(|&&i| data.features[i][split.feature] <= split.threshold);

            let left = self.nodes.len();
            let right = left + 1;
            for _ in 0..2 {
                self.nodes.push(Node::Leaf {
                    value,
                    samples: 0,
                });
            }
            self.nodes[task.slot] = Node::Split {
                feature: split.feature,
                threshold: split.threshold,
                left,
                right,
            };
            stack.push(Pending {
                indices: right_indices,
                depth: task.depth + 1,
                slot: right,
            });
            stack.push(Pending {
                indices: left_indices,
                depth: task.depth + 1,
                slot: left,
            });
        }

        let total: f64 = self.importances.iter().sum();
        if total > 0.0 {
            self.importances.iter_mut().for_each(|imp| *imp /= total);
        }
        Ok(())
    }

    fn best_split(
        &self,
        data: &Dataset,
        indices: &[usize],
        stats: &NodeStats,
        rng: &mut ChaCha8Rng,
    ) -> Option<Candidate> {
        let n = indices.len();
        let min_leaf = self.params.min_samples_leaf.max(1);
        let sum: f64 = indices.iter().map(|&i| data.labels[i] - stats.mean).sum();
        let sum_sq = stats.sse;
        // gains below this are rounding noise
        let min_gain = stats.sse * 1e-12;

        let mut features: Vec<usize> = (0..self.n_features).collect();
        features.shuffle(rng);
        let draw = self
            .params
            .max_features
            .unwrap_or(self.n_features)
            .clamp(1, self.n_features.max(1));
        features.truncate(draw);

        let mut order = indices.to_vec();
        let mut best: Option<Candidate> = None;
        for feature in features {
            order.sort_by(|&a, &b| data.features[a][feature].total_cmp(&data.features[b][feature]));

            let (mut left_sum, mut left_sq) = (0.0, 0.0);
            for pos in 0..n - 1 {
                let y = data.labels[order[pos]] - stats.mean;
                left_sum += y;
                left_sq += y * y;

                let x = data.features[order[pos]][feature];
                let next = data.features[order[pos + 1]][feature];
                let (n_left, n_right) = (pos + 1, n - pos - 1);
                if next <= x || n_left < min_leaf || n_right < min_leaf {
                    continue;
                }

                let right_sum = sum - left_sum;
                let right_sq = sum_sq - left_sq;
                let sse = (left_sq - left_sum * left_sum / n_left as f64)
                    + (right_sq - right_sum * right_sum / n_right as f64);
                let gain = stats.sse - sse;

                if gain > best.as_ref().map_or(min_gain, |b| b.gain) {
                    let mut threshold = x + (next - x) / 2.0;
                    if threshold >= next {
                        threshold = x;
                    }
                    best = Some(Candidate {
                        feature,
                        threshold,
                        gain,
                    });
                }
            }
        }
        best
    }

    pub(crate) fn predict_one(&self, row: &[f64]) -> f64 {
        let mut at = 0;
        loop {
            match &self.nodes[at] {
                Node::Leaf { value, .. } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => at = if row[*feature] <= *threshold { *left } else { *right },
            }
        }
    }

    pub fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>> {
        self.check_fitted(rows)?;
        Ok(rows.iter().map(|row| self.predict_one(row)).collect())
    }

    pub(crate) fn check_fitted(&self, rows: &[Vec<f64>]) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("model is not fitted");
        }
        if let Some(row) = rows.iter().find(|r| r.len() != self.n_features) {
            bail!(
                "row has {} features, model was fitted on {}",
                row.len(),
                self.n_features
            );
        }
        Ok(())
    }

    pub fn feature_importances(&self) -> &[f64] {
        &self.importances
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], at: usize) -> usize {
            match &nodes[at] {
                Node::Leaf { .. } => 1,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        if self.nodes.is_empty() { 0 } else { walk(&self.nodes, 0) }
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }
}
