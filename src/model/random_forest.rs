use super::dataset::Dataset;
use super::decision_tree::{DecisionTree, TreeParams};
use anyhow::{Result, bail};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Hyperparameters shared by every model in the registry. Single trees
/// ignore `n_estimators` and `bootstrap`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub max_features: Option<usize>,
    pub bootstrap: bool,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
            bootstrap: true,
            seed: 42,
        }
    }
}

impl ForestParams {
    pub fn tree(&self, seed: u64) -> TreeParams {
        TreeParams {
            max_depth: self.max_depth,
            min_samples_split: self.min_samples_split,
            min_samples_leaf: self.min_samples_leaf,
            max_features: self.max_features,
            seed,
        }
    }
}

/// Bagged regression trees; predictions are the mean over trees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForest {
    params: ForestParams,
    trees: Vec<DecisionTree>,
    importances: Vec<f64>,
}

impl RandomForest {
    pub fn new(params: ForestParams) -> Self {
        Self {
            params,
            trees: Vec::new(),
            importances: Vec::new(),
        }
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    pub fn trees(&self) -> &[DecisionTree] {
        &self.trees
    }

    pub fn fit(&mut self, data: &Dataset) -> Result<()> {
        if self.params.n_estimators == 0 {
            bail!("a forest needs at least one tree");
        }
        if data.is_empty() {
            bail!("cannot fit a forest on an empty dataset");
        }
        let params = self.params;

        let trees = (0..params.n_estimators)
            .into_par_iter()
            .map(|i| {
                let seed = params.seed.wrapping_add(i as u64);
                let indices = if params.bootstrap {
                    data.bootstrap_indices(seed)
                } else {
                    (0..data.len()).collect()
                };
                let mut tree = DecisionTree::new(params.tree(seed));
                tree.fit_indices(data, indices)?;
                Ok(tree)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut importances = vec![0.0; data.n_features()];
        for tree in &trees {
            for (total, imp) in importances.iter_mut().zip(tree.feature_importances()) {
                *total += imp;
            }
        }
        let sum: f64 = importances.iter().sum();
        if sum > 0.0 {
            importances.iter_mut().for_each(|imp| *imp /= sum);
        }

        self.trees = trees;
        self.importances = importances;
        Ok(())
    }

    pub fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>> {
        let Some(first) = self.trees.first() else {
            bail!("model is not fitted");
        };
        first.check_fitted(rows)?;
        let n = self.trees.len() as f64;
        Ok(rows
            .par_iter()
            .map(|row| self.trees.iter().map(|t| t.predict_one(row)).sum::<f64>() / n)
            .collect())
    }

    pub fn feature_importances(&self) -> &[f64] {
        &self.importances
    }
}
