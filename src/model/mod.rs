//! Regression models behind one name -> model registry.

pub mod dataset;
pub mod decision_tree;
pub mod metrics;
pub mod random_forest;
pub mod tuning;

pub use dataset::{Dataset, Split};
pub use decision_tree::{DecisionTree, TreeParams};
pub use metrics::Scores;
pub use random_forest::{ForestParams, RandomForest};
pub use tuning::{ParamGrid, Tuned, tune_hyperparameters};

use crate::config::ModelConfig;
use crate::storage_utils::AsyncStorageManager;
use anyhow::{Result, anyhow};
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub trait Regressor {
    fn kind(&self) -> ModelKind;
    fn fit(&mut self, data: &Dataset) -> Result<()>;
    fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>>;
    /// Normalised to sum to 1 once fitted; all zeros when no split was made.
    fn feature_importances(&self) -> &[f64];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    RandomForest,
    DecisionTree,
}

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [ModelKind::RandomForest, ModelKind::DecisionTree];

    pub fn name(self) -> &'static str {
        match self {
            ModelKind::RandomForest => "random_forest",
            ModelKind::DecisionTree => "decision_tree",
        }
    }

    pub fn is_ensemble(self) -> bool {
        matches!(self, ModelKind::RandomForest)
    }

    pub fn build(self, params: ForestParams) -> Model {
        match self {
            ModelKind::RandomForest => Model::RandomForest(RandomForest::new(params)),
            ModelKind::DecisionTree => Model::DecisionTree(DecisionTree::new(params.tree(params.seed))),
        }
    }
}

impl FromStr for ModelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ModelKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                let supported: Vec<&str> = ModelKind::ALL.iter().map(|k| k.name()).collect();
                anyhow!("unknown model `{}`; supported: {}", s, supported.join(", "))
            })
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&ModelConfig> for ForestParams {
    fn from(config: &ModelConfig) -> Self {
        Self {
            n_estimators: config.n_estimators,
            max_depth: config.max_depth,
            min_samples_split: config.min_samples_split,
            min_samples_leaf: config.min_samples_leaf,
            seed: config.seed,
            ..Default::default()
        }
    }
}

/// A fitted (or ready to fit) model of any registered kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Model {
    RandomForest(RandomForest),
    DecisionTree(DecisionTree),
}

impl Regressor for Model {
    fn kind(&self) -> ModelKind {
        match self {
            Model::RandomForest(_) => ModelKind::RandomForest,
            Model::DecisionTree(_) => ModelKind::DecisionTree,
        }
    }

    fn fit(&mut self, data: &Dataset) -> Result<()> {
        match self {
            Model::RandomForest(m) => m.fit(data),
            Model::DecisionTree(m) => m.fit(data),
        }
    }

    fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>> {
        match self {
            Model::RandomForest(m) => m.predict(rows),
            Model::DecisionTree(m) => m.predict(rows),
        }
    }

    fn feature_importances(&self) -> &[f64] {
        match self {
            Model::RandomForest(m) => m.feature_importances(),
            Model::DecisionTree(m) => m.feature_importances(),
        }
    }
}

/// Shape and hyperparameters of a fitted model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSummary {
    pub kind: String,
    pub trees: usize,
    /// Deepest tree, counting the root level as 1.
    pub depth: usize,
    pub leaves: usize,
    pub params: serde_json::Value,
}

impl Model {
    /// Hyperparameters as a JSON object.
    pub fn params_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            Model::RandomForest(m) => serde_json::to_value(m.params())?,
            Model::DecisionTree(m) => serde_json::to_value(m.params())?,
        })
    }

    pub fn summary(&self) -> Result<ModelSummary> {
        let trees: Vec<&DecisionTree> = match self {
            Model::RandomForest(m) => m.trees().iter().collect(),
            Model::DecisionTree(m) => vec![m],
        };
        if trees.iter().all(|t| t.depth() == 0) {
            return Err(anyhow!("{} model is not fitted", self.kind()));
        }
        Ok(ModelSummary {
            kind: self.kind().to_string(),
            trees: trees.len(),
            depth: trees.iter().map(|t| t.depth()).max().unwrap_or(0),
            leaves: trees.iter().map(|t| t.n_leaves()).sum(),
            params: self.params_json()?,
        })
    }
}

// --- Persistence ---

fn document_name(config: &ModelConfig, kind: ModelKind) -> String {
    format!("{}/{}_model", config.models_dir, kind)
}

pub async fn save_model(
    storage: &AsyncStorageManager,
    config: &ModelConfig,
    model: &Model,
) -> Result<PathBuf> {
    let path = storage.save(&document_name(config, model.kind()), model).await?;
    info!("model saved to {:?}", path);
    Ok(path)
}

pub async fn load_model(
    storage: &AsyncStorageManager,
    config: &ModelConfig,
    kind: ModelKind,
) -> Result<Model> {
    storage.load(&document_name(config, kind)).await
}
