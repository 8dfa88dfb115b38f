use super::dataset::Dataset;
use super::metrics;
use super::{Model, ModelKind, Regressor};
use crate::model::random_forest::ForestParams;
use anyhow::{Context, Result};
use log::info;
use serde::Serialize;

/// Values tried for each hyperparameter; every combination is scored.
#[derive(Debug, Clone)]
pub struct ParamGrid {
    pub n_estimators: Vec<usize>,
    pub max_depth: Vec<Option<usize>>,
    pub min_samples_split: Vec<usize>,
}

impl Default for ParamGrid {
    fn default() -> Self {
        Self {
            n_estimators: vec![50, 100, 200],
            max_depth: vec![None, Some(10), Some(20)],
            min_samples_split: vec![2, 5, 10],
        }
    }
}

impl ParamGrid {
    /// Combinations layered over `base`. Kinds without an ensemble only vary
    /// depth and split size.
    pub fn candidates(&self, kind: ModelKind, base: &ForestParams) -> Vec<ForestParams> {
        let estimators = if kind.is_ensemble() {
            self.n_estimators.clone()
        } else {
            vec![base.n_estimators]
        };
        let mut out = Vec::new();
        for &max_depth in &self.max_depth {
            for &min_samples_split in &self.min_samples_split {
                for &n_estimators in &estimators {
                    out.push(ForestParams {
                        n_estimators,
                        max_depth,
                        min_samples_split,
                        ..*base
                    });
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Tuned {
    pub params: ForestParams,
    /// Mean validation R² across folds.
    pub score: f64,
    pub evaluated: usize,
}

/// Grid search with k-fold cross-validation scored by R². The best
/// combination (earliest on ties) is refitted on all of `data`.
pub fn tune_hyperparameters(
    kind: ModelKind,
    data: &Dataset,
    base: &ForestParams,
    grid: &ParamGrid,
    folds: usize,
) -> Result<(Model, Tuned)> {
    let splits = data.k_fold(folds).context("building cross-validation folds")?;
    let candidates = grid.candidates(kind, base);

    let mut best: Option<Tuned> = None;
    for params in &candidates {
        let mut total = 0.0;
        for (train_idx, valid_idx) in &splits {
            let train = data.subset(train_idx);
            let valid = data.subset(valid_idx);
            let mut model = kind.build(*params);
            model.fit(&train)?;
            let predicted = model.predict(&valid.features)?;
            total += metrics::r2(&valid.labels, &predicted);
        }
        let score = total / splits.len() as f64;
        info!("{:?} -> mean r2 {:.4}", params, score);

        if best.as_ref().is_none_or(|b| score > b.score) {
            best = Some(Tuned {
                params: *params,
                score,
                evaluated: candidates.len(),
            });
        }
    }

    let tuned = best.context("parameter grid is empty")?;
    let mut model = kind.build(tuned.params);
    model.fit(data).context("refitting best parameters")?;
    Ok((model, tuned))
}
