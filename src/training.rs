//! Model training on the technicals table.
//!
//! Each asset's rows are labelled with the close `h` hours ahead, where `h`
//! is the asset's optimal timeframe, then all assets are pooled into one
//! dataset and split 80/20.

use crate::config::AppConfig;
use crate::error::WarehouseError;
use crate::indicator_cache;
use crate::indicators::TechnicalRow;
use crate::model::{self, Dataset, ForestParams, ModelKind, ParamGrid, Regressor, Scores, Split, Tuned};
use crate::storage_utils::AsyncStorageManager;
use crate::timeframe::{self, OptimalTimeframe};
use crate::warehouse::rows::{deserialize_f64, deserialize_timestamp, serialize_timestamp};
use crate::warehouse::{self, FieldKind, FieldSchema, TableRecord, Warehouse, WriteMode};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

const CV_FOLDS: usize = 3;

/// Forecast horizon per asset, read from the optimal timeframes table.
/// A missing table yields an empty map.
pub async fn load_horizons(
    warehouse: &dyn Warehouse,
    config: &AppConfig,
) -> Result<BTreeMap<String, usize>> {
    let table = config.warehouse.optimal_timeframes()?;
    let sql = format!(
        "SELECT asset, timeframe, mae, mse, r2, rmse\nFROM {}",
        table.sql()
    );
    match warehouse::fetch::<OptimalTimeframe>(warehouse, &sql).await {
        Ok(rows) => Ok(rows.into_iter().map(|r| (r.asset, r.timeframe)).collect()),
        Err(WarehouseError::NotFound(_)) => {
            warn!(
                "{} not found, every asset uses the default {}h horizon",
                table, config.model.default_horizon
            );
            Ok(BTreeMap::new())
        }
        Err(e) => Err(e).context("fetching optimal timeframes"),
    }
}

/// One pooled dataset from every asset's horizon dataset.
pub fn build_dataset(
    rows: Vec<TechnicalRow>,
    horizons: &BTreeMap<String, usize>,
    default_horizon: usize,
) -> Result<Dataset> {
    let mut per_asset: BTreeMap<String, Vec<TechnicalRow>> = BTreeMap::new();
    for row in rows {
        per_asset.entry(row.asset.clone()).or_default().push(row);
    }

    let mut data = Dataset::new(timeframe::feature_names());
    for (asset, mut rows) in per_asset {
        rows.sort_by_key(|r| r.timestamp);
        let horizon = horizons.get(&asset).copied().unwrap_or(default_horizon);
        let labelled = timeframe::horizon_dataset(&rows, horizon)?;
        info!("{}: {} samples at {}h", asset, labelled.len(), horizon);
        data.extend(labelled)?;
    }
    Ok(data)
}

pub async fn load_data(warehouse: &dyn Warehouse, config: &AppConfig) -> Result<Split> {
    println!("📡 Fetching data from BigQuery...");
    let rows = indicator_cache::fetch_technicals(warehouse, config).await?;
    if rows.is_empty() {
        bail!("the technicals table has no rows in the lookback window");
    }
    let horizons = load_horizons(warehouse, config).await?;
    indicator_cache::print_head(&rows, 5)?;

    let data = build_dataset(rows, &horizons, config.model.default_horizon)?;
    println!(
        "✅ Data loaded! Total rows: {}, Features: {}",
        data.len(),
        data.n_features()
    );
    data.train_test_split(config.model.test_size, config.model.seed)
}

/// Metrics of one training run, printed as JSON.
#[derive(Serialize, Debug, Clone)]
pub struct TrainingMetrics {
    pub model: String,
    pub r2_score: f64,
    pub mae: f64,
    pub mse: f64,
    pub rmse: f64,
    pub feature_importances: BTreeMap<String, f64>,
    /// Hyperparameters of the fitted model, tuned or configured.
    pub params: serde_json::Value,
}

/// A row of the model results table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelRun {
    pub model: String,
    #[serde(deserialize_with = "deserialize_f64")]
    pub r2_score: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub mae: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub mse: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub rmse: f64,
    /// JSON object of feature name to importance.
    pub feature_importances: String,
    /// JSON object of the model's hyperparameters.
    #[serde(default)]
    pub params: String,
    #[serde(
        serialize_with = "serialize_timestamp",
        deserialize_with = "deserialize_timestamp"
    )]
    pub timestamp: DateTime<Utc>,
}

impl TableRecord for ModelRun {
    fn schema() -> Vec<FieldSchema> {
        vec![
            FieldSchema::new("model", FieldKind::String),
            FieldSchema::new("r2_score", FieldKind::Float),
            FieldSchema::new("mae", FieldKind::Float),
            FieldSchema::new("mse", FieldKind::Float),
            FieldSchema::new("rmse", FieldKind::Float),
            FieldSchema::new("feature_importances", FieldKind::String),
            FieldSchema::new("params", FieldKind::String),
            FieldSchema::new("timestamp", FieldKind::Timestamp),
        ]
    }
}

impl ModelRun {
    pub fn new(metrics: &TrainingMetrics, timestamp: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            model: metrics.model.clone(),
            r2_score: metrics.r2_score,
            mae: metrics.mae,
            mse: metrics.mse,
            rmse: metrics.rmse,
            feature_importances: serde_json::to_string(&metrics.feature_importances)?,
            params: metrics.params.to_string(),
            timestamp,
        })
    }
}

#[derive(Debug)]
pub struct TrainingReport {
    pub metrics: TrainingMetrics,
    pub model_path: PathBuf,
    pub tuned: Option<Tuned>,
}

pub async fn train(
    warehouse: &dyn Warehouse,
    storage: &AsyncStorageManager,
    config: &AppConfig,
    kind: ModelKind,
    tune: bool,
) -> Result<TrainingReport> {
    // Step 1: Load data
    let split = load_data(warehouse, config).await?;

    // Step 2: Train
    println!("🎯 Training `{}` model...", kind);
    let params = ForestParams::from(&config.model);
    let (model, tuned) = if tune {
        println!("🔍 Tuning hyperparameters...");
        let (model, tuned) = model::tune_hyperparameters(
            kind,
            &split.train,
            &params,
            &ParamGrid::default(),
            CV_FOLDS,
        )?;
        println!(
            "✅ Best parameters: n_estimators={}, max_depth={:?}, min_samples_split={} (cv r2 {:.4})",
            tuned.params.n_estimators,
            tuned.params.max_depth,
            tuned.params.min_samples_split,
            tuned.score
        );
        (model, Some(tuned))
    } else {
        let mut model = kind.build(params);
        model.fit(&split.train).context("fitting model")?;
        (model, None)
    };

    // Step 3: Evaluate
    println!("📊 Evaluating model performance...");
    let predicted = model.predict(&split.test.features)?;
    let scores = Scores::evaluate(&split.test.labels, &predicted)?;
    let metrics = TrainingMetrics {
        model: kind.to_string(),
        r2_score: scores.r2,
        mae: scores.mae,
        mse: scores.mse,
        rmse: scores.rmse,
        feature_importances: split
            .train
            .feature_names
            .iter()
            .cloned()
            .zip(model.feature_importances().iter().copied())
            .collect(),
        params: model.params_json()?,
    };
    println!("{}", serde_json::to_string_pretty(&metrics)?);

    // Step 4: Save and log
    let model_path = model::save_model(storage, &config.model, &model).await?;
    let run = ModelRun::new(&metrics, Utc::now())?;
    println!("📡 Uploading model results to BigQuery...");
    warehouse::upload(
        warehouse,
        &config.warehouse.model_results()?,
        &[run],
        WriteMode::Append,
    )
    .await
    .context("appending model results")?;
    println!("✅ Training complete! `{}` results saved locally & in BigQuery!", kind);

    Ok(TrainingReport {
        metrics,
        model_path,
        tuned,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::timeframe::tests::technicals;
    use crate::warehouse::QueryResult;
    use crate::warehouse::memory::MemoryWarehouse;

    fn config() -> AppConfig {
        AppConfig {
            model: ModelConfig {
                n_estimators: 3,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn warehouse_with_technicals(config: &AppConfig) -> MemoryWarehouse {
        let mut rows = technicals("BTC", 60);
        rows.extend(technicals("ETH", 50));
        let warehouse = MemoryWarehouse::new();
        warehouse.insert_table(
            &config.warehouse.technicals().unwrap(),
            QueryResult::from_records(&rows).unwrap(),
        );
        warehouse
    }

    #[test]
    fn each_asset_uses_its_own_horizon() {
        let mut rows = technicals("BTC", 30);
        rows.extend(technicals("ETH", 30));
        rows.reverse();
        let horizons: BTreeMap<String, usize> = [("BTC".to_string(), 4)].into_iter().collect();

        let data = build_dataset(rows, &horizons, 1).unwrap();

        // 11 complete rows each: BTC loses 4 to its horizon, ETH loses 1
        assert_eq!(data.len(), 7 + 10);
    }

    #[tokio::test]
    async fn missing_timeframes_table_falls_back() {
        let config = config();
        let warehouse = MemoryWarehouse::new();
        assert!(load_horizons(&warehouse, &config).await.unwrap().is_empty());

        let stored = vec![OptimalTimeframe {
            asset: "BTC".to_string(),
            timeframe: 6,
            mae: 1.0,
            mse: 1.0,
            r2: 0.5,
            rmse: 1.0,
        }];
        warehouse.insert_table(
            &config.warehouse.optimal_timeframes().unwrap(),
            QueryResult::from_records(&stored).unwrap(),
        );
        let horizons = load_horizons(&warehouse, &config).await.unwrap();
        assert_eq!(horizons["BTC"], 6);
    }

    #[tokio::test]
    async fn training_saves_the_model_and_appends_a_run() {
        let config = config();
        let warehouse = warehouse_with_technicals(&config);
        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncStorageManager::new(dir.path()).await.unwrap();

        let first = train(&warehouse, &storage, &config, ModelKind::RandomForest, false)
            .await
            .unwrap();
        train(&warehouse, &storage, &config, ModelKind::RandomForest, false)
            .await
            .unwrap();

        assert!(first.model_path.exists());
        assert!(first.tuned.is_none());
        assert_eq!(first.metrics.feature_importances.len(), 17);
        assert!((first.metrics.rmse - first.metrics.mse.sqrt()).abs() < 1e-9);

        let results = warehouse
            .table(&config.warehouse.model_results().unwrap())
            .unwrap();
        let runs: Vec<ModelRun> = results.records().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].model, "random_forest");
        let importances: BTreeMap<String, f64> =
            serde_json::from_str(&runs[0].feature_importances).unwrap();
        assert!(importances.contains_key("rsi_14"));
    }

    #[tokio::test]
    async fn empty_technicals_fail() {
        let config = config();
        let warehouse = MemoryWarehouse::new();
        warehouse.insert_table(
            &config.warehouse.technicals().unwrap(),
            QueryResult::from_records::<TechnicalRow>(&[]).unwrap(),
        );
        assert!(load_data(&warehouse, &config).await.is_err());
    }

    #[tokio::test]
    async fn tuned_parameters_are_saved_with_the_run() {
        let config = config();
        let warehouse = warehouse_with_technicals(&config);
        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncStorageManager::new(dir.path()).await.unwrap();

        let report = train(&warehouse, &storage, &config, ModelKind::DecisionTree, true)
            .await
            .unwrap();

        let tuned = report.tuned.unwrap();
        assert_eq!(tuned.evaluated, 9);
        assert_eq!(report.metrics.params["max_depth"], serde_json::json!(tuned.params.max_depth));
        assert_eq!(
            report.metrics.params["min_samples_split"],
            tuned.params.min_samples_split
        );

        let saved = model::load_model(&storage, &config.model, ModelKind::DecisionTree)
            .await
            .unwrap();
        assert_eq!(saved.params_json().unwrap(), report.metrics.params);

        let runs: Vec<ModelRun> = warehouse
            .table(&config.warehouse.model_results().unwrap())
            .unwrap()
            .records()
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].model, "decision_tree");
        let params: serde_json::Value = serde_json::from_str(&runs[0].params).unwrap();
        assert_eq!(params, report.metrics.params);
    }
}
