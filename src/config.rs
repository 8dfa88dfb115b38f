use crate::storage_utils::AsyncStorageManager;
use crate::warehouse::TablePath;
use anyhow::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// CONFIGURATION STRUCTS
// Every field has a default, so a partial config.json is enough.

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WarehouseConfig {
    pub project_id: String,
    pub dataset_id: String,
    pub raw_table: String,
    pub technicals_table: String,
    pub optimal_timeframes_table: String,
    pub model_results_table: String,
    /// Tables printed by `sample`.
    pub sample_tables: Vec<String>,
    /// Service account key file. Ambient credentials are used when unset.
    pub credentials_path: Option<PathBuf>,
    /// Job location, e.g. "US". Left to the service when unset.
    pub location: Option<String>,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            project_id: "cloud4marketing-281206".to_string(),
            dataset_id: "crypto_price".to_string(),
            raw_table: "coinbase_hourly_prices".to_string(),
            technicals_table: "technical_indicators".to_string(),
            optimal_timeframes_table: "optimal_timeframes".to_string(),
            model_results_table: "model_results".to_string(),
            sample_tables: vec![
                "coinbase_coins".to_string(),
                "coinbase_hourly_data".to_string(),
                "coinbase_hourly_data_v2".to_string(),
            ],
            credentials_path: None,
            location: None,
        }
    }
}

impl WarehouseConfig {
    pub fn table(&self, table: &str) -> Result<TablePath> {
        Ok(TablePath::new(&self.project_id, &self.dataset_id, table)?)
    }

    pub fn raw(&self) -> Result<TablePath> {
        self.table(&self.raw_table)
    }

    pub fn technicals(&self) -> Result<TablePath> {
        self.table(&self.technicals_table)
    }

    pub fn optimal_timeframes(&self) -> Result<TablePath> {
        self.table(&self.optimal_timeframes_table)
    }

    pub fn model_results(&self) -> Result<TablePath> {
        self.table(&self.model_results_table)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct IndicatorConfig {
    pub lookback_months: u32,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub rsi_period: usize,
    pub bollinger_period: usize,
    pub bollinger_k: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub mfi_period: usize,
    pub zscore_period: usize,
    pub atr_period: usize,
    /// Forecast horizons in hours tried by the timeframe search.
    pub timeframes: Vec<usize>,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            lookback_months: 6,
            ema_fast: 20,
            ema_slow: 50,
            rsi_period: 14,
            bollinger_period: 20,
            bollinger_k: 2.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            mfi_period: 14,
            zscore_period: 20,
            atr_period: 14,
            timeframes: vec![1, 2, 4, 6, 12, 24],
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct QualityConfig {
    pub known_assets: Vec<String>,
    /// Gap in hours above which `time_gaps` reports a row.
    pub gap_hours: i64,
    /// Gap in hours at or above which `missing_consecutive_hours` reports a row.
    pub long_gap_hours: i64,
    pub price_jump_pct: f64,
    pub volume_percentile: f64,
    pub volume_outlier_multiplier: f64,
    pub volume_spike_ratio: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            known_assets: ["BTC", "ETH", "SOL", "ADA", "XRP", "LTC", "DOGE", "AVAX"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            gap_hours: 1,
            long_gap_hours: 5,
            price_jump_pct: 20.0,
            volume_percentile: 0.99,
            volume_outlier_multiplier: 2.0,
            volume_spike_ratio: 10.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub n_estimators: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub test_size: f64,
    pub seed: u64,
    /// Horizon used when an asset has no optimal timeframe on record.
    pub default_horizon: usize,
    /// Directory under the storage dir where trained models are written.
    pub models_dir: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "random_forest".to_string(),
            n_estimators: 100,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            test_size: 0.2,
            seed: 42,
            default_horizon: 1,
            models_dir: "models".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ExploreConfig {
    pub asset: String,
    pub limit: u32,
}

impl Default for ExploreConfig {
    fn default() -> Self {
        Self {
            asset: "BTC".to_string(),
            limit: 1000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub warehouse: WarehouseConfig,
    pub indicators: IndicatorConfig,
    pub quality: QualityConfig,
    pub model: ModelConfig,
    pub explore: ExploreConfig,
}

impl AppConfig {
    /// Loads `<name>.json` from storage, falling back to defaults when the
    /// file is absent, then applies environment overrides.
    pub async fn load(storage: &AsyncStorageManager, name: &str) -> Result<Self> {
        let mut config = if storage.exists(name).await {
            info!("loading config from {:?}", storage.path_of(name));
            storage.load::<AppConfig>(name).await?
        } else {
            warn!(
                "no config found at {:?}, using defaults",
                storage.path_of(name)
            );
            AppConfig::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = var("GOOGLE_APPLICATION_CREDENTIALS") {
            self.warehouse.credentials_path = Some(PathBuf::from(path));
        }
        if let Some(project) = var("WAREHOUSE_PROJECT_ID") {
            self.warehouse.project_id = project;
        }
        if let Some(dataset) = var("WAREHOUSE_DATASET_ID") {
            self.warehouse.dataset_id = dataset;
        }
        if let Some(model) = var("MODEL_NAME") {
            self.model.name = model;
        }
    }
}
