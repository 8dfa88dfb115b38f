//! Per-asset forecast-horizon search.
//!
//! For every configured horizon `h` the target is the close `h` rows ahead.
//! A model is fitted on a shuffled 80/20 split for each horizon and the
//! horizon with the lowest test RMSE is kept.

use crate::config::{IndicatorConfig, ModelConfig};
use crate::indicators::{FEATURE_NAMES, TechnicalRow};
use crate::model::{Dataset, ForestParams, ModelKind, Regressor, Scores};
use crate::warehouse::rows::{deserialize_f64, deserialize_usize};
use crate::warehouse::{FieldKind, FieldSchema, TableRecord};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// A row of the optimal timeframes table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OptimalTimeframe {
    pub asset: String,
    #[serde(deserialize_with = "deserialize_usize")]
    pub timeframe: usize,
    #[serde(deserialize_with = "deserialize_f64")]
    pub mae: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub mse: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub r2: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub rmse: f64,
}

impl TableRecord for OptimalTimeframe {
    fn schema() -> Vec<FieldSchema> {
        vec![
            FieldSchema::new("asset", FieldKind::String),
            FieldSchema::new("timeframe", FieldKind::Integer),
            FieldSchema::new("mae", FieldKind::Float),
            FieldSchema::new("mse", FieldKind::Float),
            FieldSchema::new("r2", FieldKind::Float),
            FieldSchema::new("rmse", FieldKind::Float),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HorizonScore {
    pub timeframe: usize,
    pub scores: Scores,
}

pub fn feature_names() -> Vec<String> {
    FEATURE_NAMES.iter().map(|s| s.to_string()).collect()
}

/// Features of each row labelled with the close `horizon` rows later.
/// `rows` must be one asset sorted by timestamp; the last `horizon` rows
/// have no target and are left out.
pub fn horizon_dataset(rows: &[TechnicalRow], horizon: usize) -> Result<Dataset> {
    let mut data = Dataset::new(feature_names());
    for (row, ahead) in rows.iter().zip(rows.iter().skip(horizon)) {
        data.push(row.features(), ahead.close_price)?;
    }
    Ok(data)
}

/// Lowest RMSE; the earliest horizon wins a tie.
pub fn pick_best(results: &[HorizonScore]) -> Option<HorizonScore> {
    results.iter().fold(None, |best: Option<HorizonScore>, candidate| match best {
        Some(b) if b.scores.rmse <= candidate.scores.rmse => Some(b),
        _ => Some(*candidate),
    })
}

/// Scores every horizon that leaves enough rows for a split.
pub fn evaluate_horizons(
    rows: &[TechnicalRow],
    horizons: &[usize],
    model: &ModelConfig,
) -> Result<Vec<HorizonScore>> {
    let kind: ModelKind = model.name.parse()?;
    let params = ForestParams::from(model);

    let mut results = Vec::with_capacity(horizons.len());
    for &timeframe in horizons {
        let data = horizon_dataset(rows, timeframe)?;
        let split = match data.train_test_split(model.test_size, model.seed) {
            Ok(split) => split,
            Err(e) => {
                debug!("skipping {}h horizon: {}", timeframe, e);
                continue;
            }
        };

        let mut regressor = kind.build(params);
        regressor
            .fit(&split.train)
            .with_context(|| format!("fitting {}h horizon", timeframe))?;
        let predicted = regressor.predict(&split.test.features)?;
        let scores = Scores::evaluate(&split.test.labels, &predicted)?;
        debug!("{}h horizon: rmse {:.6}", timeframe, scores.rmse);
        results.push(HorizonScore { timeframe, scores });
    }
    Ok(results)
}

/// `None` when no horizon has enough rows.
pub fn optimal_timeframe(
    asset: &str,
    rows: &[TechnicalRow],
    indicators: &IndicatorConfig,
    model: &ModelConfig,
) -> Result<Option<OptimalTimeframe>> {
    let results = evaluate_horizons(rows, &indicators.timeframes, model)
        .with_context(|| format!("searching timeframes for {}", asset))?;

    let Some(best) = pick_best(&results) else {
        warn!("{}: {} rows are too few for any horizon, skipped", asset, rows.len());
        return Ok(None);
    };
    info!("{}: optimal timeframe {}h (rmse {:.6})", asset, best.timeframe, best.scores.rmse);

    Ok(Some(OptimalTimeframe {
        asset: asset.to_string(),
        timeframe: best.timeframe,
        mae: best.scores.mae,
        mse: best.scores.mse,
        r2: best.scores.r2,
        rmse: best.scores.rmse,
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::candles::tests::hourly;
    use crate::indicators::{complete_rows, compute_indicators};

    pub(crate) fn technicals(asset: &str, n: usize) -> Vec<TechnicalRow> {
        let closes: Vec<f64> = (0..n)
            .map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.1)
            .collect();
        let candles = hourly(asset, &closes);
        let rows = compute_indicators(&candles, &IndicatorConfig::default()).unwrap();
        complete_rows(&rows)
    }

    fn quick_model() -> ModelConfig {
        ModelConfig {
            n_estimators: 5,
            ..Default::default()
        }
    }

    fn score(timeframe: usize, rmse: f64) -> HorizonScore {
        HorizonScore {
            timeframe,
            scores: Scores {
                mae: 0.0,
                mse: rmse * rmse,
                rmse,
                r2: 0.0,
            },
        }
    }

    #[test]
    fn targets_are_shifted_closes() {
        let rows = technicals("BTC", 40);
        let data = horizon_dataset(&rows, 4).unwrap();

        assert_eq!(data.len(), rows.len() - 4);
        assert_eq!(data.n_features(), 17);
        assert_eq!(data.labels[0], rows[4].close_price);
        assert_eq!(data.features[0][3], rows[0].close_price);
        assert!(horizon_dataset(&rows, rows.len() + 1).unwrap().is_empty());
    }

    #[test]
    fn lowest_rmse_wins_and_ties_keep_the_first() {
        let results = [score(1, 2.0), score(2, 1.0), score(4, 1.0), score(6, 3.0)];
        assert_eq!(pick_best(&results).unwrap().timeframe, 2);
        assert!(pick_best(&[]).is_none());
    }

    #[test]
    fn search_returns_one_of_the_configured_horizons() {
        let rows = technicals("ETH", 150);
        let indicators = IndicatorConfig::default();

        let best = optimal_timeframe("ETH", &rows, &indicators, &quick_model())
            .unwrap()
            .unwrap();
        let again = optimal_timeframe("ETH", &rows, &indicators, &quick_model())
            .unwrap()
            .unwrap();

        assert_eq!(best, again);
        assert_eq!(best.asset, "ETH");
        assert!(indicators.timeframes.contains(&best.timeframe));
        assert!((best.rmse - best.mse.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn too_few_rows_are_skipped() {
        let rows = technicals("SOL", 21);
        assert_eq!(rows.len(), 2);
        let found =
            optimal_timeframe("SOL", &rows, &IndicatorConfig::default(), &quick_model()).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn unknown_model_names_fail() {
        let rows = technicals("BTC", 60);
        let model = ModelConfig {
            name: "svm".to_string(),
            ..Default::default()
        };
        assert!(optimal_timeframe("BTC", &rows, &IndicatorConfig::default(), &model).is_err());
    }

    #[test]
    fn rows_decode_from_warehouse_strings() {
        let json = r#"{"asset":"BTC","timeframe":"4","mae":"1.5","mse":"4.0","r2":"0.9","rmse":"2.0"}"#;
        let row: OptimalTimeframe = serde_json::from_str(json).unwrap();
        assert_eq!(row.timeframe, 4);
        assert_eq!(row.rmse, 2.0);
    }
}
