//! Per-asset technical indicators.
//!
//! Every series is computed over one asset's candles sorted by timestamp.
//! Values that are undefined during a warm-up window (or because of a 0/0)
//! are `None`; [`IndicatorRow::complete`] drops such rows before upload.

use crate::candles::Candle;
use crate::config::IndicatorConfig;
use crate::warehouse::rows::{deserialize_f64, deserialize_timestamp, serialize_timestamp};
use crate::warehouse::{FieldKind, FieldSchema, TableRecord};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ta::Next;
use ta::indicators::{
    ExponentialMovingAverage, MovingAverageConvergenceDivergence, SimpleMovingAverage, TrueRange,
};

/// Model features, in column order.
pub const FEATURE_NAMES: [&str; 17] = [
    "open_price",
    "high_price",
    "low_price",
    "close_price",
    "volume",
    "ema_20",
    "ema_50",
    "rsi_14",
    "bollinger_mid",
    "bollinger_std",
    "bollinger_upper",
    "bollinger_lower",
    "macd",
    "macd_signal",
    "mfi_14",
    "z_score",
    "atr_14",
];

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorRow {
    pub candle: Candle,
    pub ema_20: Option<f64>,
    pub ema_50: Option<f64>,
    pub rsi_14: Option<f64>,
    pub bollinger_mid: Option<f64>,
    pub bollinger_std: Option<f64>,
    pub bollinger_upper: Option<f64>,
    pub bollinger_lower: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub mfi_14: Option<f64>,
    pub z_score: Option<f64>,
    pub atr_14: Option<f64>,
}

impl IndicatorRow {
    /// The row with every indicator defined and every value finite, or `None`.
    pub fn complete(&self) -> Option<TechnicalRow> {
        let c = &self.candle;
        let row = TechnicalRow {
            asset: c.asset.clone(),
            timestamp: c.timestamp,
            open_price: c.open_price,
            high_price: c.high_price,
            low_price: c.low_price,
            close_price: c.close_price,
            volume: c.volume,
            ema_20: self.ema_20?,
            ema_50: self.ema_50?,
            rsi_14: self.rsi_14?,
            bollinger_mid: self.bollinger_mid?,
            bollinger_std: self.bollinger_std?,
            bollinger_upper: self.bollinger_upper?,
            bollinger_lower: self.bollinger_lower?,
            macd: self.macd?,
            macd_signal: self.macd_signal?,
            mfi_14: self.mfi_14?,
            z_score: self.z_score?,
            atr_14: self.atr_14?,
        };
        row.features().iter().all(|v| v.is_finite()).then_some(row)
    }
}

/// A row of the technicals table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TechnicalRow {
    pub asset: String,
    #[serde(
        serialize_with = "serialize_timestamp",
        deserialize_with = "deserialize_timestamp"
    )]
    pub timestamp: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_f64")]
    pub open_price: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub high_price: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub low_price: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub close_price: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub volume: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub ema_20: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub ema_50: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub rsi_14: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub bollinger_mid: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub bollinger_std: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub bollinger_upper: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub bollinger_lower: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub macd: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub macd_signal: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub mfi_14: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub z_score: f64,
    #[serde(deserialize_with = "deserialize_f64")]
    pub atr_14: f64,
}

impl TechnicalRow {
    /// Feature vector in [`FEATURE_NAMES`] order.
    pub fn features(&self) -> Vec<f64> {
        vec![
            self.open_price,
            self.high_price,
            self.low_price,
            self.close_price,
            self.volume,
            self.ema_20,
            self.ema_50,
            self.rsi_14,
            self.bollinger_mid,
            self.bollinger_std,
            self.bollinger_upper,
            self.bollinger_lower,
            self.macd,
            self.macd_signal,
            self.mfi_14,
            self.z_score,
            self.atr_14,
        ]
    }
}

impl TableRecord for TechnicalRow {
    fn schema() -> Vec<FieldSchema> {
        let mut schema = vec![
            FieldSchema::new("asset", FieldKind::String),
            FieldSchema::new("timestamp", FieldKind::Timestamp),
        ];
        schema.extend(FEATURE_NAMES.iter().map(|name| FieldSchema::new(name, FieldKind::Float)));
        schema
    }
}

// --- Series helpers ---

fn invalid_period(name: &str, period: usize) -> anyhow::Error {
    anyhow!("invalid {} period: {}", name, period)
}

/// EMA seeded with the first value, `alpha = 2 / (span + 1)`.
pub fn ema(values: &[f64], span: usize) -> Result<Vec<f64>> {
    let mut indicator =
        ExponentialMovingAverage::new(span).map_err(|_| invalid_period("EMA", span))?;
    Ok(values.iter().map(|&v| indicator.next(v)).collect())
}

/// Mean of the trailing `window` values; `None` until the window is full.
pub fn rolling_mean(values: &[f64], window: usize) -> Result<Vec<Option<f64>>> {
    let mut indicator =
        SimpleMovingAverage::new(window).map_err(|_| invalid_period("SMA", window))?;
    Ok(values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let mean = indicator.next(v);
            (i + 1 >= window).then_some(mean)
        })
        .collect())
}

fn is_flat(slice: &[f64]) -> bool {
    slice.iter().all(|&x| x == slice[0])
}

/// Mean of each full trailing window, summed afresh per window. A window of
/// identical values has exactly that value as its mean.
fn window_mean(values: &[f64], window: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if window == 0 || i + 1 < window {
                return None;
            }
            let slice = &values[i + 1 - window..=i];
            if is_flat(slice) {
                return Some(slice[0]);
            }
            Some(slice.iter().sum::<f64>() / window as f64)
        })
        .collect()
}

/// Sample standard deviation (n - 1) of the trailing `window` values;
/// exactly 0 over a window of identical values.
pub fn rolling_std(values: &[f64], window: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if window < 2 || i + 1 < window {
                return None;
            }
            let slice = &values[i + 1 - window..=i];
            if is_flat(slice) {
                return Some(0.0);
            }
            let mean = slice.iter().sum::<f64>() / window as f64;
            let var = slice.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (window - 1) as f64;
            Some(var.sqrt())
        })
        .collect()
}

/// Trailing sums over a full window.
fn rolling_sum(values: &[f64], window: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if window == 0 || i + 1 < window {
                None
            } else {
                Some(values[i + 1 - window..=i].iter().sum())
            }
        })
        .collect()
}

/// `100 - 100 / (1 + up / down)`, with 0/0 undefined and x/0 pinned at 100.
fn oscillator(up: f64, down: f64) -> Option<f64> {
    if down == 0.0 {
        return (up > 0.0).then_some(100.0);
    }
    Some(100.0 - 100.0 / (1.0 + up / down))
}

/// RSI over simple averages of gains and losses. The averages use whatever
/// history is available, so the series is defined from the second row.
pub fn rsi(closes: &[f64], period: usize) -> Result<Vec<Option<f64>>> {
    if period == 0 {
        return Err(invalid_period("RSI", period));
    }
    let mut gains = Vec::with_capacity(closes.len());
    let mut losses = Vec::with_capacity(closes.len());
    for i in 0..closes.len() {
        let delta = if i == 0 { 0.0 } else { closes[i] - closes[i - 1] };
        gains.push(delta.max(0.0));
        losses.push((-delta).max(0.0));
    }

    Ok((0..closes.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(period);
            let n = (i + 1 - start) as f64;
            let avg_gain = gains[start..=i].iter().sum::<f64>() / n;
            let avg_loss = losses[start..=i].iter().sum::<f64>() / n;
            oscillator(avg_gain, avg_loss)
        })
        .collect())
}

/// Money flow index over `period` rows of typical-price money flow.
pub fn mfi(candles: &[Candle], period: usize) -> Result<Vec<Option<f64>>> {
    if period == 0 {
        return Err(invalid_period("MFI", period));
    }
    let typical: Vec<f64> = candles.iter().map(Candle::typical_price).collect();
    let mut positive = vec![0.0; candles.len()];
    let mut negative = vec![0.0; candles.len()];
    for i in 1..candles.len() {
        let flow = typical[i] * candles[i].volume;
        if typical[i] > typical[i - 1] {
            positive[i] = flow;
        } else if typical[i] < typical[i - 1] {
            negative[i] = flow;
        }
    }

    let pos_sums = rolling_sum(&positive, period);
    let neg_sums = rolling_sum(&negative, period);
    Ok(pos_sums
        .into_iter()
        .zip(neg_sums)
        .map(|(pos, neg)| oscillator(pos?, neg?))
        .collect())
}

/// Mean true range; the first row's range is `high - low`.
pub fn atr(candles: &[Candle], period: usize) -> Result<Vec<Option<f64>>> {
    let mut true_range = TrueRange::new();
    let ranges: Vec<f64> = candles.iter().map(|c| true_range.next(c)).collect();
    rolling_mean(&ranges, period)
}

/// Computes every indicator for one asset. `candles` must be sorted by
/// timestamp and belong to a single asset.
pub fn compute_indicators(candles: &[Candle], config: &IndicatorConfig) -> Result<Vec<IndicatorRow>> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close_price).collect();

    let ema_fast = ema(&closes, config.ema_fast)?;
    let ema_slow = ema(&closes, config.ema_slow)?;
    let rsi = rsi(&closes, config.rsi_period)?;

    let boll_mid = rolling_mean(&closes, config.bollinger_period)?;
    let boll_std = rolling_std(&closes, config.bollinger_period);

    let mut macd_indicator =
        MovingAverageConvergenceDivergence::new(config.macd_fast, config.macd_slow, config.macd_signal)
            .map_err(|_| {
                anyhow!(
                    "invalid MACD periods: {}/{}/{}",
                    config.macd_fast,
                    config.macd_slow,
                    config.macd_signal
                )
            })?;
    let macd: Vec<(f64, f64)> = closes
        .iter()
        .map(|&c| {
            let out = macd_indicator.next(c);
            (out.macd, out.signal)
        })
        .collect();

    let mfi = mfi(candles, config.mfi_period)?;

    if config.zscore_period == 0 {
        return Err(invalid_period("z-score", config.zscore_period));
    }
    let z_mean = window_mean(&closes, config.zscore_period);
    let z_std = rolling_std(&closes, config.zscore_period);

    let atr = atr(candles, config.atr_period)?;

    let rows = candles
        .iter()
        .enumerate()
        .map(|(i, candle)| {
            let (upper, lower) = match (boll_mid[i], boll_std[i]) {
                (Some(mid), Some(std)) => (
                    Some(mid + std * config.bollinger_k),
                    Some(mid - std * config.bollinger_k),
                ),
                _ => (None, None),
            };
            let z_score = match (z_mean[i], z_std[i]) {
                (Some(mean), Some(std)) if std > 0.0 => Some((candle.close_price - mean) / std),
                _ => None,
            };

            IndicatorRow {
                candle: candle.clone(),
                ema_20: Some(ema_fast[i]),
                ema_50: Some(ema_slow[i]),
                rsi_14: rsi[i],
                bollinger_mid: boll_mid[i],
                bollinger_std: boll_std[i],
                bollinger_upper: upper,
                bollinger_lower: lower,
                macd: Some(macd[i].0),
                macd_signal: Some(macd[i].1),
                mfi_14: mfi[i],
                z_score,
                atr_14: atr[i],
            }
        })
        .collect();

    Ok(rows)
}

/// Keeps only the rows where every indicator is defined.
pub fn complete_rows(rows: &[IndicatorRow]) -> Vec<TechnicalRow> {
    rows.iter().filter_map(IndicatorRow::complete).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candles::tests::hourly;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn ema_is_seeded_with_first_value() {
        let out = ema(&[1.0, 2.0, 3.0], 3).unwrap();
        assert_close(out[0], 1.0);
        assert_close(out[1], 1.5);
        assert_close(out[2], 2.25);
    }

    #[test]
    fn rolling_windows_wait_for_a_full_window() {
        let values = [1.0, 2.0, 3.0, 4.0];
        let mean = rolling_mean(&values, 3).unwrap();
        let std = rolling_std(&values, 3);

        assert_eq!(mean[..2], [None, None]);
        assert_close(mean[2].unwrap(), 2.0);
        assert_close(mean[3].unwrap(), 3.0);
        assert_eq!(std[1], None);
        assert_close(std[2].unwrap(), 1.0);
        assert_close(std[3].unwrap(), 1.0);
    }

    #[test]
    fn rsi_uses_simple_averages_with_partial_windows() {
        let out = rsi(&[1.0, 2.0, 1.0, 3.0], 2).unwrap();
        assert_eq!(out[0], None);
        assert_close(out[1].unwrap(), 100.0);
        assert_close(out[2].unwrap(), 50.0);
        assert_close(out[3].unwrap(), 100.0 - 100.0 / 3.0);
    }

    #[test]
    fn flat_prices_leave_rsi_undefined() {
        let out = rsi(&[5.0, 5.0, 5.0], 14).unwrap();
        assert!(out.iter().all(Option::is_none));
    }

    #[test]
    fn mfi_splits_flow_by_typical_price_direction() {
        // typical price equals close for these candles
        let candles = hourly("BTC", &[1.0, 2.0, 1.0]);
        let out = mfi(&candles, 2).unwrap();

        assert_eq!(out[0], None);
        assert_close(out[1].unwrap(), 100.0);
        let positive = 2.0 * 101.0;
        let negative = 1.0 * 102.0;
        assert_close(out[2].unwrap(), 100.0 * positive / (positive + negative));
    }

    #[test]
    fn atr_averages_true_range_including_gaps() {
        let mut candles = hourly("BTC", &[10.0, 10.0, 20.0]);
        // a gap up: prior close 10, current range 19..21
        candles[2].low_price = 19.0;
        candles[2].high_price = 21.0;

        let out = atr(&candles, 2).unwrap();
        assert_eq!(out[0], None);
        assert_close(out[1].unwrap(), 2.0);
        assert_close(out[2].unwrap(), (2.0 + 11.0) / 2.0);
    }

    #[test]
    fn complete_rows_drop_the_warm_up() {
        let closes: Vec<f64> = (0..80).map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0).collect();
        let candles = hourly("ETH", &closes);
        let config = IndicatorConfig::default();

        let rows = compute_indicators(&candles, &config).unwrap();
        assert_eq!(rows.len(), 80);
        assert!(rows[0].bollinger_mid.is_none());
        assert!(rows[18].z_score.is_none());
        assert!(rows[19].bollinger_mid.is_some());

        let complete = complete_rows(&rows);
        // bollinger and z-score need 20 rows, which dominates every other warm-up
        assert_eq!(complete.len(), 61);
        let first = &complete[0];
        assert_eq!(first.timestamp, candles[19].timestamp);
        assert_close(first.bollinger_upper - first.bollinger_mid, 2.0 * first.bollinger_std);
        assert_eq!(first.features().len(), FEATURE_NAMES.len());
    }

    #[test]
    fn macd_signal_trails_the_line() {
        let closes: Vec<f64> = (0..40).map(|i| i as f64).collect();
        let candles = hourly("SOL", &closes);
        let rows = compute_indicators(&candles, &IndicatorConfig::default()).unwrap();

        let fast = ema(&closes, 12).unwrap();
        let slow = ema(&closes, 26).unwrap();
        assert_close(rows[39].macd.unwrap(), fast[39] - slow[39]);
        assert!(rows[39].macd_signal.unwrap() < rows[39].macd.unwrap());
    }

    #[test]
    fn zero_period_is_rejected() {
        let candles = hourly("BTC", &[1.0, 2.0]);
        let config = IndicatorConfig {
            rsi_period: 0,
            ..Default::default()
        };
        assert!(compute_indicators(&candles, &config).is_err());
    }

    #[test]
    fn flat_windows_have_zero_std_and_no_z_score() {
        for price in [0.1, 0.3, 1.1, 29876.43] {
            let candles = hourly("BTC", &[price; 25]);
            let rows = compute_indicators(&candles, &IndicatorConfig::default()).unwrap();

            assert_eq!(rows[24].bollinger_std, Some(0.0), "price {}", price);
            assert_eq!(rows[24].bollinger_upper, rows[24].bollinger_mid);
            assert_eq!(rows[24].z_score, None, "price {}", price);
            assert!(complete_rows(&rows).is_empty());
        }
    }

    #[test]
    fn window_mean_is_exact_over_identical_values() {
        let out = window_mean(&[0.1; 5], 3);
        assert_eq!(out, vec![None, None, Some(0.1), Some(0.1), Some(0.1)]);
        assert_eq!(rolling_std(&[0.3; 4], 3)[3], Some(0.0));
    }

    #[test]
    fn mfi_is_undefined_without_any_flow() {
        let candles = hourly("BTC", &[7.0; 6]);
        let out = mfi(&candles, 3).unwrap();
        assert!(out.iter().all(Option::is_none));
    }

    #[test]
    fn mfi_waits_for_a_full_period() {
        let closes: Vec<f64> = (0..8).map(|i| 10.0 + (i % 3) as f64).collect();
        let out = mfi(&hourly("ETH", &closes), 4).unwrap();
        assert!(out[..3].iter().all(Option::is_none));
        assert!(out[3..].iter().all(Option::is_some));
    }

    #[test]
    fn non_finite_values_are_not_complete() {
        let closes: Vec<f64> = (0..80).map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0).collect();
        let mut rows = compute_indicators(&hourly("ETH", &closes), &IndicatorConfig::default()).unwrap();
        assert!(rows[79].complete().is_some());

        rows[79].candle.volume = f64::NAN;
        rows[78].macd = Some(f64::INFINITY);
        assert!(rows[79].complete().is_none());
        assert!(rows[78].complete().is_none());
        assert_eq!(complete_rows(&rows).len(), 59);
    }
}
