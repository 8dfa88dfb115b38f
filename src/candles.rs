use crate::warehouse::rows::{
    deserialize_f64, deserialize_f64_lenient, deserialize_timestamp, parse_timestamp,
    serialize_timestamp,
};
use crate::warehouse::{self, FieldKind, FieldSchema, TablePath, TableRecord, Warehouse};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CANDLE_COLUMNS: &str =
    "asset, timestamp, open_price, high_price, low_price, close_price, volume";

/// One hourly row of the raw price table as stored, nulls included.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct CandleRow {
    pub asset: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default, deserialize_with = "deserialize_f64_lenient")]
    pub open_price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_lenient")]
    pub high_price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_lenient")]
    pub low_price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_lenient")]
    pub close_price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_lenient")]
    pub volume: Option<f64>,
}

impl CandleRow {
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_deref().and_then(parse_timestamp)
    }

    pub fn has_nulls(&self) -> bool {
        self.asset.is_none()
            || self.timestamp.is_none()
            || self.open_price.is_none()
            || self.high_price.is_none()
            || self.low_price.is_none()
            || self.close_price.is_none()
            || self.volume.is_none()
    }

    /// `None` when any field is null or the timestamp does not parse.
    pub fn complete(&self) -> Option<Candle> {
        Some(Candle {
            asset: self.asset.clone()?,
            timestamp: self.parsed_timestamp()?,
            open_price: self.open_price?,
            high_price: self.high_price?,
            low_price: self.low_price?,
            close_price: self.close_price?,
            volume: self.volume?,
        })
    }
}

/// A complete OHLCV row.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Candle {
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
}

impl Candle {
    pub fn typical_price(&self) -> f64 {
        (self.high_price + self.low_price + self.close_price) / 3.0
    }
}

impl TableRecord for Candle {
    fn schema() -> Vec<FieldSchema> {
        vec![
            FieldSchema::new("asset", FieldKind::String),
            FieldSchema::new("timestamp", FieldKind::Timestamp),
            FieldSchema::new("open_price", FieldKind::Float),
            FieldSchema::new("high_price", FieldKind::Float),
            FieldSchema::new("low_price", FieldKind::Float),
            FieldSchema::new("close_price", FieldKind::Float),
            FieldSchema::new("volume", FieldKind::Float),
        ]
    }
}

impl ta::Open for Candle {
    fn open(&self) -> f64 {
        self.open_price
    }
}

impl ta::High for Candle {
    fn high(&self) -> f64 {
        self.high_price
    }
}

impl ta::Low for Candle {
    fn low(&self) -> f64 {
        self.low_price
    }
}

impl ta::Close for Candle {
    fn close(&self) -> f64 {
        self.close_price
    }
}

impl ta::Volume for Candle {
    fn volume(&self) -> f64 {
        self.volume
    }
}

// --- Queries ---

/// Every asset's rows from the last `months` months, oldest first per asset.
pub fn recent_candles_sql(table: &TablePath, months: u32) -> String {
    format!(
        "SELECT {columns}\n\
         FROM {table}\n\
         WHERE DATETIME(timestamp) >= DATETIME_SUB(CURRENT_DATETIME(), INTERVAL {months} MONTH)\n\
         ORDER BY asset, timestamp",
        columns = CANDLE_COLUMNS,
        table = table.sql(),
        months = months,
    )
}

/// The latest `limit` rows of one asset, newest first.
pub fn asset_history_sql(table: &TablePath, asset: &str, limit: u32) -> Result<String> {
    let asset = warehouse::validate_identifier(asset)?;
    Ok(format!(
        "SELECT {columns}\n\
         FROM {table}\n\
         WHERE asset = '{asset}'\n\
         ORDER BY timestamp DESC\n\
         LIMIT {limit}",
        columns = CANDLE_COLUMNS,
        table = table.sql(),
        asset = asset,
        limit = limit,
    ))
}

/// Runs a candle query, dropping rows with nulls or unreadable timestamps.
pub async fn fetch_candles(warehouse: &dyn Warehouse, sql: &str) -> Result<Vec<Candle>> {
    let rows: Vec<CandleRow> = warehouse::fetch(warehouse, sql)
        .await
        .context("fetching candles")?;
    let total = rows.len();
    let candles: Vec<Candle> = rows.iter().filter_map(CandleRow::complete).collect();
    if candles.len() < total {
        warn!("dropped {} incomplete candle rows", total - candles.len());
    }
    info!("{} candles ready", candles.len());
    Ok(candles)
}

// --- Grouping ---

/// Splits candles per asset, each group sorted by timestamp.
pub fn group_by_asset(candles: Vec<Candle>) -> BTreeMap<String, Vec<Candle>> {
    let mut groups: BTreeMap<String, Vec<Candle>> = BTreeMap::new();
    for candle in candles {
        groups.entry(candle.asset.clone()).or_default().push(candle);
    }
    for group in groups.values_mut() {
        group.sort_by_key(|c| c.timestamp);
    }
    groups
}

pub fn asset_counts<'a, I>(assets: I) -> BTreeMap<String, usize>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts = BTreeMap::new();
    for asset in assets {
        *counts.entry(asset.to_string()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    /// Hourly candles for one asset starting 2024-01-01, one per close price.
    pub(crate) fn hourly(asset: &str, closes: &[f64]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                asset: asset.to_string(),
                timestamp: start + Duration::hours(i as i64),
                open_price: close - 0.5,
                high_price: close + 1.0,
                low_price: close - 1.0,
                close_price: close,
                volume: 100.0 + i as f64,
            })
            .collect()
    }

    #[test]
    fn incomplete_rows_do_not_become_candles() {
        let json = r#"[
            {"asset": "BTC", "timestamp": "1.7040672E9", "open_price": "1", "high_price": "2",
             "low_price": "0.5", "close_price": "1.5", "volume": "10"},
            {"asset": "BTC", "timestamp": "1.7040708E9", "open_price": "1", "high_price": null,
             "low_price": "0.5", "close_price": "1.5", "volume": "10"}
        ]"#;
        let rows: Vec<CandleRow> = serde_json::from_str(json).unwrap();

        assert!(!rows[0].has_nulls());
        assert!(rows[1].has_nulls());
        let candle = rows[0].complete().unwrap();
        assert_eq!(candle.close_price, 1.5);
        assert_eq!(candle.timestamp, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert!(rows[1].complete().is_none());
    }

    #[test]
    fn groups_are_sorted_per_asset() {
        let mut candles = hourly("ETH", &[3.0, 4.0]);
        let mut btc = hourly("BTC", &[1.0, 2.0, 3.0]);
        btc.reverse();
        candles.extend(btc);

        let groups = group_by_asset(candles);

        assert_eq!(groups.keys().collect::<Vec<_>>(), vec!["BTC", "ETH"]);
        let btc_closes: Vec<f64> = groups["BTC"].iter().map(|c| c.close_price).collect();
        assert_eq!(btc_closes, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn counts_per_asset() {
        let counts = asset_counts(["BTC", "ETH", "BTC"]);
        assert_eq!(counts["BTC"], 2);
        assert_eq!(counts["ETH"], 1);
    }

    #[test]
    fn history_query_filters_one_asset() {
        let table = TablePath::new("p", "d", "coinbase_hourly_prices").unwrap();
        let sql = asset_history_sql(&table, "BTC", 1000).unwrap();
        assert!(sql.contains("WHERE asset = 'BTC'"));
        assert!(sql.contains("ORDER BY timestamp DESC"));
        assert!(sql.ends_with("LIMIT 1000"));
        assert!(asset_history_sql(&table, "BTC' OR '1'='1", 10).is_err());

        let recent = recent_candles_sql(&table, 6);
        assert!(recent.contains("INTERVAL 6 MONTH"));
        assert!(recent.contains("`p.d.coinbase_hourly_prices`"));
    }
}
