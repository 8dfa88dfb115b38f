//! Data-quality diagnostics over the raw price table.
//!
//! Each [`Check`] can render itself as SQL for the warehouse or evaluate the
//! same rule over rows already in memory. Both paths produce a
//! [`QueryResult`] of the same shape, so reporting does not care where a
//! result came from. Violations are reported, never repaired.

use crate::candles::{self, CANDLE_COLUMNS, CandleRow};
use crate::config::QualityConfig;
use crate::report;
use crate::warehouse::{self, FieldKind, FieldSchema, QueryResult, TablePath, Warehouse};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::info;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    /// One count cell; zero means clean.
    Count,
    /// Offending rows; none means clean.
    Rows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    MissingValues,
    DuplicateTimestamps,
    NegativePrices,
    NegativeVolume,
    TimeGaps,
    Anomalies,
    OutliersInVolume,
    NegativeOrZeroPrices,
    SpikesInVolume,
    InvalidAssetSymbols,
    MissingConsecutiveHours,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Suite {
    /// Counts of nulls, duplicates and negative values.
    Validation,
    /// Gaps, jumps, volume outliers and unknown symbols as well.
    Full,
}

impl Suite {
    pub fn checks(self) -> &'static [Check] {
        match self {
            Suite::Validation => &[
                Check::MissingValues,
                Check::DuplicateTimestamps,
                Check::NegativePrices,
                Check::NegativeVolume,
            ],
            Suite::Full => &[
                Check::MissingValues,
                Check::DuplicateTimestamps,
                Check::TimeGaps,
                Check::Anomalies,
                Check::OutliersInVolume,
                Check::NegativeOrZeroPrices,
                Check::SpikesInVolume,
                Check::InvalidAssetSymbols,
                Check::MissingConsecutiveHours,
            ],
        }
    }
}

const LAG_TIMESTAMP: &str =
    "LAG(timestamp) OVER (PARTITION BY asset ORDER BY timestamp) AS prev_timestamp";

impl Check {
    pub fn name(self) -> &'static str {
        match self {
            Check::MissingValues => "missing_values",
            Check::DuplicateTimestamps => "duplicate_timestamps",
            Check::NegativePrices => "negative_prices",
            Check::NegativeVolume => "negative_volume",
            Check::TimeGaps => "time_gaps",
            Check::Anomalies => "anomalies",
            Check::OutliersInVolume => "outliers_in_volume",
            Check::NegativeOrZeroPrices => "negative_or_zero_prices",
            Check::SpikesInVolume => "spikes_in_volume",
            Check::InvalidAssetSymbols => "invalid_asset_symbols",
            Check::MissingConsecutiveHours => "missing_consecutive_hours",
        }
    }

    /// `missing_values` -> `Missing Values`
    pub fn title(self) -> String {
        self.name()
            .split('_')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn kind(self) -> CheckKind {
        match self {
            Check::MissingValues | Check::NegativePrices | Check::NegativeVolume => CheckKind::Count,
            _ => CheckKind::Rows,
        }
    }

    pub fn sql(self, table: &TablePath, rules: &QualityConfig) -> Result<String> {
        let t = table.sql();
        let sql = match self {
            Check::MissingValues => format!(
                "SELECT COUNT(*) AS missing_count\nFROM {t}\n\
                 WHERE asset IS NULL OR timestamp IS NULL\n\
                 OR open_price IS NULL OR close_price IS NULL\n\
                 OR high_price IS NULL OR low_price IS NULL\n\
                 OR volume IS NULL"
            ),
            Check::DuplicateTimestamps => format!(
                "SELECT asset, timestamp, COUNT(*) AS duplicate_count\nFROM {t}\n\
                 GROUP BY asset, timestamp\nHAVING COUNT(*) > 1"
            ),
            Check::NegativePrices => format!(
                "SELECT COUNT(*) AS negative_price_count\nFROM {t}\n\
                 WHERE open_price < 0 OR close_price < 0\n\
                 OR high_price < 0 OR low_price < 0"
            ),
            Check::NegativeVolume => {
                format!("SELECT COUNT(*) AS negative_volume_count\nFROM {t}\nWHERE volume < 0")
            }
            Check::TimeGaps | Check::MissingConsecutiveHours => {
                let condition = if self == Check::TimeGaps {
                    format!("> {}", rules.gap_hours)
                } else {
                    format!(">= {}", rules.long_gap_hours)
                };
                format!(
                    "WITH time_series AS (\n  SELECT asset, timestamp, {LAG_TIMESTAMP}\n  FROM {t}\n)\n\
                     SELECT asset, timestamp, prev_timestamp,\n\
                     TIMESTAMP_DIFF(timestamp, prev_timestamp, HOUR) AS hour_diff\n\
                     FROM time_series\n\
                     WHERE TIMESTAMP_DIFF(timestamp, prev_timestamp, HOUR) {condition}\n\
                     ORDER BY asset, timestamp"
                )
            }
            Check::Anomalies => format!(
                "WITH price_changes AS (\n  SELECT asset, timestamp, close_price,\n  \
                 LAG(close_price) OVER (PARTITION BY asset ORDER BY timestamp) AS prev_close\n  \
                 FROM {t}\n)\n\
                 SELECT asset, timestamp, prev_close, close_price,\n\
                 ROUND(ABS((close_price - prev_close) / prev_close) * 100, 2) AS pct_change\n\
                 FROM price_changes\n\
                 WHERE prev_close != 0\n\
                 AND ABS((close_price - prev_close) / prev_close) * 100 > {jump}\n\
                 ORDER BY asset, timestamp",
                jump = rules.price_jump_pct
            ),
            Check::OutliersInVolume => format!(
                "WITH volume_stats AS (\n  SELECT DISTINCT asset,\n  \
                 PERCENTILE_CONT(volume, {p}) OVER (PARTITION BY asset) AS vol_threshold\n  \
                 FROM {t}\n)\n\
                 SELECT t.asset, t.timestamp, t.volume, v.vol_threshold\n\
                 FROM {t} t\n\
                 JOIN volume_stats v ON t.asset = v.asset\n\
                 WHERE t.volume > v.vol_threshold * {m}\n\
                 ORDER BY t.asset, t.timestamp",
                p = rules.volume_percentile,
                m = rules.volume_outlier_multiplier
            ),
            Check::NegativeOrZeroPrices => format!(
                "SELECT {CANDLE_COLUMNS}\nFROM {t}\n\
                 WHERE open_price <= 0 OR close_price <= 0 OR high_price <= 0 OR low_price <= 0"
            ),
            Check::SpikesInVolume => format!(
                "WITH volume_changes AS (\n  SELECT asset, timestamp, volume,\n  \
                 LAG(volume) OVER (PARTITION BY asset ORDER BY timestamp) AS prev_volume\n  \
                 FROM {t}\n)\n\
                 SELECT asset, timestamp, prev_volume, volume,\n\
                 ROUND(volume / NULLIF(prev_volume, 0), 2) AS volume_ratio\n\
                 FROM volume_changes\n\
                 WHERE volume / NULLIF(prev_volume, 0) > {ratio}\n\
                 ORDER BY asset, timestamp",
                ratio = rules.volume_spike_ratio
            ),
            Check::InvalidAssetSymbols => {
                let known = rules
                    .known_assets
                    .iter()
                    .map(|a| warehouse::validate_identifier(a).map(|a| format!("'{}'", a)))
                    .collect::<Result<Vec<_>, _>>()?
                    .join(",");
                format!("SELECT DISTINCT asset\nFROM {t}\nWHERE asset NOT IN ({known})")
            }
        };
        Ok(sql)
    }

    /// Applies the rule to rows in memory. Rows without an asset or a
    /// readable timestamp only take part in the null and sign checks.
    pub fn evaluate(self, rows: &[CandleRow], rules: &QualityConfig) -> QueryResult {
        match self {
            Check::MissingValues => count_result(
                "missing_count",
                rows.iter().filter(|r| r.has_nulls()).count(),
            ),
            Check::NegativePrices => count_result(
                "negative_price_count",
                rows.iter().filter(|r| any_price(r, |p| p < 0.0)).count(),
            ),
            Check::NegativeVolume => count_result(
                "negative_volume_count",
                rows.iter().filter(|r| r.volume.is_some_and(|v| v < 0.0)).count(),
            ),
            Check::DuplicateTimestamps => duplicates(rows),
            Check::TimeGaps => gaps(rows, |hours| hours > rules.gap_hours),
            Check::MissingConsecutiveHours => gaps(rows, |hours| hours >= rules.long_gap_hours),
            Check::Anomalies => anomalies(rows, rules.price_jump_pct),
            Check::OutliersInVolume => volume_outliers(rows, rules),
            Check::NegativeOrZeroPrices => {
                let offending: Vec<&CandleRow> =
                    rows.iter().filter(|r| any_price(r, |p| p <= 0.0)).collect();
                candle_rows_result(&offending)
            }
            Check::SpikesInVolume => volume_spikes(rows, rules.volume_spike_ratio),
            Check::InvalidAssetSymbols => {
                let known: BTreeSet<&str> = rules.known_assets.iter().map(String::as_str).collect();
                let invalid: BTreeSet<&str> = rows
                    .iter()
                    .filter_map(|r| r.asset.as_deref())
                    .filter(|a| !known.contains(a))
                    .collect();
                QueryResult {
                    schema: vec![FieldSchema::new("asset", FieldKind::String)],
                    rows: invalid.into_iter().map(|a| vec![Some(a.to_string())]).collect(),
                }
            }
        }
    }
}

// --- Local evaluation helpers ---

fn any_price(row: &CandleRow, pred: impl Fn(f64) -> bool) -> bool {
    [row.open_price, row.high_price, row.low_price, row.close_price]
        .into_iter()
        .flatten()
        .any(pred)
}

fn count_result(column: &str, count: usize) -> QueryResult {
    QueryResult {
        schema: vec![FieldSchema::new(column, FieldKind::Integer)],
        rows: vec![vec![Some(count.to_string())]],
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> Option<String> {
    Some(ts.format("%Y-%m-%d %H:%M:%S UTC").to_string())
}

fn fmt_num(value: Option<f64>) -> Option<String> {
    value.map(|v| v.to_string())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Rows with an asset and a timestamp, per asset, sorted by time.
fn keyed_series(rows: &[CandleRow]) -> BTreeMap<&str, Vec<(DateTime<Utc>, &CandleRow)>> {
    let mut series: BTreeMap<&str, Vec<(DateTime<Utc>, &CandleRow)>> = BTreeMap::new();
    for row in rows {
        if let (Some(asset), Some(ts)) = (row.asset.as_deref(), row.parsed_timestamp()) {
            series.entry(asset).or_default().push((ts, row));
        }
    }
    for points in series.values_mut() {
        points.sort_by_key(|(ts, _)| *ts);
    }
    series
}

fn duplicates(rows: &[CandleRow]) -> QueryResult {
    let mut counts: BTreeMap<(&str, DateTime<Utc>), usize> = BTreeMap::new();
    for (asset, points) in keyed_series(rows) {
        for (ts, _) in points {
            *counts.entry((asset, ts)).or_insert(0) += 1;
        }
    }
    QueryResult {
        schema: vec![
            FieldSchema::new("asset", FieldKind::String),
            FieldSchema::new("timestamp", FieldKind::Timestamp),
            FieldSchema::new("duplicate_count", FieldKind::Integer),
        ],
        rows: counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|((asset, ts), n)| vec![Some(asset.to_string()), fmt_ts(ts), Some(n.to_string())])
            .collect(),
    }
}

fn gaps(rows: &[CandleRow], flagged: impl Fn(i64) -> bool) -> QueryResult {
    let mut out = Vec::new();
    for (asset, points) in keyed_series(rows) {
        for pair in points.windows(2) {
            let (prev, cur) = (pair[0].0, pair[1].0);
            let hours = (cur - prev).num_hours();
            if flagged(hours) {
                out.push(vec![
                    Some(asset.to_string()),
                    fmt_ts(cur),
                    fmt_ts(prev),
                    Some(hours.to_string()),
                ]);
            }
        }
    }
    QueryResult {
        schema: vec![
            FieldSchema::new("asset", FieldKind::String),
            FieldSchema::new("timestamp", FieldKind::Timestamp),
            FieldSchema::new("prev_timestamp", FieldKind::Timestamp),
            FieldSchema::new("hour_diff", FieldKind::Integer),
        ],
        rows: out,
    }
}

fn anomalies(rows: &[CandleRow], jump_pct: f64) -> QueryResult {
    let mut out = Vec::new();
    for (asset, points) in keyed_series(rows) {
        for pair in points.windows(2) {
            let (prev, (ts, cur)) = (pair[0].1, pair[1]);
            if let (Some(prev_close), Some(close)) = (prev.close_price, cur.close_price) {
                if prev_close == 0.0 {
                    continue;
                }
                let pct = ((close - prev_close) / prev_close).abs() * 100.0;
                if pct > jump_pct {
                    out.push(vec![
                        Some(asset.to_string()),
                        fmt_ts(ts),
                        fmt_num(Some(prev_close)),
                        fmt_num(Some(close)),
                        fmt_num(Some(round2(pct))),
                    ]);
                }
            }
        }
    }
    QueryResult {
        schema: vec![
            FieldSchema::new("asset", FieldKind::String),
            FieldSchema::new("timestamp", FieldKind::Timestamp),
            FieldSchema::new("prev_close", FieldKind::Float),
            FieldSchema::new("close_price", FieldKind::Float),
            FieldSchema::new("pct_change", FieldKind::Float),
        ],
        rows: out,
    }
}

/// Linear-interpolated percentile, as `PERCENTILE_CONT` computes it.
pub fn percentile_cont(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * (pos - lower as f64))
}

fn volume_outliers(rows: &[CandleRow], rules: &QualityConfig) -> QueryResult {
    let mut out = Vec::new();
    for (asset, points) in keyed_series(rows) {
        let volumes: Vec<f64> = points.iter().filter_map(|(_, r)| r.volume).collect();
        let Some(threshold) = percentile_cont(&volumes, rules.volume_percentile) else {
            continue;
        };
        for (ts, row) in &points {
            if let Some(volume) = row.volume {
                if volume > threshold * rules.volume_outlier_multiplier {
                    out.push(vec![
                        Some(asset.to_string()),
                        fmt_ts(*ts),
                        fmt_num(Some(volume)),
                        fmt_num(Some(threshold)),
                    ]);
                }
            }
        }
    }
    QueryResult {
        schema: vec![
            FieldSchema::new("asset", FieldKind::String),
            FieldSchema::new("timestamp", FieldKind::Timestamp),
            FieldSchema::new("volume", FieldKind::Float),
            FieldSchema::new("vol_threshold", FieldKind::Float),
        ],
        rows: out,
    }
}

fn volume_spikes(rows: &[CandleRow], ratio_limit: f64) -> QueryResult {
    let mut out = Vec::new();
    for (asset, points) in keyed_series(rows) {
        for pair in points.windows(2) {
            let (prev, (ts, cur)) = (pair[0].1, pair[1]);
            if let (Some(prev_volume), Some(volume)) = (prev.volume, cur.volume) {
                if prev_volume == 0.0 {
                    continue;
                }
                let ratio = volume / prev_volume;
                if ratio > ratio_limit {
                    out.push(vec![
                        Some(asset.to_string()),
                        fmt_ts(ts),
                        fmt_num(Some(prev_volume)),
                        fmt_num(Some(volume)),
                        fmt_num(Some(round2(ratio))),
                    ]);
                }
            }
        }
    }
    QueryResult {
        schema: vec![
            FieldSchema::new("asset", FieldKind::String),
            FieldSchema::new("timestamp", FieldKind::Timestamp),
            FieldSchema::new("prev_volume", FieldKind::Float),
            FieldSchema::new("volume", FieldKind::Float),
            FieldSchema::new("volume_ratio", FieldKind::Float),
        ],
        rows: out,
    }
}

fn candle_rows_result(rows: &[&CandleRow]) -> QueryResult {
    let schema = CANDLE_COLUMNS
        .split(", ")
        .map(|name| {
            let kind = match name {
                "asset" => FieldKind::String,
                "timestamp" => FieldKind::Timestamp,
                _ => FieldKind::Float,
            };
            FieldSchema::new(name, kind)
        })
        .collect();
    QueryResult {
        schema,
        rows: rows
            .iter()
            .map(|r| {
                vec![
                    r.asset.clone(),
                    r.timestamp.clone(),
                    fmt_num(r.open_price),
                    fmt_num(r.high_price),
                    fmt_num(r.low_price),
                    fmt_num(r.close_price),
                    fmt_num(r.volume),
                ]
            })
            .collect(),
    }
}

// --- Suites ---

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub check: Check,
    pub result: QueryResult,
}

impl CheckOutcome {
    pub fn is_clean(&self) -> Result<bool> {
        Ok(match self.check.kind() {
            CheckKind::Count => self.result.first_count()? == 0,
            CheckKind::Rows => self.result.is_empty(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SuiteReport {
    pub suite: Suite,
    pub outcomes: Vec<CheckOutcome>,
}

impl SuiteReport {
    pub fn issues_found(&self) -> Result<bool> {
        for outcome in &self.outcomes {
            if !outcome.is_clean()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn failing(&self) -> Result<Vec<&'static str>> {
        let mut names = Vec::new();
        for outcome in &self.outcomes {
            if !outcome.is_clean()? {
                names.push(outcome.check.name());
            }
        }
        Ok(names)
    }
}

/// Runs every check of `suite` as a warehouse query against `table`.
pub async fn run_remote(
    warehouse: &dyn Warehouse,
    table: &TablePath,
    suite: Suite,
    rules: &QualityConfig,
) -> Result<SuiteReport> {
    let mut outcomes = Vec::with_capacity(suite.checks().len());
    for &check in suite.checks() {
        info!("running check {}", check.name());
        let sql = check.sql(table, rules)?;
        let result = warehouse
            .query(&sql)
            .await
            .with_context(|| format!("running check {}", check.name()))?;
        outcomes.push(CheckOutcome { check, result });
    }
    Ok(SuiteReport { suite, outcomes })
}

/// Fetches the last `months` of `table` and runs `suite` over those rows.
pub async fn run_recent_window(
    warehouse: &dyn Warehouse,
    table: &TablePath,
    months: u32,
    suite: Suite,
    rules: &QualityConfig,
) -> Result<SuiteReport> {
    let sql = candles::recent_candles_sql(table, months);
    let rows: Vec<CandleRow> = warehouse::fetch(warehouse, &sql)
        .await
        .context("fetching rows for local checks")?;
    info!("checking {} rows from the last {} months", rows.len(), months);
    Ok(run_local(&rows, suite, rules))
}

/// Runs every check of `suite` over rows already fetched.
pub fn run_local(rows: &[CandleRow], suite: Suite, rules: &QualityConfig) -> SuiteReport {
    let outcomes = suite
        .checks()
        .iter()
        .map(|&check| CheckOutcome {
            check,
            result: check.evaluate(rows, rules),
        })
        .collect();
    SuiteReport { suite, outcomes }
}

pub fn print_report(report: &SuiteReport) -> Result<()> {
    for outcome in &report.outcomes {
        println!("\n📌 {}:", outcome.check.title());
        if outcome.is_clean()? {
            println!("✅ No issues found!");
        } else {
            println!("{}", report::query_table(&outcome.result));
        }
    }

    if report.suite == Suite::Validation {
        if report.issues_found()? {
            println!("\n⚠️ Data quality issues found. Please review the results above.");
        } else {
            println!("\n🎉 Data looks clean! Ready for feature engineering.");
        }
        println!("\n✅ Validation completed!");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::memory::MemoryWarehouse;

    fn row(asset: &str, ts: &str, close: f64, volume: f64) -> CandleRow {
        CandleRow {
            asset: Some(asset.to_string()),
            timestamp: Some(ts.to_string()),
            open_price: Some(close),
            high_price: Some(close + 1.0),
            low_price: Some(close - 1.0),
            close_price: Some(close),
            volume: Some(volume),
        }
    }

    fn clean_rows() -> Vec<CandleRow> {
        (0..10)
            .map(|h| row("BTC", &format!("2024-01-01T{:02}:00:00Z", h), 100.0 + h as f64, 50.0))
            .collect()
    }

    fn table() -> TablePath {
        TablePath::new("p", "d", "coinbase_hourly_prices").unwrap()
    }

    #[test]
    fn titles_follow_check_names() {
        assert_eq!(Check::MissingValues.title(), "Missing Values");
        assert_eq!(Check::OutliersInVolume.title(), "Outliers In Volume");
        assert_eq!(Suite::Validation.checks().len(), 4);
        assert_eq!(Suite::Full.checks().len(), 9);
    }

    #[test]
    fn clean_data_passes_every_check() {
        let rules = QualityConfig::default();
        let report = run_local(&clean_rows(), Suite::Full, &rules);
        assert!(!report.issues_found().unwrap());
        let report = run_local(&clean_rows(), Suite::Validation, &rules);
        assert!(report.failing().unwrap().is_empty());
    }

    #[test]
    fn nulls_negatives_and_duplicates_are_reported() {
        let mut rows = clean_rows();
        rows[1].volume = None;
        rows[2].low_price = Some(-3.0);
        rows[3].volume = Some(-1.0);
        rows.push(rows[4].clone());
        let rules = QualityConfig::default();

        let report = run_local(&rows, Suite::Validation, &rules);

        assert_eq!(
            report.failing().unwrap(),
            vec!["missing_values", "duplicate_timestamps", "negative_prices", "negative_volume"]
        );
        assert_eq!(report.outcomes[0].result.first_count().unwrap(), 1);
        let dup = &report.outcomes[1].result;
        assert_eq!(dup.rows.len(), 1);
        assert_eq!(dup.rows[0][2].as_deref(), Some("2"));
    }

    #[test]
    fn gaps_jumps_and_spikes_are_reported() {
        let rows = vec![
            row("BTC", "2024-01-01T00:00:00Z", 100.0, 10.0),
            row("BTC", "2024-01-01T01:00:00Z", 101.0, 10.0),
            // three-hour gap, +30% jump and a 12x volume spike on one row
            row("BTC", "2024-01-01T04:00:00Z", 131.3, 120.0),
            // six-hour gap
            row("BTC", "2024-01-01T10:00:00Z", 131.0, 100.0),
            row("DOGE2", "2024-01-01T00:00:00Z", 1.0, 1.0),
        ];
        let rules = QualityConfig::default();

        let gaps = Check::TimeGaps.evaluate(&rows, &rules);
        assert_eq!(gaps.rows.len(), 2);
        assert_eq!(gaps.rows[0][3].as_deref(), Some("3"));

        let long = Check::MissingConsecutiveHours.evaluate(&rows, &rules);
        assert_eq!(long.rows.len(), 1);
        assert_eq!(long.rows[0][3].as_deref(), Some("6"));

        let jumps = Check::Anomalies.evaluate(&rows, &rules);
        assert_eq!(jumps.rows.len(), 1);
        assert_eq!(jumps.rows[0][4].as_deref(), Some("30"));

        let spikes = Check::SpikesInVolume.evaluate(&rows, &rules);
        assert_eq!(spikes.rows.len(), 1);
        assert_eq!(spikes.rows[0][4].as_deref(), Some("12"));

        let invalid = Check::InvalidAssetSymbols.evaluate(&rows, &rules);
        assert_eq!(invalid.rows, vec![vec![Some("DOGE2".to_string())]]);
    }

    #[test]
    fn zero_previous_values_are_skipped() {
        let rows = vec![
            row("ETH", "2024-01-01T00:00:00Z", 0.0, 0.0),
            row("ETH", "2024-01-01T01:00:00Z", 50.0, 500.0),
            row("ETH", "2024-01-01T02:00:00Z", 51.0, 510.0),
        ];
        let rules = QualityConfig::default();

        assert!(Check::Anomalies.evaluate(&rows, &rules).is_empty());
        assert!(Check::SpikesInVolume.evaluate(&rows, &rules).is_empty());

        let t = table();
        assert!(Check::Anomalies.sql(&t, &rules).unwrap().contains("prev_close != 0"));
        assert!(Check::SpikesInVolume.sql(&t, &rules).unwrap().contains("NULLIF(prev_volume, 0)"));
    }

    #[test]
    fn percentile_matches_linear_interpolation() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile_cont(&values, 0.5), Some(2.5));
        assert_eq!(percentile_cont(&values, 1.0), Some(4.0));
        assert_eq!(percentile_cont(&[], 0.99), None);
    }

    #[test]
    fn volume_outliers_exceed_twice_the_percentile() {
        let mut rows: Vec<CandleRow> = (0..100)
            .map(|h| {
                let ts = format!("2024-01-{:02}T{:02}:00:00Z", 1 + h / 24, h % 24);
                row("ETH", &ts, 10.0, 10.0)
            })
            .collect();
        rows[50].volume = Some(1000.0);
        let rules = QualityConfig::default();

        let out = Check::OutliersInVolume.evaluate(&rows, &rules);
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0][2].as_deref(), Some("1000"));
    }

    #[test]
    fn sql_references_the_table_and_thresholds() {
        let rules = QualityConfig::default();
        let t = table();

        let gaps = Check::TimeGaps.sql(&t, &rules).unwrap();
        assert!(gaps.contains("`p.d.coinbase_hourly_prices`"));
        assert!(gaps.contains("HOUR) > 1"));
        let long = Check::MissingConsecutiveHours.sql(&t, &rules).unwrap();
        assert!(long.contains("HOUR) >= 5"));
        let symbols = Check::InvalidAssetSymbols.sql(&t, &rules).unwrap();
        assert!(symbols.contains("NOT IN ('BTC','ETH','SOL','ADA','XRP','LTC','DOGE','AVAX')"));

        let bad = QualityConfig {
            known_assets: vec!["BTC') OR ('1".to_string()],
            ..Default::default()
        };
        assert!(Check::InvalidAssetSymbols.sql(&t, &bad).is_err());
    }

    #[tokio::test]
    async fn remote_suite_reads_counts_and_rows() {
        let warehouse = MemoryWarehouse::new();
        warehouse.respond("missing_count", count_result("missing_count", 0));
        warehouse.respond("duplicate_count", QueryResult::default());
        warehouse.respond("negative_price_count", count_result("negative_price_count", 3));
        warehouse.respond("negative_volume_count", count_result("negative_volume_count", 0));

        let report = run_remote(&warehouse, &table(), Suite::Validation, &QualityConfig::default())
            .await
            .unwrap();

        assert_eq!(warehouse.executed().len(), 4);
        assert_eq!(report.failing().unwrap(), vec!["negative_prices"]);
        print_report(&report).unwrap();
    }

    #[tokio::test]
    async fn recent_window_is_checked_locally() {
        let warehouse = MemoryWarehouse::new();
        let candles = crate::candles::tests::hourly("BTC", &[10.0, 20.0, 21.0]);
        warehouse.insert_table(&table(), QueryResult::from_records(&candles).unwrap());

        let report = run_recent_window(&warehouse, &table(), 6, Suite::Full, &QualityConfig::default())
            .await
            .unwrap();

        assert_eq!(report.failing().unwrap(), vec!["anomalies"]);
        assert!(warehouse.executed()[0].contains("INTERVAL 6 MONTH"));
    }
}
