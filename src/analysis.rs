//! The indicator pipeline: raw prices in, technicals and optimal timeframes out.

use crate::candles::{self, Candle};
use crate::config::AppConfig;
use crate::indicators::{self, TechnicalRow};
use crate::report;
use crate::timeframe::{self, OptimalTimeframe};
use crate::warehouse::{self, QueryResult, Warehouse, WriteMode};
use anyhow::{Context, Result, bail};
use log::{info, warn};
use std::collections::BTreeMap;

const SAMPLE_ROWS: usize = 50;

#[derive(Debug)]
pub struct PipelineSummary {
    pub candles: usize,
    pub technicals: usize,
    pub timeframes: Vec<OptimalTimeframe>,
}

/// Runs the full indicator pipeline:
/// 1. Fetches the last `lookback_months` of raw prices.
/// 2. Computes indicators per asset, keeping complete rows only.
/// 3. Replaces the technicals table.
/// 4. Searches the best forecast horizon per asset and replaces the
///    optimal timeframes table.
pub async fn run_indicator_pipeline(
    warehouse: &dyn Warehouse,
    config: &AppConfig,
) -> Result<PipelineSummary> {
    // Step 1: Load recent prices
    let raw = config.warehouse.raw()?;
    let sql = candles::recent_candles_sql(&raw, config.indicators.lookback_months);
    let fetched = candles::fetch_candles(warehouse, &sql).await?;
    if fetched.is_empty() {
        bail!(
            "{} has no complete rows in the last {} months",
            raw,
            config.indicators.lookback_months
        );
    }
    let total = fetched.len();
    print_overview("before", &fetched)?;

    // Step 2: Indicators per asset
    let mut per_asset: BTreeMap<String, Vec<TechnicalRow>> = BTreeMap::new();
    for (asset, group) in candles::group_by_asset(fetched) {
        println!("🛠️ Processing asset: {}, Rows: {}", asset, group.len());
        let rows = indicators::compute_indicators(&group, &config.indicators)
            .with_context(|| format!("computing indicators for {}", asset))?;
        let complete = indicators::complete_rows(&rows);
        if complete.is_empty() {
            warn!("{}: {} rows are too few for every indicator", asset, group.len());
            continue;
        }
        per_asset.insert(asset, complete);
    }
    println!("🔍 Unique assets count after processing: {}", per_asset.len());

    // Step 3: Upload technicals
    let technicals: Vec<TechnicalRow> = per_asset.values().flatten().cloned().collect();
    if technicals.is_empty() {
        warn!("no complete indicator rows, technicals table left as is");
    } else {
        let table = config.warehouse.technicals()?;
        warehouse::upload(warehouse, &table, &technicals, WriteMode::Replace)
            .await
            .context("uploading technical indicators")?;
        println!("✅ Technical indicators computed & uploaded to BigQuery!");
    }

    // Step 4: Optimal timeframes
    let mut optimal = Vec::new();
    for (asset, rows) in &per_asset {
        if let Some(best) =
            timeframe::optimal_timeframe(asset, rows, &config.indicators, &config.model)?
        {
            optimal.push(best);
        }
    }
    if optimal.is_empty() {
        warn!("no asset had enough rows for a timeframe search");
    } else {
        let table = config.warehouse.optimal_timeframes()?;
        warehouse::upload(warehouse, &table, &optimal, WriteMode::Replace)
            .await
            .context("uploading optimal timeframes")?;
        println!("{}", report::timeframes_table(&optimal));
        println!("✅ Optimal timeframes computed & uploaded to BigQuery!");
    }

    info!(
        "pipeline done: {} candles, {} technical rows, {} timeframes",
        total,
        technicals.len(),
        optimal.len()
    );
    Ok(PipelineSummary {
        candles: total,
        technicals: technicals.len(),
        timeframes: optimal,
    })
}

fn print_overview(stage: &str, candles: &[Candle]) -> Result<()> {
    let counts = candles::asset_counts(candles.iter().map(|c| c.asset.as_str()));
    println!("🔍 Unique assets count {} processing: {}", stage, counts.len());
    println!("{}", report::counts_table(&counts));

    let sample = QueryResult::from_records(&candles[..candles.len().min(SAMPLE_ROWS)])?;
    println!("{}", report::query_table(&sample));
    Ok(())
}
