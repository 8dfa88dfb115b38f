use crate::config::AppConfig;
use crate::indicators::TechnicalRow;
use crate::report;
use crate::storage_utils::AsyncStorageManager;
use crate::warehouse::{self, QueryResult, TablePath, Warehouse};
use anyhow::{Context, Result};
use log::info;

pub const CACHE_NAME: &str = "technical_indicators";

/// Technicals from the last `months` months, oldest first per asset.
pub fn technicals_sql(table: &TablePath, months: u32) -> String {
    format!(
        "SELECT *\n\
         FROM {}\n\
         WHERE DATETIME(timestamp) >= DATETIME_SUB(CURRENT_DATETIME(), INTERVAL {} MONTH)\n\
         ORDER BY asset, timestamp",
        table.sql(),
        months
    )
}

pub async fn fetch_technicals(
    warehouse: &dyn Warehouse,
    config: &AppConfig,
) -> Result<Vec<TechnicalRow>> {
    let table = config.warehouse.technicals()?;
    let sql = technicals_sql(&table, config.indicators.lookback_months);
    let rows: Vec<TechnicalRow> = warehouse::fetch(warehouse, &sql)
        .await
        .with_context(|| format!("fetching technicals from {}", table))?;
    info!("{} technical rows fetched", rows.len());
    Ok(rows)
}

/// Returns the locally cached technicals, querying the warehouse and filling
/// the cache when it is missing or `refresh` is set.
pub async fn load_indicators(
    warehouse: &dyn Warehouse,
    storage: &AsyncStorageManager,
    config: &AppConfig,
    refresh: bool,
) -> Result<Vec<TechnicalRow>> {
    if !refresh && storage.exists(CACHE_NAME).await {
        let rows: Vec<TechnicalRow> = storage
            .load(CACHE_NAME)
            .await
            .context("reading the indicator cache")?;
        println!("✅ Loaded indicators from local storage!");
        return Ok(rows);
    }

    if !refresh {
        println!("⚠️ Local file not found, querying BigQuery instead.");
    }
    let rows = fetch_technicals(warehouse, config).await?;
    let path = storage.save(CACHE_NAME, &rows).await?;
    info!("indicator cache written to {:?}", path);
    println!("✅ Technical indicators saved locally!");
    Ok(rows)
}

pub fn print_head(rows: &[TechnicalRow], n: usize) -> Result<()> {
    let head = QueryResult::from_records(&rows[..rows.len().min(n)])?;
    println!("{}", report::query_table(&head));
    Ok(())
}
