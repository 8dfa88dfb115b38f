//! Connectivity checks and one-off table maintenance.

use crate::config::WarehouseConfig;
use crate::report;
use crate::warehouse::{TablePath, Warehouse};
use anyhow::{Context, Result, bail};
use log::info;

pub const SAMPLE_LIMIT: usize = 5;

/// Authenticates and runs a trivial query.
pub async fn ping(warehouse: &dyn Warehouse) -> Result<()> {
    let result = warehouse
        .query("SELECT 1 AS ok")
        .await
        .context("running connectivity query")?;
    if result.first_count()? != 1 {
        bail!("unexpected answer to SELECT 1: {:?}", result.rows);
    }
    println!("✅ Successfully connected to BigQuery!");
    Ok(())
}

pub async fn list_tables(warehouse: &dyn Warehouse, config: &WarehouseConfig) -> Result<Vec<String>> {
    let tables = warehouse
        .list_tables(&config.project_id, &config.dataset_id)
        .await
        .context("listing tables")?;
    println!("\n✅ Tables currently in `{}` dataset:", config.dataset_id);
    for table in &tables {
        println!("- {}", table);
    }
    Ok(tables)
}

/// Prints the first rows of each configured sample table. Returns the row
/// count per table.
pub async fn sample_tables(warehouse: &dyn Warehouse, config: &WarehouseConfig) -> Result<Vec<(TablePath, usize)>> {
    let mut counts = Vec::with_capacity(config.sample_tables.len());
    for name in &config.sample_tables {
        let table = config.table(name)?;
        println!("\n🔍 Fetching sample data from `{}`:", table);
        let result = warehouse
            .query(&format!("SELECT * FROM {} LIMIT {}", table.sql(), SAMPLE_LIMIT))
            .await
            .with_context(|| format!("sampling {}", table))?;
        if result.is_empty() {
            println!("⚠️ No data found in this table.");
        } else {
            println!("{}", report::query_table(&result));
        }
        counts.push((table, result.len()));
    }
    Ok(counts)
}

/// Renames the legacy `coin_id/open/high/low/close` columns of `table` in
/// place: builds `<table>_v2` with the new names, drops the original, copies
/// the new table back and drops the temporary one.
pub async fn rename_columns(warehouse: &dyn Warehouse, table: &TablePath) -> Result<()> {
    let temp = table.sibling(&format!("{}_v2", table.table))?;

    println!("\n🔄 Renaming columns in `{}`...", table.table);
    let sql = format!(
        "CREATE OR REPLACE TABLE {new} AS\n\
         SELECT\n    coin_id AS asset,\n    timestamp,\n    low AS low_price,\n    \
         high AS high_price,\n    open AS open_price,\n    close AS close_price,\n    volume\n\
         FROM {old}",
        new = temp.sql(),
        old = table.sql()
    );
    warehouse.query(&sql).await.context("creating renamed copy")?;
    info!("created {}", temp);

    println!("\n🗑️ Deleting old table `{}`...", table);
    warehouse.delete_table(table, true).await?;

    println!("\n📄 Copying `{}` back to `{}`...", temp, table);
    warehouse.copy_table(&temp, table).await?;

    println!("\n🗑️ Deleting temporary table `{}`...", temp);
    warehouse.delete_table(&temp, true).await?;

    println!("\n✅ Columns successfully renamed in `{}`!", table.table);
    Ok(())
}
