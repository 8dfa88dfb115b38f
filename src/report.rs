use crate::candles::Candle;
use crate::model::ModelSummary;
use crate::timeframe::OptimalTimeframe;
use crate::warehouse::QueryResult;
use comfy_table::{
    Attribute, Cell, CellAlignment, Color, ContentArrangement, Table, modifiers::UTF8_ROUND_CORNERS,
    presets::UTF8_BORDERS_ONLY,
};
use std::collections::BTreeMap;

fn base_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn header_cell(name: &str, numeric: bool) -> Cell {
    let cell = Cell::new(name).add_attribute(Attribute::Bold);
    if numeric {
        cell.set_alignment(CellAlignment::Right)
    } else {
        cell
    }
}

fn value_cell(value: String, numeric: bool) -> Cell {
    if numeric {
        Cell::new(value).set_alignment(CellAlignment::Right)
    } else {
        Cell::new(value)
    }
}

fn asset_cell(asset: &str) -> Cell {
    Cell::new(asset).fg(Color::Cyan)
}

/// Every row of `result`, nulls shown as `NULL`.
pub fn query_table(result: &QueryResult) -> Table {
    let numeric: Vec<bool> = result.schema.iter().map(|f| f.kind.is_numeric()).collect();

    let mut table = base_table();
    table.set_header(
        result
            .schema
            .iter()
            .zip(&numeric)
            .map(|(field, &num)| header_cell(&field.name, num)),
    );
    for row in &result.rows {
        table.add_row(row.iter().zip(&numeric).map(|(cell, &num)| {
            let text = cell.clone().unwrap_or_else(|| "NULL".to_string());
            value_cell(text, num)
        }));
    }
    table
}

pub fn counts_table(counts: &BTreeMap<String, usize>) -> Table {
    let mut table = base_table();
    table.set_header(vec![header_cell("Asset", false), header_cell("Rows", true)]);
    for (asset, count) in counts {
        table.add_row(vec![asset_cell(asset), value_cell(count.to_string(), true)]);
    }
    table
}

pub fn timeframes_table(rows: &[OptimalTimeframe]) -> Table {
    let mut table = base_table();
    table.set_header(vec![
        header_cell("Asset", false),
        header_cell("Timeframe (h)", true),
        header_cell("MAE", true),
        header_cell("MSE", true),
        header_cell("R²", true),
        header_cell("RMSE", true),
    ]);
    for row in rows {
        table.add_row(vec![
            asset_cell(&row.asset),
            value_cell(row.timeframe.to_string(), true),
            value_cell(format!("{:.4}", row.mae), true),
            value_cell(format!("{:.4}", row.mse), true),
            value_cell(format!("{:.4}", row.r2), true),
            value_cell(format!("{:.4}", row.rmse), true),
        ]);
    }
    table
}

/// Setting / value pairs of a saved model, hyperparameters included.
pub fn model_table(summary: &ModelSummary) -> Table {
    let mut table = base_table();
    table.set_header(vec![header_cell("Setting", false), header_cell("Value", true)]);
    let mut rows = vec![
        ("model".to_string(), summary.kind.clone()),
        ("trees".to_string(), summary.trees.to_string()),
        ("depth".to_string(), summary.depth.to_string()),
        ("leaves".to_string(), summary.leaves.to_string()),
    ];
    if let Some(params) = summary.params.as_object() {
        rows.extend(params.iter().map(|(k, v)| (k.clone(), v.to_string())));
    }
    for (name, value) in rows {
        table.add_row(vec![Cell::new(name), value_cell(value, true)]);
    }
    table
}

/// One-row overview of a price history: span, close range and mean volume.
pub fn candle_summary_table(candles: &[Candle]) -> Table {
    let mut table = base_table();
    table.set_header(vec![
        header_cell("Asset", false),
        header_cell("Rows", true),
        header_cell("From", false),
        header_cell("To", false),
        header_cell("Min Close", true),
        header_cell("Max Close", true),
        header_cell("Last Close", true),
        header_cell("Mean Volume", true),
    ]);

    let (Some(first), Some(last)) = (
        candles.iter().min_by_key(|c| c.timestamp),
        candles.iter().max_by_key(|c| c.timestamp),
    ) else {
        return table;
    };
    let min = candles.iter().map(|c| c.close_price).fold(f64::INFINITY, f64::min);
    let max = candles.iter().map(|c| c.close_price).fold(f64::NEG_INFINITY, f64::max);
    let mean_volume = candles.iter().map(|c| c.volume).sum::<f64>() / candles.len() as f64;

    table.add_row(vec![
        asset_cell(&first.asset),
        value_cell(candles.len().to_string(), true),
        Cell::new(first.timestamp.format("%Y-%m-%d %H:%M").to_string()),
        Cell::new(last.timestamp.format("%Y-%m-%d %H:%M").to_string()),
        value_cell(format!("{:.2}", min), true),
        value_cell(format!("{:.2}", max), true),
        value_cell(format!("{:.2}", last.close_price), true),
        value_cell(format!("{:.2}", mean_volume), true),
    ]);
    table
}
