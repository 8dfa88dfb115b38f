use anyhow::{Result, bail};
use chrono::DateTime;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use log::warn;
use ratatui::{
    prelude::*,
    widgets::{Axis, Block, Borders, Chart, Dataset as ChartDataset, GraphType, Paragraph},
};
use std::io;
use std::time::Duration;

use crate::candles::{self, Candle, CandleRow};
use crate::config::WarehouseConfig;
use crate::report;
use crate::warehouse::Warehouse;

// --- Data ---

/// Latest `limit` rows of `asset`, returned oldest first.
pub async fn fetch_history(
    warehouse: &dyn Warehouse,
    config: &WarehouseConfig,
    asset: &str,
    limit: u32,
) -> Result<Vec<Candle>> {
    let sql = candles::asset_history_sql(&config.raw()?, asset, limit)?;
    let result = warehouse.query(&sql).await?;
    println!("\n📌 Columns returned from BigQuery: {:?}", result.column_names());

    let rows: Vec<CandleRow> = result.records()?;
    let mut history: Vec<Candle> = rows.iter().filter_map(CandleRow::complete).collect();
    if history.len() < rows.len() {
        warn!("{} incomplete rows left out of the chart", rows.len() - history.len());
    }
    history.sort_by_key(|c| c.timestamp);
    Ok(history)
}

pub async fn explore(
    warehouse: &dyn Warehouse,
    config: &WarehouseConfig,
    asset: &str,
    limit: u32,
    chart: bool,
) -> Result<Vec<Candle>> {
    let history = fetch_history(warehouse, config, asset, limit).await?;
    if history.is_empty() {
        bail!("no price history for {}", asset);
    }
    if chart {
        run_chart(asset, &history)?;
    } else {
        println!("{}", report::candle_summary_table(&history));
    }
    Ok(history)
}

/// `(epoch seconds, close)` for every candle.
fn chart_points(history: &[Candle]) -> Vec<(f64, f64)> {
    history
        .iter()
        .map(|c| (c.timestamp.timestamp() as f64, c.close_price))
        .collect()
}

/// Padded `[min, max]` of each axis.
fn bounds(points: &[(f64, f64)]) -> ([f64; 2], [f64; 2]) {
    let (mut x, mut y) = ([f64::MAX, f64::MIN], [f64::MAX, f64::MIN]);
    for &(px, py) in points {
        x = [x[0].min(px), x[1].max(px)];
        y = [y[0].min(py), y[1].max(py)];
    }
    let pad = ((y[1] - y[0]) * 0.05).max(y[1].abs() * 0.001).max(f64::EPSILON);
    (x, [y[0] - pad, y[1] + pad])
}

fn format_axis_time(secs: f64) -> String {
    DateTime::from_timestamp(secs as i64, 0)
        .map(|dt| dt.format("%d-%m %H:%M").to_string())
        .unwrap_or_default()
}

// --- TUI ---

/// Runs its closure when dropped.
struct Restore<F: FnMut()>(F);

impl<F: FnMut()> Drop for Restore<F> {
    fn drop(&mut self) {
        (self.0)()
    }
}

/// Raw mode plus the alternate screen, both undone when the guard drops,
/// including when entering fails halfway.
fn enter_terminal() -> Result<Restore<impl FnMut()>> {
    enable_raw_mode()?;
    let guard = Restore(|| {
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
        let _ = disable_raw_mode();
    });
    execute!(io::stdout(), EnterAlternateScreen)?;
    Ok(guard)
}

pub fn run_chart(asset: &str, history: &[Candle]) -> Result<()> {
    let _restore = enter_terminal()?;
    let backend = CrosstermBackend::new(io::stdout());
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, asset, history);

    terminal.show_cursor()?;
    res
}

fn run_app<B: Backend>(terminal: &mut Terminal<B>, asset: &str, history: &[Candle]) -> Result<()> {
    let points = chart_points(history);
    loop {
        terminal.draw(|f| ui(f, asset, &points))?;

        if event::poll(Duration::from_millis(50))? {
            // Resize needs no handling; the next draw picks up the new size.
            if let Event::Key(key) = event::read()? {
                if should_quit(key) {
                    return Ok(());
                }
            }
        }
    }
}

fn should_quit(key: KeyEvent) -> bool {
    key.kind == KeyEventKind::Press && matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
}

fn ui(f: &mut Frame, asset: &str, points: &[(f64, f64)]) {
    let layout = Layout::vertical([Constraint::Min(0), Constraint::Length(1)]).split(f.size());
    let (x, y) = bounds(points);

    let dataset = ChartDataset::default()
        .name(format!("{} Close Price", asset))
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(Color::Cyan))
        .data(points);

    let x_labels = vec![
        Span::raw(format_axis_time(x[0])),
        Span::raw(format_axis_time((x[0] + x[1]) / 2.0)),
        Span::raw(format_axis_time(x[1])),
    ];
    let y_labels = vec![
        Span::raw(format!("{:.2}", y[0])),
        Span::raw(format!("{:.2}", (y[0] + y[1]) / 2.0)),
        Span::raw(format!("{:.2}", y[1])),
    ];

    let chart = Chart::new(vec![dataset])
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title_alignment(Alignment::Center)
                .title(format!("{} Hourly Close Price Over Time", asset)),
        )
        .x_axis(
            Axis::default()
                .title("Timestamp")
                .style(Style::default().fg(Color::Gray))
                .bounds(x)
                .labels(x_labels),
        )
        .y_axis(
            Axis::default()
                .title("Close Price")
                .style(Style::default().fg(Color::Gray))
                .bounds(y)
                .labels(y_labels),
        );
    f.render_widget(chart, layout[0]);

    f.render_widget(
        Paragraph::new("q quits").alignment(Alignment::Center),
        layout[1],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candles::tests::hourly;
    use crate::warehouse::QueryResult;
    use crate::warehouse::memory::MemoryWarehouse;
    use crossterm::event::KeyModifiers;

    #[test]
    fn bounds_pad_the_price_axis() {
        let points = chart_points(&hourly("BTC", &[10.0, 20.0, 15.0]));
        let (x, y) = bounds(&points);
        assert_eq!(x[1] - x[0], 7200.0);
        assert!(y[0] < 10.0 && y[1] > 20.0);

        let flat = bounds(&[(0.0, 5.0), (1.0, 5.0)]).1;
        assert!(flat[0] < flat[1]);
    }

    #[test]
    fn restore_runs_when_setup_fails() {
        let restored = std::cell::Cell::new(false);
        let setup = || -> Result<()> {
            let _restore = Restore(|| restored.set(true));
            bail!("terminal refused the alternate screen")
        };
        assert!(setup().is_err());
        assert!(restored.get());
    }

    #[test]
    fn q_and_escape_quit() {
        assert!(should_quit(KeyEvent::new(KeyCode::Char('q'), KeyModifiers::NONE)));
        assert!(should_quit(KeyEvent::new(KeyCode::Esc, KeyModifiers::NONE)));
        assert!(!should_quit(KeyEvent::new(KeyCode::Char('x'), KeyModifiers::NONE)));
    }

    #[tokio::test]
    async fn history_is_returned_oldest_first() {
        let config = WarehouseConfig::default();
        let mut newest_first = hourly("BTC", &[1.0, 2.0, 3.0]);
        newest_first.reverse();
        let warehouse = MemoryWarehouse::new();
        warehouse.insert_table(&config.raw().unwrap(), QueryResult::from_records(&newest_first).unwrap());

        let history = explore(&warehouse, &config, "BTC", 1000, false).await.unwrap();

        let closes: Vec<f64> = history.iter().map(|c| c.close_price).collect();
        assert_eq!(closes, vec![1.0, 2.0, 3.0]);
        assert!(warehouse.executed()[0].contains("WHERE asset = 'BTC'"));
    }

    #[tokio::test]
    async fn empty_history_is_an_error() {
        let config = WarehouseConfig::default();
        let warehouse = MemoryWarehouse::new();
        warehouse.insert_table(&config.raw().unwrap(), QueryResult::from_records::<Candle>(&[]).unwrap());
        assert!(explore(&warehouse, &config, "BTC", 10, false).await.is_err());
    }
}
