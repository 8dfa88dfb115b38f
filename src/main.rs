use anyhow::Result;
use clap::{Parser, Subcommand};
use crypto_warehouse::config::AppConfig;
use crypto_warehouse::model::{self, ModelKind};
use crypto_warehouse::quality::{self, Suite};
use crypto_warehouse::storage_utils::AsyncStorageManager;
use crypto_warehouse::warehouse::{LazyBigQuery, TablePath};
use crypto_warehouse::{admin, analysis, indicator_cache, report, training, tui};
use log::error;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "crypto-warehouse", version, about = "Crypto price warehouse tasks")]
struct Cli {
    /// Storage directory for config, caches and models [default: storage/ next to the binary]
    #[arg(long, global = true)]
    storage: Option<PathBuf>,

    /// Config document name inside the storage directory
    #[arg(long, global = true, default_value = "config")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Authenticate and run SELECT 1
    Ping,
    /// List the tables of the dataset
    Tables,
    /// Print a few rows of each sample table
    Sample,
    /// Rename legacy columns of a price table in place
    RenameColumns {
        /// `project.dataset.table`; the raw price table when omitted
        #[arg(long)]
        table: Option<String>,
    },
    /// Null, duplicate and sign checks on the raw table
    Validate,
    /// Data-quality checks on the raw table
    Quality {
        #[arg(long, value_enum, default_value_t = Suite::Full)]
        suite: Suite,
        /// Evaluate over the recent window locally instead of in SQL
        #[arg(long)]
        local: bool,
    },
    /// Chart one asset's recent close prices
    Explore {
        #[arg(long)]
        asset: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        /// Print a summary table instead of the chart
        #[arg(long)]
        no_chart: bool,
    },
    /// Compute indicators and optimal timeframes, replacing both tables
    Indicators,
    /// Load the technicals into the local cache and preview them
    LoadIndicators {
        /// Ignore an existing cache
        #[arg(long)]
        refresh: bool,
    },
    /// Train a model on the technicals and log its metrics
    Train {
        /// Registered model name [default: MODEL_NAME or the config]
        #[arg(long)]
        model: Option<String>,
        /// Grid-search hyperparameters with cross-validation first
        #[arg(long)]
        tune: bool,
    },
    /// Show the shape and hyperparameters of a saved model
    Inspect {
        /// Registered model name [default: MODEL_NAME or the config]
        #[arg(long)]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("warn,crypto_warehouse=info"),
    )
    .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{:?}", e);
        eprintln!("\n❌ {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let storage = match &cli.storage {
        Some(dir) => AsyncStorageManager::new(dir).await?,
        None => AsyncStorageManager::new_relative("storage").await?,
    };
    let config = AppConfig::load(&storage, &cli.config).await?;
    // Authenticates on first use; cached indicators and saved models need no credentials.
    let client = LazyBigQuery::new(config.warehouse.clone());
    let warehouse = &client;

    match cli.command {
        Command::Ping => admin::ping(warehouse).await?,
        Command::Tables => {
            admin::list_tables(warehouse, &config.warehouse).await?;
        }
        Command::Sample => {
            admin::sample_tables(warehouse, &config.warehouse).await?;
        }
        Command::RenameColumns { table } => {
            let table = match table {
                Some(raw) => TablePath::parse(&raw)?,
                None => config.warehouse.raw()?,
            };
            admin::rename_columns(warehouse, &table).await?;
        }
        Command::Validate => {
            let report = quality::run_remote(
                warehouse,
                &config.warehouse.raw()?,
                Suite::Validation,
                &config.quality,
            )
            .await?;
            quality::print_report(&report)?;
        }
        Command::Quality { suite, local } => {
            let table = config.warehouse.raw()?;
            let report = if local {
                quality::run_recent_window(
                    warehouse,
                    &table,
                    config.indicators.lookback_months,
                    suite,
                    &config.quality,
                )
                .await?
            } else {
                quality::run_remote(warehouse, &table, suite, &config.quality).await?
            };
            quality::print_report(&report)?;
        }
        Command::Explore {
            asset,
            limit,
            no_chart,
        } => {
            let asset = asset.unwrap_or_else(|| config.explore.asset.clone());
            let limit = limit.unwrap_or(config.explore.limit);
            tui::explore(warehouse, &config.warehouse, &asset, limit, !no_chart).await?;
        }
        Command::Indicators => {
            analysis::run_indicator_pipeline(warehouse, &config).await?;
        }
        Command::LoadIndicators { refresh } => {
            let rows =
                indicator_cache::load_indicators(warehouse, &storage, &config, refresh).await?;
            indicator_cache::print_head(&rows, 5)?;
        }
        Command::Train { model, tune } => {
            let kind: ModelKind = model.as_deref().unwrap_or(&config.model.name).parse()?;
            training::train(warehouse, &storage, &config, kind, tune).await?;
        }
        Command::Inspect { model } => {
            let kind: ModelKind = model.as_deref().unwrap_or(&config.model.name).parse()?;
            let saved = model::load_model(&storage, &config.model, kind).await?;
            println!("{}", report::model_table(&saved.summary()?));
        }
    }
    Ok(())
}
