use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use log::info;
use stockcast::{
    commands::{backfill, forecasts, run_pipeline, train, transform},
    context::AppContext,
    models::Horizon,
};

#[derive(Parser)]
#[command(name = "stockcast")]
#[command(about = "Stock forecasting pipeline: fetch, transform, train, explain")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch raw price history for tickers into the store
    Backfill {
        /// Tickers to fetch (comma or space separated)
        #[arg(value_delimiter = ',', num_args = 1..)]
        tickers: Vec<String>,
        /// First date to request (YYYY-MM-DD)
        #[arg(long, default_value = "1995-01-01")]
        start_date: String,
        /// Append to the existing table instead of replacing it
        #[arg(long)]
        append: bool,
    },
    /// Run the SQL transform chain up to fundamentals.excess_returns
    Transform {
        /// Cutoff date: "current_date" or YYYY-MM-DD
        #[arg(long)]
        cutoff: Option<String>,
    },
    /// Train one horizon model and upsert its predictions
    Train {
        /// Forecast horizon: 6m, 12m, 24m or 36m
        horizon: String,
        /// Cutoff date: "current_date" or YYYY-MM-DD
        #[arg(long)]
        cutoff: Option<String>,
        /// Explain rows on or after this date (default: latest per ticker)
        #[arg(long)]
        since: Option<NaiveDate>,
        /// Model seed (default: drawn from 0..10)
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Run the full asset graph over all production horizons
    Run {
        /// Cutoff date: "current_date" or YYYY-MM-DD
        #[arg(long)]
        cutoff: Option<String>,
        /// Explain rows on or after this date (default: latest per ticker)
        #[arg(long)]
        since: Option<NaiveDate>,
        /// Model seed (default: drawn from 0..10)
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Print stored forecasts and SHAP attributions for a selection
    Forecasts {
        /// Tickers to show (default: every ticker in the latest run)
        #[arg(value_delimiter = ',', num_args = 0..)]
        tickers: Vec<String>,
        /// Training run to read (default: the latest trained date)
        #[arg(long)]
        trained_date: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    let app = AppContext::initialize()?;
    info!("Starting stockcast. Forecasts are statistical estimates, not financial advice.");

    match command {
        Commands::Backfill {
            tickers,
            start_date,
            append,
        } => {
            backfill::run(&app, &tickers, &start_date, append).await?;
        }
        Commands::Transform { cutoff } => {
            transform::run(&app, cutoff.as_deref()).await?;
        }
        Commands::Train {
            horizon,
            cutoff,
            since,
            seed,
        } => {
            let horizon = Horizon::parse(&horizon)
                .ok_or_else(|| anyhow!("unknown horizon {horizon}; expected 6m, 12m, 24m or 36m"))?;
            train::run(&app, horizon, cutoff.as_deref(), since, seed).await?;
        }
        Commands::Run { cutoff, since, seed } => {
            run_pipeline::run(&app, cutoff.as_deref(), since, seed).await?;
        }
        Commands::Forecasts {
            tickers,
            trained_date,
        } => {
            forecasts::run(&app, &tickers, trained_date).await?;
        }
    }

    Ok(())
}
