use crate::context::AppContext;
use anyhow::{anyhow, Result};
use log::{info, warn};

const PRICE_COLUMNS: [&str; 6] = [
    "date",
    "adjClose",
    "adjHigh",
    "adjLow",
    "adjOpen",
    "adjVolume",
];

/// Fetches daily adjusted price history for the given tickers and loads it
/// into `main.daily_adjusted`.
pub async fn run(
    app: &AppContext,
    tickers: &[String],
    start_date: &str,
    append: bool,
) -> Result<()> {
    if tickers.is_empty() {
        return Err(anyhow!("at least one ticker is required"));
    }
    let client = app.price_client()?;
    info!(
        "Backfilling {} tickers from {} onward",
        tickers.len(),
        start_date
    );
    let batch = client
        .fetch_history(tickers, start_date, &PRICE_COLUMNS)
        .await?;
    if !batch.empty_tickers.is_empty() {
        warn!(
            "{} tickers returned no data: {}",
            batch.empty_tickers.len(),
            batch.empty_tickers.join(", ")
        );
    }
    if batch.csv.is_empty() {
        warn!("No price data fetched; nothing to load");
        return Ok(());
    }

    let db = app.database()?;
    let rows = db.load_csv(&batch.csv, "main", "daily_adjusted", append)?;
    info!("Loaded {} rows into main.daily_adjusted", rows);
    println!(
        "Backfill complete: {} rows loaded, {} empty tickers",
        rows,
        batch.empty_tickers.len()
    );
    Ok(())
}
