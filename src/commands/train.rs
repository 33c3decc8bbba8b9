use crate::booster::CatBoostCli;
use crate::context::AppContext;
use crate::models::Horizon;
use crate::trainer::Trainer;
use anyhow::Result;
use chrono::NaiveDate;
use log::{info, warn};

/// Trains one horizon model over the current excess-returns frame, explains
/// it, and upserts the resulting predictions.
pub async fn run(
    app: &AppContext,
    horizon: Horizon,
    cutoff: Option<&str>,
    since: Option<NaiveDate>,
    seed: Option<u64>,
) -> Result<()> {
    let frame = {
        let db = app.database()?;
        db.excess_returns_frame()?
    };
    info!(
        "Training {} on {} feature rows",
        horizon.pred_col(),
        frame.height()
    );

    let mut trainer = Trainer::new(&frame, horizon, app.config(), cutoff, seed)?;
    trainer.fit(&CatBoostCli)?;
    let predictions = trainer.all_ticker_shaps(since)?;

    let summary = trainer.summary()?;
    match serde_json::to_string(&summary) {
        Ok(payload) => println!("STOCKCAST_TRAIN_SUMMARY={payload}"),
        Err(err) => warn!("Failed to serialize training summary: {err}"),
    }

    let db = app.database()?;
    let inserted = db.insert_predictions(&predictions)?;
    println!(
        "Upserted {} prediction rows for {}",
        inserted,
        horizon.pred_col()
    );
    Ok(())
}
