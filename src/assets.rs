use crate::config;
use crate::database::Database;
use crate::graph::{Asset, AssetContext, Graph, RunState};
use crate::models::Horizon;
use crate::trainer::Trainer;
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use log::{info, warn};
use polars::prelude::*;
use std::path::Path;

/// Transform scripts in execution order; each has exactly one successor.
const TRANSFORM_SCRIPTS: [&str; 4] = [
    "1_wide_statements.sql",
    "2_wide_with_daily_fundamentals.sql",
    "3_wide_with_combined_metrics.sql",
    "4_excess_returns.sql",
];

pub const MACROS_SCRIPT: &str = "macros.sql";
pub const RELEVANT_PREDS_SCRIPT: &str = "relevant_preds.sql";

/// Runs the schema setup and the transform chain. The cutoff date is bound
/// as a `?` parameter into the first script, never interpolated.
pub fn run_transform_chain(db: &Database, sql_dir: &Path, cutoff: NaiveDate) -> Result<()> {
    db.execute_script_file(&sql_dir.join(MACROS_SCRIPT))?;
    for (idx, script) in TRANSFORM_SCRIPTS.iter().enumerate() {
        let path = sql_dir.join(script);
        info!("Running transform {}/{}: {}", idx + 1, TRANSFORM_SCRIPTS.len(), script);
        if idx == 0 {
            db.execute_script_file_with_cutoff(&path, cutoff)?;
        } else {
            db.execute_script_file(&path)?;
        }
    }
    Ok(())
}

fn log_frame_metadata(name: &str, frame: &DataFrame) {
    let estimated_bytes = frame.estimated_size();
    info!(
        "{}: {} rows x {} columns, ~{} KiB",
        name,
        frame.height(),
        frame.width(),
        estimated_bytes / 1024,
    );
    for column in frame.get_columns() {
        info!("  {} ({})", column.name(), column.dtype());
    }
}

fn excess_returns_asset(ctx: &AssetContext, state: &mut RunState) -> Result<()> {
    // Validate the cutoff before any SQL runs.
    let cutoff = match ctx.cutoff.as_deref() {
        Some(raw) => config::resolve_cutoff_date(raw)?,
        None => chrono::Utc::now().date_naive(),
    };
    let db = Database::open(&ctx.config.storage)?;
    run_transform_chain(&db, &ctx.sql_dir, cutoff)?;
    let frame = db.excess_returns_frame()?;
    if frame.height() == 0 {
        return Err(anyhow!("fundamentals.excess_returns came back empty"));
    }
    log_frame_metadata("fundamentals.excess_returns", &frame);
    state.feature_frame = Some(frame);
    Ok(())
}

fn train_asset(horizon: Horizon) -> impl Fn(&AssetContext, &mut RunState) -> Result<()> {
    move |ctx, state| {
        let frame = state
            .feature_frame
            .as_ref()
            .ok_or_else(|| anyhow!("feature frame not produced upstream"))?;
        let mut trainer = Trainer::new(
            frame,
            horizon,
            ctx.config,
            ctx.cutoff.as_deref(),
            ctx.seed,
        )?;
        trainer.fit(ctx.booster)?;
        let predictions = trainer.all_ticker_shaps(ctx.since)?;
        let summary = trainer.summary()?;
        match serde_json::to_string(&summary) {
            Ok(payload) => println!("STOCKCAST_TRAIN_SUMMARY={payload}"),
            Err(err) => warn!("Failed to serialize training summary: {err}"),
        }
        state.summaries.push(summary);
        info!(
            "{} produced {} prediction rows",
            horizon.pred_col(),
            predictions.height(),
        );
        state.horizon_frames.insert(horizon.pred_col(), predictions);
        Ok(())
    }
}

fn predictions_asset(ctx: &AssetContext, state: &mut RunState) -> Result<()> {
    let mut combined: Option<DataFrame> = None;
    for horizon in Horizon::PRODUCTION {
        let frame = state
            .horizon_frames
            .get(horizon.pred_col())
            .ok_or_else(|| anyhow!("missing {} predictions", horizon.pred_col()))?;
        combined = Some(match combined {
            Some(acc) => acc.vstack(frame)?,
            None => frame.clone(),
        });
    }
    let combined = combined.ok_or_else(|| anyhow!("no horizon predictions to insert"))?;
    let db = Database::open(&ctx.config.storage)?;
    let inserted = db
        .insert_predictions(&combined)
        .context("failed to upsert predictions")?;
    state.inserted_rows = Some(inserted);
    Ok(())
}

fn relevant_preds_asset(ctx: &AssetContext, _state: &mut RunState) -> Result<()> {
    let db = Database::open(&ctx.config.storage)?;
    db.execute_script_file(&ctx.sql_dir.join(RELEVANT_PREDS_SCRIPT))
}

/// The production graph: transform chain, fan-out to the three horizon
/// trainings, fan-in at the predictions upsert, then the dashboard view.
/// The 6-month model is configured but deliberately not part of this graph.
pub fn production_graph() -> Result<Graph> {
    let mut assets = vec![Asset::new("excess_returns", vec![], excess_returns_asset)];
    let mut train_names = Vec::new();
    for horizon in Horizon::PRODUCTION {
        let name: &'static str = horizon.pred_col();
        train_names.push(name);
        assets.push(Asset::new(name, vec!["excess_returns"], train_asset(horizon)));
    }
    assets.push(Asset::new("predictions", train_names, predictions_asset));
    assets.push(Asset::new(
        "relevant_preds",
        vec!["predictions"],
        relevant_preds_asset,
    ));
    Graph::new(assets)
}
