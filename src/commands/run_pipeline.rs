use crate::assets::production_graph;
use crate::booster::CatBoostCli;
use crate::context::AppContext;
use crate::graph::{AssetContext, RunState};
use anyhow::Result;
use chrono::NaiveDate;

/// Runs the full asset graph: transform chain, three horizon trainings,
/// prediction upsert, dashboard view refresh.
pub async fn run(
    app: &AppContext,
    cutoff: Option<&str>,
    since: Option<NaiveDate>,
    seed: Option<u64>,
) -> Result<()> {
    let graph = production_graph()?;
    let ctx = AssetContext {
        config: app.config(),
        booster: &CatBoostCli,
        sql_dir: AppContext::sql_dir(),
        cutoff: cutoff.map(ToString::to_string),
        since,
        seed,
    };
    let mut state = RunState::default();
    graph.run(&ctx, &mut state)?;

    println!(
        "Pipeline complete: {} horizons trained, {} prediction rows upserted",
        state.summaries.len(),
        state.inserted_rows.unwrap_or(0)
    );
    Ok(())
}
