use crate::assets::run_transform_chain;
use crate::config::{self, CUTOFF_CURRENT_DATE};
use crate::context::AppContext;
use anyhow::Result;
use log::info;

/// Runs the SQL transform chain up to `fundamentals.excess_returns`.
pub async fn run(app: &AppContext, cutoff: Option<&str>) -> Result<()> {
    let cutoff = config::resolve_cutoff_date(cutoff.unwrap_or(CUTOFF_CURRENT_DATE))?;
    let db = app.database()?;
    run_transform_chain(&db, &AppContext::sql_dir(), cutoff)?;
    let rows = db.count_rows("fundamentals", "excess_returns")?;
    info!("Transform chain complete with cutoff {}", cutoff);
    println!("fundamentals.excess_returns now holds {} rows", rows);
    Ok(())
}
