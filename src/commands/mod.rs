pub mod backfill;
pub mod forecasts;
pub mod run_pipeline;
pub mod train;
pub mod transform;
