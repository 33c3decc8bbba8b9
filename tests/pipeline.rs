use anyhow::Result;
use chrono::{Duration, NaiveDate};
use stockcast::assets::{production_graph, run_transform_chain};
use stockcast::booster::{
    Booster, BoosterParams, Dataset, FittedModel, Prediction, ShapMatrix,
};
use stockcast::config::{AppConfig, AppEnv, StorageTarget};
use stockcast::database::Database;
use stockcast::graph::{AssetContext, RunState};
use stockcast::models::Horizon;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;
use uuid::Uuid;

const TICKERS: [&str; 3] = ["AAPL", "MSFT", "NVDA"];
const TOTAL_DAYS: i64 = 800;
const START_DATE: &str = "2020-01-06";
const CUTOFF: &str = "2022-01-03";
// sector, adj_volume, pe, ps_proxy, debt_to_equity, net_margin
const FEATURE_COUNT: usize = 6;

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = dotenvy::dotenv();
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn start_date() -> NaiveDate {
    NaiveDate::parse_from_str(START_DATE, "%Y-%m-%d").unwrap()
}

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("stockcast_test_{}.duckdb", Uuid::new_v4()))
}

fn local_config(path: &Path) -> AppConfig {
    AppConfig {
        env: AppEnv::Test,
        storage: StorageTarget::LocalFile(path.to_path_buf()),
        tiingo_token: None,
        test_size: 0.03,
        val_size: 0.05,
    }
}

fn sql_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("sql")
}

/// Deterministic price path per ticker so every log ratio is finite.
fn seed_universe(db: &Database) -> Result<()> {
    let start = start_date();

    let mut daily = String::from("date,adjClose,adjHigh,adjLow,adjOpen,adjVolume,ticker\n");
    let mut benchmark = String::from("date,close\n");
    for day in 0..TOTAL_DAYS {
        let date = start + Duration::days(day);
        let _ = writeln!(benchmark, "{},{:.4}", date, 100.0 + day as f64 * 0.05);
        for (offset, ticker) in TICKERS.iter().enumerate() {
            let close = 50.0 + offset as f64 * 20.0 + day as f64 * (0.08 + offset as f64 * 0.02);
            let _ = writeln!(
                daily,
                "{},{close:.4},{:.4},{:.4},{:.4},{},{ticker}",
                date,
                close * 1.01,
                close * 0.99,
                close,
                1_000_000 + day * 1000,
            );
        }
    }

    let mut statements = String::from("ticker,date,metric,value\n");
    for quarter in 0..10 {
        let date = start + Duration::days(quarter * 91);
        for (offset, ticker) in TICKERS.iter().enumerate() {
            let base = 1_000.0 + offset as f64 * 500.0 + quarter as f64 * 50.0;
            for (metric, value) in [
                ("revenue", base * 10.0),
                ("netIncome", base),
                ("eps", 2.0 + quarter as f64 * 0.1),
                ("equity", base * 5.0),
                ("debt", base * 2.0),
            ] {
                let _ = writeln!(statements, "{ticker},{date},{metric},{value:.4}");
            }
        }
    }

    let mut meta = String::from("ticker,name,sector\n");
    for ticker in TICKERS {
        let sector = if ticker == "NVDA" { "Semis" } else { "Tech" };
        let _ = writeln!(meta, "{ticker},{ticker} Inc,{sector}");
    }

    db.load_csv(daily.as_bytes(), "main", "daily_adjusted", false)?;
    db.load_csv(benchmark.as_bytes(), "main", "benchmark", false)?;
    db.load_csv(statements.as_bytes(), "main", "statements", false)?;
    db.load_csv(meta.as_bytes(), "main", "company_meta", false)?;
    Ok(())
}

/// Predicts the training-label mean and puts all attribution on the first
/// feature, so shap + bias reconstructs the prediction exactly.
struct StubBooster;

struct StubModel {
    mean: f64,
    feature_count: usize,
}

impl Booster for StubBooster {
    fn fit(
        &self,
        train: &Dataset,
        _validation: &Dataset,
        _params: &BoosterParams,
    ) -> Result<Box<dyn FittedModel>> {
        let finite: Vec<f64> = train
            .labels
            .iter()
            .copied()
            .filter(|value| value.is_finite())
            .collect();
        let mean = finite.iter().sum::<f64>() / finite.len().max(1) as f64;
        Ok(Box::new(StubModel {
            mean,
            feature_count: train.feature_names.len(),
        }))
    }
}

impl FittedModel for StubModel {
    fn best_iteration(&self) -> Option<u32> {
        Some(1)
    }

    fn validation_loss(&self) -> Option<f64> {
        Some(0.1)
    }

    fn predict(&self, data: &Dataset) -> Result<Vec<Prediction>> {
        Ok(vec![
            Prediction {
                mean: self.mean,
                variance: 0.09,
            };
            data.len()
        ])
    }

    fn shap(&self, data: &Dataset) -> Result<ShapMatrix> {
        let mut values = Vec::with_capacity(data.len());
        for _ in 0..data.len() {
            let mut row = vec![0.0; self.feature_count];
            row[0] = 0.02;
            values.push(row);
        }
        Ok(ShapMatrix {
            values,
            bias: vec![self.mean - 0.02; data.len()],
        })
    }
}

fn run_full_graph(config: &AppConfig, since: Option<NaiveDate>) -> Result<RunState> {
    let graph = production_graph()?;
    let ctx = AssetContext {
        config,
        booster: &StubBooster,
        sql_dir: sql_dir(),
        cutoff: Some(CUTOFF.to_string()),
        since,
        seed: Some(5),
    };
    let mut state = RunState::default();
    graph.run(&ctx, &mut state)?;
    Ok(state)
}

#[test]
fn transform_chain_materializes_excess_returns() {
    ensure_test_env();
    let path = temp_db_path();
    {
        let db = Database::open(&StorageTarget::LocalFile(path.clone())).unwrap();
        seed_universe(&db).unwrap();
        let cutoff = NaiveDate::parse_from_str(CUTOFF, "%Y-%m-%d").unwrap();
        run_transform_chain(&db, &sql_dir(), cutoff).unwrap();

        let rows = db.count_rows("fundamentals", "excess_returns").unwrap();
        assert_eq!(rows as i64, TOTAL_DAYS * TICKERS.len() as i64);

        let frame = db.excess_returns_frame().unwrap();
        let names: Vec<&str> = frame
            .get_column_names()
            .iter()
            .map(|name| name.as_str())
            .collect();
        for horizon in ["6m", "12m", "24m", "36m"] {
            assert!(names.contains(&format!("excess_return_ln_{horizon}").as_str()));
        }

        // Forward labels exist only where a full horizon of prices follows.
        let labeled = frame
            .column("excess_return_ln_12m")
            .unwrap()
            .f64()
            .unwrap()
            .into_iter()
            .filter(|value| value.is_some())
            .count();
        assert_eq!(labeled as i64, (TOTAL_DAYS - 252) * TICKERS.len() as i64);
    }
    let _ = fs::remove_file(&path);
}

#[test]
fn transform_chain_is_idempotent() {
    ensure_test_env();
    let path = temp_db_path();
    {
        let db = Database::open(&StorageTarget::LocalFile(path.clone())).unwrap();
        seed_universe(&db).unwrap();
        let cutoff = NaiveDate::parse_from_str(CUTOFF, "%Y-%m-%d").unwrap();
        run_transform_chain(&db, &sql_dir(), cutoff).unwrap();
        let first = db.count_rows("fundamentals", "excess_returns").unwrap();
        run_transform_chain(&db, &sql_dir(), cutoff).unwrap();
        let second = db.count_rows("fundamentals", "excess_returns").unwrap();
        assert_eq!(first, second);
    }
    let _ = fs::remove_file(&path);
}

#[test]
fn full_graph_trains_three_horizons_and_upserts() {
    ensure_test_env();
    let path = temp_db_path();
    {
        let config = local_config(&path);
        {
            let db = Database::open(&config.storage).unwrap();
            seed_universe(&db).unwrap();
        }

        let state = run_full_graph(&config, None).unwrap();
        assert_eq!(state.summaries.len(), 3);
        // since=None explains exactly the latest row per ticker
        let expected = TICKERS.len() * FEATURE_COUNT * Horizon::PRODUCTION.len();
        assert_eq!(state.inserted_rows, Some(expected));

        let db = Database::open(&config.storage).unwrap();
        let trained_dates = db.trained_dates().unwrap();
        assert_eq!(
            trained_dates,
            vec![NaiveDate::parse_from_str(CUTOFF, "%Y-%m-%d").unwrap()]
        );

        let tickers = db.prediction_tickers(trained_dates[0]).unwrap();
        assert_eq!(tickers, TICKERS.map(String::from).to_vec());

        let rows = db
            .forecast_rows(&tickers, trained_dates[0])
            .unwrap();
        assert_eq!(rows.len(), expected);
        // the latest row per ticker is the newest date, which has no
        // realized outcome yet at any horizon
        let last_date = start_date() + Duration::days(TOTAL_DAYS - 1);
        assert!(rows.iter().all(|row| row.date == last_date));
        assert!(rows.iter().all(|row| row.actual_value.is_none()));
        // groups arrive sorted by descending |shap|; the stub loads
        // everything onto the first feature
        assert!((rows[0].shap_value - 0.02).abs() < 1e-12);
        for window in rows.windows(2) {
            if window[0].pred_col == window[1].pred_col
                && window[0].ticker == window[1].ticker
                && window[0].date == window[1].date
            {
                assert!(window[0].shap_value.abs() >= window[1].shap_value.abs());
            }
        }
    }
    let _ = fs::remove_file(&path);
}

#[test]
fn rerunning_the_graph_replaces_instead_of_duplicating() {
    ensure_test_env();
    let path = temp_db_path();
    {
        let config = local_config(&path);
        {
            let db = Database::open(&config.storage).unwrap();
            seed_universe(&db).unwrap();
        }
        let first = run_full_graph(&config, None).unwrap();
        let second = run_full_graph(&config, None).unwrap();
        assert_eq!(first.inserted_rows, second.inserted_rows);

        let db = Database::open(&config.storage).unwrap();
        let total = db.count_rows("main", "predictions").unwrap();
        assert_eq!(Some(total), second.inserted_rows);
    }
    let _ = fs::remove_file(&path);
}

#[test]
fn since_window_with_no_rows_fails_the_run() {
    ensure_test_env();
    let path = temp_db_path();
    {
        let config = local_config(&path);
        {
            let db = Database::open(&config.storage).unwrap();
            seed_universe(&db).unwrap();
        }
        let far_future = NaiveDate::from_ymd_opt(2100, 1, 1).unwrap();
        let result = run_full_graph(&config, Some(far_future));
        assert!(result.is_err());

        // the failed training must leave main.predictions untouched
        let db = Database::open(&config.storage).unwrap();
        assert_eq!(db.count_rows("main", "predictions").unwrap(), 0);
    }
    let _ = fs::remove_file(&path);
}

#[test]
fn since_window_explains_every_row_in_range() {
    ensure_test_env();
    let path = temp_db_path();
    {
        let config = local_config(&path);
        {
            let db = Database::open(&config.storage).unwrap();
            seed_universe(&db).unwrap();
        }
        let since_offset = TOTAL_DAYS - 60;
        let since = start_date() + Duration::days(since_offset);
        let state = run_full_graph(&config, Some(since)).unwrap();

        // every row on or after the window start gets explained per
        // horizon, whether or not its outcome has realized yet
        let in_range = ((TOTAL_DAYS - since_offset) as usize) * TICKERS.len();
        let expected = in_range * FEATURE_COUNT * Horizon::PRODUCTION.len();
        assert_eq!(state.inserted_rows, Some(expected));

        let db = Database::open(&config.storage).unwrap();
        assert_eq!(db.count_rows("main", "predictions").unwrap(), expected);
    }
    let _ = fs::remove_file(&path);
}

#[test]
fn relevant_preds_tracks_the_latest_run_per_horizon() {
    ensure_test_env();
    let path = temp_db_path();
    {
        let config = local_config(&path);
        {
            let db = Database::open(&config.storage).unwrap();
            seed_universe(&db).unwrap();
        }
        run_full_graph(&config, None).unwrap();

        let db = Database::open(&config.storage).unwrap();
        let total = db.count_rows("main", "predictions").unwrap();
        let relevant = db.count_rows("main", "relevant_preds").unwrap();
        assert_eq!(total, relevant);
    }
    let _ = fs::remove_file(&path);
}
