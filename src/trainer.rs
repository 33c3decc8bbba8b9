use crate::booster::{Booster, BoosterParams, Dataset, FeatureValue, FittedModel, Prediction};
use crate::config::{self, AppConfig};
use crate::models::{FitReport, Horizon, TrainingDatasetSummary, TrainingSummary};
use chrono::{DateTime, NaiveDate, Utc};
use log::info;
use polars::prelude::*;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainerError {
    #[error("invalid cutoff date {raw:?}: expected \"current_date\" or YYYY-MM-DD")]
    InvalidCutoff { raw: String },
    #[error("no rows with a non-null {label} label")]
    EmptyFrame { label: String },
    #[error("only {rows} labeled rows; not enough to carve out holdout and validation sets")]
    NotEnoughRows { rows: usize },
    #[error("unknown ticker {0}")]
    UnknownTicker(String),
    #[error("no rows in the requested window ({since})")]
    EmptyWindow { since: String },
    #[error("model has not been fitted yet")]
    NotFitted,
    #[error("frame error: {0}")]
    Frame(#[from] PolarsError),
    #[error(transparent)]
    Booster(#[from] anyhow::Error),
}

pub type TrainerResult<T> = std::result::Result<T, TrainerError>;

/// Row indices of the cleaned frame assigned to each split.
pub struct TrainTestSplit {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
    pub holdout: Vec<usize>,
}

struct ShapRecord {
    date: NaiveDate,
    ticker: String,
    feature: String,
    shap_value: f64,
    feature_value: String,
    bias: f64,
    predicted_value_log: f64,
    actual_value_log: Option<f64>,
    predicted_value: f64,
    predicted_std: f64,
    actual_value: Option<f64>,
}

/// Trains one horizon model over the excess-returns feature frame and turns
/// its SHAP output into the long predictions format.
pub struct Trainer {
    horizon: Horizon,
    tickers: Vec<String>,
    dates: Vec<NaiveDate>,
    labels: Vec<f64>,
    feature_names: Vec<String>,
    categorical: Vec<bool>,
    feature_columns: Vec<FeatureColumn>,
    split: TrainTestSplit,
    params: BoosterParams,
    trained_date: NaiveDate,
    trained_at: DateTime<Utc>,
    model: Option<Box<dyn FittedModel>>,
    report: Option<FitReport>,
}

enum FeatureColumn {
    Num(Vec<Option<f64>>),
    Cat(Vec<String>),
}

impl Trainer {
    /// Builds a trainer from the raw excess-returns frame. The cutoff string
    /// is validated here; a malformed value is an error, never a silent
    /// fallback to the run timestamp.
    pub fn new(
        frame: &DataFrame,
        horizon: Horizon,
        config: &AppConfig,
        cutoff: Option<&str>,
        seed: Option<u64>,
    ) -> TrainerResult<Self> {
        let trained_date = match cutoff {
            Some(raw) => config::resolve_cutoff_date(raw)
                .map_err(|_| TrainerError::InvalidCutoff { raw: raw.to_string() })?,
            None => Utc::now().date_naive(),
        };
        let seed = seed.unwrap_or_else(|| {
            rand::rngs::StdRng::from_entropy().gen_range(0..10)
        });

        let label = horizon.pred_col();
        let cleaned = prepare_frame(frame, horizon)?;
        let height = cleaned.height();

        let tickers = string_column(&cleaned, "ticker")?;
        let dates = date_column(&cleaned, "date")?;
        let labels: Vec<f64> = cleaned
            .column(label)?
            .f64()?
            .into_iter()
            .map(|value| value.unwrap_or(f64::NAN))
            .collect();

        // Only rows with a realized outcome can be fitted against; the rest
        // of the frame stays available to the explanation paths.
        let labeled: Vec<usize> = (0..height)
            .filter(|idx| labels[*idx].is_finite())
            .collect();
        if labeled.is_empty() {
            return Err(TrainerError::EmptyFrame {
                label: label.to_string(),
            });
        }

        let mut feature_names = Vec::new();
        let mut categorical = Vec::new();
        let mut feature_columns = Vec::new();
        for column in cleaned.get_columns() {
            let name = column.name().as_str();
            if name == "ticker" || name == "date" || name == label {
                continue;
            }
            feature_names.push(name.to_string());
            match column.dtype() {
                DataType::Float64 => {
                    categorical.push(false);
                    feature_columns.push(FeatureColumn::Num(
                        column.f64()?.into_iter().collect(),
                    ));
                }
                _ => {
                    // Non-float columns are treated as categorical features.
                    categorical.push(true);
                    feature_columns.push(FeatureColumn::Cat(
                        column
                            .str()?
                            .into_iter()
                            .map(|value| value.unwrap_or("None").to_string())
                            .collect(),
                    ));
                }
            }
        }

        let split = split_rows(&labeled, config.test_size, config.val_size, seed)?;
        info!(
            "Prepared {} training frame: {} rows ({} labeled), {} features ({} categorical), split train={}/val={}/holdout={}, seed={}",
            label,
            height,
            labeled.len(),
            feature_names.len(),
            categorical.iter().filter(|flag| **flag).count(),
            split.train.len(),
            split.validation.len(),
            split.holdout.len(),
            seed,
        );

        Ok(Self {
            horizon,
            tickers,
            dates,
            labels,
            feature_names,
            categorical,
            feature_columns,
            split,
            params: hyperparams(horizon, config.training_iterations(), seed),
            trained_date,
            trained_at: Utc::now(),
            model: None,
            report: None,
        })
    }

    pub fn params(&self) -> BoosterParams {
        self.params
    }

    pub fn split(&self) -> &TrainTestSplit {
        &self.split
    }

    pub fn report(&self) -> Option<&FitReport> {
        self.report.as_ref()
    }

    /// Fits the booster on the train/validation split and scores the holdout.
    pub fn fit(&mut self, booster: &dyn Booster) -> TrainerResult<&FitReport> {
        let train = self.dataset_for(&self.split.train);
        let validation = self.dataset_for(&self.split.validation);
        let model = booster.fit(&train, &validation, &self.params)?;

        let holdout = self.dataset_for(&self.split.holdout);
        let predictions = model.predict(&holdout)?;
        let holdout_rmse = rmse(&predictions, &holdout.labels);

        self.trained_at = Utc::now();
        let report = FitReport {
            best_iteration: model
                .best_iteration()
                .unwrap_or_else(|| self.params.iterations.saturating_sub(1)),
            validation_loss: model.validation_loss(),
            holdout_rmse,
            trained_at: self.trained_at,
            seed: self.params.seed,
        };
        println!(
            "Trained {}: best_iteration={} holdout_rmse={:.6}",
            self.horizon.pred_col(),
            report.best_iteration,
            report.holdout_rmse,
        );
        self.model = Some(model);
        self.report = Some(report);
        Ok(self.report.as_ref().ok_or(TrainerError::NotFitted)?)
    }

    /// SHAP attribution for one ticker; `since` keeps rows on or after the
    /// given date, `None` keeps only the ticker's latest row.
    pub fn ticker_shap(
        &self,
        ticker: &str,
        since: Option<NaiveDate>,
    ) -> TrainerResult<DataFrame> {
        let ticker = ticker.trim().to_ascii_uppercase();
        let ticker_rows: Vec<usize> = (0..self.tickers.len())
            .filter(|idx| self.tickers[*idx] == ticker)
            .collect();
        if ticker_rows.is_empty() {
            return Err(TrainerError::UnknownTicker(ticker));
        }
        let selected: Vec<usize> = match since {
            Some(date) => ticker_rows
                .into_iter()
                .filter(|idx| self.dates[*idx] >= date)
                .collect(),
            None => ticker_rows
                .into_iter()
                .max_by_key(|idx| (self.dates[*idx], *idx))
                .into_iter()
                .collect(),
        };
        if selected.is_empty() {
            return Err(TrainerError::EmptyWindow {
                since: format_since(since),
            });
        }
        self.shap_frame(&selected)
    }

    /// SHAP attribution for every ticker: all rows on or after `since`, or
    /// exactly the latest row per ticker when `since` is `None`.
    pub fn all_ticker_shaps(&self, since: Option<NaiveDate>) -> TrainerResult<DataFrame> {
        let selected: Vec<usize> = match since {
            Some(date) => (0..self.dates.len())
                .filter(|idx| self.dates[*idx] >= date)
                .collect(),
            None => {
                let mut latest: HashMap<&str, usize> = HashMap::new();
                for idx in 0..self.dates.len() {
                    let entry = latest.entry(self.tickers[idx].as_str()).or_insert(idx);
                    if self.dates[idx] >= self.dates[*entry] {
                        *entry = idx;
                    }
                }
                let mut rows: Vec<usize> = latest.into_values().collect();
                rows.sort_unstable();
                rows
            }
        };
        if selected.is_empty() {
            return Err(TrainerError::EmptyWindow {
                since: format_since(since),
            });
        }
        self.shap_frame(&selected)
    }

    pub fn summary(&self) -> TrainerResult<TrainingSummary> {
        let report = self.report.as_ref().ok_or(TrainerError::NotFitted)?;
        Ok(TrainingSummary {
            pred_col: self.horizon.pred_col().to_string(),
            seed: self.params.seed,
            iterations: self.params.iterations,
            best_iteration: report.best_iteration,
            holdout_rmse: report.holdout_rmse,
            trained_at: report.trained_at.to_rfc3339(),
            trained_date: self.trained_date.to_string(),
            train_dataset: TrainingDatasetSummary {
                row_count: self.split.train.len(),
                feature_count: self.feature_names.len(),
                categorical_count: self.categorical.iter().filter(|flag| **flag).count(),
            },
        })
    }

    fn dataset_for(&self, indices: &[usize]) -> Dataset {
        let mut rows = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for idx in indices {
            let mut row = Vec::with_capacity(self.feature_columns.len());
            for column in &self.feature_columns {
                row.push(match column {
                    FeatureColumn::Num(values) => FeatureValue::Num(values[*idx]),
                    FeatureColumn::Cat(values) => FeatureValue::Cat(values[*idx].clone()),
                });
            }
            rows.push(row);
            labels.push(self.labels[*idx]);
        }
        Dataset {
            feature_names: self.feature_names.clone(),
            categorical: self.categorical.clone(),
            labels,
            rows,
        }
    }

    fn shap_frame(&self, indices: &[usize]) -> TrainerResult<DataFrame> {
        let model = self.model.as_deref().ok_or(TrainerError::NotFitted)?;
        let dataset = self.dataset_for(indices);
        let predictions = model.predict(&dataset)?;
        let shap = model.shap(&dataset)?;

        let mut records = Vec::with_capacity(indices.len() * self.feature_names.len());
        for (pos, idx) in indices.iter().enumerate() {
            let Prediction { mean, variance } = predictions[pos];
            let predicted_value = mean.exp();
            let predicted_std = ((2.0 * mean).exp() * variance).sqrt();
            let actual_log = Some(self.labels[*idx]).filter(|value| value.is_finite());
            for (feature_idx, feature) in self.feature_names.iter().enumerate() {
                records.push(ShapRecord {
                    date: self.dates[*idx],
                    ticker: self.tickers[*idx].clone(),
                    feature: feature.clone(),
                    shap_value: shap.values[pos][feature_idx],
                    feature_value: self.format_feature(feature_idx, *idx),
                    bias: shap.bias[pos],
                    predicted_value_log: mean,
                    actual_value_log: actual_log,
                    predicted_value,
                    predicted_std,
                    actual_value: actual_log.map(f64::exp),
                });
            }
        }

        records.sort_by(|a, b| {
            a.date
                .cmp(&b.date)
                .then_with(|| a.ticker.cmp(&b.ticker))
                .then_with(|| {
                    b.shap_value
                        .abs()
                        .partial_cmp(&a.shap_value.abs())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });

        self.records_to_frame(&records)
    }

    fn format_feature(&self, feature_idx: usize, row_idx: usize) -> String {
        match &self.feature_columns[feature_idx] {
            FeatureColumn::Num(values) => match values[row_idx] {
                Some(value) => format!("{}", value),
                None => "None".to_string(),
            },
            FeatureColumn::Cat(values) => values[row_idx].clone(),
        }
    }

    fn records_to_frame(&self, records: &[ShapRecord]) -> TrainerResult<DataFrame> {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).ok_or_else(|| {
            TrainerError::Booster(anyhow::anyhow!("epoch date out of range"))
        })?;
        let date_days: Vec<i32> = records
            .iter()
            .map(|r| (r.date - epoch).num_days() as i32)
            .collect();
        let trained_days = (self.trained_date - epoch).num_days() as i32;
        let trained_at_micros = self.trained_at.timestamp_micros();
        let height = records.len();

        let frame = DataFrame::new(vec![
            Series::new("date".into(), date_days)
                .cast(&DataType::Date)?
                .into_column(),
            Series::new(
                "ticker".into(),
                records.iter().map(|r| r.ticker.clone()).collect::<Vec<_>>(),
            )
            .into_column(),
            Series::new(
                "feature".into(),
                records.iter().map(|r| r.feature.clone()).collect::<Vec<_>>(),
            )
            .into_column(),
            Series::new(
                "shap_value".into(),
                records.iter().map(|r| r.shap_value).collect::<Vec<_>>(),
            )
            .into_column(),
            Series::new(
                "feature_value".into(),
                records
                    .iter()
                    .map(|r| r.feature_value.clone())
                    .collect::<Vec<_>>(),
            )
            .into_column(),
            Series::new(
                "bias".into(),
                records.iter().map(|r| r.bias).collect::<Vec<_>>(),
            )
            .into_column(),
            Series::new(
                "predicted_value_log".into(),
                records
                    .iter()
                    .map(|r| r.predicted_value_log)
                    .collect::<Vec<_>>(),
            )
            .into_column(),
            Series::new(
                "actual_value_log".into(),
                records
                    .iter()
                    .map(|r| r.actual_value_log)
                    .collect::<Vec<_>>(),
            )
            .into_column(),
            Series::new(
                "predicted_value".into(),
                records.iter().map(|r| r.predicted_value).collect::<Vec<_>>(),
            )
            .into_column(),
            Series::new(
                "predicted_std".into(),
                records.iter().map(|r| r.predicted_std).collect::<Vec<_>>(),
            )
            .into_column(),
            Series::new(
                "actual_value".into(),
                records.iter().map(|r| r.actual_value).collect::<Vec<_>>(),
            )
            .into_column(),
            Series::new(
                "pred_col".into(),
                vec![self.horizon.pred_col().to_string(); height],
            )
            .into_column(),
            Series::new("trained_at".into(), vec![trained_at_micros; height])
                .cast(&DataType::Datetime(TimeUnit::Microseconds, None))?
                .into_column(),
            Series::new("trained_date".into(), vec![trained_days; height])
                .cast(&DataType::Date)?
                .into_column(),
        ])?;
        Ok(frame)
    }
}

/// Cleans the raw excess-returns frame for one horizon: decimal columns
/// widened to Float64, string nulls filled with "None", the other horizon
/// labels and the company name dropped. Rows with a null label are kept:
/// recent dates have no realized outcome yet but still get explained.
fn prepare_frame(frame: &DataFrame, horizon: Horizon) -> PolarsResult<DataFrame> {
    let label = horizon.pred_col();
    let keep: Vec<String> = frame
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .filter(|name| {
            if name == "name" {
                return false;
            }
            if name == label {
                return true;
            }
            !Horizon::all_pred_cols().contains(&name.as_str())
        })
        .collect();
    let mut selected = frame.select(keep)?;

    let names: Vec<String> = selected
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    for name in names {
        let column = selected.column(&name)?;
        match column.dtype() {
            DataType::Decimal(_, _) => {
                let widened = column.cast(&DataType::Float64)?;
                selected.with_column(widened)?;
            }
            DataType::String if name != "ticker" => {
                let filled: Vec<String> = column
                    .str()?
                    .into_iter()
                    .map(|value| value.unwrap_or("None").to_string())
                    .collect();
                selected.with_column(Series::new(name.as_str().into(), filled))?;
            }
            _ => {}
        }
    }

    Ok(selected)
}

/// Holdout first, validation from the remainder, seeded shuffle throughout.
/// `rows` holds the frame indices of the labeled rows.
fn split_rows(
    rows: &[usize],
    test_size: f64,
    val_size: f64,
    seed: u64,
) -> TrainerResult<TrainTestSplit> {
    let height = rows.len();
    let mut indices: Vec<usize> = rows.to_vec();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let holdout_count = ((height as f64) * test_size).ceil() as usize;
    let holdout: Vec<usize> = indices[..holdout_count.min(height)].to_vec();
    let remainder = &indices[holdout_count.min(height)..];
    let val_count = ((remainder.len() as f64) * val_size).ceil() as usize;
    let validation: Vec<usize> = remainder[..val_count.min(remainder.len())].to_vec();
    let train: Vec<usize> = remainder[val_count.min(remainder.len())..].to_vec();

    if train.is_empty() || validation.is_empty() || holdout.is_empty() {
        return Err(TrainerError::NotEnoughRows { rows: height });
    }
    Ok(TrainTestSplit {
        train,
        validation,
        holdout,
    })
}

/// The 6-month model regularizes harder than the longer horizons.
fn hyperparams(horizon: Horizon, iterations: u32, seed: u64) -> BoosterParams {
    let (l2_leaf_reg, model_size_reg, subsample, min_data_in_leaf) = match horizon {
        Horizon::M6 => (20.0, 0.1, 0.8, 15),
        _ => (15.0, 0.08, 0.9, 10),
    };
    BoosterParams {
        iterations,
        learning_rate: 0.15,
        depth: 6,
        l2_leaf_reg,
        model_size_reg,
        subsample,
        min_data_in_leaf,
        early_stopping_rounds: 25,
        seed,
    }
}

fn rmse(predictions: &[Prediction], labels: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (prediction, label) in predictions.iter().zip(labels) {
        if label.is_finite() {
            let diff = prediction.mean - label;
            sum += diff * diff;
            count += 1;
        }
    }
    if count == 0 {
        f64::NAN
    } else {
        (sum / count as f64).sqrt()
    }
}

fn format_since(since: Option<NaiveDate>) -> String {
    match since {
        Some(date) => format!("since {}", date),
        None => "latest rows".to_string(),
    }
}

fn string_column(frame: &DataFrame, name: &str) -> TrainerResult<Vec<String>> {
    Ok(frame
        .column(name)?
        .str()?
        .into_iter()
        .map(|value| value.unwrap_or_default().to_string())
        .collect())
}

fn date_column(frame: &DataFrame, name: &str) -> TrainerResult<Vec<NaiveDate>> {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)
        .ok_or_else(|| TrainerError::Booster(anyhow::anyhow!("epoch date out of range")))?;
    Ok(frame
        .column(name)?
        .date()?
        .into_iter()
        .map(|days| epoch + chrono::Duration::days(days.unwrap_or(0) as i64))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booster::ShapMatrix;
    use crate::config::{AppConfig, AppEnv, StorageTarget};

    /// Deterministic stand-in: the "model" predicts the mean of its training
    /// labels and attributes everything to the first feature.
    pub struct StubBooster;

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
        ) -> anyhow::Result<Box<dyn FittedModel>> {
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
            Some(7)
        }

        fn validation_loss(&self) -> Option<f64> {
            Some(0.25)
        }

        fn predict(&self, data: &Dataset) -> anyhow::Result<Vec<Prediction>> {
            Ok(vec![
                Prediction {
                    mean: self.mean,
                    variance: 0.04,
                };
                data.len()
            ])
        }

        fn shap(&self, data: &Dataset) -> anyhow::Result<ShapMatrix> {
            let mut values = Vec::with_capacity(data.len());
            let bias = vec![self.mean - 0.01; data.len()];
            for _ in 0..data.len() {
                let mut row = vec![0.0; self.feature_count];
                if !row.is_empty() {
                    row[0] = 0.01;
                }
                values.push(row);
            }
            Ok(ShapMatrix { values, bias })
        }
    }

    fn test_config() -> AppConfig {
        AppConfig {
            env: AppEnv::Test,
            storage: StorageTarget::InMemory,
            tiingo_token: None,
            test_size: 0.1,
            val_size: 0.1,
        }
    }

    fn sample_frame() -> DataFrame {
        let tickers = ["AAPL", "AAPL", "AAPL", "MSFT", "MSFT", "MSFT", "NVDA", "NVDA", "NVDA", "NVDA"];
        let days: Vec<i32> = (0..10).map(|i| 19000 + (i % 3) * 30).collect();
        // each ticker's newest date has no realized outcome yet
        let labels: Vec<Option<f64>> = (0..10)
            .map(|i| (i % 3 != 2).then(|| 0.05 + i as f64 * 0.01))
            .collect();
        let pe: Vec<Option<f64>> = (0..10).map(|i| Some(10.0 + i as f64)).collect();
        let sector: Vec<Option<&str>> = (0..10)
            .map(|i| if i == 4 { None } else { Some("Tech") })
            .collect();
        DataFrame::new(vec![
            Series::new("ticker".into(), tickers.map(String::from).to_vec()).into_column(),
            Series::new("date".into(), days)
                .cast(&DataType::Date)
                .unwrap()
                .into_column(),
            Series::new("name".into(), vec!["Company"; 10]).into_column(),
            Series::new("pe".into(), pe).into_column(),
            Series::new("sector".into(), sector).into_column(),
            Series::new("excess_return_ln_12m".into(), labels.clone()).into_column(),
            Series::new("excess_return_ln_24m".into(), labels.clone()).into_column(),
            Series::new("excess_return_ln_36m".into(), labels.clone()).into_column(),
            Series::new("excess_return_ln_6m".into(), labels).into_column(),
        ])
        .unwrap()
    }

    fn fitted_trainer() -> Trainer {
        let frame = sample_frame();
        let mut trainer = Trainer::new(
            &frame,
            Horizon::M12,
            &test_config(),
            Some("2024-06-30"),
            Some(3),
        )
        .unwrap();
        trainer.fit(&StubBooster).unwrap();
        trainer
    }

    #[test]
    fn prepare_drops_name_and_other_labels() {
        let cleaned = prepare_frame(&sample_frame(), Horizon::M12).unwrap();
        let names: Vec<&str> = cleaned
            .get_column_names()
            .iter()
            .map(|name| name.as_str())
            .collect();
        assert!(names.contains(&"excess_return_ln_12m"));
        assert!(!names.contains(&"excess_return_ln_24m"));
        assert!(!names.contains(&"name"));
    }

    #[test]
    fn prepare_fills_string_nulls() {
        let cleaned = prepare_frame(&sample_frame(), Horizon::M12).unwrap();
        let sector = cleaned.column("sector").unwrap().str().unwrap();
        assert!(sector.into_iter().all(|value| value.is_some()));
        assert_eq!(sector.get(4), Some("None"));
    }

    #[test]
    fn split_is_seeded_and_disjoint() {
        let rows: Vec<usize> = (0..100).collect();
        let a = split_rows(&rows, 0.03, 0.05, 42).unwrap();
        let b = split_rows(&rows, 0.03, 0.05, 42).unwrap();
        assert_eq!(a.holdout, b.holdout);
        assert_eq!(a.train, b.train);
        let mut all: Vec<usize> = a
            .train
            .iter()
            .chain(&a.validation)
            .chain(&a.holdout)
            .copied()
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn six_month_model_regularizes_harder() {
        let six = hyperparams(Horizon::M6, 200, 1);
        let twelve = hyperparams(Horizon::M12, 200, 1);
        assert_eq!(six.l2_leaf_reg, 20.0);
        assert_eq!(six.min_data_in_leaf, 15);
        assert_eq!(twelve.l2_leaf_reg, 15.0);
        assert_eq!(twelve.subsample, 0.9);
        assert_eq!(six.depth, twelve.depth);
    }

    #[test]
    fn invalid_cutoff_is_rejected() {
        let result = Trainer::new(
            &sample_frame(),
            Horizon::M12,
            &test_config(),
            Some("yesterday"),
            Some(1),
        );
        assert!(matches!(result, Err(TrainerError::InvalidCutoff { .. })));
    }

    #[test]
    fn unknown_ticker_is_an_error() {
        let trainer = fitted_trainer();
        assert!(matches!(
            trainer.ticker_shap("ZZZZ", None),
            Err(TrainerError::UnknownTicker(_))
        ));
    }

    #[test]
    fn empty_window_is_an_error() {
        let trainer = fitted_trainer();
        let far_future = NaiveDate::from_ymd_opt(2100, 1, 1).unwrap();
        assert!(matches!(
            trainer.all_ticker_shaps(Some(far_future)),
            Err(TrainerError::EmptyWindow { .. })
        ));
    }

    #[test]
    fn shap_sum_plus_bias_reconstructs_prediction() {
        let trainer = fitted_trainer();
        let frame = trainer.all_ticker_shaps(None).unwrap();
        let shap = frame.column("shap_value").unwrap().f64().unwrap();
        let bias = frame.column("bias").unwrap().f64().unwrap();
        let predicted = frame.column("predicted_value_log").unwrap().f64().unwrap();
        let features = frame.column("feature").unwrap().str().unwrap();
        let feature_count = trainer.feature_names.len();
        for group in 0..(frame.height() / feature_count) {
            let start = group * feature_count;
            let sum: f64 = (start..start + feature_count)
                .map(|i| shap.get(i).unwrap())
                .sum();
            let total = sum + bias.get(start).unwrap();
            assert!((total - predicted.get(start).unwrap()).abs() < 1e-9);
            let mut seen: Vec<&str> = (start..start + feature_count)
                .map(|i| features.get(i).unwrap())
                .collect();
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len(), feature_count);
        }
    }

    #[test]
    fn latest_rows_cover_each_ticker_once() {
        let trainer = fitted_trainer();
        let frame = trainer.all_ticker_shaps(None).unwrap();
        let feature_count = trainer.feature_names.len();
        // three tickers, one latest row each
        assert_eq!(frame.height(), 3 * feature_count);
        let std = frame.column("predicted_std").unwrap().f64().unwrap();
        let log_pred = frame.column("predicted_value_log").unwrap().f64().unwrap();
        let expected = ((2.0 * log_pred.get(0).unwrap()).exp() * 0.04).sqrt();
        assert!((std.get(0).unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn latest_rows_are_the_newest_even_without_a_label() {
        let trainer = fitted_trainer();
        let frame = trainer.all_ticker_shaps(None).unwrap();
        // every ticker's newest row is the unlabeled one, not the last row
        // with a realized outcome
        let newest = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()
            + chrono::Duration::days(19060);
        let dates = frame.column("date").unwrap().date().unwrap();
        assert!(dates.as_date_iter().all(|date| date == Some(newest)));
        let actuals = frame.column("actual_value").unwrap().f64().unwrap();
        assert_eq!(actuals.null_count(), frame.height());
    }

    #[test]
    fn split_draws_only_labeled_rows() {
        let trainer = fitted_trainer();
        let split = trainer.split();
        let all: Vec<usize> = split
            .train
            .iter()
            .chain(&split.validation)
            .chain(&split.holdout)
            .copied()
            .collect();
        // frame rows 2, 5 and 8 have no label and must stay out of the fit
        assert_eq!(all.len(), 7);
        assert!(all.iter().all(|idx| idx % 3 != 2));
    }

    #[test]
    fn ticker_shap_defaults_to_the_latest_row() {
        let trainer = fitted_trainer();
        // lowercase on purpose: tickers are uppercased on the way in
        let frame = trainer.ticker_shap("aapl", None).unwrap();
        let feature_count = trainer.feature_names.len();
        assert_eq!(frame.height(), feature_count);

        let newest = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()
            + chrono::Duration::days(19060);
        let dates = frame.column("date").unwrap().date().unwrap();
        assert!(dates.as_date_iter().all(|date| date == Some(newest)));

        // one row per feature, descending |shap|, stub weight on the first
        let shap = frame.column("shap_value").unwrap().f64().unwrap();
        assert!((shap.get(0).unwrap() - 0.01).abs() < 1e-12);
        for idx in 1..frame.height() {
            assert!(shap.get(idx - 1).unwrap().abs() >= shap.get(idx).unwrap().abs());
        }
    }

    #[test]
    fn ticker_shap_since_keeps_the_window() {
        let trainer = fitted_trainer();
        let since = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()
            + chrono::Duration::days(19030);
        let frame = trainer.ticker_shap("AAPL", Some(since)).unwrap();
        // the two AAPL rows on or after the window start
        assert_eq!(frame.height(), 2 * trainer.feature_names.len());
    }

    #[test]
    fn summary_serializes_after_fit() {
        let trainer = fitted_trainer();
        let summary = trainer.summary().unwrap();
        assert_eq!(summary.pred_col, "excess_return_ln_12m");
        assert_eq!(summary.best_iteration, 7);
        assert_eq!(summary.trained_date, "2024-06-30");
        let payload = serde_json::to_string(&summary).unwrap();
        assert!(payload.contains("\"predCol\""));
    }
}
