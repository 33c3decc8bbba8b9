use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// Forward-looking windows the models predict excess return over. The
/// 6-month horizon exists for ad-hoc runs but is excluded from the
/// production graph because it is known to overfit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Horizon {
    M6,
    M12,
    M24,
    M36,
}

impl Horizon {
    pub const PRODUCTION: [Horizon; 3] = [Horizon::M12, Horizon::M24, Horizon::M36];

    /// Label column in fundamentals.excess_returns.
    pub fn pred_col(self) -> &'static str {
        match self {
            Self::M6 => "excess_return_ln_6m",
            Self::M12 => "excess_return_ln_12m",
            Self::M24 => "excess_return_ln_24m",
            Self::M36 => "excess_return_ln_36m",
        }
    }

    pub fn months(self) -> u32 {
        match self {
            Self::M6 => 6,
            Self::M12 => 12,
            Self::M24 => 24,
            Self::M36 => 36,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "6m" | "6" | "excess_return_ln_6m" => Some(Self::M6),
            "12m" | "12" | "excess_return_ln_12m" => Some(Self::M12),
            "24m" | "24" | "excess_return_ln_24m" => Some(Self::M24),
            "36m" | "36" | "excess_return_ln_36m" => Some(Self::M36),
            _ => None,
        }
    }

    pub fn from_pred_col(col: &str) -> Option<Self> {
        [Self::M6, Self::M12, Self::M24, Self::M36]
            .into_iter()
            .find(|horizon| horizon.pred_col() == col)
    }

    pub fn all_pred_cols() -> [&'static str; 4] {
        [
            Self::M6.pred_col(),
            Self::M12.pred_col(),
            Self::M24.pred_col(),
            Self::M36.pred_col(),
        ]
    }
}

impl std::fmt::Display for Horizon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}m", self.months())
    }
}

/// Outcome of a single model fit, recorded alongside the predictions.
#[derive(Debug, Clone)]
pub struct FitReport {
    pub best_iteration: u32,
    pub validation_loss: Option<f64>,
    pub holdout_rmse: f64,
    pub trained_at: DateTime<Utc>,
    pub seed: u64,
}

/// One prediction row as read back from main.predictions for display.
#[derive(Debug, Clone)]
pub struct ForecastRow {
    pub date: NaiveDate,
    pub ticker: String,
    pub feature: String,
    pub shap_value: f64,
    pub feature_value: String,
    pub bias: f64,
    pub predicted_value: f64,
    pub predicted_std: f64,
    pub actual_value: Option<f64>,
    pub pred_col: String,
    pub trained_date: NaiveDate,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingDatasetSummary {
    pub row_count: usize,
    pub feature_count: usize,
    pub categorical_count: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingSummary {
    pub pred_col: String,
    pub seed: u64,
    pub iterations: u32,
    pub best_iteration: u32,
    pub holdout_rmse: f64,
    pub trained_at: String,
    pub trained_date: String,
    pub train_dataset: TrainingDatasetSummary,
}
