use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use std::env;
use std::path::PathBuf;

const DEFAULT_LOCAL_DB_PATH: &str = "data/stockcast.db";
pub const CUTOFF_CURRENT_DATE: &str = "current_date";

/// Deployment environment, parsed from APP_ENV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Dev,
    Test,
    Prod,
}

impl AppEnv {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(Self::Dev),
            "test" => Ok(Self::Test),
            "prod" => Ok(Self::Prod),
            other => Err(anyhow!(
                "APP_ENV must be dev, test or prod (value: {})",
                other
            )),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Test => "test",
            Self::Prod => "prod",
        }
    }

    /// Boosting iteration budget per environment.
    pub fn training_iterations(self) -> u32 {
        match self {
            Self::Dev => 200,
            Self::Test => 1,
            Self::Prod => 2000,
        }
    }
}

/// Where the DuckDB store lives for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    LocalFile(PathBuf),
    InMemory,
    MotherDuck { uri: String },
}

impl StorageTarget {
    pub fn describe(&self) -> String {
        match self {
            Self::LocalFile(path) => format!("local file {}", path.display()),
            Self::InMemory => "in-memory".to_string(),
            // Never echo the token
            Self::MotherDuck { .. } => "MotherDuck".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub env: AppEnv,
    pub storage: StorageTarget,
    pub tiingo_token: Option<String>,
    pub test_size: f64,
    pub val_size: f64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let env_value =
            env::var("APP_ENV").map_err(|_| anyhow!("APP_ENV must be set (dev, test or prod)"))?;
        let app_env = AppEnv::parse(&env_value)?;

        let development_local = env::var("DEVELOPMENT")
            .map(|value| value.trim().eq_ignore_ascii_case("local"))
            .unwrap_or(false);

        let storage = match app_env {
            AppEnv::Test => StorageTarget::InMemory,
            AppEnv::Dev => StorageTarget::LocalFile(local_db_path()),
            AppEnv::Prod if development_local => StorageTarget::LocalFile(local_db_path()),
            AppEnv::Prod => {
                let token = require_env("MOTHERDUCK_TOKEN")?;
                StorageTarget::MotherDuck {
                    uri: format!("md:{}?motherduck_token={}", app_env.label(), token),
                }
            }
        };

        let tiingo_token = env::var("TIINGO_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Ok(Self {
            env: app_env,
            storage,
            tiingo_token,
            test_size: 0.03,
            val_size: 0.05,
        })
    }

    pub fn training_iterations(&self) -> u32 {
        self.env.training_iterations()
    }

    pub fn require_tiingo_token(&self) -> Result<&str> {
        self.tiingo_token
            .as_deref()
            .ok_or_else(|| anyhow!("TIINGO_TOKEN must be set to fetch price data"))
    }
}

fn local_db_path() -> PathBuf {
    env::var("STOCKCAST_DB")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_DB_PATH))
}

fn require_env(key: &str) -> Result<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("Missing required environment variable {}", key))
}

/// Validates a pipeline cutoff-date setting. The only accepted forms are the
/// literal `current_date` (resolved to today) and `YYYY-MM-DD`; anything else
/// is rejected up front instead of being silently replaced by the run date.
pub fn resolve_cutoff_date(raw: &str) -> Result<NaiveDate> {
    let trimmed = raw.trim().trim_matches('\'');
    if trimmed.eq_ignore_ascii_case(CUTOFF_CURRENT_DATE) {
        return Ok(chrono::Utc::now().date_naive());
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").map_err(|_| {
        anyhow!(
            "cutoff_date must be 'current_date' or YYYY-MM-DD (value: {})",
            raw
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_app_env_case_insensitively() {
        assert_eq!(AppEnv::parse("Dev").unwrap(), AppEnv::Dev);
        assert_eq!(AppEnv::parse(" PROD ").unwrap(), AppEnv::Prod);
        assert!(AppEnv::parse("staging").is_err());
    }

    #[test]
    fn iteration_budget_per_env() {
        assert_eq!(AppEnv::Dev.training_iterations(), 200);
        assert_eq!(AppEnv::Test.training_iterations(), 1);
        assert_eq!(AppEnv::Prod.training_iterations(), 2000);
    }

    #[test]
    fn cutoff_accepts_keyword_and_iso_dates() {
        assert!(resolve_cutoff_date("current_date").is_ok());
        assert_eq!(
            resolve_cutoff_date("2024-11-08").unwrap(),
            NaiveDate::from_ymd_opt(2024, 11, 8).unwrap()
        );
        assert_eq!(
            resolve_cutoff_date("'2024-11-08'").unwrap(),
            NaiveDate::from_ymd_opt(2024, 11, 8).unwrap()
        );
    }

    #[test]
    fn cutoff_rejects_malformed_strings() {
        assert!(resolve_cutoff_date("2024-13-01").is_err());
        assert!(resolve_cutoff_date("last_tuesday").is_err());
        assert!(resolve_cutoff_date("2024/11/08").is_err());
    }
}
