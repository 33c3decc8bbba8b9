use crate::config::AppConfig;
use crate::database::Database;
use crate::fetch::PriceClient;
use anyhow::Result;
use log::info;
use std::path::{Path, PathBuf};

/// Shared handle passed into every command. The store connection is opened
/// per call so each asset invocation gets its own scoped connection.
pub struct AppContext {
    config: AppConfig,
}

impl AppContext {
    pub fn initialize() -> Result<Self> {
        let config = AppConfig::from_env()?;
        info!(
            "Running in {} mode against {}",
            config.env.label(),
            config.storage.describe(),
        );
        Ok(Self { config })
    }

    pub fn from_config(config: AppConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn database(&self) -> Result<Database> {
        Database::open(&self.config.storage)
    }

    pub fn price_client(&self) -> Result<PriceClient> {
        let token = self.config.require_tiingo_token()?;
        Ok(PriceClient::new(reqwest::Client::new(), token))
    }

    pub fn sql_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("sql")
    }
}
