use anyhow::{anyhow, Result};
use futures::stream::{self, StreamExt};
use log::{error, info};
use reqwest::Client;

const DEFAULT_BASE_URL: &str = "https://api.tiingo.com/tiingo/daily";
const DEFAULT_RESPONSE_FORMAT: &str = "csv";
// Matches the upstream API rate budget; two scheduled runs per hour stay
// under the 10k requests/hour cap even for the full universe.
const MAX_CONCURRENT_REQUESTS: usize = 20;

/// Client for the Tiingo end-of-day price API. Failures are terminal per
/// call: transport and HTTP-status errors are logged and surfaced as `None`,
/// never propagated.
pub struct PriceClient {
    http: Client,
    base_url: String,
    response_format: String,
    token: String,
}

/// Result of a multi-ticker backfill: concatenated CSV plus the tickers the
/// API answered with an empty body for.
pub struct BackfillBatch {
    pub csv: Vec<u8>,
    pub empty_tickers: Vec<String>,
}

impl PriceClient {
    pub fn new(http: Client, token: &str) -> Self {
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            response_format: DEFAULT_RESPONSE_FORMAT.to_string(),
            token: token.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Query parameter order is part of the contract: startDate, format,
    /// columns, then token.
    pub fn compose_url(&self, ticker: &str, start_date: &str, columns: &[&str]) -> String {
        format!(
            "{}/{}/prices?startDate={}&format={}&columns={}&token={}",
            self.base_url,
            ticker,
            start_date,
            self.response_format,
            columns.join(","),
            self.token
        )
    }

    pub async fn fetch(&self, url: &str) -> Option<String> {
        match self.http.get(url).send().await {
            Ok(response) => {
                if !response.status().is_success() {
                    error!("HTTP status error for {}: {}", url, response.status());
                    return None;
                }
                match response.text().await {
                    Ok(body) => Some(body),
                    Err(err) => {
                        error!("An error occurred while requesting {}: {}", url, err);
                        None
                    }
                }
            }
            Err(err) => {
                error!("An error occurred while requesting {}: {}", url, err);
                None
            }
        }
    }

    pub async fn fetch_prices(
        &self,
        ticker: &str,
        start_date: &str,
        columns: &[&str],
    ) -> Option<String> {
        let url = self.compose_url(ticker, start_date, columns);
        self.fetch(&url).await
    }

    /// Fetches price history for many tickers with a bounded fan-out and
    /// concatenates the CSV bodies, tagging every row with its ticker.
    pub async fn fetch_history(
        &self,
        tickers: &[String],
        start_date: &str,
        columns: &[&str],
    ) -> Result<BackfillBatch> {
        let upper: Vec<String> = tickers.iter().map(|t| t.trim().to_uppercase()).collect();

        let bodies: Vec<(String, Option<String>)> = stream::iter(upper)
            .map(|ticker| async move {
                let body = self.fetch_prices(&ticker, start_date, columns).await;
                (ticker, body)
            })
            .buffer_unordered(MAX_CONCURRENT_REQUESTS)
            .collect()
            .await;

        let mut empty_tickers = Vec::new();
        let mut csvs = Vec::new();
        for (ticker, body) in bodies {
            match body {
                Some(body) if !body.trim().is_empty() && body.trim() != "None" => {
                    csvs.push(add_ticker_column(&body, &ticker)?);
                }
                _ => empty_tickers.push(ticker),
            }
        }

        if !empty_tickers.is_empty() {
            info!("Total number of empty responses: {}", empty_tickers.len());
        }

        Ok(BackfillBatch {
            csv: concat_csvs(&csvs)?,
            empty_tickers,
        })
    }
}

/// Appends a trailing `ticker` column to a CSV body with a header row.
pub fn add_ticker_column(body: &str, ticker: &str) -> Result<String> {
    let mut lines = body.lines();
    let header = lines
        .next()
        .ok_or_else(|| anyhow!("empty CSV body for ticker {}", ticker))?;

    let mut out = String::with_capacity(body.len() + body.lines().count() * (ticker.len() + 1));
    out.push_str(header);
    out.push_str(",ticker\n");
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        out.push_str(line);
        out.push(',');
        out.push_str(ticker);
        out.push('\n');
    }
    Ok(out)
}

/// Joins per-ticker CSVs into one body, keeping only the first header.
pub fn concat_csvs(csvs: &[String]) -> Result<Vec<u8>> {
    let mut out = String::new();
    for (idx, csv) in csvs.iter().enumerate() {
        let mut lines = csv.lines();
        let header = lines
            .next()
            .ok_or_else(|| anyhow!("empty CSV at position {}", idx))?;
        if idx == 0 {
            out.push_str(header);
            out.push('\n');
        }
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            out.push_str(line);
            out.push('\n');
        }
    }
    Ok(out.into_bytes())
}
