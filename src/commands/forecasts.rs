use crate::app_url::{SelectedPair, SelectionState};
use crate::context::AppContext;
use crate::models::ForecastRow;
use anyhow::Result;
use chrono::NaiveDate;
use log::warn;
use std::collections::BTreeMap;

/// Prints persisted forecasts and SHAP attributions for a selection of
/// tickers, defaulting to the latest training run.
pub async fn run(
    app: &AppContext,
    tickers: &[String],
    trained_date: Option<NaiveDate>,
) -> Result<()> {
    let db = app.database()?;
    let trained_date = match trained_date {
        Some(date) => date,
        None => match db.trained_dates()?.into_iter().next() {
            Some(date) => date,
            None => {
                warn!("No predictions have been stored yet");
                return Ok(());
            }
        },
    };

    let selection: Vec<String> = if tickers.is_empty() {
        db.prediction_tickers(trained_date)?
    } else {
        tickers.iter().map(|t| t.trim().to_uppercase()).collect()
    };
    let rows = db.forecast_rows(&selection, trained_date)?;
    if rows.is_empty() {
        warn!("No predictions for the selected tickers");
        return Ok(());
    }

    // One group per (pred_col, ticker); rows arrive sorted by |shap| within.
    let mut groups: BTreeMap<(String, String), Vec<&ForecastRow>> = BTreeMap::new();
    for row in &rows {
        groups
            .entry((row.pred_col.clone(), row.ticker.clone()))
            .or_default()
            .push(row);
    }

    println!("Forecasts trained on {}", trained_date);
    for ((pred_col, ticker), group) in &groups {
        let head = group[0];
        let actual = head
            .actual_value
            .map(|value| format!("{:.4}", value))
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "\n{} {} on {}: predicted={:.4} (std {:.4}), actual={}",
            ticker, pred_col, head.date, head.predicted_value, head.predicted_std, actual
        );
        println!("  {:<28} {:>12} {:>14}", "feature", "shap", "value");
        for row in group {
            println!(
                "  {:<28} {:>12.6} {:>14}",
                truncate(&row.feature, 28),
                row.shap_value,
                truncate(&row.feature_value, 14)
            );
        }
    }

    let state = SelectionState {
        date_from: None,
        date_to: None,
        tickers: selection,
        trained_date: Some(trained_date),
        selected_pairs: groups
            .keys()
            .map(|(pred_col, ticker)| SelectedPair {
                ticker: ticker.clone(),
                pred_col: pred_col.clone(),
            })
            .collect(),
    };
    println!("\nShareable selection: ?{}", state.to_query());
    Ok(())
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let cut: String = text.chars().take(width.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
