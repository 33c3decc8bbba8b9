use chrono::NaiveDate;
use url::form_urlencoded;

const DATE_FROM_KEY: &str = "date_from";
const DATE_TO_KEY: &str = "date_to";
const TICKERS_KEY: &str = "tickers";
const TRAINED_DATE_KEY: &str = "trained_date";
const SELECTED_PAIRS_KEY: &str = "selected_pairs";

/// One (ticker, horizon label column) pair pinned on the dashboard,
/// serialized as `TICKER:HORIZON_COLUMN`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectedPair {
    pub ticker: String,
    pub pred_col: String,
}

/// Dashboard selection carried through the URL query string so views can be
/// shared as links. Serializing and re-parsing reconstructs an equivalent
/// selection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectionState {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub tickers: Vec<String>,
    pub trained_date: Option<NaiveDate>,
    pub selected_pairs: Vec<SelectedPair>,
}

impl SelectionState {
    pub fn to_query(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        if let Some(date) = self.date_from {
            serializer.append_pair(DATE_FROM_KEY, &date.to_string());
        }
        if let Some(date) = self.date_to {
            serializer.append_pair(DATE_TO_KEY, &date.to_string());
        }
        if !self.tickers.is_empty() {
            serializer.append_pair(TICKERS_KEY, &self.tickers.join(","));
        }
        if let Some(date) = self.trained_date {
            serializer.append_pair(TRAINED_DATE_KEY, &date.to_string());
        }
        if !self.selected_pairs.is_empty() {
            let joined = self
                .selected_pairs
                .iter()
                .map(|pair| format!("{}:{}", pair.ticker, pair.pred_col))
                .collect::<Vec<_>>()
                .join(",");
            serializer.append_pair(SELECTED_PAIRS_KEY, &joined);
        }
        serializer.finish()
    }

    /// Parses a query string; unknown keys and malformed values are ignored
    /// so stale links still resolve to a usable selection.
    pub fn from_query(query: &str) -> Self {
        let mut state = SelectionState::default();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                DATE_FROM_KEY => state.date_from = parse_date(&value),
                DATE_TO_KEY => state.date_to = parse_date(&value),
                TICKERS_KEY => state.tickers = split_list(&value),
                TRAINED_DATE_KEY => state.trained_date = parse_date(&value),
                SELECTED_PAIRS_KEY => {
                    state.selected_pairs = split_list(&value)
                        .iter()
                        .filter_map(|entry| {
                            let (ticker, pred_col) = entry.split_once(':')?;
                            if ticker.is_empty() || pred_col.is_empty() {
                                return None;
                            }
                            Some(SelectedPair {
                                ticker: ticker.to_string(),
                                pred_col: pred_col.to_string(),
                            })
                        })
                        .collect();
                }
                _ => {}
            }
        }
        state
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToString::to_string)
        .collect()
}
