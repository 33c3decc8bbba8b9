use crate::config::StorageTarget;
use crate::models::ForecastRow;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate};
use duckdb::types::ValueRef;
use duckdb::{params, Connection};
use log::info;
use polars::prelude::*;
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// One DuckDB connection, opened per asset invocation and closed when the
/// value is dropped at the end of that invocation.
pub struct Database {
    conn: Connection,
}

/// Column buffer used while materializing a query result into a DataFrame.
enum ColumnBuffer {
    Unknown(usize),
    Float(Vec<Option<f64>>),
    Str(Vec<Option<String>>),
    Date(Vec<Option<i32>>),
}

impl Database {
    pub fn open(target: &StorageTarget) -> Result<Self> {
        let conn = match target {
            StorageTarget::InMemory => {
                Connection::open_in_memory().context("failed to open in-memory DuckDB")?
            }
            StorageTarget::LocalFile(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)
                            .with_context(|| format!("Failed to create {}", parent.display()))?;
                    }
                }
                Connection::open(path)
                    .with_context(|| format!("failed to open DuckDB at {}", path.display()))?
            }
            StorageTarget::MotherDuck { uri } => {
                Connection::open(uri).context("failed to connect to MotherDuck")?
            }
        };
        Ok(Self { conn })
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn
            .execute_batch(sql)
            .map_err(|err| anyhow!("SQL batch failed: {}", err))
    }

    /// Runs a multi-statement SQL script from disk.
    pub fn execute_script_file(&self, path: &Path) -> Result<()> {
        let sql = fs::read_to_string(path)
            .with_context(|| format!("Failed to read SQL script {}", path.display()))?;
        self.execute_batch(&sql)
            .with_context(|| format!("SQL script {} failed", path.display()))
    }

    /// Runs a single-statement SQL script that takes the cutoff date as a
    /// bound `?` parameter. The date is never spliced into the SQL text.
    pub fn execute_script_file_with_cutoff(&self, path: &Path, cutoff: NaiveDate) -> Result<()> {
        let sql = fs::read_to_string(path)
            .with_context(|| format!("Failed to read SQL script {}", path.display()))?;
        if !sql.contains('?') {
            return Err(anyhow!(
                "SQL script {} has no cutoff-date placeholder",
                path.display()
            ));
        }
        self.conn
            .execute(&sql, params![cutoff])
            .with_context(|| format!("SQL script {} failed", path.display()))?;
        Ok(())
    }

    pub fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "select count(*) from information_schema.tables where table_schema = ? and table_name = ?",
            params![schema, table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Loads a CSV body into a table via a uuid-named temp file and DuckDB's
    /// CSV reader. `append=false` (or a missing table) replaces the table.
    pub fn load_csv(&self, csv: &[u8], schema: &str, table: &str, append: bool) -> Result<usize> {
        if csv.is_empty() {
            return Ok(0);
        }
        let tmp_path = std::env::temp_dir().join(format!("stockcast_load_{}.csv", Uuid::new_v4()));
        fs::write(&tmp_path, csv)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;

        let file = tmp_path.to_string_lossy().replace('\'', "''");
        let sql = if append && self.table_exists(schema, table)? {
            format!(
                "insert into {}.{} select * from read_csv_auto('{}')",
                schema, table, file
            )
        } else {
            format!(
                "create or replace table {}.{} as select * from read_csv_auto('{}')",
                schema, table, file
            )
        };
        let result = self.conn.execute(&sql, []);
        let _ = fs::remove_file(&tmp_path);
        let rows = result.with_context(|| format!("failed to load CSV into {}.{}", schema, table))?;
        Ok(rows)
    }

    /// Materializes an arbitrary query into a polars DataFrame. Numeric
    /// columns are widened to Float64, text stays String, DATE stays Date;
    /// that keeps the "categorical = non-float dtype" rule downstream intact.
    pub fn query_frame(&self, sql: &str) -> Result<DataFrame> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query([])?;

        let mut names: Vec<String> = Vec::new();
        let mut buffers: Vec<ColumnBuffer> = Vec::new();
        let mut height = 0usize;

        while let Some(row) = rows.next()? {
            if names.is_empty() {
                let stmt = row.as_ref();
                names = stmt
                    .column_names()
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                buffers = names.iter().map(|_| ColumnBuffer::Unknown(0)).collect();
            }
            for (idx, buffer) in buffers.iter_mut().enumerate() {
                push_value(buffer, row.get_ref(idx)?, &names[idx])?;
            }
            height += 1;
        }

        if names.is_empty() {
            return Ok(DataFrame::empty());
        }

        let mut columns = Vec::with_capacity(names.len());
        for (name, buffer) in names.into_iter().zip(buffers) {
            columns.push(finish_column(&name, buffer, height)?);
        }
        DataFrame::new(columns).map_err(|err| anyhow!("failed to assemble DataFrame: {}", err))
    }

    pub fn excess_returns_frame(&self) -> Result<DataFrame> {
        self.query_frame("select * from fundamentals.excess_returns")
    }

    /// Upserts a predictions frame through a staging table; the final insert
    /// replaces on the (date, ticker, feature, pred_col, trained_date) key.
    pub fn insert_predictions(&self, df: &DataFrame) -> Result<usize> {
        self.execute_batch(
            "create or replace table main.stage_predictions (
                date DATE,
                ticker VARCHAR,
                feature VARCHAR,
                shap_value DOUBLE,
                feature_value VARCHAR,
                bias DOUBLE,
                predicted_value_log DOUBLE,
                actual_value_log DOUBLE,
                predicted_value DOUBLE,
                predicted_std DOUBLE,
                actual_value DOUBLE,
                pred_col VARCHAR,
                trained_at TIMESTAMP,
                trained_date DATE
            )",
        )?;

        let height = df.height();
        let dates = date_iter(df, "date")?;
        let trained_dates = date_iter(df, "trained_date")?;
        let tickers = str_vec(df, "ticker")?;
        let features = str_vec(df, "feature")?;
        let feature_values = str_vec(df, "feature_value")?;
        let pred_cols = str_vec(df, "pred_col")?;
        let shap_values = f64_vec(df, "shap_value")?;
        let biases = f64_vec(df, "bias")?;
        let predicted_log = f64_vec(df, "predicted_value_log")?;
        let actual_log = f64_vec(df, "actual_value_log")?;
        let predicted = f64_vec(df, "predicted_value")?;
        let predicted_std = f64_vec(df, "predicted_std")?;
        let actual = f64_vec(df, "actual_value")?;
        let trained_at = df
            .column("trained_at")?
            .datetime()
            .map_err(|err| anyhow!("trained_at must be a datetime column: {}", err))?
            .into_iter()
            .map(|micros| {
                micros.and_then(DateTime::from_timestamp_micros).map(|dt| dt.naive_utc())
            })
            .collect::<Vec<_>>();

        {
            let mut appender = self.conn.appender("stage_predictions")?;
            for idx in 0..height {
                appender.append_row(params![
                    dates[idx],
                    tickers[idx],
                    features[idx],
                    shap_values[idx],
                    feature_values[idx],
                    biases[idx],
                    predicted_log[idx],
                    actual_log[idx],
                    predicted[idx],
                    predicted_std[idx],
                    actual[idx],
                    pred_cols[idx],
                    trained_at[idx],
                    trained_dates[idx],
                ])?;
            }
            appender.flush()?;
        }

        let inserted = self.conn.execute(
            "insert or replace into main.predictions select * from main.stage_predictions",
            [],
        )?;
        self.execute_batch("drop table main.stage_predictions")?;
        info!("Upserted {} prediction rows into main.predictions", inserted);
        Ok(inserted)
    }

    pub fn trained_dates(&self) -> Result<Vec<NaiveDate>> {
        let mut stmt = self.conn.prepare(
            "select distinct trained_date from main.predictions order by trained_date desc",
        )?;
        let dates = stmt
            .query_map([], |row| row.get::<_, NaiveDate>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(dates)
    }

    pub fn prediction_tickers(&self, trained_date: NaiveDate) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "select distinct ticker from main.predictions
             where trained_date = ? order by ticker",
        )?;
        let tickers = stmt
            .query_map(params![trained_date], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tickers)
    }

    pub fn forecast_rows(
        &self,
        tickers: &[String],
        trained_date: NaiveDate,
    ) -> Result<Vec<ForecastRow>> {
        if tickers.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; tickers.len()].join(", ");
        let sql = format!(
            "select date, ticker, feature, shap_value, feature_value, bias,
                    predicted_value, predicted_std, actual_value, pred_col, trained_date
             from main.predictions
             where trained_date = ? and ticker in ({})
             order by pred_col, ticker, date, abs(shap_value) desc",
            placeholders
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut bound: Vec<String> = vec![trained_date.format("%Y-%m-%d").to_string()];
        bound.extend(tickers.iter().cloned());
        let rows = stmt
            .query_map(duckdb::params_from_iter(bound), |row| {
                Ok(ForecastRow {
                    date: row.get(0)?,
                    ticker: row.get(1)?,
                    feature: row.get(2)?,
                    shap_value: row.get(3)?,
                    feature_value: row.get(4)?,
                    bias: row.get(5)?,
                    predicted_value: row.get(6)?,
                    predicted_std: row.get(7)?,
                    actual_value: row.get(8)?,
                    pred_col: row.get(9)?,
                    trained_date: row.get(10)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_rows(&self, schema: &str, table: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            &format!("select count(*) from {}.{}", schema, table),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn push_value(buffer: &mut ColumnBuffer, value: ValueRef<'_>, column: &str) -> Result<()> {
    // Delay the dtype decision until the first non-null value shows up.
    if let ColumnBuffer::Unknown(nulls) = buffer {
        let nulls = *nulls;
        match value {
            ValueRef::Null => {
                *buffer = ColumnBuffer::Unknown(nulls + 1);
                return Ok(());
            }
            ValueRef::Text(_) => *buffer = ColumnBuffer::Str(vec![None; nulls]),
            ValueRef::Date32(_) => *buffer = ColumnBuffer::Date(vec![None; nulls]),
            _ => *buffer = ColumnBuffer::Float(vec![None; nulls]),
        }
    }

    match buffer {
        ColumnBuffer::Unknown(_) => unreachable!(),
        ColumnBuffer::Float(values) => values.push(value_as_f64(value, column)?),
        ColumnBuffer::Str(values) => values.push(value_as_string(value)),
        ColumnBuffer::Date(values) => match value {
            ValueRef::Null => values.push(None),
            ValueRef::Date32(days) => values.push(Some(days)),
            other => {
                return Err(anyhow!(
                    "column {} mixes DATE and {:?} values",
                    column,
                    other.data_type()
                ))
            }
        },
    }
    Ok(())
}

fn value_as_f64(value: ValueRef<'_>, column: &str) -> Result<Option<f64>> {
    let parsed = match value {
        ValueRef::Null => None,
        ValueRef::Boolean(v) => Some(if v { 1.0 } else { 0.0 }),
        ValueRef::TinyInt(v) => Some(v as f64),
        ValueRef::SmallInt(v) => Some(v as f64),
        ValueRef::Int(v) => Some(v as f64),
        ValueRef::BigInt(v) => Some(v as f64),
        ValueRef::HugeInt(v) => Some(v as f64),
        ValueRef::UTinyInt(v) => Some(v as f64),
        ValueRef::USmallInt(v) => Some(v as f64),
        ValueRef::UInt(v) => Some(v as f64),
        ValueRef::UBigInt(v) => Some(v as f64),
        ValueRef::Float(v) => Some(v as f64),
        ValueRef::Double(v) => Some(v),
        // rust_decimal has no lossless f64 path; round-trip through Display
        ValueRef::Decimal(v) => Some(
            v.to_string()
                .parse::<f64>()
                .map_err(|_| anyhow!("column {} has an unrepresentable decimal", column))?,
        ),
        other => {
            return Err(anyhow!(
                "column {} has unsupported numeric type {:?}",
                column,
                other.data_type()
            ))
        }
    };
    Ok(parsed)
}

fn value_as_string(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        other => Some(format!("{:?}", other)),
    }
}

fn finish_column(name: &str, buffer: ColumnBuffer, height: usize) -> Result<Column> {
    let series = match buffer {
        // All-null columns default to Float64 nulls.
        ColumnBuffer::Unknown(_) => {
            Series::new(name.into(), vec![None::<f64>; height])
        }
        ColumnBuffer::Float(values) => Series::new(name.into(), values),
        ColumnBuffer::Str(values) => Series::new(name.into(), values),
        ColumnBuffer::Date(values) => Series::new(name.into(), values)
            .cast(&DataType::Date)
            .map_err(|err| anyhow!("failed to build date column {}: {}", name, err))?,
    };
    Ok(series.into_column())
}

fn date_iter(df: &DataFrame, column: &str) -> Result<Vec<Option<NaiveDate>>> {
    Ok(df
        .column(column)?
        .date()
        .map_err(|err| anyhow!("{} must be a date column: {}", column, err))?
        .as_date_iter()
        .collect())
}

fn str_vec(df: &DataFrame, column: &str) -> Result<Vec<Option<String>>> {
    Ok(df
        .column(column)?
        .str()
        .map_err(|err| anyhow!("{} must be a string column: {}", column, err))?
        .into_iter()
        .map(|value| value.map(ToString::to_string))
        .collect())
}

fn f64_vec(df: &DataFrame, column: &str) -> Result<Vec<Option<f64>>> {
    Ok(df
        .column(column)?
        .f64()
        .map_err(|err| anyhow!("{} must be a float column: {}", column, err))?
        .into_iter()
        .collect())
}
