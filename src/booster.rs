use anyhow::{anyhow, Context, Result};
use log::info;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use uuid::Uuid;

/// One feature cell. Numeric features may be missing; categorical features
/// are always written as text.
#[derive(Clone, Debug)]
pub enum FeatureValue {
    Num(Option<f64>),
    Cat(String),
}

/// Tabular dataset handed to the booster. Rows are parallel to `labels`;
/// `categorical` is parallel to `feature_names`.
#[derive(Clone, Debug, Default)]
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub categorical: Vec<bool>,
    pub labels: Vec<f64>,
    pub rows: Vec<Vec<FeatureValue>>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BoosterParams {
    pub iterations: u32,
    pub learning_rate: f64,
    pub depth: u32,
    pub l2_leaf_reg: f64,
    pub model_size_reg: f64,
    pub subsample: f64,
    pub min_data_in_leaf: u32,
    pub early_stopping_rounds: u32,
    pub seed: u64,
}

/// (mean, variance) pair in label space.
#[derive(Clone, Copy, Debug)]
pub struct Prediction {
    pub mean: f64,
    pub variance: f64,
}

/// Per-row SHAP attributions; `values[i]` is parallel to the dataset's
/// feature names and `bias[i]` is the row's expected-value offset.
#[derive(Clone, Debug)]
pub struct ShapMatrix {
    pub values: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

pub trait FittedModel {
    fn best_iteration(&self) -> Option<u32>;
    fn validation_loss(&self) -> Option<f64>;
    fn predict(&self, data: &Dataset) -> Result<Vec<Prediction>>;
    fn shap(&self, data: &Dataset) -> Result<ShapMatrix>;
}

/// Gradient-boosting seam. Production uses the CatBoost CLI; tests plug in
/// a deterministic stand-in.
pub trait Booster {
    fn fit(
        &self,
        train: &Dataset,
        validation: &Dataset,
        params: &BoosterParams,
    ) -> Result<Box<dyn FittedModel>>;
}

/// Drives the CatBoost command-line tool through temp files: `fit` to train,
/// `calc` for predictions, `fstr` for SHAP values.
pub struct CatBoostCli;

impl Booster for CatBoostCli {
    fn fit(
        &self,
        train: &Dataset,
        validation: &Dataset,
        params: &BoosterParams,
    ) -> Result<Box<dyn FittedModel>> {
        let exe_path = resolve_catboost_executable()?;
        info!("Using CatBoost executable at {}", exe_path.display());

        let run_id = Uuid::new_v4();
        let train_path = std::env::temp_dir().join(format!("catboost_train_{}.tsv", run_id));
        let valid_path = std::env::temp_dir().join(format!("catboost_valid_{}.tsv", run_id));
        let cd_path = std::env::temp_dir().join(format!("catboost_cd_{}.txt", run_id));
        let model_path = std::env::temp_dir().join(format!("catboost_model_{}.cbm", run_id));
        let train_dir = std::env::temp_dir().join(format!("catboost_run_{}", run_id));

        write_tsv_dataset(train, &train_path)?;
        write_tsv_dataset(validation, &valid_path)?;
        write_column_description(train, &cd_path)?;
        fs::create_dir_all(&train_dir)
            .with_context(|| format!("Failed to create {}", train_dir.display()))?;

        info!(
            "Launching CatBoost fit: iterations={}, learning_rate={}, depth={}, l2_leaf_reg={}, model_size_reg={}, subsample={}, min_data_in_leaf={}, early_stopping_rounds={}, seed={}",
            params.iterations,
            params.learning_rate,
            params.depth,
            params.l2_leaf_reg,
            params.model_size_reg,
            params.subsample,
            params.min_data_in_leaf,
            params.early_stopping_rounds,
            params.seed,
        );

        let status = Command::new(&exe_path)
            .arg("fit")
            .args(["--loss-function", "RMSEWithUncertainty"])
            .arg("--learn-set")
            .arg(&train_path)
            .arg("--test-set")
            .arg(&valid_path)
            .arg("--column-description")
            .arg(&cd_path)
            .args(["--iterations", &params.iterations.to_string()])
            .args(["--learning-rate", &params.learning_rate.to_string()])
            .args(["--depth", &params.depth.to_string()])
            .args(["--l2-leaf-reg", &params.l2_leaf_reg.to_string()])
            .args(["--model-size-reg", &params.model_size_reg.to_string()])
            .args(["--bootstrap-type", "Bernoulli"])
            .args(["--subsample", &params.subsample.to_string()])
            .args(["--min-data-in-leaf", &params.min_data_in_leaf.to_string()])
            .args(["--grow-policy", "Depthwise"])
            .args(["--od-type", "Iter"])
            .args(["--od-wait", &params.early_stopping_rounds.to_string()])
            .args(["--random-seed", &params.seed.to_string()])
            .arg("--use-best-model")
            .args(["--delimiter", "\t"])
            .arg("--train-dir")
            .arg(&train_dir)
            .arg("-m")
            .arg(&model_path)
            .args(["--logging-level", "Silent"])
            .status()
            .context("Failed to spawn catboost for training")?;

        let parsed_errors = if status.success() {
            // CatBoost writes one metric row per iteration to test_error.tsv.
            fs::read_to_string(train_dir.join("test_error.tsv"))
                .ok()
                .and_then(|contents| parse_best_iteration(&contents))
        } else {
            None
        };

        let _ = fs::remove_file(&train_path);
        let _ = fs::remove_file(&valid_path);
        let _ = fs::remove_file(&cd_path);
        let _ = fs::remove_dir_all(&train_dir);

        if !status.success() {
            let _ = fs::remove_file(&model_path);
            return Err(anyhow!("catboost fit failed with status {status}"));
        }

        let (best_iteration, validation_loss) = match parsed_errors {
            Some((iteration, loss)) => (Some(iteration), Some(loss)),
            None => (None, None),
        };

        info!("CatBoost training complete, model at {}", model_path.display());
        Ok(Box::new(CatBoostModel {
            exe_path,
            model_path,
            feature_names: train.feature_names.clone(),
            best_iteration,
            validation_loss,
        }))
    }
}

struct CatBoostModel {
    exe_path: PathBuf,
    model_path: PathBuf,
    feature_names: Vec<String>,
    best_iteration: Option<u32>,
    validation_loss: Option<f64>,
}

impl FittedModel for CatBoostModel {
    fn best_iteration(&self) -> Option<u32> {
        self.best_iteration
    }

    fn validation_loss(&self) -> Option<f64> {
        self.validation_loss
    }

    fn predict(&self, data: &Dataset) -> Result<Vec<Prediction>> {
        let run_id = Uuid::new_v4();
        let input_path = std::env::temp_dir().join(format!("catboost_calc_{}.tsv", run_id));
        let cd_path = std::env::temp_dir().join(format!("catboost_calc_cd_{}.txt", run_id));
        let output_path = std::env::temp_dir().join(format!("catboost_calc_out_{}.tsv", run_id));

        write_tsv_dataset(data, &input_path)?;
        write_column_description(data, &cd_path)?;

        let status = Command::new(&self.exe_path)
            .arg("calc")
            .arg("-m")
            .arg(&self.model_path)
            .arg("--input-path")
            .arg(&input_path)
            .arg("--cd")
            .arg(&cd_path)
            .arg("--output-path")
            .arg(&output_path)
            .args(["--prediction-type", "RawFormulaVal"])
            .args(["--delimiter", "\t"])
            .status()
            .context("Failed to spawn catboost for prediction")?;

        let raw = if status.success() {
            fs::read_to_string(&output_path)
                .with_context(|| format!("could not read {}", output_path.display()))
        } else {
            Err(anyhow!("catboost calc failed with status {status}"))
        };

        let _ = fs::remove_file(&input_path);
        let _ = fs::remove_file(&cd_path);
        let _ = fs::remove_file(&output_path);

        let predictions = parse_calc_output(&raw?)?;
        if predictions.len() != data.len() {
            return Err(anyhow!(
                "catboost calc returned {} rows for {} input rows",
                predictions.len(),
                data.len()
            ));
        }
        Ok(predictions)
    }

    fn shap(&self, data: &Dataset) -> Result<ShapMatrix> {
        let run_id = Uuid::new_v4();
        let input_path = std::env::temp_dir().join(format!("catboost_fstr_{}.tsv", run_id));
        let cd_path = std::env::temp_dir().join(format!("catboost_fstr_cd_{}.txt", run_id));
        let output_path = std::env::temp_dir().join(format!("catboost_fstr_out_{}.tsv", run_id));

        write_tsv_dataset(data, &input_path)?;
        write_column_description(data, &cd_path)?;

        let status = Command::new(&self.exe_path)
            .arg("fstr")
            .arg("-m")
            .arg(&self.model_path)
            .arg("--input-path")
            .arg(&input_path)
            .arg("--cd")
            .arg(&cd_path)
            .args(["--fstr-type", "ShapValues"])
            .arg("-o")
            .arg(&output_path)
            .args(["--delimiter", "\t"])
            .status()
            .context("Failed to spawn catboost for SHAP values")?;

        let raw = if status.success() {
            fs::read_to_string(&output_path)
                .with_context(|| format!("could not read {}", output_path.display()))
        } else {
            Err(anyhow!("catboost fstr failed with status {status}"))
        };

        let _ = fs::remove_file(&input_path);
        let _ = fs::remove_file(&cd_path);
        let _ = fs::remove_file(&output_path);

        let matrix = parse_shap_output(&raw?, self.feature_names.len())?;
        if matrix.values.len() != data.len() {
            return Err(anyhow!(
                "catboost fstr returned {} rows for {} input rows",
                matrix.values.len(),
                data.len()
            ));
        }
        Ok(matrix)
    }
}

impl Drop for CatBoostModel {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.model_path);
    }
}

/// TSV layout: label first, then features in dataset order, no header.
fn write_tsv_dataset(data: &Dataset, path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
    );
    for (row_idx, row) in data.rows.iter().enumerate() {
        let label = data.labels.get(row_idx).copied().unwrap_or(0.0);
        let mut line = if label.is_finite() {
            format!("{:.10}", label)
        } else {
            String::from("0")
        };
        for value in row {
            line.push('\t');
            match value {
                FeatureValue::Num(Some(v)) if v.is_finite() => {
                    line.push_str(&format!("{:.10}", v));
                }
                FeatureValue::Num(_) => line.push_str("nan"),
                FeatureValue::Cat(text) => {
                    line.push_str(&sanitize_cell(text));
                }
            }
        }
        line.push('\n');
        writer.write_all(line.as_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Column-description file: column 0 is the label; categorical features are
/// flagged at their TSV index so CatBoost treats them as Categ.
fn write_column_description(data: &Dataset, path: &Path) -> Result<()> {
    let mut contents = String::from("0\tLabel\n");
    for (idx, is_categorical) in data.categorical.iter().enumerate() {
        if *is_categorical {
            contents.push_str(&format!("{}\tCateg\n", idx + 1));
        }
    }
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}

fn sanitize_cell(text: &str) -> String {
    text.replace(['\t', '\n', '\r'], " ")
}

fn resolve_catboost_executable() -> Result<PathBuf> {
    let vendor_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(if cfg!(windows) {
        "vendor/catboost.exe"
    } else {
        "vendor/catboost"
    });
    if vendor_path.exists() {
        return Ok(vendor_path);
    }

    if let Some(path) = find_in_path(if cfg!(windows) { "catboost.exe" } else { "catboost" }) {
        return Ok(path);
    }

    Err(anyhow!(
        "catboost executable not found in vendor/ or PATH; install the CatBoost CLI to train models"
    ))
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path_value = std::env::var_os("PATH")?;
    for entry in std::env::split_paths(&path_value) {
        let candidate = entry.join(binary);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

/// Picks the iteration with the lowest test metric from CatBoost's
/// test_error.tsv (tab-separated, header row, iteration in column 0).
fn parse_best_iteration(contents: &str) -> Option<(u32, f64)> {
    let mut best: Option<(u32, f64)> = None;
    for line in contents.lines().skip(1) {
        let mut fields = line.split('\t');
        let iteration = fields.next()?.trim().parse::<u32>().ok()?;
        let metric = fields.next()?.trim().parse::<f64>().ok()?;
        if !metric.is_finite() {
            continue;
        }
        best = match best {
            Some((_, current)) if current <= metric => best,
            _ => Some((iteration, metric)),
        };
    }
    best
}

/// calc output: header row, then `SampleId\tmean\tln(variance)` per row.
/// The second raw dimension is log-variance; exponentiation recovers the
/// variance in label space.
fn parse_calc_output(contents: &str) -> Result<Vec<Prediction>> {
    let mut predictions = Vec::new();
    for line in contents.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 3 {
            return Err(anyhow!("malformed catboost calc row: {line}"));
        }
        let mean = fields[1]
            .trim()
            .parse::<f64>()
            .with_context(|| format!("bad prediction mean in: {line}"))?;
        let log_variance = fields[2]
            .trim()
            .parse::<f64>()
            .with_context(|| format!("bad prediction variance in: {line}"))?;
        predictions.push(Prediction {
            mean,
            variance: log_variance.exp(),
        });
    }
    Ok(predictions)
}

/// fstr ShapValues output: one row per document, feature attributions in
/// dataset order, bias last. Multi-dimensional losses emit one block per
/// output dimension; the mean block comes first.
fn parse_shap_output(contents: &str, feature_count: usize) -> Result<ShapMatrix> {
    let block = feature_count + 1;
    let mut values = Vec::new();
    let mut bias = Vec::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<f64> = line
            .split('\t')
            .map(|field| field.trim().parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .with_context(|| format!("malformed catboost fstr row: {line}"))?;
        if fields.len() < block {
            return Err(anyhow!(
                "catboost fstr row has {} values, expected at least {}",
                fields.len(),
                block
            ));
        }
        values.push(fields[..feature_count].to_vec());
        bias.push(fields[feature_count]);
    }
    Ok(ShapMatrix { values, bias })
}
