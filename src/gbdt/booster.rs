//! LightGBM training through `lightgbm3`.
//!
//! Rows are handed to LightGBM as a LibSVM file with every column written out, so the
//! saved model always declares the full feature width. Sample weights go into the
//! sibling `.weight` file, which LightGBM picks up on its own. The trained booster is
//! saved in LightGBM's text format and returned as a string.

use lightgbm3::{Booster, Dataset as LightGbmDataset};
use serde_json::{json, Value};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{BoosterParams, Dataset, ModelError, Objective};

const MAX_NUM_LEAVES: usize = 131_072;

/// Scratch files for one training call, removed on drop.
struct ScratchFiles {
    dataset: PathBuf,
    weights: PathBuf,
    model: PathBuf,
}

impl ScratchFiles {
    fn new() -> Self {
        let id = Uuid::new_v4();
        let dataset = std::env::temp_dir().join(format!("trainer_lightgbm_{id}.svm"));
        let model = std::env::temp_dir().join(format!("trainer_lightgbm_{id}.model"));
        Self {
            weights: weight_path(&dataset),
            dataset,
            model,
        }
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.dataset);
        let _ = fs::remove_file(&self.weights);
        let _ = fs::remove_file(&self.model);
    }
}

fn weight_path(dataset_path: &Path) -> PathBuf {
    let mut os: OsString = dataset_path.as_os_str().to_os_string();
    os.push(".weight");
    PathBuf::from(os)
}

fn path_str(path: &Path) -> Result<&str, ModelError> {
    path.to_str()
        .ok_or_else(|| ModelError::Backend(format!("non UTF-8 path {}", path.display())))
}

fn backend(err: impl std::fmt::Display) -> ModelError {
    ModelError::Backend(err.to_string())
}

fn write_libsvm_dataset(train: &Dataset<'_>, path: &Path) -> Result<(), ModelError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for (row, label) in train.features.iter().zip(train.labels) {
        let mut line = format!("{label}");
        for (idx, value) in row.iter().enumerate() {
            line.push_str(&format!(" {idx}:{value}"));
        }
        line.push('\n');
        writer.write_all(line.as_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

fn write_dataset_weights(weights: &[f64], path: &Path) -> Result<(), ModelError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for weight in weights {
        writer.write_all(format!("{weight}\n").as_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Leaves a depth-limited tree can reach.
pub(super) fn num_leaves(max_depth: usize) -> usize {
    1usize
        .checked_shl(max_depth.min(17) as u32)
        .unwrap_or(MAX_NUM_LEAVES)
        .clamp(2, MAX_NUM_LEAVES)
}

/// LightGBM parameters for one training call. `scale_pos_weight` is only read by the
/// binary objective.
pub(super) fn lightgbm_params(
    params: &BoosterParams,
    objective: &Objective,
    scale_pos_weight: f64,
) -> Value {
    let bagging_freq = if params.subsample < 1.0 { 1 } else { 0 };
    let mut value = json!({
        "num_iterations": params.n_estimators,
        "learning_rate": params.learning_rate,
        "max_depth": params.max_depth,
        "num_leaves": num_leaves(params.max_depth),
        "min_sum_hessian_in_leaf": params.min_child_weight,
        "lambda_l2": params.reg_lambda,
        "min_gain_to_split": params.min_split_gain,
        "feature_fraction": params.colsample_bytree,
        "bagging_fraction": params.subsample,
        "bagging_freq": bagging_freq,
        "seed": params.seed,
        "deterministic": true,
        "force_row_wise": true,
        "num_threads": 1,
        "verbosity": -1,
    });
    match objective {
        Objective::Binary => {
            value["objective"] = json!("binary");
            value["scale_pos_weight"] = json!(scale_pos_weight);
        }
        Objective::SquaredError => {
            value["objective"] = json!("regression");
        }
        Objective::Multiclass { num_class } => {
            value["objective"] = json!("multiclass");
            value["num_class"] = json!(num_class);
        }
        Objective::Quantile { alpha } => {
            value["objective"] = json!("quantile");
            value["alpha"] = json!(alpha);
        }
    }
    value
}

/// Trains a booster on `train` and returns the saved LightGBM model text.
pub(super) fn train_model_text(
    params: &BoosterParams,
    objective: &Objective,
    scale_pos_weight: f64,
    train: &Dataset<'_>,
) -> Result<String, ModelError> {
    let files = ScratchFiles::new();
    write_libsvm_dataset(train, &files.dataset)?;
    if let Some(weights) = train.weights {
        write_dataset_weights(weights, &files.weights)?;
    }

    let dataset = LightGbmDataset::from_file(path_str(&files.dataset)?).map_err(backend)?;
    let booster = Booster::train(dataset, &lightgbm_params(params, objective, scale_pos_weight))
        .map_err(backend)?;
    booster.save_file(path_str(&files.model)?).map_err(backend)?;
    Ok(fs::read_to_string(&files.model)?)
}

/// Scores `features` with the model saved at `path`, as LightGBM itself loads it.
/// Binary models return the positive-class probability, multiclass models one
/// probability per class and regressors the prediction.
pub fn predict_saved_model(path: &Path, features: &[f64]) -> Result<Vec<f64>, ModelError> {
    let booster = Booster::from_file(path_str(path)?).map_err(backend)?;
    let output = booster
        .predict_with_params(features, features.len() as i32, true, "num_threads=1")
        .map_err(backend)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_follow_depth() {
        assert_eq!(num_leaves(1), 2);
        assert_eq!(num_leaves(4), 16);
        assert_eq!(num_leaves(64), MAX_NUM_LEAVES);
    }

    #[test]
    fn params_name_the_objective() {
        let params = BoosterParams {
            subsample: 0.8,
            ..BoosterParams::default()
        };
        let binary = lightgbm_params(&params, &Objective::Binary, 3.0);
        assert_eq!(binary["objective"], "binary");
        assert_eq!(binary["scale_pos_weight"], 3.0);
        assert_eq!(binary["bagging_freq"], 1);
        assert_eq!(binary["num_leaves"], 16);

        let quantile = lightgbm_params(
            &BoosterParams::default(),
            &Objective::Quantile { alpha: 0.9 },
            1.0,
        );
        assert_eq!(quantile["objective"], "quantile");
        assert_eq!(quantile["alpha"], 0.9);
        assert_eq!(quantile["bagging_freq"], 0);
        assert!(quantile.get("scale_pos_weight").is_none());

        let multiclass = lightgbm_params(
            &BoosterParams::default(),
            &Objective::Multiclass { num_class: 3 },
            1.0,
        );
        assert_eq!(multiclass["num_class"], 3);
    }

    #[test]
    fn weights_sit_next_to_the_dataset() {
        let path = Path::new("/tmp/rows.svm");
        assert_eq!(weight_path(path), PathBuf::from("/tmp/rows.svm.weight"));
    }
}
