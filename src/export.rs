use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use crate::gbdt::text_format::{self, TextModel, INPUT_TENSOR};
use crate::gbdt::{booster, GradientBoostedModel, Objective};
use crate::models::{TaskKind, Target};

pub const MODEL_EXTENSION: &str = "model";
pub const BACKUP_EXTENSION: &str = "bin";
pub const MODEL_FORMAT: &str = "lightgbm_text";
const PARITY_TOLERANCE: f64 = 1e-3;
const PROBABILITY_SLACK: f64 = 0.01;

pub fn model_path(dir: &Path, target: Target) -> PathBuf {
    dir.join(format!("{}.{MODEL_EXTENSION}", target.name()))
}

pub fn manifest_path(dir: &Path, target: Target) -> PathBuf {
    dir.join(format!("{}_features.json", target.name()))
}

pub fn backup_path(dir: &Path, target: Target) -> PathBuf {
    dir.join(format!("{}.{BACKUP_EXTENSION}", target.name()))
}

/// Ordered feature names and tensor bindings for serving code.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureManifest {
    pub target: Target,
    pub task: TaskKind,
    pub model_file: String,
    pub format: &'static str,
    pub feature_names: Vec<String>,
    pub input_dim: usize,
    pub input_tensor: &'static str,
    pub output_tensor: &'static str,
    pub content_hash: String,
    /// Original TP tier of each encoded class, in class-index order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub class_labels: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportOutcome {
    pub target: Target,
    pub backup_path: PathBuf,
    pub model_path: Option<PathBuf>,
    pub manifest_path: Option<PathBuf>,
    pub content_hash: Option<String>,
}

impl ExportOutcome {
    pub fn exported(&self) -> bool {
        self.model_path.is_some()
    }
}

pub fn write_backup(model: &GradientBoostedModel, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create model backup {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, model)
        .with_context(|| format!("Failed to serialize model backup {}", path.display()))?;
    Ok(())
}

pub fn read_backup(path: &Path) -> Result<GradientBoostedModel> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open model backup {}", path.display()))?;
    bincode::deserialize_from(BufReader::new(file))
        .with_context(|| format!("Failed to decode model backup {}", path.display()))
}

/// blake3 hex digest of the file contents.
pub fn content_hash(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// In-memory prediction in the layout LightGBM returns: the positive-class probability
/// for binary models, class probabilities for multiclass, the value for regressors.
fn reference_output(model: &GradientBoostedModel, sample: &[f64]) -> Vec<f64> {
    match model.objective {
        Objective::Binary => vec![model.predict_value(sample)],
        _ => model.predict(sample),
    }
}

/// One forward pass through the written artifact, loaded by LightGBM itself. Output must
/// be non-empty, finite and match the in-memory model; classifier outputs outside
/// [-0.01, 1.01] are only noted.
pub fn verify_artifact(
    path: &Path,
    model: &GradientBoostedModel,
    sample: &[f64],
) -> Result<Vec<f64>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read exported model {}", path.display()))?;
    let portable = TextModel::from_model_text(&text)
        .with_context(|| format!("Failed to parse exported model {}", path.display()))?;
    if portable.input_tensor.as_deref() != Some(INPUT_TENSOR) {
        return Err(anyhow!("Exported model does not name its input tensor"));
    }
    if sample.len() != portable.num_features() {
        return Err(anyhow!(
            "Sample row has {} features, exported model expects {}",
            sample.len(),
            portable.num_features()
        ));
    }
    let output = booster::predict_saved_model(path, sample)
        .with_context(|| format!("LightGBM could not score {}", path.display()))?;

    if output.is_empty() {
        return Err(anyhow!("Exported model output was empty"));
    }
    if output.iter().any(|v| !v.is_finite()) {
        return Err(anyhow!("Exported model output contains non-finite values: {output:?}"));
    }
    if model.objective.is_classifier()
        && output
            .iter()
            .any(|v| *v < -PROBABILITY_SLACK || *v > 1.0 + PROBABILITY_SLACK)
    {
        debug!("Exported classifier output outside [0, 1], treating as raw scores: {output:?}");
    }

    let expected = reference_output(model, sample);
    if expected.len() != output.len() {
        return Err(anyhow!(
            "Exported model returned {} value(s), in-memory model {}",
            output.len(),
            expected.len()
        ));
    }
    for (actual, reference) in output.iter().zip(&expected) {
        let tolerance = PARITY_TOLERANCE * reference.abs().max(1.0);
        if (actual - reference).abs() > tolerance {
            return Err(anyhow!(
                "Exported model prediction {actual} differs from in-memory {reference}"
            ));
        }
    }
    Ok(output)
}

fn write_portable(
    dir: &Path,
    target: Target,
    model: &GradientBoostedModel,
    feature_names: &[String],
    class_labels: &[i64],
    sample: &[f64],
) -> Result<(PathBuf, PathBuf, String)> {
    let path = model_path(dir, target);
    let output_tensor = text_format::output_tensor_name(&model.objective);
    fs::write(&path, text_format::with_tensor_names(&model.model_text, output_tensor))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    let output = verify_artifact(&path, model, sample)?;
    debug!("{target}: verification output {output:?}");

    let hash = content_hash(&path)?;
    let manifest = FeatureManifest {
        target,
        task: target.task(),
        model_file: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        format: MODEL_FORMAT,
        feature_names: feature_names.to_vec(),
        input_dim: feature_names.len(),
        input_tensor: INPUT_TENSOR,
        output_tensor,
        content_hash: hash.clone(),
        class_labels: class_labels.to_vec(),
    };
    let manifest_file = manifest_path(dir, target);
    let json = serde_json::to_string_pretty(&manifest)?;
    fs::write(&manifest_file, json)
        .with_context(|| format!("Failed to write {}", manifest_file.display()))?;
    Ok((path, manifest_file, hash))
}

/// Writes the backup, then (when enabled) the portable artifact and its manifest. Portable
/// export failures are logged and leave only the backup; only a failed backup is an error.
pub fn export_model(
    dir: &Path,
    target: Target,
    model: &GradientBoostedModel,
    feature_names: &[String],
    class_labels: &[i64],
    sample: &[f64],
    portable_enabled: bool,
) -> Result<ExportOutcome> {
    let backup = backup_path(dir, target);
    write_backup(model, &backup)?;

    let mut outcome = ExportOutcome {
        target,
        backup_path: backup,
        model_path: None,
        manifest_path: None,
        content_hash: None,
    };
    if !portable_enabled {
        debug!("{target}: portable export disabled, kept serialized backup only");
        return Ok(outcome);
    }

    match write_portable(dir, target, model, feature_names, class_labels, sample) {
        Ok((path, manifest, hash)) => {
            info!("{target}: exported {} ({})", path.display(), &hash[..12.min(hash.len())]);
            outcome.model_path = Some(path);
            outcome.manifest_path = Some(manifest);
            outcome.content_hash = Some(hash);
        }
        Err(err) => {
            warn!("{target}: portable export failed, keeping serialized backup only: {err:#}");
            for stale in [model_path(dir, target), manifest_path(dir, target)] {
                if stale.exists() {
                    let _ = fs::remove_file(&stale);
                }
            }
        }
    }
    Ok(outcome)
}
