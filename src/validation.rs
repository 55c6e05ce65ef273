//! Leakage-free validation.
//!
//! Both checks fit a brand-new model with the deployed model's hyperparameters and score
//! it only on rows it never saw:
//! - holdout: fit on the first 80% of rows, score on the last 20%
//! - walk-forward: expanding training windows, each followed by a purge gap of discarded
//!   rows and then a test window

use anyhow::{Context, Result};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::gbdt::{BoosterParams, Dataset, GradientBoostedModel, Objective};
use crate::metrics;
use crate::split::temporal_split;

// ─── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkForwardConfig {
    pub n_folds: usize,
    /// Rows in the first training window.
    pub min_train_size: usize,
    /// Rows discarded between the end of training and the start of testing.
    pub purge_gap: usize,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            n_folds: 5,
            min_train_size: 30,
            purge_gap: 5,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FoldError {
    #[error("walk-forward needs at least one fold")]
    NoFolds,
    #[error(
        "{total_rows} rows cannot fit min_train_size {min_train_size} \
         + purge_gap {purge_gap} + {n_folds} test fold(s)"
    )]
    InsufficientData {
        total_rows: usize,
        min_train_size: usize,
        purge_gap: usize,
        n_folds: usize,
    },
}

// ─── Fold layout ─────────────────────────────────────────────────────

/// Row ranges of one walk-forward fold. Ends are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldSpec {
    pub fold_index: usize,
    pub train_end: usize,
    pub test_start: usize,
    pub test_end: usize,
}

/// Expanding-window folds: training always starts at row 0, `purge_gap` rows separate
/// training from testing, and test windows tile the rows after the first training window.
/// The last fold absorbs any remainder.
pub fn create_folds(
    total_rows: usize,
    config: &WalkForwardConfig,
) -> Result<Vec<FoldSpec>, FoldError> {
    if config.n_folds == 0 {
        return Err(FoldError::NoFolds);
    }
    let insufficient = FoldError::InsufficientData {
        total_rows,
        min_train_size: config.min_train_size,
        purge_gap: config.purge_gap,
        n_folds: config.n_folds,
    };
    let available = total_rows
        .checked_sub(config.min_train_size.max(1) + config.purge_gap)
        .ok_or_else(|| insufficient.clone())?;
    let test_size = available / config.n_folds;
    if test_size == 0 {
        return Err(insufficient);
    }

    let first_test = config.min_train_size.max(1) + config.purge_gap;
    Ok((0..config.n_folds)
        .map(|fold_index| {
            let test_start = first_test + fold_index * test_size;
            let test_end = if fold_index + 1 == config.n_folds {
                total_rows
            } else {
                test_start + test_size
            };
            FoldSpec {
                fold_index,
                train_end: test_start - config.purge_gap,
                test_start,
                test_end,
            }
        })
        .collect())
}

// ─── Holdout ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct HoldoutMetrics {
    pub train_rows: usize,
    pub holdout_rows: usize,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

/// Holdout metrics plus the scores behind them, kept for threshold selection and
/// calibration.
#[derive(Debug, Clone)]
pub struct HoldoutEvaluation {
    pub metrics: HoldoutMetrics,
    pub labels: Vec<f64>,
    /// Positive-class probability, predicted class index, or regression value per row.
    pub predictions: Vec<f64>,
}

fn holdout_metric_values(
    objective: &Objective,
    model: &GradientBoostedModel,
    holdout: &Dataset<'_>,
    predictions: &[f64],
) -> BTreeMap<String, f64> {
    let labels = holdout.labels;
    let mut values = BTreeMap::new();
    match objective {
        Objective::Binary => {
            if let Some(auc) = metrics::roc_auc(labels, predictions) {
                values.insert("auc".to_string(), auc);
            }
            values.insert(
                "accuracy".to_string(),
                metrics::binary_accuracy(labels, predictions, 0.5),
            );
        }
        Objective::SquaredError => {
            values.insert("mae".to_string(), metrics::mae(labels, predictions));
            values.insert("rmse".to_string(), metrics::rmse(labels, predictions));
        }
        Objective::Multiclass { .. } => {
            let distributions: Vec<Vec<f64>> =
                holdout.features.iter().map(|row| model.predict(row)).collect();
            values.insert("accuracy".to_string(), metrics::accuracy(labels, predictions));
            values.insert("log_loss".to_string(), metrics::log_loss(labels, &distributions));
            values.insert("f1_macro".to_string(), metrics::f1_macro(labels, predictions));
        }
        Objective::Quantile { alpha } => {
            values.insert("mae".to_string(), metrics::mae(labels, predictions));
            values.insert(
                "pinball_loss".to_string(),
                metrics::pinball_loss(labels, predictions, *alpha),
            );
            values.insert("quantile".to_string(), *alpha);
        }
    }
    values
}

/// Fits a fresh model on the chronological head and scores the tail. `Ok(None)` when the
/// tail would hold fewer than five rows.
pub fn holdout_evaluation(
    data: &Dataset<'_>,
    objective: Objective,
    params: &BoosterParams,
    holdout_fraction: f64,
) -> Result<Option<HoldoutEvaluation>> {
    let split = match temporal_split(data.len(), holdout_fraction) {
        Some(split) => split,
        None => {
            debug!("Holdout skipped: {} rows leave too small a tail", data.len());
            return Ok(None);
        }
    };
    let train = data.slice(split.train());
    let holdout = data.slice(split.holdout());
    let model = GradientBoostedModel::fit(params, objective, &train, None, 0)
        .context("Failed to fit holdout validation model")?;
    let predictions = model.predict_values(holdout.features);
    let values = holdout_metric_values(&objective, &model, &holdout, &predictions);
    info!(
        "Holdout ({} train / {} test): {}",
        train.len(),
        holdout.len(),
        format_metrics(&values)
    );

    Ok(Some(HoldoutEvaluation {
        metrics: HoldoutMetrics {
            train_rows: train.len(),
            holdout_rows: holdout.len(),
            values,
        },
        labels: holdout.labels.to_vec(),
        predictions,
    }))
}

pub fn format_metrics(values: &BTreeMap<String, f64>) -> String {
    values
        .iter()
        .map(|(name, value)| format!("{name}={value:.4}"))
        .collect::<Vec<_>>()
        .join(", ")
}

// ─── Walk-forward ────────────────────────────────────────────────────

/// Headline per-fold metric: AUC, MAE, accuracy or pinball loss.
pub fn walk_forward_metric_name(objective: &Objective) -> &'static str {
    match objective {
        Objective::Binary => "auc",
        Objective::SquaredError => "mae",
        Objective::Multiclass { .. } => "accuracy",
        Objective::Quantile { .. } => "pinball_loss",
    }
}

fn walk_forward_metric(objective: &Objective, labels: &[f64], predicted: &[f64]) -> Option<f64> {
    match objective {
        Objective::Binary => metrics::roc_auc(labels, predicted),
        Objective::SquaredError => Some(metrics::mae(labels, predicted)),
        Objective::Multiclass { .. } => Some(metrics::accuracy(labels, predicted)),
        Objective::Quantile { alpha } => Some(metrics::pinball_loss(labels, predicted, *alpha)),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FoldResult {
    #[serde(flatten)]
    pub spec: FoldSpec,
    /// `None` when the fold model failed to fit or the metric is undefined for the
    /// window (e.g. one class only).
    pub metric: Option<f64>,
    /// Why the fold model could not be fit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalkForwardSummary {
    pub metric: &'static str,
    pub config: WalkForwardConfig,
    pub folds: Vec<FoldResult>,
    pub mean: Option<f64>,
    pub std: Option<f64>,
}

/// Runs every fold in parallel. Returns `None` when not even one fold fits.
pub fn walk_forward(
    data: &Dataset<'_>,
    objective: Objective,
    params: &BoosterParams,
    config: &WalkForwardConfig,
) -> Option<WalkForwardSummary> {
    let specs = match create_folds(data.len(), config) {
        Ok(specs) => specs,
        Err(err) => {
            debug!("Walk-forward skipped: {err}");
            return None;
        }
    };

    let folds: Vec<FoldResult> = specs
        .par_iter()
        .map(|spec| {
            let train = data.slice(0..spec.train_end);
            let test = data.slice(spec.test_start..spec.test_end);
            match GradientBoostedModel::fit(params, objective, &train, None, 0) {
                Ok(model) => {
                    let predicted = model.predict_values(test.features);
                    FoldResult {
                        spec: *spec,
                        metric: walk_forward_metric(&objective, test.labels, &predicted),
                        error: None,
                    }
                }
                Err(err) => FoldResult {
                    spec: *spec,
                    metric: None,
                    error: Some(err.to_string()),
                },
            }
        })
        .collect();

    for fold in &folds {
        if let Some(err) = &fold.error {
            warn!(
                "Walk-forward fold {} (train rows 0..{}) failed to fit: {err}",
                fold.spec.fold_index, fold.spec.train_end
            );
        }
    }

    let values: Vec<f64> = folds.iter().filter_map(|fold| fold.metric).collect();
    let mean = (!values.is_empty()).then(|| values.iter().mean());
    let std = if values.len() > 1 {
        Some(values.iter().std_dev()).filter(|v| v.is_finite())
    } else if values.len() == 1 {
        Some(0.0)
    } else {
        None
    };

    let metric = walk_forward_metric_name(&objective);
    info!(
        "Walk-forward {} over {} fold(s): mean {} std {}",
        metric,
        folds.len(),
        mean.map(|v| format!("{v:.4}")).unwrap_or_else(|| "n/a".to_string()),
        std.map(|v| format!("{v:.4}")).unwrap_or_else(|| "n/a".to_string()),
    );

    Some(WalkForwardSummary {
        metric,
        config: *config,
        folds,
        mean,
        std,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_respect_purge_gap_and_expand() {
        let folds = create_folds(100, &WalkForwardConfig::default()).unwrap();
        assert_eq!(folds.len(), 5);
        // (100 - 30 - 5) / 5 = 13 rows per test window
        let first = FoldSpec {
            fold_index: 0,
            train_end: 30,
            test_start: 35,
            test_end: 48,
        };
        assert_eq!(folds[0], first);
        assert_eq!(folds[1].train_end, 43);
        assert_eq!(folds[4].test_end, 100);
        for pair in folds.windows(2) {
            assert!(pair[1].train_end > pair[0].train_end);
            assert_eq!(pair[0].test_end, pair[1].test_start);
        }
        for fold in &folds {
            assert_eq!(fold.test_start - fold.train_end, 5);
        }
    }

    #[test]
    fn too_small_datasets_produce_no_folds() {
        let config = WalkForwardConfig::default();
        assert!(matches!(
            create_folds(39, &config),
            Err(FoldError::InsufficientData { total_rows: 39, .. })
        ));
        assert_eq!(create_folds(40, &config).unwrap().len(), 5);
        let no_folds = WalkForwardConfig {
            n_folds: 0,
            ..config
        };
        assert_eq!(create_folds(100, &no_folds), Err(FoldError::NoFolds));
    }

    #[test]
    fn holdout_uses_only_the_head_for_fitting() {
        // Tail labels are the inverse of the head pattern, so a model that saw the tail
        // could not score this badly.
        let rows: Vec<Vec<f64>> = (0..100).map(|i| vec![(i % 10) as f64]).collect();
        let labels: Vec<f64> = (0..100)
            .map(|i| {
                let positive = i % 10 >= 5;
                if i < 80 { positive as u8 as f64 } else { (!positive) as u8 as f64 }
            })
            .collect();
        let params = BoosterParams {
            n_estimators: 20,
            ..BoosterParams::default()
        };
        let evaluation = holdout_evaluation(
            &Dataset::new(&rows, &labels),
            Objective::Binary,
            &params,
            0.2,
        )
        .unwrap()
        .unwrap();
        assert_eq!(evaluation.metrics.train_rows, 80);
        assert_eq!(evaluation.metrics.holdout_rows, 20);
        assert!(evaluation.metrics.values["auc"] < 0.01);
        assert_eq!(evaluation.predictions.len(), 20);
    }

    #[test]
    fn holdout_is_skipped_for_tiny_sets() {
        let rows = vec![vec![1.0]; 10];
        let labels = vec![1.0; 10];
        let result = holdout_evaluation(
            &Dataset::new(&rows, &labels),
            Objective::SquaredError,
            &BoosterParams::default(),
            0.2,
        )
        .unwrap();
        assert!(result.is_none());
    }

    fn walk_forward_config() -> WalkForwardConfig {
        WalkForwardConfig {
            n_folds: 5,
            min_train_size: 60,
            purge_gap: 5,
        }
    }

    #[test]
    fn walk_forward_aggregates_fold_metrics() {
        let rows: Vec<Vec<f64>> = (0..300).map(|i| vec![(i % 2) as f64]).collect();
        let labels: Vec<f64> = rows.iter().map(|r| r[0] * 2.0).collect();
        let params = BoosterParams {
            n_estimators: 30,
            ..BoosterParams::default()
        };
        let summary = walk_forward(
            &Dataset::new(&rows, &labels),
            Objective::SquaredError,
            &params,
            &walk_forward_config(),
        )
        .unwrap();
        assert_eq!(summary.metric, "mae");
        assert_eq!(summary.folds.len(), 5);
        assert!(summary.folds.iter().all(|f| f.metric.is_some() && f.error.is_none()));
        assert!(summary.mean.unwrap() < 0.5);
        assert!(summary.std.is_some());
    }

    #[test]
    fn failed_folds_keep_their_error() {
        // The first training window holds only negatives, so its model cannot be fit.
        let rows: Vec<Vec<f64>> = (0..300).map(|i| vec![(i % 2) as f64]).collect();
        let labels: Vec<f64> = (0..300)
            .map(|i| if i < 60 { 0.0 } else { (i % 2) as f64 })
            .collect();
        let params = BoosterParams {
            n_estimators: 20,
            ..BoosterParams::default()
        };
        let summary = walk_forward(
            &Dataset::new(&rows, &labels),
            Objective::Binary,
            &params,
            &walk_forward_config(),
        )
        .unwrap();
        let first = &summary.folds[0];
        assert!(first.metric.is_none());
        assert!(first.error.as_deref().unwrap().contains("single class"));
        for fold in &summary.folds[1..] {
            assert!(fold.error.is_none(), "fold {}: {:?}", fold.spec.fold_index, fold.error);
            assert!(fold.metric.is_some());
        }
        assert!(summary.mean.is_some());

        let json = serde_json::to_value(&summary).unwrap();
        assert!(json["folds"][0]["error"].is_string());
        assert!(json["folds"][1].get("error").is_none());
    }
}
