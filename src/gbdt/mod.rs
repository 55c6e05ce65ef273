//! Gradient-boosted decision trees, trained by LightGBM.
//!
//! [`booster`] hands each training set to LightGBM through `lightgbm3` and gets the saved
//! model text back. The text is kept verbatim for export and parsed with [`text_format`]
//! into trees, which the rest of the crate scores and attributes in-process.

pub mod booster;
pub mod text_format;
pub mod tree;

use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

use self::text_format::TextModel;
use self::tree::Tree;

pub const EPSILON: f64 = 1e-12;
const PROBABILITY_FLOOR: f64 = 1e-15;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("training set has a single class ({class})")]
    SingleClass { class: f64 },
    #[error("row {row} has {found} features, expected {expected}")]
    ShapeMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("{what} has {found} entries but there are {rows} rows")]
    LengthMismatch {
        what: &'static str,
        rows: usize,
        found: usize,
    },
    #[error("label {value} at row {row} is invalid: {reason}")]
    InvalidLabel {
        row: usize,
        value: f64,
        reason: &'static str,
    },
    #[error("invalid booster parameter: {0}")]
    InvalidParameter(String),
    #[error("model text invalid: {0}")]
    Parse(String),
    #[error("LightGBM: {0}")]
    Backend(String),
    #[error("scratch file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Loss being minimized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Objective {
    Binary,
    SquaredError,
    Multiclass { num_class: usize },
    Quantile { alpha: f64 },
}

impl Objective {
    pub fn num_outputs(&self) -> usize {
        match self {
            Objective::Multiclass { num_class } => (*num_class).max(1),
            _ => 1,
        }
    }

    pub fn is_classifier(&self) -> bool {
        matches!(self, Objective::Binary | Objective::Multiclass { .. })
    }

    fn validate(&self) -> Result<(), ModelError> {
        match *self {
            Objective::Multiclass { num_class } if num_class < 2 => {
                Err(ModelError::InvalidParameter(format!(
                    "multiclass objective needs at least 2 classes (value: {num_class})"
                )))
            }
            Objective::Quantile { alpha } if !(alpha > 0.0 && alpha < 1.0) => {
                Err(ModelError::InvalidParameter(format!(
                    "quantile alpha must be in (0, 1) (value: {alpha})"
                )))
            }
            _ => Ok(()),
        }
    }

    fn validate_labels(&self, labels: &[f64]) -> Result<(), ModelError> {
        for (row, &value) in labels.iter().enumerate() {
            if !value.is_finite() {
                return Err(ModelError::InvalidLabel {
                    row,
                    value,
                    reason: "not finite",
                });
            }
            match self {
                Objective::Binary if value != 0.0 && value != 1.0 => {
                    return Err(ModelError::InvalidLabel {
                        row,
                        value,
                        reason: "binary labels must be 0 or 1",
                    });
                }
                Objective::Multiclass { num_class }
                    if value.fract() != 0.0 || value < 0.0 || value >= *num_class as f64 =>
                {
                    return Err(ModelError::InvalidLabel {
                        row,
                        value,
                        reason: "class index out of range",
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Classifiers need at least two classes among the rows they are trained on.
    fn check_classes(&self, labels: &[f64]) -> Result<(), ModelError> {
        if !self.is_classifier() {
            return Ok(());
        }
        match labels.split_first() {
            Some((&first, rest)) if rest.iter().all(|&label| label == first) => {
                Err(ModelError::SingleClass { class: first })
            }
            _ => Ok(()),
        }
    }

    /// Raw margins to the model output: class probabilities for classifiers, the
    /// prediction itself otherwise.
    pub fn transform(&self, raw: &[f64]) -> Vec<f64> {
        match self {
            Objective::Binary => {
                let p = sigmoid(raw.first().copied().unwrap_or_default());
                vec![1.0 - p, p]
            }
            Objective::Multiclass { .. } => softmax(raw),
            _ => vec![raw.first().copied().unwrap_or_default()],
        }
    }

    /// Mean loss of raw `scores` against `labels`; lower is better.
    fn loss(&self, labels: &[f64], scores: &[Vec<f64>], weights: Option<&[f64]>) -> f64 {
        let mut total = 0.0;
        let mut total_weight = 0.0;
        for (row, &label) in labels.iter().enumerate() {
            let weight = weights.and_then(|w| w.get(row)).copied().unwrap_or(1.0);
            let raw = &scores[row];
            let loss = match self {
                Objective::Binary => {
                    let p = sigmoid(raw[0]).clamp(PROBABILITY_FLOOR, 1.0 - PROBABILITY_FLOOR);
                    -(label * p.ln() + (1.0 - label) * (1.0 - p).ln())
                }
                Objective::SquaredError => (raw[0] - label).powi(2),
                Objective::Quantile { alpha } => pinball(label, raw[0], *alpha),
                Objective::Multiclass { .. } => {
                    let probs = softmax(raw);
                    let p = probs
                        .get(label as usize)
                        .copied()
                        .unwrap_or_default()
                        .max(PROBABILITY_FLOOR);
                    -p.ln()
                }
            };
            total += loss * weight;
            total_weight += weight;
        }
        total / total_weight.max(EPSILON)
    }
}

/// Negative-to-positive ratio of binary `labels`, 1.0 when there are no positives.
pub fn scale_pos_weight(labels: &[f64]) -> f64 {
    let positives = labels.iter().filter(|&&label| label > 0.5).count();
    let negatives = labels.len() - positives;
    if positives == 0 {
        1.0
    } else {
        negatives as f64 / positives as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoosterParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub subsample: f64,
    pub colsample_bytree: f64,
    pub min_child_weight: f64,
    pub reg_lambda: f64,
    pub min_split_gain: f64,
    pub seed: u64,
}

impl Default for BoosterParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 4,
            learning_rate: 0.1,
            subsample: 1.0,
            colsample_bytree: 1.0,
            min_child_weight: 1.0,
            reg_lambda: 1.0,
            min_split_gain: 0.0,
            seed: 42,
        }
    }
}

impl BoosterParams {
    pub fn validate(&self) -> Result<(), ModelError> {
        let fraction_ok = |v: f64| v > 0.0 && v <= 1.0;
        if self.n_estimators == 0 {
            return Err(ModelError::InvalidParameter(
                "n_estimators must be >= 1".to_string(),
            ));
        }
        if self.max_depth == 0 {
            return Err(ModelError::InvalidParameter(
                "max_depth must be >= 1".to_string(),
            ));
        }
        if !fraction_ok(self.learning_rate) {
            return Err(ModelError::InvalidParameter(format!(
                "learning_rate must be in (0, 1] (value: {})",
                self.learning_rate
            )));
        }
        if !fraction_ok(self.subsample) || !fraction_ok(self.colsample_bytree) {
            return Err(ModelError::InvalidParameter(format!(
                "subsample and colsample_bytree must be in (0, 1] (values: {}, {})",
                self.subsample, self.colsample_bytree
            )));
        }
        if self.min_child_weight < 0.0 || self.reg_lambda < 0.0 || self.min_split_gain < 0.0 {
            return Err(ModelError::InvalidParameter(
                "min_child_weight, reg_lambda and min_split_gain must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Borrowed view of a feature matrix with aligned labels and optional weights.
#[derive(Debug, Clone, Copy)]
pub struct Dataset<'a> {
    pub features: &'a [Vec<f64>],
    pub labels: &'a [f64],
    pub weights: Option<&'a [f64]>,
}

impl<'a> Dataset<'a> {
    pub fn new(features: &'a [Vec<f64>], labels: &'a [f64]) -> Self {
        Self {
            features,
            labels,
            weights: None,
        }
    }

    pub fn with_weights(mut self, weights: Option<&'a [f64]>) -> Self {
        self.weights = weights;
        self
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Contiguous row range; `range` must lie within the dataset.
    pub fn slice(&self, range: Range<usize>) -> Dataset<'a> {
        Dataset {
            features: &self.features[range.clone()],
            labels: &self.labels[range.clone()],
            weights: self.weights.map(|w| &w[range]),
        }
    }

    fn check(&self, expected_features: Option<usize>) -> Result<usize, ModelError> {
        let rows = self.features.len();
        if self.labels.len() != rows {
            return Err(ModelError::LengthMismatch {
                what: "labels",
                rows,
                found: self.labels.len(),
            });
        }
        if let Some(weights) = self.weights {
            if weights.len() != rows {
                return Err(ModelError::LengthMismatch {
                    what: "weights",
                    rows,
                    found: weights.len(),
                });
            }
        }
        let expected = expected_features
            .or_else(|| self.features.first().map(Vec::len))
            .unwrap_or_default();
        for (row, values) in self.features.iter().enumerate() {
            if values.len() != expected {
                return Err(ModelError::ShapeMismatch {
                    row,
                    expected,
                    found: values.len(),
                });
            }
        }
        Ok(expected)
    }
}

/// Trained ensemble: LightGBM's model text plus the trees parsed from it. The raw
/// margin is a plain sum of tree outputs; the first iteration carries the base score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoostedModel {
    pub objective: Objective,
    pub params: BoosterParams,
    pub n_features: usize,
    pub model_text: String,
    pub trees: Vec<Tree>,
    pub best_iteration: Option<usize>,
    pub eval_history: Vec<f64>,
}

impl GradientBoostedModel {
    /// Fits a model. With an `eval` set and `early_stopping_rounds > 0`, the eval loss
    /// is tracked per boosting round and the ensemble is cut back to the best round once
    /// that many rounds pass without improvement. Binary training weights positives by
    /// the negative-to-positive ratio of `train` alone.
    pub fn fit(
        params: &BoosterParams,
        objective: Objective,
        train: &Dataset<'_>,
        eval: Option<&Dataset<'_>>,
        early_stopping_rounds: usize,
    ) -> Result<Self, ModelError> {
        params.validate()?;
        objective.validate()?;
        if train.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        let n_features = train.check(None)?;
        if n_features == 0 {
            return Err(ModelError::InvalidParameter(
                "training set has no feature columns".to_string(),
            ));
        }
        objective.validate_labels(train.labels)?;
        objective.check_classes(train.labels)?;
        let eval = eval.filter(|e| !e.is_empty() && early_stopping_rounds > 0);
        if let Some(eval) = eval {
            eval.check(Some(n_features))?;
            objective.validate_labels(eval.labels)?;
        }

        let pos_weight = scale_pos_weight(train.labels);
        let text = booster::train_model_text(params, &objective, pos_weight, train)?;
        let mut model = Self::from_model_text(objective, *params, n_features, text)?;

        if let Some(eval) = eval {
            let (history, best) = model.staged_eval_losses(eval, early_stopping_rounds);
            if best + 1 < model.n_iterations() {
                let keep = (best + 1) * model.num_outputs();
                let text = text_format::truncate_trees(&model.model_text, keep);
                model = Self::from_model_text(objective, *params, n_features, text)?;
            }
            model.best_iteration = Some(best);
            model.eval_history = history;
        }
        Ok(model)
    }

    fn from_model_text(
        objective: Objective,
        params: BoosterParams,
        n_features: usize,
        model_text: String,
    ) -> Result<Self, ModelError> {
        let parsed = TextModel::from_model_text(&model_text)?;
        if parsed.num_tree_per_iteration() != objective.num_outputs() {
            return Err(ModelError::Parse(format!(
                "{} trees per iteration, expected {}",
                parsed.num_tree_per_iteration(),
                objective.num_outputs()
            )));
        }
        if parsed.num_features() > n_features {
            return Err(ModelError::Parse(format!(
                "model reads {} features, training set has {n_features}",
                parsed.num_features()
            )));
        }
        Ok(Self {
            objective,
            params,
            n_features,
            model_text,
            trees: parsed.into_trees(),
            best_iteration: None,
            eval_history: Vec::new(),
        })
    }

    /// Eval loss after each boosting round, stopping `patience` rounds past the best one.
    fn staged_eval_losses(&self, eval: &Dataset<'_>, patience: usize) -> (Vec<f64>, usize) {
        let outputs = self.num_outputs();
        let mut scores = vec![vec![0.0; outputs]; eval.len()];
        let mut history = Vec::new();
        let mut best = (0usize, f64::INFINITY);
        for (iteration, round) in self.trees.chunks(outputs).enumerate() {
            for (row, values) in eval.features.iter().enumerate() {
                for (output, tree) in round.iter().enumerate() {
                    scores[row][output] += tree.predict(values);
                }
            }
            let loss = self.objective.loss(eval.labels, &scores, eval.weights);
            history.push(loss);
            if loss < best.1 {
                best = (iteration, loss);
            }
            if iteration - best.0 >= patience {
                break;
            }
        }
        (history, best.0)
    }

    /// Boosting rounds kept in the ensemble.
    pub fn n_iterations(&self) -> usize {
        self.trees.len() / self.objective.num_outputs()
    }

    pub fn num_outputs(&self) -> usize {
        self.objective.num_outputs()
    }

    pub fn predict_raw(&self, features: &[f64]) -> Vec<f64> {
        let outputs = self.objective.num_outputs();
        let mut raw = vec![0.0; outputs];
        for (idx, tree) in self.trees.iter().enumerate() {
            raw[idx % outputs] += tree.predict(features);
        }
        raw
    }

    /// Class probabilities for classifiers, a single prediction otherwise.
    pub fn predict(&self, features: &[f64]) -> Vec<f64> {
        self.objective.transform(&self.predict_raw(features))
    }

    /// Positive-class probability, predicted class index, or regression value.
    pub fn predict_value(&self, features: &[f64]) -> f64 {
        let output = self.predict(features);
        match self.objective {
            Objective::Binary => output.get(1).copied().unwrap_or_default(),
            Objective::Multiclass { .. } => argmax(&output) as f64,
            _ => output.first().copied().unwrap_or_default(),
        }
    }

    pub fn predict_values(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        rows.iter().map(|row| self.predict_value(row)).collect()
    }

    /// Trees that belong to `output` (every tree for single-output objectives).
    pub fn trees_for_output(&self, output: usize) -> impl Iterator<Item = &Tree> {
        let outputs = self.objective.num_outputs();
        self.trees
            .iter()
            .enumerate()
            .filter(move |(idx, _)| idx % outputs == output)
            .map(|(_, tree)| tree)
    }
}

pub fn sigmoid(value: f64) -> f64 {
    1.0 / (1.0 + (-value).exp())
}

pub fn softmax(raw: &[f64]) -> Vec<f64> {
    let max_score = raw
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, |acc, value| acc.max(value));
    let exp_scores: Vec<f64> = raw.iter().map(|score| (score - max_score).exp()).collect();
    let denom = exp_scores.iter().sum::<f64>();
    if !denom.is_finite() || denom <= EPSILON {
        return vec![1.0 / raw.len().max(1) as f64; raw.len()];
    }
    exp_scores.into_iter().map(|score| score / denom).collect()
}

pub fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0usize, f64::NEG_INFINITY), |(best_idx, best), (idx, &value)| {
            if value > best {
                (idx, value)
            } else {
                (best_idx, best)
            }
        })
        .0
}

pub fn pinball(label: f64, prediction: f64, alpha: f64) -> f64 {
    let diff = label - prediction;
    if diff >= 0.0 {
        alpha * diff
    } else {
        (alpha - 1.0) * diff
    }
}
