use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde::Serialize;

use crate::features::FeatureMatrix;
use crate::gbdt::{BoosterParams, Dataset, GradientBoostedModel, Objective};
use crate::models::{TaskKind, Target};
use crate::split::{temporal_split, TemporalSplit, DEFAULT_HOLDOUT_FRACTION};
use crate::tuner::{self, SearchOutcome, SearchSpace, SearchStrategy};

pub const EARLY_STOPPING_ROUNDS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingPath {
    Baseline,
    Tuned,
}

pub struct TuningRequest<'a> {
    pub strategy: &'a dyn SearchStrategy,
    pub space: &'a SearchSpace,
}

/// Everything a trainer needs for one target.
pub struct TrainRequest<'a> {
    pub matrix: &'a FeatureMatrix,
    pub weights: Option<&'a [f64]>,
    /// Explicit head/tail partition for early stopping; defaults to the last 20%.
    pub split: Option<TemporalSplit>,
    pub tuning: Option<TuningRequest<'a>>,
    pub sl_quantile: f64,
    pub seed: u64,
}

pub struct TrainedModel {
    pub target: Target,
    pub model: GradientBoostedModel,
    pub path: TrainingPath,
    /// Hyperparameters with `n_estimators` set to the rounds actually kept.
    pub params: BoosterParams,
    /// Hyperparameters for holdout and walk-forward models. Nothing in them is derived
    /// from the rows those models are scored on: the baseline keeps its configured round
    /// count, the tuned path its search winner.
    pub validation_params: BoosterParams,
    pub search: Option<SearchOutcome>,
}

pub fn objective_for(matrix: &FeatureMatrix, sl_quantile: f64) -> Result<Objective> {
    Ok(match matrix.target.task() {
        TaskKind::Binary => Objective::Binary,
        TaskKind::Regression => Objective::SquaredError,
        TaskKind::Multiclass => {
            let num_class = matrix.num_classes();
            if num_class < 2 {
                return Err(anyhow!(
                    "{} needs at least two distinct classes (found {})",
                    matrix.target,
                    num_class
                ));
            }
            Objective::Multiclass { num_class }
        }
        TaskKind::Quantile => Objective::Quantile { alpha: sl_quantile },
    })
}

pub fn baseline_params(seed: u64) -> BoosterParams {
    BoosterParams {
        seed,
        ..BoosterParams::default()
    }
}

pub fn train_target(request: &TrainRequest<'_>) -> Result<TrainedModel> {
    let matrix = request.matrix;
    let target = matrix.target;
    let objective = objective_for(matrix, request.sl_quantile)?;
    let data = Dataset::new(&matrix.rows, &matrix.labels).with_weights(request.weights);
    let base = baseline_params(request.seed);

    if let Some(tuning) = &request.tuning {
        if let Some(outcome) = tuner::tune(tuning.strategy, tuning.space, &base, objective, &data) {
            let model = GradientBoostedModel::fit(&outcome.params, objective, &data, None, 0)
                .with_context(|| format!("Failed to refit {target} with tuned parameters"))?;
            info!(
                "{target}: tuned model refit on {} rows ({} rounds, depth {}, lr {})",
                data.len(),
                model.n_iterations(),
                outcome.params.max_depth,
                outcome.params.learning_rate
            );
            let params = BoosterParams {
                n_estimators: model.n_iterations(),
                ..outcome.params
            };
            return Ok(TrainedModel {
                target,
                model,
                path: TrainingPath::Tuned,
                params,
                validation_params: outcome.params,
                search: Some(outcome),
            });
        }
        warn!("{target}: hyperparameter search produced no usable candidate; using baseline");
    }

    let split = request
        .split
        .or_else(|| temporal_split(data.len(), DEFAULT_HOLDOUT_FRACTION));
    let model = match split {
        Some(split) => {
            let train = data.slice(split.train());
            let eval = data.slice(split.holdout());
            GradientBoostedModel::fit(&base, objective, &train, Some(&eval), EARLY_STOPPING_ROUNDS)
        }
        None => GradientBoostedModel::fit(&base, objective, &data, None, 0),
    }
    .with_context(|| format!("Failed to train {target}"))?;

    match (split, model.best_iteration) {
        (Some(split), Some(best)) => info!(
            "{target}: baseline trained on {} rows, early stopping kept {} of {} rounds",
            split.split_index,
            best + 1,
            base.n_estimators
        ),
        _ => info!(
            "{target}: baseline trained on {} rows without early stopping ({} rounds)",
            data.len(),
            model.n_iterations()
        ),
    }

    let params = BoosterParams {
        n_estimators: model.n_iterations(),
        ..base
    };
    Ok(TrainedModel {
        target,
        model,
        path: TrainingPath::Baseline,
        params,
        validation_params: base,
        search: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuner::GridSearch;
    use crate::validation::holdout_evaluation;

    fn matrix(target: Target, n: usize) -> FeatureMatrix {
        let rows: Vec<Vec<f64>> = (0..n).map(|i| vec![(i % 10) as f64, (i % 3) as f64]).collect();
        let labels: Vec<f64> = rows
            .iter()
            .map(|r| match target.task() {
                TaskKind::Binary => (r[0] >= 5.0) as u8 as f64,
                TaskKind::Multiclass => (r[0] / 4.0).floor(),
                _ => r[0] * 0.3,
            })
            .collect();
        let class_labels = if target.task() == TaskKind::Multiclass {
            vec![1, 2, 3]
        } else {
            Vec::new()
        };
        FeatureMatrix {
            target,
            feature_names: vec!["a".to_string(), "b".to_string()],
            rows,
            labels,
            timestamps: (0..n as i64).collect(),
            assets: vec!["BTC".to_string(); n],
            class_labels,
        }
    }

    #[test]
    fn baseline_records_effective_rounds() {
        let matrix = matrix(Target::SignalQuality, 100);
        let trained = train_target(&TrainRequest {
            matrix: &matrix,
            weights: None,
            split: None,
            tuning: None,
            sl_quantile: 0.95,
            seed: 42,
        })
        .unwrap();
        assert_eq!(trained.path, TrainingPath::Baseline);
        assert_eq!(trained.params.n_estimators, trained.model.n_iterations());
        assert!(trained.model.best_iteration.is_some());
    }

    #[test]
    fn tiny_targets_train_without_early_stopping() {
        let matrix = matrix(Target::PositionSizing, 12);
        let trained = train_target(&TrainRequest {
            matrix: &matrix,
            weights: None,
            split: None,
            tuning: None,
            sl_quantile: 0.95,
            seed: 42,
        })
        .unwrap();
        assert!(trained.model.best_iteration.is_none());
        assert_eq!(trained.params.n_estimators, trained.model.n_iterations());
        assert_eq!(trained.validation_params.n_estimators, 100);
    }

    #[test]
    fn tuned_path_refits_with_the_search_winner() {
        let matrix = matrix(Target::TpOptimizer, 90);
        let space = SearchSpace {
            n_estimators: vec![5, 10],
            max_depth: vec![2],
            learning_rate: vec![0.1],
            subsample: vec![1.0],
            colsample_bytree: vec![1.0],
            min_child_weight: vec![1.0],
        };
        let trained = train_target(&TrainRequest {
            matrix: &matrix,
            weights: None,
            split: None,
            tuning: Some(TuningRequest {
                strategy: &GridSearch,
                space: &space,
            }),
            sl_quantile: 0.95,
            seed: 42,
        })
        .unwrap();
        assert_eq!(trained.path, TrainingPath::Tuned);
        let search = trained.search.unwrap();
        assert_eq!(search.trials, 2);
        assert!(trained.model.n_iterations() <= search.params.n_estimators);
        assert_eq!(trained.model.trees.len(), trained.model.n_iterations() * 3);
        assert_eq!(trained.validation_params, search.params);
    }

    fn holdout_predictions(matrix: &FeatureMatrix) -> Vec<f64> {
        let trained = train_target(&TrainRequest {
            matrix,
            weights: None,
            split: None,
            tuning: None,
            sl_quantile: 0.95,
            seed: 42,
        })
        .unwrap();
        let data = Dataset::new(&matrix.rows, &matrix.labels);
        holdout_evaluation(
            &data,
            trained.model.objective,
            &trained.validation_params,
            DEFAULT_HOLDOUT_FRACTION,
        )
        .unwrap()
        .unwrap()
        .predictions
    }

    #[test]
    fn holdout_model_ignores_holdout_labels() {
        for target in [Target::PositionSizing, Target::SignalQuality] {
            let original = matrix(target, 100);
            let mut flipped = original.clone();
            for label in &mut flipped.labels[80..] {
                *label = match target.task() {
                    TaskKind::Binary => 1.0 - *label,
                    _ => 10.0 - *label,
                };
            }
            assert_eq!(original.labels[..80], flipped.labels[..80]);
            assert_eq!(holdout_predictions(&original), holdout_predictions(&flipped));
        }
    }

    #[test]
    fn single_tier_targets_are_rejected() {
        let mut matrix = matrix(Target::TpOptimizer, 30);
        matrix.class_labels = vec![2];
        assert!(objective_for(&matrix, 0.95).is_err());
    }
}
