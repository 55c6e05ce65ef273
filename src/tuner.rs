//! Hyperparameter search scored by forward-chaining cross-validation.

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;

use crate::gbdt::{BoosterParams, Dataset, GradientBoostedModel, Objective};
use crate::metrics;

pub const CV_FOLDS: usize = 5;

/// Candidate values per hyperparameter. Every combination is a point in the space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub n_estimators: Vec<usize>,
    pub max_depth: Vec<usize>,
    pub learning_rate: Vec<f64>,
    pub subsample: Vec<f64>,
    pub colsample_bytree: Vec<f64>,
    pub min_child_weight: Vec<f64>,
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            n_estimators: vec![50, 100, 200],
            max_depth: vec![2, 3, 4, 5],
            learning_rate: vec![0.05, 0.1, 0.2],
            subsample: vec![0.8, 1.0],
            colsample_bytree: vec![0.8, 1.0],
            min_child_weight: vec![1.0, 3.0],
        }
    }
}

type Point = [usize; 6];

impl SearchSpace {
    fn dimensions(&self) -> Point {
        [
            self.n_estimators.len(),
            self.max_depth.len(),
            self.learning_rate.len(),
            self.subsample.len(),
            self.colsample_bytree.len(),
            self.min_child_weight.len(),
        ]
    }

    /// Number of distinct combinations (0 when any axis is empty).
    pub fn size(&self) -> usize {
        self.dimensions().iter().product()
    }

    fn params_at(&self, point: &Point, base: &BoosterParams) -> BoosterParams {
        BoosterParams {
            n_estimators: self.n_estimators[point[0]],
            max_depth: self.max_depth[point[1]],
            learning_rate: self.learning_rate[point[2]],
            subsample: self.subsample[point[3]],
            colsample_bytree: self.colsample_bytree[point[4]],
            min_child_weight: self.min_child_weight[point[5]],
            ..*base
        }
    }

    /// Every point in row-major order.
    fn points(&self) -> Vec<Point> {
        let dims = self.dimensions();
        let mut points = Vec::with_capacity(self.size());
        for flat in 0..self.size() {
            let mut point = [0usize; 6];
            let mut rest = flat;
            for axis in (0..6).rev() {
                point[axis] = rest % dims[axis];
                rest /= dims[axis];
            }
            points.push(point);
        }
        points
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchOutcome {
    pub params: BoosterParams,
    pub score: f64,
    pub trials: usize,
    pub strategy: &'static str,
}

/// Scores a candidate (higher is better); `None` when it cannot be evaluated.
pub type Evaluator<'a> = dyn Fn(&BoosterParams) -> Option<f64> + Sync + 'a;

pub trait SearchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn search(
        &self,
        space: &SearchSpace,
        base: &BoosterParams,
        evaluate: &Evaluator<'_>,
    ) -> Option<SearchOutcome>;
}

/// Exhaustive evaluation of every combination.
#[derive(Debug, Clone, Copy, Default)]
pub struct GridSearch;

impl SearchStrategy for GridSearch {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn search(
        &self,
        space: &SearchSpace,
        base: &BoosterParams,
        evaluate: &Evaluator<'_>,
    ) -> Option<SearchOutcome> {
        let points = space.points();
        let scores: Vec<Option<f64>> = points
            .par_iter()
            .map(|point| evaluate(&space.params_at(point, base)))
            .collect();
        let trials = points.len();
        points
            .iter()
            .zip(scores)
            .filter_map(|(point, score)| score.map(|s| (point, s)))
            .fold(None, |best: Option<(&Point, f64)>, (point, score)| match best {
                Some((_, best_score)) if best_score >= score => best,
                _ => Some((point, score)),
            })
            .map(|(point, score)| SearchOutcome {
                params: space.params_at(point, base),
                score,
                trials,
                strategy: self.name(),
            })
    }
}

/// Sequential model-based search in the style of a tree-structured Parzen estimator:
/// after a random start-up phase, each trial samples candidates from the per-axis
/// distribution of the best trials so far and evaluates the one whose good/bad density
/// ratio is highest.
#[derive(Debug, Clone, Copy)]
pub struct BayesianSearch {
    pub trials: usize,
    pub seed: u64,
    pub startup_trials: usize,
    pub candidates_per_trial: usize,
    pub good_fraction: f64,
}

impl BayesianSearch {
    pub fn new(trials: usize, seed: u64) -> Self {
        Self {
            trials,
            seed,
            startup_trials: 10,
            candidates_per_trial: 24,
            good_fraction: 0.25,
        }
    }

    fn random_point(rng: &mut StdRng, dims: &Point) -> Point {
        let mut point = [0usize; 6];
        for (axis, slot) in point.iter_mut().enumerate() {
            *slot = rng.gen_range(0..dims[axis]);
        }
        point
    }

    /// Per-axis categorical densities with add-one smoothing.
    fn densities(points: &[Point], dims: &Point) -> Vec<Vec<f64>> {
        dims.iter()
            .enumerate()
            .map(|(axis, &size)| {
                let mut counts = vec![1.0; size];
                for point in points {
                    counts[point[axis]] += 1.0;
                }
                let total: f64 = counts.iter().sum();
                counts.into_iter().map(|c| c / total).collect()
            })
            .collect()
    }

    fn sample_from(rng: &mut StdRng, densities: &[Vec<f64>]) -> Point {
        let mut point = [0usize; 6];
        for (axis, density) in densities.iter().enumerate() {
            let mut draw: f64 = rng.gen();
            point[axis] = density.len() - 1;
            for (idx, p) in density.iter().enumerate() {
                if draw < *p {
                    point[axis] = idx;
                    break;
                }
                draw -= p;
            }
        }
        point
    }

    fn propose(
        &self,
        rng: &mut StdRng,
        history: &[(Point, f64)],
        dims: &Point,
        seen: &HashMap<Point, f64>,
    ) -> Point {
        let mut ranked: Vec<&(Point, f64)> = history.iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        let good_count = ((ranked.len() as f64 * self.good_fraction).ceil() as usize)
            .max(1)
            .min(ranked.len());
        let good: Vec<Point> = ranked[..good_count].iter().map(|(p, _)| *p).collect();
        let bad: Vec<Point> = ranked[good_count..].iter().map(|(p, _)| *p).collect();
        let good_density = Self::densities(&good, dims);
        let bad_density = Self::densities(&bad, dims);

        let ratio = |point: &Point| -> f64 {
            (0..6)
                .map(|axis| (good_density[axis][point[axis]] / bad_density[axis][point[axis]]).ln())
                .sum()
        };

        let mut best: Option<(Point, f64)> = None;
        for _ in 0..self.candidates_per_trial {
            let candidate = Self::sample_from(rng, &good_density);
            if seen.contains_key(&candidate) {
                continue;
            }
            let score = ratio(&candidate);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((candidate, score));
            }
        }
        match best {
            Some((point, _)) => point,
            None => Self::random_point(rng, dims),
        }
    }
}

impl SearchStrategy for BayesianSearch {
    fn name(&self) -> &'static str {
        "bayesian"
    }

    fn search(
        &self,
        space: &SearchSpace,
        base: &BoosterParams,
        evaluate: &Evaluator<'_>,
    ) -> Option<SearchOutcome> {
        let dims = space.dimensions();
        let budget = self.trials.min(space.size());
        if budget == 0 {
            return None;
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut seen: HashMap<Point, f64> = HashMap::new();
        let mut history: Vec<(Point, f64)> = Vec::new();
        let mut trials = 0usize;
        // Each attempt either evaluates a new point or draws a duplicate; the cap keeps
        // small spaces from spinning on duplicates.
        let max_attempts = budget * 20;

        for _ in 0..max_attempts {
            if trials >= budget {
                break;
            }
            let point = if history.len() < self.startup_trials {
                Self::random_point(&mut rng, &dims)
            } else {
                self.propose(&mut rng, &history, &dims, &seen)
            };
            if seen.contains_key(&point) {
                continue;
            }
            trials += 1;
            let score = evaluate(&space.params_at(&point, base)).unwrap_or(f64::NEG_INFINITY);
            debug!("Search trial {trials}/{budget}: {point:?} -> {score:.5}");
            seen.insert(point, score);
            if score.is_finite() {
                history.push((point, score));
            }
        }

        history
            .iter()
            .fold(None, |best: Option<&(Point, f64)>, entry| match best {
                Some(current) if current.1 >= entry.1 => best,
                _ => Some(entry),
            })
            .map(|(point, score)| SearchOutcome {
                params: space.params_at(point, base),
                score: *score,
                trials,
                strategy: self.name(),
            })
    }
}

/// Expanding-window folds laid out like a time-series splitter: `folds` test windows of
/// `n / (folds + 1)` rows at the end of the data, each trained on everything before it.
pub fn forward_chaining_folds(n: usize, folds: usize) -> Vec<(Range<usize>, Range<usize>)> {
    if folds == 0 {
        return Vec::new();
    }
    let test_size = n / (folds + 1);
    if test_size == 0 {
        return Vec::new();
    }
    let first_test_start = n - folds * test_size;
    (0..folds)
        .map(|fold| {
            let test_start = first_test_start + fold * test_size;
            (0..test_start, test_start..test_start + test_size)
        })
        .collect()
}

/// Fold metric for an objective, oriented so that higher is better.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CvMetric {
    Auc,
    NegativeMae,
    Accuracy,
    NegativePinball { alpha: f64 },
}

impl CvMetric {
    pub fn for_objective(objective: &Objective) -> Self {
        match objective {
            Objective::Binary => CvMetric::Auc,
            Objective::SquaredError => CvMetric::NegativeMae,
            Objective::Multiclass { .. } => CvMetric::Accuracy,
            Objective::Quantile { alpha } => CvMetric::NegativePinball { alpha: *alpha },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CvMetric::Auc => "auc",
            CvMetric::NegativeMae => "neg_mae",
            CvMetric::Accuracy => "accuracy",
            CvMetric::NegativePinball { .. } => "neg_pinball",
        }
    }

    pub fn score(&self, labels: &[f64], predicted: &[f64]) -> Option<f64> {
        match self {
            CvMetric::Auc => metrics::roc_auc(labels, predicted),
            CvMetric::NegativeMae => Some(-metrics::mae(labels, predicted)),
            CvMetric::Accuracy => Some(metrics::accuracy(labels, predicted)),
            CvMetric::NegativePinball { alpha } => {
                Some(-metrics::pinball_loss(labels, predicted, *alpha))
            }
        }
    }
}

/// Mean fold score of `params`, folds fitted in parallel. Folds whose metric is undefined
/// (e.g. a single-class test window for AUC) are left out.
pub fn cross_validate(
    params: &BoosterParams,
    objective: Objective,
    data: &Dataset<'_>,
    folds: usize,
) -> Option<f64> {
    let metric = CvMetric::for_objective(&objective);
    let scores: Vec<f64> = forward_chaining_folds(data.len(), folds)
        .into_par_iter()
        .filter_map(|(train, test)| {
            let model =
                GradientBoostedModel::fit(params, objective, &data.slice(train), None, 0).ok()?;
            let test = data.slice(test);
            let predicted = model.predict_values(test.features);
            metric.score(test.labels, &predicted)
        })
        .collect();
    if scores.is_empty() {
        return None;
    }
    Some(scores.iter().sum::<f64>() / scores.len() as f64)
}

/// Runs `strategy` over `space` scoring each candidate with [`cross_validate`].
pub fn tune(
    strategy: &dyn SearchStrategy,
    space: &SearchSpace,
    base: &BoosterParams,
    objective: Objective,
    data: &Dataset<'_>,
) -> Option<SearchOutcome> {
    let evaluate = |params: &BoosterParams| cross_validate(params, objective, data, CV_FOLDS);
    let outcome = strategy.search(space, base, &evaluate)?;
    info!(
        "{} search finished after {} trial(s): best {} = {:.4}",
        outcome.strategy,
        outcome.trials,
        CvMetric::for_objective(&objective).name(),
        outcome.score
    );
    Some(outcome)
}
