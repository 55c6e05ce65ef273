use serde::Serialize;
use std::cmp::Ordering;

use crate::gbdt::{pinball, sigmoid, EPSILON};

const PROBABILITY_FLOOR: f64 = 1e-15;
pub const THRESHOLD_SCAN_START: f64 = 0.05;
pub const THRESHOLD_SCAN_END: f64 = 0.95;
pub const THRESHOLD_SCAN_STEP: f64 = 0.01;

fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator.abs() < EPSILON {
        0.0
    } else {
        numerator / denominator
    }
}

/// Area under the ROC curve via the rank-sum statistic, ties averaged. `None` when only
/// one class is present.
pub fn roc_auc(labels: &[f64], scores: &[f64]) -> Option<f64> {
    let n = labels.len().min(scores.len());
    let positives = labels[..n].iter().filter(|l| **l > 0.5).count();
    let negatives = n - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|a, b| scores[*a].partial_cmp(&scores[*b]).unwrap_or(Ordering::Equal));

    let mut positive_rank_sum = 0.0;
    let mut idx = 0;
    while idx < n {
        let mut end = idx + 1;
        while end < n && scores[order[end]] == scores[order[idx]] {
            end += 1;
        }
        // Ranks are 1-based; tied scores share the average rank.
        let average_rank = (idx + 1 + end) as f64 / 2.0;
        for &row in &order[idx..end] {
            if labels[row] > 0.5 {
                positive_rank_sum += average_rank;
            }
        }
        idx = end;
    }

    let p = positives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64))
}

pub fn accuracy(labels: &[f64], predicted: &[f64]) -> f64 {
    let hits = labels
        .iter()
        .zip(predicted)
        .filter(|(label, prediction)| (**label - **prediction).abs() < 0.5)
        .count();
    safe_div(hits as f64, labels.len().min(predicted.len()) as f64)
}

/// Accuracy of `probabilities >= threshold` against binary labels.
pub fn binary_accuracy(labels: &[f64], probabilities: &[f64], threshold: f64) -> f64 {
    let predicted: Vec<f64> = probabilities
        .iter()
        .map(|p| if *p >= threshold { 1.0 } else { 0.0 })
        .collect();
    accuracy(labels, &predicted)
}

/// Mean negative log-likelihood of the true class.
pub fn log_loss(labels: &[f64], distributions: &[Vec<f64>]) -> f64 {
    let total: f64 = labels
        .iter()
        .zip(distributions)
        .map(|(label, dist)| {
            let p = dist
                .get(*label as usize)
                .copied()
                .unwrap_or_default()
                .clamp(PROBABILITY_FLOOR, 1.0);
            -p.ln()
        })
        .sum();
    safe_div(total, labels.len().min(distributions.len()) as f64)
}

pub fn mae(labels: &[f64], predicted: &[f64]) -> f64 {
    let total: f64 = labels.iter().zip(predicted).map(|(l, p)| (l - p).abs()).sum();
    safe_div(total, labels.len().min(predicted.len()) as f64)
}

pub fn rmse(labels: &[f64], predicted: &[f64]) -> f64 {
    let total: f64 = labels.iter().zip(predicted).map(|(l, p)| (l - p).powi(2)).sum();
    safe_div(total, labels.len().min(predicted.len()) as f64).sqrt()
}

/// `mean(max(q * e, (q - 1) * e))` with `e = actual - predicted`.
pub fn pinball_loss(labels: &[f64], predicted: &[f64], quantile: f64) -> f64 {
    let total: f64 = labels
        .iter()
        .zip(predicted)
        .map(|(l, p)| pinball(*l, *p, quantile))
        .sum();
    safe_div(total, labels.len().min(predicted.len()) as f64)
}

/// Unweighted mean of per-class F1 over the classes seen in labels or predictions.
pub fn f1_macro(labels: &[f64], predicted: &[f64]) -> f64 {
    let mut classes: Vec<i64> = labels
        .iter()
        .chain(predicted)
        .map(|v| v.round() as i64)
        .collect();
    classes.sort_unstable();
    classes.dedup();
    if classes.is_empty() {
        return 0.0;
    }
    let total: f64 = classes
        .iter()
        .map(|class| {
            let class = *class as f64;
            let counts = ConfusionCounts::for_class(labels, predicted, class);
            counts.f1()
        })
        .sum();
    total / classes.len() as f64
}

#[derive(Debug, Clone, Copy, Default)]
struct ConfusionCounts {
    true_positive: usize,
    false_positive: usize,
    false_negative: usize,
}

impl ConfusionCounts {
    fn for_class(labels: &[f64], predicted: &[f64], class: f64) -> Self {
        let mut counts = Self::default();
        for (label, prediction) in labels.iter().zip(predicted) {
            let actual = (label - class).abs() < 0.5;
            let guessed = (prediction - class).abs() < 0.5;
            match (actual, guessed) {
                (true, true) => counts.true_positive += 1,
                (false, true) => counts.false_positive += 1,
                (true, false) => counts.false_negative += 1,
                (false, false) => {}
            }
        }
        counts
    }

    fn f1(&self) -> f64 {
        let tp = self.true_positive as f64;
        safe_div(
            2.0 * tp,
            2.0 * tp + self.false_positive as f64 + self.false_negative as f64,
        )
    }
}

pub fn binary_f1(labels: &[f64], probabilities: &[f64], threshold: f64) -> f64 {
    let predicted: Vec<f64> = probabilities
        .iter()
        .map(|p| if *p >= threshold { 1.0 } else { 0.0 })
        .collect();
    ConfusionCounts::for_class(labels, &predicted, 1.0).f1()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdChoice {
    pub threshold: f64,
    pub f1: f64,
}

/// Scans thresholds 0.05..=0.95 in 0.01 steps and keeps the first one with maximal F1.
/// `None` when there are no positive labels.
pub fn best_f1_threshold(labels: &[f64], probabilities: &[f64]) -> Option<ThresholdChoice> {
    if labels.is_empty() || !labels.iter().any(|l| *l > 0.5) {
        return None;
    }
    let span = THRESHOLD_SCAN_END - THRESHOLD_SCAN_START;
    let steps = (span / THRESHOLD_SCAN_STEP).round() as usize;
    let mut best: Option<ThresholdChoice> = None;
    for step in 0..=steps {
        let threshold = round_to(THRESHOLD_SCAN_START + step as f64 * THRESHOLD_SCAN_STEP, 2);
        let f1 = binary_f1(labels, probabilities, threshold);
        if best.map_or(true, |current| f1 > current.f1 + EPSILON) {
            best = Some(ThresholdChoice { threshold, f1 });
        }
    }
    best
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Sigmoid recalibration `p' = 1 / (1 + exp(-(scale * p + intercept)))` of raw scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlattCalibration {
    pub scale: f64,
    pub intercept: f64,
}

impl PlattCalibration {
    const MAX_ITERATIONS: usize = 100;
    const TOLERANCE: f64 = 1e-10;

    /// Newton's method on the log-likelihood with Platt's smoothed targets. `None` when
    /// only one class is present or the fit does not converge to finite values.
    pub fn fit(scores: &[f64], labels: &[f64]) -> Option<Self> {
        let n = scores.len().min(labels.len());
        let positives = labels[..n].iter().filter(|l| **l > 0.5).count() as f64;
        let negatives = n as f64 - positives;
        if positives == 0.0 || negatives == 0.0 {
            return None;
        }
        let high = (positives + 1.0) / (positives + 2.0);
        let low = 1.0 / (negatives + 2.0);
        let targets: Vec<f64> = labels[..n]
            .iter()
            .map(|l| if *l > 0.5 { high } else { low })
            .collect();

        let mut scale = 0.0;
        let mut intercept = ((negatives + 1.0) / (positives + 1.0)).ln() * -1.0;
        for _ in 0..Self::MAX_ITERATIONS {
            let (mut g_a, mut g_b) = (0.0, 0.0);
            let (mut h_aa, mut h_ab, mut h_bb) = (1e-12, 0.0, 1e-12);
            for (x, t) in scores[..n].iter().zip(&targets) {
                let p = sigmoid(scale * x + intercept);
                let d = p - t;
                let w = (p * (1.0 - p)).max(1e-12);
                g_a += d * x;
                g_b += d;
                h_aa += w * x * x;
                h_ab += w * x;
                h_bb += w;
            }
            let det = h_aa * h_bb - h_ab * h_ab;
            if det.abs() < 1e-18 {
                break;
            }
            let step_a = (h_bb * g_a - h_ab * g_b) / det;
            let step_b = (h_aa * g_b - h_ab * g_a) / det;
            scale -= step_a;
            intercept -= step_b;
            if step_a.abs() < Self::TOLERANCE && step_b.abs() < Self::TOLERANCE {
                break;
            }
        }

        (scale.is_finite() && intercept.is_finite()).then_some(Self { scale, intercept })
    }

    pub fn apply(&self, score: f64) -> f64 {
        sigmoid(self.scale * score + self.intercept)
    }
}
