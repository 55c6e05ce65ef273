use log::debug;
use std::collections::HashMap;
use std::ops::Range;

pub const DEFAULT_HOLDOUT_FRACTION: f64 = 0.2;
pub const MIN_HOLDOUT_ROWS: usize = 5;
const MS_PER_DAY: f64 = 86_400_000.0;

/// Chronological head/tail partition of `len` rows at `split_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemporalSplit {
    pub split_index: usize,
    pub len: usize,
}

impl TemporalSplit {
    pub fn train(&self) -> Range<usize> {
        0..self.split_index
    }

    pub fn holdout(&self) -> Range<usize> {
        self.split_index..self.len
    }

    pub fn holdout_len(&self) -> usize {
        self.len - self.split_index
    }
}

/// First `1 - holdout_fraction` of rows train, the rest is held out. `None` when the tail
/// would have fewer than [`MIN_HOLDOUT_ROWS`] rows or the head would be empty.
pub fn temporal_split(len: usize, holdout_fraction: f64) -> Option<TemporalSplit> {
    let fraction = holdout_fraction.clamp(0.0, 1.0);
    let split_index = ((len as f64) * (1.0 - fraction) + 1e-9).floor() as usize;
    let split_index = split_index.min(len);
    if split_index == 0 || len - split_index < MIN_HOLDOUT_ROWS {
        return None;
    }
    Some(TemporalSplit { split_index, len })
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WeightingOptions {
    /// Exponential decay per day of age relative to the newest row.
    pub recency_decay: Option<f64>,
    /// Multiply by inverse asset frequency so each asset contributes equally.
    pub balance_assets: bool,
}

impl WeightingOptions {
    pub fn enabled(&self) -> bool {
        self.recency_decay.map(|d| d > 0.0).unwrap_or(false) || self.balance_assets
    }
}

/// Per-row weights aligned with `timestamps`/`assets`, normalized so the largest is 1.
pub fn sample_weights(
    timestamps: &[i64],
    assets: &[String],
    options: &WeightingOptions,
) -> Option<Vec<f64>> {
    if !options.enabled() || timestamps.is_empty() || timestamps.len() != assets.len() {
        return None;
    }
    let n = timestamps.len();
    let mut weights = vec![1.0; n];

    if let Some(decay) = options.recency_decay.filter(|d| *d > 0.0 && d.is_finite()) {
        let newest = timestamps.iter().copied().max().unwrap_or_default();
        for (weight, ts) in weights.iter_mut().zip(timestamps) {
            let age_days = (newest - ts) as f64 / MS_PER_DAY;
            *weight *= (-decay * age_days).exp();
        }
    }

    if options.balance_assets {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for asset in assets {
            *counts.entry(asset.as_str()).or_default() += 1;
        }
        let groups = counts.len() as f64;
        for (weight, asset) in weights.iter_mut().zip(assets) {
            let count = counts.get(asset.as_str()).copied().unwrap_or(1) as f64;
            *weight *= n as f64 / (groups * count);
        }
    }

    let max = weights.iter().copied().fold(0.0_f64, f64::max);
    if !max.is_finite() || max <= 0.0 {
        return None;
    }
    for weight in weights.iter_mut() {
        *weight /= max;
    }
    debug!(
        "Sample weights: min {:.4}, mean {:.4}",
        weights.iter().copied().fold(f64::INFINITY, f64::min),
        weights.iter().sum::<f64>() / n as f64
    );
    Some(weights)
}
