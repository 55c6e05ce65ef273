use anyhow::Result;
use std::collections::BTreeSet;

use super::{build_matrix, Encoding, FeatureMatrix, TargetFeatureSpec};
use crate::models::{FlatRow, Target};

pub const BASE_COLUMNS: [&str; 3] = ["market_atrPct", "signal_strength", "signal_confidence"];

pub const ENCODINGS: [Encoding; 3] = [
    Encoding::DirectionNum,
    Encoding::VolatilityLevel,
    Encoding::MarketRegimeNum,
];

pub const SPEC: TargetFeatureSpec = TargetFeatureSpec {
    target: Target::TpOptimizer,
    base_columns: &BASE_COLUMNS,
    encodings: &ENCODINGS,
    label_clip: None,
};

/// Best-in-hindsight take-profit tier, compacted to consecutive class indices.
pub fn build(rows: &[FlatRow], lag_columns: &[String]) -> Result<FeatureMatrix> {
    let mut matrix = build_matrix(rows, &SPEC, lag_columns)?;
    let (encoded, class_labels) = compact_tiers(&matrix.labels);
    matrix.labels = encoded;
    matrix.class_labels = class_labels;
    Ok(matrix)
}

/// Maps observed tiers (e.g. 1, 3, 4) onto 0..k and returns the original tier per class.
pub fn compact_tiers(raw: &[f64]) -> (Vec<f64>, Vec<i64>) {
    let tiers: BTreeSet<i64> = raw.iter().map(|tier| tier.round() as i64).collect();
    let class_labels: Vec<i64> = tiers.into_iter().collect();
    let encoded = raw
        .iter()
        .map(|tier| {
            let tier = tier.round() as i64;
            class_labels
                .binary_search(&tier)
                .map(|idx| idx as f64)
                .unwrap_or(0.0)
        })
        .collect();
    (encoded, class_labels)
}
