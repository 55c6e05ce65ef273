use anyhow::Result;

use super::{build_matrix, tp_optimizer, FeatureMatrix, TargetFeatureSpec};
use crate::models::{FlatRow, Target};

pub const ADVERSE_EXCURSION_RANGE: (f64, f64) = (0.0, 5.0);

/// Take-profit inputs plus realized volatility, which drives adverse excursion.
pub const BASE_COLUMNS: [&str; 4] = [
    "market_atrPct",
    "market_volatility",
    "signal_strength",
    "signal_confidence",
];

pub const SPEC: TargetFeatureSpec = TargetFeatureSpec {
    target: Target::SlOptimizer,
    base_columns: &BASE_COLUMNS,
    encodings: &tp_optimizer::ENCODINGS,
    label_clip: Some(ADVERSE_EXCURSION_RANGE),
};

/// Maximum adverse excursion matrix for quantile regression.
pub fn build(rows: &[FlatRow], lag_columns: &[String]) -> Result<FeatureMatrix> {
    build_matrix(rows, &SPEC, lag_columns)
}
