use anyhow::Result;

use super::{build_matrix, Encoding, FeatureMatrix, TargetFeatureSpec};
use crate::models::{FlatRow, Target};

pub const R_MULTIPLE_RANGE: (f64, f64) = (-2.0, 3.0);

pub const BASE_COLUMNS: [&str; 6] = [
    "signal_strength",
    "signal_confidence",
    "signal_source_count",
    "session_isWeekend",
    "session_utcHour",
    "exec_streakMultiplier",
];

pub const ENCODINGS: [Encoding; 1] = [Encoding::VolatilityLevel];

pub const SPEC: TargetFeatureSpec = TargetFeatureSpec {
    target: Target::PositionSizing,
    base_columns: &BASE_COLUMNS,
    encodings: &ENCODINGS,
    label_clip: Some(R_MULTIPLE_RANGE),
};

/// Realized R-multiple regression matrix.
pub fn build(rows: &[FlatRow], lag_columns: &[String]) -> Result<FeatureMatrix> {
    build_matrix(rows, &SPEC, lag_columns)
}
