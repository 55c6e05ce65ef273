use anyhow::Result;

use super::{build_matrix, Encoding, FeatureMatrix, TargetFeatureSpec};
use crate::models::{FlatRow, Target};

pub const BASE_COLUMNS: [&str; 14] = [
    "market_priceChange24h",
    "market_volumeRatio",
    "market_fundingPercentile",
    "market_longShortRatio",
    "signal_strength",
    "signal_confidence",
    "signal_source_count",
    "signal_hasCascadeSignal",
    "signal_hasFundingExtreme",
    "signal_hasWhaleSignal",
    "signal_hasOICap",
    "session_isWeekend",
    "session_isOpenWindow",
    "session_utcHour",
];

pub const ENCODINGS: [Encoding; 3] = [
    Encoding::VolatilityHigh,
    Encoding::RegimeBullish,
    Encoding::RegimeBearish,
];

pub const SPEC: TargetFeatureSpec = TargetFeatureSpec {
    target: Target::SignalQuality,
    base_columns: &BASE_COLUMNS,
    encodings: &ENCODINGS,
    label_clip: None,
};

/// Binary win/loss matrix; the label is profitability as 0/1.
pub fn build(rows: &[FlatRow], lag_columns: &[String]) -> Result<FeatureMatrix> {
    build_matrix(rows, &SPEC, lag_columns)
}

/// Fraction of positive labels, used for the class-imbalance ratio.
pub fn positive_rate(matrix: &FeatureMatrix) -> f64 {
    if matrix.labels.is_empty() {
        return 0.0;
    }
    matrix.labels.iter().filter(|label| **label > 0.5).count() as f64 / matrix.labels.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::test_support::trade_row;

    #[test]
    fn labels_are_binary_and_regimes_are_flags() {
        let rows: Vec<FlatRow> = (0..12).map(|i| trade_row(i, "BTC")).collect();
        let matrix = build(&rows, &[]).unwrap();
        assert!(matrix.labels.iter().all(|l| *l == 0.0 || *l == 1.0));
        for column in ["regime_volatility_high", "regime_bullish", "regime_bearish"] {
            let idx = matrix.feature_names.iter().position(|c| c == column).unwrap();
            assert!(matrix.rows.iter().all(|r| r[idx] == 0.0 || r[idx] == 1.0));
        }
        assert!(matrix.feature_names.iter().any(|c| c == "signal_hasWhaleSignal"));
        assert!(!matrix.feature_names.iter().any(|c| c == "regime_volatility_level"));
    }

    #[test]
    fn positive_rate_counts_wins() {
        let rows: Vec<FlatRow> = (0..9).map(|i| trade_row(i, "BTC")).collect();
        let matrix = build(&rows, &[]).unwrap();
        assert!((positive_rate(&matrix) - 6.0 / 9.0).abs() < 1e-12);
    }
}
