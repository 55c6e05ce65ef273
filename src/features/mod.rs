pub mod position_sizing;
pub mod signal_quality;
pub mod sl_optimizer;
pub mod tp_optimizer;

use anyhow::{anyhow, Result};
use log::{debug, info};
use std::collections::{BTreeSet, HashSet};

use crate::lag_features::is_lag_column;
use crate::models::{CellValue, FlatRow, Target};

const OUTLIER_Z_THRESHOLD: f64 = 3.0;
const OUTLIER_CLIP_QUANTILE: f64 = 0.99;
const EPSILON: f64 = 1e-12;

/// Columns appended to every target when upstream populated them.
pub const OPTIONAL_COLUMNS: [&str; 19] = [
    "market_volatility",
    "market_fundingDelta",
    "market_bookImbalance",
    "market_bidAskSpread",
    "market_rsi14",
    "market_oiChange24h",
    "market_priceVsSma20",
    "market_dvol",
    "market_fearGreedIndex",
    "signal_avg_sentiment",
    "signal_max_strength",
    "signal_sentiment_variance",
    "news_avg_sentiment",
    "news_max_sentiment",
    "news_item_count",
    "news_sentimentScore",
    "news_nasdaqChange",
    "news_etfFlowBtc",
    "news_etfFlowEth",
];

pub const MACRO_RISK_SOURCE: &str = "news_macroRiskEnvironment";
pub const MACRO_RISK_COLUMNS: [(&str, &str); 2] = [
    ("news_macro_risk_on", "risk_on"),
    ("news_macro_risk_off", "risk_off"),
];
pub const ASSET_DUMMY_PREFIX: &str = "asset_";

/// Categorical columns re-expressed as numbers. Rows without the source value take the
/// neutral default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    VolatilityHigh,
    RegimeBullish,
    RegimeBearish,
    VolatilityLevel,
    MarketRegimeNum,
    DirectionNum,
}

impl Encoding {
    pub fn column(self) -> &'static str {
        match self {
            Encoding::VolatilityHigh => "regime_volatility_high",
            Encoding::RegimeBullish => "regime_bullish",
            Encoding::RegimeBearish => "regime_bearish",
            Encoding::VolatilityLevel => "regime_volatility_level",
            Encoding::MarketRegimeNum => "regime_market_regime_num",
            Encoding::DirectionNum => "signal_direction_num",
        }
    }

    pub fn source(self) -> &'static str {
        match self {
            Encoding::VolatilityHigh | Encoding::VolatilityLevel => "regime_volatilityRegime",
            Encoding::RegimeBullish | Encoding::RegimeBearish | Encoding::MarketRegimeNum => {
                "regime_marketRegime"
            }
            Encoding::DirectionNum => "signal_direction",
        }
    }

    pub fn encode(self, raw: Option<&str>) -> f64 {
        let value = raw.map(|v| v.trim().to_ascii_lowercase());
        let value = value.as_deref();
        match self {
            Encoding::VolatilityHigh => flag(matches!(value, Some("high") | Some("extreme"))),
            Encoding::RegimeBullish => flag(value == Some("bullish")),
            Encoding::RegimeBearish => flag(value == Some("bearish")),
            Encoding::VolatilityLevel => match value {
                Some("low") => 0.0,
                Some("high") => 2.0,
                Some("extreme") => 3.0,
                _ => 1.0,
            },
            Encoding::MarketRegimeNum => match value {
                Some("bearish") => -1.0,
                Some("bullish") => 1.0,
                _ => 0.0,
            },
            Encoding::DirectionNum => flag(value == Some("long")),
        }
    }
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// What distinguishes one target's builder from another.
#[derive(Debug, Clone, Copy)]
pub struct TargetFeatureSpec {
    pub target: Target,
    pub base_columns: &'static [&'static str],
    pub encodings: &'static [Encoding],
    pub label_clip: Option<(f64, f64)>,
}

/// Chronologically ordered rows of one target, all with a non-null label.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub target: Target,
    pub feature_names: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    pub labels: Vec<f64>,
    pub timestamps: Vec<i64>,
    pub assets: Vec<String>,
    /// Multiclass only: original tier for each encoded class index.
    pub class_labels: Vec<i64>,
}

impl FeatureMatrix {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }
}

/// Dispatch to the builder owning `target`.
pub fn build_for_target(
    target: Target,
    rows: &[FlatRow],
    lag_columns: &[String],
) -> Result<FeatureMatrix> {
    match target {
        Target::SignalQuality => signal_quality::build(rows, lag_columns),
        Target::PositionSizing => position_sizing::build(rows, lag_columns),
        Target::TpOptimizer => tp_optimizer::build(rows, lag_columns),
        Target::SlOptimizer => sl_optimizer::build(rows, lag_columns),
    }
}

#[derive(Debug, Clone)]
enum ColumnSource {
    Raw { clip: bool },
    Encoded(Encoding),
    MacroRisk(&'static str),
    AssetDummy(String),
}

#[derive(Debug, Clone)]
struct ColumnPlan {
    name: String,
    source: ColumnSource,
}

/// Shared enrichment: column selection, encodings, outlier clipping and zero fill.
pub(crate) fn build_matrix(
    rows: &[FlatRow],
    spec: &TargetFeatureSpec,
    lag_columns: &[String],
) -> Result<FeatureMatrix> {
    let target = spec.target;
    let contributing: Vec<&FlatRow> = rows
        .iter()
        .filter(|row| target.label(row).is_some())
        .collect();
    if contributing.is_empty() {
        return Err(anyhow!("No rows with {} label", target.label_column()));
    }

    let plans = plan_columns(&contributing, spec, lag_columns);
    if plans.is_empty() {
        return Err(anyhow!("No available feature columns for {}", target));
    }

    let mut matrix = vec![vec![0.0; plans.len()]; contributing.len()];
    let mut clipped_columns = 0usize;
    for (col_idx, plan) in plans.iter().enumerate() {
        let mut values: Vec<Option<f64>> = contributing
            .iter()
            .map(|row| column_value(row, &plan.source, &plan.name))
            .collect();
        if let ColumnSource::Raw { clip: true } = plan.source {
            if clip_outliers(&mut values) {
                clipped_columns += 1;
                debug!("{}: clipped outliers in {}", target, plan.name);
            }
        }
        for (row_idx, value) in values.into_iter().enumerate() {
            matrix[row_idx][col_idx] = value.unwrap_or(0.0);
        }
    }

    let mut labels: Vec<f64> = contributing
        .iter()
        .filter_map(|row| target.label(row))
        .collect();
    if let Some((low, high)) = spec.label_clip {
        for label in labels.iter_mut() {
            *label = label.clamp(low, high);
        }
    }

    let feature_names: Vec<String> = plans.into_iter().map(|plan| plan.name).collect();
    info!(
        "{}: {} rows x {} features ({} clipped)",
        target,
        matrix.len(),
        feature_names.len(),
        clipped_columns
    );

    Ok(FeatureMatrix {
        target,
        feature_names,
        rows: matrix,
        labels,
        timestamps: contributing.iter().map(|row| row.timestamp).collect(),
        assets: contributing.iter().map(|row| row.asset.clone()).collect(),
        class_labels: Vec::new(),
    })
}

fn plan_columns(
    rows: &[&FlatRow],
    spec: &TargetFeatureSpec,
    lag_columns: &[String],
) -> Vec<ColumnPlan> {
    let mut plans: Vec<ColumnPlan> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut push = |plans: &mut Vec<ColumnPlan>, name: String, source: ColumnSource| {
        if seen.insert(name.clone()) {
            plans.push(ColumnPlan { name, source });
        }
    };

    for column in spec.base_columns {
        if let Some(clip) = numeric_presence(rows, column) {
            push(&mut plans, column.to_string(), ColumnSource::Raw { clip });
        }
    }
    for encoding in spec.encodings {
        if rows.iter().any(|row| row.text(encoding.source()).is_some()) {
            push(
                &mut plans,
                encoding.column().to_string(),
                ColumnSource::Encoded(*encoding),
            );
        }
    }
    for column in OPTIONAL_COLUMNS {
        if let Some(clip) = numeric_presence(rows, column) {
            push(&mut plans, column.to_string(), ColumnSource::Raw { clip });
        }
    }
    if rows.iter().any(|row| row.text(MACRO_RISK_SOURCE).is_some()) {
        for (column, value) in MACRO_RISK_COLUMNS {
            push(&mut plans, column.to_string(), ColumnSource::MacroRisk(value));
        }
    }
    let assets: BTreeSet<&str> = rows.iter().map(|row| row.asset.as_str()).collect();
    if assets.len() > 1 {
        for asset in assets {
            push(
                &mut plans,
                format!("{ASSET_DUMMY_PREFIX}{asset}"),
                ColumnSource::AssetDummy(asset.to_string()),
            );
        }
    }
    for column in lag_columns.iter().filter(|column| is_lag_column(column)) {
        if let Some(clip) = numeric_presence(rows, column) {
            push(&mut plans, column.clone(), ColumnSource::Raw { clip });
        }
    }

    plans
}

/// `Some(clip)` when at least one row carries a numeric or boolean value. Clipping applies
/// only to continuous columns: genuine numbers with more than two distinct values.
fn numeric_presence(rows: &[&FlatRow], column: &str) -> Option<bool> {
    let mut present = false;
    let mut all_bool = true;
    let mut distinct: Vec<f64> = Vec::new();
    for row in rows {
        let Some(cell) = row.get(column) else {
            continue;
        };
        let Some(value) = cell.as_f64() else {
            continue;
        };
        present = true;
        all_bool &= cell.is_bool();
        if distinct.len() <= 2 && !distinct.iter().any(|d| (d - value).abs() <= EPSILON) {
            distinct.push(value);
        }
    }
    present.then_some(!all_bool && distinct.len() > 2)
}

fn column_value(row: &FlatRow, source: &ColumnSource, name: &str) -> Option<f64> {
    match source {
        ColumnSource::Raw { .. } => row.get(name).and_then(CellValue::as_f64),
        ColumnSource::Encoded(encoding) => Some(encoding.encode(row.text(encoding.source()))),
        ColumnSource::MacroRisk(expected) => Some(flag(
            row.text(MACRO_RISK_SOURCE)
                .map(|raw| raw.trim().eq_ignore_ascii_case(expected))
                .unwrap_or(false),
        )),
        ColumnSource::AssetDummy(asset) => Some(flag(&row.asset == asset)),
    }
}

/// Z-score outlier check with missing values imputed by the median; when any |z| exceeds 3,
/// present values are clipped to +/- the 99th percentile of absolute values.
pub fn clip_outliers(values: &mut [Option<f64>]) -> bool {
    let mut present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.len() < 2 {
        return false;
    }
    present.sort_by(|a, b| a.total_cmp(b));
    let median = quantile_sorted(&present, 0.5);

    let filled: Vec<f64> = values.iter().map(|v| v.unwrap_or(median)).collect();
    let n = filled.len() as f64;
    let mean = filled.iter().sum::<f64>() / n;
    let std = (filled.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    if std <= EPSILON {
        return false;
    }
    if !filled
        .iter()
        .any(|v| ((v - mean) / std).abs() > OUTLIER_Z_THRESHOLD)
    {
        return false;
    }

    let mut magnitudes: Vec<f64> = present.iter().map(|v| v.abs()).collect();
    magnitudes.sort_by(|a, b| a.total_cmp(b));
    let upper = quantile_sorted(&magnitudes, OUTLIER_CLIP_QUANTILE);
    for value in values.iter_mut().flatten() {
        *value = value.clamp(-upper, upper);
    }
    true
}

/// Linear-interpolated quantile of an ascending slice.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::models::{CellValue, FlatRow};

    pub fn trade_row(i: usize, asset: &str) -> FlatRow {
        let mut row = FlatRow {
            id: format!("t{i}"),
            timestamp: 1_700_000_000_000 + i as i64 * 60_000,
            asset: asset.to_string(),
            label_profitable: Some(i % 3 != 1),
            label_r_multiple: Some((if i % 3 != 1 { 0.5 } else { -0.5 }) + (i % 10) as f64 * 0.1),
            label_optimal_tp_level: Some((i % 4) as i64),
            ..FlatRow::default()
        };
        let numbers = [
            ("market_priceChange24h", if i % 3 != 1 { 0.5 } else { -0.3 }),
            ("market_volumeRatio", 1.0 + (i % 7) as f64 * 0.05),
            ("market_atrPct", 1.2 + (i % 5) as f64 * 0.1),
            ("signal_strength", 75.0 + (i % 20) as f64),
            ("signal_confidence", 70.0 + (i % 15) as f64),
            ("signal_source_count", 2.0),
            ("session_utcHour", (i % 24) as f64),
            ("exec_streakMultiplier", 1.0 + (i % 3) as f64 * 0.1),
        ];
        for (name, value) in numbers {
            row.columns
                .insert(name.to_string(), CellValue::Number(value));
        }
        row.columns.insert(
            "signal_hasWhaleSignal".to_string(),
            CellValue::Bool(i % 4 == 0),
        );
        let direction = if i % 2 == 0 { "long" } else { "short" };
        row.columns
            .insert("signal_direction".to_string(), CellValue::Text(direction.into()));
        let volatility = ["low", "normal", "high"][i % 3];
        row.columns.insert(
            "regime_volatilityRegime".to_string(),
            CellValue::Text(volatility.into()),
        );
        let regime = ["bearish", "neutral", "bullish"][i % 3];
        row.columns
            .insert("regime_marketRegime".to_string(), CellValue::Text(regime.into()));
        row
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::trade_row;
    use super::*;

    #[test]
    fn encodings_use_neutral_defaults() {
        assert_eq!(Encoding::VolatilityLevel.encode(None), 1.0);
        assert_eq!(Encoding::VolatilityLevel.encode(Some("LOW")), 0.0);
        assert_eq!(Encoding::MarketRegimeNum.encode(Some("sideways")), 0.0);
        assert_eq!(Encoding::MarketRegimeNum.encode(Some("bearish")), -1.0);
        assert_eq!(Encoding::DirectionNum.encode(Some("long")), 1.0);
        assert_eq!(Encoding::DirectionNum.encode(Some("short")), 0.0);
        assert_eq!(Encoding::VolatilityHigh.encode(Some("extreme")), 1.0);
    }

    #[test]
    fn clip_outliers_caps_extreme_values() {
        let mut values: Vec<Option<f64>> = (0..200).map(|i| Some((i % 10) as f64)).collect();
        values.push(Some(1_000.0));
        values.push(None);
        assert!(clip_outliers(&mut values));
        let max = values.iter().flatten().copied().fold(f64::MIN, f64::max);
        assert!(max < 1_000.0);
        assert!(values.last().unwrap().is_none());
    }

    #[test]
    fn clip_outliers_skips_constant_columns() {
        let mut values = vec![Some(2.0); 50];
        assert!(!clip_outliers(&mut values));
        assert!(values.iter().all(|v| *v == Some(2.0)));
    }

    #[test]
    fn quantile_interpolates_linearly() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert!((quantile_sorted(&sorted, 0.5) - 2.5).abs() < 1e-12);
        assert_eq!(quantile_sorted(&sorted, 1.0), 4.0);
        assert_eq!(quantile_sorted(&[], 0.5), 0.0);
    }

    #[test]
    fn optional_columns_appear_only_when_populated() {
        let mut rows: Vec<FlatRow> = (0..20).map(|i| trade_row(i, "BTC")).collect();
        let matrix = build_for_target(Target::SignalQuality, &rows, &[]).unwrap();
        assert!(!matrix.feature_names.iter().any(|c| c == "market_rsi14"));

        rows[5]
            .columns
            .insert("market_rsi14".to_string(), CellValue::Number(71.0));
        let matrix = build_for_target(Target::SignalQuality, &rows, &[]).unwrap();
        let idx = matrix
            .feature_names
            .iter()
            .position(|c| c == "market_rsi14")
            .unwrap();
        assert_eq!(matrix.rows[5][idx], 71.0);
        assert_eq!(matrix.rows[4][idx], 0.0);
    }

    #[test]
    fn rows_without_label_are_excluded() {
        let mut rows: Vec<FlatRow> = (0..10).map(|i| trade_row(i, "BTC")).collect();
        rows[3].label_profitable = None;
        let matrix = build_for_target(Target::SignalQuality, &rows, &[]).unwrap();
        assert_eq!(matrix.len(), 9);
        assert_eq!(matrix.labels.len(), 9);
        assert!(matrix.timestamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn asset_dummies_require_two_assets() {
        let rows: Vec<FlatRow> = (0..10).map(|i| trade_row(i, "BTC")).collect();
        let matrix = build_for_target(Target::SignalQuality, &rows, &[]).unwrap();
        assert!(!matrix.feature_names.iter().any(|c| c.starts_with(ASSET_DUMMY_PREFIX)));

        let rows: Vec<FlatRow> = (0..10)
            .map(|i| trade_row(i, if i % 2 == 0 { "BTC" } else { "ETH" }))
            .collect();
        let matrix = build_for_target(Target::SignalQuality, &rows, &[]).unwrap();
        let btc = matrix
            .feature_names
            .iter()
            .position(|c| c == "asset_BTC")
            .unwrap();
        assert_eq!(matrix.rows[0][btc], 1.0);
        assert_eq!(matrix.rows[1][btc], 0.0);
    }

    #[test]
    fn macro_risk_is_one_hot_encoded() {
        let mut rows: Vec<FlatRow> = (0..6).map(|i| trade_row(i, "BTC")).collect();
        rows[0].columns.insert(
            MACRO_RISK_SOURCE.to_string(),
            CellValue::Text("risk_on".into()),
        );
        rows[1].columns.insert(
            MACRO_RISK_SOURCE.to_string(),
            CellValue::Text("risk_off".into()),
        );
        let matrix = build_for_target(Target::PositionSizing, &rows, &[]).unwrap();
        let on = matrix
            .feature_names
            .iter()
            .position(|c| c == "news_macro_risk_on")
            .unwrap();
        let off = matrix
            .feature_names
            .iter()
            .position(|c| c == "news_macro_risk_off")
            .unwrap();
        assert_eq!((matrix.rows[0][on], matrix.rows[0][off]), (1.0, 0.0));
        assert_eq!((matrix.rows[1][on], matrix.rows[1][off]), (0.0, 1.0));
        assert_eq!((matrix.rows[2][on], matrix.rows[2][off]), (0.0, 0.0));
    }

    #[test]
    fn text_columns_are_never_features() {
        let rows: Vec<FlatRow> = (0..6).map(|i| trade_row(i, "BTC")).collect();
        let matrix = build_for_target(Target::TpOptimizer, &rows, &[]).unwrap();
        assert!(!matrix.feature_names.iter().any(|c| c == "signal_direction"));
        assert!(matrix.feature_names.iter().any(|c| c == "signal_direction_num"));
        let unique: HashSet<&String> = matrix.feature_names.iter().collect();
        assert_eq!(unique.len(), matrix.feature_names.len());
    }
}
