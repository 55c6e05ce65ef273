//! Improvement report: what the fitted models say about the trading logic, and which
//! inputs are worth collecting next. Written as JSON (embedded in the run metadata) and
//! as Markdown.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use log::info;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Capabilities;
use crate::explain::{Explanation, FeatureImportance, InteractionPair};
use crate::features::quantile_sorted;
use crate::metrics::{self, PlattCalibration};
use crate::models::{FlatRow, Target};
use crate::validation::{HoldoutEvaluation, HoldoutMetrics, WalkForwardSummary};

pub const REPORT_FILE: &str = "improvement_report.md";
pub const SPARSE_COVERAGE: f64 = 0.2;
pub const MIN_PROFITABLE_FOR_TUNING: usize = 20;
pub const TUNING_QUANTILE: f64 = 0.25;
const TOP_FEATURES_IN_MARKDOWN: usize = 10;
const UNKNOWN: &str = "unknown";

/// Inputs known to carry signal when upstream populates them.
pub struct SignalFactor {
    pub column: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

pub const KNOWN_SIGNAL_FACTORS: [SignalFactor; 12] = [
    SignalFactor {
        column: "market_fundingDelta",
        name: "funding_delta",
        description: "Change in funding rate; shows crowd positioning shifting before price moves.",
    },
    SignalFactor {
        column: "market_oiChange24h",
        name: "open_interest_change",
        description: "24h open interest change; separates new positioning from short covering.",
    },
    SignalFactor {
        column: "market_bookImbalance",
        name: "order_book_imbalance",
        description: "Bid/ask depth imbalance; short-horizon pressure at entry.",
    },
    SignalFactor {
        column: "market_bidAskSpread",
        name: "bid_ask_spread",
        description: "Spread at entry; proxies liquidity and slippage risk.",
    },
    SignalFactor {
        column: "market_rsi14",
        name: "rsi_14",
        description: "Momentum oscillator; flags entries into stretched moves.",
    },
    SignalFactor {
        column: "market_dvol",
        name: "implied_volatility",
        description: "Options implied volatility index; anticipates range expansion.",
    },
    SignalFactor {
        column: "market_fearGreedIndex",
        name: "fear_greed_index",
        description: "Aggregate sentiment gauge; contrarian context at extremes.",
    },
    SignalFactor {
        column: "signal_avg_sentiment",
        name: "source_sentiment",
        description: "Mean sentiment across contributing signal sources.",
    },
    SignalFactor {
        column: "news_macroRiskEnvironment",
        name: "macro_risk_environment",
        description: "Risk-on/risk-off macro regime from news flow.",
    },
    SignalFactor {
        column: "news_nasdaqChange",
        name: "nasdaq_change",
        description: "Equity index move; crypto often follows risk appetite in equities.",
    },
    SignalFactor {
        column: "news_etfFlowBtc",
        name: "btc_etf_flow",
        description: "Spot ETF net flow; persistent institutional demand or supply.",
    },
    SignalFactor {
        column: "signal_xSentimentScore",
        name: "x_sentiment",
        description: "Social sentiment score; early read on retail crowding.",
    },
];

#[derive(Debug, Clone, Serialize)]
pub struct SignalFactorSuggestion {
    pub name: String,
    pub reason: String,
    pub description: String,
    pub coverage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataSummary {
    pub total_records: usize,
    pub trades_with_outcomes: usize,
    pub profitable_trades: usize,
    pub win_rate: Option<f64>,
    pub assets: BTreeMap<String, usize>,
    pub first_trade_at: Option<String>,
    pub last_trade_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WinRate {
    pub win_rate: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentPerformance {
    pub by_asset: BTreeMap<String, WinRate>,
    pub by_volatility_regime: BTreeMap<String, WinRate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SuggestedTuning {
    pub min_strength: i64,
    pub min_confidence: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetImportance {
    pub feature_importances: BTreeMap<String, f64>,
    pub top_features: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_abs_attribution: Option<BTreeMap<String, f64>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub interactions: Vec<InteractionPair>,
}

impl TargetImportance {
    fn from_explanation(explanation: &Explanation) -> Self {
        let to_map = |items: &[FeatureImportance]| -> BTreeMap<String, f64> {
            items
                .iter()
                .map(|item| (item.feature.clone(), item.importance))
                .collect()
        };
        Self {
            feature_importances: to_map(&explanation.feature_importances),
            top_features: explanation
                .feature_importances
                .iter()
                .take(TOP_FEATURES_IN_MARKDOWN)
                .map(|item| item.feature.clone())
                .collect(),
            mean_abs_attribution: explanation.mean_abs_attribution.as_deref().map(to_map),
            interactions: explanation.interactions.clone(),
        }
    }
}

/// What one fitted target contributes to the report.
#[derive(Debug, Clone)]
pub struct TargetInsights {
    pub target: Target,
    pub explanation: Explanation,
    pub holdout: Option<HoldoutEvaluation>,
    pub walk_forward: Option<WalkForwardSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImprovementReport {
    pub generated_at: String,
    pub data_summary: DataSummary,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub holdout_metrics: BTreeMap<String, HoldoutMetrics>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub walk_forward: BTreeMap<String, WalkForwardSummary>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub feature_importances: BTreeMap<String, TargetImportance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_signal_quality_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_quality_threshold_f1: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_quality_calibration: Option<PlattCalibration>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tp_level_performance: BTreeMap<String, WinRate>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub decision_driver_summary: BTreeMap<String, BTreeMap<String, usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_performance: Option<SegmentPerformance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_tuning: Option<SuggestedTuning>,
    pub suggested_signal_factors: Vec<SignalFactorSuggestion>,
}

impl ImprovementReport {
    /// Report for runs with too little labeled data to train: data summary and gap list.
    pub fn degenerate(rows: &[FlatRow]) -> Self {
        Self {
            generated_at: Utc::now().to_rfc3339(),
            data_summary: data_summary(rows),
            holdout_metrics: BTreeMap::new(),
            walk_forward: BTreeMap::new(),
            feature_importances: BTreeMap::new(),
            suggested_signal_quality_threshold: None,
            signal_quality_threshold_f1: None,
            signal_quality_calibration: None,
            tp_level_performance: BTreeMap::new(),
            decision_driver_summary: BTreeMap::new(),
            segment_performance: None,
            suggested_tuning: None,
            suggested_signal_factors: suggested_signal_factors(rows),
        }
    }

    pub fn build(
        rows: &[FlatRow],
        insights: &[TargetInsights],
        capabilities: &Capabilities,
    ) -> Self {
        let mut report = Self::degenerate(rows);

        for insight in insights {
            let name = insight.target.name().to_string();
            report.feature_importances.insert(
                name.clone(),
                TargetImportance::from_explanation(&insight.explanation),
            );
            if let Some(holdout) = &insight.holdout {
                report
                    .holdout_metrics
                    .insert(name.clone(), holdout.metrics.clone());
            }
            if let Some(walk_forward) = &insight.walk_forward {
                report.walk_forward.insert(name, walk_forward.clone());
            }
        }

        let signal_holdout = insights
            .iter()
            .find(|insight| insight.target == Target::SignalQuality)
            .and_then(|insight| insight.holdout.as_ref());
        if let Some(holdout) = signal_holdout {
            let choice = metrics::best_f1_threshold(&holdout.labels, &holdout.predictions);
            if let Some(choice) = choice {
                report.suggested_signal_quality_threshold = Some(choice.threshold);
                report.signal_quality_threshold_f1 = Some(choice.f1);
            }
            if capabilities.calibration {
                report.signal_quality_calibration =
                    PlattCalibration::fit(&holdout.predictions, &holdout.labels);
            }
        }

        report.tp_level_performance = tp_level_performance(rows);
        report.decision_driver_summary = decision_driver_summary(rows);
        report.segment_performance = segment_performance(rows);
        report.suggested_tuning = suggested_tuning(rows);
        report
    }

    pub fn to_markdown(&self) -> String {
        render_markdown(self)
    }
}

fn format_timestamp(ms: i64) -> Option<String> {
    Utc.timestamp_millis_opt(ms).single().map(|dt| dt.to_rfc3339())
}

pub fn data_summary(rows: &[FlatRow]) -> DataSummary {
    let resolved: Vec<bool> = rows.iter().filter_map(|row| row.label_profitable).collect();
    let profitable = resolved.iter().filter(|p| **p).count();
    let mut assets: BTreeMap<String, usize> = BTreeMap::new();
    for row in rows {
        *assets.entry(row.asset.clone()).or_default() += 1;
    }
    DataSummary {
        total_records: rows.len(),
        trades_with_outcomes: resolved.len(),
        profitable_trades: profitable,
        win_rate: (!resolved.is_empty()).then(|| profitable as f64 / resolved.len() as f64),
        assets,
        first_trade_at: rows.iter().map(|r| r.timestamp).min().and_then(format_timestamp),
        last_trade_at: rows.iter().map(|r| r.timestamp).max().and_then(format_timestamp),
    }
}

/// Known-useful inputs absent from the data or present in fewer than 20% of rows.
pub fn suggested_signal_factors(rows: &[FlatRow]) -> Vec<SignalFactorSuggestion> {
    KNOWN_SIGNAL_FACTORS
        .iter()
        .filter_map(|factor| {
            let present = rows.iter().filter(|row| row.get(factor.column).is_some()).count();
            let coverage = if rows.is_empty() {
                0.0
            } else {
                present as f64 / rows.len() as f64
            };
            if coverage >= SPARSE_COVERAGE {
                return None;
            }
            let reason = if present == 0 {
                format!("{} is never populated", factor.column)
            } else {
                format!(
                    "{} is populated in only {:.0}% of records",
                    factor.column,
                    coverage * 100.0
                )
            };
            Some(SignalFactorSuggestion {
                name: factor.name.to_string(),
                reason,
                description: factor.description.to_string(),
                coverage,
            })
        })
        .collect()
}

#[derive(Default)]
struct Tally {
    wins: usize,
    count: usize,
}

impl Tally {
    fn add(&mut self, profitable: bool) {
        self.count += 1;
        if profitable {
            self.wins += 1;
        }
    }

    fn finish(&self) -> WinRate {
        WinRate {
            win_rate: metrics::round_to(self.wins as f64 / self.count.max(1) as f64, 4),
            count: self.count,
        }
    }
}

fn win_rates<K, F>(rows: &[FlatRow], key: F) -> BTreeMap<String, WinRate>
where
    K: Into<String>,
    F: Fn(&FlatRow) -> Option<K>,
{
    let mut tallies: BTreeMap<String, Tally> = BTreeMap::new();
    for row in rows {
        if let (Some(profitable), Some(key)) = (row.label_profitable, key(row)) {
            tallies.entry(key.into()).or_default().add(profitable);
        }
    }
    tallies
        .into_iter()
        .map(|(key, tally)| (key, tally.finish()))
        .collect()
}

/// Win rate and count per optimal TP tier. Trades are grouped by their realized best tier
/// label, not by a model prediction.
pub fn tp_level_performance(rows: &[FlatRow]) -> BTreeMap<String, WinRate> {
    win_rates(rows, |row| row.label_optimal_tp_level.map(|tier| tier.to_string()))
}

/// Driver frequencies per trade direction.
pub fn decision_driver_summary(rows: &[FlatRow]) -> BTreeMap<String, BTreeMap<String, usize>> {
    let mut summary: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
    for row in rows {
        if row.decision_drivers.is_empty() {
            continue;
        }
        let direction = row
            .direction()
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| UNKNOWN.to_string());
        let counts = summary.entry(direction).or_default();
        for driver in &row.decision_drivers {
            *counts.entry(driver.clone()).or_default() += 1;
        }
    }
    summary
}

pub fn segment_performance(rows: &[FlatRow]) -> Option<SegmentPerformance> {
    let by_asset = win_rates(rows, |row| Some(row.asset.clone()));
    if by_asset.is_empty() {
        return None;
    }
    let by_volatility_regime = win_rates(rows, |row| {
        Some(
            row.text("regime_volatilityRegime")
                .map(|v| v.trim().to_ascii_lowercase())
                .unwrap_or_else(|| UNKNOWN.to_string()),
        )
    });
    Some(SegmentPerformance {
        by_asset,
        by_volatility_regime,
    })
}

/// 25th percentile of profitable trades' strength and confidence, when at least 20
/// profitable trades carry both.
pub fn suggested_tuning(rows: &[FlatRow]) -> Option<SuggestedTuning> {
    let profitable: Vec<(f64, f64)> = rows
        .iter()
        .filter(|row| row.label_profitable == Some(true))
        .filter_map(|row| {
            Some((
                row.number("signal_strength")?,
                row.number("signal_confidence")?,
            ))
        })
        .collect();
    if profitable.len() < MIN_PROFITABLE_FOR_TUNING {
        return None;
    }
    let threshold = |mut values: Vec<f64>| -> i64 {
        values.sort_by(|a, b| a.total_cmp(b));
        quantile_sorted(&values, TUNING_QUANTILE).round().clamp(0.0, 100.0) as i64
    };
    Some(SuggestedTuning {
        min_strength: threshold(profitable.iter().map(|(s, _)| *s).collect()),
        min_confidence: threshold(profitable.iter().map(|(_, c)| *c).collect()),
    })
}

fn percent(value: f64) -> String {
    format!("{:.1}%", value * 100.0)
}

pub fn render_markdown(report: &ImprovementReport) -> String {
    let mut md = String::new();
    let summary = &report.data_summary;
    let _ = writeln!(md, "# Improvement report");
    let _ = writeln!(md);
    let _ = writeln!(md, "Generated {}", report.generated_at);
    let _ = writeln!(md);

    let _ = writeln!(md, "## Data summary");
    let _ = writeln!(md);
    let _ = writeln!(md, "- Records: {}", summary.total_records);
    let _ = writeln!(md, "- Trades with outcomes: {}", summary.trades_with_outcomes);
    if let Some(win_rate) = summary.win_rate {
        let _ = writeln!(
            md,
            "- Win rate: {} ({} profitable)",
            percent(win_rate),
            summary.profitable_trades
        );
    }
    if let (Some(first), Some(last)) = (&summary.first_trade_at, &summary.last_trade_at) {
        let _ = writeln!(md, "- Span: {first} to {last}");
    }
    if !summary.assets.is_empty() {
        let assets: Vec<String> = summary
            .assets
            .iter()
            .map(|(asset, count)| format!("{asset} ({count})"))
            .collect();
        let _ = writeln!(md, "- Assets: {}", assets.join(", "));
    }
    let _ = writeln!(md);

    if !report.holdout_metrics.is_empty() {
        let _ = writeln!(md, "## Holdout metrics");
        let _ = writeln!(md);
        let _ = writeln!(
            md,
            "Fresh models fit on the first 80% of each target, scored on the last 20%."
        );
        let _ = writeln!(md);
        for (target, holdout) in &report.holdout_metrics {
            let _ = writeln!(
                md,
                "- **{target}** ({} train / {} test): {}",
                holdout.train_rows,
                holdout.holdout_rows,
                crate::validation::format_metrics(&holdout.values)
            );
        }
        let _ = writeln!(md);
    }

    if !report.walk_forward.is_empty() {
        let _ = writeln!(md, "## Walk-forward validation");
        let _ = writeln!(md);
        for (target, summary) in &report.walk_forward {
            let mean = summary.mean.map(|v| format!("{v:.4}")).unwrap_or_else(|| "n/a".into());
            let std = summary.std.map(|v| format!("{v:.4}")).unwrap_or_else(|| "n/a".into());
            let _ = writeln!(
                md,
                "- **{target}**: {} mean {mean} (std {std}) over {} folds, purge gap {}",
                summary.metric,
                summary.folds.len(),
                summary.config.purge_gap
            );
        }
        let _ = writeln!(md);
    }

    if report.suggested_signal_quality_threshold.is_some()
        || report.signal_quality_calibration.is_some()
    {
        let _ = writeln!(md, "## Signal quality operating point");
        let _ = writeln!(md);
        if let Some(threshold) = report.suggested_signal_quality_threshold {
            let f1 = report.signal_quality_threshold_f1.unwrap_or_default();
            let _ = writeln!(
                md,
                "- Suggested probability threshold: {threshold:.2} (holdout F1 {f1:.3})"
            );
        }
        if let Some(calibration) = report.signal_quality_calibration {
            let _ = writeln!(
                md,
                "- Calibration: p' = 1 / (1 + exp(-({:.4} * p + {:.4})))",
                calibration.scale, calibration.intercept
            );
        }
        let _ = writeln!(md);
    }

    if !report.feature_importances.is_empty() {
        let _ = writeln!(md, "## Feature importances");
        let _ = writeln!(md);
        for (target, importance) in &report.feature_importances {
            let _ = writeln!(md, "### {target}");
            let _ = writeln!(md);
            for feature in &importance.top_features {
                let value = importance
                    .feature_importances
                    .get(feature)
                    .copied()
                    .unwrap_or_default();
                let _ = writeln!(md, "- {feature}: {}", percent(value));
            }
            if let Some(pair) = importance.interactions.first() {
                let _ = writeln!(
                    md,
                    "- Strongest interaction: {} x {} ({})",
                    pair.first,
                    pair.second,
                    percent(pair.strength)
                );
            }
            let _ = writeln!(md);
        }
    }

    if !report.tp_level_performance.is_empty() {
        let _ = writeln!(md, "## Win rate by optimal TP level");
        let _ = writeln!(md);
        let _ = writeln!(md, "| Level | Win rate | Trades |");
        let _ = writeln!(md, "|---|---|---|");
        for (level, stats) in &report.tp_level_performance {
            let _ = writeln!(md, "| {level} | {} | {} |", percent(stats.win_rate), stats.count);
        }
        let _ = writeln!(md);
    }

    if let Some(segments) = &report.segment_performance {
        let _ = writeln!(md, "## Segment performance");
        let _ = writeln!(md);
        for (label, group) in [
            ("Asset", &segments.by_asset),
            ("Volatility regime", &segments.by_volatility_regime),
        ] {
            for (key, stats) in group {
                let _ = writeln!(
                    md,
                    "- {label} {key}: {} over {} trades",
                    percent(stats.win_rate),
                    stats.count
                );
            }
        }
        let _ = writeln!(md);
    }

    if !report.decision_driver_summary.is_empty() {
        let _ = writeln!(md, "## Decision drivers");
        let _ = writeln!(md);
        for (direction, drivers) in &report.decision_driver_summary {
            let mut ordered: Vec<(&String, &usize)> = drivers.iter().collect();
            ordered.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            let listed: Vec<String> = ordered
                .iter()
                .take(TOP_FEATURES_IN_MARKDOWN)
                .map(|(driver, count)| format!("{driver} ({count})"))
                .collect();
            let _ = writeln!(md, "- **{direction}**: {}", listed.join(", "));
        }
        let _ = writeln!(md);
    }

    if let Some(tuning) = report.suggested_tuning {
        let _ = writeln!(md, "## Suggested tuning");
        let _ = writeln!(md);
        let _ = writeln!(
            md,
            "- Minimum signal strength {} and confidence {} (25th percentile of profitable trades)",
            tuning.min_strength, tuning.min_confidence
        );
        let _ = writeln!(md);
    }

    let _ = writeln!(md, "## Signal factors to collect");
    let _ = writeln!(md);
    if report.suggested_signal_factors.is_empty() {
        let _ = writeln!(md, "All known signal factors are populated in at least 20% of records.");
    } else {
        for factor in &report.suggested_signal_factors {
            let _ = writeln!(
                md,
                "- **{}**: {}. {}",
                factor.name, factor.reason, factor.description
            );
        }
    }
    md
}

pub fn write_markdown(dir: &Path, report: &ImprovementReport) -> Result<PathBuf> {
    let path = dir.join(REPORT_FILE);
    fs::write(&path, report.to_markdown())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote {}", path.display());
    Ok(path)
}
