use log::{debug, warn};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::models::{CellValue, FlatRow};

/// Market columns that receive lag and rolling companions.
pub const LAG_SOURCE_COLUMNS: [&str; 5] = [
    "market_priceChange24h",
    "market_volumeRatio",
    "market_fundingPercentile",
    "market_longShortRatio",
    "market_atrPct",
];
pub const LAG_DEPTHS: [usize; 3] = [1, 2, 3];
pub const ROLLING_WINDOW: usize = 3;

pub fn lag_column(source: &str, depth: usize) -> String {
    format!("{source}_lag{depth}")
}

pub fn rolling_column(source: &str) -> String {
    format!("{source}_roll{ROLLING_WINDOW}")
}

/// True for any column produced by [`add_lag_features`].
pub fn is_lag_column(column: &str) -> bool {
    LAG_SOURCE_COLUMNS.iter().any(|source| {
        column
            .strip_prefix(source)
            .map(|suffix| {
                suffix == format!("_roll{ROLLING_WINDOW}")
                    || LAG_DEPTHS
                        .iter()
                        .any(|depth| suffix == format!("_lag{depth}"))
            })
            .unwrap_or(false)
    })
}

/// Adds `{col}_lag{k}` and `{col}_roll3` columns computed strictly from earlier rows of the
/// same asset (or of the whole stream when only one asset is present).
///
/// Rows must already be in chronological order; otherwise nothing is added.
/// Returns the names of the lag/rolling columns that can appear.
pub fn add_lag_features(rows: &mut [FlatRow]) -> Vec<String> {
    if rows.is_empty() {
        return Vec::new();
    }
    if rows.windows(2).any(|pair| pair[0].timestamp > pair[1].timestamp) {
        warn!("Lag features skipped: rows are not in chronological order");
        return Vec::new();
    }

    let sources: Vec<&str> = LAG_SOURCE_COLUMNS
        .iter()
        .copied()
        .filter(|source| rows.iter().any(|row| row.number(source).is_some()))
        .collect();
    if sources.is_empty() {
        return Vec::new();
    }

    let assets: HashSet<&str> = rows.iter().map(|row| row.asset.as_str()).collect();
    let per_asset = assets.len() > 1;
    debug!(
        "Computing lag features for {} column(s) ({})",
        sources.len(),
        if per_asset { "per asset" } else { "global" }
    );

    // Most recent value first; `None` keeps the slot when the prior row lacked the column.
    let mut history: HashMap<String, Vec<VecDeque<Option<f64>>>> = HashMap::new();

    for row in rows.iter_mut() {
        let key = if per_asset {
            row.asset.clone()
        } else {
            String::new()
        };
        let slots = history
            .entry(key)
            .or_insert_with(|| vec![VecDeque::with_capacity(ROLLING_WINDOW); sources.len()]);

        let mut derived: Vec<(String, f64)> = Vec::new();
        for (source, prior) in sources.iter().zip(slots.iter()) {
            for depth in LAG_DEPTHS {
                if let Some(Some(value)) = prior.get(depth - 1) {
                    derived.push((lag_column(source, depth), *value));
                }
            }
            let window: Vec<f64> = prior.iter().take(ROLLING_WINDOW).flatten().copied().collect();
            if window.len() == ROLLING_WINDOW {
                let mean = window.iter().sum::<f64>() / ROLLING_WINDOW as f64;
                derived.push((rolling_column(source), mean));
            }
        }

        for (source, prior) in sources.iter().zip(slots.iter_mut()) {
            prior.push_front(row.number(source));
            prior.truncate(ROLLING_WINDOW.max(LAG_DEPTHS.len()));
        }

        for (column, value) in derived {
            row.columns.insert(column, CellValue::Number(value));
        }
    }

    sources
        .iter()
        .flat_map(|source| {
            LAG_DEPTHS
                .iter()
                .map(move |depth| lag_column(source, *depth))
                .chain(std::iter::once(rolling_column(source)))
        })
        .collect()
}
