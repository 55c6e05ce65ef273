use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single flattened cell. Nulls are never stored; an absent key means "missing".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl CellValue {
    /// Numeric view used by the feature builders. Booleans cast to 0/1, text has no numeric value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Number(value) if value.is_finite() => Some(*value),
            CellValue::Number(_) => None,
            CellValue::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
            CellValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, CellValue::Bool(_))
    }
}

/// One trade record projected onto namespaced scalar columns plus the four label fields.
#[derive(Debug, Clone, Default)]
pub struct FlatRow {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub asset: String,
    pub columns: BTreeMap<String, CellValue>,
    pub decision_drivers: Vec<String>,
    pub label_profitable: Option<bool>,
    pub label_r_multiple: Option<f64>,
    pub label_optimal_tp_level: Option<i64>,
    pub label_max_adverse_excursion: Option<f64>,
}

impl FlatRow {
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.columns.get(column)
    }

    pub fn number(&self, column: &str) -> Option<f64> {
        self.columns.get(column).and_then(CellValue::as_f64)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.columns.get(column).and_then(CellValue::as_str)
    }

    pub fn direction(&self) -> Option<&str> {
        self.text("signal_direction")
    }

    pub fn has_outcome(&self) -> bool {
        self.label_profitable.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Binary,
    Regression,
    Multiclass,
    Quantile,
}

impl TaskKind {
    pub fn is_classifier(self) -> bool {
        matches!(self, TaskKind::Binary | TaskKind::Multiclass)
    }
}

/// The four learning problems derived from one trade stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    SignalQuality,
    PositionSizing,
    TpOptimizer,
    SlOptimizer,
}

impl Target {
    pub const ALL: [Target; 4] = [
        Target::SignalQuality,
        Target::PositionSizing,
        Target::TpOptimizer,
        Target::SlOptimizer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Target::SignalQuality => "signal_quality",
            Target::PositionSizing => "position_sizing",
            Target::TpOptimizer => "tp_optimizer",
            Target::SlOptimizer => "sl_optimizer",
        }
    }

    pub fn label_column(self) -> &'static str {
        match self {
            Target::SignalQuality => "label_profitable",
            Target::PositionSizing => "label_rMultiple",
            Target::TpOptimizer => "label_optimalTpLevel",
            Target::SlOptimizer => "label_maxAdverseExcursion",
        }
    }

    pub fn task(self) -> TaskKind {
        match self {
            Target::SignalQuality => TaskKind::Binary,
            Target::PositionSizing => TaskKind::Regression,
            Target::TpOptimizer => TaskKind::Multiclass,
            Target::SlOptimizer => TaskKind::Quantile,
        }
    }

    /// Raw (unclipped, unencoded) label for a row, or `None` when unresolved.
    pub fn label(self, row: &FlatRow) -> Option<f64> {
        let value = match self {
            Target::SignalQuality => row
                .label_profitable
                .map(|profitable| if profitable { 1.0 } else { 0.0 }),
            Target::PositionSizing => row.label_r_multiple,
            Target::TpOptimizer => row.label_optimal_tp_level.map(|tier| tier as f64),
            Target::SlOptimizer => row.label_max_adverse_excursion,
        };
        value.filter(|v| v.is_finite())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
