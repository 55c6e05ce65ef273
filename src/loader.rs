use anyhow::{anyhow, Context, Result};
use chrono::DateTime;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::models::{CellValue, FlatRow};

pub const REAL_FILE_PREFIX: &str = "features_";
pub const SYNTHETIC_FILE_PREFIX: &str = "synthetic_";
pub const COMBINED_FILE_NAME: &str = "combined.jsonl";
const RECORD_EXTENSION: &str = ".jsonl";
const UNKNOWN_ASSET: &str = "UNKNOWN";

/// Keys handled explicitly rather than flattened into feature columns.
const RESERVED_KEYS: [&str; 5] = ["id", "timestamp", "asset", "labels", "decisionDrivers"];

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadSummary {
    pub files_loaded: usize,
    pub lines_read: usize,
    pub records_parsed: usize,
    pub malformed_lines: usize,
    pub missing_keys: usize,
    pub bad_timestamps: usize,
    pub duplicate_ids: usize,
}

impl LoadSummary {
    pub fn dropped(&self) -> usize {
        self.malformed_lines + self.missing_keys + self.bad_timestamps + self.duplicate_ids
    }
}

#[derive(Debug, Clone)]
pub struct LoadedDataset {
    pub rows: Vec<FlatRow>,
    pub summary: LoadSummary,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotAnObject,
    MissingId,
    MissingTimestamp,
    BadTimestamp,
}

/// Resolve the JSONL files to read. A file path is used as-is; a directory contributes
/// `features_*.jsonl`, then (unless excluded) `synthetic_*.jsonl`, then `combined.jsonl`.
pub fn resolve_input_files(path: &Path, exclude_synthetic: bool) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(anyhow!("Input path {} does not exist", path.display()));
    }

    let mut real = Vec::new();
    let mut synthetic = Vec::new();
    let mut combined = None;
    let entries =
        fs::read_dir(path).with_context(|| format!("Failed to list {}", path.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to list {}", path.display()))?;
        let file_path = entry.path();
        if !file_path.is_file() {
            continue;
        }
        let Some(name) = file_path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !name.ends_with(RECORD_EXTENSION) {
            continue;
        }
        if name == COMBINED_FILE_NAME {
            combined = Some(file_path.clone());
        } else if name.starts_with(REAL_FILE_PREFIX) {
            real.push(file_path.clone());
        } else if name.starts_with(SYNTHETIC_FILE_PREFIX) {
            synthetic.push(file_path.clone());
        }
    }

    real.sort();
    synthetic.sort();
    let mut files = real;
    if exclude_synthetic {
        if !synthetic.is_empty() {
            info!("Excluding {} synthetic feature file(s)", synthetic.len());
        }
    } else {
        files.extend(synthetic);
    }
    files.extend(combined);

    if files.is_empty() {
        return Err(anyhow!("No feature files found in {}", path.display()));
    }
    Ok(files)
}

/// Read, flatten and chronologically sort every record under `path`.
pub fn load_dataset(path: &Path, exclude_synthetic: bool) -> Result<LoadedDataset> {
    let files = resolve_input_files(path, exclude_synthetic)?;
    let mut summary = LoadSummary::default();
    let mut rows = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();

    for file_path in &files {
        let file = File::open(file_path)
            .with_context(|| format!("Failed to open {}", file_path.display()))?;
        let reader = BufReader::new(file);
        let mut parsed_in_file = 0usize;

        for (line_idx, line) in reader.split(b'\n').enumerate() {
            let line =
                line.with_context(|| format!("Failed to read {}", file_path.display()))?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            summary.lines_read += 1;

            let value: Value = match serde_json::from_slice(&line) {
                Ok(value) => value,
                Err(err) => {
                    summary.malformed_lines += 1;
                    warn!(
                        "Skipping invalid JSON line {} in {}: {}",
                        line_idx + 1,
                        file_path.display(),
                        err
                    );
                    continue;
                }
            };

            match flatten_record(&value) {
                Ok(row) => {
                    if !seen_ids.insert(row.id.clone()) {
                        summary.duplicate_ids += 1;
                        debug!("Skipping duplicate record {}", row.id);
                        continue;
                    }
                    rows.push(row);
                    parsed_in_file += 1;
                }
                Err(SkipReason::BadTimestamp) => summary.bad_timestamps += 1,
                Err(SkipReason::NotAnObject) => summary.malformed_lines += 1,
                Err(SkipReason::MissingId) | Err(SkipReason::MissingTimestamp) => {
                    summary.missing_keys += 1
                }
            }
        }

        summary.files_loaded += 1;
        info!(
            "Loaded {} records from {}",
            parsed_in_file,
            file_path.display()
        );
    }

    // Stable: records sharing a timestamp keep file order.
    rows.sort_by_key(|row| row.timestamp);
    summary.records_parsed = rows.len();

    info!(
        "Flattened {} records from {} file(s); dropped {} \
         (malformed {}, missing id/timestamp {}, bad timestamp {}, duplicate {})",
        summary.records_parsed,
        summary.files_loaded,
        summary.dropped(),
        summary.malformed_lines,
        summary.missing_keys,
        summary.bad_timestamps,
        summary.duplicate_ids
    );

    if rows.is_empty() {
        return Err(anyhow!("No valid records found in {}", path.display()));
    }

    Ok(LoadedDataset {
        rows,
        summary,
        files,
    })
}

/// Project one raw trade record onto a [`FlatRow`].
pub fn flatten_record(value: &Value) -> Result<FlatRow, SkipReason> {
    let record = value.as_object().ok_or(SkipReason::NotAnObject)?;

    let id = match record.get("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => return Err(SkipReason::MissingId),
    };
    let timestamp = match record.get("timestamp") {
        None | Some(Value::Null) => return Err(SkipReason::MissingTimestamp),
        Some(raw) => parse_timestamp(raw).ok_or(SkipReason::BadTimestamp)?,
    };
    let asset = record
        .get("asset")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|asset| !asset.is_empty())
        .unwrap_or(UNKNOWN_ASSET)
        .to_string();

    let mut columns = BTreeMap::new();
    for (key, value) in record {
        if RESERVED_KEYS.contains(&key.as_str()) {
            continue;
        }
        flatten_value(column_prefix(key), value, &mut columns);
    }

    let mut row = FlatRow {
        id,
        timestamp,
        asset,
        columns,
        decision_drivers: collect_drivers(record.get("decisionDrivers")),
        ..FlatRow::default()
    };
    apply_labels(record, &mut row);
    Ok(row)
}

/// Accepts integer/float milliseconds, numeric strings and RFC 3339 strings.
pub fn parse_timestamp(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|v| v.is_finite()).map(|v| v as i64)),
        Value::String(text) => {
            let trimmed = text.trim();
            if let Ok(millis) = trimmed.parse::<i64>() {
                return Some(millis);
            }
            if let Ok(millis) = trimmed.parse::<f64>() {
                return millis.is_finite().then_some(millis as i64);
            }
            DateTime::parse_from_rfc3339(trimmed)
                .ok()
                .map(|parsed| parsed.timestamp_millis())
        }
        _ => None,
    }
}

fn column_prefix(group: &str) -> &str {
    match group {
        "execution" => "exec",
        other => other,
    }
}

fn flatten_value(path: &str, value: &Value, columns: &mut BTreeMap<String, CellValue>) {
    match value {
        Value::Null => {}
        Value::Bool(flag) => {
            columns.insert(path.to_string(), CellValue::Bool(*flag));
        }
        Value::Number(number) => {
            if let Some(value) = number.as_f64().filter(|v| v.is_finite()) {
                columns.insert(path.to_string(), CellValue::Number(value));
            }
        }
        Value::String(text) => {
            columns.insert(path.to_string(), CellValue::Text(text.clone()));
        }
        Value::Object(map) => {
            for (key, nested) in map {
                flatten_value(&format!("{path}_{key}"), nested, columns);
            }
        }
        Value::Array(items) => summarize_array(path, items, columns),
    }
}

struct ArrayColumns {
    count: String,
    avg_sentiment: String,
    max_sentiment: Option<String>,
    max_strength: Option<String>,
    sentiment_variance: Option<String>,
    mean: String,
}

fn array_columns(path: &str) -> ArrayColumns {
    match path {
        "signal_sources" => ArrayColumns {
            count: "signal_source_count".to_string(),
            avg_sentiment: "signal_avg_sentiment".to_string(),
            max_sentiment: None,
            max_strength: Some("signal_max_strength".to_string()),
            sentiment_variance: Some("signal_sentiment_variance".to_string()),
            mean: "signal_sources_mean".to_string(),
        },
        "news" => ArrayColumns {
            count: "news_item_count".to_string(),
            avg_sentiment: "news_avg_sentiment".to_string(),
            max_sentiment: Some("news_max_sentiment".to_string()),
            max_strength: None,
            sentiment_variance: None,
            mean: "news_mean".to_string(),
        },
        other => ArrayColumns {
            count: format!("{other}_count"),
            avg_sentiment: format!("{other}_avg_sentiment"),
            max_sentiment: None,
            max_strength: None,
            sentiment_variance: None,
            mean: format!("{other}_mean"),
        },
    }
}

/// Arrays collapse to a count; numeric items add a mean, objects with `sentiment` add
/// sentiment aggregates.
fn summarize_array(path: &str, items: &[Value], columns: &mut BTreeMap<String, CellValue>) {
    let names = array_columns(path);
    columns.insert(names.count, CellValue::Number(items.len() as f64));

    let numbers: Vec<f64> = items
        .iter()
        .filter_map(Value::as_f64)
        .filter(|v| v.is_finite())
        .collect();
    if !numbers.is_empty() {
        let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
        columns.insert(names.mean, CellValue::Number(mean));
    }

    let objects: Vec<&Map<String, Value>> = items.iter().filter_map(Value::as_object).collect();
    if objects.is_empty() {
        return;
    }
    let sentiments: Vec<f64> = objects
        .iter()
        .filter_map(|item| item.get("sentiment").and_then(Value::as_f64))
        .filter(|v| v.is_finite())
        .collect();
    if !sentiments.is_empty() {
        let count = sentiments.len() as f64;
        let mean = sentiments.iter().sum::<f64>() / count;
        columns.insert(names.avg_sentiment, CellValue::Number(mean));
        if let Some(name) = names.max_sentiment {
            let max = sentiments.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            columns.insert(name, CellValue::Number(max));
        }
        if let Some(name) = names.sentiment_variance {
            let variance = sentiments.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
            columns.insert(name, CellValue::Number(variance));
        }
    }
    if let Some(name) = names.max_strength {
        let max = objects
            .iter()
            .filter_map(|item| item.get("strength").and_then(Value::as_f64))
            .filter(|v| v.is_finite())
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))));
        if let Some(max) = max {
            columns.insert(name, CellValue::Number(max));
        }
    }
}

fn collect_drivers(raw: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(items)) = raw else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(driver) => Some(driver.trim().to_string()),
            Value::Object(map) => map
                .get("name")
                .and_then(Value::as_str)
                .map(|name| name.trim().to_string()),
            _ => None,
        })
        .filter(|driver| !driver.is_empty())
        .collect()
}

fn bool_field(map: &Map<String, Value>, key: &str) -> Option<bool> {
    match map.get(key)? {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_f64().map(|v| v > 0.5),
        _ => None,
    }
}

fn number_field(map: &Map<String, Value>, key: &str) -> Option<f64> {
    map.get(key)?.as_f64().filter(|v| v.is_finite())
}

fn apply_labels(record: &Map<String, Value>, row: &mut FlatRow) {
    let labels = record.get("labels").and_then(Value::as_object);
    let outcome = record.get("outcome").and_then(Value::as_object);

    row.label_profitable = labels
        .and_then(|labels| bool_field(labels, "profitable"))
        .or_else(|| outcome.and_then(|outcome| bool_field(outcome, "profitable")));
    row.label_r_multiple = labels.and_then(|labels| number_field(labels, "rMultiple"));
    row.label_optimal_tp_level = labels
        .and_then(|labels| number_field(labels, "optimalTpLevel"))
        .map(|tier| tier.round() as i64);
    row.label_max_adverse_excursion = labels
        .and_then(|labels| number_field(labels, "maxAdverseExcursion"))
        .or_else(|| {
            outcome
                .and_then(|outcome| number_field(outcome, "maxAdverseExcursion"))
                .map(f64::abs)
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn sample_record() -> Value {
        json!({
            "id": "rec-1",
            "timestamp": 1_700_000_000_000i64,
            "asset": "BTC",
            "market": { "priceChange24h": 0.5, "fundingRate": null },
            "signal": {
                "direction": "long",
                "sources": [
                    { "name": "funding", "sentiment": 0.4, "strength": 60 },
                    { "name": "whale", "sentiment": 0.8, "strength": 80 }
                ],
                "hasWhaleSignal": true
            },
            "execution": { "streakMultiplier": 1.1, "takeProfitDistancesPct": [1.0, 2.0, 3.0] },
            "outcome": { "profitable": false, "maxAdverseExcursion": -0.7 },
            "labels": { "profitable": true, "rMultiple": 1.5, "optimalTpLevel": 2 },
            "decisionDrivers": ["Funding extreme", "Whale buy"]
        })
    }

    #[test]
    fn flattens_groups_into_namespaced_columns() {
        let row = flatten_record(&sample_record()).unwrap();
        assert_eq!(row.id, "rec-1");
        assert_eq!(row.asset, "BTC");
        assert_eq!(row.number("market_priceChange24h"), Some(0.5));
        assert!(row.get("market_fundingRate").is_none());
        assert_eq!(row.direction(), Some("long"));
        assert_eq!(row.get("signal_hasWhaleSignal"), Some(&CellValue::Bool(true)));
        assert_eq!(row.number("exec_streakMultiplier"), Some(1.1));
        assert_eq!(row.number("exec_takeProfitDistancesPct_count"), Some(3.0));
        assert_eq!(row.number("exec_takeProfitDistancesPct_mean"), Some(2.0));
        assert_eq!(row.decision_drivers, vec!["Funding extreme", "Whale buy"]);
    }

    #[test]
    fn sentiment_bearing_sources_are_reduced() {
        let row = flatten_record(&sample_record()).unwrap();
        assert_eq!(row.number("signal_source_count"), Some(2.0));
        assert!((row.number("signal_avg_sentiment").unwrap() - 0.6).abs() < 1e-12);
        assert_eq!(row.number("signal_max_strength"), Some(80.0));
        assert!((row.number("signal_sentiment_variance").unwrap() - 0.04).abs() < 1e-12);
    }

    #[test]
    fn string_sources_only_produce_a_count() {
        let record = json!({
            "id": "a", "timestamp": 1, "signal": { "sources": ["funding", "whale", "oi"] }
        });
        let row = flatten_record(&record).unwrap();
        assert_eq!(row.number("signal_source_count"), Some(3.0));
        assert!(row.get("signal_avg_sentiment").is_none());
    }

    #[test]
    fn labels_prefer_label_group_then_outcome() {
        let row = flatten_record(&sample_record()).unwrap();
        assert_eq!(row.label_profitable, Some(true));
        assert_eq!(row.label_r_multiple, Some(1.5));
        assert_eq!(row.label_optimal_tp_level, Some(2));
        assert_eq!(row.label_max_adverse_excursion, Some(0.7));

        let record = json!({ "id": "b", "timestamp": 2, "outcome": { "profitable": true } });
        let row = flatten_record(&record).unwrap();
        assert_eq!(row.label_profitable, Some(true));
        assert_eq!(row.label_r_multiple, None);
    }

    #[test]
    fn labels_never_become_feature_columns() {
        let row = flatten_record(&sample_record()).unwrap();
        assert!(row.columns.keys().all(|key| !key.starts_with("labels")));
    }

    #[test]
    fn records_without_id_or_timestamp_are_rejected() {
        assert_eq!(
            flatten_record(&json!({ "timestamp": 1 })).unwrap_err(),
            SkipReason::MissingId
        );
        assert_eq!(
            flatten_record(&json!({ "id": "x", "timestamp": null })).unwrap_err(),
            SkipReason::MissingTimestamp
        );
        assert_eq!(
            flatten_record(&json!({ "id": "x", "timestamp": "yesterday" })).unwrap_err(),
            SkipReason::BadTimestamp
        );
        assert_eq!(flatten_record(&json!([1, 2])).unwrap_err(), SkipReason::NotAnObject);
    }

    #[test]
    fn timestamps_accept_strings() {
        assert_eq!(parse_timestamp(&json!("1700000000000")), Some(1_700_000_000_000));
        assert_eq!(
            parse_timestamp(&json!("2023-11-14T22:13:20Z")),
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn load_dataset_drops_bad_lines_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features_2024.jsonl");
        let mut file = File::create(&path).unwrap();
        writeln!(file, r#"{{"id":"late","timestamp":3000}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file, r#"{{"id":"early","timestamp":1000}}"#).unwrap();
        writeln!(file, r#"{{"timestamp":2000}}"#).unwrap();
        writeln!(file).unwrap();
        drop(file);

        let dataset = load_dataset(dir.path(), false).unwrap();
        let ids: Vec<&str> = dataset.rows.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
        assert_eq!(dataset.summary.lines_read, 4);
        assert_eq!(dataset.summary.malformed_lines, 1);
        assert_eq!(dataset.summary.missing_keys, 1);
        assert_eq!(dataset.summary.dropped(), 2);
    }

    #[test]
    fn directory_resolution_honours_synthetic_toggle() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "features_b.jsonl",
            "features_a.jsonl",
            "synthetic_a.jsonl",
            "combined.jsonl",
            "notes.txt",
        ] {
            fs::write(dir.path().join(name), "").unwrap();
        }

        let names = |files: Vec<PathBuf>| -> Vec<String> {
            files
                .iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
                .collect()
        };
        let all = names(resolve_input_files(dir.path(), false).unwrap());
        assert_eq!(
            all,
            vec!["features_a.jsonl", "features_b.jsonl", "synthetic_a.jsonl", "combined.jsonl"]
        );
        let real_only = names(resolve_input_files(dir.path(), true).unwrap());
        assert_eq!(
            real_only,
            vec!["features_a.jsonl", "features_b.jsonl", "combined.jsonl"]
        );
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_dataset(dir.path(), false).is_err());
    }
}
