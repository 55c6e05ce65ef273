use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Once;
use trainer::commands::train;
use trainer::config::TrainingOptions;
use trainer::explain;
use trainer::export;
use trainer::features::{self, ASSET_DUMMY_PREFIX};
use trainer::gbdt::Dataset;
use trainer::lag_features::add_lag_features;
use trainer::loader::load_dataset;
use trainer::models::{FlatRow, Target};
use trainer::split::{temporal_split, WeightingOptions};
use trainer::trainer::{train_target, TrainRequest};
use trainer::tuner::SearchSpace;
use trainer::validation::holdout_evaluation;

const BASE_TIMESTAMP: i64 = 1_700_000_000_000;
const HOUR_MS: i64 = 3_600_000;

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

#[derive(Clone, Copy)]
struct GeneratorConfig<'a> {
    trades: usize,
    assets: &'a [&'a str],
    /// Every n-th record carries a max-adverse-excursion label; 0 disables it.
    mae_every: usize,
    seed: u64,
}

/// Feature-store style records whose outcome depends on signal strength and momentum.
fn trade_records(config: GeneratorConfig<'_>) -> Vec<Value> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let regimes = ["low", "normal", "high"];
    let market_regimes = ["bearish", "neutral", "bullish"];
    (0..config.trades)
        .map(|i| {
            let asset = config.assets[i % config.assets.len()];
            let strength: f64 = rng.gen_range(40.0..100.0);
            let confidence: f64 = rng.gen_range(40.0..100.0);
            let momentum: f64 = rng.gen_range(-3.0..3.0);
            let long = rng.gen_bool(0.5);
            let edge = (strength - 70.0) / 15.0 + if long { momentum } else { -momentum } * 0.5;
            let profitable = edge + rng.gen_range(-0.8..0.8) > 0.0;
            let r_multiple = if profitable {
                rng.gen_range(0.2..2.5)
            } else {
                rng.gen_range(-1.5..-0.1)
            };
            let tier = if profitable {
                1 + (strength > 75.0) as i64 + (strength > 88.0) as i64
            } else {
                1
            };
            let mut labels = json!({
                "profitable": profitable,
                "rMultiple": r_multiple,
                "optimalTpLevel": tier,
            });
            if config.mae_every > 0 && i % config.mae_every == 0 {
                let excursion: f64 = rng.gen_range(0.1..2.0);
                labels["maxAdverseExcursion"] =
                    json!(excursion + if profitable { 0.0 } else { 1.0 });
            }
            let direction = if long { "long" } else { "short" };
            let drivers = if long {
                vec!["Momentum up", "Whale buy"]
            } else {
                vec!["Momentum down"]
            };
            let volume_ratio: f64 = rng.gen_range(0.5..2.0);
            let atr_pct: f64 = rng.gen_range(0.8..3.0);
            let funding_percentile: f64 = rng.gen_range(0.0..100.0);
            let long_short_ratio: f64 = rng.gen_range(0.7..1.5);
            let funding_sentiment: f64 = rng.gen_range(-1.0..1.0);
            json!({
                "id": format!("trade-{i}"),
                "timestamp": BASE_TIMESTAMP + i as i64 * HOUR_MS,
                "asset": asset,
                "market": {
                    "priceChange24h": momentum,
                    "volumeRatio": volume_ratio,
                    "atrPct": atr_pct,
                    "fundingPercentile": funding_percentile,
                    "longShortRatio": long_short_ratio,
                },
                "session": { "utcHour": i % 24 },
                "signal": {
                    "direction": direction,
                    "strength": strength,
                    "confidence": confidence,
                    "hasWhaleSignal": i % 5 == 0,
                    "sources": [
                        { "name": "funding", "sentiment": funding_sentiment, "strength": strength },
                        { "name": "momentum", "sentiment": momentum / 3.0, "strength": confidence },
                    ],
                },
                "regime": {
                    "volatilityRegime": regimes[i % regimes.len()],
                    "marketRegime": market_regimes[(i / 7) % market_regimes.len()],
                },
                "execution": { "streakMultiplier": 1.0 + (i % 3) as f64 * 0.1 },
                "labels": labels,
                "decisionDrivers": drivers,
            })
        })
        .collect()
}

fn write_jsonl(path: &Path, records: &[Value]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    for record in records {
        writeln!(file, "{record}")?;
    }
    Ok(())
}

fn write_dataset(dir: &Path, config: GeneratorConfig<'_>) -> Result<()> {
    write_jsonl(&dir.join("features_2024.jsonl"), &trade_records(config))
}

fn options(data: &Path, output: &Path, min_samples: usize) -> TrainingOptions {
    TrainingOptions {
        data_path: data.to_path_buf(),
        output_dir: output.to_path_buf(),
        min_samples,
        workers: Some(2),
        ..TrainingOptions::default()
    }
}

fn read_metadata(output: &Path) -> Result<Value> {
    let path = output.join(train::METADATA_FILE);
    let text = fs::read_to_string(&path).with_context(|| format!("missing {}", path.display()))?;
    Ok(serde_json::from_str(&text)?)
}

fn prepared_rows(data: &Path) -> Result<(Vec<FlatRow>, Vec<String>)> {
    let mut rows = load_dataset(data, false)?.rows;
    let lags = add_lag_features(&mut rows);
    Ok((rows, lags))
}

#[test]
fn scenario_a_fits_and_exports_all_targets() -> Result<()> {
    ensure_test_env();
    let data = tempfile::tempdir()?;
    let output = tempfile::tempdir()?;
    write_dataset(
        data.path(),
        GeneratorConfig {
            trades: 150,
            assets: &["BTC"],
            mae_every: 1,
            seed: 7,
        },
    )?;

    let summary = train::run(&options(data.path(), output.path(), 30))?;
    assert!(!summary.models_fit.is_empty());

    let metadata = read_metadata(output.path())?;
    let outcomes = metadata["training_outcomes"].as_object().unwrap();
    assert_eq!(outcomes.len(), 4);
    for (target, outcome) in outcomes {
        assert_ne!(outcome["status"], "skipped", "{target} was not attempted");
    }
    assert!(!metadata["models_fit"].as_array().unwrap().is_empty());
    for name in metadata["models_trained"].as_array().unwrap() {
        let name = name.as_str().unwrap();
        let artifact = output.path().join(format!("{name}.model"));
        assert!(fs::metadata(&artifact)?.len() > 0, "{} is empty", artifact.display());
        assert!(metadata["model_hashes"][name].is_string());
        assert!(output.path().join(format!("{name}_features.json")).exists());
    }
    assert!(metadata["signal_quality_input_dim"].as_u64().unwrap() > 0);
    assert!(metadata["improvement_report"]["suggested_signal_quality_threshold"].is_number());
    assert!(output.path().join("improvement_report.md").exists());
    assert!(output.path().join("train.log").exists());
    Ok(())
}

#[test]
fn scenario_b_too_few_trades_writes_summary_only() -> Result<()> {
    ensure_test_env();
    let data = tempfile::tempdir()?;
    let output = tempfile::tempdir()?;
    write_dataset(
        data.path(),
        GeneratorConfig {
            trades: 10,
            assets: &["BTC"],
            mae_every: 1,
            seed: 3,
        },
    )?;

    let summary = train::run(&options(data.path(), output.path(), 100))?;
    assert!(summary.models_fit.is_empty());

    let metadata = read_metadata(output.path())?;
    assert!(metadata["models_fit"].as_array().unwrap().is_empty());
    let report = metadata["improvement_report"].as_object().unwrap();
    let mut keys: Vec<&str> = report.keys().map(String::as_str).collect();
    keys.sort();
    assert_eq!(keys, vec!["data_summary", "generated_at", "suggested_signal_factors"]);

    for entry in fs::read_dir(output.path())? {
        let path = entry?.path();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        assert!(
            extension != "model" && extension != "bin",
            "unexpected artifact {}",
            path.display()
        );
    }
    let markdown = fs::read_to_string(output.path().join("improvement_report.md"))?;
    assert!(markdown.contains("## Data summary"));
    assert!(!markdown.contains("## Holdout metrics"));
    Ok(())
}

#[test]
fn scenario_c_two_assets_get_dummy_columns() -> Result<()> {
    ensure_test_env();
    let data = tempfile::tempdir()?;
    write_dataset(
        data.path(),
        GeneratorConfig {
            trades: 120,
            assets: &["BTC", "ETH"],
            mae_every: 0,
            seed: 11,
        },
    )?;
    let (rows, lags) = prepared_rows(data.path())?;
    let matrix = features::build_for_target(Target::SignalQuality, &rows, &lags)?;

    assert!(matrix
        .feature_names
        .iter()
        .any(|name| name.starts_with(ASSET_DUMMY_PREFIX)));
    let labeled = rows.iter().filter(|row| row.label_profitable.is_some()).count();
    assert_eq!(matrix.len(), labeled);
    Ok(())
}

#[test]
fn scenario_d_stop_loss_model_predicts_finite_values() -> Result<()> {
    ensure_test_env();
    let data = tempfile::tempdir()?;
    let output = tempfile::tempdir()?;
    write_dataset(
        data.path(),
        GeneratorConfig {
            trades: 200,
            assets: &["BTC"],
            mae_every: 2,
            seed: 5,
        },
    )?;

    let summary = train::run(&options(data.path(), output.path(), 30))?;
    assert!(summary.models_fit.iter().any(|name| name == "sl_optimizer"));

    let model = export::read_backup(&export::backup_path(output.path(), Target::SlOptimizer))?;
    let (rows, lags) = prepared_rows(data.path())?;
    let matrix = features::build_for_target(Target::SlOptimizer, &rows, &lags)?;
    assert!(matrix.len() >= 90);
    for row in &matrix.rows {
        assert!(model.predict_value(row).is_finite());
    }
    Ok(())
}

#[test]
fn scenario_e_sample_weighting_still_fits() -> Result<()> {
    ensure_test_env();
    let data = tempfile::tempdir()?;
    let output = tempfile::tempdir()?;
    write_dataset(
        data.path(),
        GeneratorConfig {
            trades: 150,
            assets: &["BTC", "ETH", "SOL"],
            mae_every: 1,
            seed: 13,
        },
    )?;

    let mut options = options(data.path(), output.path(), 30);
    options.weighting = WeightingOptions {
        recency_decay: Some(0.05),
        balance_assets: true,
    };
    let summary = train::run(&options)?;
    assert!(!summary.models_fit.is_empty());
    Ok(())
}

#[test]
fn malformed_and_incomplete_lines_are_dropped() -> Result<()> {
    ensure_test_env();
    let data = tempfile::tempdir()?;
    let path = data.path().join("features_mixed.jsonl");
    let mut records = trade_records(GeneratorConfig {
        trades: 5,
        assets: &["BTC"],
        mae_every: 0,
        seed: 1,
    });
    records.push(json!({ "timestamp": BASE_TIMESTAMP, "asset": "BTC" }));
    write_jsonl(&path, &records)?;
    let mut file = fs::OpenOptions::new().append(true).open(&path)?;
    writeln!(file, "{{\"id\": \"broken\", ")?;

    let dataset = load_dataset(&path, false)?;
    assert_eq!(dataset.rows.len(), 5);
    assert_eq!(dataset.summary.malformed_lines, 1);
    assert_eq!(dataset.summary.missing_keys, 1);
    Ok(())
}

#[test]
fn feature_matrices_stay_in_time_order() -> Result<()> {
    ensure_test_env();
    let data = tempfile::tempdir()?;
    let mut records = trade_records(GeneratorConfig {
        trades: 80,
        assets: &["BTC", "ETH"],
        mae_every: 1,
        seed: 17,
    });
    records.reverse();
    write_jsonl(&data.path().join("features_reversed.jsonl"), &records)?;

    let (rows, lags) = prepared_rows(data.path())?;
    for target in Target::ALL {
        let matrix = features::build_for_target(target, &rows, &lags)?;
        assert!(
            matrix.timestamps.windows(2).all(|pair| pair[0] <= pair[1]),
            "{target} rows out of order"
        );
    }
    Ok(())
}

#[test]
fn baseline_training_is_reproducible() -> Result<()> {
    ensure_test_env();
    let data = tempfile::tempdir()?;
    write_dataset(
        data.path(),
        GeneratorConfig {
            trades: 150,
            assets: &["BTC"],
            mae_every: 0,
            seed: 21,
        },
    )?;
    let (rows, lags) = prepared_rows(data.path())?;
    let matrix = features::build_for_target(Target::SignalQuality, &rows, &lags)?;

    let train = || {
        train_target(&TrainRequest {
            matrix: &matrix,
            weights: None,
            split: None,
            tuning: None,
            sl_quantile: 0.95,
            seed: 42,
        })
    };
    let first = train()?;
    let second = train()?;
    assert_eq!(first.params, second.params);
    assert_eq!(first.model.trees, second.model.trees);

    let ranking = |model| {
        explain::feature_importances(model, &matrix.feature_names)
            .into_iter()
            .map(|item| item.feature)
            .collect::<Vec<_>>()
    };
    assert_eq!(ranking(&first.model), ranking(&second.model));
    Ok(())
}

#[test]
fn holdout_model_never_sees_scored_rows() -> Result<()> {
    ensure_test_env();
    let data = tempfile::tempdir()?;
    write_dataset(
        data.path(),
        GeneratorConfig {
            trades: 100,
            assets: &["BTC"],
            mae_every: 0,
            seed: 9,
        },
    )?;
    let (rows, lags) = prepared_rows(data.path())?;
    let matrix = features::build_for_target(Target::PositionSizing, &rows, &lags)?;
    let trained = train_target(&TrainRequest {
        matrix: &matrix,
        weights: None,
        split: None,
        tuning: None,
        sl_quantile: 0.95,
        seed: 42,
    })?;

    let dataset = Dataset::new(&matrix.rows, &matrix.labels);
    let objective = trained.model.objective;
    let evaluation = holdout_evaluation(&dataset, objective, &trained.validation_params, 0.2)?
        .expect("100 rows leave a holdout tail");
    let split = temporal_split(matrix.len(), 0.2).unwrap();
    assert_eq!(evaluation.metrics.train_rows, split.split_index);
    assert_eq!(
        evaluation.metrics.train_rows + evaluation.metrics.holdout_rows,
        matrix.len()
    );
    assert_eq!(evaluation.labels.as_slice(), &matrix.labels[split.holdout()]);
    assert!(evaluation.metrics.values.contains_key("mae"));
    Ok(())
}

#[test]
fn tuned_run_records_searched_params_and_suggested_thresholds() -> Result<()> {
    ensure_test_env();
    let data = tempfile::tempdir()?;
    let output = tempfile::tempdir()?;
    write_dataset(
        data.path(),
        GeneratorConfig {
            trades: 240,
            assets: &["BTC"],
            mae_every: 1,
            seed: 11,
        },
    )?;
    let options = TrainingOptions {
        tune_hyperparams: true,
        search_trials: 2,
        search_space: SearchSpace {
            n_estimators: vec![60],
            max_depth: vec![3],
            learning_rate: vec![0.1],
            subsample: vec![1.0],
            colsample_bytree: vec![1.0],
            min_child_weight: vec![1.0],
        },
        ..options(data.path(), output.path(), 30)
    };

    train::run(&options)?;
    let metadata = read_metadata(output.path())?;
    for target in [Target::SignalQuality, Target::PositionSizing] {
        let outcome = &metadata["training_outcomes"][target.name()];
        assert_eq!(outcome["status"], "fit", "{target}: {outcome}");
        assert_eq!(outcome["path"], "tuned", "{target}: {outcome}");
        let params = &outcome["params"];
        assert_eq!(params["max_depth"], 3);
        assert_eq!(params["learning_rate"], 0.1);
        let rounds = params["n_estimators"].as_u64().unwrap();
        assert!((1..=60).contains(&rounds), "{target}: {rounds} rounds");
    }

    let tuning = &metadata["improvement_report"]["suggested_tuning"];
    let min_strength = tuning["min_strength"].as_i64().unwrap();
    let min_confidence = tuning["min_confidence"].as_i64().unwrap();
    assert!((40..=100).contains(&min_strength), "{tuning}");
    assert!((40..=100).contains(&min_confidence), "{tuning}");
    Ok(())
}
