use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::{Capabilities, TrainingOptions};
use crate::explain;
use crate::export::{self, ExportOutcome};
use crate::features::{self, FeatureMatrix};
use crate::gbdt::{BoosterParams, Dataset};
use crate::lag_features::add_lag_features;
use crate::loader::{load_dataset, LoadSummary};
use crate::logging::{RunLog, RunLogHandle};
use crate::models::{FlatRow, Target};
use crate::report::{self, ImprovementReport, TargetInsights};
use crate::split::sample_weights;
use crate::trainer::{self, TrainRequest, TrainingPath, TuningRequest};
use crate::tuner::{BayesianSearch, GridSearch, SearchStrategy};
use crate::validation;

pub const METADATA_FILE: &str = "training_metadata.json";

struct TargetTask {
    id: usize,
    target: Target,
}

struct TargetTaskResult {
    id: usize,
    target: Target,
    result: Option<TargetRun>,
    skipped: Option<String>,
    error: Option<String>,
}

/// Everything one successful target job hands back to the aggregator.
struct TargetRun {
    insights: TargetInsights,
    export: ExportOutcome,
    path: TrainingPath,
    params: BoosterParams,
    rows: usize,
    feature_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TargetOutcome {
    Fit {
        rows: usize,
        features: usize,
        path: TrainingPath,
        params: BoosterParams,
        exported: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        walk_forward_mean: Option<f64>,
    },
    Skipped {
        reason: String,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingMetadata {
    pub run_id: Uuid,
    pub trained_at: DateTime<Utc>,
    pub data_file: String,
    pub input_files: Vec<String>,
    pub load_summary: LoadSummary,
    pub total_records: usize,
    pub trades_with_outcomes: usize,
    pub min_samples: usize,
    pub models_fit: Vec<String>,
    pub models_trained: Vec<String>,
    pub model_hashes: BTreeMap<String, String>,
    pub training_outcomes: BTreeMap<String, TargetOutcome>,
    pub capabilities: Capabilities,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub signal_quality_feature_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_quality_input_dim: Option<usize>,
    pub improvement_report: ImprovementReport,
}

/// Compact result of one run, printed by the binary.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub output_dir: PathBuf,
    pub total_records: usize,
    pub trades_with_outcomes: usize,
    pub models_fit: Vec<String>,
    pub models_trained: Vec<String>,
    pub metadata_path: PathBuf,
    pub report_path: PathBuf,
}

/// Runs the whole pipeline. Returns an error only when the input cannot be read or the
/// output directory cannot be written; per-target failures are recorded in the metadata.
pub fn run(options: &TrainingOptions) -> Result<RunSummary> {
    options.validate()?;
    let output_dir = options.output_dir.clone();
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;
    let run_log = RunLog::attach(&output_dir)?;

    let run_id = Uuid::new_v4();
    let started = Instant::now();
    info!("Starting training run {run_id}");
    let capabilities = options.capabilities();
    capabilities.log();

    let dataset = load_dataset(&options.data_path, options.exclude_synthetic)?;
    let mut rows = dataset.rows;
    let lag_columns = add_lag_features(&mut rows);

    let labeled = rows.iter().filter(|row| row.has_outcome()).count();
    let mut metadata = TrainingMetadata {
        run_id,
        trained_at: Utc::now(),
        data_file: options.data_path.display().to_string(),
        input_files: dataset
            .files
            .iter()
            .map(|file| file.display().to_string())
            .collect(),
        load_summary: dataset.summary,
        total_records: rows.len(),
        trades_with_outcomes: labeled,
        min_samples: options.min_samples,
        models_fit: Vec::new(),
        models_trained: Vec::new(),
        model_hashes: BTreeMap::new(),
        training_outcomes: BTreeMap::new(),
        capabilities,
        signal_quality_feature_names: Vec::new(),
        signal_quality_input_dim: None,
        improvement_report: ImprovementReport::degenerate(&rows),
    };

    if labeled < options.min_samples {
        warn!(
            "Only {} labeled trades (minimum {}); writing data summary without training",
            labeled, options.min_samples
        );
        for target in Target::ALL {
            metadata.training_outcomes.insert(
                target.name().to_string(),
                TargetOutcome::Skipped {
                    reason: format!("{labeled} labeled trades < minimum {}", options.min_samples),
                },
            );
        }
    } else {
        let rows = Arc::new(rows);
        let results = run_target_jobs(
            Arc::clone(&rows),
            Arc::new(lag_columns),
            Arc::new(options.clone()),
            capabilities,
            run_log.handle(),
        )?;

        let mut insights = Vec::new();
        for task_result in results {
            let name = task_result.target.name().to_string();
            let outcome = match (task_result.result, task_result.skipped, task_result.error) {
                (Some(run), _, _) => {
                    metadata.models_fit.push(name.clone());
                    if run.export.exported() {
                        metadata.models_trained.push(name.clone());
                    }
                    if let Some(hash) = &run.export.content_hash {
                        metadata.model_hashes.insert(name.clone(), hash.clone());
                    }
                    if task_result.target == Target::SignalQuality {
                        metadata.signal_quality_input_dim = Some(run.feature_names.len());
                        metadata.signal_quality_feature_names = run.feature_names.clone();
                    }
                    let outcome = TargetOutcome::Fit {
                        rows: run.rows,
                        features: run.feature_names.len(),
                        path: run.path,
                        params: run.params,
                        exported: run.export.exported(),
                        walk_forward_mean: run
                            .insights
                            .walk_forward
                            .as_ref()
                            .and_then(|summary| summary.mean),
                    };
                    insights.push(run.insights);
                    outcome
                }
                (None, Some(reason), _) => TargetOutcome::Skipped { reason },
                (None, None, error) => TargetOutcome::Failed {
                    reason: error.unwrap_or_else(|| "no result reported".to_string()),
                },
            };
            metadata.training_outcomes.insert(name, outcome);
        }
        metadata.improvement_report = ImprovementReport::build(&rows, &insights, &capabilities);
    }

    let metadata_path = write_metadata(&output_dir, &metadata)?;
    let report_path = report::write_markdown(&output_dir, &metadata.improvement_report)?;

    info!(
        "Training run {} finished in {:.1}s: fit [{}], exported [{}]",
        run_id,
        started.elapsed().as_secs_f64(),
        metadata.models_fit.join(", "),
        metadata.models_trained.join(", ")
    );
    drop(run_log);

    Ok(RunSummary {
        run_id,
        output_dir,
        total_records: metadata.total_records,
        trades_with_outcomes: metadata.trades_with_outcomes,
        models_fit: metadata.models_fit,
        models_trained: metadata.models_trained,
        metadata_path,
        report_path,
    })
}

fn write_metadata(dir: &Path, metadata: &TrainingMetadata) -> Result<PathBuf> {
    let path = dir.join(METADATA_FILE);
    let json = serde_json::to_string_pretty(metadata).context("Failed to serialize metadata")?;
    fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote {}", path.display());
    Ok(path)
}

/// Dispatches one job per target to a worker pool and waits for every job to report.
/// Results come back in `Target::ALL` order. Workers log into the run's `train.log`.
fn run_target_jobs(
    rows: Arc<Vec<FlatRow>>,
    lag_columns: Arc<Vec<String>>,
    options: Arc<TrainingOptions>,
    capabilities: Capabilities,
    run_log: RunLogHandle,
) -> Result<Vec<TargetTaskResult>> {
    let task_count = Target::ALL.len();
    let mut num_workers = std::cmp::min(task_count, std::cmp::max(1, num_cpus::get()));
    if let Some(cap) = options.workers {
        num_workers = num_workers.min(cap.max(1));
    }
    info!("Training {} targets on {} worker thread(s)", task_count, num_workers);

    let (tx, rx): (Sender<TargetTask>, Receiver<TargetTask>) = bounded(task_count);
    let (result_tx, result_rx): (Sender<TargetTaskResult>, Receiver<TargetTaskResult>) =
        bounded(task_count);

    let mut handles = Vec::new();
    for _worker_id in 0..num_workers {
        let rx = rx.clone();
        let result_tx = result_tx.clone();
        let rows = Arc::clone(&rows);
        let lag_columns = Arc::clone(&lag_columns);
        let options = Arc::clone(&options);

        let handle = thread::spawn(move || {
            let _run_log = run_log.enter();
            while let Ok(task) = rx.recv() {
                let start_time = Instant::now();
                let result = run_target_task(&task, &rows, &lag_columns, &options, &capabilities);
                let duration = start_time.elapsed();

                if let Some(run) = &result.result {
                    info!(
                        "{} finished in {:.1}s on {} rows ({} features, exported: {})",
                        task.target,
                        duration.as_secs_f64(),
                        run.rows,
                        run.feature_names.len(),
                        run.export.exported()
                    );
                } else if let Some(reason) = &result.skipped {
                    info!("{} skipped: {}", task.target, reason);
                } else if let Some(err) = &result.error {
                    error!(
                        "{} failed after {:.1}s: {}",
                        task.target,
                        duration.as_secs_f64(),
                        err
                    );
                }

                if result_tx.send(result).is_err() {
                    break;
                }
            }
        });
        handles.push(handle);
    }
    drop(result_tx);

    for (id, target) in Target::ALL.into_iter().enumerate() {
        tx.send(TargetTask { id, target })
            .map_err(|_| anyhow!("Training workers exited before accepting {target}"))?;
    }
    drop(tx);

    let mut results: Vec<TargetTaskResult> = Vec::with_capacity(task_count);
    let pb = ProgressBar::new(task_count as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    while results.len() < task_count {
        match result_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(result) => {
                results.push(result);
                pb.set_position(results.len() as u64);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => pb.tick(),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                warn!("Result channel closed unexpectedly. Some targets did not report.");
                break;
            }
        }
    }

    let failed = results.iter().filter(|r| r.error.is_some()).count();
    if failed > 0 {
        pb.finish_with_message("Training completed with errors");
    } else {
        pb.finish_with_message("Training completed");
    }

    for handle in handles {
        if handle.join().is_err() {
            warn!("A training worker thread panicked");
        }
    }

    // Targets whose worker died without reporting are recorded as failures.
    for (id, target) in Target::ALL.into_iter().enumerate() {
        if !results.iter().any(|r| r.target == target) {
            results.push(TargetTaskResult {
                id,
                target,
                result: None,
                skipped: None,
                error: Some("worker exited without reporting".to_string()),
            });
        }
    }
    results.sort_by_key(|r| r.id);
    Ok(results)
}

enum JobOutcome {
    Fit(Box<TargetRun>),
    Skipped(String),
}

fn run_target_task(
    task: &TargetTask,
    rows: &[FlatRow],
    lag_columns: &[String],
    options: &TrainingOptions,
    capabilities: &Capabilities,
) -> TargetTaskResult {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        train_one_target(task.target, rows, lag_columns, options, capabilities)
    }));
    let mut result = TargetTaskResult {
        id: task.id,
        target: task.target,
        result: None,
        skipped: None,
        error: None,
    };
    match outcome {
        Ok(Ok(JobOutcome::Fit(run))) => result.result = Some(*run),
        Ok(Ok(JobOutcome::Skipped(reason))) => result.skipped = Some(reason),
        Ok(Err(err)) => result.error = Some(format!("{err:#}")),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            result.error = Some(format!("panicked: {message}"));
        }
    }
    result
}

fn train_one_target(
    target: Target,
    rows: &[FlatRow],
    lag_columns: &[String],
    options: &TrainingOptions,
    capabilities: &Capabilities,
) -> Result<JobOutcome> {
    let matrix: FeatureMatrix = features::build_for_target(target, rows, lag_columns)
        .with_context(|| format!("Failed to build features for {target}"))?;
    if matrix.len() < options.min_samples {
        return Ok(JobOutcome::Skipped(format!(
            "{} labeled rows < minimum {}",
            matrix.len(),
            options.min_samples
        )));
    }

    let weights = sample_weights(&matrix.timestamps, &matrix.assets, &options.weighting);
    let bayesian;
    let strategy: &dyn SearchStrategy = if capabilities.bayesian_search {
        bayesian = BayesianSearch::new(options.search_trials, options.seed);
        &bayesian
    } else {
        &GridSearch
    };
    let tuning = options.tune_hyperparams.then_some(TuningRequest {
        strategy,
        space: &options.search_space,
    });

    let trained = trainer::train_target(&TrainRequest {
        matrix: &matrix,
        weights: weights.as_deref(),
        split: None,
        tuning,
        sl_quantile: options.sl_quantile,
        seed: options.seed,
    })?;

    let objective = trained.model.objective;
    let data = Dataset::new(&matrix.rows, &matrix.labels).with_weights(weights.as_deref());
    let validation_params = &trained.validation_params;
    let holdout = validation::holdout_evaluation(
        &data,
        objective,
        validation_params,
        options.holdout_fraction,
    )
    .unwrap_or_else(|err| {
        warn!("{target}: holdout validation failed, reporting without it: {err:#}");
        None
    });
    let walk_forward =
        validation::walk_forward(&data, objective, validation_params, &options.walk_forward);
    let explanation = explain::explain(
        &trained.model,
        &matrix.rows,
        &matrix.feature_names,
        capabilities.attribution,
    );

    let sample = matrix
        .rows
        .first()
        .ok_or_else(|| anyhow!("{target} has no rows to verify the export with"))?;
    let export = export::export_model(
        &options.output_dir,
        target,
        &trained.model,
        &matrix.feature_names,
        &matrix.class_labels,
        sample,
        capabilities.portable_export,
    )?;

    Ok(JobOutcome::Fit(Box::new(TargetRun {
        insights: TargetInsights {
            target,
            explanation,
            holdout,
            walk_forward,
        },
        export,
        path: trained.path,
        params: trained.params,
        rows: matrix.len(),
        feature_names: matrix.feature_names,
    })))
}
