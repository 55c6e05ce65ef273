use anyhow::{anyhow, Result};
use log::{info, warn};
use serde::Serialize;
use std::path::PathBuf;

use crate::split::{WeightingOptions, DEFAULT_HOLDOUT_FRACTION};
use crate::tuner::SearchSpace;
use crate::validation::WalkForwardConfig;

pub const DEFAULT_MIN_SAMPLES: usize = 100;
pub const DEFAULT_SEARCH_TRIALS: usize = 50;
pub const DEFAULT_SL_QUANTILE: f64 = 0.95;
pub const DEFAULT_SEED: u64 = 42;

/// Everything one training run needs. Built by the CLI, validated before use.
#[derive(Debug, Clone)]
pub struct TrainingOptions {
    pub data_path: PathBuf,
    pub output_dir: PathBuf,
    /// Labeled rows required before any model is trained.
    pub min_samples: usize,
    pub exclude_synthetic: bool,
    pub tune_hyperparams: bool,
    pub search_trials: usize,
    /// Use exhaustive grid search instead of the Bayesian strategy.
    pub grid_search: bool,
    pub search_space: SearchSpace,
    pub weighting: WeightingOptions,
    pub verbose: bool,
    pub sl_quantile: f64,
    pub holdout_fraction: f64,
    pub walk_forward: WalkForwardConfig,
    pub seed: u64,
    /// Upper bound on concurrent target jobs.
    pub workers: Option<usize>,
    pub portable_export: bool,
    pub calibration: bool,
    pub attribution: bool,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data"),
            output_dir: PathBuf::from("models"),
            min_samples: DEFAULT_MIN_SAMPLES,
            exclude_synthetic: false,
            tune_hyperparams: false,
            search_trials: DEFAULT_SEARCH_TRIALS,
            grid_search: false,
            search_space: SearchSpace::default(),
            weighting: WeightingOptions::default(),
            verbose: false,
            sl_quantile: DEFAULT_SL_QUANTILE,
            holdout_fraction: DEFAULT_HOLDOUT_FRACTION,
            walk_forward: WalkForwardConfig::default(),
            seed: DEFAULT_SEED,
            workers: None,
            portable_export: true,
            calibration: true,
            attribution: true,
        }
    }
}

impl TrainingOptions {
    pub fn validate(&self) -> Result<()> {
        require_min_usize("min_samples", self.min_samples, 1)?;
        require_range_f64("sl_quantile", self.sl_quantile, 0.0, 1.0, false)?;
        require_range_f64("holdout_fraction", self.holdout_fraction, 0.0, 1.0, false)?;
        require_min_usize("walk_forward.n_folds", self.walk_forward.n_folds, 1)?;
        require_min_usize("walk_forward.min_train_size", self.walk_forward.min_train_size, 1)?;
        if let Some(decay) = self.weighting.recency_decay {
            require_range_f64("recency_decay", decay, 0.0, f64::INFINITY, true)?;
        }
        if let Some(workers) = self.workers {
            require_min_usize("workers", workers, 1)?;
        }
        if self.tune_hyperparams {
            require_min_usize("search_trials", self.search_trials, 1)?;
            if self.search_space.size() == 0 {
                return Err(anyhow!(
                    "Setting search_space must list at least one value per hyperparameter"
                ));
            }
        }
        Ok(())
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            portable_export: self.portable_export,
            bayesian_search: !self.grid_search,
            calibration: self.calibration,
            attribution: self.attribution,
        }
    }
}

fn require_min_usize(key: &str, value: usize, min: usize) -> Result<()> {
    if value < min {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            value
        ));
    }
    Ok(())
}

fn require_range_f64(key: &str, value: f64, min: f64, max: f64, inclusive: bool) -> Result<()> {
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, value));
    }
    let inside = if inclusive {
        value >= min && value <= max
    } else {
        value > min && value < max
    };
    if !inside {
        let (open, close) = if inclusive { ('[', ']') } else { ('(', ')') };
        return Err(anyhow!(
            "Setting {} must be in {}{}, {}{} (value: {})",
            key,
            open,
            min,
            max,
            close,
            value
        ));
    }
    Ok(())
}

/// Optional analyses available to this run. Resolved once and shared read-only by every
/// target job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub portable_export: bool,
    pub bayesian_search: bool,
    pub calibration: bool,
    pub attribution: bool,
}

impl Capabilities {
    pub fn log(&self) {
        if !self.portable_export {
            warn!("Portable model export disabled; only serialized backups will be written");
        }
        if !self.bayesian_search {
            warn!("Bayesian search disabled; hyperparameter tuning falls back to grid search");
        }
        if !self.calibration {
            warn!("Probability calibration disabled");
        }
        if !self.attribution {
            warn!("Per-prediction attribution disabled; reporting gain importances only");
        }
        info!(
            "Capabilities: export={} bayesian={} calibration={} attribution={}",
            self.portable_export, self.bayesian_search, self.calibration, self.attribution
        );
    }
}
