use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;
use trainer::commands::train;
use trainer::config::{
    TrainingOptions, DEFAULT_MIN_SAMPLES, DEFAULT_SEARCH_TRIALS, DEFAULT_SEED, DEFAULT_SL_QUANTILE,
};
use trainer::logging;
use trainer::split::WeightingOptions;
use trainer::validation::WalkForwardConfig;

#[derive(Parser)]
#[command(name = "trainer")]
#[command(about = "Trains and validates the trade-decision models from feature-store exports")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train, validate and export the four trade-decision models
    Train {
        /// Feature file or directory of features_*.jsonl / synthetic_*.jsonl files
        #[arg(long, value_name = "PATH", default_value = "data")]
        data: PathBuf,
        /// Directory for models, manifests, metadata and the report
        #[arg(short, long, value_name = "DIR", default_value = "models")]
        output: PathBuf,
        /// Labeled trades required before any model is trained
        #[arg(long, default_value_t = DEFAULT_MIN_SAMPLES)]
        min_samples: usize,
        /// Ignore synthetic_*.jsonl files
        #[arg(long)]
        exclude_synthetic: bool,
        /// Search hyperparameters with forward-chaining cross-validation
        #[arg(long)]
        tune: bool,
        /// Trial budget for the Bayesian search
        #[arg(long, default_value_t = DEFAULT_SEARCH_TRIALS)]
        trials: usize,
        /// Evaluate the full parameter grid instead of the Bayesian search
        #[arg(long)]
        grid_search: bool,
        /// Exponential sample-weight decay per day of trade age
        #[arg(long, value_name = "RATE")]
        recency_decay: Option<f64>,
        /// Weight assets inversely to their trade counts
        #[arg(long)]
        balance_assets: bool,
        /// Quantile predicted by the stop-loss model
        #[arg(long, default_value_t = DEFAULT_SL_QUANTILE)]
        sl_quantile: f64,
        /// Rows in the first walk-forward training window
        #[arg(long, default_value_t = WalkForwardConfig::default().min_train_size)]
        min_train_size: usize,
        /// Rows discarded between walk-forward train and test windows
        #[arg(long, default_value_t = WalkForwardConfig::default().purge_gap)]
        purge_gap: usize,
        /// Walk-forward folds
        #[arg(long, default_value_t = WalkForwardConfig::default().n_folds)]
        folds: usize,
        /// Seed for subsampling and search
        #[arg(long, default_value_t = DEFAULT_SEED)]
        seed: u64,
        /// Maximum concurrent target jobs
        #[arg(long)]
        workers: Option<usize>,
        /// Skip the portable model export and keep serialized backups only
        #[arg(long)]
        no_export: bool,
        /// Skip probability calibration
        #[arg(long)]
        no_calibration: bool,
        /// Skip per-prediction attribution and interaction analysis
        #[arg(long)]
        no_attribution: bool,
        /// Debug-level logging
        #[arg(short, long)]
        verbose: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            data,
            output,
            min_samples,
            exclude_synthetic,
            tune,
            trials,
            grid_search,
            recency_decay,
            balance_assets,
            sl_quantile,
            min_train_size,
            purge_gap,
            folds,
            seed,
            workers,
            no_export,
            no_calibration,
            no_attribution,
            verbose,
        } => {
            logging::init(verbose);
            info!("Starting trainer. Models describe past trades only; use at your own risk.");

            let options = TrainingOptions {
                data_path: data,
                output_dir: output,
                min_samples,
                exclude_synthetic,
                tune_hyperparams: tune,
                search_trials: trials,
                grid_search,
                weighting: WeightingOptions {
                    recency_decay,
                    balance_assets,
                },
                verbose,
                sl_quantile,
                walk_forward: WalkForwardConfig {
                    n_folds: folds,
                    min_train_size,
                    purge_gap,
                },
                seed,
                workers,
                portable_export: !no_export,
                calibration: !no_calibration,
                attribution: !no_attribution,
                ..TrainingOptions::default()
            };

            let summary = train::run(&options)?;
            if summary.models_fit.is_empty() {
                warn!("No models were fit; see {}", summary.report_path.display());
            }
            match serde_json::to_string(&summary) {
                Ok(payload) => println!("TRAINER_RUN_SUMMARY={payload}"),
                Err(err) => warn!("Failed to serialize run summary: {err}"),
            }
        }
    }

    Ok(())
}
