pub mod commands;
pub mod config;
pub mod explain;
pub mod export;
pub mod features;
pub mod gbdt;
pub mod lag_features;
pub mod loader;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod report;
pub mod split;
pub mod trainer;
pub mod tuner;
pub mod validation;
