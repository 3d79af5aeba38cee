use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::router::CanaryConfig;

/// Process settings, layered by `mlops_core::load_settings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingConfig {
    pub environment: String,
    pub model_name: String,
    pub registry_path: PathBuf,
    pub log_store_path: PathBuf,
    pub http_port: u16,
    /// Pinned stable version; the current Production version when unset.
    pub stable_version: Option<u32>,
    pub canary_version: Option<u32>,
    pub canary_percentage: u32,
    pub log_queue_capacity: usize,
    pub log_write_timeout_ms: u64,
    /// Run the training pipeline first when no Production version exists.
    pub train_on_startup: bool,
    pub training_seed: u64,
    pub reload_retries: usize,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            environment: "dev".into(),
            model_name: "iris-classifier".into(),
            registry_path: PathBuf::from("data/registry"),
            log_store_path: PathBuf::from("data/prediction-logs"),
            http_port: 8000,
            stable_version: None,
            canary_version: None,
            canary_percentage: 0,
            log_queue_capacity: 1024,
            log_write_timeout_ms: 250,
            train_on_startup: false,
            training_seed: 42,
            reload_retries: 3,
        }
    }
}

impl ServingConfig {
    pub fn log_write_timeout(&self) -> Duration { Duration::from_millis(self.log_write_timeout_ms) }

    /// Routing config once the stable version has been resolved.
    pub fn canary_config(&self, stable_version: u32) -> CanaryConfig {
        CanaryConfig {
            model_name: self.model_name.clone(),
            stable_version,
            canary_version: self.canary_version,
            canary_percentage: self.canary_percentage,
        }
    }
}
