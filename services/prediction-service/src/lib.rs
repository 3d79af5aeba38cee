//! Online serving path: stable/canary routing over registry-loaded predictors,
//! best-effort durable prediction logging, prometheus metrics and the HTTP API.

pub mod api;
pub mod config;
pub mod error;
pub mod log_store;
pub mod metrics;
pub mod reload;
pub mod router;
pub mod service;

use anyhow::{anyhow, Result};
use model_registry::{ModelLoader, ModelRegistry, Stage};
use std::sync::Arc;
use tracing::info;
use training_pipeline::{run_pipeline, PipelineConfig, VariantSpec};

pub use api::{router as http_router, AppState};
pub use config::ServingConfig;
pub use error::{LogStoreError, ServeError};
pub use log_store::{LogStore, LogWriter, PredictionLog, SledLogStore};
pub use metrics::ServingMetrics;
pub use reload::spawn_config_reload;
pub use router::{route, Arm, CanaryConfig};
pub use service::{CanaryUpdate, Deployment, PredictionResponse, PredictionService, ServiceOptions};

/// Brings the service to the point where it can answer predictions.
///
/// Trains first when asked to and nothing is in Production yet. Any failure to
/// resolve or load the configured models is returned, and the caller must not
/// advertise readiness.
pub async fn bootstrap(
    cfg: &ServingConfig,
    registry: Arc<ModelRegistry>,
    store: Arc<dyn LogStore>,
) -> Result<Arc<PredictionService>> {
    if cfg.train_on_startup && registry.get(&cfg.model_name, Stage::Production).is_err() {
        let pipeline = PipelineConfig {
            model_name: cfg.model_name.clone(),
            registry_path: cfg.registry_path.clone(),
            seed: cfg.training_seed,
            ..PipelineConfig::default()
        };
        let reg = registry.clone();
        let report = tokio::task::spawn_blocking(move || run_pipeline(&reg, &pipeline, &VariantSpec::defaults())).await??;
        info!(best_version = report.best_version, "trained on startup");
    }

    let stable_version = match cfg.stable_version {
        Some(v) => v,
        None => registry
            .get(&cfg.model_name, Stage::Production)
            .map_err(|e| anyhow!("no stable model to serve: {e}"))?
            .version,
    };

    let metrics = Arc::new(ServingMetrics::new()?);
    let loader = Arc::new(ModelLoader::new(registry));
    let service = PredictionService::start(loader, store, metrics, ServiceOptions::from(cfg));
    service.deploy(cfg.canary_config(stable_version)).await?;
    Ok(service)
}
