//! Request orchestration: validate, route, infer, then hand off logging and metrics.
//!
//! The active [`Deployment`] sits behind an `ArcSwapOption`. Each request
//! loads it once, so routing config and predictors always come from the same
//! snapshot even while a reconfiguration swaps in a new one.

use arc_swap::ArcSwapOption;
use chrono::Utc;
use mlops_core::{retry_async, RetryConfig};
use model_registry::{LoadError, LoadedModel, ModelLoader, ModelRegistry, Stage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::ServingConfig;
use crate::error::ServeError;
use crate::log_store::{LogStore, LogWriter, PredictionLog};
use crate::metrics::ServingMetrics;
use crate::router::{route, Arm, CanaryConfig};

/// Routing config plus the predictors it resolves to. Immutable once built.
#[derive(Debug)]
pub struct Deployment {
    pub config: CanaryConfig,
    pub stable: LoadedModel,
    pub canary: Option<LoadedModel>,
}

impl Deployment {
    /// Arm and model for one request. Only a loaded canary can be chosen.
    fn pick(&self) -> (Arm, &LoadedModel) {
        match (route(&self.config), &self.canary) {
            (Arm::Canary, Some(canary)) => (Arm::Canary, canary),
            _ => (Arm::Stable, &self.stable),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub prediction: i64,
    pub probability: f64,
    pub latency_ms: f64,
    pub model: String,
    pub version: u32,
    pub arm: Arm,
    pub request_id: Uuid,
}

/// Replacement canary settings. An absent `stable_version` means the version
/// currently in Production.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanaryUpdate {
    #[serde(default)]
    pub stable_version: Option<u32>,
    #[serde(default)]
    pub canary_version: Option<u32>,
    #[serde(default)]
    pub canary_percentage: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub model_name: String,
    pub stable_version: u32,
    pub stable_algorithm: String,
    pub canary_version: Option<u32>,
    pub canary_algorithm: Option<String>,
    pub canary_percentage: u32,
    pub n_features: usize,
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub log_queue_capacity: usize,
    pub log_write_timeout: Duration,
    pub reload_retries: usize,
}

impl From<&ServingConfig> for ServiceOptions {
    fn from(cfg: &ServingConfig) -> Self {
        Self {
            log_queue_capacity: cfg.log_queue_capacity,
            log_write_timeout: cfg.log_write_timeout(),
            reload_retries: cfg.reload_retries,
        }
    }
}

pub struct PredictionService {
    loader: Arc<ModelLoader>,
    store: Arc<dyn LogStore>,
    logs: LogWriter,
    metrics: Arc<ServingMetrics>,
    deployment: ArcSwapOption<Deployment>,
    /// Serialises reconfigurations; readers never take it.
    reconfigure: tokio::sync::Mutex<()>,
    reload_retry: RetryConfig,
}

impl PredictionService {
    /// Builds the service and spawns its log writer on the current runtime.
    /// Serves `NotReady` until [`deploy`](Self::deploy) succeeds.
    pub fn start(
        loader: Arc<ModelLoader>,
        store: Arc<dyn LogStore>,
        metrics: Arc<ServingMetrics>,
        opts: ServiceOptions,
    ) -> Arc<Self> {
        let (logs, _writer) = LogWriter::spawn(store.clone(), opts.log_queue_capacity, opts.log_write_timeout, metrics.clone());
        Arc::new(Self {
            loader,
            store,
            logs,
            metrics,
            deployment: ArcSwapOption::empty(),
            reconfigure: tokio::sync::Mutex::new(()),
            reload_retry: RetryConfig::with_retries(opts.reload_retries),
        })
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> { self.loader.registry() }

    pub fn metrics(&self) -> &Arc<ServingMetrics> { &self.metrics }

    pub fn log_store(&self) -> &Arc<dyn LogStore> { &self.store }

    pub fn current(&self) -> Option<Arc<Deployment>> { self.deployment.load_full() }

    pub fn is_ready(&self) -> bool { self.deployment.load().is_some() }

    /// Initial deployment. No retries: a load failure here is fatal to startup.
    pub async fn deploy(&self, config: CanaryConfig) -> Result<Arc<Deployment>, ServeError> {
        let _guard = self.reconfigure.lock().await;
        self.install(config, &RetryConfig::with_retries(0)).await
    }

    /// Hot swap of canary settings. Loads are retried; on failure the previous
    /// deployment stays in place.
    pub async fn reconfigure(&self, update: CanaryUpdate) -> Result<Arc<Deployment>, ServeError> {
        let _guard = self.reconfigure.lock().await;
        let current = self.current().ok_or(ServeError::NotReady)?;
        let stable_version = match update.stable_version {
            Some(v) => v,
            None => self
                .registry()
                .get(&current.config.model_name, Stage::Production)
                .map_err(|e| ServeError::InvalidConfig(e.to_string()))?
                .version,
        };
        let config = CanaryConfig {
            model_name: current.config.model_name.clone(),
            stable_version,
            canary_version: update.canary_version,
            canary_percentage: update.canary_percentage,
        };
        if config == current.config { return Ok(current); }
        self.install(config, &self.reload_retry).await
    }

    async fn install(&self, config: CanaryConfig, retry: &RetryConfig) -> Result<Arc<Deployment>, ServeError> {
        config.validate_against(self.registry())?;
        let stable = self.load_with_retry(&config.model_name, config.stable_version, retry).await?;
        let canary = match config.canary_version {
            Some(v) => Some(self.load_with_retry(&config.model_name, v, retry).await?),
            None => None,
        };
        let next = Arc::new(Deployment { config, stable, canary });
        let previous = self.deployment.swap(Some(next.clone()));

        if let Some(prev) = previous {
            for m in std::iter::once(&prev.stable).chain(prev.canary.as_ref()) {
                self.metrics.model_loaded.with_label_values(&[&model_label(m)]).set(0);
            }
        }
        for m in std::iter::once(&next.stable).chain(next.canary.as_ref()) {
            self.metrics.model_loaded.with_label_values(&[&model_label(m)]).set(1);
        }
        self.metrics.canary_percentage.set(i64::from(next.config.canary_percentage));
        info!(
            model = %next.config.model_name,
            stable = next.config.stable_version,
            canary = ?next.config.canary_version,
            canary_percentage = next.config.canary_percentage,
            "deployment active"
        );
        Ok(next)
    }

    async fn load_with_retry(&self, name: &str, version: u32, retry: &RetryConfig) -> Result<LoadedModel, ServeError> {
        let what = format!("load {name} v{version}");
        let loaded = retry_async(retry, &what, |_| {
            let loader = self.loader.clone();
            let name = name.to_string();
            async move {
                let owned = name.clone();
                match tokio::task::spawn_blocking(move || loader.load(&owned, version)).await {
                    Ok(res) => res,
                    Err(e) => Err(LoadError::ModelLoadFailed { name, version, reason: format!("loader task failed: {e}") }),
                }
            }
        })
        .await?;
        Ok(loaded)
    }

    /// Single prediction. Logging is queued, never awaited.
    #[instrument(level = "debug", skip_all)]
    pub fn predict(&self, features: Vec<f64>) -> Result<PredictionResponse, ServeError> {
        let deployment = self.current().ok_or(ServeError::NotReady)?;
        validate_features(&features, deployment.stable.predictor.n_features())?;
        Ok(self.predict_validated(&deployment, features))
    }

    /// Each row is routed, logged and counted as its own prediction. One bad
    /// row rejects the whole batch before any inference runs.
    #[instrument(level = "debug", skip_all, fields(rows = rows.len()))]
    pub fn predict_batch(&self, rows: Vec<Vec<f64>>) -> Result<Vec<PredictionResponse>, ServeError> {
        let deployment = self.current().ok_or(ServeError::NotReady)?;
        if rows.is_empty() { return Err(ServeError::InvalidInput("empty batch".into())); }
        let n = deployment.stable.predictor.n_features();
        for (i, row) in rows.iter().enumerate() {
            validate_features(row, n).map_err(|e| ServeError::InvalidInput(format!("row {i}: {e}")))?;
        }
        self.metrics.batch_size.observe(rows.len() as f64);
        Ok(rows.into_iter().map(|row| self.predict_validated(&deployment, row)).collect())
    }

    fn predict_validated(&self, deployment: &Deployment, features: Vec<f64>) -> PredictionResponse {
        let (arm, model) = deployment.pick();
        let started = Instant::now();
        let out = model.predictor.predict(&features);
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let request_id = Uuid::new_v4();
        self.metrics.record_prediction(arm, &model_label(model), out.label, latency_ms);
        self.logs.submit(PredictionLog {
            request_id,
            model_name: model.name.clone(),
            model_version: model.version,
            arm,
            features,
            prediction: out.label,
            probability: out.probability,
            latency_ms,
            timestamp: Utc::now(),
        });
        PredictionResponse {
            prediction: out.label,
            probability: out.probability,
            latency_ms,
            model: model.name.clone(),
            version: model.version,
            arm,
            request_id,
        }
    }

    pub fn info(&self) -> Result<ServiceInfo, ServeError> {
        let d = self.current().ok_or(ServeError::NotReady)?;
        Ok(ServiceInfo {
            model_name: d.config.model_name.clone(),
            stable_version: d.stable.version,
            stable_algorithm: d.stable.algorithm.clone(),
            canary_version: d.canary.as_ref().map(|c| c.version),
            canary_algorithm: d.canary.as_ref().map(|c| c.algorithm.clone()),
            canary_percentage: d.config.canary_percentage,
            n_features: d.stable.predictor.n_features(),
        })
    }
}

fn model_label(m: &LoadedModel) -> String { format!("{}@{}", m.name, m.version) }

fn validate_features(features: &[f64], expected: usize) -> Result<(), ServeError> {
    if features.len() != expected {
        return Err(ServeError::InvalidInput(format!("expected {expected} features, got {}", features.len())));
    }
    if let Some(i) = features.iter().position(|v| !v.is_finite()) {
        return Err(ServeError::InvalidInput(format!("feature {i} is not a finite number")));
    }
    Ok(())
}
