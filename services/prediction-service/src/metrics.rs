use anyhow::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

use crate::router::Arm;

/// Serving counters and histograms, registered on a per-instance registry so
/// several services can live in one process (tests do this).
pub struct ServingMetrics {
    registry: Registry,
    pub api_requests: IntCounterVec,
    pub predictions: IntCounterVec,
    pub prediction_class: IntCounterVec,
    pub latency_ms: Histogram,
    pub batch_size: Histogram,
    pub api_errors: IntCounterVec,
    pub log_write_failures: IntCounter,
    pub log_writes: IntCounter,
    pub model_loaded: IntGaugeVec,
    pub canary_percentage: IntGauge,
}

impl ServingMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let api_requests = IntCounterVec::new(
            Opts::new("iris_api_requests_total", "API requests by endpoint and status code"),
            &["endpoint", "status"],
        )?;
        let predictions = IntCounterVec::new(Opts::new("iris_predictions_total", "Predictions served per arm"), &["arm"])?;
        let prediction_class = IntCounterVec::new(
            Opts::new("iris_prediction_class_total", "Predicted class per model version"),
            &["model", "class"],
        )?;
        let latency_ms = Histogram::with_opts(
            HistogramOpts::new("iris_prediction_latency_ms", "Inference wall time in milliseconds")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0]),
        )?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("iris_batch_size", "Rows per batch prediction request")
                .buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
        )?;
        let api_errors = IntCounterVec::new(Opts::new("iris_api_errors_total", "API errors by kind"), &["kind"])?;
        let log_write_failures =
            IntCounter::with_opts(Opts::new("iris_log_write_failures_total", "Prediction log writes dropped, timed out or failed"))?;
        let log_writes = IntCounter::with_opts(Opts::new("iris_log_writes_total", "Prediction log writes persisted"))?;
        let model_loaded = IntGaugeVec::new(Opts::new("iris_model_loaded", "1 while the model version is resident"), &["model"])?;
        let canary_percentage = IntGauge::with_opts(Opts::new("iris_canary_percentage", "Configured canary share"))?;

        registry.register(Box::new(api_requests.clone()))?;
        registry.register(Box::new(predictions.clone()))?;
        registry.register(Box::new(prediction_class.clone()))?;
        registry.register(Box::new(latency_ms.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(api_errors.clone()))?;
        registry.register(Box::new(log_write_failures.clone()))?;
        registry.register(Box::new(log_writes.clone()))?;
        registry.register(Box::new(model_loaded.clone()))?;
        registry.register(Box::new(canary_percentage.clone()))?;

        Ok(Self {
            registry,
            api_requests,
            predictions,
            prediction_class,
            latency_ms,
            batch_size,
            api_errors,
            log_write_failures,
            log_writes,
            model_loaded,
            canary_percentage,
        })
    }

    pub fn registry(&self) -> &Registry { &self.registry }

    pub fn record_prediction(&self, arm: Arm, model: &str, class: i64, latency_ms: f64) {
        self.predictions.with_label_values(&[arm.as_str()]).inc();
        self.prediction_class.with_label_values(&[model, &class.to_string()]).inc();
        self.latency_ms.observe(latency_ms);
    }

    pub fn record_request(&self, endpoint: &str, status: u16) {
        self.api_requests.with_label_values(&[endpoint, &status.to_string()]).inc();
    }

    /// Text exposition of every family. Reading never mutates a metric.
    pub fn snapshot(&self) -> Result<String> { mlops_core::encode_metrics(&self.registry) }
}
