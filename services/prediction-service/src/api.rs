//! HTTP surface. Every handler reports `iris_api_requests_total{endpoint,status}`
//! and failures also count under `iris_api_errors_total{kind}`.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use mlops_core::{health_routes, Readiness, METRICS_CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::error::{LogStoreError, ServeError};
use crate::service::{CanaryUpdate, PredictionService};

const DEFAULT_LOG_LIMIT: usize = 100;
const MAX_LOG_LIMIT: usize = 10_000;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PredictionService>,
    pub environment: Arc<str>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PredictRequest {
    pub features: Vec<f64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BatchRequest {
    pub features: Vec<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

pub fn router(state: AppState, readiness: Arc<Readiness>) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .route("/predict-batch", post(predict_batch))
        .route("/healthz", get(healthz))
        .route("/info", get(info))
        .route("/logs", get(logs))
        .route("/metrics-prometheus", get(metrics))
        .route("/admin/canary", put(update_canary))
        .route("/models/:name/versions", get(model_versions))
        .merge(health_routes(readiness))
        .with_state(state)
}

/// Counts the outcome and renders either the JSON body or the error.
fn finish<T: Serialize>(state: &AppState, endpoint: &str, result: Result<T, ServeError>) -> Response {
    let metrics = state.service.metrics();
    match result {
        Ok(body) => {
            metrics.record_request(endpoint, StatusCode::OK.as_u16());
            Json(body).into_response()
        }
        Err(e) => {
            let status = e.status();
            metrics.record_request(endpoint, status.as_u16());
            metrics.api_errors.with_label_values(&[e.kind()]).inc();
            if status.is_server_error() { warn!(endpoint, error = %e, "request failed"); }
            e.into_response()
        }
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ServeError> {
    payload.map(|Json(v)| v).map_err(|e| ServeError::InvalidInput(e.body_text()))
}

async fn predict(State(state): State<AppState>, payload: Result<Json<PredictRequest>, JsonRejection>) -> Response {
    let result = body(payload).and_then(|req| state.service.predict(req.features));
    finish(&state, "/predict", result)
}

async fn predict_batch(State(state): State<AppState>, payload: Result<Json<BatchRequest>, JsonRejection>) -> Response {
    let result = body(payload)
        .and_then(|req| state.service.predict_batch(req.features))
        .map(|predictions| json!({ "count": predictions.len(), "predictions": predictions }));
    finish(&state, "/predict-batch", result)
}

async fn healthz(State(state): State<AppState>) -> Response {
    let (status, model) = match state.service.current() {
        Some(d) => (StatusCode::OK, json!({ "name": d.stable.name, "version": d.stable.version })),
        None => (StatusCode::SERVICE_UNAVAILABLE, serde_json::Value::Null),
    };
    state.service.metrics().record_request("/healthz", status.as_u16());
    let label = if status == StatusCode::OK { "healthy" } else { "unhealthy" };
    (status, Json(json!({ "status": label, "environment": &*state.environment, "model": model }))).into_response()
}

async fn info(State(state): State<AppState>) -> Response {
    let result = state
        .service
        .info()
        .map(|info| json!({ "environment": &*state.environment, "deployment": info }));
    finish(&state, "/info", result)
}

async fn logs(State(state): State<AppState>, Query(q): Query<LogsQuery>) -> Response {
    let limit = q.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    let store = state.service.log_store().clone();
    let result: Result<_, ServeError> = match tokio::task::spawn_blocking(move || store.query(limit)).await {
        Ok(Ok(entries)) => Ok(json!({ "count": entries.len(), "logs": entries })),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(LogStoreError::Unavailable(e.to_string()).into()),
    };
    finish(&state, "/logs", result)
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.service.metrics().snapshot() {
        Ok(text) => ([(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], text).into_response(),
        Err(e) => {
            warn!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn update_canary(State(state): State<AppState>, payload: Result<Json<CanaryUpdate>, JsonRejection>) -> Response {
    let result = match payload {
        Ok(Json(update)) => state.service.reconfigure(update).await.map(|d| d.config.clone()),
        Err(e) => Err(ServeError::InvalidConfig(e.body_text())),
    };
    finish(&state, "/admin/canary", result)
}

async fn model_versions(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let versions = state.service.registry().list(&name);
    finish(&state, "/models/versions", Ok(json!({ "name": name, "versions": versions })))
}
