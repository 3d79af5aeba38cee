//! Drives the router over a real socket, the way a scraper or client would.
use mlops_core::Readiness;
use model_registry::{ModelLoader, ModelRegistry, Stage};
use prediction_service::{http_router, AppState, CanaryConfig, PredictionService, ServiceOptions, ServingMetrics, SledLogStore};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use training_pipeline::{run_pipeline, PipelineConfig, VariantSpec};

const MODEL: &str = "iris-classifier";

struct Harness {
    base: String,
    client: Client,
    production: u32,
    registry: Arc<ModelRegistry>,
}

async fn launch(deploy: bool) -> Harness {
    let registry = Arc::new(ModelRegistry::temporary().unwrap());
    let report = run_pipeline(&registry, &PipelineConfig::default(), &VariantSpec::defaults()).unwrap();
    let production = report.promoted.unwrap();

    let opts = ServiceOptions { log_queue_capacity: 64, log_write_timeout: Duration::from_secs(2), reload_retries: 1 };
    let service = PredictionService::start(
        Arc::new(ModelLoader::new(registry.clone())),
        Arc::new(SledLogStore::temporary().unwrap()),
        Arc::new(ServingMetrics::new().unwrap()),
        opts,
    );
    let readiness = Readiness::new();
    if deploy {
        service.deploy(CanaryConfig::stable_only(MODEL, production)).await.unwrap();
        readiness.mark_ready();
    }
    let app = http_router(AppState { service, environment: "test".into() }, readiness);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    Harness { base: format!("http://{addr}"), client: Client::new(), production, registry }
}

impl Harness {
    async fn get(&self, path: &str) -> (StatusCode, String) {
        let resp = self.client.get(format!("{}{path}", self.base)).send().await.expect("request");
        let status = resp.status();
        (status, resp.text().await.expect("body"))
    }

    async fn send(&self, method: reqwest::Method, path: &str, body: Value) -> (StatusCode, Value) {
        let resp = self.client.request(method, format!("{}{path}", self.base)).json(&body).send().await.expect("request");
        let status = resp.status();
        (status, resp.json().await.expect("json body"))
    }
}

#[tokio::test]
async fn predict_returns_label_probability_and_identity() {
    let h = launch(true).await;
    let (status, body) = h.send(reqwest::Method::POST, "/predict", json!({ "features": [6.7, 3.0, 5.2, 2.3] })).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["prediction"].as_i64().is_some());
    let p = body["probability"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&p));
    assert_eq!(body["version"].as_u64(), Some(u64::from(h.production)));
    assert_eq!(body["arm"], "stable");
    assert!(body["request_id"].as_str().is_some());
}

#[tokio::test]
async fn malformed_features_are_422() {
    let h = launch(true).await;
    let (status, body) = h.send(reqwest::Method::POST, "/predict", json!({ "features": [1.0, 2.0] })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("expected 4 features"));
    let (status, _) = h.send(reqwest::Method::POST, "/predict", json!({ "rows": [] })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (_, metrics) = h.get("/metrics-prometheus").await;
    assert!(metrics.contains("iris_api_errors_total{kind=\"invalid_input\"} 2"));
}

#[tokio::test]
async fn batch_rows_are_logged_individually() {
    let h = launch(true).await;
    let rows = json!({ "features": [[5.1, 3.5, 1.4, 0.2], [6.7, 3.0, 5.2, 2.3], [5.9, 3.0, 4.2, 1.5]] });
    let (status, body) = h.send(reqwest::Method::POST, "/predict-batch", rows).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 3);

    let mut logged = 0;
    for _ in 0..200 {
        let (_, text) = h.get("/logs?limit=10").await;
        let logs: Value = serde_json::from_str(&text).unwrap();
        logged = logs["count"].as_u64().unwrap();
        if logged == 3 { break; }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(logged, 3);
    let (_, text) = h.get("/logs?limit=1").await;
    let logs: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(logs["count"], 1);
}

#[tokio::test]
async fn health_reflects_loaded_model() {
    let ready = launch(true).await;
    let (status, body) = ready.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["model"]["version"].as_u64(), Some(u64::from(ready.production)));
    assert_eq!(ready.get("/ready").await.0, StatusCode::OK);

    let cold = launch(false).await;
    assert_eq!(cold.get("/healthz").await.0, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(cold.get("/ready").await.0, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(cold.get("/live").await.0, StatusCode::OK);
    let (status, _) = cold.send(reqwest::Method::POST, "/predict", json!({ "features": [5.1, 3.5, 1.4, 0.2] })).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn canary_admin_route_validates_and_swaps() {
    let h = launch(true).await;
    let (status, _) = h.send(reqwest::Method::PUT, "/admin/canary", json!({ "canary_percentage": 120, "canary_version": h.production })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let canary = if h.production == 1 { 2 } else { 1 };
    let (status, body) = h.send(reqwest::Method::PUT, "/admin/canary", json!({ "stable_version": canary })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("Production"));

    h.registry.promote(MODEL, canary, Stage::Staging).unwrap();
    let (status, body) = h.send(reqwest::Method::PUT, "/admin/canary", json!({ "canary_percentage": 100, "canary_version": canary })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["canary_version"].as_u64(), Some(u64::from(canary)));

    let (_, resp) = h.send(reqwest::Method::POST, "/predict", json!({ "features": [5.1, 3.5, 1.4, 0.2] })).await;
    assert_eq!(resp["arm"], "canary");
    assert_eq!(resp["version"].as_u64(), Some(u64::from(canary)));

    let (_, info) = h.get("/info").await;
    let info: Value = serde_json::from_str(&info).unwrap();
    assert_eq!(info["deployment"]["canary_percentage"], 100);
    let (_, metrics) = h.get("/metrics-prometheus").await;
    assert!(metrics.contains("iris_canary_percentage 100"));
}

#[tokio::test]
async fn metrics_and_registry_listing_are_exposed() {
    let h = launch(true).await;
    h.send(reqwest::Method::POST, "/predict", json!({ "features": [5.1, 3.5, 1.4, 0.2] })).await;
    let (status, text) = h.get("/metrics-prometheus").await;
    assert_eq!(status, StatusCode::OK);
    for name in ["iris_predictions_total", "iris_prediction_latency_ms", "iris_api_requests_total", "iris_model_loaded"] {
        assert!(text.contains(name), "missing {name}");
    }

    let (status, text) = h.get(&format!("/models/{MODEL}/versions")).await;
    assert_eq!(status, StatusCode::OK);
    let listing: Value = serde_json::from_str(&text).unwrap();
    let versions = listing["versions"].as_array().unwrap();
    assert_eq!(versions.len(), 3);
    let production: Vec<&Value> = versions.iter().filter(|v| v["stage"] == "Production").collect();
    assert_eq!(production.len(), 1);
}
