//! Shared plumbing for the iris serving stack: tracing setup, layered settings,
//! readiness flags with their HTTP probes, and prometheus text exposition.

use anyhow::Result;
use axum::{http::StatusCode, routing::get, Json, Router};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

pub mod resilience;
pub mod settings;

pub use resilience::{retry_async, RetryConfig};
pub use settings::{load_settings, reload_settings, watch_file, LoadedSettings, CONFIG_FILE_ENV, ENV_PREFIX};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Content type served by the pull-based metrics endpoint.
pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Installs the global tracing subscriber. Later calls are no-ops.
///
/// `RUST_LOG` drives filtering (default `info`); `MLOPS_JSON_LOG=1` switches to
/// flattened JSON lines for log shippers.
pub fn init_tracing(service: &str) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("MLOPS_JSON_LOG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry
                .with(tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false))
                .try_init()?;
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true))
                .try_init()?;
        }
        Ok(())
    })?;
    info!(target: "mlops", service, "tracing initialized");
    Ok(())
}

/// Process liveness / readiness flags consumed by orchestrator probes.
#[derive(Debug)]
pub struct Readiness {
    live: AtomicBool,
    ready: AtomicBool,
}

impl Default for Readiness {
    fn default() -> Self { Self { live: AtomicBool::new(true), ready: AtomicBool::new(false) } }
}

impl Readiness {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }
    pub fn mark_ready(&self) { self.ready.store(true, Ordering::SeqCst); }
    pub fn clear_ready(&self) { self.ready.store(false, Ordering::SeqCst); }
    pub fn mark_not_live(&self) { self.live.store(false, Ordering::SeqCst); }
    pub fn is_ready(&self) -> bool { self.ready.load(Ordering::SeqCst) }
    pub fn is_live(&self) -> bool { self.live.load(Ordering::SeqCst) }
}

/// `/live` and `/ready` probe routes. Both answer 503 while the flag is down.
pub fn health_routes<S>(readiness: Arc<Readiness>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let live = readiness.clone();
    Router::new()
        .route("/live", get(move || async move { probe("live", live.is_live()) }))
        .route("/ready", get(move || async move { probe("ready", readiness.is_ready()) }))
}

fn probe(key: &str, up: bool) -> (StatusCode, Json<serde_json::Value>) {
    let status = if up { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let mut body = serde_json::Map::new();
    body.insert(key.to_string(), serde_json::Value::Bool(up));
    (status, Json(serde_json::Value::Object(body)))
}

/// Renders every metric family of `registry` in the prometheus text format.
pub fn encode_metrics(registry: &Registry) -> Result<String> {
    let families = registry.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&families, &mut buf)?;
    Ok(String::from_utf8(buf)?)
}
