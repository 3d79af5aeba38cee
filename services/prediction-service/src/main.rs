use anyhow::{Context, Result};
use mlops_core::{init_tracing, load_settings, Readiness};
use model_registry::ModelRegistry;
use prediction_service::{bootstrap, http_router, spawn_config_reload, AppState, LogStore, ServingConfig, SledLogStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("prediction-service")?;
    let loaded = load_settings::<ServingConfig>("prediction-service")?;
    let cfg = loaded.settings.clone();
    info!(?cfg, "config loaded");

    let readiness = Readiness::new();
    let registry = Arc::new(
        ModelRegistry::open(&cfg.registry_path)
            .with_context(|| format!("opening registry at {}", cfg.registry_path.display()))?,
    );
    let store: Arc<dyn LogStore> = Arc::new(
        SledLogStore::open(&cfg.log_store_path)
            .with_context(|| format!("opening prediction log at {}", cfg.log_store_path.display()))?,
    );
    let service = bootstrap(&cfg, registry, store).await.context("startup model load")?;

    let _reload = match &loaded.file {
        Some(file) => Some(spawn_config_reload(service.clone(), file.clone())?),
        None => None,
    };

    let app = http_router(AppState { service, environment: cfg.environment.as_str().into() }, readiness.clone());
    let listener = TcpListener::bind(("0.0.0.0", cfg.http_port)).await?;
    readiness.mark_ready();
    info!(port = cfg.http_port, environment = %cfg.environment, "prediction service ready");

    axum::serve(listener, app).with_graceful_shutdown(shutdown(readiness)).await?;
    Ok(())
}

async fn shutdown(readiness: Arc<Readiness>) {
    let _ = tokio::signal::ctrl_c().await;
    readiness.clear_ready();
    info!("shutdown");
}
