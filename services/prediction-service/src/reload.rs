//! Applies canary edits from the watched settings file through the same
//! reconfiguration path as `PUT /admin/canary`.

use anyhow::Result;
use mlops_core::{reload_settings, watch_file};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ServingConfig;
use crate::service::{CanaryUpdate, PredictionService};

/// Editors often save in several writes; wait for the burst to settle.
const SETTLE: Duration = Duration::from_millis(100);

impl From<&ServingConfig> for CanaryUpdate {
    fn from(cfg: &ServingConfig) -> Self {
        Self {
            stable_version: cfg.stable_version,
            canary_version: cfg.canary_version,
            canary_percentage: cfg.canary_percentage,
        }
    }
}

pub fn spawn_config_reload(service: Arc<PredictionService>, file: PathBuf) -> Result<JoinHandle<()>> {
    let (watcher, mut changes) = watch_file(&file)?;
    info!(file = %file.display(), "watching settings for canary changes");
    Ok(tokio::spawn(async move {
        let _watcher = watcher;
        while changes.recv().await.is_some() {
            tokio::time::sleep(SETTLE).await;
            let cfg = match reload_settings::<ServingConfig>(Some(&file)) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "settings reload failed; keeping current deployment");
                    continue;
                }
            };
            match service.reconfigure(CanaryUpdate::from(&cfg)).await {
                Ok(d) => info!(
                    stable = d.config.stable_version,
                    canary = ?d.config.canary_version,
                    canary_percentage = d.config.canary_percentage,
                    "canary settings reloaded"
                ),
                Err(e) => warn!(error = %e, "rejected canary settings from file"),
            }
        }
    }))
}
