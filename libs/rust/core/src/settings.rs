//! Layered settings: struct defaults, then an optional file, then `MLOPS__*` env vars.

use anyhow::Result;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Env var naming an optional settings file (yaml, toml or json by extension).
pub const CONFIG_FILE_ENV: &str = "MLOPS_CONFIG_FILE";
/// Prefix for env overrides, e.g. `MLOPS__CANARY_PERCENTAGE=10`.
pub const ENV_PREFIX: &str = "MLOPS";

#[derive(Debug, Clone)]
pub struct LoadedSettings<T> {
    pub settings: T,
    /// File the settings were read from, if any. Watched for hot reload.
    pub file: Option<PathBuf>,
}

pub fn load_settings<T>(service: &str) -> Result<LoadedSettings<T>>
where
    T: Serialize + DeserializeOwned + Default,
{
    let file = std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
    let settings = build::<T>(file.as_deref())?;
    info!(service, file = ?file, "settings loaded");
    Ok(LoadedSettings { settings, file })
}

/// Re-reads settings from the same sources, used after the watched file changed.
pub fn reload_settings<T>(file: Option<&Path>) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    build(file)
}

fn build<T>(file: Option<&Path>) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    let mut builder = config::Config::builder().add_source(config::Config::try_from(&T::default())?);
    if let Some(path) = file {
        builder = builder.add_source(config::File::from(path).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));
    Ok(builder.build()?.try_deserialize()?)
}

/// Watches `path` and yields one unit per burst of modifications.
/// The returned watcher must be kept alive for events to keep flowing.
pub fn watch_file(path: &Path) -> Result<(RecommendedWatcher, mpsc::Receiver<()>)> {
    let (tx, rx) = mpsc::channel(1);
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(ev) = res {
                if matches!(ev.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    // full channel means a reload is already pending
                    let _ = tx.try_send(());
                }
            }
        },
        notify::Config::default(),
    )?;
    watcher.watch(path, RecursiveMode::NonRecursive)?;
    debug!(path = %path.display(), "watching settings file");
    Ok((watcher, rx))
}
