use thiserror::Error;

use crate::version::Stage;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no version of {name} in stage {stage}")]
    NotFound { name: String, stage: Stage },
    #[error("{name} has no version {version}")]
    VersionNotFound { name: String, version: u32 },
    #[error("cannot move a version to stage {0}")]
    InvalidStage(Stage),
    #[error("registry storage: {0}")]
    Storage(#[from] sled::Error),
    #[error("registry record encoding: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model {name} v{version} failed to load: {reason}")]
    ModelLoadFailed { name: String, version: u32, reason: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
