use model_registry::RegistryError;
use thiserror::Error;

/// Failures of a batch training run. Any of them aborts the run before the registry is touched.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("dataset unavailable: {0}")]
    DataUnavailable(String),
    #[error("training {variant} failed: {reason}")]
    TrainingFailed { variant: String, reason: String },
    #[error("evaluation failed: {0}")]
    EvaluationFailed(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
