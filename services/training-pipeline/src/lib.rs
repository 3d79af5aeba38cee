//! Offline training path: dataset split, candidate fitting, evaluation,
//! registration of every candidate and promotion of the best one.

pub mod dataset;
pub mod error;
pub mod evaluator;
pub mod pipeline;
pub mod trainer;

pub use dataset::{DataSource, Dataset, Split};
pub use error::PipelineError;
pub use evaluator::{evaluate, Evaluation};
pub use pipeline::{run_pipeline, select_best, PipelineConfig, PipelineReport, VariantReport};
pub use trainer::{train, VariantSpec};
