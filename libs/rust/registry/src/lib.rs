//! Model registry: versioned artifacts with stage metadata, the predictor
//! capability shared by every algorithm, and the loader used by serving.

pub mod error;
pub mod loader;
pub mod model;
pub mod registry;
pub mod version;

pub use error::{LoadError, RegistryError};
pub use loader::{LoadedModel, ModelLoader};
pub use model::{Artifact, GaussianNbModel, KNearestModel, LogisticModel, Prediction, Predictor};
pub use registry::ModelRegistry;
pub use version::{ArtifactRef, ModelVersion, Stage};
