//! Resolves registry references to resident predictors.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::error::LoadError;
use crate::model::{Artifact, Predictor};
use crate::registry::ModelRegistry;
use crate::version::Stage;

/// A predictor together with the registry identity it was loaded from.
#[derive(Clone)]
pub struct LoadedModel {
    pub name: String,
    pub version: u32,
    pub algorithm: String,
    pub predictor: Arc<dyn Predictor>,
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

/// Loads artifacts once per `(name, version)` and hands out the same shared predictor afterwards.
pub struct ModelLoader {
    registry: Arc<ModelRegistry>,
    cache: RwLock<HashMap<(String, u32), LoadedModel>>,
}

impl ModelLoader {
    pub fn new(registry: Arc<ModelRegistry>) -> Self { Self { registry, cache: RwLock::new(HashMap::new()) } }

    pub fn registry(&self) -> &Arc<ModelRegistry> { &self.registry }

    pub fn load(&self, name: &str, version: u32) -> Result<LoadedModel, LoadError> {
        let key = (name.to_string(), version);
        if let Some(hit) = self.cache.read().get(&key) { return Ok(hit.clone()); }

        let failed = |reason: String| LoadError::ModelLoadFailed { name: name.to_string(), version, reason };
        let record = self.registry.get_version(name, version).map_err(|e| failed(e.to_string()))?;
        let bytes = self
            .registry
            .artifact_bytes(&record.artifact_ref)
            .map_err(|e| failed(e.to_string()))?
            .ok_or_else(|| failed(format!("artifact {} missing", record.artifact_ref.0)))?;
        let artifact: Artifact = serde_json::from_slice(&bytes).map_err(|e| failed(format!("corrupt artifact: {e}")))?;
        artifact.validate().map_err(|e| failed(format!("corrupt artifact: {e}")))?;
        let loaded = LoadedModel {
            name: name.to_string(),
            version,
            algorithm: artifact.algorithm().to_string(),
            predictor: artifact.into_predictor(),
        };

        // a concurrent loader may have won; keep whichever landed first
        let mut cache = self.cache.write();
        let entry = cache.entry(key).or_insert(loaded).clone();
        info!(model = name, version, algorithm = %entry.algorithm, features = entry.predictor.n_features(), "model loaded");
        Ok(entry)
    }

    /// Loads whichever version currently occupies `stage`.
    pub fn load_stage(&self, name: &str, stage: Stage) -> Result<LoadedModel, LoadError> {
        let record = self.registry.get(name, stage)?;
        self.load(name, record.version)
    }
}
