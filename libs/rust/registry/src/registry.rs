//! Versioned model store with stage metadata.
//!
//! Records and artifact blobs live in sled. An in-memory index mirrors the
//! records so readers never touch disk; each model name's version list is an
//! immutable `Arc<Vec<_>>` swapped whole, so a reader sees either the state
//! before a promotion or after it, never the archive step on its own.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::model::Artifact;
use crate::version::{ArtifactRef, ModelVersion, Stage};

type Result<T> = std::result::Result<T, RegistryError>;

pub struct ModelRegistry {
    db: sled::Db,
    versions: sled::Tree,
    artifacts: sled::Tree,
    index: RwLock<HashMap<String, Arc<Vec<ModelVersion>>>>,
    /// Serialises writers per model name.
    name_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ModelRegistry {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Self::from_db(db)
    }

    /// Throwaway registry removed when dropped.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let versions = db.open_tree("versions")?;
        let artifacts = db.open_tree("artifacts")?;
        let mut index: HashMap<String, Vec<ModelVersion>> = HashMap::new();
        for kv in versions.iter() {
            let (_, v) = kv?;
            let mv: ModelVersion = serde_json::from_slice(&v)?;
            index.entry(mv.name.clone()).or_default().push(mv);
        }
        // keys sort name then big-endian version, but be explicit
        for list in index.values_mut() { list.sort_by_key(|m| m.version); }
        info!(models = index.len(), "model registry opened");
        Ok(Self {
            db,
            versions,
            artifacts,
            index: RwLock::new(index.into_iter().map(|(k, v)| (k, Arc::new(v))).collect()),
            name_locks: Mutex::new(HashMap::new()),
        })
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.name_locks.lock().entry(name.to_string()).or_default().clone()
    }

    fn snapshot(&self, name: &str) -> Arc<Vec<ModelVersion>> {
        self.index.read().get(name).cloned().unwrap_or_default()
    }

    /// Stores `artifact` as a new version of `name` in stage `None`.
    /// Always allocates `max + 1`, also for byte-identical artifacts.
    pub fn register(&self, name: &str, artifact: &Artifact, metrics: BTreeMap<String, f64>) -> Result<u32> {
        let lock = self.name_lock(name);
        let _guard = lock.lock();
        let current = self.snapshot(name);
        let version = current.last().map(|m| m.version).unwrap_or(0) + 1;
        let artifact_ref = ArtifactRef::for_version(name, version);
        let record = ModelVersion {
            name: name.to_string(),
            version,
            stage: Stage::None,
            artifact_ref: artifact_ref.clone(),
            algorithm: artifact.algorithm().to_string(),
            metrics,
            created_at: Utc::now(),
        };
        // blob first: a crash in between leaves an unreachable blob, never a dangling record
        self.artifacts.insert(artifact_ref.0.as_bytes(), serde_json::to_vec(artifact)?)?;
        self.versions.insert(record_key(name, version), serde_json::to_vec(&record)?)?;
        self.db.flush()?;

        let mut next = (*current).clone();
        next.push(record);
        self.index.write().insert(name.to_string(), Arc::new(next));
        info!(model = name, version, algorithm = artifact.algorithm(), "registered model version");
        Ok(version)
    }

    /// Stores `candidates` as consecutive new versions of `name` in one sled
    /// transaction. Either every version becomes visible or none does.
    pub fn register_all(&self, name: &str, candidates: &[(Artifact, BTreeMap<String, f64>)]) -> Result<Vec<u32>> {
        if candidates.is_empty() { return Ok(Vec::new()); }
        let lock = self.name_lock(name);
        let _guard = lock.lock();
        let current = self.snapshot(name);
        let first = current.last().map(|m| m.version).unwrap_or(0) + 1;
        let mut rows = Vec::with_capacity(candidates.len());
        for (version, (artifact, metrics)) in (first..).zip(candidates) {
            let record = ModelVersion {
                name: name.to_string(),
                version,
                stage: Stage::None,
                artifact_ref: ArtifactRef::for_version(name, version),
                algorithm: artifact.algorithm().to_string(),
                metrics: metrics.clone(),
                created_at: Utc::now(),
            };
            let blob = serde_json::to_vec(artifact)?;
            let encoded = serde_json::to_vec(&record)?;
            rows.push((record, blob, encoded));
        }

        (&self.artifacts, &self.versions)
            .transaction(|(artifacts, versions)| {
                for (record, blob, encoded) in &rows {
                    artifacts.insert(record.artifact_ref.0.as_bytes(), blob.as_slice())?;
                    versions.insert(record_key(name, record.version), encoded.as_slice())?;
                }
                Ok::<_, ConflictableTransactionError<Infallible>>(())
            })
            .map_err(|e| match e {
                TransactionError::Storage(e) => RegistryError::from(e),
                TransactionError::Abort(never) => match never {},
            })?;
        self.db.flush()?;

        let mut next = (*current).clone();
        let registered: Vec<u32> = rows.iter().map(|(r, _, _)| r.version).collect();
        next.extend(rows.into_iter().map(|(r, _, _)| r));
        self.index.write().insert(name.to_string(), Arc::new(next));
        info!(model = name, versions = ?registered, "registered model versions");
        Ok(registered)
    }

    /// Moves `version` into `target`. Promoting to Production archives the previous
    /// Production version in the same atomic step.
    pub fn promote(&self, name: &str, version: u32, target: Stage) -> Result<ModelVersion> {
        if target == Stage::None { return Err(RegistryError::InvalidStage(target)); }
        let lock = self.name_lock(name);
        let _guard = lock.lock();
        let current = self.snapshot(name);
        let pos = current
            .iter()
            .position(|m| m.version == version)
            .ok_or_else(|| RegistryError::VersionNotFound { name: name.to_string(), version })?;
        if current[pos].stage == target { return Ok(current[pos].clone()); }

        let mut next = (*current).clone();
        let mut batch = sled::Batch::default();
        let mut archived = None;
        if target == Stage::Production {
            for m in next.iter_mut().filter(|m| m.stage == Stage::Production && m.version != version) {
                m.stage = Stage::Archived;
                batch.insert(record_key(name, m.version), serde_json::to_vec(m)?);
                archived = Some(m.version);
            }
        }
        next[pos].stage = target;
        batch.insert(record_key(name, version), serde_json::to_vec(&next[pos])?);
        self.versions.apply_batch(batch)?;
        self.db.flush()?;

        let promoted = next[pos].clone();
        self.index.write().insert(name.to_string(), Arc::new(next));
        info!(model = name, version, stage = %target, archived = ?archived, "stage transition");
        Ok(promoted)
    }

    /// The version of `name` currently in `stage`. Production is unique by
    /// construction; for other stages the newest matching version wins.
    pub fn get(&self, name: &str, stage: Stage) -> Result<ModelVersion> {
        self.snapshot(name)
            .iter()
            .rev()
            .find(|m| m.stage == stage)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound { name: name.to_string(), stage })
    }

    pub fn get_version(&self, name: &str, version: u32) -> Result<ModelVersion> {
        self.snapshot(name)
            .iter()
            .find(|m| m.version == version)
            .cloned()
            .ok_or_else(|| RegistryError::VersionNotFound { name: name.to_string(), version })
    }

    pub fn latest(&self, name: &str) -> Option<ModelVersion> { self.snapshot(name).last().cloned() }

    /// All versions of `name`, ascending.
    pub fn list(&self, name: &str) -> Vec<ModelVersion> { self.snapshot(name).to_vec() }

    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.index.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Raw artifact bytes; decoding is the loader's business.
    pub fn artifact_bytes(&self, artifact_ref: &ArtifactRef) -> Result<Option<Vec<u8>>> {
        let bytes = self.artifacts.get(artifact_ref.0.as_bytes())?;
        debug!(artifact = %artifact_ref.0, found = bytes.is_some(), "artifact lookup");
        Ok(bytes.map(|b| b.to_vec()))
    }

    #[cfg(test)]
    pub(crate) fn overwrite_artifact_bytes(&self, artifact_ref: &ArtifactRef, bytes: &[u8]) -> Result<()> {
        self.artifacts.insert(artifact_ref.0.as_bytes(), bytes)?;
        Ok(())
    }
}

fn record_key(name: &str, version: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + 5);
    key.extend_from_slice(name.as_bytes());
    key.push(0);
    key.extend_from_slice(&version.to_be_bytes());
    key
}
