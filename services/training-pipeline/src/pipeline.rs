//! Batch run: split, train every variant, evaluate, then register and promote.
//!
//! Nothing reaches the registry until every variant has trained and evaluated.
//! The variants are then registered in a single transaction, so a failing run
//! never leaves a partial set of versions behind.

use model_registry::{ModelRegistry, Stage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, instrument, warn};

use crate::dataset::DataSource;
use crate::error::{PipelineError, Result};
use crate::evaluator::{evaluate, Evaluation};
use crate::trainer::{train, VariantSpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub model_name: String,
    pub registry_path: PathBuf,
    pub seed: u64,
    pub test_fraction: f64,
    /// CSV source; the embedded Iris table when unset.
    pub dataset_path: Option<PathBuf>,
    /// Directory receiving `train.csv`/`test.csv` of the split, if set.
    pub split_dir: Option<PathBuf>,
    pub promote_best: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_name: "iris-classifier".into(),
            registry_path: PathBuf::from("data/registry"),
            seed: 42,
            test_fraction: 0.2,
            dataset_path: None,
            split_dir: None,
            promote_best: true,
        }
    }
}

impl PipelineConfig {
    pub fn data_source(&self) -> DataSource {
        match &self.dataset_path {
            Some(p) => DataSource::Csv(p.clone()),
            None => DataSource::EmbeddedIris,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VariantReport {
    pub variant: VariantSpec,
    pub version: u32,
    pub evaluation: Evaluation,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub model_name: String,
    /// Declaration order, which is also registration order.
    pub variants: Vec<VariantReport>,
    pub best_version: u32,
    pub promoted: Option<u32>,
}

/// Index of the highest F1; the earliest variant wins a tie.
pub fn select_best(evaluations: &[Evaluation]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, e) in evaluations.iter().enumerate() {
        match best {
            Some(b) if e.f1 <= evaluations[b].f1 => {}
            _ => best = Some(i),
        }
    }
    best
}

#[instrument(skip(registry, variants), fields(model = %cfg.model_name, seed = cfg.seed))]
pub fn run_pipeline(registry: &ModelRegistry, cfg: &PipelineConfig, variants: &[VariantSpec]) -> Result<PipelineReport> {
    let split = cfg.data_source().split(cfg.seed, cfg.test_fraction)?;
    if let Some(dir) = &cfg.split_dir {
        // export is for audit only; a failure does not abort the run
        match split.write_csv(dir) {
            Ok((train, test)) => info!(train = %train.display(), test = %test.display(), "split exported"),
            Err(e) => warn!(error = %e, dir = %dir.display(), "split export failed"),
        }
    }

    // par_iter + collect keeps input order
    let fitted = variants
        .par_iter()
        .map(|spec| -> Result<_> {
            let artifact = train(spec, &split.train_features, &split.train_labels)?;
            let predictor = artifact.clone().into_predictor();
            let evaluation = evaluate(predictor.as_ref(), &split.test_features, &split.test_labels)?;
            Ok((spec.clone(), artifact, evaluation))
        })
        .collect::<Result<Vec<_>>>()?;

    let evaluations: Vec<Evaluation> = fitted.iter().map(|(_, _, e)| e.clone()).collect();
    let Some(best) = select_best(&evaluations) else {
        return Err(PipelineError::EvaluationFailed("no variants to compare".into()));
    };

    let (candidates, evaluated): (Vec<_>, Vec<_>) = fitted
        .into_iter()
        .map(|(spec, artifact, evaluation)| ((artifact, evaluation.as_metrics()), (spec, evaluation)))
        .unzip();
    let versions = registry.register_all(&cfg.model_name, &candidates)?;
    let reports: Vec<VariantReport> = evaluated
        .into_iter()
        .zip(versions)
        .map(|((spec, evaluation), version)| {
            info!(
                variant = spec.name(),
                version,
                accuracy = evaluation.accuracy,
                f1 = evaluation.f1,
                "variant registered"
            );
            VariantReport { variant: spec, version, evaluation }
        })
        .collect();

    let best_version = reports[best].version;
    let promoted = if cfg.promote_best {
        registry.promote(&cfg.model_name, best_version, Stage::Production)?;
        Some(best_version)
    } else {
        None
    };
    info!(best = reports[best].variant.name(), best_version, promoted = ?promoted, "training run complete");
    Ok(PipelineReport { model_name: cfg.model_name.clone(), variants: reports, best_version, promoted })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_with_f1(f1: f64) -> Evaluation {
        Evaluation { accuracy: f1, precision: f1, recall: f1, f1, classes: vec![], confusion: vec![] }
    }

    #[test]
    fn best_is_highest_f1_and_earliest_on_tie() {
        let evals = vec![eval_with_f1(0.8), eval_with_f1(0.95), eval_with_f1(0.95), eval_with_f1(0.9)];
        assert_eq!(select_best(&evals), Some(1));
        assert_eq!(select_best(&[]), None);
    }

    #[test]
    fn failed_training_leaves_registry_untouched() {
        let reg = ModelRegistry::temporary().unwrap();
        let variants = vec![VariantSpec::GaussianNb { var_smoothing: 1e-9 }, VariantSpec::KNearest { k: 10_000 }];
        assert!(run_pipeline(&reg, &PipelineConfig::default(), &variants).is_err());
        assert!(reg.list("iris-classifier").is_empty());
    }

    #[test]
    fn missing_dataset_aborts_before_registry() {
        let reg = ModelRegistry::temporary().unwrap();
        let cfg = PipelineConfig { dataset_path: Some(PathBuf::from("/nope/iris.csv")), ..PipelineConfig::default() };
        assert!(matches!(
            run_pipeline(&reg, &cfg, &VariantSpec::defaults()),
            Err(PipelineError::DataUnavailable(_))
        ));
        assert!(reg.model_names().is_empty());
    }

    #[test]
    fn variants_land_as_consecutive_versions_after_existing_ones() {
        let reg = ModelRegistry::temporary().unwrap();
        let spec = [VariantSpec::GaussianNb { var_smoothing: 1e-9 }, VariantSpec::KNearest { k: 3 }];
        let first = run_pipeline(&reg, &PipelineConfig::default(), &spec).unwrap();
        let second = run_pipeline(&reg, &PipelineConfig::default(), &spec).unwrap();
        let versions = |r: &PipelineReport| r.variants.iter().map(|v| v.version).collect::<Vec<_>>();
        assert_eq!((versions(&first), versions(&second)), (vec![1, 2], vec![3, 4]));
        assert_eq!(reg.get_version("iris-classifier", 4).unwrap().algorithm, reg.get_version("iris-classifier", 2).unwrap().algorithm);
    }

    #[test]
    fn promote_can_be_disabled() {
        let reg = ModelRegistry::temporary().unwrap();
        let cfg = PipelineConfig { promote_best: false, ..PipelineConfig::default() };
        let report = run_pipeline(&reg, &cfg, &[VariantSpec::GaussianNb { var_smoothing: 1e-9 }]).unwrap();
        assert_eq!(report.promoted, None);
        assert!(reg.get("iris-classifier", Stage::Production).is_err());
    }
}
