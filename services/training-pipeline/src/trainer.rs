//! Fits one candidate variant. Pure function of its inputs, so independent
//! variants can be trained on separate threads without coordination.

use model_registry::{Artifact, GaussianNbModel, KNearestModel, LogisticModel};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Standardised inputs keep well-posed fits far below this; crossing it means
/// the step size overshoots instead of settling.
const MAX_WEIGHT: f64 = 1e4;

/// Algorithm plus hyperparameters of one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum VariantSpec {
    LogisticRegression { learning_rate: f64, epochs: usize, l2: f64 },
    GaussianNb { var_smoothing: f64 },
    KNearest { k: usize },
}

impl VariantSpec {
    pub fn name(&self) -> &'static str {
        match self {
            VariantSpec::LogisticRegression { .. } => "logistic_regression",
            VariantSpec::GaussianNb { .. } => "gaussian_nb",
            VariantSpec::KNearest { .. } => "k_nearest",
        }
    }

    /// The three candidates trained by a default run, in declaration order.
    pub fn defaults() -> Vec<VariantSpec> {
        vec![
            VariantSpec::LogisticRegression { learning_rate: 0.5, epochs: 500, l2: 1e-3 },
            VariantSpec::GaussianNb { var_smoothing: 1e-9 },
            VariantSpec::KNearest { k: 5 },
        ]
    }
}

pub fn train(spec: &VariantSpec, features: &[Vec<f64>], labels: &[i64]) -> Result<Artifact> {
    let failed = |reason: String| PipelineError::TrainingFailed { variant: spec.name().to_string(), reason };
    let shape = check_inputs(features, labels).map_err(failed)?;
    let artifact = match spec {
        VariantSpec::LogisticRegression { learning_rate, epochs, l2 } => {
            Artifact::LogisticRegression(fit_logistic(&shape, features, *learning_rate, *epochs, *l2).map_err(failed)?)
        }
        VariantSpec::GaussianNb { var_smoothing } => Artifact::GaussianNb(fit_naive_bayes(&shape, features, *var_smoothing)),
        VariantSpec::KNearest { k } => {
            if *k == 0 || *k > features.len() {
                return Err(failed(format!("k={k} needs 1..={} training rows", features.len())));
            }
            Artifact::KNearest(KNearestModel { classes: shape.classes.clone(), k: *k, points: features.to_vec(), targets: shape.targets.clone() })
        }
    };
    artifact.validate().map_err(failed)?;
    debug!(variant = spec.name(), rows = features.len(), "variant fitted");
    Ok(artifact)
}

struct Shape {
    dims: usize,
    classes: Vec<i64>,
    /// class index per row
    targets: Vec<usize>,
}

fn check_inputs(features: &[Vec<f64>], labels: &[i64]) -> std::result::Result<Shape, String> {
    if features.is_empty() { return Err("no training rows".into()); }
    if features.len() != labels.len() {
        return Err(format!("{} feature rows but {} labels", features.len(), labels.len()));
    }
    let dims = features[0].len();
    if dims == 0 { return Err("zero-width feature vectors".into()); }
    if let Some(i) = features.iter().position(|r| r.len() != dims) {
        return Err(format!("row {i} has {} features, expected {dims}", features[i].len()));
    }
    if features.iter().flatten().any(|v| !v.is_finite()) { return Err("non-finite feature value".into()); }
    let mut classes = labels.to_vec();
    classes.sort_unstable();
    classes.dedup();
    if classes.len() < 2 { return Err("need at least two classes".into()); }
    let targets = labels.iter().map(|l| classes.binary_search(l).unwrap_or_default()).collect();
    Ok(Shape { dims, classes, targets })
}

fn column_stats(features: &[Vec<f64>], dims: usize) -> (Vec<f64>, Vec<f64>) {
    let n = features.len() as f64;
    let mut mean = vec![0.0; dims];
    for row in features { for (m, v) in mean.iter_mut().zip(row) { *m += v / n; } }
    let mut var = vec![0.0; dims];
    for row in features { for ((s, v), m) in var.iter_mut().zip(row).zip(&mean) { *s += (v - m).powi(2) / n; } }
    (mean, var)
}

/// Full-batch gradient descent on softmax cross-entropy with L2 penalty.
fn fit_logistic(shape: &Shape, features: &[Vec<f64>], lr: f64, epochs: usize, l2: f64) -> std::result::Result<LogisticModel, String> {
    if !(lr > 0.0) || epochs == 0 { return Err(format!("learning_rate={lr} epochs={epochs} cannot converge")); }
    let (feature_mean, var) = column_stats(features, shape.dims);
    let feature_std: Vec<f64> = var.iter().map(|v| if *v > 1e-12 { v.sqrt() } else { 1.0 }).collect();
    let k = shape.classes.len();
    let mut model = LogisticModel {
        classes: shape.classes.clone(),
        weights: vec![vec![0.0; shape.dims]; k],
        bias: vec![0.0; k],
        feature_mean,
        feature_std,
    };
    let z: Vec<Vec<f64>> = features.iter().map(|r| model.standardize(r)).collect();
    let n = z.len() as f64;
    let mut loss = f64::NAN;
    for _ in 0..epochs {
        let mut grad_w = vec![vec![0.0; shape.dims]; k];
        let mut grad_b = vec![0.0; k];
        loss = 0.0;
        for (row, &t) in z.iter().zip(&shape.targets) {
            let mut p = model.logits(row);
            model_registry::model::softmax(&mut p);
            loss -= p[t].max(1e-15).ln() / n;
            for c in 0..k {
                let err = p[c] - if c == t { 1.0 } else { 0.0 };
                grad_b[c] += err / n;
                for (g, x) in grad_w[c].iter_mut().zip(row) { *g += err * x / n; }
            }
        }
        for c in 0..k {
            model.bias[c] -= lr * grad_b[c];
            for (w, g) in model.weights[c].iter_mut().zip(&grad_w[c]) { *w -= lr * (g + l2 * *w); }
        }
        if !loss.is_finite() { return Err(format!("diverged (loss {loss})")); }
        let peak = model
            .weights
            .iter()
            .flatten()
            .chain(&model.bias)
            .fold(0.0_f64, |m, w| if w.is_finite() { m.max(w.abs()) } else { f64::INFINITY });
        if peak > MAX_WEIGHT {
            return Err(format!("did not converge: weight magnitude {peak:e} exceeds {MAX_WEIGHT:e} (learning_rate {lr})"));
        }
    }
    debug!(final_loss = loss, epochs, "logistic regression converged");
    Ok(model)
}

fn fit_naive_bayes(shape: &Shape, features: &[Vec<f64>], var_smoothing: f64) -> GaussianNbModel {
    let (_, all_var) = column_stats(features, shape.dims);
    let epsilon = var_smoothing * all_var.iter().cloned().fold(0.0, f64::max);
    let k = shape.classes.len();
    let mut priors = Vec::with_capacity(k);
    let mut means = Vec::with_capacity(k);
    let mut variances = Vec::with_capacity(k);
    for c in 0..k {
        let rows: Vec<Vec<f64>> = features.iter().zip(&shape.targets).filter(|(_, t)| **t == c).map(|(r, _)| r.clone()).collect();
        let (m, v) = column_stats(&rows, shape.dims);
        priors.push(rows.len() as f64 / features.len() as f64);
        means.push(m);
        // floor keeps a constant column from producing a zero variance
        variances.push(v.into_iter().map(|x| (x + epsilon).max(1e-9)).collect());
    }
    GaussianNbModel { classes: shape.classes.clone(), priors, means, variances }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs() -> (Vec<Vec<f64>>, Vec<i64>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..20 {
            let d = i as f64 * 0.05;
            x.push(vec![0.0 + d, 1.0 - d]);
            y.push(3);
            x.push(vec![4.0 + d, 5.0 - d]);
            y.push(7);
        }
        (x, y)
    }

    #[test]
    fn every_default_variant_separates_blobs() {
        let (x, y) = blobs();
        for spec in VariantSpec::defaults() {
            let predictor = train(&spec, &x, &y).unwrap().into_predictor();
            assert_eq!(predictor.classes(), &[3, 7]);
            assert_eq!(predictor.predict(&[0.2, 0.9]).label, 3, "{}", spec.name());
            assert_eq!(predictor.predict(&[4.3, 4.8]).label, 7, "{}", spec.name());
        }
    }

    #[test]
    fn length_mismatch_fails_training() {
        let (x, mut y) = blobs();
        y.pop();
        let err = train(&VariantSpec::GaussianNb { var_smoothing: 1e-9 }, &x, &y).unwrap_err();
        assert!(matches!(err, PipelineError::TrainingFailed { ref variant, .. } if variant == "gaussian_nb"));
    }

    #[test]
    fn oversized_k_fails_training() {
        let (x, y) = blobs();
        assert!(train(&VariantSpec::KNearest { k: 500 }, &x, &y).is_err());
    }

    #[test]
    fn runaway_learning_rate_is_non_convergence() {
        let (x, y) = blobs();
        for lr in [1e308, 1e300, 1e6] {
            let spec = VariantSpec::LogisticRegression { learning_rate: lr, epochs: 50, l2: 0.0 };
            match train(&spec, &x, &y) {
                Err(PipelineError::TrainingFailed { variant, reason }) => {
                    assert_eq!(variant, "logistic_regression");
                    assert!(reason.contains("converge"), "lr={lr}: {reason}");
                }
                other => panic!("lr={lr} should not converge, got {other:?}"),
            }
        }
    }

    #[test]
    fn default_logistic_weights_stay_bounded() {
        let (x, y) = blobs();
        let Artifact::LogisticRegression(m) = train(&VariantSpec::defaults()[0], &x, &y).unwrap() else {
            panic!("expected a logistic artifact");
        };
        assert!(m.weights.iter().flatten().all(|w| w.abs() < MAX_WEIGHT));
    }

    #[test]
    fn single_class_is_rejected() {
        let x = vec![vec![1.0], vec![2.0]];
        assert!(train(&VariantSpec::KNearest { k: 1 }, &x, &[1, 1]).is_err());
    }
}
