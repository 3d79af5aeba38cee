//! Fitted classifier artifacts and the narrow capability every one of them exposes.
//!
//! Training, evaluation and serving only ever talk to [`Predictor`]; the concrete
//! algorithm lives behind the serde-tagged [`Artifact`] enum that the registry stores.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Output of a single inference: the winning class and its probability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: i64,
    pub probability: f64,
}

/// Read-only inference capability shared across request workers.
pub trait Predictor: Send + Sync + fmt::Debug {
    /// Expected length of a feature vector.
    fn n_features(&self) -> usize;

    /// Class labels, in the order `predict_proba` reports them.
    fn classes(&self) -> &[i64];

    /// Per-class probabilities summing to 1.
    fn predict_proba(&self, features: &[f64]) -> Vec<f64>;

    /// Highest-probability class. Ties resolve to the earlier class.
    fn predict(&self, features: &[f64]) -> Prediction {
        let probs = self.predict_proba(features);
        let mut best = 0usize;
        for (i, p) in probs.iter().enumerate() {
            if *p > probs[best] { best = i; }
        }
        Prediction {
            label: self.classes().get(best).copied().unwrap_or_default(),
            probability: probs.get(best).copied().unwrap_or(0.0).clamp(0.0, 1.0),
        }
    }
}

/// Serialised form of a fitted model as persisted in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum Artifact {
    LogisticRegression(LogisticModel),
    GaussianNb(GaussianNbModel),
    KNearest(KNearestModel),
}

impl Artifact {
    pub fn algorithm(&self) -> &'static str {
        match self {
            Artifact::LogisticRegression(_) => "logistic_regression",
            Artifact::GaussianNb(_) => "gaussian_nb",
            Artifact::KNearest(_) => "k_nearest",
        }
    }

    /// Checks internal shape consistency; a failing artifact is treated as corrupt.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Artifact::LogisticRegression(m) => m.validate(),
            Artifact::GaussianNb(m) => m.validate(),
            Artifact::KNearest(m) => m.validate(),
        }
    }

    pub fn into_predictor(self) -> Arc<dyn Predictor> {
        match self {
            Artifact::LogisticRegression(m) => Arc::new(m),
            Artifact::GaussianNb(m) => Arc::new(m),
            Artifact::KNearest(m) => Arc::new(m),
        }
    }
}

/// Multinomial logistic regression over standardised features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub classes: Vec<i64>,
    /// `classes x features`
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
    pub feature_mean: Vec<f64>,
    pub feature_std: Vec<f64>,
}

impl LogisticModel {
    fn validate(&self) -> Result<(), String> {
        let k = self.classes.len();
        let d = self.feature_mean.len();
        if k == 0 || d == 0 { return Err("empty logistic model".into()); }
        if self.weights.len() != k || self.bias.len() != k { return Err("weight rows do not match classes".into()); }
        if self.weights.iter().any(|row| row.len() != d) || self.feature_std.len() != d {
            return Err("weight columns do not match features".into());
        }
        if self.feature_std.iter().any(|s| !(*s > 0.0)) { return Err("non-positive feature scale".into()); }
        Ok(())
    }

    /// Raw class scores for an already standardised vector.
    pub fn logits(&self, z: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(w, b)| b + w.iter().zip(z).map(|(wi, zi)| wi * zi).sum::<f64>())
            .collect()
    }

    pub fn standardize(&self, features: &[f64]) -> Vec<f64> {
        features
            .iter()
            .zip(self.feature_mean.iter().zip(&self.feature_std))
            .map(|(x, (m, s))| (x - m) / s)
            .collect()
    }
}

impl Predictor for LogisticModel {
    fn n_features(&self) -> usize { self.feature_mean.len() }
    fn classes(&self) -> &[i64] { &self.classes }
    fn predict_proba(&self, features: &[f64]) -> Vec<f64> {
        let mut scores = self.logits(&self.standardize(features));
        softmax(&mut scores);
        scores
    }
}

/// Gaussian naive Bayes with per-class priors, means and variances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianNbModel {
    pub classes: Vec<i64>,
    pub priors: Vec<f64>,
    pub means: Vec<Vec<f64>>,
    pub variances: Vec<Vec<f64>>,
}

impl GaussianNbModel {
    fn validate(&self) -> Result<(), String> {
        let k = self.classes.len();
        if k == 0 { return Err("empty naive bayes model".into()); }
        if self.priors.len() != k || self.means.len() != k || self.variances.len() != k {
            return Err("class tables disagree in length".into());
        }
        let d = self.means[0].len();
        if d == 0 || self.means.iter().chain(&self.variances).any(|r| r.len() != d) {
            return Err("feature tables disagree in length".into());
        }
        if self.variances.iter().flatten().any(|v| !(*v > 0.0)) { return Err("non-positive variance".into()); }
        Ok(())
    }
}

impl Predictor for GaussianNbModel {
    fn n_features(&self) -> usize { self.means.first().map(Vec::len).unwrap_or(0) }
    fn classes(&self) -> &[i64] { &self.classes }
    fn predict_proba(&self, features: &[f64]) -> Vec<f64> {
        let mut log_post: Vec<f64> = (0..self.classes.len())
            .map(|c| {
                let ll: f64 = features
                    .iter()
                    .zip(self.means[c].iter().zip(&self.variances[c]))
                    .map(|(x, (m, v))| -0.5 * ((2.0 * std::f64::consts::PI * v).ln() + (x - m).powi(2) / v))
                    .sum();
                self.priors[c].max(f64::MIN_POSITIVE).ln() + ll
            })
            .collect();
        softmax(&mut log_post);
        log_post
    }
}

/// k-nearest-neighbours keeping the full training set; probability = vote share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KNearestModel {
    pub classes: Vec<i64>,
    pub k: usize,
    pub points: Vec<Vec<f64>>,
    /// Index into `classes` for each point.
    pub targets: Vec<usize>,
}

impl KNearestModel {
    fn validate(&self) -> Result<(), String> {
        if self.classes.is_empty() || self.points.is_empty() { return Err("empty neighbour set".into()); }
        if self.k == 0 || self.k > self.points.len() { return Err(format!("k={} outside 1..={}", self.k, self.points.len())); }
        if self.targets.len() != self.points.len() { return Err("targets do not match points".into()); }
        if self.targets.iter().any(|t| *t >= self.classes.len()) { return Err("target index out of range".into()); }
        let d = self.points[0].len();
        if d == 0 || self.points.iter().any(|p| p.len() != d) { return Err("ragged points".into()); }
        Ok(())
    }
}

impl Predictor for KNearestModel {
    fn n_features(&self) -> usize { self.points.first().map(Vec::len).unwrap_or(0) }
    fn classes(&self) -> &[i64] { &self.classes }
    fn predict_proba(&self, features: &[f64]) -> Vec<f64> {
        let mut dist: Vec<(f64, usize)> = self
            .points
            .iter()
            .zip(&self.targets)
            .map(|(p, t)| (p.iter().zip(features).map(|(a, b)| (a - b).powi(2)).sum::<f64>(), *t))
            .collect();
        // stable sort keeps training order among equidistant points
        dist.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut votes = vec![0.0; self.classes.len()];
        for (_, t) in dist.iter().take(self.k) { votes[*t] += 1.0; }
        let k = self.k as f64;
        votes.iter_mut().for_each(|v| *v /= k);
        votes
    }
}

/// In-place numerically stable softmax.
pub fn softmax(v: &mut [f64]) {
    if v.is_empty() { return; }
    let max = v.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for x in v.iter_mut() { *x = (*x - max).exp(); sum += *x; }
    if sum > 0.0 { for x in v.iter_mut() { *x /= sum; } }
}
