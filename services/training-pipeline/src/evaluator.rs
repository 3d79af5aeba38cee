use model_registry::Predictor;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::{PipelineError, Result};

/// Test-set scores for one candidate. Precision, recall and F1 are
/// support-weighted over the classes present in the test labels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Sorted union of true and predicted labels; row/column order of `confusion`.
    pub classes: Vec<i64>,
    /// `confusion[true][predicted]`
    pub confusion: Vec<Vec<u64>>,
}

impl Evaluation {
    /// The scalar metrics stored alongside a registered version.
    pub fn as_metrics(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("accuracy".to_string(), self.accuracy),
            ("precision".to_string(), self.precision),
            ("recall".to_string(), self.recall),
            ("f1".to_string(), self.f1),
        ])
    }
}

pub fn evaluate(predictor: &dyn Predictor, features: &[Vec<f64>], labels: &[i64]) -> Result<Evaluation> {
    if features.is_empty() { return Err(PipelineError::EvaluationFailed("empty test set".into())); }
    if features.len() != labels.len() {
        return Err(PipelineError::EvaluationFailed(format!("{} feature rows but {} labels", features.len(), labels.len())));
    }
    let dims = predictor.n_features();
    if let Some(i) = features.iter().position(|r| r.len() != dims) {
        return Err(PipelineError::EvaluationFailed(format!("row {i} has {} features, model expects {dims}", features[i].len())));
    }

    let predicted: Vec<i64> = features.iter().map(|r| predictor.predict(r).label).collect();
    let mut classes: Vec<i64> = labels.iter().chain(&predicted).copied().collect();
    classes.sort_unstable();
    classes.dedup();
    let idx = |l: &i64| classes.binary_search(l).unwrap_or_default();

    let mut confusion = vec![vec![0u64; classes.len()]; classes.len()];
    for (t, p) in labels.iter().zip(&predicted) { confusion[idx(t)][idx(p)] += 1; }

    let total = labels.len() as f64;
    let correct: u64 = (0..classes.len()).map(|c| confusion[c][c]).sum();
    let (mut precision, mut recall, mut f1) = (0.0, 0.0, 0.0);
    for c in 0..classes.len() {
        let support: u64 = confusion[c].iter().sum();
        if support == 0 { continue; }
        let tp = confusion[c][c] as f64;
        let predicted_c: u64 = confusion.iter().map(|row| row[c]).sum();
        let p = ratio(tp, predicted_c as f64);
        let r = ratio(tp, support as f64);
        let weight = support as f64 / total;
        precision += weight * p;
        recall += weight * r;
        f1 += weight * ratio(2.0 * p * r, p + r);
    }
    Ok(Evaluation { accuracy: correct as f64 / total, precision, recall, f1, classes, confusion })
}

/// Zero when the denominator is zero.
fn ratio(num: f64, den: f64) -> f64 { if den > 0.0 { num / den } else { 0.0 } }

#[cfg(test)]
mod tests {
    use super::*;
    use model_registry::KNearestModel;

    /// 1-NN over three points on a line; 0.0 -> 0, 1.0 -> 1, 2.0 -> 2.
    fn line() -> KNearestModel {
        KNearestModel { classes: vec![0, 1, 2], k: 1, points: vec![vec![0.0], vec![1.0], vec![2.0]], targets: vec![0, 1, 2] }
    }

    #[test]
    fn perfect_predictions_score_one() {
        let e = evaluate(&line(), &[vec![0.0], vec![1.1], vec![1.9]], &[0, 1, 2]).unwrap();
        assert_eq!((e.accuracy, e.precision, e.recall, e.f1), (1.0, 1.0, 1.0, 1.0));
        assert_eq!(e.confusion, vec![vec![1, 0, 0], vec![0, 1, 0], vec![0, 0, 1]]);
    }

    #[test]
    fn weighted_scores_match_hand_computation() {
        // true 0,0,1,1 predicted 0,1,1,1
        let e = evaluate(&line(), &[vec![0.0], vec![0.9], vec![1.0], vec![1.2]], &[0, 0, 1, 1]).unwrap();
        assert!((e.accuracy - 0.75).abs() < 1e-12);
        // class 0: p=1 r=.5 f1=2/3 ; class 1: p=2/3 r=1 f1=.8
        assert!((e.precision - (0.5 * 1.0 + 0.5 * 2.0 / 3.0)).abs() < 1e-12);
        assert!((e.recall - 0.75).abs() < 1e-12);
        assert!((e.f1 - (0.5 * 2.0 / 3.0 + 0.5 * 0.8)).abs() < 1e-12);
    }

    #[test]
    fn never_predicted_class_contributes_zero() {
        // everything lands on class 0
        let e = evaluate(&line(), &[vec![0.0], vec![0.1]], &[0, 1]).unwrap();
        assert_eq!(e.classes, vec![0, 1]);
        assert!((e.recall - 0.5).abs() < 1e-12);
        assert!(e.f1.is_finite());
    }

    #[test]
    fn shape_mismatch_is_evaluation_failure() {
        assert!(matches!(evaluate(&line(), &[vec![0.0]], &[0, 1]), Err(PipelineError::EvaluationFailed(_))));
        assert!(matches!(evaluate(&line(), &[vec![0.0, 1.0]], &[0]), Err(PipelineError::EvaluationFailed(_))));
    }

    #[test]
    fn metrics_map_has_the_four_scores() {
        let e = evaluate(&line(), &[vec![0.0]], &[0]).unwrap();
        let m = e.as_metrics();
        assert_eq!(m.keys().map(String::as_str).collect::<Vec<_>>(), vec!["accuracy", "f1", "precision", "recall"]);
    }
}
