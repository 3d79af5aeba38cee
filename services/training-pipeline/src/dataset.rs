//! Labelled data source and its reproducible train/test split.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{PipelineError, Result};

const IRIS_CSV: &str = include_str!("../data/iris.csv");

#[derive(Debug, Clone)]
pub enum DataSource {
    /// The 150-row Iris table compiled into the binary.
    EmbeddedIris,
    /// CSV with a header row, numeric feature columns and the integer label last.
    Csv(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub features: Vec<Vec<f64>>,
    pub labels: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub feature_names: Vec<String>,
    pub train_features: Vec<Vec<f64>>,
    pub train_labels: Vec<i64>,
    pub test_features: Vec<Vec<f64>>,
    pub test_labels: Vec<i64>,
}

impl DataSource {
    pub fn load(&self) -> Result<Dataset> {
        match self {
            DataSource::EmbeddedIris => Dataset::parse_csv(IRIS_CSV, "embedded iris"),
            DataSource::Csv(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| PipelineError::DataUnavailable(format!("{}: {e}", path.display())))?;
                Dataset::parse_csv(&text, &path.display().to_string())
            }
        }
    }

    /// Same `seed` and fraction always give the same partition.
    pub fn split(&self, seed: u64, test_fraction: f64) -> Result<Split> {
        let data = self.load()?;
        data.split(seed, test_fraction)
    }
}

impl Dataset {
    pub fn parse_csv(text: &str, source: &str) -> Result<Self> {
        let unavailable = |msg: String| PipelineError::DataUnavailable(format!("{source}: {msg}"));
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let header = lines.next().ok_or_else(|| unavailable("empty file".into()))?;
        let columns: Vec<String> = header.split(',').map(|c| c.trim().to_string()).collect();
        if columns.len() < 2 { return Err(unavailable("need at least one feature and a label column".into())); }
        let arity = columns.len() - 1;

        let mut features = Vec::new();
        let mut labels = Vec::new();
        for (n, line) in lines.enumerate() {
            let cells: Vec<&str> = line.split(',').map(str::trim).collect();
            if cells.len() != columns.len() {
                return Err(unavailable(format!("row {} has {} cells, expected {}", n + 1, cells.len(), columns.len())));
            }
            let row = cells[..arity]
                .iter()
                .map(|c| c.parse::<f64>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| unavailable(format!("row {}: {e}", n + 1)))?;
            let label = cells[arity].parse::<i64>().map_err(|e| unavailable(format!("row {} label: {e}", n + 1)))?;
            features.push(row);
            labels.push(label);
        }
        if features.is_empty() { return Err(unavailable("no rows".into())); }
        Ok(Self { feature_names: columns[..arity].to_vec(), features, labels })
    }

    pub fn len(&self) -> usize { self.labels.len() }

    pub fn is_empty(&self) -> bool { self.labels.is_empty() }

    pub fn split(&self, seed: u64, test_fraction: f64) -> Result<Split> {
        if !(0.0..1.0).contains(&test_fraction) || test_fraction == 0.0 {
            return Err(PipelineError::DataUnavailable(format!("test fraction {test_fraction} outside (0, 1)")));
        }
        let n = self.len();
        let n_test = ((n as f64) * test_fraction).ceil() as usize;
        if n_test == 0 || n_test >= n {
            return Err(PipelineError::DataUnavailable(format!("{n} rows cannot give a {test_fraction} test split")));
        }
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        let (test_idx, train_idx) = order.split_at(n_test);
        let pick = |idx: &[usize]| -> (Vec<Vec<f64>>, Vec<i64>) {
            (idx.iter().map(|&i| self.features[i].clone()).collect(), idx.iter().map(|&i| self.labels[i]).collect())
        };
        let (train_features, train_labels) = pick(train_idx);
        let (test_features, test_labels) = pick(test_idx);
        info!(seed, train = train_labels.len(), test = test_labels.len(), "dataset split");
        Ok(Split { feature_names: self.feature_names.clone(), train_features, train_labels, test_features, test_labels })
    }
}

impl Split {
    /// Writes `train.csv` and `test.csv` into `dir` for audit.
    pub fn write_csv(&self, dir: &Path) -> std::io::Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)?;
        let train = dir.join("train.csv");
        let test = dir.join("test.csv");
        std::fs::write(&train, self.render(&self.train_features, &self.train_labels))?;
        std::fs::write(&test, self.render(&self.test_features, &self.test_labels))?;
        Ok((train, test))
    }

    fn render(&self, features: &[Vec<f64>], labels: &[i64]) -> String {
        let mut out = self.feature_names.join(",");
        out.push_str(",target\n");
        for (row, label) in features.iter().zip(labels) {
            let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            let _ = writeln!(out, "{},{label}", cells.join(","));
        }
        out
    }
}
