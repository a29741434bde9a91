use crate::error::{Error, Result};
use crate::features::{FEATURE_COUNT, FEATURE_NAMES};
use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EyeState {
    Closed = 0,
    Open = 1,
}

impl EyeState {
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(EyeState::Closed),
            1 => Some(EyeState::Open),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            EyeState::Closed => "Closed",
            EyeState::Open => "Open",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "Closed" => Some(EyeState::Closed),
            "Open" => Some(EyeState::Open),
            _ => None,
        }
    }
}

impl fmt::Display for EyeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Probability mass over `[Closed, Open]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClassProbabilities {
    pub closed: f64,
    pub open: f64,
}

impl ClassProbabilities {
    pub fn from_open(open: f64) -> Self {
        Self {
            closed: 1.0 - open,
            open,
        }
    }

    /// Argmax; a tie goes to `Closed`.
    pub fn state(&self) -> EyeState {
        if self.open > self.closed {
            EyeState::Open
        } else {
            EyeState::Closed
        }
    }

    pub fn get(&self, state: EyeState) -> f64 {
        match state {
            EyeState::Closed => self.closed,
            EyeState::Open => self.open,
        }
    }

    pub fn margin(&self) -> f64 {
        (self.closed - self.open).abs()
    }
}

/// A fitted two-class model over standardized feature rows.
pub trait Classifier: Send + Sync {
    fn predict_proba_row(&self, row: ArrayView1<f64>) -> ClassProbabilities;

    /// One column per class, in `[Closed, Open]` order.
    fn predict_proba(&self, rows: ArrayView2<f64>) -> Array2<f64> {
        let mut out = Array2::zeros((rows.nrows(), 2));
        for (row, mut dst) in rows.outer_iter().zip(out.outer_iter_mut()) {
            let p = self.predict_proba_row(row);
            dst[0] = p.closed;
            dst[1] = p.open;
        }
        out
    }

    /// Per-channel importance aligned with the canonical channel order.
    fn feature_importances(&self) -> Vec<f64>;
}

#[derive(Clone, Debug, Deserialize)]
pub struct DecisionTree {
    children_left: Vec<i64>,
    children_right: Vec<i64>,
    feature: Vec<i64>,
    threshold: Vec<f64>,
    value: Vec<Vec<f64>>,
}

impl DecisionTree {
    fn validate(&self) -> Result<()> {
        let n = self.children_left.len();
        if n == 0 {
            return Err(Error::Configuration("decision tree has no nodes".into()));
        }
        if [
            self.children_right.len(),
            self.feature.len(),
            self.threshold.len(),
            self.value.len(),
        ]
        .iter()
        .any(|len| *len != n)
        {
            return Err(Error::Configuration(
                "decision tree arrays differ in length".into(),
            ));
        }
        for node in 0..n {
            let (left, right) = (self.children_left[node], self.children_right[node]);
            if left == -1 {
                let value = &self.value[node];
                if value.len() != 2 || value.iter().any(|v| !v.is_finite() || *v < 0.0) {
                    return Err(Error::Configuration(format!(
                        "leaf {node} must hold two non-negative class weights"
                    )));
                }
                if value.iter().sum::<f64>() <= 0.0 {
                    return Err(Error::Configuration(format!("leaf {node} is empty")));
                }
                continue;
            }
            // Children always follow their parent in the node array.
            let in_range = |c: i64| c > node as i64 && (c as usize) < n;
            if !in_range(left) || !in_range(right) {
                return Err(Error::Configuration(format!(
                    "node {node} has out-of-range children"
                )));
            }
            let f = self.feature[node];
            if f < 0 || f as usize >= FEATURE_COUNT {
                return Err(Error::Configuration(format!(
                    "node {node} splits on unknown feature {f}"
                )));
            }
        }
        Ok(())
    }

    fn leaf(&self, row: ArrayView1<f64>) -> &[f64] {
        let mut node = 0usize;
        while self.children_left[node] != -1 {
            let f = self.feature[node] as usize;
            node = if row[f] <= self.threshold[node] {
                self.children_left[node] as usize
            } else {
                self.children_right[node] as usize
            };
        }
        &self.value[node]
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RandomForest {
    trees: Vec<DecisionTree>,
    feature_importances: Vec<f64>,
}

impl RandomForest {
    fn validate(&self) -> Result<()> {
        if self.trees.is_empty() {
            return Err(Error::Configuration("random forest has no trees".into()));
        }
        if self.feature_importances.len() != FEATURE_COUNT {
            return Err(Error::Configuration(format!(
                "expected {FEATURE_COUNT} feature importances, got {}",
                self.feature_importances.len()
            )));
        }
        self.trees.iter().try_for_each(DecisionTree::validate)
    }
}

impl Classifier for RandomForest {
    fn predict_proba_row(&self, row: ArrayView1<f64>) -> ClassProbabilities {
        let mut acc = [0.0; 2];
        for tree in &self.trees {
            let leaf = tree.leaf(row);
            let total: f64 = leaf.iter().sum();
            acc[0] += leaf[0] / total;
            acc[1] += leaf[1] / total;
        }
        let n = self.trees.len() as f64;
        ClassProbabilities {
            closed: acc[0] / n,
            open: acc[1] / n,
        }
    }

    fn feature_importances(&self) -> Vec<f64> {
        self.feature_importances.clone()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LogisticRegression {
    coef: Vec<f64>,
    intercept: f64,
}

impl LogisticRegression {
    fn validate(&self) -> Result<()> {
        if self.coef.len() != FEATURE_COUNT {
            return Err(Error::Configuration(format!(
                "expected {FEATURE_COUNT} coefficients, got {}",
                self.coef.len()
            )));
        }
        if !self.intercept.is_finite() || self.coef.iter().any(|c| !c.is_finite()) {
            return Err(Error::Configuration(
                "logistic regression parameters must be finite".into(),
            ));
        }
        Ok(())
    }
}

impl Classifier for LogisticRegression {
    fn predict_proba_row(&self, row: ArrayView1<f64>) -> ClassProbabilities {
        let z: f64 = row.iter().zip(&self.coef).map(|(x, c)| x * c).sum::<f64>() + self.intercept;
        ClassProbabilities::from_open(1.0 / (1.0 + (-z).exp()))
    }

    fn predict_proba(&self, rows: ArrayView2<f64>) -> Array2<f64> {
        let coef = ArrayView1::from(&self.coef[..]);
        let z = rows.dot(&coef) + self.intercept;
        let open = z.mapv(|z| 1.0 / (1.0 + (-z).exp()));
        Array2::from_shape_fn((rows.nrows(), 2), |(i, class)| {
            if class == 0 {
                1.0 - open[i]
            } else {
                open[i]
            }
        })
    }

    fn feature_importances(&self) -> Vec<f64> {
        let total: f64 = self.coef.iter().map(|c| c.abs()).sum();
        if total == 0.0 {
            return vec![0.0; FEATURE_COUNT];
        }
        self.coef.iter().map(|c| c.abs() / total).collect()
    }
}

/// Serialized classifier, tagged by `kind`.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TabularModel {
    RandomForest(RandomForest),
    LogisticRegression(LogisticRegression),
}

impl TabularModel {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let model: TabularModel = serde_json::from_slice(data)
            .map_err(|e| Error::Configuration(format!("invalid classifier: {e}")))?;
        match &model {
            TabularModel::RandomForest(m) => m.validate()?,
            TabularModel::LogisticRegression(m) => m.validate()?,
        }
        Ok(model)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TabularModel::RandomForest(_) => "random_forest",
            TabularModel::LogisticRegression(_) => "logistic_regression",
        }
    }

    fn inner(&self) -> &dyn Classifier {
        match self {
            TabularModel::RandomForest(m) => m,
            TabularModel::LogisticRegression(m) => m,
        }
    }
}

impl Classifier for TabularModel {
    fn predict_proba_row(&self, row: ArrayView1<f64>) -> ClassProbabilities {
        self.inner().predict_proba_row(row)
    }

    fn predict_proba(&self, rows: ArrayView2<f64>) -> Array2<f64> {
        self.inner().predict_proba(rows)
    }

    fn feature_importances(&self) -> Vec<f64> {
        self.inner().feature_importances()
    }
}

/// Channel names paired with importances, highest first.
pub fn rank_importances(importances: &[f64]) -> Vec<(&'static str, f64)> {
    let mut ranked: Vec<_> = FEATURE_NAMES
        .iter()
        .copied()
        .zip(importances.iter().copied())
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}
